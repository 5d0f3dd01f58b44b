//! Two-tier weather cache.
//!
//! The memory layer is the authoritative view while the process runs and is
//! rebuilt from the durable store on `initialize`. Every mutation goes
//! through one async gate and writes through to the store before the memory
//! layer changes, so readers never see a half-applied update.
//!
//! Each mutation runs as its own task: once started it finishes (or fails)
//! as a unit even if the caller stops waiting for it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use stormwatch_core::DatabaseError;
use tokio::sync::Mutex;

use crate::error::{WeatherError, WeatherResult};
use crate::store::{PersistentStore, StoreResult};
use crate::types::{CacheEntry, CurrentObservation, ForecastSeries, LocationKey, OrderIndex};

#[derive(Debug)]
struct Tracked {
    order: OrderIndex,
    entry: CacheEntry,
}

#[derive(Debug, Default)]
struct MemoryLayer {
    initialized: bool,
    entries: HashMap<LocationKey, Tracked>,
}

impl MemoryLayer {
    fn sorted(&self) -> Vec<&Tracked> {
        let mut tracked: Vec<&Tracked> = self.entries.values().collect();
        tracked.sort_by_key(|t| t.order);
        tracked
    }
}

#[derive(Debug, Clone)]
enum Write {
    Current(CurrentObservation),
    Forecast(ForecastSeries),
    Both(CurrentObservation, ForecastSeries),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Untracked {
    Track,
    Skip,
}

struct Inner {
    gate: Mutex<MemoryLayer>,
    store: Arc<dyn PersistentStore>,
}

/// Keyed weather cache shared by the coordinator and the scheduler.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<Inner>,
}

impl CacheStore {
    pub fn new(store: Arc<dyn PersistentStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                gate: Mutex::new(MemoryLayer::default()),
                store,
            }),
        }
    }

    /// Load every persisted entry into memory. No-op after the first success.
    pub async fn initialize(&self) -> WeatherResult<()> {
        let inner = self.inner.clone();
        detached(async move {
            let mut memory = inner.gate.lock().await;
            if memory.initialized {
                tracing::debug!("Weather cache already initialized");
                return Ok(());
            }

            let store = inner.store.clone();
            let stored = blocking(move || store.load_all()).await?;

            memory.entries = stored
                .into_iter()
                .map(|s| {
                    let entry = CacheEntry {
                        key: s.key.clone(),
                        current: s.current,
                        forecast: s.forecast,
                    };
                    (s.key, Tracked { order: s.order, entry })
                })
                .collect();
            memory.initialized = true;

            tracing::info!("Weather cache loaded {} locations", memory.entries.len());
            Ok(())
        })
        .await
    }

    pub async fn is_initialized(&self) -> bool {
        self.inner.gate.lock().await.initialized
    }

    /// Tracked keys in display order.
    pub async fn keys(&self) -> Vec<LocationKey> {
        let memory = self.inner.gate.lock().await;
        memory.sorted().into_iter().map(|t| t.entry.key.clone()).collect()
    }

    /// All entries in display order, taken as one snapshot.
    pub async fn entries(&self) -> Vec<CacheEntry> {
        let memory = self.inner.gate.lock().await;
        memory.sorted().into_iter().map(|t| t.entry.clone()).collect()
    }

    pub async fn get(&self, key: &LocationKey) -> Option<CacheEntry> {
        let memory = self.inner.gate.lock().await;
        memory.entries.get(key).map(|t| t.entry.clone())
    }

    pub async fn contains(&self, key: &LocationKey) -> bool {
        self.inner.gate.lock().await.entries.contains_key(key)
    }

    /// Upsert the current-observation half.
    pub async fn set_current(
        &self,
        key: LocationKey,
        observation: CurrentObservation,
    ) -> WeatherResult<()> {
        self.write(key, Write::Current(observation), Untracked::Track)
            .await
            .map(drop)
    }

    /// Replace the forecast half wholesale.
    pub async fn set_forecast(&self, key: LocationKey, series: ForecastSeries) -> WeatherResult<()> {
        self.write(key, Write::Forecast(series), Untracked::Track)
            .await
            .map(drop)
    }

    /// Write both halves as one unit, tracking the key if needed.
    pub async fn put(
        &self,
        key: LocationKey,
        observation: CurrentObservation,
        series: ForecastSeries,
    ) -> WeatherResult<()> {
        self.write(key, Write::Both(observation, series), Untracked::Track)
            .await
            .map(drop)
    }

    /// Like `set_current`, but a no-op returning `false` for untracked keys.
    pub async fn refresh_current(
        &self,
        key: LocationKey,
        observation: CurrentObservation,
    ) -> WeatherResult<bool> {
        self.write(key, Write::Current(observation), Untracked::Skip)
            .await
    }

    /// Like `set_forecast`, but a no-op returning `false` for untracked keys.
    pub async fn refresh_forecast(
        &self,
        key: LocationKey,
        series: ForecastSeries,
    ) -> WeatherResult<bool> {
        self.write(key, Write::Forecast(series), Untracked::Skip)
            .await
    }

    async fn write(&self, key: LocationKey, write: Write, untracked: Untracked) -> WeatherResult<bool> {
        let inner = self.inner.clone();
        detached(async move {
            let mut memory = inner.gate.lock().await;
            if untracked == Untracked::Skip && !memory.entries.contains_key(&key) {
                tracing::debug!("Skipping write for untracked {}", key);
                return Ok(false);
            }
            let order = order_for(&inner, &memory, &key).await?;

            let store = inner.store.clone();
            let (k, w) = (key.clone(), write.clone());
            blocking(move || match &w {
                Write::Current(o) => store.save_current(&k, order, o),
                Write::Forecast(s) => store.replace_forecast(&k, order, s),
                Write::Both(o, s) => store.save_entry(&k, order, o, s),
            })
            .await?;

            let entry = &mut tracked_mut(&mut memory, key, order).entry;
            match write {
                Write::Current(o) => entry.current = Some(o),
                Write::Forecast(s) => entry.forecast = Some(s),
                Write::Both(o, s) => {
                    entry.current = Some(o);
                    entry.forecast = Some(s);
                }
            }
            Ok(true)
        })
        .await
    }

    /// Drop both halves from memory and disk. Absent keys are fine.
    pub async fn remove(&self, key: &LocationKey) -> WeatherResult<()> {
        let inner = self.inner.clone();
        let key = key.clone();
        detached(async move {
            let mut memory = inner.gate.lock().await;

            let store = inner.store.clone();
            let k = key.clone();
            blocking(move || store.delete(&k)).await?;

            if memory.entries.remove(&key).is_some() {
                tracing::info!("Removed {} from weather cache", key);
            }
            Ok(())
        })
        .await
    }
}

/// Existing index for a tracked key, else a freshly reserved one.
async fn order_for(
    inner: &Inner,
    memory: &MemoryLayer,
    key: &LocationKey,
) -> WeatherResult<OrderIndex> {
    if let Some(tracked) = memory.entries.get(key) {
        return Ok(tracked.order);
    }
    let store = inner.store.clone();
    let order = blocking(move || store.next_index()).await?;
    tracing::debug!("Assigned order {} to {}", order.0, key);
    Ok(order)
}

fn tracked_mut(memory: &mut MemoryLayer, key: LocationKey, order: OrderIndex) -> &mut Tracked {
    memory.entries.entry(key.clone()).or_insert_with(|| Tracked {
        order,
        entry: CacheEntry::empty(key),
    })
}

/// Run blocking store work off the async workers.
pub(crate) async fn blocking<T, F>(work: F) -> StoreResult<T>
where
    F: FnOnce() -> StoreResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| DatabaseError::QueryFailed(format!("storage task failed: {}", e)))?
}

/// Run a cache mutation to completion regardless of whether the caller
/// keeps polling.
async fn detached<T, F>(work: F) -> WeatherResult<T>
where
    F: Future<Output = WeatherResult<T>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(work).await.map_err(|e| {
        WeatherError::Storage(DatabaseError::QueryFailed(format!("cache task failed: {}", e)))
    })?
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    use super::*;
    use crate::store::{SqliteStore, StoredEntry};
    use crate::types::ForecastPoint;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 2, 9, minute, 0).unwrap()
    }

    fn current(temp: f64) -> CurrentObservation {
        CurrentObservation {
            temperature: temp,
            condition_icon: "02d".into(),
            observed_at: ts(0),
        }
    }

    fn forecast(points: usize) -> ForecastSeries {
        ForecastSeries {
            items: (0..points)
                .map(|i| ForecastPoint {
                    timestamp: ts(i as u32),
                    temp_max: 9.0,
                    temp_min: 1.0,
                    condition_icon: "03d".into(),
                    wind: None,
                    rain: None,
                    snow: Some(0.2),
                })
                .collect(),
            observed_at: ts(0),
        }
    }

    fn sqlite() -> Arc<dyn PersistentStore> {
        Arc::new(SqliteStore::in_memory().unwrap())
    }

    /// Store wrapper whose writes can be switched to fail.
    struct FlakyStore {
        inner: SqliteStore,
        fail_writes: AtomicBool,
    }

    impl FlakyStore {
        fn check(&self) -> StoreResult<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(DatabaseError::QueryFailed("disk full".into()));
            }
            Ok(())
        }
    }

    impl PersistentStore for FlakyStore {
        fn all_keys(&self) -> StoreResult<Vec<(LocationKey, OrderIndex)>> {
            self.inner.all_keys()
        }
        fn load_current(&self, key: &LocationKey) -> StoreResult<Option<CurrentObservation>> {
            self.inner.load_current(key)
        }
        fn load_forecast(&self, key: &LocationKey) -> StoreResult<Option<ForecastSeries>> {
            self.inner.load_forecast(key)
        }
        fn next_index(&self) -> StoreResult<OrderIndex> {
            self.inner.next_index()
        }
        fn save_current(
            &self,
            key: &LocationKey,
            order: OrderIndex,
            observation: &CurrentObservation,
        ) -> StoreResult<()> {
            self.check()?;
            self.inner.save_current(key, order, observation)
        }
        fn replace_forecast(
            &self,
            key: &LocationKey,
            order: OrderIndex,
            series: &ForecastSeries,
        ) -> StoreResult<()> {
            self.check()?;
            self.inner.replace_forecast(key, order, series)
        }
        fn save_entry(
            &self,
            key: &LocationKey,
            order: OrderIndex,
            observation: &CurrentObservation,
            series: &ForecastSeries,
        ) -> StoreResult<()> {
            self.check()?;
            self.inner.save_entry(key, order, observation, series)
        }
        fn delete(&self, key: &LocationKey) -> StoreResult<()> {
            self.check()?;
            self.inner.delete(key)
        }
    }

    #[tokio::test]
    async fn test_set_and_get_halves_independently() {
        let cache = CacheStore::new(sqlite());
        cache.initialize().await.unwrap();
        let key = LocationKey::new("Vienna");

        cache.set_current(key.clone(), current(5.0)).await.unwrap();
        let entry = cache.get(&key).await.unwrap();
        assert_eq!(entry.current, Some(current(5.0)));
        assert!(entry.forecast.is_none());

        cache.set_forecast(key.clone(), forecast(3)).await.unwrap();
        let entry = cache.get(&LocationKey::new("VIENNA")).await.unwrap();
        assert_eq!(entry.current, Some(current(5.0)));
        assert_eq!(entry.forecast, Some(forecast(3)));
    }

    #[tokio::test]
    async fn test_put_writes_both_halves_once() {
        let store = sqlite();
        let cache = CacheStore::new(store.clone());
        cache.initialize().await.unwrap();
        let key = LocationKey::new("Cusco");

        cache.put(key.clone(), current(9.0), forecast(2)).await.unwrap();

        let entry = cache.get(&key).await.unwrap();
        assert_eq!(entry.current, Some(current(9.0)));
        assert_eq!(entry.forecast, Some(forecast(2)));
        assert_eq!(store.all_keys().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_skips_untracked_keys() {
        let store = sqlite();
        let cache = CacheStore::new(store.clone());
        cache.initialize().await.unwrap();
        let key = LocationKey::new("Bergen");

        assert!(!cache.refresh_current(key.clone(), current(3.0)).await.unwrap());
        assert!(!cache.refresh_forecast(key.clone(), forecast(1)).await.unwrap());
        assert!(cache.get(&key).await.is_none());
        assert!(store.all_keys().unwrap().is_empty());

        cache.set_current(key.clone(), current(3.0)).await.unwrap();
        assert!(cache.refresh_forecast(key.clone(), forecast(1)).await.unwrap());
        assert_eq!(cache.get(&key).await.unwrap().forecast, Some(forecast(1)));
    }

    #[tokio::test]
    async fn test_keys_follow_insertion_order() {
        let cache = CacheStore::new(sqlite());
        cache.initialize().await.unwrap();

        for name in ["Quito", "Accra", "Hanoi"] {
            cache.set_current(LocationKey::new(name), current(20.0)).await.unwrap();
        }
        // Updating an existing key keeps its position.
        cache.set_forecast(LocationKey::new("quito"), forecast(1)).await.unwrap();

        let keys: Vec<String> = cache.keys().await.iter().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["Quito", "Accra", "Hanoi"]);
    }

    #[tokio::test]
    async fn test_readded_key_moves_to_end() {
        let cache = CacheStore::new(sqlite());
        cache.initialize().await.unwrap();

        for name in ["A", "B", "C"] {
            cache.set_current(LocationKey::new(name), current(1.0)).await.unwrap();
        }
        cache.remove(&LocationKey::new("A")).await.unwrap();
        cache.set_current(LocationKey::new("A"), current(1.0)).await.unwrap();

        let keys: Vec<String> = cache.keys().await.iter().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["B", "C", "A"]);
    }

    #[tokio::test]
    async fn test_remove_twice_is_idempotent() {
        let cache = CacheStore::new(sqlite());
        cache.initialize().await.unwrap();
        let key = LocationKey::new("Perth");
        cache.set_current(key.clone(), current(25.0)).await.unwrap();

        cache.remove(&key).await.unwrap();
        assert!(cache.get(&key).await.is_none());
        cache.remove(&key).await.unwrap();
        assert!(cache.get(&key).await.is_none());
        assert!(cache.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_initialize_restores_from_store_once() {
        let store = sqlite();
        let first = CacheStore::new(store.clone());
        first.initialize().await.unwrap();
        first.set_current(LocationKey::new("Seoul"), current(4.0)).await.unwrap();
        first.set_forecast(LocationKey::new("Seoul"), forecast(2)).await.unwrap();

        let second = CacheStore::new(store.clone());
        assert!(!second.is_initialized().await);
        second.initialize().await.unwrap();
        let restored = second.get(&LocationKey::new("seoul")).await.unwrap();
        assert_eq!(restored.current, Some(current(4.0)));
        assert_eq!(restored.forecast, Some(forecast(2)));

        // A second initialize must not reload over newer memory state.
        second.set_current(LocationKey::new("Seoul"), current(6.0)).await.unwrap();
        second.initialize().await.unwrap();
        assert_eq!(
            second.get(&LocationKey::new("Seoul")).await.unwrap().current,
            Some(current(6.0))
        );
    }

    #[tokio::test]
    async fn test_failed_write_leaves_memory_untouched() {
        let store = Arc::new(FlakyStore {
            inner: SqliteStore::in_memory().unwrap(),
            fail_writes: AtomicBool::new(false),
        });
        let cache = CacheStore::new(store.clone());
        cache.initialize().await.unwrap();
        let key = LocationKey::new("Dakar");
        cache.set_current(key.clone(), current(28.0)).await.unwrap();

        store.fail_writes.store(true, Ordering::SeqCst);
        let err = cache.set_current(key.clone(), current(35.0)).await.unwrap_err();
        assert!(matches!(err, WeatherError::Storage(_)));
        assert!(cache.set_forecast(key.clone(), forecast(2)).await.is_err());
        assert!(cache.remove(&key).await.is_err());

        let entry = cache.get(&key).await.unwrap();
        assert_eq!(entry.current, Some(current(28.0)));
        assert!(entry.forecast.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_mutations_keep_layers_consistent() {
        let store = sqlite();
        let cache = CacheStore::new(store.clone());
        cache.initialize().await.unwrap();
        let key = LocationKey::new("Lagos");

        let mut handles = Vec::new();
        for i in 0..30 {
            let cache = cache.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                match i % 3 {
                    0 => cache.set_current(key, current(i as f64)).await,
                    1 => cache.set_forecast(key, forecast(i % 5 + 1)).await,
                    _ => cache.remove(&key).await,
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let in_memory = cache.get(&key).await;
        let on_disk: Option<StoredEntry> = store
            .load_all()
            .unwrap()
            .into_iter()
            .find(|s| s.key == key);

        match (in_memory, on_disk) {
            (None, None) => {}
            (Some(mem), Some(disk)) => {
                assert_eq!(mem.current, disk.current);
                assert_eq!(mem.forecast, disk.forecast);
            }
            (mem, disk) => panic!("layers diverged: memory={:?} disk={:?}", mem, disk),
        }
    }

    #[tokio::test]
    async fn test_dropped_caller_still_completes_write() {
        let cache = CacheStore::new(sqlite());
        cache.initialize().await.unwrap();
        let key = LocationKey::new("Hobart");

        let abandoned =
            tokio::time::timeout(Duration::ZERO, cache.set_current(key.clone(), current(11.0)))
                .await;
        assert!(abandoned.is_err());

        // Queued behind the abandoned write on the gate.
        cache.set_forecast(key.clone(), forecast(1)).await.unwrap();

        let entry = cache.get(&key).await.unwrap();
        assert_eq!(entry.current, Some(current(11.0)));
        assert_eq!(entry.forecast, Some(forecast(1)));
    }
}
