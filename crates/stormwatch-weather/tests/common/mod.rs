//! Shared fixtures for the integration tests.
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use parking_lot::Mutex;
use stormwatch_core::NetworkError;
use stormwatch_weather::{
    CacheStore, Clock, CurrentObservation, ForecastPoint, ForecastSeries, LocationKey,
    ManualClock, RefreshCoordinator, Refresher, RemoteSource, SqliteStore, TtlPolicy,
    WeatherError, WeatherResult,
};
use tokio::sync::Semaphore;

pub fn start() -> DateTime<FixedOffset> {
    DateTime::parse_from_rfc3339("2026-10-18T10:00:00+02:00").unwrap()
}

/// Remote double with call counters and a gate on current-weather fetches.
pub struct FakeRemote {
    pub current_calls: AtomicUsize,
    pub forecast_calls: AtomicUsize,
    pub current_gate: Semaphore,
    pub offline: AtomicBool,
    pub unknown: Mutex<HashSet<String>>,
    clock: Arc<ManualClock>,
}

impl FakeRemote {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            current_calls: AtomicUsize::new(0),
            forecast_calls: AtomicUsize::new(0),
            current_gate: Semaphore::new(Semaphore::MAX_PERMITS),
            offline: AtomicBool::new(false),
            unknown: Mutex::new(HashSet::new()),
            clock,
        }
    }

    /// Current-weather fetches block until `open_gate`.
    pub fn gated(clock: Arc<ManualClock>) -> Self {
        Self {
            current_gate: Semaphore::new(0),
            ..Self::new(clock)
        }
    }

    pub fn open_gate(&self) {
        self.current_gate.add_permits(1_000);
    }

    pub fn current_calls(&self) -> usize {
        self.current_calls.load(Ordering::SeqCst)
    }

    pub fn forecast_calls(&self) -> usize {
        self.forecast_calls.load(Ordering::SeqCst)
    }

    fn check(&self, key: &LocationKey) -> WeatherResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(WeatherError::Network(NetworkError::ConnectionFailed(
                "offline".into(),
            )));
        }
        if self.unknown.lock().contains(key.canonical()) {
            return Err(WeatherError::NotFound(key.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteSource for FakeRemote {
    async fn fetch_current(&self, key: &LocationKey) -> WeatherResult<CurrentObservation> {
        self.current_calls.fetch_add(1, Ordering::SeqCst);
        let _permit = self.current_gate.acquire().await.unwrap();
        self.check(key)?;
        Ok(CurrentObservation {
            temperature: 12.5,
            condition_icon: "03d".into(),
            observed_at: self.clock.now_utc(),
        })
    }

    async fn fetch_forecast(&self, key: &LocationKey) -> WeatherResult<ForecastSeries> {
        self.forecast_calls.fetch_add(1, Ordering::SeqCst);
        self.check(key)?;
        let now = self.clock.now_utc();
        Ok(ForecastSeries {
            items: (1..=8)
                .map(|i| ForecastPoint {
                    timestamp: now + chrono::Duration::hours(3 * i),
                    temp_max: 14.0,
                    temp_min: 8.0,
                    condition_icon: "04d".into(),
                    wind: Some(3.0),
                    rain: None,
                    snow: None,
                })
                .collect(),
            observed_at: now,
        })
    }
}

pub struct Harness {
    pub coordinator: RefreshCoordinator,
    pub cache: CacheStore,
    pub remote: Arc<FakeRemote>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new(gated: bool) -> Self {
        let clock = Arc::new(ManualClock::new(start()));
        let remote = Arc::new(if gated {
            FakeRemote::gated(clock.clone())
        } else {
            FakeRemote::new(clock.clone())
        });
        let cache = CacheStore::new(Arc::new(SqliteStore::in_memory().unwrap()));
        let refresher = Refresher::new(
            cache.clone(),
            remote.clone(),
            TtlPolicy::default(),
            clock.clone(),
        );
        Self {
            coordinator: RefreshCoordinator::new(refresher),
            cache,
            remote,
            clock,
        }
    }

    pub fn now_utc(&self) -> DateTime<Utc> {
        self.clock.now_utc()
    }

    /// Track `name` with both halves two hours old, bypassing the remote.
    pub async fn track_stale(&self, name: &str) -> LocationKey {
        let key = LocationKey::new(name);
        let old = self.now_utc() - chrono::Duration::hours(2);
        self.cache
            .put(
                key.clone(),
                CurrentObservation {
                    temperature: 7.0,
                    condition_icon: "10d".into(),
                    observed_at: old,
                },
                ForecastSeries {
                    items: Vec::new(),
                    observed_at: old,
                },
            )
            .await
            .unwrap();
        key
    }
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition().await {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
