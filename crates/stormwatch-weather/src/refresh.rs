//! "Ensure fresh data for one key", shared by UI jobs and background tasks.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::cache::CacheStore;
use crate::clock::Clock;
use crate::error::{WeatherError, WeatherResult};
use crate::provider::RemoteSource;
use crate::ttl::TtlPolicy;
use crate::types::{CacheEntry, LocationKey};

/// A refresh that did not fully succeed.
///
/// Carries whatever is cached for the key so callers can keep showing it.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{error}")]
pub struct RefreshFailure {
    pub error: WeatherError,
    pub cached: Option<CacheEntry>,
}

impl RefreshFailure {
    /// Cached data worth showing despite the failure.
    pub fn usable_cache(&self) -> Option<&CacheEntry> {
        self.cached.as_ref().filter(|entry| !entry.is_empty())
    }
}

#[derive(Clone)]
pub struct Refresher {
    cache: CacheStore,
    remote: Arc<dyn RemoteSource>,
    ttl: TtlPolicy,
    clock: Arc<dyn Clock>,
}

impl Refresher {
    pub fn new(
        cache: CacheStore,
        remote: Arc<dyn RemoteSource>,
        ttl: TtlPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cache,
            remote,
            ttl,
            clock,
        }
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn remote(&self) -> &Arc<dyn RemoteSource> {
        &self.remote
    }

    pub fn ttl(&self) -> &TtlPolicy {
        &self.ttl
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub async fn ensure_fresh(&self, key: &LocationKey) -> Result<CacheEntry, RefreshFailure> {
        self.ensure_fresh_cancellable(key, &CancellationToken::new())
            .await
    }

    /// Fetch only the halves that are missing or past their TTL.
    ///
    /// Stale halves are fetched concurrently and, for a tracked key, each
    /// success is written through on its own, so one failing half never
    /// discards the other.
    /// `token` is checked before any remote call is issued; calls already in
    /// flight finish and their results are still written.
    pub async fn ensure_fresh_cancellable(
        &self,
        key: &LocationKey,
        token: &CancellationToken,
    ) -> Result<CacheEntry, RefreshFailure> {
        let cached = self.cache.get(key).await;
        let staleness = self.ttl.staleness(cached.as_ref(), self.clock.now_utc());

        if !staleness.any() {
            tracing::debug!("{} is fresh, skipping fetch", key);
            return Ok(cached.unwrap_or_else(|| CacheEntry::empty(key.clone())));
        }
        if token.is_cancelled() {
            return Err(RefreshFailure {
                error: WeatherError::Cancelled,
                cached,
            });
        }

        // Only the add flow tracks keys. Results for an untracked key, or one
        // removed mid-refresh, are returned but never cached.
        let current = async {
            if !staleness.current {
                return None;
            }
            let result = match self.remote.fetch_current(key).await {
                Ok(observation) => self
                    .cache
                    .refresh_current(key.clone(), observation.clone())
                    .await
                    .map(|_| observation),
                Err(e) => Err(e),
            };
            Some(result)
        };

        let forecast = async {
            if !staleness.forecast {
                return None;
            }
            let result = match self.remote.fetch_forecast(key).await {
                Ok(series) => self
                    .cache
                    .refresh_forecast(key.clone(), series.clone())
                    .await
                    .map(|_| series),
                Err(e) => Err(e),
            };
            Some(result)
        };

        let (current, forecast) = tokio::join!(current, forecast);

        let mut fallback = cached.unwrap_or_else(|| CacheEntry::empty(key.clone()));
        let mut failure: Option<WeatherError> = None;
        match current {
            Some(Ok(observation)) => fallback.current = Some(observation),
            Some(Err(e)) => {
                tracing::warn!("Current weather refresh failed for {}: {}", key, e);
                failure.get_or_insert(e);
            }
            None => {}
        }
        match forecast {
            Some(Ok(series)) => fallback.forecast = Some(series),
            Some(Err(e)) => {
                tracing::warn!("Forecast refresh failed for {}: {}", key, e);
                failure.get_or_insert(e);
            }
            None => {}
        }

        // Prefer what the cache holds now. Untracked keys fall back to the
        // fetched halves.
        let entry = self.cache.get(key).await;
        match failure {
            Some(error) => Err(RefreshFailure {
                error,
                cached: entry.or(Some(fallback)),
            }),
            None => Ok(entry.unwrap_or(fallback)),
        }
    }

    /// Refresh every tracked key, one after another.
    ///
    /// Per-key failures are logged and collected; only a failure to read the
    /// tracked set fails the whole call.
    pub async fn refresh_fleet(
        &self,
        token: &CancellationToken,
    ) -> WeatherResult<Vec<(LocationKey, RefreshFailure)>> {
        self.cache.initialize().await?;

        let mut failures = Vec::new();
        for key in self.cache.keys().await {
            if token.is_cancelled() {
                break;
            }
            if let Err(failure) = self.ensure_fresh_cancellable(&key, token).await {
                if !matches!(failure.error, WeatherError::Cancelled) {
                    failures.push((key, failure));
                }
            }
        }
        Ok(failures)
    }
}
