//! Background refresh and dangerous-weather sweeps.
//!
//! Runs independently of any UI: periodic whole-fleet refreshes and periodic
//! alert checks for subscribed locations. Per-location problems are logged
//! and skipped; a sweep that cannot run at all is retried with backoff.

use std::sync::Arc;
use std::time::Duration;

use stormwatch_core::SchedulerConfig;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::alerts::{AlertStore, NotificationDedup};
use crate::backoff::{with_retry, RetryConfig, RetryOutcome};
use crate::cache::blocking;
use crate::danger;
use crate::error::{WeatherError, WeatherResult};
use crate::notify::NotificationSink;
use crate::refresh::Refresher;
use crate::types::LocationKey;

#[derive(Clone)]
pub struct BackgroundScheduler {
    refresher: Refresher,
    alerts: Arc<AlertStore>,
    dedup: Arc<NotificationDedup>,
    sink: Arc<dyn NotificationSink>,
    config: SchedulerConfig,
}

impl BackgroundScheduler {
    pub fn new(
        refresher: Refresher,
        alerts: Arc<AlertStore>,
        dedup: Arc<NotificationDedup>,
        sink: Arc<dyn NotificationSink>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            refresher,
            alerts,
            dedup,
            sink,
            config,
        }
    }

    /// Refresh every tracked location. Returns how many failed.
    pub async fn run_fleet_refresh(&self, token: &CancellationToken) -> WeatherResult<usize> {
        let failures = self.refresher.refresh_fleet(token).await?;
        for (key, failure) in &failures {
            tracing::warn!("Background refresh of {} failed: {}", key, failure);
        }
        tracing::info!("Fleet refresh finished with {} failures", failures.len());
        Ok(failures.len())
    }

    /// Check every subscribed location. Returns how many alerts went out.
    pub async fn run_danger_sweep(&self, token: &CancellationToken) -> WeatherResult<usize> {
        self.refresher.cache().initialize().await?;
        let alerts = self.alerts.clone();
        let keys = blocking(move || alerts.enabled_keys()).await?;

        let mut delivered = 0;
        for key in keys {
            if token.is_cancelled() {
                break;
            }
            if !self.refresher.cache().contains(&key).await {
                tracing::debug!("Alerts enabled for untracked {}, skipping", key);
                continue;
            }
            match self.check(&key, token).await {
                Ok(true) => delivered += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!("Alert check for {} failed: {}", key, e),
            }
        }
        tracing::info!("Danger sweep delivered {} alerts", delivered);
        Ok(delivered)
    }

    /// One-shot check for a single location. `true` when an alert went out.
    pub async fn check_now(&self, key: &LocationKey) -> WeatherResult<bool> {
        self.check(key, &CancellationToken::new()).await
    }

    /// Subscribe `key` and check it straight away. Only tracked locations
    /// can be subscribed.
    pub async fn enable_alerts(&self, key: &LocationKey) -> WeatherResult<bool> {
        self.require_tracked(key).await?;
        let (alerts, k) = (self.alerts.clone(), key.clone());
        blocking(move || alerts.set_enabled(&k, true)).await?;
        tracing::info!("Alerts enabled for {}", key);
        self.check_now(key).await
    }

    /// Unsubscribe `key`. The next enable starts from a clean slate.
    pub async fn disable_alerts(&self, key: &LocationKey) -> WeatherResult<()> {
        let (dedup, k) = (self.dedup.clone(), key.clone());
        blocking(move || dedup.forget(&k)).await?;
        tracing::info!("Alerts disabled for {}", key);
        Ok(())
    }

    async fn require_tracked(&self, key: &LocationKey) -> WeatherResult<()> {
        let cache = self.refresher.cache();
        cache.initialize().await?;
        if !cache.contains(key).await {
            return Err(WeatherError::NotTracked(key.to_string()));
        }
        Ok(())
    }

    async fn check(&self, key: &LocationKey, token: &CancellationToken) -> WeatherResult<bool> {
        self.require_tracked(key).await?;
        let entry = match self.refresher.ensure_fresh_cancellable(key, token).await {
            Ok(entry) => entry,
            Err(failure) => {
                let Some(entry) = failure.usable_cache().cloned() else {
                    return Err(failure.error);
                };
                tracing::warn!("Using cached forecast for {}: {}", key, failure);
                entry
            }
        };

        let Some(forecast) = entry.forecast else {
            tracing::debug!("No forecast for {}, nothing to check", key);
            return Ok(false);
        };

        let warnings = danger::evaluate(&forecast.items, self.refresher.clock().now());
        let Some(message) = danger::render_message(&warnings) else {
            tracing::debug!("No dangerous weather for {}", key);
            return Ok(false);
        };

        if !self.dedup.should_notify(key, &message) {
            tracing::debug!("Alert for {} already delivered", key);
            return Ok(false);
        }

        let title = format!("Dangerous weather tomorrow in {}", key);
        self.sink.notify(key, &title, &message);

        let (dedup, k) = (self.dedup.clone(), key.clone());
        blocking(move || dedup.record(&k, &message)).await?;
        tracing::info!("Alert delivered for {} ({} warnings)", key, warnings.len());
        Ok(true)
    }

    /// Run the periodic loops until `shutdown` fires.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let retry = RetryConfig::from(&self.config);
            let refresh = self.periodic(
                "fleet refresh",
                self.config.refresh_interval(),
                &retry,
                &shutdown,
                |s, token| async move { s.run_fleet_refresh(&token).await.map(drop) },
            );
            let sweep = self.periodic(
                "danger sweep",
                self.config.alert_interval(),
                &retry,
                &shutdown,
                |s, token| async move { s.run_danger_sweep(&token).await.map(drop) },
            );
            tokio::join!(refresh, sweep);
            tracing::info!("Background scheduler stopped");
        })
    }

    async fn periodic<F, Fut>(
        &self,
        label: &str,
        every: Option<Duration>,
        retry: &RetryConfig,
        shutdown: &CancellationToken,
        task: F,
    ) where
        F: Fn(BackgroundScheduler, CancellationToken) -> Fut,
        Fut: std::future::Future<Output = WeatherResult<()>>,
    {
        let Some(every) = every else {
            tracing::info!("{} disabled", label);
            return;
        };

        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let outcome = with_retry(retry, shutdown, label, || {
                task(self.clone(), shutdown.child_token())
            })
            .await;
            match outcome {
                RetryOutcome::Completed(()) => {}
                RetryOutcome::Exhausted(e) => {
                    tracing::error!("{} gave up until next interval: {}", label, e);
                }
                RetryOutcome::Cancelled => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    use super::*;
    use crate::cache::CacheStore;
    use crate::clock::ManualClock;
    use crate::notify::ChannelSink;
    use crate::provider::RemoteSource;
    use crate::store::SqliteStore;
    use crate::ttl::TtlPolicy;
    use crate::types::{CurrentObservation, ForecastPoint, ForecastSeries};
    use async_trait::async_trait;
    use chrono::{DateTime, FixedOffset, Utc};
    use parking_lot::Mutex;

    fn now() -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339("2026-12-01T18:00:00+00:00").unwrap()
    }

    /// Serves a fixed low for tomorrow that tests can change.
    struct ColdRemote {
        tomorrow_low: Mutex<f64>,
    }

    #[async_trait]
    impl RemoteSource for ColdRemote {
        async fn fetch_current(&self, _key: &LocationKey) -> WeatherResult<CurrentObservation> {
            Ok(CurrentObservation {
                temperature: -10.0,
                condition_icon: "13n".into(),
                observed_at: now().with_timezone(&Utc),
            })
        }

        async fn fetch_forecast(&self, _key: &LocationKey) -> WeatherResult<ForecastSeries> {
            Ok(ForecastSeries {
                items: vec![ForecastPoint {
                    timestamp: DateTime::parse_from_rfc3339("2026-12-02T06:00:00Z")
                        .unwrap()
                        .with_timezone(&Utc),
                    temp_max: -20.0,
                    temp_min: *self.tomorrow_low.lock(),
                    condition_icon: "13d".into(),
                    wind: None,
                    rain: None,
                    snow: None,
                }],
                observed_at: now().with_timezone(&Utc),
            })
        }
    }

    struct Fixture {
        scheduler: BackgroundScheduler,
        remote: Arc<ColdRemote>,
        clock: Arc<ManualClock>,
        alerts: tokio::sync::mpsc::UnboundedReceiver<crate::notify::Alert>,
    }

    async fn fixture() -> Fixture {
        let cache = CacheStore::new(Arc::new(SqliteStore::in_memory().unwrap()));
        let remote = Arc::new(ColdRemote {
            tomorrow_low: Mutex::new(-35.0),
        });
        let clock = Arc::new(ManualClock::new(now()));
        let refresher = Refresher::new(cache, remote.clone(), TtlPolicy::default(), clock.clone());
        let store = Arc::new(AlertStore::in_memory().unwrap());
        let dedup = Arc::new(NotificationDedup::load(store.clone()).unwrap());
        let (sink, alerts) = ChannelSink::channel();

        let current_key = LocationKey::new("Yakutsk");
        let forecast_key = LocationKey::new("Yakutsk");
        let (current, forecast) = tokio::join!(
            remote.fetch_current(&current_key),
            remote.fetch_forecast(&forecast_key),
        );
        refresher
            .cache()
            .put("Yakutsk".into(), current.unwrap(), forecast.unwrap())
            .await
            .unwrap();

        Fixture {
            scheduler: BackgroundScheduler::new(
                refresher,
                store,
                dedup,
                Arc::new(sink),
                SchedulerConfig::default(),
            ),
            remote,
            clock,
            alerts,
        }
    }

    #[tokio::test]
    async fn test_enable_alerts_runs_one_shot_check() {
        let mut fx = fixture().await;
        let key = LocationKey::new("Yakutsk");

        assert!(fx.scheduler.enable_alerts(&key).await.unwrap());
        let alert = fx.alerts.try_recv().unwrap();
        assert_eq!(alert.key, key);
        assert!(alert.message.contains("Extreme cold"));
    }

    #[tokio::test]
    async fn test_enable_alerts_rejects_untracked_location() {
        let mut fx = fixture().await;
        let berlin = LocationKey::new("Berlin");

        let err = fx.scheduler.enable_alerts(&berlin).await.unwrap_err();
        assert!(matches!(err, WeatherError::NotTracked(name) if name == "Berlin"));
        assert!(matches!(
            fx.scheduler.check_now(&berlin).await,
            Err(WeatherError::NotTracked(_))
        ));

        let cache = fx.scheduler.refresher.cache();
        assert_eq!(cache.keys().await, vec![LocationKey::new("Yakutsk")]);
        assert!(!fx.scheduler.alerts.is_enabled(&berlin).unwrap());
        assert!(fx.alerts.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_same_warning_is_delivered_once() {
        let mut fx = fixture().await;
        let key = LocationKey::new("Yakutsk");
        fx.scheduler.enable_alerts(&key).await.unwrap();
        fx.alerts.try_recv().unwrap();

        let token = CancellationToken::new();
        assert_eq!(fx.scheduler.run_danger_sweep(&token).await.unwrap(), 0);
        assert!(fx.alerts.try_recv().is_err());

        // A colder forecast changes the message.
        *fx.remote.tomorrow_low.lock() = -42.0;
        fx.clock.advance(chrono::Duration::minutes(31));
        assert_eq!(fx.scheduler.run_danger_sweep(&token).await.unwrap(), 1);
        assert!(fx.alerts.try_recv().unwrap().message.contains("-42.0"));
    }

    #[tokio::test]
    async fn test_sweep_skips_unsubscribed_locations() {
        let mut fx = fixture().await;
        let token = CancellationToken::new();

        assert_eq!(fx.scheduler.run_danger_sweep(&token).await.unwrap(), 0);
        assert!(fx.alerts.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_mild_weather_sends_nothing() {
        let mut fx = fixture().await;
        *fx.remote.tomorrow_low.lock() = -5.0;
        fx.clock.advance(chrono::Duration::hours(1));

        assert!(!fx.scheduler.enable_alerts(&LocationKey::new("Yakutsk")).await.unwrap());
        assert!(fx.alerts.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disable_then_enable_notifies_again() {
        let mut fx = fixture().await;
        let key = LocationKey::new("Yakutsk");
        fx.scheduler.enable_alerts(&key).await.unwrap();
        fx.alerts.try_recv().unwrap();

        fx.scheduler.disable_alerts(&key).await.unwrap();
        assert!(fx.scheduler.enable_alerts(&key).await.unwrap());
        assert!(fx.alerts.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_fleet_refresh_counts_failures() {
        let fx = fixture().await;
        let failures = fx
            .scheduler
            .run_fleet_refresh(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(failures, 0);
    }

    #[tokio::test]
    async fn test_spawned_loops_stop_on_shutdown() {
        let mut fx = fixture().await;
        let key = LocationKey::new("Yakutsk");
        let alerts = fx.scheduler.alerts.clone();
        alerts.set_enabled(&key, true).unwrap();

        let shutdown = CancellationToken::new();
        let handle = fx.scheduler.clone().spawn(shutdown.clone());

        // First ticks fire immediately.
        let alert = fx.alerts.recv().await.unwrap();
        assert_eq!(alert.key, key);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
