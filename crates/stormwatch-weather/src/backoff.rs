//! Exponential backoff for scheduler tasks that could not run.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use stormwatch_core::SchedulerConfig;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 1000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 60_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Attempts after the first one
    pub max_retries: u32,
    /// Delay before the first retry (doubles each attempt)
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_RETRIES,
            DEFAULT_INITIAL_DELAY_MS,
            DEFAULT_MAX_DELAY_MS,
        )
    }
}

impl From<&SchedulerConfig> for RetryConfig {
    fn from(config: &SchedulerConfig) -> Self {
        Self::new(
            config.max_retries,
            config.initial_delay_ms,
            config.max_delay_ms,
        )
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32, initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_millis(initial_delay_ms),
            max_delay: Duration::from_millis(max_delay_ms),
        }
    }

    /// `initial_delay * 2^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        let delay_ms = (self.initial_delay.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(delay_ms.min(self.max_delay.as_millis() as u64))
    }
}

/// Outcome of a retried operation.
#[derive(Debug, PartialEq, Eq)]
pub enum RetryOutcome<T, E> {
    Completed(T),
    /// Every attempt failed; carries the last error.
    Exhausted(E),
    /// Shutdown was requested while waiting between attempts.
    Cancelled,
}

/// Run `operation` until it succeeds, retrying every failure with backoff.
///
/// The wait between attempts ends early when `shutdown` fires.
pub async fn with_retry<T, E, F, Fut>(
    config: &RetryConfig,
    shutdown: &CancellationToken,
    label: &str,
    mut operation: F,
) -> RetryOutcome<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!("{} succeeded after {} retries", label, attempt);
                }
                return RetryOutcome::Completed(value);
            }
            Err(e) if attempt >= config.max_retries => {
                tracing::error!(
                    "{} failed after {} attempts: {}",
                    label,
                    config.max_retries + 1,
                    e
                );
                return RetryOutcome::Exhausted(e);
            }
            Err(e) => {
                let delay = config.delay_for_attempt(attempt);
                tracing::warn!(
                    "{} failed on attempt {} of {}, retrying in {:?}: {}",
                    label,
                    attempt + 1,
                    config.max_retries + 1,
                    delay,
                    e
                );
                tokio::select! {
                    _ = shutdown.cancelled() => return RetryOutcome::Cancelled,
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}
