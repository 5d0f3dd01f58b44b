//! Freshness rules for the two cached halves.

use std::time::Duration;

use chrono::{DateTime, Utc};
use stormwatch_core::WeatherConfig;

use crate::types::CacheEntry;

/// Default validity of both halves.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);

/// `true` while `now - timestamp < ttl`. The boundary itself is stale, and a
/// timestamp in the future counts as fresh.
pub fn is_valid(timestamp: DateTime<Utc>, now: DateTime<Utc>, ttl: Duration) -> bool {
    let age = now.signed_duration_since(timestamp);
    match chrono::Duration::from_std(ttl) {
        Ok(ttl) => age < ttl,
        // A TTL too large for chrono never expires.
        Err(_) => true,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    pub current_ttl: Duration,
    pub forecast_ttl: Duration,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            current_ttl: DEFAULT_TTL,
            forecast_ttl: DEFAULT_TTL,
        }
    }
}

/// Which halves of an entry need a remote fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Staleness {
    pub current: bool,
    pub forecast: bool,
}

impl From<&WeatherConfig> for TtlPolicy {
    fn from(config: &WeatherConfig) -> Self {
        Self::new(config.current_ttl(), config.forecast_ttl())
    }
}

impl Staleness {
    pub fn any(&self) -> bool {
        self.current || self.forecast
    }
}

impl TtlPolicy {
    pub fn new(current_ttl: Duration, forecast_ttl: Duration) -> Self {
        Self {
            current_ttl,
            forecast_ttl,
        }
    }

    /// Evaluate both halves independently; a missing half is stale.
    pub fn staleness(&self, entry: Option<&CacheEntry>, now: DateTime<Utc>) -> Staleness {
        let Some(entry) = entry else {
            return Staleness {
                current: true,
                forecast: true,
            };
        };

        Staleness {
            current: !entry
                .current
                .as_ref()
                .is_some_and(|c| is_valid(c.observed_at, now, self.current_ttl)),
            forecast: !entry
                .forecast
                .as_ref()
                .is_some_and(|f| is_valid(f.observed_at, now, self.forecast_ttl)),
        }
    }
}
