//! Presentation-facing state and events.

use chrono::{DateTime, FixedOffset, Utc};

use crate::error::ErrorKind;
use crate::forecast::{daily_summaries, DaySummary};
use crate::ttl::TtlPolicy;
use crate::types::{CacheEntry, CurrentObservation, ForecastSeries, LocationKey};

/// State of one observed screen.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum UiState<T> {
    #[default]
    Loading,
    Success(T),
    Error(ErrorKind),
}

impl<T> UiState<T> {
    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }

    pub fn success(&self) -> Option<&T> {
        match self {
            Self::Success(value) => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<ErrorKind> {
        match self {
            Self::Error(kind) => Some(*kind),
            _ => None,
        }
    }
}

/// One-shot notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    LocationAdded(LocationKey),
    DuplicateLocation(LocationKey),
    LocationNotFound(LocationKey),
    /// A remote call failed for lack of connectivity; cached data is shown.
    Offline,
    /// A refresh failed for a non-network reason; cached data is kept.
    RefreshFailed { key: LocationKey, kind: ErrorKind },
    StorageFailed,
}

/// Everything a screen needs for one location.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationWeather {
    pub key: LocationKey,
    pub current: Option<CurrentObservation>,
    pub forecast: Option<ForecastSeries>,
    /// Upcoming days, starting tomorrow
    pub days: Vec<DaySummary>,
    pub current_stale: bool,
    pub forecast_stale: bool,
}

impl LocationWeather {
    pub fn from_entry(entry: CacheEntry, ttl: &TtlPolicy, now: DateTime<FixedOffset>) -> Self {
        let staleness = ttl.staleness(Some(&entry), now.with_timezone(&Utc));
        let days = entry
            .forecast
            .as_ref()
            .map(|f| daily_summaries(&f.items, now, true))
            .unwrap_or_default();

        Self {
            key: entry.key,
            current: entry.current,
            forecast: entry.forecast,
            days,
            current_stale: staleness.current,
            forecast_stale: staleness.forecast,
        }
    }
}
