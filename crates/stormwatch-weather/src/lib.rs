//! Weather cache and refresh coordination for Stormwatch
//!
//! A two-tier (memory + SQLite) cache of current conditions and forecasts
//! per tracked location, kept fresh by UI-driven jobs and a background
//! scheduler that also raises dangerous-weather alerts.

pub mod alerts;
pub mod backoff;
pub mod cache;
pub mod clock;
pub mod coordinator;
pub mod danger;
pub mod error;
pub mod forecast;
pub mod notify;
pub mod provider;
pub mod refresh;
pub mod scheduler;
pub mod store;
pub mod ttl;
pub mod types;
pub mod ui;

pub use alerts::{AlertStore, NotificationDedup};
pub use backoff::{RetryConfig, RetryOutcome};
pub use cache::CacheStore;
pub use clock::{Clock, ManualClock, SystemClock};
pub use coordinator::{OperationKind, RefreshCoordinator, Request};
pub use danger::WeatherWarning;
pub use error::{ErrorKind, WeatherError, WeatherResult};
pub use forecast::DaySummary;
pub use notify::{Alert, ChannelSink, DesktopSink, FanoutSink, NotificationSink, TracingSink};
pub use provider::{OpenWeatherProvider, RemoteSource};
pub use refresh::{RefreshFailure, Refresher};
pub use scheduler::BackgroundScheduler;
pub use store::{PersistentStore, SqliteStore, StoredEntry};
pub use ttl::{Staleness, TtlPolicy};
pub use types::*;
pub use ui::{LocationWeather, UiEvent, UiState};
