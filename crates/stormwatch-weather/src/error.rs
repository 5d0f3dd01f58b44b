//! Weather-layer error taxonomy.

use stormwatch_core::{AppError, DatabaseError, LocationError, NetworkError};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum WeatherError {
    /// Remote unreachable, timed out, or answered with a non-success status.
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// The location name did not resolve at the provider.
    #[error("Location not found: {0}")]
    NotFound(String),

    /// The operation needs a tracked location and this one is not.
    #[error("Location not tracked: {0}")]
    NotTracked(String),

    /// The durable layer failed; fatal for the affected operation only.
    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),

    /// The job observed its cancellation token before issuing more work.
    #[error("Operation cancelled")]
    Cancelled,
}

impl WeatherError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_) => ErrorKind::Network,
            Self::NotFound(_) | Self::NotTracked(_) => ErrorKind::NotFound,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether a later attempt may succeed without user action.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

/// Payload-free classification used by UI state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    NotFound,
    Storage,
    Cancelled,
}

impl From<WeatherError> for AppError {
    fn from(e: WeatherError) -> Self {
        match e {
            WeatherError::Network(e) => AppError::Network(e),
            WeatherError::NotFound(name) => AppError::Location(LocationError::NotFound(name)),
            WeatherError::NotTracked(name) => AppError::Location(LocationError::NotTracked(name)),
            WeatherError::Storage(e) => AppError::Storage(e),
            WeatherError::Cancelled => AppError::Service("operation cancelled".into()),
        }
    }
}

pub type WeatherResult<T> = Result<T, WeatherError>;
