//! Error types shared by the Stormwatch crates.
//!
//! Every variant carries enough detail for the log; `user_message()` gives
//! the short text shown to whoever ran the command.

use thiserror::Error;

/// Any failure that can reach the user.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Network(#[from] NetworkError),

    #[error("{0}")]
    Storage(#[from] DatabaseError),

    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Location(#[from] LocationError),

    /// Failures from domain crates with no dedicated variant.
    #[error("{0}")]
    Service(String),
}

impl AppError {
    pub fn user_message(&self) -> &'static str {
        match self {
            AppError::Network(e) => e.user_message(),
            AppError::Storage(e) => e.user_message(),
            AppError::Config(e) => e.user_message(),
            AppError::Location(e) => e.user_message(),
            AppError::Service(_) => "Stormwatch could not finish that. Check the log for details.",
        }
    }
}

/// Talking to the weather service failed.
#[derive(Debug, Clone, Error)]
pub enum NetworkError {
    #[error("weather service unreachable: {0}")]
    ConnectionFailed(String),

    #[error("weather service did not answer in time")]
    Timeout,

    #[error("weather service answered {status}: {message}")]
    ServerError { status: u16, message: String },

    #[error("unreadable weather data: {0}")]
    InvalidResponse(String),
}

impl NetworkError {
    pub fn user_message(&self) -> &'static str {
        match self {
            NetworkError::ConnectionFailed(_) => {
                "Cannot reach the weather service. Showing cached weather where available."
            }
            NetworkError::Timeout => "The weather service is slow to respond. Try again shortly.",
            NetworkError::ServerError { status: 401, .. } => {
                "The weather API key was rejected. Check weather.api_key in config.toml."
            }
            NetworkError::ServerError { status: 429, .. } => {
                "Too many weather requests. Wait a minute and try again."
            }
            NetworkError::ServerError { status, .. } if *status >= 500 => {
                "The weather service is having trouble. Please try again later."
            }
            NetworkError::ServerError { .. } => "The weather service refused the request.",
            NetworkError::InvalidResponse(_) => {
                "The weather service sent data Stormwatch does not understand."
            }
        }
    }
}

/// The local weather database failed.
#[derive(Debug, Clone, Error)]
pub enum DatabaseError {
    #[error("cannot open weather database: {0}")]
    ConnectionFailed(String),

    #[error("weather database query failed: {0}")]
    QueryFailed(String),

    #[error("weather database is damaged: {0}")]
    Corruption(String),
}

impl DatabaseError {
    pub fn user_message(&self) -> &'static str {
        match self {
            DatabaseError::ConnectionFailed(_) => {
                "Cannot open the weather database. Check that data_dir is writable."
            }
            DatabaseError::QueryFailed(_) => "Saving or reading weather data failed.",
            DatabaseError::Corruption(_) => {
                "The weather database is damaged. Delete it to start over."
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing setting {0}")]
    MissingSetting(String),
}

impl ConfigError {
    pub fn user_message(&self) -> &'static str {
        match self {
            ConfigError::Invalid(_) => "config.toml has invalid settings. See the log for which.",
            ConfigError::MissingSetting(_) => {
                "No weather API key. Set weather.api_key or OPENWEATHER_API_KEY."
            }
        }
    }
}

/// Problems with a user-managed location.
#[derive(Debug, Error)]
pub enum LocationError {
    #[error("location not found: {0}")]
    NotFound(String),

    #[error("location already tracked: {0}")]
    Duplicate(String),

    #[error("location not tracked: {0}")]
    NotTracked(String),

    #[error("invalid location name: {0:?}")]
    InvalidName(String),
}

impl LocationError {
    pub fn user_message(&self) -> &'static str {
        match self {
            LocationError::NotFound(_) => "Location not found. Check the spelling and try again.",
            LocationError::Duplicate(_) => "That location is already tracked.",
            LocationError::NotTracked(_) => {
                "That location is not tracked. Add it with `stormwatch add` first."
            }
            LocationError::InvalidName(_) => "Enter a location name.",
        }
    }
}

/// Map reqwest failures onto `NetworkError`.
pub trait ReqwestErrorExt {
    fn into_network_error(self) -> NetworkError;
}

impl ReqwestErrorExt for reqwest::Error {
    fn into_network_error(self) -> NetworkError {
        let detail = self.to_string();
        match self.status() {
            _ if self.is_timeout() => NetworkError::Timeout,
            _ if self.is_decode() => NetworkError::InvalidResponse(detail),
            Some(status) => NetworkError::ServerError {
                status: status.as_u16(),
                message: detail,
            },
            None => NetworkError::ConnectionFailed(detail),
        }
    }
}

/// Map rusqlite failures onto `DatabaseError` by SQLite result code.
pub trait RusqliteErrorExt {
    fn into_database_error(self) -> DatabaseError;
}

impl RusqliteErrorExt for rusqlite::Error {
    fn into_database_error(self) -> DatabaseError {
        use rusqlite::ErrorCode;

        let code = match &self {
            rusqlite::Error::SqliteFailure(err, _) => Some(err.code),
            _ => None,
        };
        match code {
            Some(ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase) => {
                DatabaseError::Corruption(self.to_string())
            }
            Some(ErrorCode::CannotOpen | ErrorCode::PermissionDenied) => {
                DatabaseError::ConnectionFailed(self.to_string())
            }
            _ => DatabaseError::QueryFailed(self.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    use super::*;

    #[test]
    fn test_every_variant_has_a_message() {
        let errors = vec![
            AppError::Network(NetworkError::Timeout),
            AppError::Storage(DatabaseError::QueryFailed("locked".into())),
            AppError::Config(ConfigError::Invalid("weather.base_url".into())),
            AppError::Location(LocationError::NotFound("Atlantis".into())),
            AppError::Service("cancelled".into()),
        ];

        for err in errors {
            assert!(!err.user_message().is_empty(), "empty message for {:?}", err);
        }
    }

    #[test]
    fn test_location_error_converts() {
        let app_err: AppError = LocationError::Duplicate("Paris".into()).into();
        assert!(matches!(app_err, AppError::Location(LocationError::Duplicate(_))));
        assert_eq!(app_err.to_string(), "location already tracked: Paris");
    }

    #[test]
    fn test_server_error_messages_by_status() {
        let server_error = |status| NetworkError::ServerError {
            status,
            message: String::new(),
        };
        assert!(server_error(503).user_message().contains("try again later"));
        assert!(server_error(401).user_message().contains("API key"));
        assert!(server_error(429).user_message().contains("Too many"));
        assert!(server_error(400).user_message().contains("refused"));
    }

    #[test]
    fn test_rusqlite_error_mapping() {
        let err = rusqlite::Error::QueryReturnedNoRows.into_database_error();
        assert!(matches!(err, DatabaseError::QueryFailed(_)));

        let corrupt = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CORRUPT),
            None,
        );
        assert!(matches!(
            corrupt.into_database_error(),
            DatabaseError::Corruption(_)
        ));
    }
}
