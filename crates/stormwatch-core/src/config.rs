use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::error::{AppError, ConfigError};

/// Environment variable consulted when `weather.api_key` is empty.
pub const API_KEY_ENV: &str = "OPENWEATHER_API_KEY";

/// Configuration validation errors
#[derive(Debug, Clone)]
pub struct ConfigValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Result of config validation
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ConfigValidationError>,
    pub warnings: Vec<ConfigValidationError>,
}

impl ValidationResult {
    /// Returns true if there are no errors (warnings are OK)
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Add an error
    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ConfigValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Add a warning
    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ConfigValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Get a user-friendly message summarizing all errors
    pub fn error_summary(&self) -> String {
        if self.errors.is_empty() {
            return String::new();
        }
        self.errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the weather database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Weather provider and cache settings
    #[serde(default)]
    pub weather: WeatherConfig,

    /// Background refresh settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Notification delivery settings
    #[serde(default)]
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherConfig {
    /// OpenWeatherMap API key (falls back to `OPENWEATHER_API_KEY`)
    #[serde(default)]
    pub api_key: String,

    /// Base URL of the weather API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// How long a current observation stays valid
    #[serde(default = "default_ttl_minutes")]
    pub current_ttl_minutes: u32,

    /// How long a forecast stays valid
    #[serde(default = "default_ttl_minutes")]
    pub forecast_ttl_minutes: u32,
}

fn default_base_url() -> String {
    "https://api.openweathermap.org/data/2.5".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_ttl_minutes() -> u32 {
    30
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout(),
            current_ttl_minutes: default_ttl_minutes(),
            forecast_ttl_minutes: default_ttl_minutes(),
        }
    }
}

impl WeatherConfig {
    /// The configured API key, or the environment override when unset.
    pub fn resolved_api_key(&self) -> Option<String> {
        if !self.api_key.trim().is_empty() {
            return Some(self.api_key.trim().to_string());
        }
        std::env::var(API_KEY_ENV)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }

    pub fn current_ttl(&self) -> Duration {
        minutes(self.current_ttl_minutes)
    }

    pub fn forecast_ttl(&self) -> Duration {
        minutes(self.forecast_ttl_minutes)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Whole-fleet refresh interval in minutes (0 disables)
    #[serde(default = "default_refresh_minutes")]
    pub refresh_minutes: u32,

    /// Dangerous-weather sweep interval in minutes (0 disables)
    #[serde(default = "default_refresh_minutes")]
    pub alert_check_minutes: u32,

    /// Retries for a task that could not run
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff delay in milliseconds (doubles each attempt)
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Backoff ceiling in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_refresh_minutes() -> u32 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            refresh_minutes: default_refresh_minutes(),
            alert_check_minutes: default_refresh_minutes(),
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl SchedulerConfig {
    /// `None` when the periodic refresh is disabled.
    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_minutes > 0).then(|| minutes(self.refresh_minutes))
    }

    /// `None` when the periodic alert sweep is disabled.
    pub fn alert_interval(&self) -> Option<Duration> {
        (self.alert_check_minutes > 0).then(|| minutes(self.alert_check_minutes))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Show desktop notifications for dangerous weather
    #[serde(default = "default_desktop")]
    pub desktop: bool,
}

fn default_desktop() -> bool {
    true
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            desktop: default_desktop(),
        }
    }
}

fn minutes(value: u32) -> Duration {
    Duration::from_secs(u64::from(value) * 60)
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("stormwatch")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            weather: WeatherConfig::default(),
            scheduler: SchedulerConfig::default(),
            notifications: NotificationConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file, creating default if it doesn't exist
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from an explicit path, writing defaults if missing
    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            let config = Self::default();
            config.save_to(config_path)?;
            return Ok(config);
        }

        let contents =
            std::fs::read_to_string(config_path).context("Failed to read config file")?;

        let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Load configuration and validate it
    ///
    /// Returns the config along with any validation warnings.
    /// Returns an error if validation fails with critical errors.
    pub fn load_validated() -> Result<(Self, ValidationResult)> {
        let config = Self::load()?;
        let validation = config.validate();

        if !validation.is_valid() {
            return Err(AppError::from(ConfigError::Invalid(validation.error_summary())).into());
        }

        for warning in &validation.warnings {
            tracing::warn!("Config warning: {}", warning);
        }

        Ok((config, validation))
    }

    /// Validate the configuration
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        self.validate_url(&self.weather.base_url, "weather.base_url", &mut result);

        if self.weather.resolved_api_key().is_none() {
            result.add_warning(
                "weather.api_key",
                format!("No API key configured (set it here or via {})", API_KEY_ENV),
            );
        }

        if self.weather.request_timeout_secs == 0 {
            result.add_error(
                "weather.request_timeout_secs",
                "Request timeout must be greater than 0",
            );
        }

        if self.weather.current_ttl_minutes == 0 {
            result.add_error(
                "weather.current_ttl_minutes",
                "Current observation TTL must be greater than 0",
            );
        }

        if self.weather.forecast_ttl_minutes == 0 {
            result.add_error(
                "weather.forecast_ttl_minutes",
                "Forecast TTL must be greater than 0",
            );
        }

        if self.scheduler.refresh_minutes == 0 {
            result.add_warning(
                "scheduler.refresh_minutes",
                "Background refresh disabled (0 minutes)",
            );
        } else if self.scheduler.refresh_minutes > 1440 {
            result.add_warning(
                "scheduler.refresh_minutes",
                "Background refresh interval is more than 24 hours",
            );
        }

        if self.scheduler.alert_check_minutes == 0 {
            result.add_warning(
                "scheduler.alert_check_minutes",
                "Dangerous-weather checks disabled (0 minutes)",
            );
        }

        if self.scheduler.initial_delay_ms > self.scheduler.max_delay_ms {
            result.add_error(
                "scheduler.initial_delay_ms",
                "Initial retry delay exceeds the maximum delay",
            );
        }

        if self.data_dir.exists() && !self.data_dir.is_dir() {
            result.add_error(
                "data_dir",
                format!("Path is not a directory: {}", self.data_dir.display()),
            );
        }

        result
    }

    /// Validate a URL field
    fn validate_url(&self, url_str: &str, field_name: &str, result: &mut ValidationResult) {
        match Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    result.add_error(
                        field_name,
                        format!("URL must use http or https scheme, got: {}", url.scheme()),
                    );
                }

                if url.host().is_none() {
                    result.add_error(field_name, "URL must have a host");
                }
            }
            Err(e) => {
                result.add_error(field_name, format!("Invalid URL: {}", e));
            }
        }
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Save configuration to an explicit path
    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(config_path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Path of the weather database inside `data_dir`
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("weather.db")
    }

    /// Get the path to the configuration file
    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("stormwatch");

        Ok(config_dir.join("config.toml"))
    }
}
