use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stormwatch_core::LocationError;

/// Canonical identifier for a tracked location.
///
/// Keeps the name as the user typed it (trimmed) for display and remote
/// queries, but compares and hashes case-insensitively so "Paris" and
/// "paris" are the same key everywhere: memory cache, database and alerts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct LocationKey {
    name: String,
    canonical: String,
}

impl LocationKey {
    pub fn new(name: impl AsRef<str>) -> Self {
        let name = name.as_ref().trim().to_string();
        let canonical = name.to_lowercase();
        Self { name, canonical }
    }

    /// Validate user input into a key.
    pub fn parse(name: &str) -> Result<Self, LocationError> {
        if name.trim().is_empty() {
            return Err(LocationError::InvalidName(name.to_string()));
        }
        Ok(Self::new(name))
    }

    /// Name as entered by the user.
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// Lowercased form used for equality and as the database key.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }
}

impl PartialEq for LocationKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for LocationKey {}

impl Hash for LocationKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl fmt::Display for LocationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl From<String> for LocationKey {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl From<&str> for LocationKey {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<LocationKey> for String {
    fn from(key: LocationKey) -> Self {
        key.name
    }
}

/// Display position of a tracked location, assigned once on first persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OrderIndex(pub i64);

/// Current conditions at a location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentObservation {
    pub temperature: f64,
    pub condition_icon: String,
    pub observed_at: DateTime<Utc>,
}

/// One step of a forecast window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub timestamp: DateTime<Utc>,
    pub temp_max: f64,
    pub temp_min: f64,
    pub condition_icon: String,
    pub wind: Option<f64>,
    pub rain: Option<f64>,
    pub snow: Option<f64>,
}

/// A complete forecast window as delivered by the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastSeries {
    pub items: Vec<ForecastPoint>,
    pub observed_at: DateTime<Utc>,
}

/// Cached weather for one location. Either half may be missing.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: LocationKey,
    pub current: Option<CurrentObservation>,
    pub forecast: Option<ForecastSeries>,
}

impl CacheEntry {
    pub fn empty(key: LocationKey) -> Self {
        Self {
            key,
            current: None,
            forecast: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_none() && self.forecast.is_none()
    }
}

/// Weather condition categories mapped from OpenWeatherMap icon codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WeatherCondition {
    #[default]
    Clear,
    PartlyCloudy,
    Cloudy,
    Fog,
    Showers,
    Rain,
    Snow,
    Thunderstorm,
}

impl WeatherCondition {
    /// Convert an icon code such as "10d" to a condition.
    /// See: https://openweathermap.org/weather-conditions
    pub fn from_icon(icon: &str) -> Self {
        match icon.get(..2) {
            Some("01") => Self::Clear,
            Some("02") => Self::PartlyCloudy,
            Some("03") | Some("04") => Self::Cloudy,
            Some("09") => Self::Showers,
            Some("10") => Self::Rain,
            Some("11") => Self::Thunderstorm,
            Some("13") => Self::Snow,
            Some("50") => Self::Fog,
            _ => Self::Clear, // Unknown codes default to clear
        }
    }

    /// Get a human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            Self::Clear => "Clear",
            Self::PartlyCloudy => "Partly Cloudy",
            Self::Cloudy => "Cloudy",
            Self::Fog => "Fog",
            Self::Showers => "Showers",
            Self::Rain => "Rain",
            Self::Snow => "Snow",
            Self::Thunderstorm => "Thunderstorm",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_key_equality_ignores_case() {
        assert_eq!(LocationKey::new("Paris"), LocationKey::new("paris"));
        assert_eq!(LocationKey::new("  PARIS "), LocationKey::new("paris"));
        assert_ne!(LocationKey::new("Paris"), LocationKey::new("Parish"));
    }

    #[test]
    fn test_key_hash_ignores_case() {
        let mut set = HashSet::new();
        set.insert(LocationKey::new("Oslo"));
        assert!(set.contains(&LocationKey::new("OSLO")));
        assert!(!set.insert(LocationKey::new("oslo")));
    }

    #[test]
    fn test_key_keeps_display_casing() {
        let key = LocationKey::new(" New York ");
        assert_eq!(key.as_str(), "New York");
        assert_eq!(key.canonical(), "new york");
        assert_eq!(key.to_string(), "New York");
    }

    #[test]
    fn test_parse_rejects_blank_names() {
        assert!(LocationKey::parse("   ").is_err());
        assert!(LocationKey::parse("Lima").is_ok());
    }

    #[test]
    fn test_icon_mapping() {
        assert_eq!(WeatherCondition::from_icon("01d"), WeatherCondition::Clear);
        assert_eq!(WeatherCondition::from_icon("02n"), WeatherCondition::PartlyCloudy);
        assert_eq!(WeatherCondition::from_icon("04d"), WeatherCondition::Cloudy);
        assert_eq!(WeatherCondition::from_icon("09d"), WeatherCondition::Showers);
        assert_eq!(WeatherCondition::from_icon("10n"), WeatherCondition::Rain);
        assert_eq!(WeatherCondition::from_icon("11d"), WeatherCondition::Thunderstorm);
        assert_eq!(WeatherCondition::from_icon("13d"), WeatherCondition::Snow);
        assert_eq!(WeatherCondition::from_icon("50d"), WeatherCondition::Fog);
    }

    #[test]
    fn test_unknown_icon_defaults_to_clear() {
        assert_eq!(WeatherCondition::from_icon(""), WeatherCondition::Clear);
        assert_eq!(WeatherCondition::from_icon("99x"), WeatherCondition::Clear);
    }

    #[test]
    fn test_condition_description() {
        assert_eq!(WeatherCondition::Clear.description(), "Clear");
        assert_eq!(WeatherCondition::Thunderstorm.description(), "Thunderstorm");
    }
}
