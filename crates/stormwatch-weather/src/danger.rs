//! Threshold rules for tomorrow's dangerous weather.

use std::fmt;

use chrono::{DateTime, Duration, FixedOffset, Utc};

use crate::types::ForecastPoint;

pub const LOW_TEMPERATURE_C: f64 = -30.0;
pub const HIGH_TEMPERATURE_C: f64 = 30.0;
pub const HEAVY_SNOW: f64 = 10.0;
pub const HEAVY_RAIN: f64 = 20.0;
pub const HIGH_WIND: f64 = 15.0;

/// A triggered rule and the aggregate that triggered it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WeatherWarning {
    LowTemperature(f64),
    HighTemperature(f64),
    HeavySnow(f64),
    HeavyRain(f64),
    HighWind(f64),
}

impl fmt::Display for WeatherWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LowTemperature(v) => write!(f, "Extreme cold: low of {:.1} °C", v),
            Self::HighTemperature(v) => write!(f, "Extreme heat: high of {:.1} °C", v),
            Self::HeavySnow(v) => write!(f, "Heavy snow: {:.1} mm expected", v),
            Self::HeavyRain(v) => write!(f, "Heavy rain: {:.1} mm expected", v),
            Self::HighWind(v) => write!(f, "High wind: gusts up to {:.1} m/s", v),
        }
    }
}

/// Aggregates over the evaluation window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowAggregate {
    pub min_temp: f64,
    pub max_temp: f64,
    pub max_wind: f64,
    pub total_rain: f64,
    pub total_snow: f64,
}

/// `[next local midnight, +24h)` as seen from `now`.
pub fn tomorrow_window(now: DateTime<FixedOffset>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let midnight = now
        .date_naive()
        .succ_opt()?
        .and_hms_opt(0, 0, 0)?
        .and_local_timezone(*now.offset())
        .single()?
        .with_timezone(&Utc);
    Some((midnight, midnight + Duration::hours(24)))
}

/// Aggregate the points of tomorrow's window; `None` when it has no points.
pub fn aggregate(points: &[ForecastPoint], now: DateTime<FixedOffset>) -> Option<WindowAggregate> {
    let (start, end) = tomorrow_window(now)?;
    let mut window = points
        .iter()
        .filter(|p| p.timestamp >= start && p.timestamp < end)
        .peekable();
    window.peek()?;

    let mut agg = WindowAggregate {
        min_temp: f64::INFINITY,
        max_temp: f64::NEG_INFINITY,
        max_wind: 0.0,
        total_rain: 0.0,
        total_snow: 0.0,
    };
    for point in window {
        agg.min_temp = agg.min_temp.min(point.temp_min);
        agg.max_temp = agg.max_temp.max(point.temp_max);
        agg.max_wind = agg.max_wind.max(point.wind.unwrap_or(0.0));
        agg.total_rain += point.rain.unwrap_or(0.0);
        agg.total_snow += point.snow.unwrap_or(0.0);
    }
    Some(agg)
}

/// Evaluate every rule against tomorrow's window. Rules are independent and
/// results keep a fixed order.
pub fn evaluate(points: &[ForecastPoint], now: DateTime<FixedOffset>) -> Vec<WeatherWarning> {
    let Some(agg) = aggregate(points, now) else {
        return Vec::new();
    };

    let mut warnings = Vec::new();
    if agg.min_temp <= LOW_TEMPERATURE_C {
        warnings.push(WeatherWarning::LowTemperature(agg.min_temp));
    }
    if agg.max_temp >= HIGH_TEMPERATURE_C {
        warnings.push(WeatherWarning::HighTemperature(agg.max_temp));
    }
    if agg.total_snow >= HEAVY_SNOW {
        warnings.push(WeatherWarning::HeavySnow(agg.total_snow));
    }
    if agg.total_rain >= HEAVY_RAIN {
        warnings.push(WeatherWarning::HeavyRain(agg.total_rain));
    }
    if agg.max_wind >= HIGH_WIND {
        warnings.push(WeatherWarning::HighWind(agg.max_wind));
    }
    warnings
}

/// Stable notification body: one line per warning. `None` for no warnings.
pub fn render_message(warnings: &[WeatherWarning]) -> Option<String> {
    if warnings.is_empty() {
        return None;
    }
    Some(
        warnings
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n"),
    )
}
