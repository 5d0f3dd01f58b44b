//! Groups forecast points into local calendar days.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::Serialize;

use crate::types::{ForecastPoint, WeatherCondition};

/// Aggregated weather for one local day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DaySummary {
    pub date: NaiveDate,
    pub temp_min: f64,
    pub temp_max: f64,
    /// Most frequent icon of the day; ties go to the earliest occurrence.
    pub condition_icon: String,
    pub max_wind: f64,
    pub total_rain: f64,
    pub total_snow: f64,
}

impl DaySummary {
    pub fn condition(&self) -> WeatherCondition {
        WeatherCondition::from_icon(&self.condition_icon)
    }
}

/// Bucket `points` by calendar date in the offset of `now`.
///
/// When `skip_today` is set, the bucket for `now`'s own date is dropped so
/// the result starts at tomorrow.
pub fn daily_summaries(
    points: &[ForecastPoint],
    now: DateTime<FixedOffset>,
    skip_today: bool,
) -> Vec<DaySummary> {
    let offset = *now.offset();
    let today = now.date_naive();

    let mut days: BTreeMap<NaiveDate, Vec<&ForecastPoint>> = BTreeMap::new();
    for point in points {
        let date = point.timestamp.with_timezone(&offset).date_naive();
        if skip_today && date == today {
            continue;
        }
        days.entry(date).or_default().push(point);
    }

    days.into_iter()
        .map(|(date, mut day)| {
            day.sort_by_key(|p| p.timestamp);
            summarize(date, &day)
        })
        .collect()
}

fn summarize(date: NaiveDate, day: &[&ForecastPoint]) -> DaySummary {
    let temp_min = day.iter().map(|p| p.temp_min).fold(f64::INFINITY, f64::min);
    let temp_max = day
        .iter()
        .map(|p| p.temp_max)
        .fold(f64::NEG_INFINITY, f64::max);

    DaySummary {
        date,
        temp_min,
        temp_max,
        condition_icon: dominant_icon(day),
        max_wind: day.iter().map(|p| p.wind.unwrap_or(0.0)).fold(0.0, f64::max),
        total_rain: day.iter().map(|p| p.rain.unwrap_or(0.0)).sum(),
        total_snow: day.iter().map(|p| p.snow.unwrap_or(0.0)).sum(),
    }
}

fn dominant_icon(day: &[&ForecastPoint]) -> String {
    // icon -> (count, first position)
    let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
    for (position, point) in day.iter().enumerate() {
        counts
            .entry(point.condition_icon.as_str())
            .or_insert((0, position))
            .0 += 1;
    }

    counts
        .into_iter()
        .max_by(|(_, (count_a, first_a)), (_, (count_b, first_b))| {
            count_a.cmp(count_b).then(first_b.cmp(first_a))
        })
        .map(|(icon, _)| icon.to_string())
        .unwrap_or_default()
}
