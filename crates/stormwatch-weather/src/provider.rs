//! Remote weather source and the OpenWeatherMap adapter.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use stormwatch_core::{NetworkError, ReqwestErrorExt, WeatherConfig};
use tracing::instrument;

use crate::clock::Clock;
use crate::error::{WeatherError, WeatherResult};
use crate::types::{CurrentObservation, ForecastPoint, ForecastSeries, LocationKey};

/// Remote provider of weather data. Implementations do not retry.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    async fn fetch_current(&self, key: &LocationKey) -> WeatherResult<CurrentObservation>;

    async fn fetch_forecast(&self, key: &LocationKey) -> WeatherResult<ForecastSeries>;
}

/// OpenWeatherMap client (metric units).
pub struct OpenWeatherProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    clock: Arc<dyn Clock>,
}

impl OpenWeatherProvider {
    pub fn new(config: &WeatherConfig, clock: Arc<dyn Clock>) -> WeatherResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| WeatherError::Network(e.into_network_error()))?;

        Ok(Self {
            client,
            api_key: config.resolved_api_key().unwrap_or_default(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            clock,
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        key: &LocationKey,
    ) -> WeatherResult<T> {
        let url = format!("{}/{}", self.base_url, endpoint);

        let response = self
            .client
            .get(&url)
            .query(&[
                ("q", key.as_str()),
                ("units", "metric"),
                ("appid", self.api_key.as_str()),
            ])
            .send()
            .await
            .map_err(|e| WeatherError::Network(e.into_network_error()))?;

        self.handle_response(response, key).await
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
        key: &LocationKey,
    ) -> WeatherResult<T> {
        let status = response.status();

        if status.is_success() {
            response.json().await.map_err(|e| {
                WeatherError::Network(NetworkError::InvalidResponse(format!(
                    "JSON parse error: {}",
                    e
                )))
            })
        } else if status.as_u16() == 404 {
            Err(WeatherError::NotFound(key.to_string()))
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(WeatherError::Network(NetworkError::ServerError {
                status: status.as_u16(),
                message: text,
            }))
        }
    }
}

#[async_trait]
impl RemoteSource for OpenWeatherProvider {
    #[instrument(skip(self), fields(location = %key), level = "debug")]
    async fn fetch_current(&self, key: &LocationKey) -> WeatherResult<CurrentObservation> {
        let resp: CurrentResponse = self.get("weather", key).await?;
        Ok(CurrentObservation {
            temperature: resp.main.temp,
            condition_icon: first_icon(&resp.weather),
            observed_at: self.clock.now_utc(),
        })
    }

    #[instrument(skip(self), fields(location = %key), level = "debug")]
    async fn fetch_forecast(&self, key: &LocationKey) -> WeatherResult<ForecastSeries> {
        let resp: ForecastResponse = self.get("forecast", key).await?;
        let items = resp
            .list
            .into_iter()
            .map(ForecastPoint::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!("Fetched {} forecast points for {}", items.len(), key);
        Ok(ForecastSeries {
            items,
            observed_at: self.clock.now_utc(),
        })
    }
}

// Wire format

#[derive(Debug, Deserialize)]
struct ApiCondition {
    icon: String,
}

#[derive(Debug, Deserialize)]
struct CurrentMain {
    temp: f64,
}

#[derive(Debug, Deserialize)]
struct CurrentResponse {
    main: CurrentMain,
    #[serde(default)]
    weather: Vec<ApiCondition>,
}

#[derive(Debug, Deserialize)]
struct ForecastMain {
    temp_min: f64,
    temp_max: f64,
}

#[derive(Debug, Deserialize)]
struct ApiWind {
    speed: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ApiPrecipitation {
    #[serde(rename = "3h")]
    three_hours: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ApiForecastItem {
    dt: i64,
    main: ForecastMain,
    #[serde(default)]
    weather: Vec<ApiCondition>,
    wind: Option<ApiWind>,
    rain: Option<ApiPrecipitation>,
    snow: Option<ApiPrecipitation>,
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    #[serde(default)]
    list: Vec<ApiForecastItem>,
}

impl TryFrom<ApiForecastItem> for ForecastPoint {
    type Error = WeatherError;

    fn try_from(item: ApiForecastItem) -> Result<Self, Self::Error> {
        let timestamp = DateTime::<Utc>::from_timestamp(item.dt, 0).ok_or_else(|| {
            WeatherError::Network(NetworkError::InvalidResponse(format!(
                "forecast timestamp out of range: {}",
                item.dt
            )))
        })?;

        Ok(ForecastPoint {
            timestamp,
            temp_max: item.main.temp_max,
            temp_min: item.main.temp_min,
            condition_icon: first_icon(&item.weather),
            wind: item.wind.and_then(|w| w.speed),
            rain: item.rain.and_then(|r| r.three_hours),
            snow: item.snow.and_then(|s| s.three_hours),
        })
    }
}

fn first_icon(conditions: &[ApiCondition]) -> String {
    conditions
        .first()
        .map(|c| c.icon.clone())
        .unwrap_or_default()
}
