use super::types::*;
use crate::config::Config;
use crate::resilience::FetchError;
use chrono::{TimeZone, Utc};
use reqwest::Client;
use std::time::Duration;

/// Thin client for the OpenWeather air_pollution endpoint. One call, one
/// HTTP request; retries, timeouts beyond the socket level and circuit
/// breaking belong to the `ResilientClient` wrapping this.
pub struct OpenWeatherClient {
    client: Client,
    config: Config,
}

impl OpenWeatherClient {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent("AirwatchServer/1.0")
            .timeout(Duration::from_secs(config.upstream_timeout_secs))
            .build()?;

        Ok(Self { client, config })
    }

    pub async fn fetch_air_quality(
        &self,
        lat: f64,
        lon: f64,
    ) -> Result<AirQualityReading, FetchError> {
        let url = format!(
            "{}{}",
            self.config.openweather_base_url, self.config.openweather_air_pollution_path
        );

        let response = self
            .client
            .get(&url)
            .query(&[
                ("lat", lat.to_string()),
                ("lon", lon.to_string()),
                ("appid", self.config.openweather_api_key.clone()),
            ])
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let envelope: AirPollutionResponse = response
            .json()
            .await
            .map_err(|e| FetchError::Rejected(format!("malformed upstream payload: {}", e)))?;

        extract_reading(envelope, lat, lon)
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> FetchError {
    // Anything that never produced a well-formed response is worth retrying
    FetchError::Transient(err.to_string())
}

fn classify_status(status: reqwest::StatusCode, body: &str) -> FetchError {
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        FetchError::Transient(format!("upstream HTTP {}", status))
    } else {
        FetchError::Rejected(format!("upstream HTTP {}: {}", status, body))
    }
}

/// Extract the first measurement from the envelope. A degraded envelope
/// (empty or absent `list`) is a well-formed error response, not something
/// a retry can fix.
fn extract_reading(
    envelope: AirPollutionResponse,
    lat: f64,
    lon: f64,
) -> Result<AirQualityReading, FetchError> {
    let entry = envelope
        .list
        .into_iter()
        .next()
        .ok_or_else(|| FetchError::Rejected("upstream returned no measurements".to_string()))?;

    let captured_at = entry
        .dt
        .and_then(|dt| Utc.timestamp_opt(dt, 0).single())
        .unwrap_or_else(Utc::now);

    Ok(AirQualityReading {
        coordinates: envelope.coord.unwrap_or(Coordinates { lat, lon }),
        aqi: entry.main.aqi,
        components: entry.components,
        captured_at,
    })
}
