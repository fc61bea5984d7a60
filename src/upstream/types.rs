use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

/// Cleaned reading served to callers and persisted by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AirQualityReading {
    pub coordinates: Coordinates,
    /// OpenWeather air quality index, 1 (good) to 5 (very poor).
    pub aqi: i64,
    /// Pollutant concentrations in μg/m³ (co, no2, o3, pm2_5, pm10, ...).
    pub components: HashMap<String, f64>,
    pub captured_at: DateTime<Utc>,
}

// Raw OpenWeather air_pollution envelope

#[derive(Debug, Clone, Deserialize)]
pub struct AirPollutionResponse {
    pub coord: Option<Coordinates>,
    #[serde(default)]
    pub list: Vec<AirPollutionEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AirPollutionEntry {
    pub main: AirPollutionIndex,
    #[serde(default)]
    pub components: HashMap<String, f64>,
    pub dt: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AirPollutionIndex {
    pub aqi: i64,
}
