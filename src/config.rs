use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub openweather_api_key: String,
    pub openweather_base_url: String,
    pub openweather_air_pollution_path: String,
    pub advice_api_key: String,
    pub advice_base_url: String,
    pub advice_model: String,

    /// Decimal places kept when quantizing coordinates for live cache keys.
    pub live_coord_precision: u32,
    /// Decimal places kept when quantizing coordinates for history cache keys.
    pub history_coord_precision: u32,

    pub live_cache_ttl_secs: u64,
    pub history_cache_ttl_secs: u64,
    pub advice_cache_ttl_secs: u64,

    pub upstream_timeout_secs: u64,
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub breaker_failure_threshold: u32,
    pub breaker_reset_timeout_secs: u64,

    pub rate_limit_per_minute: u64,
    pub rate_limit_per_hour: u64,

    pub history_radius_km: f64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Config {
            openweather_api_key: env::var("OPENWEATHER_API_KEY")
                .map_err(|_| anyhow::anyhow!("OPENWEATHER_API_KEY not set"))?,
            openweather_base_url: env::var("OPENWEATHER_BASE_URL")
                .unwrap_or_else(|_| "https://api.openweathermap.org/data/2.5".to_string()),
            openweather_air_pollution_path: env::var("OPENWEATHER_AIR_POLLUTION_PATH")
                .unwrap_or_else(|_| "/air_pollution".to_string()),
            advice_api_key: env::var("ADVICE_API_KEY").unwrap_or_default(),
            advice_base_url: env::var("ADVICE_BASE_URL")
                .unwrap_or_else(|_| "https://openrouter.ai/api/v1/chat/completions".to_string()),
            advice_model: env::var("ADVICE_MODEL")
                .unwrap_or_else(|_| "google/gemini-2.5-flash-lite".to_string()),
            live_coord_precision: parse_env("LIVE_COORD_PRECISION", 4),
            history_coord_precision: parse_env("HISTORY_COORD_PRECISION", 2),
            live_cache_ttl_secs: parse_env("LIVE_CACHE_TTL_SECS", 15 * 60),
            history_cache_ttl_secs: parse_env("HISTORY_CACHE_TTL_SECS", 6 * 60 * 60),
            advice_cache_ttl_secs: parse_env("ADVICE_CACHE_TTL_SECS", 60 * 60),
            upstream_timeout_secs: parse_env("UPSTREAM_TIMEOUT_SECS", 10),
            retry_max_attempts: parse_env("RETRY_MAX_ATTEMPTS", 3),
            retry_base_delay_ms: parse_env("RETRY_BASE_DELAY_MS", 1000),
            retry_max_delay_ms: parse_env("RETRY_MAX_DELAY_MS", 10_000),
            breaker_failure_threshold: parse_env("BREAKER_FAILURE_THRESHOLD", 5),
            breaker_reset_timeout_secs: parse_env("BREAKER_RESET_TIMEOUT_SECS", 60),
            rate_limit_per_minute: parse_env("RATE_LIMIT_PER_MINUTE", 100),
            rate_limit_per_hour: parse_env("RATE_LIMIT_PER_HOUR", 200),
            history_radius_km: parse_env("HISTORY_RADIUS_KM", 1.0),
        })
    }

    pub fn live_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.live_cache_ttl_secs)
    }

    pub fn history_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.history_cache_ttl_secs)
    }

    pub fn advice_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.advice_cache_ttl_secs)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
