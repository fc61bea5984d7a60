use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::{
    advice::AdviceClient,
    config::Config,
    database::{Database, DatabaseError, SavedLocation, VisitRecord},
    fetch_cache::FetchCache,
    geo,
    history::HistoryAggregator,
    rate_limit::{FixedWindowLimiter, RateDecision},
    resilience::{CircuitState, FetchError, ResilientClient},
    upstream::OpenWeatherClient,
};

// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub database: Arc<Database>,
    pub fetch_cache: Arc<FetchCache>,
    pub air_client: Arc<OpenWeatherClient>,
    pub resilient: Arc<ResilientClient>,
    pub advice_client: Arc<AdviceClient>,
    pub limiter: Arc<FixedWindowLimiter>,
    pub history: Arc<HistoryAggregator>,
}

// Request/Response types
#[derive(Debug, Deserialize)]
pub struct AirQualityQuery {
    pub lat: f64,
    pub lon: f64,
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub lat: f64,
    pub lon: f64,
    pub days: Option<i64>,
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct VisitHistoryQuery {
    pub user_id: String,
    pub days: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct UserQuery {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct VisitRequest {
    pub user_id: String,
    pub lat: f64,
    pub lon: f64,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct SaveLocationRequest {
    pub user_id: String,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Deserialize)]
pub struct AdviceRequest {
    pub weather: String,
    pub aqi: i64,
    #[serde(default)]
    pub components: HashMap<String, f64>,
    pub language: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AdviceResponse {
    pub advice: String,
    pub generated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub database: String,
    pub upstream_circuit: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Route-level failure carrying the status, a JSON body and, for rate
/// rejections, quota metadata for client-side backoff.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    rate: Option<RateDecision>,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            rate: None,
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", message)
    }

    fn rate_limited(decision: RateDecision) -> Self {
        let mut err = Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limited",
            "Too many requests",
        );
        err.rate = Some(decision);
        err
    }

    fn internal(err: impl std::fmt::Display) -> Self {
        tracing::error!(error = %err, "internal error");
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "Internal server error",
        )
    }
}

impl From<FetchError> for ApiError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Unavailable => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "upstream_unavailable",
                "Upstream temporarily unavailable",
            ),
            FetchError::Transient(msg) => {
                tracing::error!(error = %msg, "upstream retries exhausted");
                Self::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "upstream_transient",
                    "Upstream did not respond in time",
                )
            }
            FetchError::Rejected(msg) => {
                tracing::error!(error = %msg, "upstream rejected request");
                Self::new(
                    StatusCode::BAD_GATEWAY,
                    "upstream_rejected",
                    "Upstream rejected the request",
                )
            }
        }
    }
}

impl From<DatabaseError> for ApiError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::NotFound => {
                Self::new(StatusCode::NOT_FOUND, "not_found", "Record not found")
            }
            other => Self::internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.message,
            code: self.code.to_string(),
            timestamp: chrono::Utc::now(),
        };
        let mut response = (self.status, Json(body)).into_response();
        if let Some(rate) = self.rate {
            let headers = response.headers_mut();
            if let Ok(remaining) = HeaderValue::from_str(&rate.remaining.to_string()) {
                headers.insert("x-ratelimit-remaining", remaining);
            }
            if let Ok(reset) = HeaderValue::from_str(&rate.reset_at.timestamp().to_string()) {
                headers.insert("x-ratelimit-reset", reset);
            }
        }
        response
    }
}

/// Identity precedence: explicit user id if the caller supplied one, else
/// the peer address.
fn rate_identity(user_id: Option<&str>, addr: &SocketAddr) -> String {
    match user_id {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => addr.ip().to_string(),
    }
}

async fn enforce_rate_limit(
    state: &AppState,
    user_id: Option<&str>,
    addr: &SocketAddr,
) -> Result<(), ApiError> {
    let identity = rate_identity(user_id, addr);
    let decision = state.limiter.check(&identity).await;
    if !decision.allowed {
        tracing::warn!(identity, "rate limit exceeded");
        return Err(ApiError::rate_limited(decision));
    }
    Ok(())
}

fn validate_user_id(user_id: &str) -> Result<(), ApiError> {
    if user_id.is_empty() || user_id.len() > 100 {
        return Err(ApiError::bad_request("user_id must be 1-100 characters"));
    }
    Ok(())
}

fn validate_location_name(name: &str) -> Result<(), ApiError> {
    if name.is_empty() || name.len() > 200 {
        return Err(ApiError::bad_request("name must be 1-200 characters"));
    }
    Ok(())
}

fn validate_days(days: Option<i64>) -> Result<i64, ApiError> {
    let days = days.unwrap_or(7);
    if !(1..=30).contains(&days) {
        return Err(ApiError::bad_request("days must be between 1 and 30"));
    }
    Ok(days)
}

// Route handlers
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let database = match state.database.health_check().await {
        Ok(()) => "up".to_string(),
        Err(_) => "down".to_string(),
    };
    let upstream_circuit = match state.resilient.breaker().state() {
        CircuitState::Closed => "closed",
        CircuitState::Open => "open",
        CircuitState::HalfOpen => "half-open",
    };

    Json(HealthResponse {
        status: "healthy".to_string(),
        database,
        upstream_circuit: upstream_circuit.to_string(),
        timestamp: chrono::Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub async fn get_air_quality(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<AirQualityQuery>,
) -> Result<Json<Value>, ApiError> {
    geo::validate_coordinates(params.lat, params.lon).map_err(ApiError::bad_request)?;
    enforce_rate_limit(&state, params.user_id.as_deref(), &addr).await?;

    let key = geo::live_cache_key(params.lat, params.lon, state.config.live_coord_precision);
    let ttl = state.config.live_cache_ttl();
    let (lat, lon) = (params.lat, params.lon);

    let fetch_state = state.clone();
    let value = state
        .fetch_cache
        .get_or_fetch(&key, ttl, || async move {
            let reading = fetch_state
                .resilient
                .call(|| fetch_state.air_client.fetch_air_quality(lat, lon))
                .await?;

            // Fire-and-forget: a persistence failure must not fail the
            // response the user is waiting on.
            let database = fetch_state.database.clone();
            let persisted = reading.clone();
            tokio::spawn(async move {
                if let Err(err) = database.save_reading(&persisted).await {
                    tracing::error!(error = %err, "failed to persist air quality reading");
                }
            });

            serde_json::to_value(&reading)
                .map_err(|e| FetchError::Rejected(format!("unserializable reading: {}", e)))
        })
        .await?;

    Ok(Json(value))
}

pub async fn get_air_quality_history(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<HistoryQuery>,
) -> Result<Json<Value>, ApiError> {
    geo::validate_coordinates(params.lat, params.lon).map_err(ApiError::bad_request)?;
    enforce_rate_limit(&state, params.user_id.as_deref(), &addr).await?;

    let days = validate_days(params.days)?;
    let key = geo::history_cache_key(
        params.lat,
        params.lon,
        state.config.history_coord_precision,
        days,
    );
    let ttl = state.config.history_cache_ttl();
    let (lat, lon) = (params.lat, params.lon);

    let history = state.history.clone();
    let value = state
        .fetch_cache
        .get_or_fetch(&key, ttl, || async move {
            let averages = history
                .daily_averages(lat, lon, days)
                .await
                .map_err(|e| FetchError::Transient(format!("history query failed: {}", e)))?;
            serde_json::to_value(&averages)
                .map_err(|e| FetchError::Rejected(format!("unserializable history: {}", e)))
        })
        .await?;

    Ok(Json(value))
}

pub async fn get_visit_history(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<VisitHistoryQuery>,
) -> Result<Json<Value>, ApiError> {
    validate_user_id(&params.user_id)?;
    enforce_rate_limit(&state, Some(&params.user_id), &addr).await?;

    let days = validate_days(params.days)?;
    let key = geo::visits_cache_key(&params.user_id, days);
    let ttl = state.config.history_cache_ttl();

    let history = state.history.clone();
    let user_id = params.user_id.clone();
    let value = state
        .fetch_cache
        .get_or_fetch(&key, ttl, || async move {
            let summary = history
                .visit_summary(&user_id, days)
                .await
                .map_err(|e| FetchError::Transient(format!("visit query failed: {}", e)))?;
            serde_json::to_value(&summary)
                .map_err(|e| FetchError::Rejected(format!("unserializable summary: {}", e)))
        })
        .await?;

    Ok(Json(value))
}

pub async fn record_visit(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(request): Json<VisitRequest>,
) -> Result<(StatusCode, Json<VisitRecord>), ApiError> {
    validate_user_id(&request.user_id)?;
    validate_location_name(&request.name)?;
    geo::validate_coordinates(request.lat, request.lon).map_err(ApiError::bad_request)?;
    enforce_rate_limit(&state, Some(&request.user_id), &addr).await?;

    let visit = state
        .database
        .record_visit(&request.user_id, request.lat, request.lon, &request.name)
        .await?;

    Ok((StatusCode::CREATED, Json(visit)))
}

pub async fn list_saved_locations(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<UserQuery>,
) -> Result<Json<Vec<SavedLocation>>, ApiError> {
    validate_user_id(&params.user_id)?;
    enforce_rate_limit(&state, Some(&params.user_id), &addr).await?;

    let locations = state.database.saved_locations(&params.user_id).await?;
    Ok(Json(locations))
}

pub async fn save_location(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(request): Json<SaveLocationRequest>,
) -> Result<Json<SavedLocation>, ApiError> {
    validate_user_id(&request.user_id)?;
    validate_location_name(&request.name)?;
    geo::validate_coordinates(request.lat, request.lon).map_err(ApiError::bad_request)?;
    enforce_rate_limit(&state, Some(&request.user_id), &addr).await?;

    let location = state
        .database
        .upsert_saved_location(&request.user_id, &request.name, request.lat, request.lon)
        .await?;

    Ok(Json(location))
}

pub async fn delete_saved_location(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(name): Path<String>,
    Query(params): Query<UserQuery>,
) -> Result<StatusCode, ApiError> {
    validate_user_id(&params.user_id)?;
    enforce_rate_limit(&state, Some(&params.user_id), &addr).await?;

    state
        .database
        .delete_saved_location(&params.user_id, &name)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn generate_advice(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(request): Json<AdviceRequest>,
) -> Result<Json<AdviceResponse>, ApiError> {
    if !(1..=6).contains(&request.aqi) {
        return Err(ApiError::bad_request("aqi must be between 1 and 6"));
    }
    if request.weather.len() > 500 {
        return Err(ApiError::bad_request("weather summary too long"));
    }
    let language = request.language.as_deref().unwrap_or("es");
    if !matches!(language, "en" | "es") {
        return Err(ApiError::bad_request("language must be 'en' or 'es'"));
    }
    enforce_rate_limit(&state, request.user_id.as_deref(), &addr).await?;

    let prompt =
        AdviceClient::build_prompt(&request.weather, request.aqi, &request.components, language);
    let key = AdviceClient::cache_key(&prompt);
    let ttl = state.config.advice_cache_ttl();

    let advice_client = state.advice_client.clone();
    let value = state
        .fetch_cache
        .get_or_fetch(&key, ttl, || async move {
            let advice = advice_client.health_advice(&prompt).await?;
            Ok(Value::String(advice))
        })
        .await?;

    let advice = value
        .as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| ApiError::internal("advice cache entry was not a string"))?;

    Ok(Json(AdviceResponse {
        advice,
        generated_at: chrono::Utc::now(),
    }))
}

// Create the router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/air_quality", get(get_air_quality))
        .route("/api/air_quality/history", get(get_air_quality_history))
        .route("/api/history/visits", get(get_visit_history))
        .route("/api/visits", post(record_visit))
        .route("/api/locations", get(list_saved_locations).post(save_location))
        .route("/api/locations/:name", delete(delete_saved_location))
        .route("/api/advice", post(generate_advice))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::rate_limit::{MemoryCounterStore, WindowLimit};
    use crate::resilience::{CircuitBreaker, RetryPolicy};
    use std::time::Duration;

    fn test_config() -> Config {
        Config {
            openweather_api_key: "test-key".to_string(),
            openweather_base_url: "http://localhost".to_string(),
            openweather_air_pollution_path: "/air_pollution".to_string(),
            advice_api_key: String::new(),
            advice_base_url: "http://localhost".to_string(),
            advice_model: "test".to_string(),
            live_coord_precision: 4,
            history_coord_precision: 2,
            live_cache_ttl_secs: 900,
            history_cache_ttl_secs: 21_600,
            advice_cache_ttl_secs: 3600,
            upstream_timeout_secs: 10,
            retry_max_attempts: 3,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 10_000,
            breaker_failure_threshold: 5,
            breaker_reset_timeout_secs: 60,
            rate_limit_per_minute: 100,
            rate_limit_per_hour: 200,
            history_radius_km: 1.0,
        }
    }

    async fn state_with_limit(per_minute: u64) -> AppState {
        let config = test_config();
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        let database = Arc::new(Database::new(pool));
        database.init_tables().await.unwrap();

        AppState {
            config: Arc::new(config.clone()),
            database: database.clone(),
            fetch_cache: Arc::new(FetchCache::new(Arc::new(MemoryCache::default()))),
            air_client: Arc::new(OpenWeatherClient::new(config.clone()).unwrap()),
            resilient: Arc::new(ResilientClient::new(
                RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(10)),
                CircuitBreaker::new(5, Duration::from_secs(60)),
                Duration::from_secs(10),
            )),
            advice_client: Arc::new(AdviceClient::new(config).unwrap()),
            limiter: Arc::new(FixedWindowLimiter::new(
                Arc::new(MemoryCounterStore::default()),
                vec![WindowLimit::per_minute(per_minute)],
            )),
            history: Arc::new(HistoryAggregator::new(database, 1.0)),
        }
    }

    #[tokio::test]
    async fn test_saved_location_routes_enforce_rate_limit() {
        let state = state_with_limit(1).await;
        let addr: SocketAddr = "203.0.113.9:4321".parse().unwrap();
        let user = || UserQuery {
            user_id: "alice".to_string(),
        };

        let request = SaveLocationRequest {
            user_id: "alice".to_string(),
            name: "Home".to_string(),
            lat: 19.43,
            lon: -99.13,
        };
        let first = save_location(State(state.clone()), ConnectInfo(addr), Json(request)).await;
        assert!(first.is_ok());

        let err = list_saved_locations(State(state.clone()), ConnectInfo(addr), Query(user()))
            .await
            .err()
            .expect("second call for the same user is over quota");
        assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);

        let err = delete_saved_location(
            State(state),
            ConnectInfo(addr),
            Path("Home".to_string()),
            Query(user()),
        )
        .await
        .err()
        .expect("delete counts against the same quota");
        assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn test_rate_identity_prefers_user_id() {
        let addr: SocketAddr = "203.0.113.9:4321".parse().unwrap();
        assert_eq!(rate_identity(Some("alice"), &addr), "alice");
        assert_eq!(rate_identity(Some(""), &addr), "203.0.113.9");
        assert_eq!(rate_identity(None, &addr), "203.0.113.9");
    }

    #[test]
    fn test_days_validation() {
        assert_eq!(validate_days(None).unwrap(), 7);
        assert_eq!(validate_days(Some(14)).unwrap(), 14);
        assert_eq!(validate_days(Some(30)).unwrap(), 30);
        assert!(validate_days(Some(0)).is_err());
        assert!(validate_days(Some(31)).is_err());
        assert!(validate_days(Some(-1)).is_err());
    }

    #[test]
    fn test_field_validation() {
        assert!(validate_user_id("alice").is_ok());
        assert!(validate_user_id("").is_err());
        assert!(validate_user_id(&"x".repeat(101)).is_err());
        assert!(validate_location_name("Home").is_ok());
        assert!(validate_location_name(&"x".repeat(201)).is_err());
    }
}
