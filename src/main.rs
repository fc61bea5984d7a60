use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod advice;
mod cache;
mod config;
mod database;
mod fetch_cache;
mod geo;
mod history;
mod rate_limit;
mod resilience;
mod routes;
mod upstream;

use advice::AdviceClient;
use cache::MemoryCache;
use config::Config;
use database::Database;
use fetch_cache::FetchCache;
use history::HistoryAggregator;
use rate_limit::{FixedWindowLimiter, MemoryCounterStore, WindowLimit};
use resilience::{CircuitBreaker, ResilientClient, RetryPolicy};
use routes::{create_router, AppState};
use upstream::OpenWeatherClient;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "airwatch_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "sqlite:./airwatch.db".to_string());
    let pool = sqlx::SqlitePool::connect(&database_url).await?;
    let database = Arc::new(Database::new(pool));
    database.init_tables().await?;

    // Every component is constructed once here and handed to the router;
    // nothing below holds process-global state except the breaker inside
    // the resilient client.
    let fetch_cache = Arc::new(FetchCache::new(Arc::new(MemoryCache::default())));

    let air_client = Arc::new(OpenWeatherClient::new(config.clone())?);
    let resilient = Arc::new(ResilientClient::new(
        RetryPolicy::new(
            config.retry_max_attempts,
            Duration::from_millis(config.retry_base_delay_ms),
            Duration::from_millis(config.retry_max_delay_ms),
        ),
        CircuitBreaker::new(
            config.breaker_failure_threshold,
            Duration::from_secs(config.breaker_reset_timeout_secs),
        ),
        Duration::from_secs(config.upstream_timeout_secs),
    ));

    let advice_client = Arc::new(AdviceClient::new(config.clone())?);

    let limiter = Arc::new(FixedWindowLimiter::new(
        Arc::new(MemoryCounterStore::default()),
        vec![
            WindowLimit::per_minute(config.rate_limit_per_minute),
            WindowLimit::per_hour(config.rate_limit_per_hour),
        ],
    ));

    let history = Arc::new(HistoryAggregator::new(
        database.clone(),
        config.history_radius_km,
    ));

    let state = AppState {
        config: Arc::new(config),
        database,
        fetch_cache,
        air_client,
        resilient,
        advice_client,
        limiter,
        history,
    };

    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
    tracing::info!("Server starting on http://0.0.0.0:8080");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
