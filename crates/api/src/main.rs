//! Herald API server binary entrypoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use herald_common::config::AppConfig;
use herald_common::db;
use herald_common::redis_pool::create_redis_pool;
use herald_engine::broker::RedisBroker;
use herald_engine::counter::RedisCounterStore;
use herald_engine::finalizer::CompletionFinalizer;
use herald_engine::planner::DispatchPlanner;
use herald_engine::store::PgDispatchStore;
use herald_notifier::callback::HttpCallbackClient;

use herald_api::routes::create_router;
use herald_api::state::AppState;

/// Send requests carry one entry per recipient; cap them well above any real batch.
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("herald_api=debug,herald_engine=debug,tower_http=debug")
        }))
        .init();

    tracing::info!("Starting Herald API server...");

    let config = AppConfig::from_env()?;

    let pool = db::connect(&config).await?;

    let redis = create_redis_pool(&config.redis_url).await?;

    let store = Arc::new(PgDispatchStore::new(pool));
    let counter = Arc::new(RedisCounterStore::new(redis.clone()));
    let broker = Arc::new(RedisBroker::new(redis, config.topology.clone()));
    let callback = Arc::new(HttpCallbackClient::new(
        config.callback_base_url.clone(),
        Duration::from_millis(config.callback_timeout_ms),
    )?);

    let finalizer = Arc::new(CompletionFinalizer::new(
        store.clone(),
        counter.clone(),
        broker.clone(),
        callback,
    ));
    let planner = Arc::new(DispatchPlanner::new(
        store.clone(),
        counter,
        broker,
        finalizer,
        config.dispatch.clone(),
        &config.topology,
    ));

    let state = AppState::new(store, planner);

    let app = create_router(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    tracing::info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Received shutdown signal, stopping gracefully...");
        })
        .await?;

    Ok(())
}
