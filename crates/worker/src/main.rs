//! Herald worker: delivery consumers plus the reconciliation sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use herald_common::config::AppConfig;
use herald_common::db;
use herald_common::redis_pool::create_redis_pool;
use herald_engine::broker::RedisBroker;
use herald_engine::counter::RedisCounterStore;
use herald_engine::finalizer::CompletionFinalizer;
use herald_engine::reaper::InFlightReaper;
use herald_engine::reconcile::ReconciliationSweep;
use herald_engine::scheduler::{PeriodicJob, SingleRunner};
use herald_engine::store::PgDispatchStore;
use herald_engine::worker::DeliveryWorker;
use herald_notifier::callback::HttpCallbackClient;
use herald_notifier::provider::HttpProvider;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald_worker=info,herald_engine=info,herald_notifier=info".into()),
        )
        .json()
        .init();

    tracing::info!("Herald worker starting...");

    let config = AppConfig::from_env()?;

    let pool = db::connect(&config).await?;
    let redis = create_redis_pool(&config.redis_url).await?;

    let store = Arc::new(PgDispatchStore::new(pool));
    let counter = Arc::new(RedisCounterStore::new(redis.clone()));
    let broker = RedisBroker::new(redis, config.topology.clone());

    let provider = Arc::new(HttpProvider::new(
        config.provider_base_url.clone(),
        Duration::from_millis(config.provider_timeout_ms),
        config.dispatch.client_cache_ttl(),
        config.dispatch.client_cache_capacity,
    )?);
    let callback = Arc::new(HttpCallbackClient::new(
        config.callback_base_url.clone(),
        Duration::from_millis(config.callback_timeout_ms),
    )?);

    let finalizer = Arc::new(CompletionFinalizer::new(
        store.clone(),
        counter.clone(),
        Arc::new(broker.clone()),
        callback,
    ));

    let shutdown = CancellationToken::new();
    let mut tasks = JoinSet::new();

    for n in 0..config.worker_concurrency.max(1) {
        // each consumer owns an in-flight list; leftovers from a previous
        // run of the same consumer go back to the live queue first
        let consumer = broker.consumer(format!("{}-{}", config.worker_name, n));
        consumer.recover_in_flight().await?;

        let worker = DeliveryWorker::new(
            Arc::new(consumer),
            counter.clone(),
            store.clone(),
            provider.clone(),
            finalizer.clone(),
            config.dispatch.clone(),
            config.topology.routing_key.clone(),
        );
        let token = shutdown.clone();
        tasks.spawn(async move { worker.run(token).await });
    }
    tracing::info!(
        consumers = config.worker_concurrency.max(1),
        worker_name = %config.worker_name,
        "Delivery consumers started"
    );

    let sweep: Arc<dyn PeriodicJob> = Arc::new(ReconciliationSweep::new(
        store.clone(),
        counter.clone(),
        config.dispatch.stale_after(),
    ));
    let runner = SingleRunner::new(counter.clone(), config.dispatch.single_runner_ttl());
    let interval = config.dispatch.reconcile_interval();
    let token = shutdown.clone();
    tasks.spawn(async move { runner.run_every(sweep, interval, token).await });

    // in-flight lists of consumers that never restart under their old name
    let visibility = config.dispatch.in_flight_timeout();
    let reaper: Arc<dyn PeriodicJob> = Arc::new(InFlightReaper::new(Arc::new(broker), visibility));
    let reaper_runner = SingleRunner::new(counter, visibility);
    let token = shutdown.clone();
    tasks.spawn(async move { reaper_runner.run_every(reaper, visibility, token).await });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping gracefully...");
    shutdown.cancel();

    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            tracing::error!(error = %e, "Worker task panicked");
        }
    }

    tracing::info!("Herald worker stopped.");
    Ok(())
}

