//! Gatekeeper API server

use gatekeeper_api::search::HttpSearchBackend;
use gatekeeper_api::usage_recorder::background_worker;
use gatekeeper_api::{router, AppState, ServerConfig};
use gatekeeper_core::SystemClock;
use gatekeeper_storage::{CounterStore, MemoryCounterStore, SqliteDirectory, TenantDirectory};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,gatekeeper_api=debug")),
        )
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "Gatekeeper exited with error");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig::from_env();
    config.validate()?;

    tracing::info!(db_path = %config.db_path, "Opening tenant directory");
    let directory = Arc::new(SqliteDirectory::open(&config.db_path)?);
    let clock = Arc::new(SystemClock);

    let store = counter_store(&config, clock.clone()).await?;
    let backend = Arc::new(HttpSearchBackend::new(
        &config.search_url,
        config.search_timeout,
    )?);

    let (state, jobs) = AppState::build(directory.clone(), store, backend, clock, &config);
    let worker_directory: Arc<dyn TenantDirectory> = directory;
    let worker = tokio::spawn(background_worker(
        jobs,
        worker_directory,
        config.timeouts.directory,
    ));

    let app = router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, search_url = %config.search_url, "Gatekeeper listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Router (and every queue sender it held) is gone; let the worker drain.
    if let Err(e) = worker.await {
        tracing::warn!(error = %e, "Background worker did not shut down cleanly");
    }
    tracing::info!("Gatekeeper stopped");
    Ok(())
}

/// Idle sweep period for the in-process counter store.
const MEMORY_PURGE_PERIOD: Duration = Duration::from_secs(60);

async fn counter_store(
    config: &ServerConfig,
    clock: Arc<SystemClock>,
) -> Result<Arc<dyn CounterStore>, Box<dyn std::error::Error>> {
    match config.redis_url.as_deref() {
        #[cfg(feature = "redis-store")]
        Some(url) => {
            let store = gatekeeper_storage::RedisCounterStore::connect(url).await?;
            tracing::info!("Using Redis counter store");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis-store"))]
        Some(_) => Err("GATEKEEPER_REDIS_URL is set but the redis-store feature is disabled".into()),
        None => {
            tracing::warn!(
                "GATEKEEPER_REDIS_URL not set; counters are per-process and limits are not shared across replicas"
            );
            let store = Arc::new(MemoryCounterStore::new(clock));
            // Holds a weak handle and stops once the store is dropped.
            store.spawn_purger(MEMORY_PURGE_PERIOD);
            Ok(store)
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
