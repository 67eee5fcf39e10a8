//! Scholar mail worker entry point.

use std::sync::Arc;

use anyhow::Context;
use scholar_common::Config;
use scholar_core::DispatchService;
use scholar_core::providers::ProviderFactory;
use scholar_queue::{
    MaintenanceConfig, MemoryQueueStore, PgQueueStore, QueueStore, RateLimiter, RedisRateLimiter,
    RetryPolicy, WindowRateLimiter, WorkerPool, WorkerPoolConfig, run_maintenance,
};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Waits for a shutdown signal (SIGINT or SIGTERM).
///
/// On Unix systems, this listens for both SIGINT (Ctrl+C) and SIGTERM.
/// On Windows, this only listens for Ctrl+C.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT, draining workers...");
        },
        () = terminate => {
            info!("Received SIGTERM, draining workers...");
        },
    }
}

async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn QueueStore>> {
    let Some(database) = &config.database else {
        warn!("No database configured, jobs are kept in memory and lost on restart");
        return Ok(Arc::new(MemoryQueueStore::new()));
    };

    let db = scholar_db::init(database)
        .await
        .context("failed to connect to database")?;
    info!("Connected to database");

    info!("Running database migrations...");
    scholar_db::migrate(&db)
        .await
        .context("failed to run migrations")?;
    info!("Migrations completed");

    Ok(Arc::new(PgQueueStore::new(Arc::new(db))))
}

async fn open_limiter(config: &Config) -> anyhow::Result<Arc<dyn RateLimiter>> {
    let Some(redis) = &config.redis else {
        info!(
            per_minute = config.rate_limit.per_minute,
            per_hour = config.rate_limit.per_hour,
            "Using in-process rate limiter"
        );
        return Ok(Arc::new(WindowRateLimiter::new(&config.rate_limit)));
    };

    let limiter = RedisRateLimiter::connect(redis, &config.rate_limit)
        .await
        .context("failed to connect to Redis")?;
    Ok(Arc::new(limiter))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scholar=debug".into()),
        )
        .init();

    info!("Starting scholar mail worker...");

    let config = Config::load().context("failed to load configuration")?;

    // Bad credentials must stop us before any job is claimed
    let provider = ProviderFactory::from_config(&config.mail).await?;
    let dispatcher = DispatchService::from_config(provider, &config.mail);

    let check = dispatcher.verify_connection().await;
    if check.success {
        info!(provider = %dispatcher.provider_kind(), "Provider connection verified");
    } else {
        warn!(
            provider = %dispatcher.provider_kind(),
            error = check.error.as_deref().unwrap_or("unknown"),
            "Provider connection check failed, starting anyway"
        );
    }

    let store = open_store(&config).await?;
    let limiter = open_limiter(&config).await?;
    let retry = RetryPolicy::from(&config.retry);

    let maintenance = run_maintenance(MaintenanceConfig::from(&config.queue), Arc::clone(&store));
    let pool = WorkerPool::spawn(
        WorkerPoolConfig::from(&config.queue),
        store,
        limiter,
        dispatcher,
        retry,
    );
    info!(workers = pool.worker_count(), "Scholar mail worker running");

    shutdown_signal().await;

    maintenance.abort();
    pool.shutdown().await;

    info!("Shutdown complete");
    Ok(())
}
