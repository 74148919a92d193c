//! `orbital-worker` -- claims calculation jobs and runs them.
//!
//! Configuration is read from the environment (see [`WorkerConfig`]); a
//! `.env` file in the working directory is loaded first if present.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use orbital_core::execution::ExecutionAdapter;
use orbital_core::status::WorkerStatus;
use orbital_worker::active::ActiveJobs;
use orbital_worker::config::LogFormat;
use orbital_worker::heartbeat::Heartbeat;
use orbital_worker::{reaper, relay, Worker, WorkerConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long each auxiliary loop gets to stop after cancellation.
const LOOP_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let log_format: LogFormat = std::env::var("LOG_FORMAT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_default();
    init_tracing(log_format);

    // --- Configuration ---
    let config = Arc::new(WorkerConfig::from_env().context("Invalid worker configuration")?);
    tracing::info!(
        worker_id = %config.worker_id,
        queue = %config.queue_name,
        max_concurrent_jobs = config.max_concurrent_jobs,
        job_timeout_secs = config.job_timeout.as_secs(),
        "Loaded worker configuration",
    );

    // --- Database ---
    let pool = orbital_db::create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("Failed to connect to database")?;
    orbital_db::health_check(&pool)
        .await
        .context("Database health check failed")?;
    orbital_db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database ready");

    // --- Queue ---
    let queue = orbital_db::queue::select_strategy(&pool, config.queue_strategy, &config.queue_name)
        .await
        .context("Failed to initialise queue")?;

    // --- Presence ---
    let active = ActiveJobs::new();
    let heartbeat = Heartbeat::new(pool.clone(), Arc::clone(&config), active.clone(), queue.strategy());
    heartbeat
        .register()
        .await
        .context("Failed to register worker presence")?;

    // --- Background loops ---
    let cancel = CancellationToken::new();

    let heartbeat_handle = tokio::spawn(heartbeat.clone().run(cancel.clone()));
    let relay_handle = tokio::spawn(relay::run(
        pool.clone(),
        Arc::clone(&queue),
        config.relay_interval,
        cancel.clone(),
    ));
    let reaper_handle = tokio::spawn(reaper::run(
        pool.clone(),
        Arc::clone(&queue),
        Arc::clone(&config),
        cancel.clone(),
    ));

    let runner = Arc::new(ExecutionAdapter::new(config.calculation.clone()));
    let worker = Arc::new(Worker::new(
        pool.clone(),
        Arc::clone(&queue),
        runner,
        Arc::clone(&config),
        active,
    ));
    let poller_handle = tokio::spawn(Arc::clone(&worker).run(cancel.clone()));

    // --- Shutdown ---
    shutdown_signal().await;
    heartbeat.mark(WorkerStatus::Draining).await;
    cancel.cancel();

    // The poller drains in-flight jobs itself, bounded by SHUTDOWN_TIMEOUT_SECS.
    if let Err(e) = poller_handle.await {
        tracing::error!(error = %e, "Worker poller task panicked");
    }
    for (name, handle) in [
        ("relay", relay_handle),
        ("reaper", reaper_handle),
        ("heartbeat", heartbeat_handle),
    ] {
        if tokio::time::timeout(LOOP_STOP_TIMEOUT, handle).await.is_err() {
            tracing::warn!(task = name, "Background loop did not stop in time");
        }
    }

    heartbeat.mark(WorkerStatus::Offline).await;
    pool.close().await;
    tracing::info!("Graceful shutdown complete");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "orbital_worker=info,orbital_db=info,orbital_core=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
