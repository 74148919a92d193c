//! Heartbeat / presence tracker.
//!
//! Upserts this worker's `worker_presence` row on a fixed interval. The
//! row is for operators only: nothing in the claim or reclaim path reads
//! presence, so a worker that misses heartbeats keeps its claims until they
//! expire on their own.

use std::sync::Arc;

use orbital_core::status::WorkerStatus;
use orbital_db::models::worker_presence::PresenceUpdate;
use orbital_db::queue::QueueStrategy;
use orbital_db::repositories::WorkerPresenceRepo;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::active::ActiveJobs;
use crate::config::WorkerConfig;

/// Builds presence snapshots for one worker process.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    pool: PgPool,
    config: Arc<WorkerConfig>,
    active: ActiveJobs,
    strategy: QueueStrategy,
}

impl Heartbeat {
    pub fn new(
        pool: PgPool,
        config: Arc<WorkerConfig>,
        active: ActiveJobs,
        strategy: QueueStrategy,
    ) -> Self {
        Self {
            pool,
            config,
            active,
            strategy,
        }
    }

    fn snapshot(&self, status: WorkerStatus) -> PresenceUpdate {
        PresenceUpdate {
            worker_id: self.config.worker_id.clone(),
            hostname: self.config.hostname.clone(),
            queue_name: self.config.queue_name.clone(),
            status_id: status.id(),
            max_concurrent_jobs: i32::try_from(self.config.max_concurrent_jobs).unwrap_or(i32::MAX),
            active_job_ids: self.active.snapshot(),
            capabilities: serde_json::json!({
                "queue_strategy": self.strategy.as_str(),
                "calculation_binary": self.config.calculation.binary.display().to_string(),
                "job_timeout_secs": self.config.job_timeout.as_secs(),
            }),
        }
    }

    /// Status derived from the current load.
    fn current_status(&self) -> WorkerStatus {
        if self.active.is_empty() {
            WorkerStatus::Idle
        } else {
            WorkerStatus::Busy
        }
    }

    /// Write the initial presence row with a fresh `started_at`.
    pub async fn register(&self) -> Result<(), sqlx::Error> {
        WorkerPresenceRepo::register(&self.pool, &self.snapshot(WorkerStatus::Idle)).await?;
        Ok(())
    }

    /// Send one heartbeat.
    pub async fn beat(&self) -> Result<(), sqlx::Error> {
        let update = self.snapshot(self.current_status());
        WorkerPresenceRepo::heartbeat(&self.pool, &update).await?;
        tracing::debug!(active_jobs = update.active_job_ids.len(), "Heartbeat sent");
        Ok(())
    }

    /// Record a lifecycle status (`draining`, `offline`) outside the tick.
    pub async fn mark(&self, status: WorkerStatus) {
        if let Err(e) = WorkerPresenceRepo::mark_status(&self.pool, &self.config.worker_id, status).await {
            tracing::error!(error = %e, status = %status, "Failed to update worker presence");
        }
    }

    /// Heartbeat every `heartbeat_interval` until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        tracing::info!(
            interval_secs = self.config.heartbeat_interval.as_secs(),
            "Heartbeat started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Heartbeat stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.beat().await {
                        tracing::error!(error = %e, "Heartbeat failed");
                    }
                }
            }
        }
    }
}
