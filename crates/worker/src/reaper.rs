//! Claim-expiry reaper.
//!
//! A `processing` job whose claim expired without an outcome is treated as
//! a crashed attempt: it goes through the same retry decision as any other
//! failure, with kind `claim_expired`. Worker presence is never consulted.

use std::sync::Arc;

use orbital_core::retry::{Failure, FailureKind};
use orbital_db::queue::{Claim, JobQueue};
use orbital_db::repositories::JobRepo;
use sqlx::{Acquire, PgPool};
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::result_writer::{self, Outcome, RetryRules};

/// Expired claims handled per sweep.
const REAPER_BATCH_SIZE: i64 = 50;

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub requeued: usize,
    pub dead_lettered: usize,
    pub errors: usize,
}

/// Recover expired claims once.
///
/// Each job gets its own savepoint so one bad row does not block the rest.
pub async fn sweep(
    pool: &PgPool,
    queue: &dyn JobQueue,
    rules: &RetryRules,
) -> Result<SweepStats, WorkerError> {
    let mut stats = SweepStats::default();
    let mut tx = pool.begin().await?;

    let expired = JobRepo::lock_expired_claims(&mut tx, REAPER_BATCH_SIZE).await?;
    for job in expired {
        let Some(claim) = Claim::from_job(&job) else {
            continue;
        };
        let failure = Failure::new(
            FailureKind::ClaimExpired,
            format!(
                "claim held by {} expired without an outcome",
                job.claimed_by.as_deref().unwrap_or("unknown worker")
            ),
        );

        let mut savepoint = (&mut *tx).begin().await?;
        match result_writer::apply_failure(&mut savepoint, queue, &claim, &failure, rules).await {
            Ok(outcome) => {
                savepoint.commit().await?;
                match outcome {
                    Outcome::Requeued { retry_count, .. } => {
                        stats.requeued += 1;
                        tracing::warn!(job_id = job.id, retry_count, "Expired claim requeued");
                    }
                    Outcome::DeadLettered { reason } => {
                        stats.dead_lettered += 1;
                        tracing::warn!(job_id = job.id, reason = %reason, "Expired claim dead-lettered");
                    }
                    Outcome::Completed | Outcome::Superseded => {}
                }
            }
            Err(e) => {
                savepoint.rollback().await?;
                stats.errors += 1;
                tracing::error!(job_id = job.id, error = %e, "Failed to recover expired claim");
            }
        }
    }

    tx.commit().await?;
    Ok(stats)
}

/// Sweep every `reaper_interval` until cancelled. Also archives old
/// terminal jobs when `archive_after` is configured.
pub async fn run(
    pool: PgPool,
    queue: Arc<dyn JobQueue>,
    config: Arc<WorkerConfig>,
    cancel: CancellationToken,
) {
    let rules = RetryRules::from_config(&config);
    let mut ticker = tokio::time::interval(config.reaper_interval);
    tracing::info!(
        interval_secs = config.reaper_interval.as_secs(),
        archive_after_secs = config.archive_after.map(|d| d.as_secs()),
        "Claim reaper started",
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Claim reaper stopping");
                break;
            }
            _ = ticker.tick() => {
                match sweep(&pool, queue.as_ref(), &rules).await {
                    Ok(stats) if stats != SweepStats::default() => {
                        tracing::info!(
                            requeued = stats.requeued,
                            dead_lettered = stats.dead_lettered,
                            errors = stats.errors,
                            "Claim reaper sweep",
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "Claim reaper sweep failed"),
                }

                if let Some(older_than) = config.archive_after {
                    match JobRepo::archive_terminal(&pool, older_than).await {
                        Ok(0) => {}
                        Ok(archived) => tracing::info!(archived, "Archived terminal jobs"),
                        Err(e) => tracing::error!(error = %e, "Archiving terminal jobs failed"),
                    }
                }
            }
        }
    }
}
