//! Dispatch publisher: transactional outbox for transitions into `queued`.
//!
//! The status write and its outbox row commit together. A relay then calls
//! [`publish_pending`] to hand outbox rows to the active [`JobQueue`]; the
//! relay delivers at least once, and claiming is idempotent per job id.

use std::time::Duration;

use orbital_core::types::DbId;
use sqlx::{Acquire, PgPool};

use crate::models::job::Job;
use crate::queue::{JobQueue, JobRef};
use crate::repositories::{JobRepo, OutboxRepo};

/// Move a `pending` job to `queued` and record its dispatch.
///
/// Returns `None` when the job was not pending, so repeating the call never
/// enqueues twice.
pub async fn queue_job(pool: &PgPool, job_id: DbId) -> Result<Option<Job>, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let Some(job) = JobRepo::mark_queued(&mut tx, job_id).await? else {
        tx.rollback().await?;
        return Ok(None);
    };
    OutboxRepo::insert(&mut tx, &job).await?;

    tx.commit().await?;
    tracing::debug!(job_id, queue = %job.queue_name, "Job queued");
    Ok(Some(job))
}

/// Outcome of one relay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub dispatched: usize,
    pub failed: usize,
}

/// Publish up to `batch_size` due outbox rows through `queue`.
///
/// Each row gets its own savepoint: a failed publish is rolled back and
/// recorded on the row (attempts, last error, backoff) without affecting
/// the rest of the batch.
pub async fn publish_pending(
    pool: &PgPool,
    queue: &dyn JobQueue,
    batch_size: i64,
) -> Result<RelayStats, sqlx::Error> {
    let mut stats = RelayStats::default();
    let mut tx = pool.begin().await?;

    let entries = OutboxRepo::lock_pending(&mut tx, batch_size).await?;
    for entry in &entries {
        let job_ref = JobRef::from(entry);

        let mut savepoint = (&mut *tx).begin().await?;
        let published = queue.enqueue(&mut savepoint, &job_ref, Duration::ZERO).await;
        match published {
            Ok(()) => {
                OutboxRepo::mark_dispatched(&mut savepoint, entry.id).await?;
                savepoint.commit().await?;
                stats.dispatched += 1;
            }
            Err(e) => {
                savepoint.rollback().await?;
                tracing::warn!(
                    error = %e,
                    job_id = entry.job_id,
                    attempts = entry.attempts + 1,
                    "Outbox publish failed",
                );
                OutboxRepo::record_failure(&mut tx, entry.id, &e.to_string()).await?;
                stats.failed += 1;
            }
        }
    }

    tx.commit().await?;
    Ok(stats)
}
