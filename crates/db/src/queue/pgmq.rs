//! Native strategy backed by the `pgmq` Postgres extension.
//!
//! Each dispatch is a message `{job_id, queue_name, priority}`. Reading a
//! message hides it for the visibility timeout; the referenced job row is
//! then claimed with the same conditional update the fallback uses, so the
//! row stays the source of truth and duplicate messages are harmless.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use orbital_core::types::Timestamp;
use sqlx::{PgConnection, PgPool};

use super::{Claim, ClaimedJob, JobQueue, JobRef, QueueError, QueueStrategy};
use crate::models::status::JobStatus;
use crate::repositories::JobRepo;

/// Shortest visibility push for a message whose job is not claimable yet.
const MIN_DEFER: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
pub struct PgmqQueue {
    /// Queues already created through this handle.
    ensured: Mutex<HashSet<String>>,
}

impl PgmqQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the pgmq queue if it does not exist yet.
    pub async fn ensure_queue(&self, pool: &PgPool, queue_name: &str) -> Result<(), QueueError> {
        let mut conn = pool.acquire().await?;
        self.ensure_queue_on(&mut conn, queue_name).await
    }

    async fn ensure_queue_on(
        &self,
        conn: &mut PgConnection,
        queue_name: &str,
    ) -> Result<(), QueueError> {
        let known = self
            .ensured
            .lock()
            .map(|set| set.contains(queue_name))
            .unwrap_or(false);
        if known {
            return Ok(());
        }

        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue_name)
            .execute(&mut *conn)
            .await?;

        if let Ok(mut set) = self.ensured.lock() {
            set.insert(queue_name.to_string());
        }
        Ok(())
    }

    async fn archive(
        conn: &mut PgConnection,
        queue_name: &str,
        msg_id: i64,
    ) -> Result<(), QueueError> {
        sqlx::query("SELECT pgmq.archive($1, $2)")
            .bind(queue_name)
            .bind(msg_id)
            .execute(conn)
            .await?;
        Ok(())
    }

    async fn set_visibility(
        conn: &mut PgConnection,
        queue_name: &str,
        msg_id: i64,
        delay: Duration,
    ) -> Result<(), QueueError> {
        sqlx::query("SELECT msg_id FROM pgmq.set_vt($1, $2, $3)")
            .bind(queue_name)
            .bind(msg_id)
            .bind(whole_secs(delay))
            .execute(conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobQueue for PgmqQueue {
    fn strategy(&self) -> QueueStrategy {
        QueueStrategy::Native
    }

    async fn enqueue(
        &self,
        conn: &mut PgConnection,
        job: &JobRef,
        delay: Duration,
    ) -> Result<(), QueueError> {
        self.ensure_queue_on(conn, &job.queue_name).await?;

        let body = serde_json::to_value(job).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
        let msg_id: i64 = sqlx::query_scalar("SELECT * FROM pgmq.send($1, $2, $3)")
            .bind(&job.queue_name)
            .bind(&body)
            .bind(whole_secs(delay))
            .fetch_one(&mut *conn)
            .await?;

        tracing::debug!(job_id = job.job_id, msg_id, queue = %job.queue_name, "Job message sent");
        Ok(())
    }

    async fn claim_batch(
        &self,
        pool: &PgPool,
        queue_name: &str,
        worker_id: &str,
        batch_size: i64,
        visibility_timeout: Duration,
    ) -> Result<Vec<ClaimedJob>, QueueError> {
        if batch_size <= 0 {
            return Ok(Vec::new());
        }
        let qty = i32::try_from(batch_size).unwrap_or(i32::MAX);

        let mut tx = pool.begin().await?;

        let rows: Vec<(i64, serde_json::Value)> =
            sqlx::query_as("SELECT msg_id, message FROM pgmq.read($1, $2, $3)")
                .bind(queue_name)
                .bind(whole_secs(visibility_timeout))
                .bind(qty)
                .fetch_all(&mut *tx)
                .await?;

        let mut messages = Vec::with_capacity(rows.len());
        for (msg_id, body) in rows {
            match serde_json::from_value::<JobRef>(body) {
                Ok(job_ref) => messages.push((msg_id, job_ref)),
                Err(e) => {
                    let err = QueueError::MalformedMessage {
                        msg_id,
                        reason: e.to_string(),
                    };
                    tracing::warn!(error = %err, queue = queue_name, "Archiving unreadable message");
                    Self::archive(&mut tx, queue_name, msg_id).await?;
                }
            }
        }

        // pgmq delivers in send order; priority only applies within the batch.
        messages.sort_by(|(a_id, a), (b_id, b)| b.priority.cmp(&a.priority).then(a_id.cmp(b_id)));

        let mut claimed = Vec::with_capacity(messages.len());
        for (msg_id, job_ref) in messages {
            let row = JobRepo::claim_by_id(
                &mut tx,
                job_ref.job_id,
                worker_id,
                visibility_timeout,
                Some(msg_id),
            )
            .await?;
            if let Some(job) = row {
                claimed.extend(ClaimedJob::from_claimed_row(job));
                continue;
            }

            // Not claimable: either stale (archive) or early (hide until due).
            let job = JobRepo::lock_by_id(&mut tx, job_ref.job_id).await?;
            match not_claimable_action(job.as_ref(), msg_id, Utc::now()) {
                Deferral::Archive => {
                    tracing::debug!(job_id = job_ref.job_id, msg_id, "Archiving stale message");
                    Self::archive(&mut tx, queue_name, msg_id).await?;
                }
                Deferral::Hide(delay) => {
                    Self::set_visibility(&mut tx, queue_name, msg_id, delay).await?;
                }
            }
        }

        tx.commit().await?;
        Ok(claimed)
    }

    async fn acknowledge(&self, conn: &mut PgConnection, claim: &Claim) -> Result<(), QueueError> {
        match claim.message_id {
            Some(msg_id) => Self::archive(conn, &claim.queue_name, msg_id).await,
            None => Ok(()),
        }
    }

    async fn release(
        &self,
        conn: &mut PgConnection,
        claim: &Claim,
        delay: Duration,
    ) -> Result<(), QueueError> {
        match claim.message_id {
            Some(msg_id) => Self::set_visibility(conn, &claim.queue_name, msg_id, delay).await,
            None => {
                // Claimed before the native strategy was enabled: publish anew.
                let job_ref = JobRef {
                    job_id: claim.job_id,
                    queue_name: claim.queue_name.clone(),
                    priority: 0,
                };
                self.enqueue(conn, &job_ref, delay).await
            }
        }
    }
}

/// What to do with a message whose job could not be claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deferral {
    Archive,
    Hide(Duration),
}

fn not_claimable_action(
    job: Option<&crate::models::job::Job>,
    msg_id: i64,
    now: Timestamp,
) -> Deferral {
    let Some(job) = job else {
        return Deferral::Archive;
    };
    match job.status() {
        Some(JobStatus::Queued) => Deferral::Hide(until(job.visible_at, now)),
        // Only the message backing the live claim survives; duplicates go.
        Some(JobStatus::Processing) if job.queue_message_id == Some(msg_id) => {
            let expires = job.claim_expires_at.unwrap_or(now);
            Deferral::Hide(until(expires, now))
        }
        _ => Deferral::Archive,
    }
}

fn until(target: Timestamp, now: Timestamp) -> Duration {
    (target - now)
        .to_std()
        .unwrap_or(Duration::ZERO)
        .max(MIN_DEFER)
}

/// pgmq takes whole seconds; round up so a message never surfaces before
/// the job row it references becomes visible.
fn whole_secs(d: Duration) -> i32 {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    i32::try_from(secs).unwrap_or(i32::MAX)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
