//! Row-claiming fallback strategy.
//!
//! There is no separate message: a `queued` row with `visible_at <= now` is
//! ready, and claiming it is a single `FOR UPDATE SKIP LOCKED` update. The
//! job row already carries every state change, so `enqueue`, `acknowledge`
//! and `release` have nothing left to do.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgConnection, PgPool};

use super::{Claim, ClaimedJob, JobQueue, JobRef, QueueError, QueueStrategy};
use crate::repositories::JobRepo;

#[derive(Debug, Clone, Default)]
pub struct SkipLockedQueue;

impl SkipLockedQueue {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl JobQueue for SkipLockedQueue {
    fn strategy(&self) -> QueueStrategy {
        QueueStrategy::Fallback
    }

    async fn enqueue(
        &self,
        _conn: &mut PgConnection,
        _job: &JobRef,
        _delay: Duration,
    ) -> Result<(), QueueError> {
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
        let jobs =
            JobRepo::claim_ready_batch(pool, queue_name, worker_id, batch_size, visibility_timeout)
                .await?;
        Ok(jobs.into_iter().filter_map(ClaimedJob::from_claimed_row).collect())
    }

    async fn acknowledge(&self, _conn: &mut PgConnection, _claim: &Claim) -> Result<(), QueueError> {
        Ok(())
    }

    async fn release(
        &self,
        _conn: &mut PgConnection,
        _claim: &Claim,
        _delay: Duration,
    ) -> Result<(), QueueError> {
        Ok(())
    }
}
