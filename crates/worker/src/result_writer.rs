//! Persists the outcome of a claimed job.
//!
//! Every write happens in one transaction together with the matching queue
//! call (acknowledge or release), and is fenced by the claim token. A write
//! that matches no row means the claim was lost to the reaper or a cancel;
//! that outcome is [`Outcome::Superseded`] and nothing is changed.

use std::sync::Arc;
use std::time::Duration;

use orbital_core::retry::{self, Failure, FailureClassifier, RetryDecision, RetryPolicy};
use orbital_core::status::JobStatus;
use orbital_db::queue::{Claim, JobQueue};
use orbital_db::repositories::{DeadLetterRepo, JobRepo};
use sqlx::{PgConnection, PgPool};

use crate::config::WorkerConfig;
use crate::error::WorkerError;

/// Inputs to the retry decision that come from configuration.
#[derive(Clone)]
pub struct RetryRules {
    pub classifier: Arc<dyn FailureClassifier>,
    pub policy: RetryPolicy,
    /// Upper bound applied on top of each job's own `max_retries`.
    pub max_retries: i32,
}

impl RetryRules {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            classifier: Arc::new(config.classifier.clone()),
            policy: config.retry_policy.clone(),
            max_retries: config.max_retries,
        }
    }
}

/// What happened to the job row.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed,
    Requeued { retry_count: i32, delay: Duration },
    DeadLettered { reason: String },
    /// The claim no longer held the job; nothing was written.
    Superseded,
}

/// `processing -> completed` with the result, then acknowledge.
pub async fn record_success(
    pool: &PgPool,
    queue: &dyn JobQueue,
    claim: &Claim,
    result: &serde_json::Value,
) -> Result<Outcome, WorkerError> {
    let mut tx = pool.begin().await?;

    if JobRepo::complete(&mut tx, claim.job_id, claim.token, result)
        .await?
        .is_none()
    {
        tx.rollback().await?;
        tracing::warn!(job_id = claim.job_id, "Result discarded: claim no longer held");
        return Ok(Outcome::Superseded);
    }
    queue.acknowledge(&mut tx, claim).await?;

    tx.commit().await?;
    Ok(Outcome::Completed)
}

/// Record a failed attempt and apply the retry decision.
pub async fn record_failure(
    pool: &PgPool,
    queue: &dyn JobQueue,
    claim: &Claim,
    failure: &Failure,
    rules: &RetryRules,
) -> Result<Outcome, WorkerError> {
    let mut tx = pool.begin().await?;
    let outcome = apply_failure(&mut tx, queue, claim, failure, rules).await?;
    if outcome == Outcome::Superseded {
        tx.rollback().await?;
        tracing::warn!(job_id = claim.job_id, "Failure discarded: claim no longer held");
    } else {
        tx.commit().await?;
    }
    Ok(outcome)
}

/// `processing -> failed -> (queued | dead_lettered)` on the caller's
/// transaction. Shared by the result writer and the claim reaper.
pub async fn apply_failure(
    conn: &mut PgConnection,
    queue: &dyn JobQueue,
    claim: &Claim,
    failure: &Failure,
    rules: &RetryRules,
) -> Result<Outcome, WorkerError> {
    let Some(failed) = JobRepo::mark_failed(conn, claim.job_id, claim.token, failure).await? else {
        return Ok(Outcome::Superseded);
    };

    let max_retries = failed.max_retries.min(rules.max_retries);
    let decision = retry::decide(
        failed.retry_count,
        max_retries,
        failure,
        rules.classifier.as_ref(),
        &rules.policy,
    );

    match decision {
        RetryDecision::Requeue { retry_count, delay } => {
            JobStatus::Failed.validate_transition(JobStatus::Queued)?;
            JobRepo::requeue_failed(conn, failed.id, retry_count, delay)
                .await?
                .ok_or(sqlx::Error::RowNotFound)?;
            queue.release(conn, claim, delay).await?;
            Ok(Outcome::Requeued { retry_count, delay })
        }
        RetryDecision::DeadLetter { reason } => {
            JobStatus::Failed.validate_transition(JobStatus::DeadLettered)?;
            let dead = JobRepo::dead_letter_failed(conn, failed.id, &reason)
                .await?
                .ok_or(sqlx::Error::RowNotFound)?;
            DeadLetterRepo::insert(conn, &dead, &reason).await?;
            queue.acknowledge(conn, claim).await?;
            Ok(Outcome::DeadLettered { reason })
        }
    }
}
