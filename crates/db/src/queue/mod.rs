//! Queue abstraction over two interchangeable strategies.
//!
//! - [`PgmqQueue`]: delegates to the `pgmq` extension (send, read with
//!   visibility timeout, archive).
//! - [`SkipLockedQueue`]: claims `jobs` rows directly with
//!   `FOR UPDATE SKIP LOCKED`; the row itself is the claimable unit.
//!
//! The strategy is picked once at startup by [`select_strategy`]; callers
//! only ever see `Arc<dyn JobQueue>`.

pub mod pgmq;
pub mod skip_locked;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use orbital_core::error::CoreError;
use orbital_core::types::{DbId, Priority};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::models::job::Job;
use crate::models::outbox::OutboxEntry;

pub use self::pgmq::PgmqQueue;
pub use self::skip_locked::SkipLockedQueue;

/// Errors from queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Malformed queue message {msg_id}: {reason}")]
    MalformedMessage { msg_id: i64, reason: String },

    #[error("Queue strategy unavailable: {0}")]
    Unavailable(String),
}

// ---------------------------------------------------------------------------
// Strategy selection
// ---------------------------------------------------------------------------

/// Concrete queue backend in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStrategy {
    Native,
    Fallback,
}

impl QueueStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Fallback => "fallback",
        }
    }
}

impl fmt::Display for QueueStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator choice from `QUEUE_STRATEGY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrategyPreference {
    /// Native when the extension is installed, fallback otherwise.
    #[default]
    Auto,
    Native,
    Fallback,
}

impl FromStr for StrategyPreference {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Ok(Self::Auto),
            "native" | "pgmq" => Ok(Self::Native),
            "fallback" | "skip_locked" => Ok(Self::Fallback),
            other => Err(CoreError::Validation(format!(
                "Unknown queue strategy \"{other}\" (expected auto, native or fallback)"
            ))),
        }
    }
}

/// Capability probe: is the `pgmq` extension installed in this database?
pub async fn pgmq_available(pool: &PgPool) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_extension WHERE extname = 'pgmq')")
        .fetch_one(pool)
        .await
}

/// Probe the database once and build the queue for this process.
///
/// The native strategy creates `queue_name` in pgmq if it does not exist.
pub async fn select_strategy(
    pool: &PgPool,
    preference: StrategyPreference,
    queue_name: &str,
) -> Result<Arc<dyn JobQueue>, QueueError> {
    let native = match preference {
        StrategyPreference::Fallback => false,
        StrategyPreference::Auto => pgmq_available(pool).await?,
        StrategyPreference::Native => {
            if !pgmq_available(pool).await? {
                return Err(QueueError::Unavailable(
                    "QUEUE_STRATEGY=native but the pgmq extension is not installed".into(),
                ));
            }
            true
        }
    };

    let queue: Arc<dyn JobQueue> = if native {
        let queue = PgmqQueue::new();
        queue.ensure_queue(pool, queue_name).await?;
        Arc::new(queue)
    } else {
        Arc::new(SkipLockedQueue::new())
    };

    tracing::info!(
        strategy = %queue.strategy(),
        ?preference,
        queue = queue_name,
        "Queue strategy selected",
    );
    Ok(queue)
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// What gets published for a queued job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRef {
    pub job_id: DbId,
    pub queue_name: String,
    pub priority: Priority,
}

impl From<&OutboxEntry> for JobRef {
    fn from(entry: &OutboxEntry) -> Self {
        Self {
            job_id: entry.job_id,
            queue_name: entry.queue_name.clone(),
            priority: entry.priority,
        }
    }
}

/// A worker's exclusive, time-bounded right to execute one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub job_id: DbId,
    pub queue_name: String,
    /// Fences every write the holder makes against the job row.
    pub token: Uuid,
    /// Native strategy only: the message backing this claim.
    pub message_id: Option<i64>,
}

impl Claim {
    /// Rebuild the claim held on a `processing` row. `None` if the row
    /// carries no claim token.
    pub fn from_job(job: &Job) -> Option<Self> {
        Some(Self {
            job_id: job.id,
            queue_name: job.queue_name.clone(),
            token: job.claim_token?,
            message_id: job.queue_message_id,
        })
    }
}

/// A claimed job with its row as it stood right after the claim.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub claim: Claim,
    pub job: Job,
}

impl ClaimedJob {
    pub(crate) fn from_claimed_row(job: Job) -> Option<Self> {
        let claim = Claim::from_job(&job)?;
        Some(Self { claim, job })
    }
}

/// The operations every queue strategy provides.
///
/// `enqueue`, `acknowledge` and `release` run on the caller's connection so
/// they commit or roll back with the job-row write they accompany.
#[async_trait]
pub trait JobQueue: Send + Sync {
    fn strategy(&self) -> QueueStrategy;

    /// Make `job` claimable after `delay`.
    async fn enqueue(
        &self,
        conn: &mut PgConnection,
        job: &JobRef,
        delay: Duration,
    ) -> Result<(), QueueError>;

    /// Claim up to `batch_size` ready jobs on `queue_name`, in priority order.
    ///
    /// A claim not acknowledged or released within `visibility_timeout` is
    /// treated as abandoned and its job becomes reclaimable.
    async fn claim_batch(
        &self,
        pool: &PgPool,
        queue_name: &str,
        worker_id: &str,
        batch_size: i64,
        visibility_timeout: Duration,
    ) -> Result<Vec<ClaimedJob>, QueueError>;

    /// Retire the claim after a terminal outcome.
    async fn acknowledge(&self, conn: &mut PgConnection, claim: &Claim) -> Result<(), QueueError>;

    /// Return the job to the ready pool after `delay`.
    async fn release(
        &self,
        conn: &mut PgConnection,
        claim: &Claim,
        delay: Duration,
    ) -> Result<(), QueueError>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn strategy_preference_parses() {
        assert_eq!("auto".parse::<StrategyPreference>().unwrap(), StrategyPreference::Auto);
        assert_eq!(" Native ".parse::<StrategyPreference>().unwrap(), StrategyPreference::Native);
        assert_eq!("pgmq".parse::<StrategyPreference>().unwrap(), StrategyPreference::Native);
        assert_eq!("fallback".parse::<StrategyPreference>().unwrap(), StrategyPreference::Fallback);
        assert_matches!("redis".parse::<StrategyPreference>(), Err(CoreError::Validation(_)));
    }

    #[test]
    fn job_ref_message_shape() {
        let msg = serde_json::to_value(JobRef {
            job_id: 42,
            queue_name: "default".into(),
            priority: 7,
        })
        .unwrap();
        assert_eq!(msg, serde_json::json!({"job_id": 42, "queue_name": "default", "priority": 7}));
    }
}
