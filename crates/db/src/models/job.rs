//! Job entity and submission DTO.

use orbital_core::status::JobStatus;
use orbital_core::types::{DbId, Priority, Timestamp, DEFAULT_MAX_RETRIES, DEFAULT_QUEUE_NAME};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::status::StatusId;

/// A row from the `jobs` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Job {
    pub id: DbId,
    pub idempotency_key: String,
    pub queue_name: String,
    pub status_id: StatusId,
    pub priority: Priority,
    pub payload: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub failure_kind: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub visible_at: Timestamp,
    pub claim_token: Option<Uuid>,
    pub claimed_by: Option<String>,
    pub claim_expires_at: Option<Timestamp>,
    pub queue_message_id: Option<i64>,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
    pub archived_at: Option<Timestamp>,
    pub updated_at: Timestamp,
}

impl Job {
    /// Decoded status. `None` only if the row holds an id outside the
    /// seeded lookup table.
    pub fn status(&self) -> Option<JobStatus> {
        JobStatus::from_id(self.status_id)
    }

    /// Retries left before the next failure dead-letters the job.
    pub fn remaining_retries(&self) -> i32 {
        (self.max_retries - self.retry_count).max(0)
    }
}

/// Input for [`JobRepo::create`](crate::repositories::JobRepo::create).
#[derive(Debug, Clone, Deserialize)]
pub struct CreateJob {
    pub idempotency_key: String,
    pub payload: serde_json::Value,
    #[serde(default = "default_queue_name")]
    pub queue_name: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
    /// Create directly in `queued` (with its dispatch outbox row) instead of
    /// `pending`.
    #[serde(default = "default_enqueue")]
    pub enqueue: bool,
}

impl CreateJob {
    /// A queued job on the default lane with default priority and retries.
    pub fn new(idempotency_key: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            payload,
            queue_name: default_queue_name(),
            priority: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            enqueue: true,
        }
    }

    pub fn with_queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = queue_name.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Leave the job in `pending`; it is queued later by
    /// [`dispatch::queue_job`](crate::dispatch::queue_job).
    pub fn pending(mut self) -> Self {
        self.enqueue = false;
        self
    }
}

fn default_queue_name() -> String {
    DEFAULT_QUEUE_NAME.to_string()
}

fn default_max_retries() -> i32 {
    DEFAULT_MAX_RETRIES
}

fn default_enqueue() -> bool {
    true
}

/// Per-status job count for one queue, as returned by
/// [`JobRepo::status_counts`](crate::repositories::JobRepo::status_counts).
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct StatusCount {
    pub status_id: StatusId,
    pub count: i64,
}
