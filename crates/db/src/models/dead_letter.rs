//! Dead-letter record: immutable snapshot of a job that will not be retried.

use orbital_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `dead_letter_jobs` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DeadLetterJob {
    pub id: DbId,
    pub job_id: DbId,
    pub idempotency_key: String,
    pub queue_name: String,
    pub payload: serde_json::Value,
    /// Full job row as it stood when it was dead-lettered.
    pub job_snapshot: serde_json::Value,
    pub failure_kind: Option<String>,
    pub reason: String,
    pub retry_count: i32,
    pub moved_at: Timestamp,
}
