//! Dispatch outbox rows.

use orbital_core::types::{DbId, Priority, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `job_dispatch_outbox` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct OutboxEntry {
    pub id: DbId,
    pub job_id: DbId,
    pub dispatch_seq: i32,
    pub queue_name: String,
    pub priority: Priority,
    pub available_at: Timestamp,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: Timestamp,
    pub dispatched_at: Option<Timestamp>,
}
