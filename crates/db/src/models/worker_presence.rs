//! Worker presence rows, written by the heartbeat loop.

use orbital_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

use super::status::StatusId;

/// A row from the `worker_presence` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct WorkerPresence {
    pub worker_id: String,
    pub hostname: String,
    pub queue_name: String,
    pub status_id: StatusId,
    pub max_concurrent_jobs: i32,
    pub active_job_count: i32,
    pub current_job_id: Option<DbId>,
    pub active_job_ids: Vec<DbId>,
    pub capabilities: serde_json::Value,
    pub started_at: Timestamp,
    pub last_heartbeat_at: Timestamp,
}

/// Snapshot sent on every heartbeat.
#[derive(Debug, Clone)]
pub struct PresenceUpdate {
    pub worker_id: String,
    pub hostname: String,
    pub queue_name: String,
    pub status_id: StatusId,
    pub max_concurrent_jobs: i32,
    pub active_job_ids: Vec<DbId>,
    pub capabilities: serde_json::Value,
}
