//! Repository for the `worker_presence` table.
//!
//! Presence is for operators only. Nothing in the claim path reads it.

use std::time::Duration;

use sqlx::PgPool;

use crate::models::status::WorkerStatus;
use crate::models::worker_presence::{PresenceUpdate, WorkerPresence};

/// Column list for `worker_presence` queries.
const COLUMNS: &str = "\
    worker_id, hostname, queue_name, status_id, max_concurrent_jobs, \
    active_job_count, current_job_id, active_job_ids, capabilities, \
    started_at, last_heartbeat_at";

pub struct WorkerPresenceRepo;

impl WorkerPresenceRepo {
    // ── Writes ───────────────────────────────────────────────────────────

    /// Insert or reset the presence row at worker startup.
    ///
    /// A restarted worker reusing its id gets a fresh `started_at`.
    pub async fn register(pool: &PgPool, update: &PresenceUpdate) -> Result<WorkerPresence, sqlx::Error> {
        Self::upsert(pool, update, true).await
    }

    /// Record a heartbeat, creating the row if an operator deleted it.
    pub async fn heartbeat(pool: &PgPool, update: &PresenceUpdate) -> Result<WorkerPresence, sqlx::Error> {
        Self::upsert(pool, update, false).await
    }

    async fn upsert(
        pool: &PgPool,
        update: &PresenceUpdate,
        reset_started_at: bool,
    ) -> Result<WorkerPresence, sqlx::Error> {
        let started_at = if reset_started_at {
            "NOW()"
        } else {
            "worker_presence.started_at"
        };
        let query = format!(
            "INSERT INTO worker_presence \
                 (worker_id, hostname, queue_name, status_id, max_concurrent_jobs, \
                  active_job_count, current_job_id, active_job_ids, capabilities) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (worker_id) DO UPDATE SET \
                 hostname = EXCLUDED.hostname, \
                 queue_name = EXCLUDED.queue_name, \
                 status_id = EXCLUDED.status_id, \
                 max_concurrent_jobs = EXCLUDED.max_concurrent_jobs, \
                 active_job_count = EXCLUDED.active_job_count, \
                 current_job_id = EXCLUDED.current_job_id, \
                 active_job_ids = EXCLUDED.active_job_ids, \
                 capabilities = EXCLUDED.capabilities, \
                 started_at = {started_at}, \
                 last_heartbeat_at = NOW() \
             RETURNING {COLUMNS}"
        );

        sqlx::query_as::<_, WorkerPresence>(&query)
            .bind(&update.worker_id)
            .bind(&update.hostname)
            .bind(&update.queue_name)
            .bind(update.status_id)
            .bind(update.max_concurrent_jobs)
            .bind(update.active_job_ids.len() as i32)
            .bind(update.active_job_ids.first().copied())
            .bind(&update.active_job_ids)
            .bind(&update.capabilities)
            .fetch_one(pool)
            .await
    }

    /// Set only the status, e.g. `draining` at shutdown or `offline` on exit.
    ///
    /// Returns `true` if the worker row exists.
    pub async fn mark_status(
        pool: &PgPool,
        worker_id: &str,
        status: WorkerStatus,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE worker_presence SET status_id = $2, last_heartbeat_at = NOW() \
             WHERE worker_id = $1",
        )
        .bind(worker_id)
        .bind(status.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub async fn find_by_id(pool: &PgPool, worker_id: &str) -> Result<Option<WorkerPresence>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM worker_presence WHERE worker_id = $1");
        sqlx::query_as::<_, WorkerPresence>(&query)
            .bind(worker_id)
            .fetch_optional(pool)
            .await
    }

    /// Workers whose last heartbeat is older than `older_than`, excluding
    /// those that shut down cleanly.
    pub async fn list_stale(pool: &PgPool, older_than: Duration) -> Result<Vec<WorkerPresence>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM worker_presence \
             WHERE last_heartbeat_at < NOW() - make_interval(secs => $1) \
               AND status_id <> $2 \
             ORDER BY last_heartbeat_at ASC"
        );
        sqlx::query_as::<_, WorkerPresence>(&query)
            .bind(older_than.as_secs_f64())
            .bind(WorkerStatus::Offline.id())
            .fetch_all(pool)
            .await
    }
}
