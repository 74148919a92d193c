//! Repository for the `job_dispatch_outbox` table.

use orbital_core::types::DbId;
use sqlx::{PgConnection, PgPool};

use crate::models::job::Job;
use crate::models::outbox::OutboxEntry;

/// Column list for `job_dispatch_outbox` queries.
const COLUMNS: &str = "\
    id, job_id, dispatch_seq, queue_name, priority, available_at, \
    attempts, last_error, created_at, dispatched_at";

/// Longest wait between publish attempts for a failing row.
const MAX_RETRY_BACKOFF_SECS: f64 = 300.0;

pub struct OutboxRepo;

impl OutboxRepo {
    /// Record that `job` must be published to the queue backend.
    ///
    /// The dispatch sequence is derived from the job's retry count, so
    /// repeating the same transition writes nothing. Returns `true` if a row
    /// was inserted.
    pub async fn insert(conn: &mut PgConnection, job: &Job) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO job_dispatch_outbox (job_id, dispatch_seq, queue_name, priority) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (job_id, dispatch_seq) DO NOTHING",
        )
        .bind(job.id)
        .bind(job.retry_count + 1)
        .bind(&job.queue_name)
        .bind(job.priority)
        .execute(conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Lock up to `limit` undispatched rows that are due, oldest first.
    ///
    /// Rows held by another relay are skipped.
    pub async fn lock_pending(
        conn: &mut PgConnection,
        limit: i64,
    ) -> Result<Vec<OutboxEntry>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM job_dispatch_outbox \
             WHERE dispatched_at IS NULL AND available_at <= NOW() \
             ORDER BY id ASC \
             LIMIT $1 \
             FOR UPDATE SKIP LOCKED"
        );
        sqlx::query_as::<_, OutboxEntry>(&query)
            .bind(limit)
            .fetch_all(conn)
            .await
    }

    pub async fn mark_dispatched(conn: &mut PgConnection, id: DbId) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE job_dispatch_outbox \
             SET dispatched_at = NOW(), attempts = attempts + 1, last_error = NULL \
             WHERE id = $1",
        )
        .bind(id)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Record a failed publish and push the row back with exponential backoff.
    pub async fn record_failure(
        conn: &mut PgConnection,
        id: DbId,
        error: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE job_dispatch_outbox \
             SET attempts = attempts + 1, last_error = $2, \
                 available_at = NOW() + make_interval(secs => LEAST(POWER(2, attempts), $3)) \
             WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .bind(MAX_RETRY_BACKOFF_SECS)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// All outbox rows for one job, in dispatch order.
    pub async fn list_for_job(pool: &PgPool, job_id: DbId) -> Result<Vec<OutboxEntry>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM job_dispatch_outbox WHERE job_id = $1 ORDER BY dispatch_seq"
        );
        sqlx::query_as::<_, OutboxEntry>(&query)
            .bind(job_id)
            .fetch_all(pool)
            .await
    }

    /// Number of rows still waiting to be published.
    pub async fn count_pending(pool: &PgPool) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM job_dispatch_outbox WHERE dispatched_at IS NULL")
            .fetch_one(pool)
            .await
    }
}
