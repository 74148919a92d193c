//! Repository for the `dead_letter_jobs` table. Insert and read only; the
//! table rejects updates.

use orbital_core::types::DbId;
use sqlx::{PgConnection, PgPool};

use crate::models::dead_letter::DeadLetterJob;
use crate::models::job::Job;

/// Column list for `dead_letter_jobs` queries.
const COLUMNS: &str = "\
    id, job_id, idempotency_key, queue_name, payload, job_snapshot, \
    failure_kind, reason, retry_count, moved_at";

pub struct DeadLetterRepo;

impl DeadLetterRepo {
    /// Snapshot `job` into the dead-letter table.
    pub async fn insert(
        conn: &mut PgConnection,
        job: &Job,
        reason: &str,
    ) -> Result<DeadLetterJob, sqlx::Error> {
        let snapshot = serde_json::to_value(job).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

        let query = format!(
            "INSERT INTO dead_letter_jobs \
                 (job_id, idempotency_key, queue_name, payload, job_snapshot, \
                  failure_kind, reason, retry_count) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, DeadLetterJob>(&query)
            .bind(job.id)
            .bind(&job.idempotency_key)
            .bind(&job.queue_name)
            .bind(&job.payload)
            .bind(&snapshot)
            .bind(&job.failure_kind)
            .bind(reason)
            .bind(job.retry_count)
            .fetch_one(conn)
            .await
    }

    pub async fn find_by_job_id(
        pool: &PgPool,
        job_id: DbId,
    ) -> Result<Option<DeadLetterJob>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM dead_letter_jobs WHERE job_id = $1");
        sqlx::query_as::<_, DeadLetterJob>(&query)
            .bind(job_id)
            .fetch_optional(pool)
            .await
    }

    /// Most recent dead letters first.
    pub async fn list_recent(pool: &PgPool, limit: i64) -> Result<Vec<DeadLetterJob>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM dead_letter_jobs ORDER BY moved_at DESC, id DESC LIMIT $1"
        );
        sqlx::query_as::<_, DeadLetterJob>(&query)
            .bind(limit)
            .fetch_all(pool)
            .await
    }
}
