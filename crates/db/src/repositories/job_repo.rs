//! Repository for the `jobs` table.
//!
//! Every status literal goes through [`JobStatus`]; no magic numbers.
//! Writes against a claimed job are fenced by its `claim_token`, so a worker
//! whose claim was reaped or cancelled cannot overwrite the row.

use std::time::Duration;

use orbital_core::retry::Failure;
use orbital_core::types::DbId;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::models::job::{CreateJob, Job, StatusCount};
use crate::models::status::{JobStatus, StatusId};
use crate::repositories::OutboxRepo;

/// Column list for `jobs` queries.
const COLUMNS: &str = "\
    id, idempotency_key, queue_name, status_id, priority, \
    payload, result, error_message, failure_kind, \
    retry_count, max_retries, visible_at, \
    claim_token, claimed_by, claim_expires_at, queue_message_id, \
    created_at, started_at, finished_at, archived_at, updated_at";

/// Provides lifecycle operations for jobs.
pub struct JobRepo;

impl JobRepo {
    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Create a job, or return the existing one for the same idempotency key.
    ///
    /// The boolean is `true` when this call inserted the row. A queued job
    /// gets its dispatch outbox row in the same transaction.
    pub async fn create(pool: &PgPool, input: &CreateJob) -> Result<(Job, bool), sqlx::Error> {
        let status = if input.enqueue {
            JobStatus::Queued
        } else {
            JobStatus::Pending
        };

        let mut tx = pool.begin().await?;

        let query = format!(
            "INSERT INTO jobs (idempotency_key, queue_name, status_id, priority, payload, max_retries) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (idempotency_key) DO NOTHING \
             RETURNING {COLUMNS}"
        );
        let inserted = sqlx::query_as::<_, Job>(&query)
            .bind(&input.idempotency_key)
            .bind(&input.queue_name)
            .bind(status.id())
            .bind(input.priority)
            .bind(&input.payload)
            .bind(input.max_retries)
            .fetch_optional(&mut *tx)
            .await?;

        let (job, created) = match inserted {
            Some(job) => {
                if input.enqueue {
                    OutboxRepo::insert(&mut *tx, &job).await?;
                }
                (job, true)
            }
            None => {
                let query = format!("SELECT {COLUMNS} FROM jobs WHERE idempotency_key = $1");
                let existing = sqlx::query_as::<_, Job>(&query)
                    .bind(&input.idempotency_key)
                    .fetch_one(&mut *tx)
                    .await?;
                (existing, false)
            }
        };

        tx.commit().await?;
        Ok((job, created))
    }

    /// Move a `pending` job to `queued`. Returns `None` if it was not pending.
    ///
    /// Callers must record the dispatch in the same transaction; see
    /// [`dispatch::queue_job`](crate::dispatch::queue_job).
    pub async fn mark_queued(conn: &mut PgConnection, id: DbId) -> Result<Option<Job>, sqlx::Error> {
        let query = format!(
            "UPDATE jobs SET status_id = $2, visible_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status_id = $3 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .bind(JobStatus::Queued.id())
            .bind(JobStatus::Pending.id())
            .fetch_optional(conn)
            .await
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    /// Find a job by its ID.
    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<Job>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE id = $1");
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Find a job by the caller-supplied idempotency key.
    pub async fn find_by_idempotency_key(
        pool: &PgPool,
        key: &str,
    ) -> Result<Option<Job>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE idempotency_key = $1");
        sqlx::query_as::<_, Job>(&query)
            .bind(key)
            .fetch_optional(pool)
            .await
    }

    /// Read a job inside a transaction, taking its row lock.
    pub async fn lock_by_id(conn: &mut PgConnection, id: DbId) -> Result<Option<Job>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE");
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .fetch_optional(conn)
            .await
    }

    /// Per-status counts for one queue, including archived rows.
    pub async fn status_counts(
        pool: &PgPool,
        queue_name: &str,
    ) -> Result<Vec<StatusCount>, sqlx::Error> {
        sqlx::query_as::<_, StatusCount>(
            "SELECT status_id, COUNT(*) AS count FROM jobs \
             WHERE queue_name = $1 \
             GROUP BY status_id \
             ORDER BY status_id",
        )
        .bind(queue_name)
        .fetch_all(pool)
        .await
    }

    // -----------------------------------------------------------------------
    // Claiming
    // -----------------------------------------------------------------------

    /// Atomically claim up to `limit` ready jobs on `queue_name`.
    ///
    /// Rows locked by a concurrent claimer are skipped, so claimers never
    /// block each other and never receive the same job. Results come back
    /// in claim order: priority first, then age.
    pub async fn claim_ready_batch(
        pool: &PgPool,
        queue_name: &str,
        worker_id: &str,
        limit: i64,
        claim_ttl: Duration,
    ) -> Result<Vec<Job>, sqlx::Error> {
        let query = format!(
            "WITH ready AS ( \
                 SELECT id AS ready_id FROM jobs \
                 WHERE queue_name = $1 AND status_id = $2 AND visible_at <= NOW() \
                 ORDER BY priority DESC, created_at ASC, id ASC \
                 LIMIT $3 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE jobs \
             SET status_id = $4, claim_token = gen_random_uuid(), claimed_by = $5, \
                 claim_expires_at = NOW() + make_interval(secs => $6), \
                 queue_message_id = NULL, started_at = NOW(), finished_at = NULL, \
                 updated_at = NOW() \
             FROM ready WHERE jobs.id = ready.ready_id \
             RETURNING {COLUMNS}"
        );
        let mut jobs = sqlx::query_as::<_, Job>(&query)
            .bind(queue_name)
            .bind(JobStatus::Queued.id())
            .bind(limit)
            .bind(JobStatus::Processing.id())
            .bind(worker_id)
            .bind(claim_ttl.as_secs_f64())
            .fetch_all(pool)
            .await?;

        // UPDATE ... RETURNING does not preserve the CTE's order.
        jobs.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(jobs)
    }

    /// Claim one specific job if it is queued and visible.
    ///
    /// Used by the native queue strategy after it has received a message
    /// referencing the job.
    pub async fn claim_by_id(
        conn: &mut PgConnection,
        id: DbId,
        worker_id: &str,
        claim_ttl: Duration,
        queue_message_id: Option<i64>,
    ) -> Result<Option<Job>, sqlx::Error> {
        let query = format!(
            "UPDATE jobs \
             SET status_id = $2, claim_token = gen_random_uuid(), claimed_by = $3, \
                 claim_expires_at = NOW() + make_interval(secs => $4), \
                 queue_message_id = $5, started_at = NOW(), finished_at = NULL, \
                 updated_at = NOW() \
             WHERE id = $1 AND status_id = $6 AND visible_at <= NOW() \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .bind(JobStatus::Processing.id())
            .bind(worker_id)
            .bind(claim_ttl.as_secs_f64())
            .bind(queue_message_id)
            .bind(JobStatus::Queued.id())
            .fetch_optional(conn)
            .await
    }

    /// Lock `processing` jobs whose claim has expired.
    ///
    /// Rows locked by another sweeper (or a late result write) are skipped.
    pub async fn lock_expired_claims(
        conn: &mut PgConnection,
        limit: i64,
    ) -> Result<Vec<Job>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM jobs \
             WHERE status_id = $1 AND claim_expires_at < NOW() \
             ORDER BY claim_expires_at ASC \
             LIMIT $2 \
             FOR UPDATE SKIP LOCKED"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(JobStatus::Processing.id())
            .bind(limit)
            .fetch_all(conn)
            .await
    }

    // -----------------------------------------------------------------------
    // Outcome
    // -----------------------------------------------------------------------

    /// Mark a claimed job `completed` with its result.
    ///
    /// Returns `None` if `claim_token` no longer holds the job.
    pub async fn complete(
        conn: &mut PgConnection,
        id: DbId,
        claim_token: Uuid,
        result: &serde_json::Value,
    ) -> Result<Option<Job>, sqlx::Error> {
        let query = format!(
            "UPDATE jobs \
             SET status_id = $3, result = $4, error_message = NULL, failure_kind = NULL, \
                 claim_token = NULL, claim_expires_at = NULL, \
                 finished_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND claim_token = $2 AND status_id = $5 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .bind(claim_token)
            .bind(JobStatus::Completed.id())
            .bind(result)
            .bind(JobStatus::Processing.id())
            .fetch_optional(conn)
            .await
    }

    /// Mark a claimed job `failed` and release its claim.
    ///
    /// `failed` is never left committed: the caller follows up with
    /// [`requeue_failed`](Self::requeue_failed) or
    /// [`dead_letter_failed`](Self::dead_letter_failed) in the same
    /// transaction. Returns `None` if `claim_token` no longer holds the job.
    pub async fn mark_failed(
        conn: &mut PgConnection,
        id: DbId,
        claim_token: Uuid,
        failure: &Failure,
    ) -> Result<Option<Job>, sqlx::Error> {
        let query = format!(
            "UPDATE jobs \
             SET status_id = $3, error_message = $4, failure_kind = $5, \
                 claim_token = NULL, claim_expires_at = NULL, \
                 finished_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND claim_token = $2 AND status_id = $6 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .bind(claim_token)
            .bind(JobStatus::Failed.id())
            .bind(failure.error_message())
            .bind(failure.kind.as_str())
            .bind(JobStatus::Processing.id())
            .fetch_optional(conn)
            .await
    }

    /// `failed -> queued` with the new retry count, invisible for `delay`.
    pub async fn requeue_failed(
        conn: &mut PgConnection,
        id: DbId,
        retry_count: i32,
        delay: Duration,
    ) -> Result<Option<Job>, sqlx::Error> {
        let query = format!(
            "UPDATE jobs \
             SET status_id = $2, retry_count = $3, \
                 visible_at = NOW() + make_interval(secs => $4), \
                 claimed_by = NULL, finished_at = NULL, updated_at = NOW() \
             WHERE id = $1 AND status_id = $5 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .bind(JobStatus::Queued.id())
            .bind(retry_count)
            .bind(delay.as_secs_f64())
            .bind(JobStatus::Failed.id())
            .fetch_optional(conn)
            .await
    }

    /// `failed -> dead_lettered`. The terminal reason replaces the error
    /// message; `retry_count` is left as it stood.
    pub async fn dead_letter_failed(
        conn: &mut PgConnection,
        id: DbId,
        reason: &str,
    ) -> Result<Option<Job>, sqlx::Error> {
        let query = format!(
            "UPDATE jobs \
             SET status_id = $2, error_message = $3, updated_at = NOW() \
             WHERE id = $1 AND status_id = $4 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .bind(JobStatus::DeadLettered.id())
            .bind(reason)
            .bind(JobStatus::Failed.id())
            .fetch_optional(conn)
            .await
    }

    // -----------------------------------------------------------------------
    // Operator actions
    // -----------------------------------------------------------------------

    /// Cancel a job that is pending, queued or processing.
    ///
    /// Returns `true` if the job moved to `cancelled`, `false` if it was
    /// already terminal or does not exist. A running subprocess is not
    /// interrupted; its result is discarded by the claim-token fence.
    pub async fn cancel(pool: &PgPool, id: DbId) -> Result<bool, sqlx::Error> {
        let cancellable: Vec<StatusId> = JobStatus::cancellable_ids();
        let result = sqlx::query(
            "UPDATE jobs \
             SET status_id = $2, claim_token = NULL, claim_expires_at = NULL, \
                 finished_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status_id = ANY($3)",
        )
        .bind(id)
        .bind(JobStatus::Cancelled.id())
        .bind(&cancellable)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Mark terminal jobs that finished more than `older_than` ago as
    /// archived. Rows are never deleted. Returns the number archived.
    pub async fn archive_terminal(pool: &PgPool, older_than: Duration) -> Result<u64, sqlx::Error> {
        let terminal: Vec<StatusId> = JobStatus::terminal_ids();
        let result = sqlx::query(
            "UPDATE jobs SET archived_at = NOW(), updated_at = NOW() \
             WHERE status_id = ANY($1) AND archived_at IS NULL \
               AND finished_at < NOW() - make_interval(secs => $2)",
        )
        .bind(&terminal)
        .bind(older_than.as_secs_f64())
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }
}
