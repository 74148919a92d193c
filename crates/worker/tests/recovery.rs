//! Claim expiry, late results and worker presence.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use orbital_core::retry::{Failure, FailureKind};
use orbital_core::status::{JobStatus, WorkerStatus};
use orbital_db::models::job::{CreateJob, Job};
use orbital_db::queue::{JobQueue, QueueStrategy, SkipLockedQueue};
use orbital_db::repositories::{DeadLetterRepo, JobRepo, WorkerPresenceRepo};
use orbital_worker::active::ActiveJobs;
use orbital_worker::heartbeat::Heartbeat;
use orbital_worker::reaper::{self, SweepStats};
use orbital_worker::result_writer::{self, Outcome, RetryRules};
use orbital_worker::WorkerConfig;
use serde_json::json;
use sqlx::PgPool;

fn test_config(worker_id: &str) -> WorkerConfig {
    let vars: HashMap<&str, &str> = [
        ("DATABASE_URL", "postgres://unused"),
        ("WORKER_ID", worker_id),
        ("HOSTNAME", "test-host"),
        ("RETRY_BASE_DELAY_SECS", "0"),
        ("RETRY_MAX_DELAY_SECS", "0"),
        ("RETRY_JITTER", "0"),
        ("MAX_CONCURRENT_JOBS", "2"),
    ]
    .into_iter()
    .collect();
    WorkerConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).expect("valid test config")
}

async fn submit(pool: &PgPool, key: &str, max_retries: i32) -> Job {
    let input = CreateJob::new(key, json!({"molecule": "H2O"})).with_max_retries(max_retries);
    JobRepo::create(pool, &input).await.unwrap().0
}

/// Push every claim for `job_id` into the past.
async fn expire_claim(pool: &PgPool, job_id: i64) {
    sqlx::query("UPDATE jobs SET claim_expires_at = NOW() - INTERVAL '1 second' WHERE id = $1")
        .bind(job_id)
        .execute(pool)
        .await
        .unwrap();
}

// ---------------------------------------------------------------------------
// Reaper
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../db/migrations")]
async fn test_expired_claim_is_reclaimed_by_another_worker(pool: PgPool) {
    let queue = SkipLockedQueue::new();
    let rules = RetryRules::from_config(&test_config("reaper"));
    let job = submit(&pool, "crash", 3).await;

    // Worker A claims and then disappears.
    let claimed = queue
        .claim_batch(&pool, "default", "worker-a", 1, Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    let stale_claim = claimed[0].claim.clone();
    expire_claim(&pool, job.id).await;

    let stats = reaper::sweep(&pool, &queue, &rules).await.unwrap();
    assert_eq!(stats, SweepStats { requeued: 1, dead_lettered: 0, errors: 0 });

    let requeued = JobRepo::find_by_id(&pool, job.id).await.unwrap().unwrap();
    assert_eq!(requeued.status(), Some(JobStatus::Queued));
    assert_eq!(requeued.retry_count, 1);
    assert_eq!(requeued.failure_kind.as_deref(), Some("claim_expired"));
    assert!(requeued.claim_token.is_none());

    // Worker B picks it up and finishes it.
    let reclaimed = queue
        .claim_batch(&pool, "default", "worker-b", 1, Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(reclaimed.len(), 1);
    let fresh_claim = reclaimed[0].claim.clone();
    assert_ne!(fresh_claim.token, stale_claim.token);

    let outcome = result_writer::record_success(&pool, &queue, &fresh_claim, &json!({"energy": -5.0}))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Completed);

    // Worker A comes back with a result for a claim it no longer holds.
    let late = result_writer::record_success(&pool, &queue, &stale_claim, &json!({"energy": 99.0}))
        .await
        .unwrap();
    assert_eq!(late, Outcome::Superseded);

    let done = JobRepo::find_by_id(&pool, job.id).await.unwrap().unwrap();
    assert_eq!(done.status(), Some(JobStatus::Completed));
    assert_eq!(done.claimed_by.as_deref(), Some("worker-b"));
    assert_eq!(done.result, Some(json!({"energy": -5.0})));
}

#[sqlx::test(migrations = "../db/migrations")]
async fn test_reaper_dead_letters_when_budget_spent(pool: PgPool) {
    let queue = SkipLockedQueue::new();
    let rules = RetryRules::from_config(&test_config("reaper"));
    let job = submit(&pool, "crash-loop", 0).await;

    queue
        .claim_batch(&pool, "default", "worker-a", 1, Duration::from_secs(60))
        .await
        .unwrap();
    expire_claim(&pool, job.id).await;

    let stats = reaper::sweep(&pool, &queue, &rules).await.unwrap();
    assert_eq!(stats.dead_lettered, 1);

    let dead = JobRepo::find_by_id(&pool, job.id).await.unwrap().unwrap();
    assert_eq!(dead.status(), Some(JobStatus::DeadLettered));
    let record = DeadLetterRepo::find_by_job_id(&pool, job.id).await.unwrap().unwrap();
    assert_eq!(record.failure_kind.as_deref(), Some("claim_expired"));
    assert!(record.reason.contains("worker-a"), "{}", record.reason);
}

#[sqlx::test(migrations = "../db/migrations")]
async fn test_reaper_ignores_live_claims(pool: PgPool) {
    let queue = SkipLockedQueue::new();
    let rules = RetryRules::from_config(&test_config("reaper"));
    let job = submit(&pool, "live", 3).await;

    queue
        .claim_batch(&pool, "default", "worker-a", 1, Duration::from_secs(60))
        .await
        .unwrap();

    let stats = reaper::sweep(&pool, &queue, &rules).await.unwrap();
    assert_eq!(stats, SweepStats::default());

    let still = JobRepo::find_by_id(&pool, job.id).await.unwrap().unwrap();
    assert_eq!(still.status(), Some(JobStatus::Processing));
    assert_eq!(still.retry_count, 0);
}

// ---------------------------------------------------------------------------
// Result writer
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../db/migrations")]
async fn test_failures_walk_the_retry_budget(pool: PgPool) {
    let queue = SkipLockedQueue::new();
    let rules = RetryRules::from_config(&test_config("writer"));
    let job = submit(&pool, "flaky", 2).await;
    let failure = Failure::new(FailureKind::Execution, "exit code 1");

    for expected_retry in 1..=2 {
        let claimed = queue
            .claim_batch(&pool, "default", "writer", 1, Duration::from_secs(60))
            .await
            .unwrap();
        let outcome = result_writer::record_failure(&pool, &queue, &claimed[0].claim, &failure, &rules)
            .await
            .unwrap();
        assert_matches!(outcome, Outcome::Requeued { retry_count, .. } if retry_count == expected_retry);
    }

    let claimed = queue
        .claim_batch(&pool, "default", "writer", 1, Duration::from_secs(60))
        .await
        .unwrap();
    let outcome = result_writer::record_failure(&pool, &queue, &claimed[0].claim, &failure, &rules)
        .await
        .unwrap();
    assert_matches!(outcome, Outcome::DeadLettered { reason } if reason.contains("after 3 attempts"));

    let record = DeadLetterRepo::find_by_job_id(&pool, job.id).await.unwrap().unwrap();
    assert_eq!(record.payload, json!({"molecule": "H2O"}));
    assert_eq!(record.retry_count, 2);
}

#[sqlx::test(migrations = "../db/migrations")]
async fn test_configured_cap_overrides_job_budget(pool: PgPool) {
    let queue = SkipLockedQueue::new();
    let mut rules = RetryRules::from_config(&test_config("writer"));
    rules.max_retries = 0;
    submit(&pool, "capped", 5).await;

    let claimed = queue
        .claim_batch(&pool, "default", "writer", 1, Duration::from_secs(60))
        .await
        .unwrap();
    let failure = Failure::new(FailureKind::Execution, "exit code 1");
    let outcome = result_writer::record_failure(&pool, &queue, &claimed[0].claim, &failure, &rules)
        .await
        .unwrap();
    assert_matches!(outcome, Outcome::DeadLettered { .. });
}

#[sqlx::test(migrations = "../db/migrations")]
async fn test_failure_after_cancel_is_discarded(pool: PgPool) {
    let queue = SkipLockedQueue::new();
    let rules = RetryRules::from_config(&test_config("writer"));
    let job = submit(&pool, "cancelled", 3).await;

    let claimed = queue
        .claim_batch(&pool, "default", "writer", 1, Duration::from_secs(60))
        .await
        .unwrap();
    assert!(JobRepo::cancel(&pool, job.id).await.unwrap());

    let failure = Failure::new(FailureKind::Timeout, "too slow");
    let outcome = result_writer::record_failure(&pool, &queue, &claimed[0].claim, &failure, &rules)
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Superseded);

    let after = JobRepo::find_by_id(&pool, job.id).await.unwrap().unwrap();
    assert_eq!(after.status(), Some(JobStatus::Cancelled));
    assert!(DeadLetterRepo::find_by_job_id(&pool, job.id).await.unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Heartbeat
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../db/migrations")]
async fn test_heartbeat_reports_load_and_lifecycle(pool: PgPool) {
    let config = Arc::new(test_config("hb-worker"));
    let active = ActiveJobs::new();
    let heartbeat = Heartbeat::new(pool.clone(), Arc::clone(&config), active.clone(), QueueStrategy::Fallback);

    heartbeat.register().await.unwrap();
    let registered = WorkerPresenceRepo::find_by_id(&pool, "hb-worker").await.unwrap().unwrap();
    assert_eq!(registered.status_id, WorkerStatus::Idle.id());
    assert_eq!(registered.hostname, "test-host");
    assert_eq!(registered.max_concurrent_jobs, 2);
    assert_eq!(registered.capabilities["queue_strategy"], "fallback");

    let _a = active.track(11);
    let _b = active.track(7);
    heartbeat.beat().await.unwrap();
    let busy = WorkerPresenceRepo::find_by_id(&pool, "hb-worker").await.unwrap().unwrap();
    assert_eq!(busy.status_id, WorkerStatus::Busy.id());
    assert_eq!(busy.active_job_ids, vec![7, 11]);
    assert_eq!(busy.started_at, registered.started_at);
    assert!(busy.last_heartbeat_at >= registered.last_heartbeat_at);

    heartbeat.mark(WorkerStatus::Draining).await;
    let draining = WorkerPresenceRepo::find_by_id(&pool, "hb-worker").await.unwrap().unwrap();
    assert_eq!(draining.status_id, WorkerStatus::Draining.id());
}
