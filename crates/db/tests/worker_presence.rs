use std::time::Duration;

use orbital_core::status::WorkerStatus;
use orbital_db::models::worker_presence::PresenceUpdate;
use orbital_db::repositories::WorkerPresenceRepo;
use serde_json::json;
use sqlx::PgPool;

fn update(worker_id: &str, active: Vec<i64>) -> PresenceUpdate {
    PresenceUpdate {
        worker_id: worker_id.to_string(),
        hostname: "host-1".to_string(),
        queue_name: "default".to_string(),
        status_id: if active.is_empty() {
            WorkerStatus::Idle.id()
        } else {
            WorkerStatus::Busy.id()
        },
        max_concurrent_jobs: 3,
        active_job_ids: active,
        capabilities: json!({"queue_strategy": "fallback"}),
    }
}

async fn age_heartbeat(pool: &PgPool, worker_id: &str, secs: i32) {
    sqlx::query(
        "UPDATE worker_presence \
         SET last_heartbeat_at = NOW() - make_interval(secs => $2) WHERE worker_id = $1",
    )
    .bind(worker_id)
    .bind(secs as f64)
    .execute(pool)
    .await
    .unwrap();
}

#[sqlx::test(migrations = "./migrations")]
async fn test_heartbeat_keeps_started_at_register_resets_it(pool: PgPool) {
    let first = WorkerPresenceRepo::register(&pool, &update("w1", vec![])).await.unwrap();
    sqlx::query("UPDATE worker_presence SET started_at = started_at - INTERVAL '1 hour'")
        .execute(&pool)
        .await
        .unwrap();

    let beat = WorkerPresenceRepo::heartbeat(&pool, &update("w1", vec![4, 9])).await.unwrap();
    assert!(beat.started_at < first.started_at);
    assert_eq!(beat.active_job_count, 2);
    assert_eq!(beat.current_job_id, Some(4));
    assert_eq!(beat.status_id, WorkerStatus::Busy.id());

    let restarted = WorkerPresenceRepo::register(&pool, &update("w1", vec![])).await.unwrap();
    assert!(restarted.started_at >= first.started_at);
    assert_eq!(restarted.active_job_count, 0);
    assert_eq!(restarted.current_job_id, None);
}

#[sqlx::test(migrations = "./migrations")]
async fn test_list_stale_skips_offline_workers(pool: PgPool) {
    for id in ["fresh", "silent", "gone"] {
        WorkerPresenceRepo::register(&pool, &update(id, vec![])).await.unwrap();
    }
    age_heartbeat(&pool, "silent", 600).await;
    age_heartbeat(&pool, "gone", 600).await;
    assert!(WorkerPresenceRepo::mark_status(&pool, "gone", WorkerStatus::Offline).await.unwrap());
    age_heartbeat(&pool, "gone", 600).await;

    let stale = WorkerPresenceRepo::list_stale(&pool, Duration::from_secs(120)).await.unwrap();
    let ids: Vec<_> = stale.iter().map(|w| w.worker_id.as_str()).collect();
    assert_eq!(ids, vec!["silent"]);
}

#[sqlx::test(migrations = "./migrations")]
async fn test_mark_status_on_unknown_worker(pool: PgPool) {
    let found = WorkerPresenceRepo::mark_status(&pool, "nobody", WorkerStatus::Draining)
        .await
        .unwrap();
    assert!(!found);
}
