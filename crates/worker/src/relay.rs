//! Outbox relay loop: publishes pending dispatch rows to the queue.

use std::sync::Arc;
use std::time::Duration;

use orbital_db::dispatch;
use orbital_db::queue::JobQueue;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

/// Outbox rows published per pass.
const RELAY_BATCH_SIZE: i64 = 100;

/// Publish due outbox rows every `interval` until cancelled.
///
/// A full batch is followed immediately by another pass instead of waiting
/// for the next tick.
pub async fn run(pool: PgPool, queue: Arc<dyn JobQueue>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    tracing::info!(interval_ms = interval.as_millis() as u64, "Outbox relay started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Outbox relay stopping");
                break;
            }
            _ = ticker.tick() => {
                loop {
                    match dispatch::publish_pending(&pool, queue.as_ref(), RELAY_BATCH_SIZE).await {
                        Ok(stats) => {
                            if stats.dispatched > 0 || stats.failed > 0 {
                                tracing::debug!(
                                    dispatched = stats.dispatched,
                                    failed = stats.failed,
                                    "Outbox relay pass",
                                );
                            }
                            let handled = (stats.dispatched + stats.failed) as i64;
                            if handled < RELAY_BATCH_SIZE || cancel.is_cancelled() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Outbox relay pass failed");
                            break;
                        }
                    }
                }
            }
        }
    }
}
