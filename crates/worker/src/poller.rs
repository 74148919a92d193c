//! Worker poller: claims work within a local concurrency budget and runs
//! each claimed job as its own task.
//!
//! The poll loop never waits on a running job. Each execution holds one
//! semaphore permit, so at most `max_concurrent_jobs` run at once in this
//! process. On shutdown the loop stops claiming and waits, bounded by
//! `shutdown_timeout`, for in-flight executions.

use std::sync::Arc;
use std::time::Duration;

use orbital_core::execution::CalculationRunner;
use orbital_core::retry::{Failure, FailureKind};
use orbital_db::queue::{ClaimedJob, JobQueue};
use sqlx::PgPool;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::active::ActiveJobs;
use crate::config::WorkerConfig;
use crate::result_writer::{self, Outcome, RetryRules};

pub struct Worker<R> {
    pool: PgPool,
    queue: Arc<dyn JobQueue>,
    runner: Arc<R>,
    config: Arc<WorkerConfig>,
    rules: RetryRules,
    active: ActiveJobs,
    permits: Arc<Semaphore>,
    tasks: TaskTracker,
}

impl<R: CalculationRunner + 'static> Worker<R> {
    pub fn new(
        pool: PgPool,
        queue: Arc<dyn JobQueue>,
        runner: Arc<R>,
        config: Arc<WorkerConfig>,
        active: ActiveJobs,
    ) -> Self {
        Self {
            rules: RetryRules::from_config(&config),
            permits: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
            pool,
            queue,
            runner,
            config,
            active,
            tasks: TaskTracker::new(),
        }
    }

    /// Replace the retry rules built from configuration.
    pub fn with_rules(mut self, rules: RetryRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn active_jobs(&self) -> &ActiveJobs {
        &self.active
    }

    /// Poll until `cancel` fires, then drain in-flight executions.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            worker_id = %self.config.worker_id,
            queue = %self.config.queue_name,
            strategy = %self.queue.strategy(),
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Worker poller started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(in_flight = self.active.len(), "Worker poller stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = Arc::clone(&self).poll_once().await {
                        tracing::error!(error = %e, "Claim cycle failed");
                    }
                }
            }
        }

        self.drain(self.config.shutdown_timeout).await;
    }

    /// One tick: claim up to the free budget and spawn an execution for
    /// each claimed job. Returns the number claimed.
    pub async fn poll_once(self: Arc<Self>) -> Result<usize, orbital_db::queue::QueueError> {
        let free = self.permits.available_permits();
        if free == 0 {
            tracing::debug!("Concurrency budget exhausted, skipping claim");
            return Ok(0);
        }

        let claimed = self
            .queue
            .claim_batch(
                &self.pool,
                &self.config.queue_name,
                &self.config.worker_id,
                free as i64,
                self.config.visibility_timeout(),
            )
            .await?;
        let count = claimed.len();

        for job in claimed {
            // Only this loop takes permits, so the free count cannot shrink
            // between the check above and here.
            let permit = match Arc::clone(&self.permits).try_acquire_owned() {
                Ok(permit) => permit,
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        job_id = job.claim.job_id,
                        "No execution slot; job left for claim expiry",
                    );
                    continue;
                }
            };

            let worker = Arc::clone(&self);
            self.tasks.spawn(async move {
                worker.execute(job).await;
                drop(permit);
            });
        }

        if count > 0 {
            tracing::debug!(claimed = count, free, "Claimed jobs");
        }
        Ok(count)
    }

    /// Run one claimed job and record its outcome. Never panics the poller;
    /// store errors leave the job claimed until the reaper recovers it.
    async fn execute(&self, claimed: ClaimedJob) {
        let ClaimedJob { claim, job } = claimed;
        let _guard = self.active.track(claim.job_id);
        tracing::info!(
            job_id = claim.job_id,
            retry_count = job.retry_count,
            priority = job.priority,
            "Job execution started",
        );

        let outcome = match self.runner.run(&job.payload).await {
            Ok(result) => match serde_json::to_value(&result) {
                Ok(value) => {
                    tracing::info!(job_id = claim.job_id, energy = result.energy, "Calculation succeeded");
                    result_writer::record_success(&self.pool, self.queue.as_ref(), &claim, &value).await
                }
                Err(e) => {
                    let failure = Failure::new(FailureKind::OutputParse, e.to_string());
                    result_writer::record_failure(&self.pool, self.queue.as_ref(), &claim, &failure, &self.rules)
                        .await
                }
            },
            Err(e) => {
                let failure = e.to_failure();
                tracing::warn!(job_id = claim.job_id, kind = %failure.kind, error = %e, "Calculation failed");
                result_writer::record_failure(&self.pool, self.queue.as_ref(), &claim, &failure, &self.rules)
                    .await
            }
        };

        match outcome {
            Ok(Outcome::Completed) => {
                tracing::info!(job_id = claim.job_id, "Job completed");
            }
            Ok(Outcome::Requeued { retry_count, delay }) => {
                tracing::info!(
                    job_id = claim.job_id,
                    retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Job requeued for retry",
                );
            }
            Ok(Outcome::DeadLettered { reason }) => {
                tracing::warn!(job_id = claim.job_id, reason = %reason, "Job dead-lettered");
            }
            Ok(Outcome::Superseded) => {}
            Err(e) => {
                tracing::error!(
                    job_id = claim.job_id,
                    error = %e,
                    "Failed to record job outcome; job stays claimed until expiry",
                );
            }
        }
    }

    /// Stop accepting tasks and wait up to `timeout` for running ones.
    ///
    /// Returns `true` if every execution finished in time. Executions still
    /// running afterwards keep their claims; the reaper recovers them once
    /// the claims expire.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tasks.close();
        match tokio::time::timeout(timeout, self.tasks.wait()).await {
            Ok(()) => {
                tracing::info!("All in-flight jobs finished");
                true
            }
            Err(_) => {
                tracing::warn!(
                    still_running = self.active.len(),
                    timeout_secs = timeout.as_secs(),
                    "Shutdown timeout reached with jobs in flight",
                );
                false
            }
        }
    }
}
