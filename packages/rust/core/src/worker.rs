//! Bounded-concurrency worker pools, one per stage.
//!
//! A pool claims jobs from its stage's queue, runs the stage handler under a
//! per-job timeout, and records the outcome: complete, retry with backoff,
//! or terminal failure. A hung handler only occupies its own slot.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use serde_json::Value;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use refeed_shared::{RefeedError, Result, WorkerConfig};
use refeed_storage::{Job, JobQueue};

use crate::jobs::{JobPayload, Stage};
use crate::retry::{RetryDecision, RetryPolicy};

/// Executes one stage's jobs. The returned value becomes the job result,
/// visible to the parent through `children_values`.
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn handle(&self, job: &Job, payload: JobPayload) -> Result<Value>;
}

/// Runtime settings of a pool.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub concurrency: usize,
    pub policy: RetryPolicy,
    /// Wall-clock limit per attempt.
    pub timeout: Duration,
    /// Sleep between claims when the queue is empty.
    pub poll_interval: Duration,
}

impl PoolSettings {
    pub fn from_config(config: &WorkerConfig, poll_interval: Duration) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            policy: RetryPolicy::from_config(config),
            timeout: Duration::from_secs(config.timeout_secs),
            poll_interval,
        }
    }
}

pub struct WorkerPool {
    stage: Stage,
    queue: JobQueue,
    handler: Arc<dyn StageHandler>,
    settings: PoolSettings,
    worker_id: String,
}

impl WorkerPool {
    pub fn new(
        stage: Stage,
        queue: JobQueue,
        handler: Arc<dyn StageHandler>,
        settings: PoolSettings,
    ) -> Self {
        Self {
            worker_id: format!("{stage}-{}", uuid::Uuid::now_v7().simple()),
            stage,
            queue,
            handler,
            settings,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Claim and run jobs until `shutdown` flips to true (or its sender is
    /// dropped). Jobs already running are allowed to finish.
    #[instrument(skip_all, fields(stage = %self.stage))]
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let slots = Arc::new(Semaphore::new(self.settings.concurrency));
        let mut running = JoinSet::new();
        info!(
            concurrency = self.settings.concurrency,
            attempts = self.settings.policy.max_attempts,
            "worker pool started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            while let Some(joined) = running.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "job task panicked");
                }
            }

            let permit = tokio::select! {
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            match self.queue.claim(self.stage.as_str(), &self.worker_id).await {
                Ok(Some(job)) => {
                    let pool = self.clone();
                    running.spawn(async move {
                        let _permit = permit;
                        pool.execute(job).await;
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(self.settings.poll_interval) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                Err(e) => {
                    drop(permit);
                    warn!(error = %e, "claim failed");
                    tokio::time::sleep(self.settings.poll_interval).await;
                }
            }
        }

        debug!(in_flight = running.len(), "waiting for running jobs");
        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "job task panicked");
            }
        }
        info!("worker pool stopped");
    }

    /// Run one claimed job and record its outcome.
    #[instrument(skip_all, fields(stage = %self.stage, job_id = %job.id, attempt = job.attempts))]
    async fn execute(&self, job: Job) {
        let started = Instant::now();
        let outcome = match JobPayload::from_job(&job) {
            Ok(payload) => {
                let handled = self.handler.handle(&job, payload);
                match tokio::time::timeout(self.settings.timeout, handled).await {
                    Ok(result) => result,
                    Err(_) => Err(RefeedError::Timeout {
                        operation: format!("{} job {}", self.stage, job.id),
                        after: self.settings.timeout,
                    }),
                }
            }
            Err(e) => Err(e),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let recorded = match outcome {
            Ok(value) => {
                info!(elapsed_ms, "job completed");
                self.queue.complete(&job.id, &value).await
            }
            Err(e) => match self.settings.policy.decide(job.attempts, &e) {
                RetryDecision::Retry { delay } => {
                    let retry_in_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX / 2);
                    warn!(error = %e, elapsed_ms, retry_in_ms, "job failed, will retry");
                    let run_at = Utc::now() + TimeDelta::milliseconds(retry_in_ms);
                    self.queue.retry(&job.id, &e.to_string(), run_at).await
                }
                RetryDecision::Exhausted => {
                    let terminal = RefeedError::TerminalJob {
                        job_id: job.id.clone(),
                        message: format!("gave up after {} attempts: {e}", job.attempts),
                    };
                    error!(error = %terminal, "job failed permanently");
                    self.queue.fail(&job.id, &terminal.to_string()).await
                }
                RetryDecision::NotRetryable => {
                    error!(error = %e, "job failed with a non-retryable error");
                    self.queue.fail(&job.id, &e.to_string()).await
                }
            },
        };
        if let Err(e) = recorded {
            error!(error = %e, "could not record job outcome");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use refeed_storage::{FlowNode, JobStatus, Storage};

    use super::*;
    use crate::jobs::BatchJob;

    pub(crate) async fn temp_queue() -> JobQueue {
        let path = std::env::temp_dir().join(format!("refeed_worker_{}.db", uuid::Uuid::now_v7()));
        JobQueue::new(Storage::open(&path).await.unwrap())
    }

    fn batch_payload() -> Value {
        JobPayload::Batch(BatchJob {
            feed: "f".into(),
            chunk_index: 0,
            item_count: 0,
        })
        .to_value()
        .unwrap()
    }

    /// Records when it was called; fails with the given error every time.
    struct Failing {
        calls: Mutex<Vec<Instant>>,
        error: fn() -> RefeedError,
    }

    #[async_trait]
    impl StageHandler for Failing {
        async fn handle(&self, _job: &Job, _payload: JobPayload) -> Result<Value> {
            self.calls.lock().unwrap().push(Instant::now());
            Err((self.error)())
        }
    }

    struct Sleepy;

    #[async_trait]
    impl StageHandler for Sleepy {
        async fn handle(&self, _job: &Job, _payload: JobPayload) -> Result<Value> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Value::Null)
        }
    }

    fn settings(attempts: u32, base_ms: u64, timeout: Duration) -> PoolSettings {
        PoolSettings {
            concurrency: 2,
            policy: RetryPolicy::new(attempts, Duration::from_millis(base_ms)),
            timeout,
            poll_interval: Duration::from_millis(5),
        }
    }

    async fn wait_settled(queue: &JobQueue, id: &str) -> Job {
        for _ in 0..2000 {
            let job = queue.get(id).await.unwrap().unwrap();
            if matches!(job.status, JobStatus::Completed | JobStatus::Failed) {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {id} never settled");
    }

    async fn run_pool(
        queue: &JobQueue,
        handler: Arc<dyn StageHandler>,
        settings: PoolSettings,
        id: &str,
    ) -> Job {
        let (tx, rx) = watch::channel(false);
        let pool = Arc::new(WorkerPool::new(Stage::Batch, queue.clone(), handler, settings));
        let handle = tokio::spawn(pool.run(rx));
        let job = wait_settled(queue, id).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
        job
    }

    #[tokio::test]
    async fn always_failing_job_runs_exactly_max_attempts_with_growing_delays() {
        let queue = temp_queue().await;
        let id = queue
            .enqueue_flow(&FlowNode::new("batch", "f", batch_payload()))
            .await
            .unwrap();
        let handler = Arc::new(Failing {
            calls: Mutex::new(Vec::new()),
            error: || RefeedError::transient("https://example.com", "render crashed"),
        });

        let pool = settings(5, 20, Duration::from_secs(5));
        let job = run_pool(&queue, handler.clone(), pool, &id).await;

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 5);
        assert!(job.error.unwrap().contains("gave up after 5 attempts"));
        let calls = handler.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 5);
        let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
        for pair in gaps.windows(2) {
            assert!(pair[1] >= pair[0], "delays shrank: {gaps:?}");
        }
        assert!(gaps[0] >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn non_retryable_error_fails_on_first_attempt() {
        let queue = temp_queue().await;
        let id = queue
            .enqueue_flow(&FlowNode::new("batch", "f", batch_payload()))
            .await
            .unwrap();
        let handler = Arc::new(Failing {
            calls: Mutex::new(Vec::new()),
            error: || RefeedError::permanent("article has no link"),
        });

        let pool = settings(5, 1, Duration::from_secs(5));
        let job = run_pool(&queue, handler.clone(), pool, &id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(handler.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn hung_handler_times_out_and_is_retried() {
        let queue = temp_queue().await;
        let id = queue
            .enqueue_flow(&FlowNode::new("batch", "f", batch_payload()))
            .await
            .unwrap();

        let pool = settings(2, 1, Duration::from_millis(30));
        let job = run_pool(&queue, Arc::new(Sleepy), pool, &id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 2);
        assert!(job.error.unwrap().contains("timed out"));
    }
}
