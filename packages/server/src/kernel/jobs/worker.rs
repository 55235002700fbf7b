//! Worker pool for processing background jobs.
//!
//! A bounded set of executors polls the queue, dispatches claimed jobs
//! through the task registry, and enforces per-task timeouts with a
//! watchdog. Graceful shutdown stops polling, drains in-flight handlers for
//! a grace period, then marks whatever is left for redelivery.
//!
//! ```text
//! WorkerPool
//!     │
//!     ├─► claim (JobQueue: promote delayed, pop by priority)
//!     ├─► execute (TaskRegistry handler, tokio timeout watchdog)
//!     └─► complete / fail / finish_cancelled (JobQueue handles retries)
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::job::{FailureKind, Job};
use super::queue::JobQueue;
use super::registry::{TaskContext, TaskRegistry};

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent executors.
    pub concurrency: usize,
    /// Queues to poll, in order.
    pub queues: Vec<String>,
    /// How long to wait when no jobs are available.
    pub poll_interval: Duration,
    /// Drain budget for in-flight handlers on shutdown.
    pub shutdown_grace: Duration,
    /// Worker ID for this instance.
    pub worker_id: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            queues: vec!["default".to_string()],
            poll_interval: Duration::from_millis(500),
            shutdown_grace: Duration::from_secs(30),
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

/// Bounded pool of job executors.
pub struct WorkerPool {
    queue: Arc<JobQueue>,
    registry: Arc<TaskRegistry>,
    config: WorkerConfig,
    running_jobs: Arc<Mutex<HashSet<String>>>,
}

impl WorkerPool {
    pub fn new(queue: Arc<JobQueue>, registry: Arc<TaskRegistry>, config: WorkerConfig) -> Self {
        Self {
            queue,
            registry,
            config,
            running_jobs: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Run until the shutdown token fires, then drain.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            concurrency = self.config.concurrency,
            queues = ?self.config.queues,
            "worker pool starting"
        );

        let mut executors = JoinSet::new();
        for index in 0..self.config.concurrency {
            let pool = self.clone();
            let token = shutdown.clone();
            executors.spawn(async move {
                pool.executor_loop(index, token).await;
            });
        }

        shutdown.cancelled().await;

        // Executors exit after their current job; give them the grace
        // period, then mark stragglers for redelivery.
        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            while executors.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            executors.abort_all();
            let stragglers: Vec<String> = self.running_jobs.lock().unwrap().drain().collect();
            for job_id in stragglers {
                warn!(job_id = %job_id, "job interrupted by shutdown, marking for redelivery");
                if let Err(e) = self
                    .queue
                    .fail(&job_id, "interrupted by shutdown", FailureKind::Shutdown)
                    .await
                {
                    error!(job_id = %job_id, error = %e, "failed to mark interrupted job");
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "worker pool stopped");
        Ok(())
    }

    async fn executor_loop(&self, index: usize, shutdown: CancellationToken) {
        // Executor 0 doubles as the lease reaper.
        let reap = index == 0;
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            if reap {
                for queue_name in &self.config.queues {
                    if let Err(e) = self.queue.reap_expired(queue_name).await {
                        error!(queue = %queue_name, error = %e, "lease reap failed");
                    }
                }
            }

            let mut claimed = None;
            for queue_name in &self.config.queues {
                match self.queue.claim(queue_name).await {
                    Ok(Some(job)) => {
                        claimed = Some(job);
                        break;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!(queue = %queue_name, error = %e, "claim failed");
                    }
                }
            }

            match claimed {
                Some(job) => {
                    self.process_job(job, &shutdown).await;
                }
                None => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }
    }

    /// Execute one claimed job with the timeout watchdog.
    async fn process_job(&self, job: Job, shutdown: &CancellationToken) {
        let job_id = job.job_id.clone();
        let task_name = job.task_name.clone();
        self.running_jobs.lock().unwrap().insert(job_id.clone());

        let job_cancel = shutdown.child_token();
        let ctx = TaskContext::new(&job, self.queue.clone(), job_cancel.clone());
        let timeout = Duration::from_secs(job.timeout_seconds);

        debug!(job_id = %job_id, task = %task_name, attempt = job.attempts, "executing job");

        let outcome = tokio::time::timeout(timeout, self.registry.execute(&task_name, ctx)).await;

        let cancel_requested = self
            .queue
            .cancel_requested(&job_id)
            .await
            .unwrap_or(false);

        let result = match outcome {
            Ok(Ok(value)) => {
                debug!(job_id = %job_id, task = %task_name, "job succeeded");
                self.queue.complete(&job_id, value).await
            }
            Ok(Err(_)) if cancel_requested => {
                info!(job_id = %job_id, task = %task_name, "job stopped on cancellation");
                self.queue.finish_cancelled(&job_id).await
            }
            Ok(Err(e)) => {
                warn!(job_id = %job_id, task = %task_name, error = %e, "job failed");
                let kind = if shutdown.is_cancelled() {
                    FailureKind::Shutdown
                } else {
                    classify_error(&e)
                };
                self.queue.fail(&job_id, &format!("{:#}", e), kind).await
            }
            Err(_elapsed) => {
                warn!(job_id = %job_id, task = %task_name, timeout_secs = job.timeout_seconds, "job timed out");
                job_cancel.cancel();
                self.queue
                    .fail(
                        &job_id,
                        &format!("timed out after {}s", job.timeout_seconds),
                        FailureKind::TimedOut,
                    )
                    .await
            }
        };

        if let Err(e) = result {
            error!(job_id = %job_id, error = %e, "failed to record job outcome");
        }

        self.running_jobs.lock().unwrap().remove(&job_id);
    }
}

/// Classify a handler error for the retry decision. Validation-shaped
/// errors will not pass on a second try; everything else is transient.
fn classify_error(error: &anyhow::Error) -> FailureKind {
    let message = error.to_string().to_lowercase();
    if message.contains("not found")
        || message.contains("invalid")
        || message.contains("unauthorized")
        || message.contains("forbidden")
        || message.contains("deserialize")
        || message.contains("parse")
    {
        FailureKind::NonRetryable
    } else {
        FailureKind::Retryable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.concurrency, 4);
        assert!(config.worker_id.starts_with("worker-"));
        assert_eq!(config.queues, vec!["default".to_string()]);
    }

    #[test]
    fn config_with_worker_id() {
        let config = WorkerConfig::with_worker_id("my-worker");
        assert_eq!(config.worker_id, "my-worker");
    }

    #[test]
    fn classify_retryable() {
        assert_eq!(
            classify_error(&anyhow::anyhow!("connection reset by peer")),
            FailureKind::Retryable
        );
    }

    #[test]
    fn classify_non_retryable() {
        assert_eq!(
            classify_error(&anyhow::anyhow!("workspace not found")),
            FailureKind::NonRetryable
        );
        assert_eq!(
            classify_error(&anyhow::anyhow!("failed to deserialize payload")),
            FailureKind::NonRetryable
        );
    }
}
