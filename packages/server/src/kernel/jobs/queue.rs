//! Key-value-backed durable job queue.
//!
//! Per queue the store holds three FIFO ready lists (one per priority tier,
//! consulted high to normal to low), a delayed sorted set keyed by
//! `scheduled_for`, an in-flight sorted set keyed by lease expiry, and a
//! dead-letter list. The full job record lives at `job:<id>` as JSON.
//! Delivery is at-least-once; handlers are expected to be idempotent.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;

use crate::common::{db_id, KernelError, KernelResult};
use crate::kernel::kv::{epoch_now, KvStore};

use super::job::{backoff_delay, FailureKind, Job, JobPriority, JobProgress, JobStatus};
use super::registry::TaskRegistry;

/// Completed/dead/cancelled records are kept this long for status queries.
const TERMINAL_RECORD_TTL_SECS: u64 = 7 * 86400;

/// Extra lease time past the task timeout before a worker is presumed dead.
const LEASE_GRACE_SECS: u64 = 30;

/// Result of an enqueue: either a fresh job or the existing record for a
/// duplicate client-supplied job id.
#[derive(Debug, Clone)]
pub enum EnqueueResult {
    Created(Job),
    Duplicate(Job),
}

impl EnqueueResult {
    pub fn job(&self) -> &Job {
        match self {
            EnqueueResult::Created(job) | EnqueueResult::Duplicate(job) => job,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueResult::Created(_))
    }
}

/// Optional enqueue parameters. `job_id` doubles as an idempotency key.
#[derive(Debug, Clone, Default, TypedBuilder)]
pub struct EnqueueOptions {
    #[builder(default, setter(strip_option, into))]
    pub job_id: Option<String>,
    #[builder(default)]
    pub priority: JobPriority,
    #[builder(default, setter(strip_option))]
    pub delay_seconds: Option<u64>,
    #[builder(default, setter(strip_option))]
    pub max_attempts: Option<u32>,
    #[builder(default, setter(strip_option))]
    pub timeout_seconds: Option<u64>,
    #[builder(default, setter(strip_option, into))]
    pub user_id: Option<String>,
    #[builder(default, setter(strip_option))]
    pub metadata: Option<Value>,
}

/// Per-queue depth counters for admin and readiness surfaces.
#[derive(Debug, serde::Serialize)]
pub struct QueueDepths {
    pub ready: u64,
    pub delayed: u64,
    pub in_flight: u64,
    pub dead: u64,
}

type BackoffFn = Box<dyn Fn(u32) -> std::time::Duration + Send + Sync>;

pub struct JobQueue {
    kv: Arc<dyn KvStore>,
    tasks: Arc<TaskRegistry>,
    prefix: String,
    backoff: BackoffFn,
    progress_hub: Mutex<HashMap<String, broadcast::Sender<JobProgress>>>,
}

impl JobQueue {
    pub fn new(kv: Arc<dyn KvStore>, tasks: Arc<TaskRegistry>, prefix: &str) -> Self {
        Self {
            kv,
            tasks,
            prefix: prefix.to_string(),
            backoff: Box::new(backoff_delay),
            progress_hub: Mutex::new(HashMap::new()),
        }
    }

    /// Override the retry backoff schedule (tests use a zero delay).
    pub fn with_backoff<F>(mut self, backoff: F) -> Self
    where
        F: Fn(u32) -> std::time::Duration + Send + Sync + 'static,
    {
        self.backoff = Box::new(backoff);
        self
    }

    pub fn task_registry(&self) -> &Arc<TaskRegistry> {
        &self.tasks
    }

    // ------------------------------------------------------------------
    // Keys
    // ------------------------------------------------------------------

    fn job_key(&self, job_id: &str) -> String {
        format!("{}:job:{}", self.prefix, job_id)
    }

    fn cancel_key(&self, job_id: &str) -> String {
        format!("{}:job:{}:cancel", self.prefix, job_id)
    }

    fn ready_key(&self, queue: &str, priority: JobPriority) -> String {
        format!("{}:queue:{}:ready:{}", self.prefix, queue, priority.as_str())
    }

    fn delayed_key(&self, queue: &str) -> String {
        format!("{}:queue:{}:delayed", self.prefix, queue)
    }

    fn inflight_key(&self, queue: &str) -> String {
        format!("{}:queue:{}:inflight", self.prefix, queue)
    }

    fn dlq_key(&self, queue: &str) -> String {
        format!("{}:queue:{}:dlq", self.prefix, queue)
    }

    fn index_key(&self) -> String {
        format!("{}:jobs:index", self.prefix)
    }

    // ------------------------------------------------------------------
    // Records
    // ------------------------------------------------------------------

    async fn store_job(&self, job: &Job) -> KernelResult<()> {
        let json = serde_json::to_string(job).map_err(|e| KernelError::Internal(e.into()))?;
        if job.status.is_terminal() {
            self.kv
                .set_ex(&self.job_key(&job.job_id), &json, TERMINAL_RECORD_TTL_SECS)
                .await
        } else {
            self.kv.set(&self.job_key(&job.job_id), &json).await
        }
    }

    pub async fn get(&self, job_id: &str) -> KernelResult<Option<Job>> {
        let Some(raw) = self.kv.get(&self.job_key(job_id)).await? else {
            return Ok(None);
        };
        Ok(serde_json::from_str(&raw).ok())
    }

    // ------------------------------------------------------------------
    // Enqueue
    // ------------------------------------------------------------------

    /// Enqueue a task. The task name must be registered; a duplicate
    /// `job_id` is a no-op returning the existing record.
    pub async fn enqueue(
        &self,
        task_name: &str,
        payload: Value,
        options: EnqueueOptions,
    ) -> KernelResult<EnqueueResult> {
        let task_options = self
            .tasks
            .options(task_name)
            .ok_or_else(|| {
                KernelError::Validation(format!("task '{}' is not registered", task_name))
            })?
            .clone();

        if let Some(job_id) = &options.job_id {
            if let Some(existing) = self.get(job_id).await? {
                debug!(job_id = %job_id, "duplicate enqueue, returning existing job");
                return Ok(EnqueueResult::Duplicate(existing));
            }
        }

        let now = Utc::now();
        let scheduled_for = options
            .delay_seconds
            .map(|delay| now + ChronoDuration::seconds(delay as i64));

        let job = Job::builder()
            .job_id(options.job_id.unwrap_or_else(db_id))
            .task_name(task_name.to_string())
            .payload(payload)
            .priority(options.priority)
            .queue_name(task_options.queue.clone())
            .max_attempts(options.max_attempts.unwrap_or(task_options.max_attempts))
            .timeout_seconds(
                options
                    .timeout_seconds
                    .unwrap_or(task_options.timeout_seconds),
            )
            .enqueued_at(now)
            .metadata(options.metadata.unwrap_or(Value::Null))
            .build();
        let job = Job {
            scheduled_for,
            user_id: options.user_id,
            ..job
        };

        self.store_job(&job).await?;
        self.kv
            .zadd(&self.index_key(), &job.job_id, epoch_now())
            .await?;

        match scheduled_for {
            Some(at) => {
                self.kv
                    .zadd(
                        &self.delayed_key(&job.queue_name),
                        &job.job_id,
                        at.timestamp_millis() as f64 / 1000.0,
                    )
                    .await?;
            }
            None => {
                self.kv
                    .lpush(&self.ready_key(&job.queue_name, job.priority), &job.job_id)
                    .await?;
            }
        }

        debug!(job_id = %job.job_id, task = %task_name, queue = %job.queue_name, "job enqueued");
        Ok(EnqueueResult::Created(job))
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Move due delayed jobs into their ready tier.
    pub async fn promote_due(&self, queue: &str) -> KernelResult<u64> {
        let delayed_key = self.delayed_key(queue);
        let due = self
            .kv
            .zrange_by_score(&delayed_key, f64::MIN, epoch_now(), 100)
            .await?;
        let mut promoted = 0;
        for job_id in due {
            if !self.kv.zrem(&delayed_key, &job_id).await? {
                continue; // another dispatcher promoted it first
            }
            let Some(job) = self.get(&job_id).await? else {
                continue;
            };
            if job.status == JobStatus::Queued {
                self.kv
                    .lpush(&self.ready_key(queue, job.priority), &job_id)
                    .await?;
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    /// Claim the next job: highest priority tier first, FIFO within a tier.
    /// The claimed job is marked running with an in-flight lease of
    /// `timeout + grace`.
    pub async fn claim(&self, queue: &str) -> KernelResult<Option<Job>> {
        self.promote_due(queue).await?;

        for priority in JobPriority::ALL {
            let ready_key = self.ready_key(queue, priority);
            loop {
                let Some(job_id) = self.kv.rpop(&ready_key).await? else {
                    break;
                };
                // Take the in-flight lease first: a crash from here on is
                // covered by the reaper when the lease expires.
                let provisional_lease = epoch_now() + LEASE_GRACE_SECS as f64;
                self.kv
                    .zadd(&self.inflight_key(queue), &job_id, provisional_lease)
                    .await?;

                let Some(mut job) = self.get(&job_id).await? else {
                    // Record expired; drop the stale entry.
                    self.kv.zrem(&self.inflight_key(queue), &job_id).await?;
                    continue;
                };
                if job.status != JobStatus::Queued {
                    // Cancelled while waiting.
                    self.kv.zrem(&self.inflight_key(queue), &job_id).await?;
                    continue;
                }

                job.status = JobStatus::Running;
                job.attempts += 1;
                job.started_at = Some(Utc::now());
                job.error = None;
                self.store_job(&job).await?;

                let lease_expiry = epoch_now() + (job.timeout_seconds + LEASE_GRACE_SECS) as f64;
                self.kv
                    .zadd(&self.inflight_key(queue), &job_id, lease_expiry)
                    .await?;

                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    /// Mark a job completed with its result.
    pub async fn complete(&self, job_id: &str, result: Value) -> KernelResult<()> {
        let Some(mut job) = self.get(job_id).await? else {
            return Err(KernelError::NotFound(format!("job {}", job_id)));
        };
        self.kv
            .zrem(&self.inflight_key(&job.queue_name), job_id)
            .await?;
        job.status = JobStatus::Completed;
        job.completed_at = Some(Utc::now());
        job.result = Some(result);
        self.store_job(&job).await?;
        self.kv.del(&self.cancel_key(job_id)).await?;
        debug!(job_id = %job_id, "job completed");
        Ok(())
    }

    /// Record a failed attempt. Retries with backoff while attempts remain;
    /// otherwise dead-letters.
    pub async fn fail(&self, job_id: &str, error: &str, kind: FailureKind) -> KernelResult<()> {
        let Some(mut job) = self.get(job_id).await? else {
            return Err(KernelError::NotFound(format!("job {}", job_id)));
        };
        self.kv
            .zrem(&self.inflight_key(&job.queue_name), job_id)
            .await?;

        job.error = Some(error.to_string());

        if kind.should_retry() && job.attempts < job.max_attempts {
            let delay = (self.backoff)(job.attempts);
            let retry_at = Utc::now() + ChronoDuration::milliseconds(delay.as_millis() as i64);
            job.status = JobStatus::Queued;
            job.scheduled_for = Some(retry_at);
            self.store_job(&job).await?;
            self.kv
                .zadd(
                    &self.delayed_key(&job.queue_name),
                    job_id,
                    retry_at.timestamp_millis() as f64 / 1000.0,
                )
                .await?;
            warn!(job_id = %job_id, attempts = job.attempts, retry_in_ms = delay.as_millis() as u64, error = %error, "job failed, retrying");
        } else {
            // A non-retryable failure forfeits the remaining budget so the
            // dead state always reads attempts == max_attempts.
            job.attempts = job.max_attempts;
            job.status = JobStatus::Dead;
            job.completed_at = Some(Utc::now());
            self.store_job(&job).await?;
            self.kv
                .lpush(&self.dlq_key(&job.queue_name), job_id)
                .await?;
            warn!(job_id = %job_id, error = %error, "job dead-lettered");
        }
        Ok(())
    }

    /// Mark a running job cancelled. Only valid after its handler returned.
    pub async fn finish_cancelled(&self, job_id: &str) -> KernelResult<()> {
        let Some(mut job) = self.get(job_id).await? else {
            return Err(KernelError::NotFound(format!("job {}", job_id)));
        };
        self.kv
            .zrem(&self.inflight_key(&job.queue_name), job_id)
            .await?;
        job.status = JobStatus::Cancelled;
        job.completed_at = Some(Utc::now());
        self.store_job(&job).await?;
        self.kv.del(&self.cancel_key(job_id)).await?;
        info!(job_id = %job_id, "job cancelled");
        Ok(())
    }

    /// Cancel a job. Queued jobs flip to cancelled immediately; running jobs
    /// get a cancellation flag their handler observes via the context.
    pub async fn cancel(&self, job_id: &str) -> KernelResult<bool> {
        let Some(mut job) = self.get(job_id).await? else {
            return Ok(false);
        };
        match job.status {
            JobStatus::Queued => {
                self.kv
                    .lrem(&self.ready_key(&job.queue_name, job.priority), job_id)
                    .await?;
                self.kv
                    .zrem(&self.delayed_key(&job.queue_name), job_id)
                    .await?;
                job.status = JobStatus::Cancelled;
                job.completed_at = Some(Utc::now());
                self.store_job(&job).await?;
                info!(job_id = %job_id, "queued job cancelled");
                Ok(true)
            }
            JobStatus::Running => {
                self.kv
                    .set_ex(
                        &self.cancel_key(job_id),
                        "1",
                        job.timeout_seconds + LEASE_GRACE_SECS,
                    )
                    .await?;
                info!(job_id = %job_id, "cancellation requested for running job");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub async fn cancel_requested(&self, job_id: &str) -> KernelResult<bool> {
        Ok(self.kv.get(&self.cancel_key(job_id)).await?.is_some())
    }

    /// Return jobs whose in-flight lease expired to the retry path. The
    /// claim already counted the attempt, so this only records the failure.
    pub async fn reap_expired(&self, queue: &str) -> KernelResult<u64> {
        let inflight_key = self.inflight_key(queue);
        let expired = self
            .kv
            .zrange_by_score(&inflight_key, f64::MIN, epoch_now(), 100)
            .await?;
        let mut reaped = 0;
        for job_id in expired {
            if !self.kv.zrem(&inflight_key, &job_id).await? {
                continue;
            }
            let Some(job) = self.get(&job_id).await? else {
                continue;
            };
            match job.status {
                JobStatus::Running => {
                    warn!(job_id = %job_id, "in-flight lease expired, presuming worker death");
                    self.fail(&job_id, "lease expired before completion", FailureKind::TimedOut)
                        .await?;
                    reaped += 1;
                }
                JobStatus::Queued => {
                    // A dispatcher died between taking the provisional lease
                    // and marking the job running; put it back on its tier.
                    self.kv
                        .lpush(&self.ready_key(queue, job.priority), &job_id)
                        .await?;
                    reaped += 1;
                }
                _ => {}
            }
        }
        Ok(reaped)
    }

    // ------------------------------------------------------------------
    // Progress
    // ------------------------------------------------------------------

    /// Store a progress update and publish it to in-process subscribers.
    pub async fn progress(&self, job_id: &str, step: &str, percent: f32) -> KernelResult<()> {
        let Some(mut job) = self.get(job_id).await? else {
            return Err(KernelError::NotFound(format!("job {}", job_id)));
        };
        let progress = JobProgress {
            step: step.to_string(),
            percent: percent.clamp(0.0, 100.0),
        };
        job.progress = progress.clone();
        self.store_job(&job).await?;

        let hub = self.progress_hub.lock().unwrap();
        if let Some(sender) = hub.get(job_id) {
            let _ = sender.send(progress);
        }
        Ok(())
    }

    /// Subscribe to progress updates for one job. Updates are also persisted
    /// on the record, so cross-process observers can poll `get`.
    pub fn subscribe_progress(&self, job_id: &str) -> broadcast::Receiver<JobProgress> {
        let mut hub = self.progress_hub.lock().unwrap();
        hub.entry(job_id.to_string())
            .or_insert_with(|| broadcast::channel(32).0)
            .subscribe()
    }

    // ------------------------------------------------------------------
    // Admin
    // ------------------------------------------------------------------

    pub async fn depths(&self, queue: &str) -> KernelResult<QueueDepths> {
        let mut ready = 0;
        for priority in JobPriority::ALL {
            ready += self.kv.llen(&self.ready_key(queue, priority)).await?;
        }
        Ok(QueueDepths {
            ready,
            delayed: self.kv.zcard(&self.delayed_key(queue)).await?,
            in_flight: self.kv.zcard(&self.inflight_key(queue)).await?,
            dead: self.kv.llen(&self.dlq_key(queue)).await?,
        })
    }

    pub async fn dead_letter_ids(&self, queue: &str, limit: i64) -> KernelResult<Vec<String>> {
        self.kv.lrange(&self.dlq_key(queue), 0, limit - 1).await
    }

    /// Recent jobs, newest first, optionally filtered by status and task.
    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        task_name: Option<&str>,
        limit: usize,
    ) -> KernelResult<Vec<Job>> {
        let ids = self
            .kv
            .zrange_by_score(&self.index_key(), f64::MIN, f64::MAX, 10_000)
            .await?;
        let mut jobs = Vec::new();
        for id in ids.into_iter().rev() {
            if jobs.len() >= limit {
                break;
            }
            let Some(job) = self.get(&id).await? else {
                continue;
            };
            if let Some(wanted) = status {
                if job.status != wanted {
                    continue;
                }
            }
            if let Some(task) = task_name {
                if job.task_name != task {
                    continue;
                }
            }
            jobs.push(job);
        }
        Ok(jobs)
    }
}
