//! Task registry: maps task names to async handlers.
//!
//! Each domain registers its tasks at startup. Workers claim jobs from the
//! queue and dispatch through this registry without knowing concrete types;
//! handlers receive a `TaskContext` for payload access, progress reporting
//! and cooperative cancellation.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::queue::JobQueue;

/// Per-task execution defaults, applied at enqueue time unless overridden.
#[derive(Debug, Clone)]
pub struct TaskOptions {
    pub max_attempts: u32,
    pub timeout_seconds: u64,
    pub queue: String,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout_seconds: 300,
            queue: "default".to_string(),
        }
    }
}

impl TaskOptions {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_timeout_seconds(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn on_queue(mut self, queue: &str) -> Self {
        self.queue = queue.to_string();
        self
    }
}

/// Execution context handed to every task handler.
#[derive(Clone)]
pub struct TaskContext {
    pub job_id: String,
    pub payload: Value,
    pub user_id: Option<String>,
    pub metadata: Value,
    pub attempt: u32,
    queue: Arc<JobQueue>,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(
        job: &super::job::Job,
        queue: Arc<JobQueue>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job_id: job.job_id.clone(),
            payload: job.payload.clone(),
            user_id: job.user_id.clone(),
            metadata: job.metadata.clone(),
            attempt: job.attempts,
            queue,
            cancel,
        }
    }

    /// Report progress; stored on the job record and pushed to subscribers.
    pub async fn progress(&self, step: &str, percent: f32) {
        if let Err(e) = self.queue.progress(&self.job_id, step, percent).await {
            tracing::warn!(job_id = %self.job_id, error = %e, "progress update failed");
        }
    }

    /// Cooperative cancellation check. Handlers are expected to call this at
    /// natural checkpoints and return early when true.
    pub async fn is_cancelled(&self) -> bool {
        if self.cancel.is_cancelled() {
            return true;
        }
        self.queue
            .cancel_requested(&self.job_id)
            .await
            .unwrap_or(false)
    }
}

type BoxedHandler = Box<
    dyn Fn(TaskContext) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> + Send + Sync,
>;

struct TaskRegistration {
    options: TaskOptions,
    handler: BoxedHandler,
}

/// Registry of task name -> handler. Enqueue validates names against it;
/// workers execute through it.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, TaskRegistration>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task with its handler and defaults.
    ///
    /// ```ignore
    /// registry.register("send_email", TaskOptions::default(), |ctx| async move {
    ///     let req: SendEmail = serde_json::from_value(ctx.payload.clone())?;
    ///     mailer.send(req).await?;
    ///     Ok(serde_json::json!({"sent": true}))
    /// });
    /// ```
    pub fn register<F, Fut>(&mut self, task_name: &str, options: TaskOptions, handler: F)
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let boxed: BoxedHandler = Box::new(move |ctx| Box::pin(handler(ctx)));
        self.tasks.insert(
            task_name.to_string(),
            TaskRegistration {
                options,
                handler: boxed,
            },
        );
    }

    pub fn has(&self, task_name: &str) -> bool {
        self.tasks.contains_key(task_name)
    }

    pub fn options(&self, task_name: &str) -> Option<&TaskOptions> {
        self.tasks.get(task_name).map(|t| &t.options)
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.keys().map(|s| s.as_str()).collect()
    }

    /// Queues any registered task dispatches to.
    pub fn queue_names(&self) -> Vec<String> {
        let mut queues: Vec<String> = self
            .tasks
            .values()
            .map(|t| t.options.queue.clone())
            .collect();
        queues.sort();
        queues.dedup();
        queues
    }

    pub async fn execute(&self, task_name: &str, ctx: TaskContext) -> Result<Value> {
        let registration = self
            .tasks
            .get(task_name)
            .ok_or_else(|| anyhow::anyhow!("unknown task: {}", task_name))?;
        (registration.handler)(ctx).await
    }
}
