//! Background job execution: durable at-least-once queue, task registry,
//! and worker pool.

pub mod job;
pub mod queue;
pub mod registry;
pub mod worker;

pub use job::{backoff_delay, FailureKind, Job, JobPriority, JobProgress, JobStatus};
pub use queue::{EnqueueOptions, EnqueueResult, JobQueue, QueueDepths};
pub use registry::{TaskContext, TaskOptions, TaskRegistry};
pub use worker::{WorkerConfig, WorkerPool};
