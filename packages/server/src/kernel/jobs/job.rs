//! Job model for background task execution.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use typed_builder::TypedBuilder;

use crate::common::db_id;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Completed,
    Failed,
    Dead,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Dead | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    High,
    #[default]
    Normal,
    Low,
}

impl JobPriority {
    /// Dispatch order: high preempts normal preempts low.
    pub const ALL: [JobPriority; 3] = [JobPriority::High, JobPriority::Normal, JobPriority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobPriority::High => "high",
            JobPriority::Normal => "normal",
            JobPriority::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transient failure, retried while attempts remain.
    Retryable,
    /// Permanent failure, dead-letters immediately.
    NonRetryable,
    /// Lease expired or watchdog fired before the handler returned.
    TimedOut,
    /// Interrupted by graceful shutdown; redelivered.
    Shutdown,
}

impl FailureKind {
    pub fn should_retry(&self) -> bool {
        matches!(
            self,
            FailureKind::Retryable | FailureKind::TimedOut | FailureKind::Shutdown
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct JobProgress {
    pub step: String,
    pub percent: f32,
}

// ============================================================================
// Job record
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = db_id())]
    pub job_id: String,

    pub task_name: String,

    #[builder(default = Value::Null)]
    pub payload: Value,

    #[builder(default)]
    pub priority: JobPriority,

    #[builder(default = "default".to_string())]
    pub queue_name: String,

    #[builder(default)]
    pub status: JobStatus,

    /// Attempt counter, incremented when a run starts. After a successful
    /// third try this reads 3.
    #[builder(default = 0)]
    pub attempts: u32,

    #[builder(default = 3)]
    pub max_attempts: u32,

    #[builder(default = 300)]
    pub timeout_seconds: u64,

    #[builder(default = Utc::now())]
    pub enqueued_at: DateTime<Utc>,

    #[builder(default, setter(strip_option))]
    pub scheduled_for: Option<DateTime<Utc>>,

    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,

    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,

    #[builder(default, setter(strip_option))]
    pub error: Option<String>,

    #[builder(default, setter(strip_option))]
    pub result: Option<Value>,

    #[builder(default)]
    pub progress: JobProgress,

    #[builder(default, setter(strip_option))]
    pub user_id: Option<String>,

    #[builder(default = Value::Null)]
    pub metadata: Value,
}

impl Job {
    /// Whether the job is due for dispatch.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued
            && self.scheduled_for.map(|at| at <= now).unwrap_or(true)
    }
}

/// Retry backoff: exponential from 1s, capped at 30s, with +/-20% jitter.
pub fn backoff_delay(attempts: u32) -> Duration {
    let base = 2u64.saturating_pow(attempts.saturating_sub(1)).min(30);
    let jitter = rand::thread_rng().gen_range(0.8..1.2);
    Duration::from_secs_f64((base as f64) * jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_defaults() {
        let job = Job::builder().task_name("send_email").build();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.priority, JobPriority::Normal);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.queue_name, "default");
        assert!(!job.job_id.is_empty());
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Dead.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Failed.is_terminal());
    }

    #[test]
    fn priority_dispatch_order() {
        assert_eq!(
            JobPriority::ALL,
            [JobPriority::High, JobPriority::Normal, JobPriority::Low]
        );
    }

    #[test]
    fn failure_kinds_retry_policy() {
        assert!(FailureKind::Retryable.should_retry());
        assert!(FailureKind::TimedOut.should_retry());
        assert!(FailureKind::Shutdown.should_retry());
        assert!(!FailureKind::NonRetryable.should_retry());
    }

    #[test]
    fn backoff_grows_and_caps() {
        for _ in 0..20 {
            let first = backoff_delay(1);
            assert!(first >= Duration::from_secs_f64(0.8));
            assert!(first <= Duration::from_secs_f64(1.2));

            let sixth = backoff_delay(6);
            // 2^5 = 32 capped to 30, +/-20%
            assert!(sixth >= Duration::from_secs_f64(24.0));
            assert!(sixth <= Duration::from_secs_f64(36.0));
        }
    }

    #[test]
    fn scheduled_job_not_due_early() {
        let job = Job::builder()
            .task_name("t")
            .scheduled_for(Utc::now() + chrono::Duration::seconds(60))
            .build();
        assert!(!job.is_due(Utc::now()));
        assert!(job.is_due(Utc::now() + chrono::Duration::seconds(61)));
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Dead).unwrap(),
            "\"dead\""
        );
        assert_eq!(
            serde_json::to_string(&JobPriority::High).unwrap(),
            "\"high\""
        );
    }
}
