//! Job status, cancellation, and progress streaming routes.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::StreamExt;

use crate::common::{KernelError, KernelResult};
use crate::kernel::jobs::{Job, JobStatus};
use crate::kernel::Kernel;
use crate::server::middleware::{AdminUser, AuthUser, CurrentUser};

/// Owners see their own jobs; admins see all. Everyone else gets 404 so job
/// ids stay unguessable.
async fn load_visible_job(kernel: &Kernel, user: &AuthUser, job_id: &str) -> KernelResult<Job> {
    let job = kernel
        .jobs
        .get(job_id)
        .await?
        .ok_or_else(|| KernelError::NotFound("job".into()))?;
    let visible = user.is_admin() || job.user_id.as_deref() == Some(user.id.as_str());
    if !visible {
        return Err(KernelError::NotFound("job".into()));
    }
    Ok(job)
}

pub async fn get_job(
    State(kernel): State<Arc<Kernel>>,
    CurrentUser(user): CurrentUser,
    Path(job_id): Path<String>,
) -> KernelResult<Json<Value>> {
    let job = load_visible_job(&kernel, &user, &job_id).await?;
    Ok(Json(json!({ "job": job })))
}

pub async fn cancel_job(
    State(kernel): State<Arc<Kernel>>,
    CurrentUser(user): CurrentUser,
    Path(job_id): Path<String>,
) -> KernelResult<Json<Value>> {
    load_visible_job(&kernel, &user, &job_id).await?;
    let cancelled = kernel.jobs.cancel(&job_id).await?;
    if !cancelled {
        return Err(KernelError::Conflict(
            "job is already in a terminal state".into(),
        ));
    }
    Ok(Json(json!({ "status": "cancellation_requested" })))
}

#[derive(Deserialize)]
pub struct ListJobsQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}

fn parse_status(raw: &str) -> KernelResult<JobStatus> {
    serde_json::from_value(Value::String(raw.to_string()))
        .map_err(|_| KernelError::Validation(format!("unknown job status '{}'", raw)))
}

pub async fn list_jobs(
    State(kernel): State<Arc<Kernel>>,
    AdminUser(_admin): AdminUser,
    Query(query): Query<ListJobsQuery>,
) -> KernelResult<Json<Value>> {
    let status = query.status.as_deref().map(parse_status).transpose()?;
    let jobs = kernel
        .jobs
        .list_jobs(status, query.task.as_deref(), query.limit.min(1000))
        .await?;
    Ok(Json(json!({ "jobs": jobs })))
}

/// Releases the stream lease when the SSE stream is dropped, whatever the
/// exit path.
struct LeaseGuard {
    kernel: Arc<Kernel>,
    principal_id: String,
    lease_id: String,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let kernel = self.kernel.clone();
        let principal_id = self.principal_id.clone();
        let lease_id = self.lease_id.clone();
        tokio::spawn(async move {
            let _ = kernel.leases.release(&principal_id, &lease_id).await;
        });
    }
}

/// Live progress stream for one job. Concurrent streams per principal are
/// capped by the lease manager; the slot frees on every disconnect.
pub async fn job_events(
    State(kernel): State<Arc<Kernel>>,
    CurrentUser(user): CurrentUser,
    Path(job_id): Path<String>,
) -> KernelResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    load_visible_job(&kernel, &user, &job_id).await?;

    let lease_id = kernel.leases.acquire(&user.id).await?;
    let guard = LeaseGuard {
        kernel: kernel.clone(),
        principal_id: user.id.clone(),
        lease_id,
    };

    let receiver = kernel.jobs.subscribe_progress(&job_id);
    let stream = tokio_stream::wrappers::BroadcastStream::new(receiver)
        .filter_map(|update| update.ok())
        .map(move |progress| {
            // Guard lives as long as the stream.
            let _held = &guard;
            Ok::<_, Infallible>(
                Event::default()
                    .event("progress")
                    .data(serde_json::to_string(&progress).unwrap_or_default()),
            )
        });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}
