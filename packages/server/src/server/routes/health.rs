//! Liveness and readiness probes.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use crate::kernel::Kernel;

/// Liveness: 200 whenever the process is up.
pub async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Readiness: runs every registered health check concurrently. Any failure
/// answers 503 with the per-check messages.
pub async fn readyz(
    State(kernel): State<Arc<Kernel>>,
) -> (StatusCode, Json<serde_json::Value>) {
    let (healthy, checks) = kernel.health.run_all().await;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "checks": checks,
    });
    (status, Json(body))
}
