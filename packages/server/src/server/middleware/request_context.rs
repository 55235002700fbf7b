//! Request identity, structured request logs, and error normalization.
//!
//! Generates (or respects) `X-Request-ID`, logs one line per request with
//! latency and status, and rewrites kernel error responses into the
//! canonical `{"error", "message", "request_id"}` body. Error detail only
//! reaches the body when debug bodies are enabled.

use std::time::Instant;

use axum::body::Body;
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::common::error::ErrorMeta;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Stable for the life of one request; available to handlers via
/// request extensions.
#[derive(Clone, Debug)]
pub struct RequestId(pub String);

fn sanitize_request_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.len() > 128 {
        return None;
    }
    if trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        Some(trimmed.to_string())
    } else {
        None
    }
}

pub async fn request_context(debug_errors: bool, mut request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(sanitize_request_id)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    request.extensions_mut().insert(RequestId(request_id.clone()));

    let started = Instant::now();
    let response = next.run(request).await;
    let latency_ms = started.elapsed().as_millis() as u64;
    let status = response.status();

    // Normalize kernel errors into the canonical body with the request id.
    let mut response = match response.extensions().get::<ErrorMeta>().cloned() {
        Some(meta) => {
            warn!(
                request_id = %request_id,
                method = %method,
                path = %path,
                status = status.as_u16(),
                latency_ms,
                error_kind = meta.kind,
                detail = %meta.detail,
                "request failed"
            );
            let message = if debug_errors {
                meta.detail.clone()
            } else {
                meta.safe_message.clone()
            };
            let mut normalized = (
                status,
                Json(json!({
                    "error": meta.kind,
                    "message": message,
                    "request_id": request_id,
                })),
            )
                .into_response();
            for (name, value) in response.headers() {
                if name != CONTENT_LENGTH && name != CONTENT_TYPE {
                    normalized.headers_mut().insert(name.clone(), value.clone());
                }
            }
            normalized
        }
        None => {
            info!(
                request_id = %request_id,
                method = %method,
                path = %path,
                status = status.as_u16(),
                latency_ms,
                "request"
            );
            response
        }
    };

    if let Ok(value) = request_id.parse() {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_ids_are_sanitized() {
        assert_eq!(
            sanitize_request_id("abc-123_DEF"),
            Some("abc-123_DEF".to_string())
        );
        assert_eq!(sanitize_request_id(""), None);
        assert_eq!(sanitize_request_id("has spaces"), None);
        assert_eq!(sanitize_request_id(&"x".repeat(200)), None);
    }
}
