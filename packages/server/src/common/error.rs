//! Kernel error kinds.
//!
//! Every error that can cross the HTTP boundary maps to a stable status code
//! and machine-readable code. Handlers return `KernelResult<T>`; the request
//! context middleware attaches the request id and renders the canonical
//! `{"error", "message", "request_id"}` body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

pub type KernelResult<T> = Result<T, KernelError>;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("{0}")]
    Unauthenticated(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("rate limit exceeded")]
    RateLimited {
        limit: u32,
        remaining: u32,
        reset_seconds: u64,
    },

    #[error("concurrent stream limit reached")]
    StreamLimitExceeded,

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    Unavailable(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl KernelError {
    /// Machine-readable error code, stable across releases.
    pub fn kind(&self) -> &'static str {
        match self {
            KernelError::Unauthenticated(_) => "unauthenticated",
            KernelError::Forbidden(_) => "forbidden",
            KernelError::NotFound(_) => "not_found",
            KernelError::Conflict(_) => "conflict",
            KernelError::RateLimited { .. } => "rate_limited",
            KernelError::StreamLimitExceeded => "stream_limit_exceeded",
            KernelError::Validation(_) => "validation",
            KernelError::Timeout(_) => "timeout",
            KernelError::Unavailable(_) => "unavailable",
            KernelError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            KernelError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            KernelError::Forbidden(_) => StatusCode::FORBIDDEN,
            KernelError::NotFound(_) => StatusCode::NOT_FOUND,
            KernelError::Conflict(_) => StatusCode::CONFLICT,
            KernelError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            KernelError::StreamLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            KernelError::Validation(_) => StatusCode::BAD_REQUEST,
            KernelError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            KernelError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            KernelError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to send to clients. Internal errors are masked unless
    /// debug bodies are enabled by the middleware.
    pub fn safe_message(&self) -> String {
        match self {
            KernelError::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

/// Marker stored on error responses so the request-context middleware can
/// rebuild the body with the request id and log with full context.
#[derive(Debug, Clone)]
pub struct ErrorMeta {
    pub kind: &'static str,
    pub safe_message: String,
    /// Full error chain, logged server-side and only exposed when debug
    /// bodies are enabled.
    pub detail: String,
}

impl IntoResponse for KernelError {
    fn into_response(self) -> Response {
        let meta = ErrorMeta {
            kind: self.kind(),
            safe_message: self.safe_message(),
            detail: match &self {
                KernelError::Internal(e) => format!("{:#}", e),
                other => other.to_string(),
            },
        };

        let mut response = (
            self.status(),
            Json(json!({ "error": self.kind(), "message": self.safe_message() })),
        )
            .into_response();

        if let KernelError::RateLimited {
            limit,
            remaining,
            reset_seconds,
        } = &self
        {
            let headers = response.headers_mut();
            headers.insert("X-RateLimit-Limit", limit.to_string().parse().unwrap());
            headers.insert(
                "X-RateLimit-Remaining",
                remaining.to_string().parse().unwrap(),
            );
            headers.insert(
                "X-RateLimit-Reset",
                reset_seconds.to_string().parse().unwrap(),
            );
        }

        response.extensions_mut().insert(meta);
        response
    }
}

impl From<sqlx::Error> for KernelError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::PoolTimedOut => {
                KernelError::Timeout("timed out waiting for a database connection".into())
            }
            sqlx::Error::RowNotFound => KernelError::NotFound("row not found".into()),
            sqlx::Error::Io(_) | sqlx::Error::PoolClosed => {
                KernelError::Unavailable(format!("database unavailable: {}", e))
            }
            _ => KernelError::Internal(e.into()),
        }
    }
}

impl From<redis::RedisError> for KernelError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_timeout() {
            KernelError::Timeout(format!("key-value store timeout: {}", e))
        } else {
            KernelError::Unavailable(format!("key-value store unavailable: {}", e))
        }
    }
}

impl From<serde_json::Error> for KernelError {
    fn from(e: serde_json::Error) -> Self {
        KernelError::Validation(format!("invalid JSON: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_stable_status_codes() {
        assert_eq!(
            KernelError::Unauthenticated("x".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            KernelError::Forbidden("x".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            KernelError::NotFound("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            KernelError::Conflict("x".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            KernelError::StreamLimitExceeded.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            KernelError::Timeout("x".into()).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            KernelError::Unavailable("x".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn internal_errors_are_masked() {
        let err = KernelError::Internal(anyhow::anyhow!("secret connection string"));
        assert_eq!(err.safe_message(), "internal server error");
    }

    #[test]
    fn rate_limited_response_carries_headers() {
        let err = KernelError::RateLimited {
            limit: 3,
            remaining: 0,
            reset_seconds: 60,
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("X-RateLimit-Limit").unwrap(), "3");
        assert_eq!(response.headers().get("X-RateLimit-Remaining").unwrap(), "0");
    }
}
