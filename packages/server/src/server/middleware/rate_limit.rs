//! Rate-limit middleware: sliding window keyed by principal or client IP.
//!
//! Runs ahead of full authentication, so the tier comes from a cheap token
//! verification (signature + expiry only, no user load). Limiter failures
//! fail open: an unreachable store must not take the API down.

use std::sync::Arc;

use axum::body::Body;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use crate::common::KernelError;
use crate::kernel::reliability::RateTier;
use crate::kernel::Kernel;

use super::auth::bearer_token;
use super::ip_extractor::ClientIp;

/// Health probes are never rate limited.
fn is_exempt(path: &str) -> bool {
    path == "/healthz" || path == "/readyz"
}

pub async fn rate_limit_middleware(
    kernel: Arc<Kernel>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if is_exempt(request.uri().path()) {
        return next.run(request).await;
    }

    let (tier, key) = match bearer_token(request.headers())
        .and_then(|token| kernel.tokens.verify_access(token).ok())
    {
        Some(claims) if claims.is_admin() => (RateTier::Admin, format!("user:{}", claims.sub)),
        Some(claims) => (RateTier::Authenticated, format!("user:{}", claims.sub)),
        None => {
            let ip = request
                .extensions()
                .get::<ClientIp>()
                .map(|c| c.0.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            (RateTier::Anonymous, format!("ip:{}", ip))
        }
    };

    match kernel.rate_limiter.check(&key, tier).await {
        Ok(decision) if decision.allowed => {
            let mut response = next.run(request).await;
            let headers = response.headers_mut();
            if let Ok(value) = decision.limit.to_string().parse() {
                headers.insert("X-RateLimit-Limit", value);
            }
            if let Ok(value) = decision.remaining.to_string().parse() {
                headers.insert("X-RateLimit-Remaining", value);
            }
            if let Ok(value) = decision.reset_seconds.to_string().parse() {
                headers.insert("X-RateLimit-Reset", value);
            }
            response
        }
        Ok(decision) => KernelError::RateLimited {
            limit: decision.limit,
            remaining: decision.remaining,
            reset_seconds: decision.reset_seconds,
        }
        .into_response(),
        Err(e) => {
            // Fail open: log and let the request through.
            warn!(key = %key, error = %e, "rate limiter unavailable, failing open");
            next.run(request).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_probes_exempt() {
        assert!(is_exempt("/healthz"));
        assert!(is_exempt("/readyz"));
        assert!(!is_exempt("/workspaces"));
    }
}
