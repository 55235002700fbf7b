//! Idempotency middleware for non-safe methods.
//!
//! When a POST/PUT/PATCH carries an `Idempotency-Key` header, a cached
//! response for `(principal, key)` is replayed verbatim with
//! `X-Idempotency-Replayed: true` and the handler never runs. Fresh 2xx
//! responses are buffered and stored with a TTL. Streaming paths are
//! excluded; cache failures fall through to the handler.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use tracing::warn;

use crate::kernel::reliability::CachedResponse;
use crate::kernel::Kernel;

use super::auth::bearer_token;

const IDEMPOTENCY_HEADER: &str = "idempotency-key";
const REPLAYED_HEADER: &str = "x-idempotency-replayed";
/// Responses above this size are not cached.
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

pub async fn idempotency_middleware(
    kernel: Arc<Kernel>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !matches!(
        *request.method(),
        Method::POST | Method::PUT | Method::PATCH
    ) {
        return next.run(request).await;
    }
    let Some(client_key) = request
        .headers()
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
    else {
        return next.run(request).await;
    };
    if kernel.idempotency.is_excluded(request.uri().path()) {
        return next.run(request).await;
    }

    // Scope by token subject; full auth runs later in the chain.
    let principal = bearer_token(request.headers())
        .and_then(|token| kernel.tokens.verify_access(token).ok())
        .map(|claims| claims.sub);

    match kernel
        .idempotency
        .get(principal.as_deref(), &client_key)
        .await
    {
        Ok(Some(cached)) => return replay(cached),
        Ok(None) => {}
        Err(e) => {
            warn!(error = %e, "idempotency lookup failed, continuing without cache");
            return next.run(request).await;
        }
    }

    let response = next.run(request).await;
    if !response.status().is_success() {
        return response;
    }

    // Buffer the body so it can be stored and returned.
    let (parts, body) = response.into_parts();
    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "response too large or unreadable, skipping idempotency capture");
            return Response::from_parts(parts, Body::empty());
        }
    };

    let cached = CachedResponse {
        status: parts.status.as_u16(),
        headers: parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| BTreeMap::from([("content-type".to_string(), ct.to_string())]))
            .unwrap_or_default(),
        body: String::from_utf8_lossy(&bytes).into_owned(),
    };
    if let Err(e) = kernel
        .idempotency
        .store(principal.as_deref(), &client_key, &cached)
        .await
    {
        warn!(error = %e, "idempotency store failed, response served uncached");
    }

    Response::from_parts(parts, Body::from(bytes))
}

fn replay(cached: CachedResponse) -> Response {
    let mut response = Response::new(Body::from(cached.body));
    *response.status_mut() =
        StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK);
    for (name, value) in &cached.headers {
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
    response
        .headers_mut()
        .insert(REPLAYED_HEADER, HeaderValue::from_static("true"));
    response
}
