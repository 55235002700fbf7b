//! Router assembly and the middleware pipeline.
//!
//! Execution order, outermost first: CORS, client-ip extraction, request
//! context (request id + structured log + error normalization), security
//! headers, trace span, rate limit, idempotency, auth, handler. Axum layers
//! apply in reverse order of `.layer()` calls, so the list below reads
//! innermost-first.

use std::sync::Arc;

use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderName, HeaderValue, Method};
use axum::middleware;
use axum::routing::{delete, get, patch, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::kernel::Kernel;
use crate::server::middleware::{
    auth_middleware, extract_client_ip, idempotency_middleware, rate_limit_middleware,
    request_context,
};
use crate::server::routes::{admin_db, auth as auth_routes, health, jobs, workspaces};

fn cors_layer(kernel: &Kernel) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::PUT,
            Method::DELETE,
        ])
        .allow_headers([
            AUTHORIZATION,
            CONTENT_TYPE,
            HeaderName::from_static("idempotency-key"),
            HeaderName::from_static("x-request-id"),
        ]);
    if kernel.config.allowed_origins.is_empty() {
        layer.allow_origin(tower_http::cors::Any)
    } else {
        let origins: Vec<HeaderValue> = kernel
            .config
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        layer.allow_origin(origins)
    }
}

/// Build the Axum application router around an initialized kernel.
///
/// Product-specific routers are merged in by the caller before serving;
/// they see the same middleware pipeline and kernel state.
pub fn build_app(kernel: Arc<Kernel>) -> Router {
    let router = Router::new()
        // Liveness/readiness
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        // Auth
        .route("/auth/login", post(auth_routes::login))
        .route("/auth/register", post(auth_routes::register))
        .route("/auth/refresh", post(auth_routes::refresh))
        .route("/auth/me", get(auth_routes::me))
        .route("/auth/change-password", post(auth_routes::change_password))
        .route("/auth/logout", post(auth_routes::logout))
        // Workspaces
        .route(
            "/workspaces",
            post(workspaces::create_workspace).get(workspaces::list_workspaces),
        )
        .route(
            "/workspaces/:id",
            get(workspaces::get_workspace)
                .patch(workspaces::update_workspace)
                .delete(workspaces::delete_workspace),
        )
        .route(
            "/workspaces/:id/members",
            get(workspaces::list_members).post(workspaces::add_member),
        )
        .route(
            "/workspaces/:id/members/:user_id",
            patch(workspaces::update_member).delete(workspaces::remove_member),
        )
        .route(
            "/workspaces/:id/invites",
            get(workspaces::list_invites).post(workspaces::create_invite),
        )
        .route(
            "/workspaces/:id/invites/:invite_id",
            delete(workspaces::cancel_invite),
        )
        .route("/invites/accept/:token", post(workspaces::accept_invite))
        // Jobs
        .route("/jobs", get(jobs::list_jobs))
        .route("/jobs/:id", get(jobs::get_job))
        .route("/jobs/:id/cancel", post(jobs::cancel_job))
        .route("/jobs/:id/events", get(jobs::job_events))
        // Admin DB
        .route("/admin/db/migrations", get(admin_db::list_migrations))
        .route("/admin/db/migrations/:hash", get(admin_db::get_migration))
        .route("/admin/db/backups", get(admin_db::list_backups))
        .route(
            "/admin/db/backups/:name/download",
            get(admin_db::download_backup),
        )
        .route("/admin/db/backups/upload", post(admin_db::upload_backup))
        .route("/admin/db/schema/orphans", get(admin_db::schema_orphans))
        .route("/admin/db/backup", post(admin_db::create_backup))
        .route("/admin/db/backfill", post(admin_db::run_backfill))
        .route("/admin/db/restore/full", post(admin_db::restore_full))
        .route("/admin/db/restore/csv", post(admin_db::restore_csv))
        .route("/admin/db/restore/revert", post(admin_db::restore_revert));

    let auth_kernel = kernel.clone();
    let idem_kernel = kernel.clone();
    let rate_kernel = kernel.clone();
    let debug_errors = kernel.config.debug_errors;

    router
        .layer(middleware::from_fn(move |req, next| {
            auth_middleware(auth_kernel.clone(), req, next)
        }))
        .layer(middleware::from_fn(move |req, next| {
            idempotency_middleware(idem_kernel.clone(), req, next)
        }))
        .layer(middleware::from_fn(move |req, next| {
            rate_limit_middleware(rate_kernel.clone(), req, next)
        }))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(crate::server::middleware::security_headers))
        .layer(middleware::from_fn(move |req, next| {
            request_context(debug_errors, req, next)
        }))
        .layer(middleware::from_fn(extract_client_ip))
        .layer(cors_layer(&kernel))
        .with_state(kernel)
}
