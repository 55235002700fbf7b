//! Local auth routes: login, register, refresh, profile, password change.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::common::{KernelError, KernelResult};
use crate::kernel::auth::{Role, User};
use crate::kernel::Kernel;
use crate::server::middleware::CurrentUser;

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

fn token_pair(kernel: &Kernel, user: &User) -> KernelResult<Value> {
    let access = kernel
        .tokens
        .create_access_token(&user.id, &user.email, user.role)?;
    let refresh = kernel
        .tokens
        .create_refresh_token(&user.id, &user.email, user.role)?;
    Ok(json!({
        "access_token": access,
        "refresh_token": refresh,
        "user": user,
    }))
}

pub async fn login(
    State(kernel): State<Arc<Kernel>>,
    Json(request): Json<LoginRequest>,
) -> KernelResult<Json<Value>> {
    let user = kernel
        .users
        .authenticate(&request.email, &request.password)
        .await?;
    Ok(Json(token_pair(&kernel, &user)?))
}

pub async fn register(
    State(kernel): State<Arc<Kernel>>,
    Json(request): Json<RegisterRequest>,
) -> KernelResult<Json<Value>> {
    if !kernel.config.registration_enabled {
        return Err(KernelError::Forbidden("registration is disabled".into()));
    }
    let email = request.email.trim().to_lowercase();
    let role = if kernel.config.admin_emails.iter().any(|a| a.eq_ignore_ascii_case(&email)) {
        Role::Admin
    } else {
        Role::User
    };
    let user = kernel
        .users
        .create(&email, &request.password, request.name.as_deref(), role)
        .await?;

    // Every account gets a personal workspace.
    if kernel.workspaces.get_personal(&user.id).await?.is_none() {
        let name = user.name.clone().unwrap_or_else(|| user.email.clone());
        kernel
            .workspaces
            .create(&name, &user.id, true, Value::Null)
            .await?;
    }

    Ok(Json(token_pair(&kernel, &user)?))
}

pub async fn refresh(
    State(kernel): State<Arc<Kernel>>,
    Json(request): Json<RefreshRequest>,
) -> KernelResult<Json<Value>> {
    let claims = kernel.tokens.verify_refresh(&request.refresh_token)?;
    // The subject must still be a live, active account.
    let user = kernel.users.load_active(&claims.sub).await?;
    let access = kernel
        .tokens
        .create_access_token(&user.id, &user.email, user.role)?;
    Ok(Json(json!({ "access_token": access })))
}

pub async fn me(
    State(kernel): State<Arc<Kernel>>,
    CurrentUser(user): CurrentUser,
) -> KernelResult<Json<Value>> {
    let user = kernel
        .users
        .get(&user.id)
        .await?
        .ok_or_else(|| KernelError::NotFound("user".into()))?;
    Ok(Json(json!({ "user": user })))
}

pub async fn change_password(
    State(kernel): State<Arc<Kernel>>,
    CurrentUser(user): CurrentUser,
    Json(request): Json<ChangePasswordRequest>,
) -> KernelResult<Json<Value>> {
    kernel
        .users
        .change_password(&user.id, &request.current_password, &request.new_password)
        .await?;
    Ok(Json(json!({ "status": "ok" })))
}

/// Tokens are stateless; logout is client-side. The endpoint exists so
/// clients have a uniform call and a place for future revocation.
pub async fn logout(CurrentUser(_user): CurrentUser) -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
