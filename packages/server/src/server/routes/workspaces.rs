//! Workspace, membership and invite routes.
//!
//! Role guards: reads need membership, mutations need admin, deletion needs
//! the owner. Non-members get 404 so workspace ids cannot be probed.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::common::{KernelError, KernelResult};
use crate::kernel::saas::MemberRole;
use crate::kernel::Kernel;
use crate::server::middleware::CurrentUser;

#[derive(Deserialize)]
pub struct CreateWorkspaceRequest {
    pub name: String,
    #[serde(default)]
    pub settings: Value,
}

#[derive(Deserialize)]
pub struct UpdateWorkspaceRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub settings: Option<Value>,
}

#[derive(Deserialize)]
pub struct AddMemberRequest {
    pub user_id: String,
    #[serde(default = "default_role")]
    pub role: String,
}

#[derive(Deserialize)]
pub struct UpdateMemberRequest {
    pub role: String,
}

#[derive(Deserialize)]
pub struct CreateInviteRequest {
    pub email: String,
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_role() -> String {
    "member".to_string()
}

fn parse_role(raw: &str) -> KernelResult<MemberRole> {
    MemberRole::parse(raw)
        .ok_or_else(|| KernelError::Validation(format!("unknown role '{}'", raw)))
}

pub async fn create_workspace(
    State(kernel): State<Arc<Kernel>>,
    CurrentUser(user): CurrentUser,
    Json(request): Json<CreateWorkspaceRequest>,
) -> KernelResult<(StatusCode, Json<Value>)> {
    let workspace = kernel
        .workspaces
        .create(&request.name, &user.id, false, request.settings)
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "workspace": workspace }))))
}

pub async fn list_workspaces(
    State(kernel): State<Arc<Kernel>>,
    CurrentUser(user): CurrentUser,
) -> KernelResult<Json<Value>> {
    let workspaces = kernel.workspaces.list_for_user(&user.id).await?;
    Ok(Json(json!({ "workspaces": workspaces })))
}

pub async fn get_workspace(
    State(kernel): State<Arc<Kernel>>,
    CurrentUser(user): CurrentUser,
    Path(workspace_id): Path<String>,
) -> KernelResult<Json<Value>> {
    kernel
        .access
        .require_role(&user.id, &workspace_id, MemberRole::Member)
        .await?;
    let workspace = kernel
        .workspaces
        .get(&workspace_id)
        .await?
        .ok_or_else(|| KernelError::NotFound("workspace".into()))?;
    Ok(Json(json!({ "workspace": workspace })))
}

pub async fn update_workspace(
    State(kernel): State<Arc<Kernel>>,
    CurrentUser(user): CurrentUser,
    Path(workspace_id): Path<String>,
    Json(request): Json<UpdateWorkspaceRequest>,
) -> KernelResult<Json<Value>> {
    kernel
        .access
        .require_role(&user.id, &workspace_id, MemberRole::Admin)
        .await?;
    let workspace = kernel
        .workspaces
        .update(
            &workspace_id,
            request.name.as_deref(),
            request.settings,
            &user.id,
        )
        .await?;
    Ok(Json(json!({ "workspace": workspace })))
}

pub async fn delete_workspace(
    State(kernel): State<Arc<Kernel>>,
    CurrentUser(user): CurrentUser,
    Path(workspace_id): Path<String>,
) -> KernelResult<StatusCode> {
    kernel
        .access
        .require_role(&user.id, &workspace_id, MemberRole::Owner)
        .await?;
    kernel.workspaces.delete(&workspace_id, &user.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ------------------------------------------------------------------
// Members
// ------------------------------------------------------------------

pub async fn list_members(
    State(kernel): State<Arc<Kernel>>,
    CurrentUser(user): CurrentUser,
    Path(workspace_id): Path<String>,
) -> KernelResult<Json<Value>> {
    kernel
        .access
        .require_role(&user.id, &workspace_id, MemberRole::Member)
        .await?;
    let members = kernel.members.list_for_workspace(&workspace_id).await?;
    Ok(Json(json!({ "members": members })))
}

pub async fn add_member(
    State(kernel): State<Arc<Kernel>>,
    CurrentUser(user): CurrentUser,
    Path(workspace_id): Path<String>,
    Json(request): Json<AddMemberRequest>,
) -> KernelResult<(StatusCode, Json<Value>)> {
    kernel
        .access
        .require_role(&user.id, &workspace_id, MemberRole::Admin)
        .await?;
    let role = parse_role(&request.role)?;
    if role == MemberRole::Owner {
        return Err(KernelError::Validation(
            "the owner role cannot be granted".into(),
        ));
    }
    let member = kernel
        .members
        .add(&workspace_id, &request.user_id, role, Some(&user.id))
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "member": member }))))
}

pub async fn update_member(
    State(kernel): State<Arc<Kernel>>,
    CurrentUser(user): CurrentUser,
    Path((workspace_id, member_user_id)): Path<(String, String)>,
    Json(request): Json<UpdateMemberRequest>,
) -> KernelResult<Json<Value>> {
    kernel
        .access
        .require_role(&user.id, &workspace_id, MemberRole::Admin)
        .await?;
    let role = parse_role(&request.role)?;
    if role == MemberRole::Owner {
        return Err(KernelError::Validation(
            "ownership cannot be transferred through this endpoint".into(),
        ));
    }
    let member = kernel
        .members
        .update_role(&workspace_id, &member_user_id, role, &user.id)
        .await?;
    Ok(Json(json!({ "member": member })))
}

pub async fn remove_member(
    State(kernel): State<Arc<Kernel>>,
    CurrentUser(user): CurrentUser,
    Path((workspace_id, member_user_id)): Path<(String, String)>,
) -> KernelResult<StatusCode> {
    // Members may leave; removing anyone else needs admin.
    if member_user_id != user.id {
        kernel
            .access
            .require_role(&user.id, &workspace_id, MemberRole::Admin)
            .await?;
    } else {
        kernel
            .access
            .require_role(&user.id, &workspace_id, MemberRole::Member)
            .await?;
    }
    if kernel
        .members
        .remove(&workspace_id, &member_user_id, &user.id)
        .await?
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(KernelError::NotFound("member".into()))
    }
}

// ------------------------------------------------------------------
// Invites
// ------------------------------------------------------------------

pub async fn list_invites(
    State(kernel): State<Arc<Kernel>>,
    CurrentUser(user): CurrentUser,
    Path(workspace_id): Path<String>,
) -> KernelResult<Json<Value>> {
    kernel
        .access
        .require_role(&user.id, &workspace_id, MemberRole::Admin)
        .await?;
    let invites = kernel.invites.list_for_workspace(&workspace_id).await?;
    Ok(Json(json!({ "invites": invites })))
}

pub async fn create_invite(
    State(kernel): State<Arc<Kernel>>,
    CurrentUser(user): CurrentUser,
    Path(workspace_id): Path<String>,
    Json(request): Json<CreateInviteRequest>,
) -> KernelResult<(StatusCode, Json<Value>)> {
    kernel
        .access
        .require_role(&user.id, &workspace_id, MemberRole::Admin)
        .await?;
    let role = parse_role(&request.role)?;
    let invite = kernel
        .invites
        .create(&workspace_id, &request.email, role, &user.id)
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "invite": invite }))))
}

pub async fn cancel_invite(
    State(kernel): State<Arc<Kernel>>,
    CurrentUser(user): CurrentUser,
    Path((workspace_id, invite_id)): Path<(String, String)>,
) -> KernelResult<StatusCode> {
    kernel
        .access
        .require_role(&user.id, &workspace_id, MemberRole::Admin)
        .await?;
    if kernel.invites.cancel(&invite_id, &user.id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(KernelError::NotFound("invite".into()))
    }
}

pub async fn accept_invite(
    State(kernel): State<Arc<Kernel>>,
    CurrentUser(user): CurrentUser,
    Path(token): Path<String>,
) -> KernelResult<Json<Value>> {
    let member = kernel
        .invites
        .accept(&token, &user.id, &user.email, &kernel.members)
        .await?;
    Ok(Json(json!({ "member": member })))
}
