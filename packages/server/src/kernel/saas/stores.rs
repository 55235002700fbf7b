//! Workspace, member and invite stores plus the access check interface.
//!
//! Workspaces own their members and invites: deleting a workspace soft-
//! deletes both. Membership is unique per `(workspace_id, user_id)`;
//! invites carry single-use URL-safe tokens with expiry.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::{json, Value};

use crate::common::ids::secret_token;
use crate::common::{KernelError, KernelResult};
use crate::kernel::storage::EntityStore;

use super::models::{
    slugify, Invite, InviteStatus, Member, MemberRole, Workspace, INVITES_TABLE, MEMBERS_TABLE,
    WORKSPACES_TABLE,
};

const INVITE_TTL_DAYS: i64 = 7;

pub struct WorkspaceStore {
    entities: EntityStore,
}

impl WorkspaceStore {
    pub fn new(entities: EntityStore) -> Arc<Self> {
        Arc::new(Self { entities })
    }

    /// Create a workspace and its owner membership.
    pub async fn create(
        &self,
        name: &str,
        owner_id: &str,
        is_personal: bool,
        settings: Value,
    ) -> KernelResult<Workspace> {
        if name.trim().is_empty() {
            return Err(KernelError::Validation("workspace name is required".into()));
        }
        let slug = self.unique_slug(name).await?;

        let entity = json!({
            "name": name.trim(),
            "slug": slug,
            "owner_id": owner_id,
            "is_personal": is_personal,
            "settings": settings,
        });
        let saved = self
            .entities
            .save(WORKSPACES_TABLE, entity, Some(owner_id), None)
            .await?;
        let workspace = Workspace::from_entity(&saved)
            .ok_or_else(|| KernelError::Internal(anyhow::anyhow!("workspace entity malformed")))?;

        let membership = json!({
            "workspace_id": workspace.id,
            "user_id": owner_id,
            "role": "owner",
            "joined_at": Utc::now().to_rfc3339(),
        });
        self.entities
            .save(MEMBERS_TABLE, membership, Some(owner_id), None)
            .await?;

        Ok(workspace)
    }

    /// Slugs are unique kernel-wide; collisions get a numeric suffix.
    async fn unique_slug(&self, name: &str) -> KernelResult<String> {
        let base = slugify(name);
        let mut candidate = base.clone();
        let mut counter = 2;
        loop {
            if self.get_by_slug(&candidate).await?.is_none() {
                return Ok(candidate);
            }
            candidate = format!("{}-{}", base, counter);
            counter += 1;
            if counter > 100 {
                return Err(KernelError::Conflict(format!(
                    "could not find a free slug for '{}'",
                    base
                )));
            }
        }
    }

    pub async fn get(&self, workspace_id: &str) -> KernelResult<Option<Workspace>> {
        Ok(self
            .entities
            .get(WORKSPACES_TABLE, workspace_id, false)
            .await?
            .as_ref()
            .and_then(Workspace::from_entity))
    }

    pub async fn get_by_slug(&self, slug: &str) -> KernelResult<Option<Workspace>> {
        let mut rows = self
            .entities
            .find(
                WORKSPACES_TABLE,
                Some("[slug] = ?"),
                &[Some(slug.to_string())],
                None,
                Some(1),
                None,
                false,
            )
            .await?;
        Ok(rows.pop().as_ref().and_then(Workspace::from_entity))
    }

    /// Workspaces the user belongs to, through their memberships.
    pub async fn list_for_user(&self, user_id: &str) -> KernelResult<Vec<Workspace>> {
        let memberships = self
            .entities
            .find(
                MEMBERS_TABLE,
                Some("[user_id] = ?"),
                &[Some(user_id.to_string())],
                None,
                None,
                None,
                false,
            )
            .await?;
        let ids: Vec<String> = memberships
            .iter()
            .filter_map(|m| m.get("workspace_id").and_then(|v| v.as_str()))
            .map(|s| s.to_string())
            .collect();
        let rows = self.entities.get_many(WORKSPACES_TABLE, &ids, false).await?;
        let mut workspaces: Vec<Workspace> = rows
            .iter()
            .filter_map(Workspace::from_entity)
            .collect();
        workspaces.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(workspaces)
    }

    pub async fn get_personal(&self, user_id: &str) -> KernelResult<Option<Workspace>> {
        let mut rows = self
            .entities
            .find(
                WORKSPACES_TABLE,
                Some("[owner_id] = ? AND [is_personal] = ?"),
                &[Some(user_id.to_string()), Some("1".to_string())],
                None,
                Some(1),
                None,
                false,
            )
            .await?;
        Ok(rows.pop().as_ref().and_then(Workspace::from_entity))
    }

    pub async fn update(
        &self,
        workspace_id: &str,
        name: Option<&str>,
        settings: Option<Value>,
        user_id: &str,
    ) -> KernelResult<Workspace> {
        let Some(mut entity) = self.entities.get(WORKSPACES_TABLE, workspace_id, false).await?
        else {
            return Err(KernelError::NotFound("workspace".into()));
        };
        let object = entity.as_object_mut().unwrap();
        if let Some(name) = name {
            if name.trim().is_empty() {
                return Err(KernelError::Validation("workspace name is required".into()));
            }
            object.insert("name".into(), Value::String(name.trim().to_string()));
        }
        if let Some(settings) = settings {
            object.insert("settings".into(), settings);
        }
        let saved = self
            .entities
            .save(WORKSPACES_TABLE, entity, Some(user_id), None)
            .await?;
        Workspace::from_entity(&saved)
            .ok_or_else(|| KernelError::Internal(anyhow::anyhow!("workspace entity malformed")))
    }

    /// Soft-delete a workspace and cascade to members and invites.
    pub async fn delete(&self, workspace_id: &str, user_id: &str) -> KernelResult<bool> {
        if !self
            .entities
            .delete(WORKSPACES_TABLE, workspace_id, Some(user_id), false)
            .await?
        {
            return Ok(false);
        }

        for table in [MEMBERS_TABLE, INVITES_TABLE] {
            let rows = self
                .entities
                .find(
                    table,
                    Some("[workspace_id] = ?"),
                    &[Some(workspace_id.to_string())],
                    None,
                    None,
                    None,
                    false,
                )
                .await?;
            for row in rows {
                if let Some(id) = row.get("id").and_then(|v| v.as_str()) {
                    self.entities.delete(table, id, Some(user_id), false).await?;
                }
            }
        }
        Ok(true)
    }
}

pub struct MemberStore {
    entities: EntityStore,
}

impl MemberStore {
    pub fn new(entities: EntityStore) -> Arc<Self> {
        Arc::new(Self { entities })
    }

    pub async fn get(&self, workspace_id: &str, user_id: &str) -> KernelResult<Option<Member>> {
        let mut rows = self
            .entities
            .find(
                MEMBERS_TABLE,
                Some("[workspace_id] = ? AND [user_id] = ?"),
                &[Some(workspace_id.to_string()), Some(user_id.to_string())],
                None,
                Some(1),
                None,
                false,
            )
            .await?;
        Ok(rows.pop().as_ref().and_then(Member::from_entity))
    }

    /// Add a member. `(workspace_id, user_id)` is unique; re-adding is a
    /// conflict.
    pub async fn add(
        &self,
        workspace_id: &str,
        user_id: &str,
        role: MemberRole,
        invited_by: Option<&str>,
    ) -> KernelResult<Member> {
        if self.get(workspace_id, user_id).await?.is_some() {
            return Err(KernelError::Conflict("already a member".into()));
        }
        let entity = json!({
            "workspace_id": workspace_id,
            "user_id": user_id,
            "role": role.as_str(),
            "invited_by": invited_by,
            "joined_at": Utc::now().to_rfc3339(),
        });
        let saved = self
            .entities
            .save(MEMBERS_TABLE, entity, invited_by, None)
            .await?;
        Member::from_entity(&saved)
            .ok_or_else(|| KernelError::Internal(anyhow::anyhow!("member entity malformed")))
    }

    pub async fn list_for_workspace(&self, workspace_id: &str) -> KernelResult<Vec<Member>> {
        let rows = self
            .entities
            .find(
                MEMBERS_TABLE,
                Some("[workspace_id] = ?"),
                &[Some(workspace_id.to_string())],
                Some("[created_at] ASC"),
                None,
                None,
                false,
            )
            .await?;
        Ok(rows.iter().filter_map(Member::from_entity).collect())
    }

    pub async fn update_role(
        &self,
        workspace_id: &str,
        user_id: &str,
        role: MemberRole,
        acting_user: &str,
    ) -> KernelResult<Member> {
        let Some(member) = self.get(workspace_id, user_id).await? else {
            return Err(KernelError::NotFound("member".into()));
        };
        let update = json!({ "id": member.id, "role": role.as_str() });
        let saved = self
            .entities
            .save(MEMBERS_TABLE, update, Some(acting_user), Some("Role changed"))
            .await?;
        Member::from_entity(&saved)
            .ok_or_else(|| KernelError::Internal(anyhow::anyhow!("member entity malformed")))
    }

    pub async fn remove(
        &self,
        workspace_id: &str,
        user_id: &str,
        acting_user: &str,
    ) -> KernelResult<bool> {
        let Some(member) = self.get(workspace_id, user_id).await? else {
            return Ok(false);
        };
        if member.role == MemberRole::Owner {
            return Err(KernelError::Conflict(
                "the workspace owner cannot be removed".into(),
            ));
        }
        self.entities
            .delete(MEMBERS_TABLE, &member.id, Some(acting_user), false)
            .await
    }
}

pub struct InviteStore {
    entities: EntityStore,
}

impl InviteStore {
    pub fn new(entities: EntityStore) -> Arc<Self> {
        Arc::new(Self { entities })
    }

    pub async fn create(
        &self,
        workspace_id: &str,
        email: &str,
        role: MemberRole,
        invited_by: &str,
    ) -> KernelResult<Invite> {
        let email = email.trim().to_lowercase();
        if !email.contains('@') {
            return Err(KernelError::Validation("invalid email address".into()));
        }
        if role == MemberRole::Owner {
            return Err(KernelError::Validation(
                "invites cannot grant the owner role".into(),
            ));
        }
        if self
            .pending_for_email(workspace_id, &email)
            .await?
            .is_some()
        {
            return Err(KernelError::Conflict(format!(
                "a pending invite for {} already exists",
                email
            )));
        }

        let entity = json!({
            "workspace_id": workspace_id,
            "email": email,
            "role": role.as_str(),
            "token": secret_token(),
            "invited_by": invited_by,
            "status": "pending",
            "expires_at": (Utc::now() + Duration::days(INVITE_TTL_DAYS)).to_rfc3339(),
        });
        let saved = self
            .entities
            .save(INVITES_TABLE, entity, Some(invited_by), None)
            .await?;
        Invite::from_entity(&saved)
            .ok_or_else(|| KernelError::Internal(anyhow::anyhow!("invite entity malformed")))
    }

    pub async fn get_by_token(&self, token: &str) -> KernelResult<Option<Invite>> {
        let mut rows = self
            .entities
            .find(
                INVITES_TABLE,
                Some("[token] = ?"),
                &[Some(token.to_string())],
                None,
                Some(1),
                None,
                false,
            )
            .await?;
        Ok(rows.pop().as_ref().and_then(Invite::from_entity))
    }

    pub async fn pending_for_email(
        &self,
        workspace_id: &str,
        email: &str,
    ) -> KernelResult<Option<Invite>> {
        let mut rows = self
            .entities
            .find(
                INVITES_TABLE,
                Some("[workspace_id] = ? AND [email] = ? AND [status] = ?"),
                &[
                    Some(workspace_id.to_string()),
                    Some(email.to_string()),
                    Some("pending".to_string()),
                ],
                None,
                Some(1),
                None,
                false,
            )
            .await?;
        Ok(rows.pop().as_ref().and_then(Invite::from_entity))
    }

    pub async fn list_for_workspace(&self, workspace_id: &str) -> KernelResult<Vec<Invite>> {
        let rows = self
            .entities
            .find(
                INVITES_TABLE,
                Some("[workspace_id] = ?"),
                &[Some(workspace_id.to_string())],
                Some("[created_at] DESC"),
                None,
                None,
                false,
            )
            .await?;
        Ok(rows.iter().filter_map(Invite::from_entity).collect())
    }

    /// Accept an invite: token must be pending, unexpired, and addressed to
    /// the accepting user's email.
    pub async fn accept(
        &self,
        token: &str,
        user_id: &str,
        user_email: &str,
        members: &MemberStore,
    ) -> KernelResult<Member> {
        let Some(invite) = self.get_by_token(token).await? else {
            return Err(KernelError::NotFound("invite".into()));
        };
        if invite.status != InviteStatus::Pending {
            return Err(KernelError::Conflict(format!(
                "invite is {}",
                invite.status.as_str()
            )));
        }
        let now = Utc::now();
        if invite.is_expired(now) {
            let update = json!({ "id": invite.id, "status": "expired" });
            self.entities
                .save(INVITES_TABLE, update, Some(user_id), None)
                .await?;
            return Err(KernelError::Conflict("invite has expired".into()));
        }
        if !invite.email.eq_ignore_ascii_case(user_email) {
            return Err(KernelError::Forbidden(
                "invite was issued to a different email".into(),
            ));
        }

        let member = members
            .add(
                &invite.workspace_id,
                user_id,
                invite.role,
                Some(&invite.invited_by),
            )
            .await?;

        let update = json!({
            "id": invite.id,
            "status": "accepted",
            "accepted_at": now.to_rfc3339(),
        });
        self.entities
            .save(INVITES_TABLE, update, Some(user_id), None)
            .await?;

        Ok(member)
    }

    pub async fn cancel(&self, invite_id: &str, acting_user: &str) -> KernelResult<bool> {
        let Some(entity) = self.entities.get(INVITES_TABLE, invite_id, false).await? else {
            return Ok(false);
        };
        let Some(invite) = Invite::from_entity(&entity) else {
            return Ok(false);
        };
        if invite.status != InviteStatus::Pending {
            return Ok(false);
        }
        let update = json!({ "id": invite.id, "status": "cancelled" });
        self.entities
            .save(INVITES_TABLE, update, Some(acting_user), None)
            .await?;
        Ok(true)
    }
}

/// Access checks for middleware guards. Insufficient role answers 403;
/// non-membership answers 404 so workspace existence is not leaked.
pub struct WorkspaceAccess {
    members: Arc<MemberStore>,
}

impl WorkspaceAccess {
    pub fn new(members: Arc<MemberStore>) -> Arc<Self> {
        Arc::new(Self { members })
    }

    pub async fn get_role(
        &self,
        user_id: &str,
        workspace_id: &str,
    ) -> KernelResult<Option<MemberRole>> {
        Ok(self
            .members
            .get(workspace_id, user_id)
            .await?
            .map(|m| m.role))
    }

    pub async fn is_member(&self, user_id: &str, workspace_id: &str) -> KernelResult<bool> {
        Ok(self.get_role(user_id, workspace_id).await?.is_some())
    }

    pub async fn is_owner(&self, user_id: &str, workspace_id: &str) -> KernelResult<bool> {
        Ok(self.get_role(user_id, workspace_id).await? == Some(MemberRole::Owner))
    }

    /// Guard used by workspace routes.
    pub async fn require_role(
        &self,
        user_id: &str,
        workspace_id: &str,
        required: MemberRole,
    ) -> KernelResult<MemberRole> {
        match self.get_role(user_id, workspace_id).await? {
            None => Err(KernelError::NotFound("workspace".into())),
            Some(role) if role.at_least(required) => Ok(role),
            Some(_) => Err(KernelError::Forbidden(format!(
                "requires {} role",
                required.as_str()
            ))),
        }
    }
}
