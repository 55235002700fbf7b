//! Workspace, member and invite entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::kernel::storage::{EntityDescriptor, FieldDef};

pub const WORKSPACES_TABLE: &str = "workspaces";
pub const MEMBERS_TABLE: &str = "workspace_members";
pub const INVITES_TABLE: &str = "workspace_invites";

pub fn workspaces_entity() -> EntityDescriptor {
    EntityDescriptor::new(WORKSPACES_TABLE)
        .field(FieldDef::text("name").not_null())
        .field(FieldDef::text("slug").unique().indexed())
        .field(FieldDef::text("owner_id").not_null().indexed())
        .field(FieldDef::boolean("is_personal").default_value("0"))
        .field(FieldDef::json("settings"))
}

pub fn members_entity() -> EntityDescriptor {
    EntityDescriptor::new(MEMBERS_TABLE)
        .field(FieldDef::text("workspace_id").not_null().indexed())
        .field(FieldDef::text("user_id").not_null().indexed())
        .field(
            FieldDef::text("role")
                .not_null()
                .default_value("member")
                .check("[role] IN ('owner', 'admin', 'member')"),
        )
        .field(FieldDef::text("invited_by"))
        .field(FieldDef::text("joined_at"))
}

pub fn invites_entity() -> EntityDescriptor {
    EntityDescriptor::new(INVITES_TABLE)
        .field(FieldDef::text("workspace_id").not_null().indexed())
        .field(FieldDef::text("email").not_null().indexed())
        .field(
            FieldDef::text("role")
                .not_null()
                .default_value("member")
                .check("[role] IN ('owner', 'admin', 'member')"),
        )
        .field(FieldDef::text("token").not_null().unique().indexed())
        .field(FieldDef::text("invited_by").not_null())
        .field(
            FieldDef::text("status")
                .not_null()
                .default_value("pending")
                .check("[status] IN ('pending', 'accepted', 'expired', 'cancelled')"),
        )
        .field(FieldDef::text("expires_at"))
        .field(FieldDef::text("accepted_at"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Member,
    Admin,
    Owner,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberRole::Owner => "owner",
            MemberRole::Admin => "admin",
            MemberRole::Member => "member",
        }
    }

    pub fn parse(raw: &str) -> Option<MemberRole> {
        match raw {
            "owner" => Some(MemberRole::Owner),
            "admin" => Some(MemberRole::Admin),
            "member" => Some(MemberRole::Member),
            _ => None,
        }
    }

    /// Role ordering gives `at_least` for free: owner > admin > member.
    pub fn at_least(&self, required: MemberRole) -> bool {
        *self >= required
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InviteStatus {
    Pending,
    Accepted,
    Expired,
    Cancelled,
}

impl InviteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InviteStatus::Pending => "pending",
            InviteStatus::Accepted => "accepted",
            InviteStatus::Expired => "expired",
            InviteStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub slug: Option<String>,
    pub owner_id: String,
    pub is_personal: bool,
    pub settings: Value,
}

impl Workspace {
    pub fn from_entity(value: &Value) -> Option<Workspace> {
        Some(Workspace {
            id: value.get("id")?.as_str()?.to_string(),
            name: value.get("name")?.as_str()?.to_string(),
            slug: value
                .get("slug")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            owner_id: value.get("owner_id")?.as_str()?.to_string(),
            is_personal: value
                .get("is_personal")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            settings: value.get("settings").cloned().unwrap_or(Value::Null),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    pub workspace_id: String,
    pub user_id: String,
    pub role: MemberRole,
    pub invited_by: Option<String>,
}

impl Member {
    pub fn from_entity(value: &Value) -> Option<Member> {
        Some(Member {
            id: value.get("id")?.as_str()?.to_string(),
            workspace_id: value.get("workspace_id")?.as_str()?.to_string(),
            user_id: value.get("user_id")?.as_str()?.to_string(),
            role: MemberRole::parse(value.get("role")?.as_str()?)?,
            invited_by: value
                .get("invited_by")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invite {
    pub id: String,
    pub workspace_id: String,
    pub email: String,
    pub role: MemberRole,
    pub token: String,
    pub status: InviteStatus,
    pub invited_by: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Invite {
    pub fn from_entity(value: &Value) -> Option<Invite> {
        let status = match value.get("status")?.as_str()? {
            "pending" => InviteStatus::Pending,
            "accepted" => InviteStatus::Accepted,
            "expired" => InviteStatus::Expired,
            "cancelled" => InviteStatus::Cancelled,
            _ => return None,
        };
        Some(Invite {
            id: value.get("id")?.as_str()?.to_string(),
            workspace_id: value.get("workspace_id")?.as_str()?.to_string(),
            email: value.get("email")?.as_str()?.to_string(),
            role: MemberRole::parse(value.get("role")?.as_str()?)?,
            token: value.get("token")?.as_str()?.to_string(),
            status,
            invited_by: value.get("invited_by")?.as_str()?.to_string(),
            expires_at: value
                .get("expires_at")
                .and_then(|v| v.as_str())
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// URL-friendly slug from a workspace name, suffixed for uniqueness by the
/// store when needed.
pub fn slugify(name: &str) -> String {
    let slug: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let collapsed = slug
        .split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if collapsed.is_empty() {
        "workspace".to_string()
    } else {
        collapsed
    }
}
