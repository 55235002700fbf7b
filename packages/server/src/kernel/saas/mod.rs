//! Multi-tenant workspace layer: workspaces, members, invites, and the
//! access checks product routes build on.

pub mod models;
pub mod stores;

pub use models::{
    invites_entity, members_entity, workspaces_entity, Invite, InviteStatus, Member, MemberRole,
    Workspace, INVITES_TABLE, MEMBERS_TABLE, WORKSPACES_TABLE,
};
pub use stores::{InviteStore, MemberStore, WorkspaceAccess, WorkspaceStore};
