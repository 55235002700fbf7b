pub mod admin_db;
pub mod auth;
pub mod health;
pub mod jobs;
pub mod workspaces;
