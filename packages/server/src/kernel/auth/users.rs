//! User accounts for local auth mode.
//!
//! Users are a registered, historied entity; passwords are argon2-hashed.
//! Email uniqueness excludes soft-deleted rows; registering over a live row
//! is a conflict, over a deleted one is allowed.

use std::sync::Arc;

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::common::{KernelError, KernelResult};
use crate::kernel::storage::{EntityDescriptor, EntityStore, FieldDef};

use super::tokens::Role;

pub const USERS_TABLE: &str = "users";

/// Entity declaration for the users table.
pub fn users_entity() -> EntityDescriptor {
    EntityDescriptor::new(USERS_TABLE)
        .field(FieldDef::text("email").not_null().unique().indexed())
        .field(FieldDef::text("name"))
        .field(FieldDef::text("password_hash").not_null())
        .field(
            FieldDef::text("role")
                .not_null()
                .default_value("user")
                .check("[role] IN ('admin', 'user')"),
        )
        .field(FieldDef::boolean("is_active").not_null().default_value("1"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub role: Role,
    pub is_active: bool,
}

impl User {
    fn from_entity(value: &Value) -> Option<User> {
        Some(User {
            id: value.get("id")?.as_str()?.to_string(),
            email: value.get("email")?.as_str()?.to_string(),
            name: value
                .get("name")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            role: Role::parse(value.get("role").and_then(|v| v.as_str()).unwrap_or("user")),
            is_active: value
                .get("is_active")
                .and_then(|v| v.as_bool())
                .unwrap_or(true),
        })
    }
}

pub struct UserStore {
    entities: EntityStore,
}

impl UserStore {
    pub fn new(entities: EntityStore) -> Arc<Self> {
        Arc::new(Self { entities })
    }

    fn hash_password(password: &str) -> KernelResult<String> {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| KernelError::Internal(anyhow::anyhow!("password hash: {}", e)))
    }

    fn verify_password(password: &str, hash: &str) -> bool {
        PasswordHash::new(hash)
            .map(|parsed| {
                Argon2::default()
                    .verify_password(password.as_bytes(), &parsed)
                    .is_ok()
            })
            .unwrap_or(false)
    }

    /// Look up a live user by email (lowercased).
    pub async fn find_by_email(&self, email: &str) -> KernelResult<Option<Value>> {
        let mut rows = self
            .entities
            .find(
                USERS_TABLE,
                Some("[email] = ?"),
                &[Some(email.to_lowercase())],
                None,
                Some(1),
                None,
                false,
            )
            .await?;
        Ok(rows.pop())
    }

    pub async fn get(&self, user_id: &str) -> KernelResult<Option<User>> {
        Ok(self
            .entities
            .get(USERS_TABLE, user_id, false)
            .await?
            .as_ref()
            .and_then(User::from_entity))
    }

    /// Create a user. Email collisions with live rows are a conflict.
    pub async fn create(
        &self,
        email: &str,
        password: &str,
        name: Option<&str>,
        role: Role,
    ) -> KernelResult<User> {
        let email = email.trim().to_lowercase();
        if email.is_empty() || !email.contains('@') {
            return Err(KernelError::Validation("invalid email address".into()));
        }
        if password.len() < 8 {
            return Err(KernelError::Validation(
                "password must be at least 8 characters".into(),
            ));
        }
        if self.find_by_email(&email).await?.is_some() {
            return Err(KernelError::Conflict(format!(
                "an account with email {} already exists",
                email
            )));
        }

        let entity = json!({
            "email": email,
            "name": name,
            "password_hash": Self::hash_password(password)?,
            "role": role.as_str(),
            "is_active": true,
        });
        let saved = self.entities.save(USERS_TABLE, entity, None, None).await?;
        User::from_entity(&saved)
            .ok_or_else(|| KernelError::Internal(anyhow::anyhow!("user entity malformed")))
    }

    /// Verify credentials for login. Inactive accounts fail closed.
    pub async fn authenticate(&self, email: &str, password: &str) -> KernelResult<User> {
        let invalid = || KernelError::Unauthenticated("invalid email or password".into());

        let Some(entity) = self.find_by_email(email).await? else {
            return Err(invalid());
        };
        let hash = entity
            .get("password_hash")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if !Self::verify_password(password, hash) {
            return Err(invalid());
        }
        let user = User::from_entity(&entity).ok_or_else(invalid)?;
        if !user.is_active {
            return Err(KernelError::Forbidden("account is deactivated".into()));
        }
        Ok(user)
    }

    /// Loader used by the bearer middleware: token subject must still map to
    /// an active user.
    pub async fn load_active(&self, user_id: &str) -> KernelResult<User> {
        let user = self
            .get(user_id)
            .await?
            .ok_or_else(|| KernelError::Unauthenticated("account no longer exists".into()))?;
        if !user.is_active {
            return Err(KernelError::Unauthenticated("account is deactivated".into()));
        }
        Ok(user)
    }

    pub async fn change_password(
        &self,
        user_id: &str,
        current_password: &str,
        new_password: &str,
    ) -> KernelResult<()> {
        let Some(entity) = self.entities.get(USERS_TABLE, user_id, false).await? else {
            return Err(KernelError::NotFound("user".into()));
        };
        let hash = entity
            .get("password_hash")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if !Self::verify_password(current_password, hash) {
            return Err(KernelError::Unauthenticated("current password is wrong".into()));
        }
        if new_password.len() < 8 {
            return Err(KernelError::Validation(
                "password must be at least 8 characters".into(),
            ));
        }

        let update = json!({
            "id": entity.get("id"),
            "password_hash": Self::hash_password(new_password)?,
        });
        self.entities
            .save(USERS_TABLE, update, Some(user_id), Some("Password changed"))
            .await?;
        Ok(())
    }
}
