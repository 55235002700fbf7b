//! Bearer token issuing and verification.
//!
//! Tokens are HS256-signed with a symmetric secret and carry the subject id,
//! email, role and token type. Refresh tokens can only be exchanged for new
//! access tokens, never used as bearer credentials.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::common::{KernelError, KernelResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
        }
    }

    pub fn parse(raw: &str) -> Role {
        if raw == "admin" {
            Role::Admin
        } else {
            Role::User
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Access,
    Refresh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject id (user id).
    pub sub: String,
    pub email: String,
    pub role: Role,
    #[serde(rename = "type")]
    pub token_type: TokenType,
    pub exp: i64,
    pub iat: i64,
}

impl Claims {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenService {
    pub fn new(secret: &str, access_ttl_secs: i64, refresh_ttl_secs: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            access_ttl: Duration::seconds(access_ttl_secs),
            refresh_ttl: Duration::seconds(refresh_ttl_secs),
        }
    }

    fn issue(&self, sub: &str, email: &str, role: Role, token_type: TokenType) -> KernelResult<String> {
        let now = Utc::now();
        let ttl = match token_type {
            TokenType::Access => self.access_ttl,
            TokenType::Refresh => self.refresh_ttl,
        };
        let claims = Claims {
            sub: sub.to_string(),
            email: email.to_string(),
            role,
            token_type,
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| KernelError::Internal(anyhow::anyhow!("token encode: {}", e)))
    }

    pub fn create_access_token(&self, sub: &str, email: &str, role: Role) -> KernelResult<String> {
        self.issue(sub, email, role, TokenType::Access)
    }

    pub fn create_refresh_token(&self, sub: &str, email: &str, role: Role) -> KernelResult<String> {
        self.issue(sub, email, role, TokenType::Refresh)
    }

    /// Decode and verify signature and expiry.
    pub fn verify(&self, token: &str) -> KernelResult<Claims> {
        decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| KernelError::Unauthenticated(format!("invalid token: {}", e)))
    }

    /// Verify an access token specifically (bearer auth path).
    pub fn verify_access(&self, token: &str) -> KernelResult<Claims> {
        let claims = self.verify(token)?;
        if claims.token_type != TokenType::Access {
            return Err(KernelError::Unauthenticated(
                "refresh token cannot be used as bearer credential".into(),
            ));
        }
        Ok(claims)
    }

    /// Verify a refresh token for the token exchange endpoint.
    pub fn verify_refresh(&self, token: &str) -> KernelResult<Claims> {
        let claims = self.verify(token)?;
        if claims.token_type != TokenType::Refresh {
            return Err(KernelError::Unauthenticated("not a refresh token".into()));
        }
        Ok(claims)
    }
}
