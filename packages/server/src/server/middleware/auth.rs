//! Bearer authentication middleware and request extractors.
//!
//! The middleware verifies the token and loads the user; requests without a
//! valid token continue unauthenticated (public routes exist). Handlers
//! state their requirement through the `CurrentUser` / `AdminUser`
//! extractors, which answer 401/403.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use tracing::debug;

use crate::common::KernelError;
use crate::kernel::auth::Role;
use crate::kernel::Kernel;

/// Authenticated principal, stored in request extensions.
#[derive(Clone, Debug)]
pub struct AuthUser {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub role: Role,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Pull the bearer token out of the Authorization header. Accepts both
/// `Bearer <token>` and a raw token.
pub fn bearer_token(request_headers: &axum::http::HeaderMap) -> Option<&str> {
    let raw = request_headers.get("authorization")?.to_str().ok()?;
    Some(raw.strip_prefix("Bearer ").unwrap_or(raw))
}

pub async fn auth_middleware(
    kernel: Arc<Kernel>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    if let Some(token) = bearer_token(request.headers()) {
        match kernel.tokens.verify_access(token) {
            Ok(claims) => match kernel.users.load_active(&claims.sub).await {
                Ok(user) => {
                    debug!(user_id = %user.id, "authenticated");
                    request.extensions_mut().insert(AuthUser {
                        id: user.id,
                        email: user.email,
                        name: user.name,
                        role: user.role,
                    });
                }
                Err(e) => {
                    debug!(error = %e, "token subject rejected");
                }
            },
            Err(e) => {
                debug!(error = %e, "bearer token rejected");
            }
        }
    }

    next.run(request).await
}

/// Extractor requiring a valid authenticated user.
pub struct CurrentUser(pub AuthUser);

#[axum::async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = KernelError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthUser>()
            .cloned()
            .map(CurrentUser)
            .ok_or_else(|| KernelError::Unauthenticated("missing or invalid bearer token".into()))
    }
}

/// Extractor requiring the admin role.
pub struct AdminUser(pub AuthUser);

#[axum::async_trait]
impl<S> FromRequestParts<S> for AdminUser
where
    S: Send + Sync,
{
    type Rejection = KernelError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let CurrentUser(user) = CurrentUser::from_request_parts(parts, state).await?;
        if !user.is_admin() {
            return Err(KernelError::Forbidden("requires admin role".into()));
        }
        Ok(AdminUser(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;

    #[test]
    fn bearer_token_with_and_without_prefix() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer abc.def.ghi".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc.def.ghi"));

        headers.insert("authorization", "abc.def.ghi".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc.def.ghi"));
    }

    #[test]
    fn no_header_no_token() {
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }
}
