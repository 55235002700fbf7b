pub mod auth;
pub mod idempotency;
pub mod ip_extractor;
pub mod rate_limit;
pub mod request_context;
pub mod security_headers;

pub use auth::{auth_middleware, AdminUser, AuthUser, CurrentUser};
pub use idempotency::idempotency_middleware;
pub use ip_extractor::{extract_client_ip, ClientIp};
pub use rate_limit::rate_limit_middleware;
pub use request_context::{request_context, RequestId};
pub use security_headers::security_headers;
