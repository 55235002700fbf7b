//! Reliability primitives: rate limiting, request idempotency, and
//! per-principal stream leases.

pub mod idempotency;
pub mod leases;
pub mod rate_limit;

pub use idempotency::{CachedResponse, IdempotencyConfig, IdempotencyStore};
pub use leases::{StreamLeaseConfig, StreamLeaseLimiter};
pub use rate_limit::{RateDecision, RateLimitConfig, RateLimiter, RateTier};
