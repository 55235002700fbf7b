//! Sliding-window rate limiter.
//!
//! One sorted set of request timestamps per key (`user:<id>` for
//! authenticated principals, `ip:<addr>` otherwise). Each probe runs a
//! single atomic pipeline: drop entries older than the window, count, record
//! now, refresh the key TTL to window + 1s.

use std::sync::Arc;

use crate::common::KernelResult;
use crate::kernel::kv::KvStore;

/// Tiered limits, chosen by the middleware from the request principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateTier {
    Anonymous,
    Authenticated,
    Admin,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window_secs: u64,
    pub anonymous: u32,
    pub authenticated: u32,
    pub admin: u32,
    pub key_prefix: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            anonymous: 60,
            authenticated: 300,
            admin: 1000,
            key_prefix: "ratelimit".to_string(),
        }
    }
}

impl RateLimitConfig {
    pub fn limit_for(&self, tier: RateTier) -> u32 {
        match tier {
            RateTier::Anonymous => self.anonymous,
            RateTier::Authenticated => self.authenticated,
            RateTier::Admin => self.admin,
        }
    }
}

/// Outcome of one probe, carried into the `X-RateLimit-*` headers.
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_seconds: u64,
}

pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KvStore>, config: RateLimitConfig) -> Self {
        Self { kv, config }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn key(&self, identifier: &str) -> String {
        format!("{}:{}", self.config.key_prefix, identifier)
    }

    /// Probe and record one request for `identifier` at the given tier.
    pub async fn check(&self, identifier: &str, tier: RateTier) -> KernelResult<RateDecision> {
        let limit = self.config.limit_for(tier);
        let probe = self
            .kv
            .sliding_window_probe(&self.key(identifier), self.config.window_secs, limit)
            .await?;

        // count excludes the just-recorded request when allowed
        let used = if probe.allowed {
            probe.count + 1
        } else {
            probe.count
        };
        Ok(RateDecision {
            allowed: probe.allowed,
            limit,
            remaining: (limit as u64).saturating_sub(used) as u32,
            reset_seconds: self.config.window_secs,
        })
    }

    /// Drop all recorded requests for an identifier.
    pub async fn reset(&self, identifier: &str) -> KernelResult<()> {
        self.kv.del(&self.key(identifier)).await?;
        Ok(())
    }
}
