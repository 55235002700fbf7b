//! Stream lease limiter: per-principal cap on concurrent streams.
//!
//! Leases live in one sorted set per principal scored by expiry. Acquisition
//! expires stale entries, counts the rest, and inserts only under the limit
//! atomically, so the invariant `live leases <= limit` holds under
//! concurrent acquire. Handlers hold a lease for the life of the stream and
//! release on every exit path.

use std::sync::Arc;

use uuid::Uuid;

use crate::common::{KernelError, KernelResult};
use crate::kernel::kv::KvStore;

#[derive(Debug, Clone)]
pub struct StreamLeaseConfig {
    pub limit: u32,
    pub ttl_secs: u64,
    pub key_prefix: String,
}

impl Default for StreamLeaseConfig {
    fn default() -> Self {
        Self {
            limit: 3,
            ttl_secs: 360,
            key_prefix: "stream_leases".to_string(),
        }
    }
}

pub struct StreamLeaseLimiter {
    kv: Arc<dyn KvStore>,
    config: StreamLeaseConfig,
}

impl StreamLeaseLimiter {
    pub fn new(kv: Arc<dyn KvStore>, config: StreamLeaseConfig) -> Self {
        Self { kv, config }
    }

    fn key(&self, principal_id: &str) -> String {
        format!("{}:{}", self.config.key_prefix, principal_id)
    }

    /// Acquire a lease slot. Returns the lease id, or `StreamLimitExceeded`
    /// when the principal is at capacity.
    pub async fn acquire(&self, principal_id: &str) -> KernelResult<String> {
        let lease_id = Uuid::new_v4().to_string();
        let granted = self
            .kv
            .lease_acquire(
                &self.key(principal_id),
                &lease_id,
                self.config.ttl_secs,
                self.config.limit,
            )
            .await?;
        if granted {
            Ok(lease_id)
        } else {
            Err(KernelError::StreamLimitExceeded)
        }
    }

    /// Extend a held lease. False when it already expired or was released.
    pub async fn refresh(&self, principal_id: &str, lease_id: &str) -> KernelResult<bool> {
        self.kv
            .lease_refresh(&self.key(principal_id), lease_id, self.config.ttl_secs)
            .await
    }

    /// Release a lease. Releasing twice is harmless.
    pub async fn release(&self, principal_id: &str, lease_id: &str) -> KernelResult<bool> {
        self.kv.zrem(&self.key(principal_id), lease_id).await
    }

    /// Live lease count for a principal.
    pub async fn count(&self, principal_id: &str) -> KernelResult<u64> {
        let key = self.key(principal_id);
        self.kv
            .zrem_range_by_score(&key, f64::MIN, crate::kernel::kv::epoch_now())
            .await?;
        self.kv.zcard(&key).await
    }
}
