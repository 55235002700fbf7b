//! Idempotency response cache.
//!
//! Stores `{status, headers, body}` for successful non-safe requests that
//! carried an `Idempotency-Key` header, scoped by principal. Replays are
//! byte-identical. Store failures never block the handler; the middleware
//! falls through.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::common::KernelResult;
use crate::kernel::kv::KvStore;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    /// Response body, UTF-8. The cache only captures JSON/text responses;
    /// streaming paths are excluded by the middleware.
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    pub ttl_secs: u64,
    pub key_prefix: String,
    /// Path prefixes never cached (streaming endpoints).
    pub exclude_paths: Vec<String>,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 86400,
            key_prefix: "idempotency".to_string(),
            exclude_paths: vec![],
        }
    }
}

pub struct IdempotencyStore {
    kv: Arc<dyn KvStore>,
    config: IdempotencyConfig,
}

impl IdempotencyStore {
    pub fn new(kv: Arc<dyn KvStore>, config: IdempotencyConfig) -> Self {
        Self { kv, config }
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        self.config
            .exclude_paths
            .iter()
            .any(|prefix| path.starts_with(prefix))
    }

    /// Cache key: `(principal id | empty) + ":" + client key`, prefixed.
    pub fn cache_key(&self, principal_id: Option<&str>, client_key: &str) -> String {
        format!(
            "{}:{}:{}",
            self.config.key_prefix,
            principal_id.unwrap_or(""),
            client_key
        )
    }

    pub async fn get(
        &self,
        principal_id: Option<&str>,
        client_key: &str,
    ) -> KernelResult<Option<CachedResponse>> {
        let key = self.cache_key(principal_id, client_key);
        let Some(raw) = self.kv.get(&key).await? else {
            return Ok(None);
        };
        Ok(serde_json::from_str(&raw).ok())
    }

    pub async fn store(
        &self,
        principal_id: Option<&str>,
        client_key: &str,
        response: &CachedResponse,
    ) -> KernelResult<()> {
        let key = self.cache_key(principal_id, client_key);
        let json = serde_json::to_string(response)
            .map_err(|e| crate::common::KernelError::Internal(e.into()))?;
        self.kv.set_ex(&key, &json, self.config.ttl_secs).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::kv::MemoryKv;

    fn store() -> IdempotencyStore {
        IdempotencyStore::new(
            Arc::new(MemoryKv::new()),
            IdempotencyConfig {
                exclude_paths: vec!["/stream".into()],
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn roundtrip_preserves_response() {
        let store = store();
        let response = CachedResponse {
            status: 200,
            headers: BTreeMap::from([("content-type".to_string(), "application/json".to_string())]),
            body: "{\"id\":\"A\"}".to_string(),
        };
        store.store(Some("user-1"), "k1", &response).await.unwrap();
        let cached = store.get(Some("user-1"), "k1").await.unwrap().unwrap();
        assert_eq!(cached, response);
    }

    #[tokio::test]
    async fn scope_includes_principal() {
        let store = store();
        let response = CachedResponse {
            status: 200,
            headers: BTreeMap::new(),
            body: "{}".to_string(),
        };
        store.store(Some("user-1"), "k1", &response).await.unwrap();
        assert!(store.get(Some("user-2"), "k1").await.unwrap().is_none());
        assert!(store.get(None, "k1").await.unwrap().is_none());
        assert!(store.get(Some("user-1"), "k1").await.unwrap().is_some());
    }

    #[test]
    fn excluded_paths_match_by_prefix() {
        let store = store();
        assert!(store.is_excluded("/stream/chat"));
        assert!(!store.is_excluded("/workspaces"));
    }
}
