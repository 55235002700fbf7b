//! Shared key-value store abstraction.
//!
//! The job queue, rate limiter, idempotency cache and stream leases all sit
//! on Redis-compatible primitives: strings with TTL, lists, sorted sets, and
//! a couple of atomic composites (Lua scripts on Redis). `MemoryKv` provides
//! the same semantics in-process for tests and single-node deployments where
//! no Redis is configured.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use crate::common::{KernelError, KernelResult};

/// Current time as fractional epoch seconds, the score unit for all sorted
/// sets (rate-limit windows, lease expiries, delayed jobs).
pub fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs_f64()
}

/// Result of one atomic sliding-window probe.
#[derive(Debug, Clone, Copy)]
pub struct WindowProbe {
    pub allowed: bool,
    /// Entries in the window *before* this request was recorded.
    pub count: u64,
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn ping(&self) -> KernelResult<()>;

    async fn get(&self, key: &str) -> KernelResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> KernelResult<()>;
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> KernelResult<()>;
    async fn del(&self, key: &str) -> KernelResult<bool>;
    async fn expire(&self, key: &str, ttl_secs: u64) -> KernelResult<()>;

    async fn lpush(&self, key: &str, value: &str) -> KernelResult<()>;
    async fn rpop(&self, key: &str) -> KernelResult<Option<String>>;
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> KernelResult<Vec<String>>;
    async fn llen(&self, key: &str) -> KernelResult<u64>;
    async fn lrem(&self, key: &str, value: &str) -> KernelResult<u64>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> KernelResult<()>;
    async fn zrem(&self, key: &str, member: &str) -> KernelResult<bool>;
    async fn zscore(&self, key: &str, member: &str) -> KernelResult<Option<f64>>;
    async fn zcard(&self, key: &str) -> KernelResult<u64>;
    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> KernelResult<Vec<String>>;
    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> KernelResult<u64>;

    /// Atomic sliding-window probe: drop entries older than the window,
    /// count the rest, record `now`, refresh the key TTL to `window + 1`.
    async fn sliding_window_probe(
        &self,
        key: &str,
        window_secs: u64,
        limit: u32,
    ) -> KernelResult<WindowProbe>;

    /// Atomic lease acquisition: expire stale members, count live ones, and
    /// insert `lease_id` scored at `now + ttl` iff under `limit`.
    async fn lease_acquire(
        &self,
        key: &str,
        lease_id: &str,
        ttl_secs: u64,
        limit: u32,
    ) -> KernelResult<bool>;

    /// Extend an existing lease. Returns false if the lease no longer exists.
    async fn lease_refresh(&self, key: &str, lease_id: &str, ttl_secs: u64) -> KernelResult<bool>;
}

// ============================================================================
// In-memory implementation
// ============================================================================

#[derive(Default)]
struct MemoryInner {
    strings: HashMap<String, (String, Option<Instant>)>,
    lists: HashMap<String, VecDeque<String>>,
    zsets: HashMap<String, BTreeMap<String, f64>>,
    /// TTLs for list/zset keys set via `expire`.
    key_deadlines: HashMap<String, Instant>,
}

impl MemoryInner {
    fn evict_expired(&mut self) {
        let now = Instant::now();
        self.strings.retain(|_, (_, deadline)| match deadline {
            Some(d) => *d > now,
            None => true,
        });
        let dead: Vec<String> = self
            .key_deadlines
            .iter()
            .filter(|(_, d)| **d <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in dead {
            self.key_deadlines.remove(&key);
            self.lists.remove(&key);
            self.zsets.remove(&key);
        }
    }
}

/// Single-process fallback store with the same semantics as the Redis
/// implementation. All operations run under one mutex, which also makes the
/// composite operations atomic.
#[derive(Default)]
pub struct MemoryKv {
    inner: Mutex<MemoryInner>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn ping(&self) -> KernelResult<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> KernelResult<Option<String>> {
        let mut inner = self.inner.lock().unwrap();
        inner.evict_expired();
        Ok(inner.strings.get(key).map(|(v, _)| v.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> KernelResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.strings.insert(key.to_string(), (value.to_string(), None));
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> KernelResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.strings.insert(
            key.to_string(),
            (
                value.to_string(),
                Some(Instant::now() + Duration::from_secs(ttl_secs)),
            ),
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> KernelResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let existed = inner.strings.remove(key).is_some()
            | inner.lists.remove(key).is_some()
            | inner.zsets.remove(key).is_some();
        inner.key_deadlines.remove(key);
        Ok(existed)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> KernelResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let deadline = Instant::now() + Duration::from_secs(ttl_secs);
        if let Some(entry) = inner.strings.get_mut(key) {
            entry.1 = Some(deadline);
        }
        if inner.lists.contains_key(key) || inner.zsets.contains_key(key) {
            inner.key_deadlines.insert(key.to_string(), deadline);
        }
        Ok(())
    }

    async fn lpush(&self, key: &str, value: &str) -> KernelResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .lists
            .entry(key.to_string())
            .or_default()
            .push_front(value.to_string());
        Ok(())
    }

    async fn rpop(&self, key: &str) -> KernelResult<Option<String>> {
        let mut inner = self.inner.lock().unwrap();
        inner.evict_expired();
        Ok(inner.lists.get_mut(key).and_then(|l| l.pop_back()))
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> KernelResult<Vec<String>> {
        let mut inner = self.inner.lock().unwrap();
        inner.evict_expired();
        let Some(list) = inner.lists.get(key) else {
            return Ok(vec![]);
        };
        let len = list.len() as i64;
        let norm = |i: i64| -> i64 {
            if i < 0 {
                (len + i).max(0)
            } else {
                i.min(len.saturating_sub(1))
            }
        };
        if len == 0 {
            return Ok(vec![]);
        }
        let (start, stop) = (norm(start), norm(stop));
        if start > stop {
            return Ok(vec![]);
        }
        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    async fn llen(&self, key: &str) -> KernelResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        inner.evict_expired();
        Ok(inner.lists.get(key).map(|l| l.len() as u64).unwrap_or(0))
    }

    async fn lrem(&self, key: &str, value: &str) -> KernelResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        let Some(list) = inner.lists.get_mut(key) else {
            return Ok(0);
        };
        let before = list.len();
        list.retain(|v| v != value);
        Ok((before - list.len()) as u64)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> KernelResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> KernelResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner
            .zsets
            .get_mut(key)
            .map(|z| z.remove(member).is_some())
            .unwrap_or(false))
    }

    async fn zscore(&self, key: &str, member: &str) -> KernelResult<Option<f64>> {
        let mut inner = self.inner.lock().unwrap();
        inner.evict_expired();
        Ok(inner.zsets.get(key).and_then(|z| z.get(member).copied()))
    }

    async fn zcard(&self, key: &str) -> KernelResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        inner.evict_expired();
        Ok(inner.zsets.get(key).map(|z| z.len() as u64).unwrap_or(0))
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> KernelResult<Vec<String>> {
        let mut inner = self.inner.lock().unwrap();
        inner.evict_expired();
        let Some(zset) = inner.zsets.get(key) else {
            return Ok(vec![]);
        };
        let mut members: Vec<(&String, f64)> = zset
            .iter()
            .filter(|(_, s)| **s >= min && **s <= max)
            .map(|(m, s)| (m, *s))
            .collect();
        members.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(members
            .into_iter()
            .take(limit)
            .map(|(m, _)| m.clone())
            .collect())
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> KernelResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        let Some(zset) = inner.zsets.get_mut(key) else {
            return Ok(0);
        };
        let before = zset.len();
        zset.retain(|_, s| *s < min || *s > max);
        Ok((before - zset.len()) as u64)
    }

    async fn sliding_window_probe(
        &self,
        key: &str,
        window_secs: u64,
        limit: u32,
    ) -> KernelResult<WindowProbe> {
        let mut inner = self.inner.lock().unwrap();
        let now = epoch_now();
        let window_start = now - window_secs as f64;
        let zset = inner.zsets.entry(key.to_string()).or_default();
        zset.retain(|_, s| *s >= window_start);
        let count = zset.len() as u64;
        let allowed = count < limit as u64;
        if allowed {
            // Member key must be unique per request; two probes can land on
            // the same clock reading.
            zset.insert(format!("{now:.9}:{}", uuid::Uuid::new_v4()), now);
        }
        inner.key_deadlines.insert(
            key.to_string(),
            Instant::now() + Duration::from_secs(window_secs + 1),
        );
        Ok(WindowProbe { allowed, count })
    }

    async fn lease_acquire(
        &self,
        key: &str,
        lease_id: &str,
        ttl_secs: u64,
        limit: u32,
    ) -> KernelResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let now = epoch_now();
        let zset = inner.zsets.entry(key.to_string()).or_default();
        zset.retain(|_, expires| *expires > now);
        if zset.len() >= limit as usize {
            return Ok(false);
        }
        zset.insert(lease_id.to_string(), now + ttl_secs as f64);
        Ok(true)
    }

    async fn lease_refresh(&self, key: &str, lease_id: &str, ttl_secs: u64) -> KernelResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let now = epoch_now();
        let Some(zset) = inner.zsets.get_mut(key) else {
            return Ok(false);
        };
        match zset.get_mut(lease_id) {
            Some(expires) if *expires > now => {
                *expires = now + ttl_secs as f64;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

// ============================================================================
// Redis implementation
// ============================================================================

/// Redis-backed store. Composite operations run as Lua scripts so they are
/// atomic across processes.
#[derive(Clone)]
pub struct RedisKv {
    conn: ConnectionManager,
}

impl RedisKv {
    /// Connect and verify the server responds to PING.
    pub async fn connect(url: &str) -> KernelResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| KernelError::Unavailable(format!("invalid redis url: {}", e)))?;
        let conn = ConnectionManager::new(client).await?;
        let store = Self { conn };
        store.ping().await?;
        Ok(store)
    }

    fn window_script() -> redis::Script {
        redis::Script::new(
            r#"
            local key = KEYS[1]
            local now = tonumber(ARGV[1])
            local window = tonumber(ARGV[2])
            local limit = tonumber(ARGV[3])
            local member = ARGV[4]

            redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
            local count = redis.call('ZCARD', key)
            local allowed = 0
            if count < limit then
                redis.call('ZADD', key, now, member)
                allowed = 1
            end
            redis.call('EXPIRE', key, window + 1)
            return {allowed, count}
        "#,
        )
    }

    fn lease_script() -> redis::Script {
        redis::Script::new(
            r#"
            local key = KEYS[1]
            local now = tonumber(ARGV[1])
            local ttl = tonumber(ARGV[2])
            local limit = tonumber(ARGV[3])
            local lease_id = ARGV[4]

            redis.call('ZREMRANGEBYSCORE', key, '-inf', now)
            if redis.call('ZCARD', key) >= limit then
                return 0
            end
            redis.call('ZADD', key, now + ttl, lease_id)
            return 1
        "#,
        )
    }

    fn refresh_script() -> redis::Script {
        redis::Script::new(
            r#"
            local key = KEYS[1]
            local now = tonumber(ARGV[1])
            local ttl = tonumber(ARGV[2])
            local lease_id = ARGV[3]

            local score = redis.call('ZSCORE', key, lease_id)
            if not score or tonumber(score) <= now then
                return 0
            end
            redis.call('ZADD', key, now + ttl, lease_id)
            return 1
        "#,
        )
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn ping(&self) -> KernelResult<()> {
        let _: String = redis::cmd("PING")
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> KernelResult<Option<String>> {
        Ok(redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.conn.clone())
            .await?)
    }

    async fn set(&self, key: &str, value: &str) -> KernelResult<()> {
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async::<_, ()>(&mut self.conn.clone())
            .await?;
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> KernelResult<()> {
        redis::cmd("SETEX")
            .arg(key)
            .arg(ttl_secs)
            .arg(value)
            .query_async::<_, ()>(&mut self.conn.clone())
            .await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> KernelResult<bool> {
        let removed: u64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(removed > 0)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> KernelResult<()> {
        redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs)
            .query_async::<_, ()>(&mut self.conn.clone())
            .await?;
        Ok(())
    }

    async fn lpush(&self, key: &str, value: &str) -> KernelResult<()> {
        redis::cmd("LPUSH")
            .arg(key)
            .arg(value)
            .query_async::<_, ()>(&mut self.conn.clone())
            .await?;
        Ok(())
    }

    async fn rpop(&self, key: &str) -> KernelResult<Option<String>> {
        Ok(redis::cmd("RPOP")
            .arg(key)
            .query_async(&mut self.conn.clone())
            .await?)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> KernelResult<Vec<String>> {
        Ok(redis::cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut self.conn.clone())
            .await?)
    }

    async fn llen(&self, key: &str) -> KernelResult<u64> {
        Ok(redis::cmd("LLEN")
            .arg(key)
            .query_async(&mut self.conn.clone())
            .await?)
    }

    async fn lrem(&self, key: &str, value: &str) -> KernelResult<u64> {
        Ok(redis::cmd("LREM")
            .arg(key)
            .arg(0)
            .arg(value)
            .query_async(&mut self.conn.clone())
            .await?)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> KernelResult<()> {
        redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async::<_, ()>(&mut self.conn.clone())
            .await?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> KernelResult<bool> {
        let removed: u64 = redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(removed > 0)
    }

    async fn zscore(&self, key: &str, member: &str) -> KernelResult<Option<f64>> {
        Ok(redis::cmd("ZSCORE")
            .arg(key)
            .arg(member)
            .query_async(&mut self.conn.clone())
            .await?)
    }

    async fn zcard(&self, key: &str) -> KernelResult<u64> {
        Ok(redis::cmd("ZCARD")
            .arg(key)
            .query_async(&mut self.conn.clone())
            .await?)
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> KernelResult<Vec<String>> {
        Ok(redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(min)
            .arg(max)
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut self.conn.clone())
            .await?)
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> KernelResult<u64> {
        Ok(redis::cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg(min)
            .arg(max)
            .query_async(&mut self.conn.clone())
            .await?)
    }

    async fn sliding_window_probe(
        &self,
        key: &str,
        window_secs: u64,
        limit: u32,
    ) -> KernelResult<WindowProbe> {
        let now = epoch_now();
        let member = format!("{now:.9}:{}", uuid::Uuid::new_v4());
        let result: Vec<i64> = Self::window_script()
            .key(key)
            .arg(now)
            .arg(window_secs)
            .arg(limit)
            .arg(member)
            .invoke_async(&mut self.conn.clone())
            .await?;
        Ok(WindowProbe {
            allowed: result.first().copied().unwrap_or(0) == 1,
            count: result.get(1).copied().unwrap_or(0) as u64,
        })
    }

    async fn lease_acquire(
        &self,
        key: &str,
        lease_id: &str,
        ttl_secs: u64,
        limit: u32,
    ) -> KernelResult<bool> {
        let granted: i64 = Self::lease_script()
            .key(key)
            .arg(epoch_now())
            .arg(ttl_secs)
            .arg(limit)
            .arg(lease_id)
            .invoke_async(&mut self.conn.clone())
            .await?;
        Ok(granted == 1)
    }

    async fn lease_refresh(&self, key: &str, lease_id: &str, ttl_secs: u64) -> KernelResult<bool> {
        let refreshed: i64 = Self::refresh_script()
            .key(key)
            .arg(epoch_now())
            .arg(ttl_secs)
            .arg(lease_id)
            .invoke_async(&mut self.conn.clone())
            .await?;
        Ok(refreshed == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_list_is_fifo() {
        let kv = MemoryKv::new();
        kv.lpush("q", "a").await.unwrap();
        kv.lpush("q", "b").await.unwrap();
        assert_eq!(kv.rpop("q").await.unwrap(), Some("a".into()));
        assert_eq!(kv.rpop("q").await.unwrap(), Some("b".into()));
        assert_eq!(kv.rpop("q").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_zset_range_and_removal() {
        let kv = MemoryKv::new();
        kv.zadd("z", "one", 1.0).await.unwrap();
        kv.zadd("z", "two", 2.0).await.unwrap();
        kv.zadd("z", "three", 3.0).await.unwrap();

        let due = kv.zrange_by_score("z", f64::MIN, 2.0, 10).await.unwrap();
        assert_eq!(due, vec!["one".to_string(), "two".to_string()]);

        let removed = kv.zrem_range_by_score("z", f64::MIN, 2.0).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(kv.zcard("z").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn sliding_window_blocks_at_limit() {
        let kv = MemoryKv::new();
        for _ in 0..3 {
            let probe = kv.sliding_window_probe("rl", 60, 3).await.unwrap();
            assert!(probe.allowed);
        }
        let probe = kv.sliding_window_probe("rl", 60, 3).await.unwrap();
        assert!(!probe.allowed);
        assert_eq!(probe.count, 3);
    }

    #[tokio::test]
    async fn lease_acquire_respects_limit() {
        let kv = MemoryKv::new();
        assert!(kv.lease_acquire("leases", "l1", 60, 2).await.unwrap());
        assert!(kv.lease_acquire("leases", "l2", 60, 2).await.unwrap());
        assert!(!kv.lease_acquire("leases", "l3", 60, 2).await.unwrap());

        kv.zrem("leases", "l1").await.unwrap();
        assert!(kv.lease_acquire("leases", "l3", 60, 2).await.unwrap());
    }

    #[tokio::test]
    async fn lease_refresh_requires_live_lease() {
        let kv = MemoryKv::new();
        assert!(!kv.lease_refresh("leases", "ghost", 60).await.unwrap());
        kv.lease_acquire("leases", "l1", 60, 2).await.unwrap();
        assert!(kv.lease_refresh("leases", "l1", 60).await.unwrap());
    }

    #[tokio::test]
    async fn set_ex_expires() {
        let kv = MemoryKv::new();
        kv.set_ex("k", "v", 0).await.unwrap();
        // Zero-second TTL expires immediately.
        assert_eq!(kv.get("k").await.unwrap(), None);
    }
}
