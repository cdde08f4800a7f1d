//! Redis cache and lock adapters
//!
//! Both adapters open a multiplexed connection per call and namespace every
//! key under a prefix so several deployments can share one Redis.

use std::time::Duration;

use async_trait::async_trait;
use timeledger_core::repository::{CacheStore, LockStore, PatternDeletion};
use timeledger_core::Result;
use tracing::{debug, warn};

use crate::error::StoreError;

/// Default key namespace
pub const DEFAULT_PREFIX: &str = "timeledger:";

/// Keys requested per SCAN round trip
const SCAN_COUNT: usize = 200;

/// Delete KEYS[1] only while it still holds ARGV[1]
const RELEASE_SCRIPT: &str = r#"if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end"#;

#[derive(Clone)]
struct RedisHandle {
    client: redis::Client,
    prefix: String,
}

impl RedisHandle {
    fn open(redis_url: &str, prefix: &str) -> crate::Result<Self> {
        let client = redis::Client::open(redis_url).map_err(StoreError::redis("open"))?;
        Ok(Self {
            client,
            prefix: prefix.to_string(),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    async fn connection(&self) -> crate::Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(StoreError::redis("connect"))
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Redis-backed [`CacheStore`]
#[derive(Clone)]
pub struct RedisCache {
    handle: RedisHandle,
}

impl RedisCache {
    /// Client for `redis_url` under [`DEFAULT_PREFIX`]
    ///
    /// # Errors
    ///
    /// Returns error if the URL is invalid
    pub fn new(redis_url: &str) -> crate::Result<Self> {
        Self::with_prefix(redis_url, DEFAULT_PREFIX)
    }

    /// Client with a custom key namespace
    pub fn with_prefix(redis_url: &str, prefix: &str) -> crate::Result<Self> {
        Ok(Self {
            handle: RedisHandle::open(redis_url, prefix)?,
        })
    }

    /// PING the server
    pub async fn health_check(&self) -> crate::Result<bool> {
        let mut conn = self.handle.connection().await?;
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(StoreError::redis("PING"))?;
        Ok(pong == "PONG")
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.handle.connection().await?;
        let value: Option<String> = redis::cmd("GET")
            .arg(self.handle.key(key))
            .query_async(&mut conn)
            .await
            .map_err(StoreError::redis("GET"))?;
        Ok(value)
    }

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let mut conn = self.handle.connection().await?;
        redis::cmd("SET")
            .arg(self.handle.key(key))
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async::<()>(&mut conn)
            .await
            .map_err(StoreError::redis("SET"))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.handle.connection().await?;
        redis::cmd("DEL")
            .arg(self.handle.key(key))
            .query_async::<i64>(&mut conn)
            .await
            .map_err(StoreError::redis("DEL"))?;
        Ok(())
    }

    async fn delete_by_pattern(&self, pattern: &str, cap: usize) -> Result<PatternDeletion> {
        let mut conn = self.handle.connection().await?;
        let full_pattern = self.handle.key(pattern);
        let mut outcome = PatternDeletion::default();
        let mut cursor: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&full_pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(StoreError::redis("SCAN"))?;

            let room = cap.saturating_sub(outcome.scanned);
            let batch: Vec<String> = keys.into_iter().take(room).collect();
            outcome.scanned += batch.len();
            if !batch.is_empty() {
                let removed: usize = redis::cmd("DEL")
                    .arg(&batch)
                    .query_async(&mut conn)
                    .await
                    .map_err(StoreError::redis("DEL"))?;
                outcome.deleted += removed;
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
            if outcome.scanned >= cap {
                outcome.truncated = true;
                warn!(pattern = %full_pattern, cap, "Pattern delete stopped at cap");
                break;
            }
        }

        debug!(
            pattern = %full_pattern,
            scanned = outcome.scanned,
            deleted = outcome.deleted,
            "Pattern delete finished"
        );
        Ok(outcome)
    }
}

/// Redis-backed [`LockStore`] using `SET NX PX`
#[derive(Clone)]
pub struct RedisLockStore {
    handle: RedisHandle,
}

impl RedisLockStore {
    /// Client for `redis_url` under [`DEFAULT_PREFIX`]
    pub fn new(redis_url: &str) -> crate::Result<Self> {
        Self::with_prefix(redis_url, DEFAULT_PREFIX)
    }

    /// Client with a custom key namespace
    pub fn with_prefix(redis_url: &str, prefix: &str) -> crate::Result<Self> {
        Ok(Self {
            handle: RedisHandle::open(redis_url, prefix)?,
        })
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.handle.connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.handle.key(key))
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(StoreError::redis("SET NX"))?;
        Ok(reply.is_some())
    }

    async fn release(&self, key: &str, value: &str) -> Result<bool> {
        let mut conn = self.handle.connection().await?;
        let removed: i64 = redis::cmd("EVAL")
            .arg(RELEASE_SCRIPT)
            .arg(1)
            .arg(self.handle.key(key))
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(StoreError::redis("EVAL release"))?;
        Ok(removed == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_is_never_zero() {
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2000);
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        assert!(RedisCache::new("not a url").is_err());
    }

    #[test]
    fn test_keys_are_prefixed() {
        let cache = RedisCache::with_prefix("redis://127.0.0.1:6379", "t:").unwrap();
        assert_eq!(cache.handle.key("svc:x"), "t:svc:x");
    }

    // Require a running Redis instance
    // Run with: cargo test --features redis-tests
    #[cfg(feature = "redis-tests")]
    mod live {
        use super::*;

        const URL: &str = "redis://127.0.0.1:6379";

        #[tokio::test]
        async fn test_cache_round_trip_and_pattern_delete() {
            let cache = RedisCache::with_prefix(URL, "timeledger-test:").unwrap();
            cache
                .set_with_ttl("svc:a:1", "one".into(), Duration::from_secs(30))
                .await
                .unwrap();
            cache
                .set_with_ttl("svc:a:2", "two".into(), Duration::from_secs(30))
                .await
                .unwrap();
            assert_eq!(cache.get("svc:a:1").await.unwrap().as_deref(), Some("one"));

            let outcome = cache.delete_by_pattern("svc:a:*", 100).await.unwrap();
            assert_eq!(outcome.deleted, 2);
            assert!(!outcome.truncated);
            assert!(cache.get("svc:a:2").await.unwrap().is_none());
        }

        #[tokio::test]
        async fn test_set_nx_is_exclusive() {
            let locks = RedisLockStore::with_prefix(URL, "timeledger-test:").unwrap();
            let ttl = Duration::from_secs(5);
            assert!(locks.set_nx("lock:x", "a", ttl).await.unwrap());
            assert!(!locks.set_nx("lock:x", "b", ttl).await.unwrap());
            assert!(!locks.release("lock:x", "b").await.unwrap());
            assert!(locks.release("lock:x", "a").await.unwrap());
            assert!(locks.set_nx("lock:x", "c", ttl).await.unwrap());
            assert!(locks.release("lock:x", "c").await.unwrap());
        }
    }
}
