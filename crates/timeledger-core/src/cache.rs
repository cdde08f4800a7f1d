//! Expansion cache
//!
//! Read-through, write-invalidated cache of expansion results. Keys are
//! colon-delimited under the `schedule` category:
//!
//! - `schedule:expand:center:{C}:start:{YYYY-MM-DD}:end:{YYYY-MM-DD}`
//! - `schedule:expand:teacher:{T}:center:{C}:start:{..}:end:{..}`
//!
//! and the store adds a deployment namespace in front (`timeledger:`).
//! Cache faults never fail a request: a failed read is a miss, the write-back
//! runs detached under a timeout, and failed invalidations are logged.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::expansion::ExpandedSchedule;
use crate::models::{CenterId, TeacherId};
use crate::repository::{CacheStore, PatternDeletion};

/// Category holding expansion results
pub const SCHEDULE_CATEGORY: &str = "schedule";

/// Default namespace prefix
pub const DEFAULT_NAMESPACE: &str = "timeledger";

/// JSON cache partitioned by category, over a raw [`CacheStore`]
#[derive(Clone)]
pub struct CategoryCache {
    store: Arc<dyn CacheStore>,
    namespace: String,
}

impl CategoryCache {
    /// Wrap a store under a namespace
    pub fn new(store: Arc<dyn CacheStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    /// `{namespace}:{category}:{key}`
    #[must_use]
    pub fn full_key(&self, category: &str, key: &str) -> String {
        format!("{}:{}:{}", self.namespace, category, key)
    }

    /// Decode a cached JSON value. Undecodable entries are dropped and
    /// reported as a miss.
    pub async fn get_json<T: DeserializeOwned>(&self, category: &str, key: &str) -> Result<Option<T>> {
        let full_key = self.full_key(category, key);
        let Some(raw) = self.store.get(&full_key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(key = %full_key, error = %e, "Dropping undecodable cache entry");
                self.store.delete(&full_key).await?;
                Ok(None)
            }
        }
    }

    /// Encode and store a value with expiry
    pub async fn set_with_ttl<T: Serialize + ?Sized>(
        &self,
        category: &str,
        ttl: Duration,
        value: &T,
        key: &str,
    ) -> Result<()> {
        let json = serde_json::to_string(value)
            .map_err(|e| Error::system_with("failed to encode cache value", e))?;
        self.store
            .set_with_ttl(&self.full_key(category, key), json, ttl)
            .await
    }

    /// Remove one key
    pub async fn delete(&self, category: &str, key: &str) -> Result<()> {
        self.store.delete(&self.full_key(category, key)).await
    }

    /// Remove keys matching a glob within a category
    pub async fn delete_by_pattern(
        &self,
        category: &str,
        glob: &str,
        cap: usize,
    ) -> Result<PatternDeletion> {
        self.store
            .delete_by_pattern(&self.full_key(category, glob), cap)
            .await
    }
}

/// Expansion cache settings
#[derive(Debug, Clone, Copy)]
pub struct ExpansionCacheConfig {
    /// Entry lifetime
    pub ttl: Duration,
    /// Bound on the detached write-back
    pub writeback_timeout: Duration,
    /// Max keys visited per pattern invalidation
    pub scan_cap: usize,
}

impl Default for ExpansionCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10 * 60),
            writeback_timeout: Duration::from_secs(5),
            scan_cap: 10_000,
        }
    }
}

/// Key for a full-center expansion
#[must_use]
pub fn center_key(center_id: CenterId, start: NaiveDate, end: NaiveDate) -> String {
    format!("expand:center:{}:start:{}:end:{}", center_id, start, end)
}

/// Key for a per-teacher expansion inside a center
#[must_use]
pub fn teacher_key(
    teacher_id: TeacherId,
    center_id: CenterId,
    start: NaiveDate,
    end: NaiveDate,
) -> String {
    format!(
        "expand:teacher:{}:center:{}:start:{}:end:{}",
        teacher_id, center_id, start, end
    )
}

/// Read-through cache of expansion output
#[derive(Clone)]
pub struct ExpansionCache {
    cache: CategoryCache,
    config: ExpansionCacheConfig,
}

impl ExpansionCache {
    /// Cache over a categorised store
    pub fn new(cache: CategoryCache, config: ExpansionCacheConfig) -> Self {
        Self { cache, config }
    }

    /// Active settings
    #[must_use]
    pub fn config(&self) -> &ExpansionCacheConfig {
        &self.config
    }

    /// Serve `key` from cache or run `load`, writing the result back in the
    /// background.
    pub async fn get_or_load<F, Fut>(&self, key: String, load: F) -> Result<Vec<ExpandedSchedule>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<ExpandedSchedule>>>,
    {
        match self
            .cache
            .get_json::<Vec<ExpandedSchedule>>(SCHEDULE_CATEGORY, &key)
            .await
        {
            Ok(Some(hit)) => {
                debug!(
                    key = %self.cache.full_key(SCHEDULE_CATEGORY, &key),
                    sessions = hit.len(),
                    "Expansion cache hit"
                );
                return Ok(hit);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(key = %key, error = %e, "Expansion cache read failed, treating as miss");
            }
        }

        let sessions = load().await?;
        self.spawn_writeback(key, sessions.clone());
        Ok(sessions)
    }

    fn spawn_writeback(&self, key: String, sessions: Vec<ExpandedSchedule>) {
        let cache = self.cache.clone();
        let ttl = self.config.ttl;
        let timeout = self.config.writeback_timeout;
        tokio::spawn(async move {
            let write = cache.set_with_ttl(SCHEDULE_CATEGORY, ttl, &sessions, &key);
            match tokio::time::timeout(timeout, write).await {
                Ok(Ok(())) => debug!(key = %key, "Expansion cached"),
                Ok(Err(e)) => warn!(key = %key, error = %e, "Expansion write-back failed"),
                Err(_) => warn!(
                    key = %key,
                    timeout_ms = timeout.as_millis() as u64,
                    "Expansion write-back timed out"
                ),
            }
        });
    }

    /// Drop every cached expansion touching a center
    pub async fn invalidate_center(&self, center_id: CenterId) {
        let patterns = [
            format!("expand:center:{}:*", center_id),
            format!("expand:teacher:*:center:{}:*", center_id),
        ];
        for pattern in &patterns {
            self.delete_pattern(pattern).await;
        }
        info!(center_id = center_id, "Invalidated center expansions");
    }

    /// Drop cached per-teacher expansions of one teacher in one center
    pub async fn invalidate_teacher(&self, teacher_id: TeacherId, center_id: CenterId) {
        let pattern = format!("expand:teacher:{}:center:{}:*", teacher_id, center_id);
        self.delete_pattern(&pattern).await;
        info!(
            teacher_id = teacher_id,
            center_id = center_id,
            "Invalidated teacher expansions"
        );
    }

    /// Center-wide invalidation plus the listed teachers
    pub async fn invalidate(&self, center_id: CenterId, teachers: &[TeacherId]) {
        self.invalidate_center(center_id).await;
        for teacher_id in teachers {
            self.invalidate_teacher(*teacher_id, center_id).await;
        }
    }

    async fn delete_pattern(&self, pattern: &str) {
        match self
            .cache
            .delete_by_pattern(SCHEDULE_CATEGORY, pattern, self.config.scan_cap)
            .await
        {
            Ok(outcome) if outcome.truncated => warn!(
                pattern = %pattern,
                deleted = outcome.deleted,
                cap = self.config.scan_cap,
                "Invalidation stopped at scan cap; remaining keys expire by TTL"
            ),
            Ok(outcome) => debug!(pattern = %pattern, deleted = outcome.deleted, "Pattern invalidated"),
            Err(e) => warn!(pattern = %pattern, error = %e, "Cache invalidation failed"),
        }
    }
}

#[cfg(test)]
mod tests;
