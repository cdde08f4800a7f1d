use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use regex::Regex;
use tracing::warn;

use crate::error::{Error, Result};
use crate::repository::{CacheStore, LockStore, PatternDeletion};

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Translate a `*` glob into an anchored regex
pub(crate) fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let escaped = regex::escape(pattern).replace(r"\*", ".*");
    Regex::new(&format!("^{}$", escaped))
        .map_err(|e| Error::system_with(format!("invalid cache pattern '{}'", pattern), e))
}

/// Process-local TTL cache
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: DashMap<String, CacheEntry>,
}

impl InMemoryCache {
    /// Empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.is_live(now)).count()
    }

    /// Whether no live keys remain
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live keys, sorted
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.is_live(now))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl CacheStore for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let hit = self
            .entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone());
        if hit.is_none() {
            self.entries.remove_if(key, |_, e| !e.is_live(now));
        }
        Ok(hit)
    }

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn delete_by_pattern(&self, pattern: &str, cap: usize) -> Result<PatternDeletion> {
        let matcher = glob_to_regex(pattern)?;
        let mut outcome = PatternDeletion::default();
        let mut doomed = Vec::new();
        for entry in self.entries.iter() {
            if outcome.scanned >= cap {
                outcome.truncated = true;
                break;
            }
            outcome.scanned += 1;
            if matcher.is_match(entry.key()) {
                doomed.push(entry.key().clone());
            }
        }
        for key in doomed {
            if self.entries.remove(&key).is_some() {
                outcome.deleted += 1;
            }
        }
        if outcome.truncated {
            warn!(pattern = %pattern, cap = cap, "Pattern delete hit scan cap");
        }
        Ok(outcome)
    }
}

/// Process-local set-if-absent lock table
#[derive(Debug, Default)]
pub struct InMemoryLockStore {
    locks: DashMap<String, CacheEntry>,
}

impl InMemoryLockStore {
    /// Empty lock table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a live lock holds `key`
    #[must_use]
    pub fn is_held(&self, key: &str) -> bool {
        let now = Instant::now();
        self.locks.get(key).map_or(false, |e| e.is_live(now))
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let fresh = CacheEntry {
            value: value.to_string(),
            expires_at: now + ttl,
        };
        match self.locks.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    Ok(false)
                } else {
                    occupied.insert(fresh);
                    Ok(true)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str, value: &str) -> Result<bool> {
        Ok(self.locks.remove_if(key, |_, e| e.value == value).is_some())
    }
}
