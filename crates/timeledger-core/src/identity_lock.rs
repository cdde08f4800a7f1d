//! Single-flight creation of identities keyed by an external handle
//!
//! The lock is a key `identity:lock:{handle}` set with set-if-absent and a
//! short expiry, holding a per-acquisition token. A held key is retried with
//! linear backoff. When the lock
//! store itself fails the lock degrades to a no-op with a warning, so
//! registration stays available while the store is down.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{NewTeacher, Teacher};
use crate::repository::{CatalogRepository, LockStore};
use crate::utils::{retry_with_backoff, RetryConfig};

/// Lock settings
#[derive(Debug, Clone, Copy)]
pub struct IdentityLockConfig {
    /// Key expiry
    pub ttl: Duration,
    /// Extra attempts after the first
    pub max_retries: u32,
    /// Backoff unit; attempt `n` waits `n × step`
    pub backoff_step: Duration,
}

impl Default for IdentityLockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            max_retries: 3,
            backoff_step: Duration::from_millis(100),
        }
    }
}

/// Lock store key for a handle
#[must_use]
pub fn lock_key(handle: &str) -> String {
    format!("identity:lock:{}", handle)
}

#[derive(Debug)]
enum Attempt {
    Held,
    Store(Error),
}

/// Cross-process lock on identity creation
#[derive(Clone)]
pub struct IdentityLock {
    store: Arc<dyn LockStore>,
    config: IdentityLockConfig,
}

impl IdentityLock {
    /// Lock over a store
    pub fn new(store: Arc<dyn LockStore>, config: IdentityLockConfig) -> Self {
        Self { store, config }
    }

    /// Take the lock for `handle`. Contention that outlasts the retries is
    /// `ConcurrentModified`; a failing store yields an unheld guard.
    pub async fn acquire(&self, handle: &str) -> Result<IdentityLockGuard> {
        let key = lock_key(handle);
        let token = Uuid::new_v4().to_string();
        let retry = RetryConfig::linear(self.config.max_retries + 1, self.config.backoff_step);

        let (store, key_ref, token_ref, ttl) =
            (&self.store, key.as_str(), token.as_str(), self.config.ttl);
        let outcome = retry_with_backoff(
            &retry,
            move || async move {
                match store.set_nx(key_ref, token_ref, ttl).await {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(Attempt::Held),
                    Err(e) => Err(Attempt::Store(e)),
                }
            },
            |e| matches!(e, Attempt::Held),
        )
        .await;

        match outcome {
            Ok(()) => {
                debug!(key = %key, "Identity lock acquired");
                Ok(IdentityLockGuard {
                    store: Some(self.store.clone()),
                    key,
                    token,
                })
            }
            Err(failure) => match failure.last_error {
                Attempt::Held => {
                    warn!(key = %key, attempts = failure.attempts, "Identity lock still held");
                    Err(Error::concurrent("identity", handle))
                }
                Attempt::Store(e) => {
                    warn!(key = %key, error = %e, "Lock store unavailable, continuing without lock");
                    Ok(IdentityLockGuard {
                        store: None,
                        key,
                        token,
                    })
                }
            },
        }
    }
}

/// Held (or best-effort) identity lock. Release explicitly; a dropped guard
/// releases in the background. Release only removes the key while it still
/// carries this guard's token.
pub struct IdentityLockGuard {
    store: Option<Arc<dyn LockStore>>,
    key: String,
    token: String,
}

async fn release_key(store: &dyn LockStore, key: &str, token: &str) {
    match store.release(key, token).await {
        Ok(true) => debug!(key = %key, "Identity lock released"),
        Ok(false) => warn!(key = %key, "Identity lock expired before release"),
        Err(e) => warn!(key = %key, error = %e, "Identity lock release failed; key expires by TTL"),
    }
}

impl IdentityLockGuard {
    /// Whether the lock store granted the lock
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.store.is_some()
    }

    /// Delete the key if this guard still owns it
    pub async fn release(mut self) {
        if let Some(store) = self.store.take() {
            release_key(store.as_ref(), &self.key, &self.token).await;
        }
    }
}

impl Drop for IdentityLockGuard {
    fn drop(&mut self) {
        let Some(store) = self.store.take() else {
            return;
        };
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { release_key(store.as_ref(), &key, &token).await });
        }
    }
}

/// Result of a registration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistrationOutcome {
    /// Teacher bound to the handle
    pub teacher: Teacher,
    /// Whether this call created it
    pub created: bool,
}

/// First-time registration of teachers by external identity
#[derive(Clone)]
pub struct IdentityRegistrar {
    catalog: Arc<dyn CatalogRepository>,
    lock: IdentityLock,
}

impl IdentityRegistrar {
    /// Registrar over the catalog and a lock
    pub fn new(catalog: Arc<dyn CatalogRepository>, lock: IdentityLock) -> Self {
        Self { catalog, lock }
    }

    /// Return the teacher bound to `handle`, creating it from `profile` if
    /// none exists yet
    pub async fn register(&self, handle: &str, profile: NewTeacher) -> Result<RegistrationOutcome> {
        let handle = handle.trim();
        if handle.is_empty() {
            return Err(Error::validation("identity handle is required"));
        }
        if profile.name.trim().is_empty() {
            return Err(Error::validation("teacher name is required"));
        }
        if let Some(teacher) = self.catalog.find_teacher_by_identity(handle).await? {
            return Ok(RegistrationOutcome {
                teacher,
                created: false,
            });
        }

        let guard = self.lock.acquire(handle).await?;
        let result = self.create_once(handle, profile).await;
        guard.release().await;
        let outcome = result?;
        if outcome.created {
            info!(teacher_id = outcome.teacher.id, "Teacher registered from identity");
        }
        Ok(outcome)
    }

    async fn create_once(&self, handle: &str, profile: NewTeacher) -> Result<RegistrationOutcome> {
        // Another process may have finished while we waited for the lock
        if let Some(teacher) = self.catalog.find_teacher_by_identity(handle).await? {
            return Ok(RegistrationOutcome {
                teacher,
                created: false,
            });
        }
        let teacher = self
            .catalog
            .create_teacher(NewTeacher {
                identity_handle: Some(handle.to_string()),
                ..profile
            })
            .await?;
        Ok(RegistrationOutcome {
            teacher,
            created: true,
        })
    }
}

#[cfg(test)]
mod tests;
