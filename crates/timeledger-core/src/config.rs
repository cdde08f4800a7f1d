//! Core configuration
//!
//! Every field has a default, so an empty document is a valid config.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::ExpansionCacheConfig;
use crate::calendar::{Calendar, DEFAULT_TIMEZONE};
use crate::dispatch::DispatchConfig;
use crate::error::{Error, Result};
use crate::identity_lock::IdentityLockConfig;
use crate::jobs::JobSchedulerConfig;

/// Settings recognised by the core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// IANA zone for all date and time handling
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Expansion cache
    #[serde(default)]
    pub cache: CacheSettings,

    /// Identity-creation lock
    #[serde(default)]
    pub lock: LockSettings,

    /// Background jobs
    #[serde(default)]
    pub scheduler: SchedulerSettings,

    /// Center policy defaults
    #[serde(default)]
    pub center: CenterDefaults,

    /// Notification dispatch
    #[serde(default)]
    pub dispatch: DispatchSettings,
}

fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            cache: CacheSettings::default(),
            lock: LockSettings::default(),
            scheduler: SchedulerSettings::default(),
            center: CenterDefaults::default(),
            dispatch: DispatchSettings::default(),
        }
    }
}

impl CoreConfig {
    /// Reject values the core cannot run with
    pub fn validate(&self) -> Result<()> {
        Calendar::from_name(&self.timezone)?;
        if self.scheduler.reminder_hour > 23 {
            return Err(Error::validation(format!(
                "scheduler.reminder_hour must be 0..=23, got {}",
                self.scheduler.reminder_hour
            )));
        }
        if self.cache.ttl_expand_min == 0 {
            return Err(Error::validation("cache.ttl_expand_min must be positive"));
        }
        if self.dispatch.workers == 0 || self.dispatch.queue_capacity == 0 {
            return Err(Error::validation(
                "dispatch.workers and dispatch.queue_capacity must be positive",
            ));
        }
        if self.scheduler.expire_interval_min == 0 || self.scheduler.cleanup_interval_hours == 0 {
            return Err(Error::validation("scheduler intervals must be positive"));
        }
        Ok(())
    }

    /// The deployment calendar
    pub fn calendar(&self) -> Result<Calendar> {
        Calendar::from_name(&self.timezone)
    }

    /// Expansion cache settings
    #[must_use]
    pub fn expansion_cache(&self) -> ExpansionCacheConfig {
        ExpansionCacheConfig {
            ttl: Duration::from_secs(self.cache.ttl_expand_min * 60),
            writeback_timeout: Duration::from_secs(self.cache.writeback_timeout_secs),
            scan_cap: self.cache.pattern_scan_cap,
        }
    }

    /// Identity lock settings
    #[must_use]
    pub fn identity_lock(&self) -> IdentityLockConfig {
        IdentityLockConfig {
            ttl: Duration::from_secs(self.lock.identity_ttl_sec),
            max_retries: self.lock.identity_max_retries,
            backoff_step: Duration::from_millis(self.lock.backoff_step_ms),
        }
    }

    /// Dispatcher settings
    #[must_use]
    pub fn dispatch(&self) -> DispatchConfig {
        DispatchConfig {
            workers: self.dispatch.workers,
            queue_capacity: self.dispatch.queue_capacity,
            task_timeout: Duration::from_secs(self.dispatch.task_timeout_secs),
        }
    }

    /// Job scheduler settings
    #[must_use]
    pub fn job_scheduler(&self) -> JobSchedulerConfig {
        JobSchedulerConfig {
            shutdown_timeout: self.scheduler.shutdown_timeout(),
            ..JobSchedulerConfig::default()
        }
    }
}

/// Expansion cache settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Entry lifetime in minutes
    #[serde(default = "default_ttl_expand_min")]
    pub ttl_expand_min: u64,

    /// Bound on the detached write-back
    #[serde(default = "default_writeback_timeout_secs")]
    pub writeback_timeout_secs: u64,

    /// Max keys visited per pattern invalidation
    #[serde(default = "default_pattern_scan_cap")]
    pub pattern_scan_cap: usize,

    /// Prefix in front of every cache key
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

fn default_ttl_expand_min() -> u64 {
    10
}

fn default_writeback_timeout_secs() -> u64 {
    5
}

fn default_pattern_scan_cap() -> usize {
    10_000
}

fn default_namespace() -> String {
    "timeledger".to_string()
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_expand_min: default_ttl_expand_min(),
            writeback_timeout_secs: default_writeback_timeout_secs(),
            pattern_scan_cap: default_pattern_scan_cap(),
            namespace: default_namespace(),
        }
    }
}

/// Identity lock settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSettings {
    /// Key expiry in seconds
    #[serde(default = "default_identity_ttl_sec")]
    pub identity_ttl_sec: u64,

    /// Retries after the first attempt
    #[serde(default = "default_identity_max_retries")]
    pub identity_max_retries: u32,

    /// Linear backoff unit in milliseconds
    #[serde(default = "default_backoff_step_ms")]
    pub backoff_step_ms: u64,
}

fn default_identity_ttl_sec() -> u64 {
    10
}

fn default_identity_max_retries() -> u32 {
    3
}

fn default_backoff_step_ms() -> u64 {
    100
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            identity_ttl_sec: default_identity_ttl_sec(),
            identity_max_retries: default_identity_max_retries(),
            backoff_step_ms: default_backoff_step_ms(),
        }
    }
}

/// Background job settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Center-local hour of the reminder sweep
    #[serde(default = "default_reminder_hour")]
    pub reminder_hour: u16,

    /// Minutes between expiry sweeps
    #[serde(default = "default_expire_interval_min")]
    pub expire_interval_min: u64,

    /// Hours between read-marker cleanups
    #[serde(default = "default_cleanup_interval_hours")]
    pub cleanup_interval_hours: u64,

    /// Read markers older than this are purged
    #[serde(default = "default_read_retention_days")]
    pub read_retention_days: i64,

    /// Wait for in-flight jobs on shutdown
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_reminder_hour() -> u16 {
    18
}

fn default_expire_interval_min() -> u64 {
    15
}

fn default_cleanup_interval_hours() -> u64 {
    24
}

fn default_read_retention_days() -> i64 {
    90
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            reminder_hour: default_reminder_hour(),
            expire_interval_min: default_expire_interval_min(),
            cleanup_interval_hours: default_cleanup_interval_hours(),
            read_retention_days: default_read_retention_days(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl SchedulerSettings {
    /// Period of the expiry job
    #[must_use]
    pub fn expire_interval(&self) -> Duration {
        Duration::from_secs(self.expire_interval_min * 60)
    }

    /// Period of the cleanup job
    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_hours * 3600)
    }

    /// Drain timeout
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Fallbacks for centers without their own policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CenterDefaults {
    /// Lead days used when a center's own setting is not positive
    #[serde(default = "default_exception_lead_days")]
    pub exception_lead_days: i64,
}

fn default_exception_lead_days() -> i64 {
    14
}

impl Default for CenterDefaults {
    fn default() -> Self {
        Self {
            exception_lead_days: default_exception_lead_days(),
        }
    }
}

/// Notification dispatch settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchSettings {
    /// Concurrent deliveries
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Queued notifications before new ones are dropped
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Per-delivery deadline in seconds
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    256
}

fn default_task_timeout_secs() -> u64 {
    10
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            task_timeout_secs: default_task_timeout_secs(),
        }
    }
}
