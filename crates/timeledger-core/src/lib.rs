//! TimeLedger Core - Recurring Schedule Engine
//!
//! This crate holds the scheduling logic for multi-tenant teaching centers,
//! including:
//! - Rules: weekly recurring sessions with effective date ranges and phases
//! - Validation: hard overlap and buffer checks for teachers and rooms
//! - Exceptions: per-occurrence cancel, reschedule and substitute workflow
//! - Expansion: rules, holidays and exceptions turned into concrete sessions
//! - Recurrence: single, future and whole-series edits
//! - Cache: expansion caching with pattern invalidation
//! - Jobs: exception expiry, session reminders and read-marker cleanup
//! - Memory: in-memory repositories for tests and single-process use

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod calendar;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod exceptions;
pub mod expansion;
pub mod holiday;
pub mod identity_lock;
pub mod jobs;
pub mod memory;
pub mod models;
pub mod recurrence;
pub mod repository;
pub mod rule_lock;
pub mod rules;
pub mod service;
pub mod shutdown;
pub mod utils;
pub mod validation;

#[cfg(test)]
mod testing;

pub use cache::{CategoryCache, ExpansionCache, ExpansionCacheConfig};
pub use calendar::{
    Calendar, Clock, ClockTime, EffectiveRange, FixedClock, SharedClock, SystemClock,
    DEFAULT_TIMEZONE,
};
pub use config::CoreConfig;
pub use dispatch::{
    DispatchConfig, Notification, NotificationDispatcher, NotificationSink, TracingSink,
};
pub use error::{format_error_for_cli, Error, ErrorKind, Result, UserFriendlyError};
pub use exceptions::{ExceptionService, ExpireReport, ReviewDecision};
pub use expansion::{
    ExpandedSchedule, ExpansionEngine, ExpansionQuery, SessionStatus, MAX_EXPANSION_DAYS,
};
pub use holiday::{BulkHolidayReport, HolidayEntry, HolidayService};
pub use identity_lock::{IdentityLock, IdentityLockConfig, IdentityRegistrar};
pub use jobs::{
    AlertSink, CleanupReadsJob, ExpireExceptionsJob, Job, JobScheduler, JobSchedulerBuilder,
    JobSchedulerConfig, JobTrigger, ReminderSweepJob, TracingAlertSink, WebhookAlertSink,
};
pub use memory::{InMemoryCache, InMemoryLockStore, InMemoryRepository};
pub use models::{
    Actor, Center, CenterHoliday, CenterMembership, CenterSettings, Course, ExceptionDraft,
    ExceptionStatus, ExceptionType, MembershipRole, MembershipStatus, Offering, PersonalEvent,
    Requester, Room, RuleDraft, ScheduleException, ScheduleRule, Teacher, Term,
};
pub use recurrence::{
    DeleteOutcome, DeleteRequest, EditMode, EditOutcome, EditPreview, EditRequest,
    RecurrenceEditor,
};
pub use repository::{CacheStore, LockStore, Repositories};
pub use rule_lock::{LockStatus, RuleLock};
pub use rules::{PhaseTransition, RulePatch, RuleStore};
pub use service::{CopyReport, ScheduleService, TeacherScheduleItem};
pub use shutdown::{ShutdownController, ShutdownPhase};
pub use validation::{Conflict, ConflictKind, ConflictValidator, ValidationResult};
