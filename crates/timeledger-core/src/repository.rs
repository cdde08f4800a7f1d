//! Persistence and cache abstractions consumed by the engine
//!
//! The core never talks to a database or cache client directly. Adapters
//! implement these traits (`timeledger-store` for SQLite/Redis, [`crate::memory`]
//! for tests and single-process deployments).
//!
//! Writes to rules and exceptions use the `updated_at` value the caller read
//! as a compare-and-set token; a mismatch surfaces as
//! [`Error::ConcurrentModified`](crate::Error::ConcurrentModified).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::error::Result;
use crate::models::{
    Center, CenterHoliday, CenterId, CenterMembership, Course, CourseId, ExceptionId,
    ExceptionStatus, HolidayId, MembershipStatus, NewException, NewTeacher, Offering, OfferingId,
    PersonalEvent, ReadMarker, Room, RoomId, RuleDraft, RuleId, ScheduleException, ScheduleRule,
    StatusChange, Teacher, TeacherId, Term, TermId,
};

/// Recurrence rule persistence
#[async_trait]
pub trait RuleRepository: Send + Sync {
    /// Persist a validated draft
    async fn create(&self, draft: RuleDraft) -> Result<ScheduleRule>;

    /// Rule by id within a center (active or not)
    async fn get_by_id(&self, center_id: CenterId, id: RuleId) -> Result<ScheduleRule>;

    /// Replace a rule's mutable fields. `rule.updated_at` must equal the stored
    /// token; the returned rule carries the new token.
    async fn update(&self, rule: &ScheduleRule) -> Result<ScheduleRule>;

    /// Active rules of a center
    async fn list_by_center(&self, center_id: CenterId) -> Result<Vec<ScheduleRule>>;

    /// Active rules of a teacher within a center
    async fn list_by_teacher_and_center(
        &self,
        teacher_id: TeacherId,
        center_id: CenterId,
    ) -> Result<Vec<ScheduleRule>>;

    /// Active rules whose effective range intersects `[start, end]`
    async fn list_intersecting(
        &self,
        center_id: CenterId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<ScheduleRule>>;

    /// Active rules of an offering
    async fn list_by_offering(
        &self,
        center_id: CenterId,
        offering_id: OfferingId,
    ) -> Result<Vec<ScheduleRule>>;

    /// Flip the active flag (compare-and-set on `expected_updated_at`)
    async fn set_active(
        &self,
        center_id: CenterId,
        id: RuleId,
        active: bool,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<ScheduleRule>;

    /// Split a series at `split.anchor` as one unit: store `split.original`
    /// (compare-and-set on its `updated_at`), insert the successor and re-key
    /// the original's PENDING and APPROVED exceptions dated on or after the
    /// anchor. On any error nothing is written.
    async fn split(&self, split: RuleSplit) -> Result<SplitResult>;
}

/// Series split handed to [`RuleRepository::split`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSplit {
    /// Original rule as it must read afterwards, truncated or deactivated.
    /// Its `updated_at` is the token read by the caller.
    pub original: ScheduleRule,
    /// Rule taking over from the anchor
    pub successor: RuleDraft,
    /// First date owned by the successor
    pub anchor: NaiveDate,
}

/// Rows written by a split
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitResult {
    /// Original as stored
    pub original: ScheduleRule,
    /// Successor as stored
    pub successor: ScheduleRule,
    /// Exceptions moved to the successor, ascending
    pub migrated: Vec<ExceptionId>,
}

/// Exception persistence
#[async_trait]
pub trait ExceptionRepository: Send + Sync {
    /// Insert an exception. Fails with `ConcurrentModified` when a PENDING or
    /// APPROVED exception already exists for the same rule and date.
    async fn create(&self, exception: NewException) -> Result<ScheduleException>;

    /// Exception by id within a center
    async fn get_by_id(&self, center_id: CenterId, id: ExceptionId) -> Result<ScheduleException>;

    /// The PENDING or APPROVED exception for a rule occurrence, if any
    async fn get_by_rule_and_date(
        &self,
        rule_id: RuleId,
        date: NaiveDate,
    ) -> Result<Option<ScheduleException>>;

    /// All exceptions (any status) of the given rules dated within `[start, end]`
    async fn list_by_rules_in_range(
        &self,
        rule_ids: &[RuleId],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<ScheduleException>>;

    /// Exceptions in a status, optionally restricted to one center
    async fn list_by_status(
        &self,
        center_id: Option<CenterId>,
        status: ExceptionStatus,
    ) -> Result<Vec<ScheduleException>>;

    /// Apply a status change (compare-and-set on `expected_updated_at`)
    async fn update_status(
        &self,
        id: ExceptionId,
        expected_updated_at: DateTime<Utc>,
        change: StatusChange,
    ) -> Result<ScheduleException>;

    /// Replace mutable fields including `rule_id` (compare-and-set on
    /// `exception.updated_at`)
    async fn update_fields(&self, exception: &ScheduleException) -> Result<ScheduleException>;
}

/// Result of an idempotent holiday write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HolidayUpsert {
    /// Stored row
    pub holiday: CenterHoliday,
    /// Whether the row was newly inserted
    pub created: bool,
}

/// Holiday persistence
#[async_trait]
pub trait HolidayRepository: Send + Sync {
    /// Holidays of a center dated within `[start, end]`, ascending
    async fn list_by_center_in_range(
        &self,
        center_id: CenterId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<CenterHoliday>>;

    /// Insert or rename the holiday on a date
    async fn upsert(&self, center_id: CenterId, date: NaiveDate, name: &str) -> Result<HolidayUpsert>;

    /// Holiday by id, any center
    async fn get_by_id(&self, id: HolidayId) -> Result<CenterHoliday>;

    /// Remove a holiday
    async fn delete(&self, id: HolidayId) -> Result<()>;
}

/// Teacher ↔ center memberships
#[async_trait]
pub trait MembershipRepository: Send + Sync {
    /// Active memberships of a teacher across centers
    async fn get_active_by_teacher(&self, teacher_id: TeacherId) -> Result<Vec<CenterMembership>>;

    /// Membership of a teacher in a center, any status
    async fn get_by_center_and_teacher(
        &self,
        center_id: CenterId,
        teacher_id: TeacherId,
    ) -> Result<Option<CenterMembership>>;

    /// Create or update a membership
    async fn save(&self, membership: CenterMembership) -> Result<CenterMembership>;

    /// Change a membership's status
    async fn set_status(
        &self,
        center_id: CenterId,
        teacher_id: TeacherId,
        status: MembershipStatus,
    ) -> Result<CenterMembership>;
}

/// Centers, catalog and people
#[async_trait]
pub trait CatalogRepository: Send + Sync {
    /// Center by id
    async fn get_center(&self, id: CenterId) -> Result<Center>;
    /// All centers
    async fn list_centers(&self) -> Result<Vec<Center>>;
    /// Insert a center
    async fn create_center(&self, center: Center) -> Result<Center>;

    /// Course by id within a center
    async fn get_course(&self, center_id: CenterId, id: CourseId) -> Result<Course>;
    /// Insert a course
    async fn create_course(&self, course: Course) -> Result<Course>;

    /// Offering by id within a center
    async fn get_offering(&self, center_id: CenterId, id: OfferingId) -> Result<Offering>;
    /// Insert an offering
    async fn create_offering(&self, offering: Offering) -> Result<Offering>;

    /// Room by id within a center
    async fn get_room(&self, center_id: CenterId, id: RoomId) -> Result<Room>;
    /// Insert a room
    async fn create_room(&self, room: Room) -> Result<Room>;

    /// Term by id within a center
    async fn get_term(&self, center_id: CenterId, id: TermId) -> Result<Term>;
    /// Insert a term
    async fn create_term(&self, term: Term) -> Result<Term>;

    /// Teacher by id
    async fn get_teacher(&self, id: TeacherId) -> Result<Teacher>;
    /// Teacher bound to an external identity handle
    async fn find_teacher_by_identity(&self, handle: &str) -> Result<Option<Teacher>>;
    /// Insert a teacher
    async fn create_teacher(&self, teacher: NewTeacher) -> Result<Teacher>;
}

/// Teacher-owned blocking events
#[async_trait]
pub trait PersonalEventRepository: Send + Sync {
    /// Events of a teacher touching local dates `[start, end]`
    async fn list_by_teacher_in_range(
        &self,
        teacher_id: TeacherId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PersonalEvent>>;

    /// Insert an event
    async fn create(&self, event: PersonalEvent) -> Result<PersonalEvent>;
}

/// Notification read markers
#[async_trait]
pub trait ReadMarkerRepository: Send + Sync {
    /// Record that a teacher has seen an item
    async fn mark_read(&self, teacher_id: TeacherId, item_key: &str, at: DateTime<Utc>)
        -> Result<ReadMarker>;

    /// Delete markers read before `cutoff`; returns the number removed
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Outcome of a bounded pattern delete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PatternDeletion {
    /// Keys visited
    pub scanned: usize,
    /// Keys removed
    pub deleted: usize,
    /// Whether the scan stopped at the cap with keys possibly left behind
    pub truncated: bool,
}

/// Raw key/value cache (Redis in production)
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Value of a key
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value with expiry
    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// Remove a key
    async fn delete(&self, key: &str) -> Result<()>;

    /// Remove keys matching a glob (`*` wildcard), visiting at most `cap` keys.
    /// Not atomic across the pattern.
    async fn delete_by_pattern(&self, pattern: &str, cap: usize) -> Result<PatternDeletion>;
}

/// Cross-process lock primitive
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Atomically set `key` if absent, expiring after `ttl`. Returns whether
    /// the key was set.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Remove `key` only while it still holds `value`. Returns whether the
    /// key was removed.
    async fn release(&self, key: &str, value: &str) -> Result<bool>;
}

/// Repository handles composed at the entrypoint
#[derive(Clone)]
pub struct Repositories {
    /// Rules
    pub rules: Arc<dyn RuleRepository>,
    /// Exceptions
    pub exceptions: Arc<dyn ExceptionRepository>,
    /// Holidays
    pub holidays: Arc<dyn HolidayRepository>,
    /// Memberships
    pub memberships: Arc<dyn MembershipRepository>,
    /// Catalog
    pub catalog: Arc<dyn CatalogRepository>,
    /// Personal events
    pub personal_events: Arc<dyn PersonalEventRepository>,
    /// Read markers
    pub read_markers: Arc<dyn ReadMarkerRepository>,
}

impl Repositories {
    /// Every handle served by one adapter implementing all traits
    pub fn from_single<R>(repo: Arc<R>) -> Self
    where
        R: RuleRepository
            + ExceptionRepository
            + HolidayRepository
            + MembershipRepository
            + CatalogRepository
            + PersonalEventRepository
            + ReadMarkerRepository
            + 'static,
    {
        Self {
            rules: repo.clone(),
            exceptions: repo.clone(),
            holidays: repo.clone(),
            memberships: repo.clone(),
            catalog: repo.clone(),
            personal_events: repo.clone(),
            read_markers: repo,
        }
    }
}
