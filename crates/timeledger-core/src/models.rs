//! Domain model
//!
//! Identifiers are opaque positive integers. Every row is owned by exactly
//! one center; the center id is the tenancy boundary on every read path.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::calendar::{crosses_midnight, duration_minutes, weekday_of, ClockTime, EffectiveRange};
use crate::error::{Error, Result};

/// Center id
pub type CenterId = i64;
/// Teacher id
pub type TeacherId = i64;
/// Room id
pub type RoomId = i64;
/// Course id
pub type CourseId = i64;
/// Offering id
pub type OfferingId = i64;
/// Term id
pub type TermId = i64;
/// Schedule rule id
pub type RuleId = i64;
/// Schedule exception id
pub type ExceptionId = i64;
/// Holiday id
pub type HolidayId = i64;
/// Center admin id
pub type AdminId = i64;

/// Per-center policy settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CenterSettings {
    /// Opening time
    pub opening_time: ClockTime,
    /// Closing time
    pub closing_time: ClockTime,
    /// Default course length in minutes
    pub default_course_duration: u32,
    /// Days before a session during which exceptions are still accepted;
    /// zero or negative falls back to the deployment default
    pub exception_lead_days: i64,
    /// Whether teachers may self-register with the center
    pub allow_public_registration: bool,
}

impl Default for CenterSettings {
    fn default() -> Self {
        Self {
            opening_time: ClockTime::from_hm(8, 0).unwrap_or(ClockTime::MIDNIGHT),
            closing_time: ClockTime::from_hm(22, 0).unwrap_or(ClockTime::END_OF_DAY),
            default_course_duration: 60,
            exception_lead_days: 0,
            allow_public_registration: false,
        }
    }
}

/// Administrative tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Center {
    /// Id
    pub id: CenterId,
    /// Display name
    pub name: String,
    /// Policy settings
    pub settings: CenterSettings,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Schedulable person
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Teacher {
    /// Id
    pub id: TeacherId,
    /// Display name
    pub name: String,
    /// External identity handle (messaging account, SSO subject)
    pub identity_handle: Option<String>,
    /// Contact email
    pub email: Option<String>,
    /// Contact phone
    pub phone: Option<String>,
    /// Visible to centers looking for teachers
    pub open_to_hiring: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Fields for registering a teacher
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewTeacher {
    /// Display name
    pub name: String,
    /// External identity handle
    pub identity_handle: Option<String>,
    /// Contact email
    pub email: Option<String>,
    /// Contact phone
    pub phone: Option<String>,
    /// Hiring visibility
    pub open_to_hiring: bool,
}

/// Schedulable room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    /// Id
    pub id: RoomId,
    /// Owning center
    pub center_id: CenterId,
    /// Display name
    pub name: String,
    /// Seats
    pub capacity: u32,
}

/// Catalog item; its buffers are defaults for offerings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Course {
    /// Id
    pub id: CourseId,
    /// Owning center
    pub center_id: CenterId,
    /// Display name
    pub name: String,
    /// Default length in minutes
    pub default_duration: u32,
    /// Display color, `#RRGGBB`
    pub color_hex: String,
    /// Minimum gap before/after a session for the same teacher
    pub teacher_buffer_min: u32,
    /// Minimum gap before/after a session in the same room
    pub room_buffer_min: u32,
}

/// A course offered in a center
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offering {
    /// Id
    pub id: OfferingId,
    /// Owning center
    pub center_id: CenterId,
    /// Course
    pub course_id: CourseId,
    /// Display name
    pub name: String,
    /// Default room
    pub default_room_id: Option<RoomId>,
    /// Default teacher
    pub default_teacher_id: Option<TeacherId>,
    /// Whether schedulers may bypass buffer conflicts for this offering
    pub allow_buffer_override: bool,
    /// Teacher buffer, falls back to the course
    pub teacher_buffer_min: Option<u32>,
    /// Room buffer, falls back to the course
    pub room_buffer_min: Option<u32>,
}

/// Buffer requirements resolved for one offering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BufferPolicy {
    /// Required teacher gap in minutes
    pub teacher_min: u32,
    /// Required room gap in minutes
    pub room_min: u32,
    /// Whether buffer conflicts may be overridden
    pub allow_override: bool,
}

impl BufferPolicy {
    /// Offering values with course fallback
    #[must_use]
    pub fn resolve(offering: &Offering, course: &Course) -> Self {
        Self {
            teacher_min: offering
                .teacher_buffer_min
                .unwrap_or(course.teacher_buffer_min),
            room_min: offering.room_buffer_min.unwrap_or(course.room_buffer_min),
            allow_override: offering.allow_buffer_override,
        }
    }
}

/// Named date interval used as a copy source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Term {
    /// Id
    pub id: TermId,
    /// Owning center
    pub center_id: CenterId,
    /// Display name
    pub name: String,
    /// First day
    pub start_date: NaiveDate,
    /// Last day
    pub end_date: NaiveDate,
}

/// Role of a teacher inside a center
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MembershipRole {
    /// Regular teacher
    Teacher,
    /// Substitute pool
    Substitute,
}

/// Membership state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MembershipStatus {
    /// Active
    Active,
    /// Suspended or left
    Inactive,
}

/// Teacher ↔ center relation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CenterMembership {
    /// Id
    pub id: i64,
    /// Center
    pub center_id: CenterId,
    /// Teacher
    pub teacher_id: TeacherId,
    /// Role
    pub role: MembershipRole,
    /// Status
    pub status: MembershipStatus,
}

impl CenterMembership {
    /// Whether the membership currently surfaces the teacher's rules
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == MembershipStatus::Active
    }
}

/// Weekly recurrence rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRule {
    /// Id
    pub id: RuleId,
    /// Owning center
    pub center_id: CenterId,
    /// Offering taught
    pub offering_id: OfferingId,
    /// Teacher, `None` = unassigned
    pub teacher_id: Option<TeacherId>,
    /// Room
    pub room_id: RoomId,
    /// Display name
    pub name: String,
    /// ISO weekday 1..=7
    pub weekday: u8,
    /// Start time
    pub start_time: ClockTime,
    /// End time; at or before start means the session crosses midnight
    pub end_time: ClockTime,
    /// Length in minutes
    pub duration_minutes: u32,
    /// Inclusive validity window
    pub effective_range: EffectiveRange,
    /// Hard edit deadline independent of lead days
    pub lock_at: Option<DateTime<Utc>>,
    /// Soft-delete flag
    pub is_active: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Optimistic concurrency token
    pub updated_at: DateTime<Utc>,
}

impl ScheduleRule {
    /// Whether the session runs past midnight
    #[must_use]
    pub fn crosses_midnight(&self) -> bool {
        crosses_midnight(self.start_time, self.end_time)
    }

    /// Whether the rule produces a session on `date`
    #[must_use]
    pub fn occurs_on(&self, date: NaiveDate) -> bool {
        self.is_active && weekday_of(date) == self.weekday && self.effective_range.contains(date)
    }
}

/// Fields for creating a rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDraft {
    /// Owning center
    pub center_id: CenterId,
    /// Offering
    pub offering_id: OfferingId,
    /// Teacher
    pub teacher_id: Option<TeacherId>,
    /// Room
    pub room_id: RoomId,
    /// Display name
    pub name: String,
    /// ISO weekday 1..=7
    pub weekday: u8,
    /// Start time
    pub start_time: ClockTime,
    /// End time
    pub end_time: ClockTime,
    /// Validity window
    pub effective_range: EffectiveRange,
    /// Hard edit deadline
    pub lock_at: Option<DateTime<Utc>>,
}

impl RuleDraft {
    /// Check the structural invariants of a rule
    pub fn validate(&self) -> Result<()> {
        validate_rule_shape(
            self.weekday,
            self.start_time,
            self.end_time,
            &self.effective_range,
        )?;
        if self.name.trim().is_empty() {
            return Err(Error::validation("rule name is required"));
        }
        Ok(())
    }

    /// Session length implied by the times
    #[must_use]
    pub fn duration_minutes(&self) -> u32 {
        duration_minutes(self.start_time, self.end_time)
    }

    /// Draft carrying over an existing rule's values
    #[must_use]
    pub fn from_rule(rule: &ScheduleRule) -> Self {
        Self {
            center_id: rule.center_id,
            offering_id: rule.offering_id,
            teacher_id: rule.teacher_id,
            room_id: rule.room_id,
            name: rule.name.clone(),
            weekday: rule.weekday,
            start_time: rule.start_time,
            end_time: rule.end_time,
            effective_range: rule.effective_range,
            lock_at: rule.lock_at,
        }
    }
}

/// Shared shape checks for drafts and patched rules
pub(crate) fn validate_rule_shape(
    weekday: u8,
    start_time: ClockTime,
    end_time: ClockTime,
    range: &EffectiveRange,
) -> Result<()> {
    if !(1..=7).contains(&weekday) {
        return Err(Error::validation(format!(
            "weekday must be 1..7, got {}",
            weekday
        )));
    }
    if start_time >= ClockTime::END_OF_DAY {
        return Err(Error::validation("start_time must be before 24:00"));
    }
    if !range.is_valid() {
        return Err(Error::validation(
            "effective_range end must not precede its start",
        ));
    }
    Ok(())
}

/// Per-occurrence override kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExceptionType {
    /// Session does not take place
    Cancel,
    /// Session moves to another time, room, or date
    Reschedule,
    /// Another teacher takes the session
    ReplaceTeacher,
}

impl ExceptionType {
    /// Wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cancel => "CANCEL",
            Self::Reschedule => "RESCHEDULE",
            Self::ReplaceTeacher => "REPLACE_TEACHER",
        }
    }
}

impl std::fmt::Display for ExceptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExceptionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CANCEL" => Ok(Self::Cancel),
            "RESCHEDULE" => Ok(Self::Reschedule),
            "REPLACE_TEACHER" => Ok(Self::ReplaceTeacher),
            other => Err(Error::validation(format!("unknown exception type: {}", other))),
        }
    }
}

/// Exception lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExceptionStatus {
    /// Awaiting review
    Pending,
    /// Accepted by an admin
    Approved,
    /// Declined by an admin
    Rejected,
    /// Withdrawn
    Revoked,
    /// Never reviewed before its date
    Expired,
}

impl ExceptionStatus {
    /// Wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::Revoked => "REVOKED",
            Self::Expired => "EXPIRED",
        }
    }

    /// Rejected, revoked and expired exceptions never change again
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Revoked | Self::Expired)
    }

    /// States that count towards the one-per-(rule, date) uniqueness
    #[must_use]
    pub fn is_blocking(self) -> bool {
        matches!(self, Self::Pending | Self::Approved)
    }
}

impl std::fmt::Display for ExceptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExceptionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "APPROVED" => Ok(Self::Approved),
            "REJECTED" => Ok(Self::Rejected),
            "REVOKED" => Ok(Self::Revoked),
            "EXPIRED" => Ok(Self::Expired),
            other => Err(Error::validation(format!(
                "unknown exception status: {}",
                other
            ))),
        }
    }
}

/// Who filed an exception
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Requester {
    /// Center admin
    Admin(AdminId),
    /// The affected teacher
    Teacher(TeacherId),
}

/// Per-date override of one rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleException {
    /// Id
    pub id: ExceptionId,
    /// Owning center
    pub center_id: CenterId,
    /// Rule being overridden
    pub rule_id: RuleId,
    /// Occurrence date of the rule
    pub original_date: NaiveDate,
    /// Kind of override
    pub exception_type: ExceptionType,
    /// Lifecycle state
    pub status: ExceptionStatus,
    /// New local start (reschedule)
    pub new_start_at: Option<NaiveDateTime>,
    /// New local end (reschedule)
    pub new_end_at: Option<NaiveDateTime>,
    /// New teacher (replace-teacher, optionally reschedule)
    pub new_teacher_id: Option<TeacherId>,
    /// New room (reschedule)
    pub new_room_id: Option<RoomId>,
    /// Free-text reason
    pub reason: String,
    /// Filer
    pub requested_by: Requester,
    /// Reviewing admin
    pub reviewed_by: Option<AdminId>,
    /// Review time
    pub reviewed_at: Option<DateTime<Utc>>,
    /// Review comment
    pub review_note: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Optimistic concurrency token
    pub updated_at: DateTime<Utc>,
}

impl ScheduleException {
    /// The requested fields of a stored exception
    #[must_use]
    pub fn to_draft(&self) -> ExceptionDraft {
        ExceptionDraft {
            rule_id: self.rule_id,
            original_date: self.original_date,
            exception_type: self.exception_type,
            new_start_at: self.new_start_at,
            new_end_at: self.new_end_at,
            new_teacher_id: self.new_teacher_id,
            new_room_id: self.new_room_id,
            reason: self.reason.clone(),
        }
    }
}

/// Fields describing a requested exception
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionDraft {
    /// Rule
    pub rule_id: RuleId,
    /// Occurrence date
    pub original_date: NaiveDate,
    /// Kind
    pub exception_type: ExceptionType,
    /// New start
    pub new_start_at: Option<NaiveDateTime>,
    /// New end
    pub new_end_at: Option<NaiveDateTime>,
    /// New teacher
    pub new_teacher_id: Option<TeacherId>,
    /// New room
    pub new_room_id: Option<RoomId>,
    /// Reason
    pub reason: String,
}

impl ExceptionDraft {
    /// Cancellation of one occurrence
    #[must_use]
    pub fn cancel(rule_id: RuleId, date: NaiveDate, reason: impl Into<String>) -> Self {
        Self {
            rule_id,
            original_date: date,
            exception_type: ExceptionType::Cancel,
            new_start_at: None,
            new_end_at: None,
            new_teacher_id: None,
            new_room_id: None,
            reason: reason.into(),
        }
    }

    /// Move one occurrence to a new local start and end
    #[must_use]
    pub fn reschedule(
        rule_id: RuleId,
        date: NaiveDate,
        new_start_at: NaiveDateTime,
        new_end_at: NaiveDateTime,
    ) -> Self {
        Self {
            exception_type: ExceptionType::Reschedule,
            new_start_at: Some(new_start_at),
            new_end_at: Some(new_end_at),
            ..Self::cancel(rule_id, date, "")
        }
    }

    /// Hand one occurrence to another teacher
    #[must_use]
    pub fn replace_teacher(rule_id: RuleId, date: NaiveDate, teacher_id: TeacherId) -> Self {
        Self {
            exception_type: ExceptionType::ReplaceTeacher,
            new_teacher_id: Some(teacher_id),
            ..Self::cancel(rule_id, date, "")
        }
    }

    /// Set the reason
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    /// Set the new room
    #[must_use]
    pub fn with_room(mut self, room_id: RoomId) -> Self {
        self.new_room_id = Some(room_id);
        self
    }

    /// Type-specific field checks
    pub fn validate(&self) -> Result<()> {
        match self.exception_type {
            ExceptionType::Cancel => Ok(()),
            ExceptionType::Reschedule => {
                let (start, end) = match (self.new_start_at, self.new_end_at) {
                    (Some(s), Some(e)) => (s, e),
                    _ => {
                        return Err(Error::validation(
                            "reschedule requires new_start_at and new_end_at",
                        ))
                    }
                };
                if end <= start {
                    return Err(Error::validation("new_end_at must be after new_start_at"));
                }
                if end - start > chrono::Duration::hours(24) {
                    return Err(Error::validation("a session cannot exceed 24 hours"));
                }
                Ok(())
            }
            ExceptionType::ReplaceTeacher => {
                if self.new_teacher_id.is_none() {
                    return Err(Error::validation("replace-teacher requires new_teacher_id"));
                }
                Ok(())
            }
        }
    }
}

/// Exception row as handed to the repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewException {
    /// Owning center
    pub center_id: CenterId,
    /// Requested fields
    pub draft: ExceptionDraft,
    /// Initial status (PENDING, or APPROVED for admin edits)
    pub status: ExceptionStatus,
    /// Filer
    pub requested_by: Requester,
    /// Reviewer when created already approved
    pub reviewed_by: Option<AdminId>,
    /// Review time when created already approved
    pub reviewed_at: Option<DateTime<Utc>>,
}

/// Status change applied by the exception state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    /// Target status
    pub to: ExceptionStatus,
    /// Reviewer
    pub reviewed_by: Option<AdminId>,
    /// Review time
    pub reviewed_at: Option<DateTime<Utc>>,
    /// Review comment
    pub review_note: Option<String>,
}

/// Center-wide blocked date
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CenterHoliday {
    /// Id
    pub id: HolidayId,
    /// Owning center
    pub center_id: CenterId,
    /// Blocked date
    pub date: NaiveDate,
    /// Display name
    pub name: String,
}

/// Teacher-owned blocking event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonalEvent {
    /// Id
    pub id: i64,
    /// Owner
    pub teacher_id: TeacherId,
    /// Title
    pub title: String,
    /// Local start
    pub start_at: NaiveDateTime,
    /// Local end
    pub end_at: NaiveDateTime,
}

/// "Seen" marker on a notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadMarker {
    /// Id
    pub id: i64,
    /// Reader
    pub teacher_id: TeacherId,
    /// Notification key
    pub item_key: String,
    /// When it was read
    pub read_at: DateTime<Utc>,
}

/// Caller identity for authorization decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Actor {
    /// Admin of one center
    Admin {
        /// Admin id
        admin_id: AdminId,
        /// Administered center
        center_id: CenterId,
    },
    /// A teacher acting for themselves
    Teacher {
        /// Teacher id
        teacher_id: TeacherId,
    },
    /// Background jobs
    System,
}

impl Actor {
    /// Whether this actor administers `center_id`
    #[must_use]
    pub fn is_admin_of(&self, center_id: CenterId) -> bool {
        matches!(self, Actor::Admin { center_id: c, .. } if *c == center_id)
    }

    /// Admin id if the actor administers `center_id`, else `Forbidden`
    pub fn require_admin(&self, center_id: CenterId) -> Result<AdminId> {
        match self {
            Actor::Admin {
                admin_id,
                center_id: c,
            } if *c == center_id => Ok(*admin_id),
            _ => Err(Error::Forbidden(format!(
                "center admin of {} required",
                center_id
            ))),
        }
    }
}

#[cfg(test)]
mod tests;
