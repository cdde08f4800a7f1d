//! Expansion engine
//!
//! Turns weekly rules, per-date exceptions and center holidays into a flat,
//! ordered list of dated sessions. [`expand_rules`] is a pure function of
//! its inputs and never reads a clock, which is what makes cached results
//! safe to reuse.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::calendar::{crosses_midnight, weekday_of, ClockTime, MINUTES_PER_DAY};
use crate::error::{Error, Result};
use crate::holiday::HolidayIndex;
use crate::models::{
    CenterId, ExceptionId, ExceptionStatus, ExceptionType, OfferingId, RoomId, RuleId,
    ScheduleException, ScheduleRule, TeacherId,
};
use crate::repository::{ExceptionRepository, HolidayRepository, RuleRepository};

/// Longest window a single expansion may cover
pub const MAX_EXPANSION_DAYS: i64 = 731;

/// Rendering state of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// Runs as the rule says (possibly with a pending request)
    Scheduled,
    /// Cancelled by an approved exception
    Cancelled,
    /// Falls on a center holiday
    Suspended,
    /// Moved by an approved exception
    Rescheduled,
    /// Taught by a substitute
    TeacherReplaced,
}

/// One dated session produced by expansion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpandedSchedule {
    /// Source rule
    pub rule_id: RuleId,
    /// Owning center
    pub center_id: CenterId,
    /// Offering
    pub offering_id: OfferingId,
    /// Effective teacher
    pub teacher_id: Option<TeacherId>,
    /// Teacher assigned by the rule
    pub original_teacher_id: Option<TeacherId>,
    /// Effective room
    pub room_id: RoomId,
    /// Calendar date of this record
    pub date: NaiveDate,
    /// Rule occurrence this record belongs to
    pub occurrence_date: NaiveDate,
    /// ISO weekday of `date`
    pub weekday: u8,
    /// Effective start
    pub start_time: ClockTime,
    /// Effective end (24:00 for the first half of a cross-day session)
    pub end_time: ClockTime,
    /// Length of this record in minutes
    pub duration_minutes: u32,
    /// Date is a center holiday and no approved exception overrides it
    pub is_holiday: bool,
    /// A pending or approved exception exists for the occurrence
    pub has_exception: bool,
    /// The observed exception
    pub exception_id: Option<ExceptionId>,
    /// Kind of the observed exception
    pub exception_kind: Option<ExceptionType>,
    /// Status of the observed exception
    pub exception_status: Option<ExceptionStatus>,
    /// Rescheduled date
    pub effective_new_date: Option<NaiveDate>,
    /// Rescheduled start
    pub effective_new_start: Option<ClockTime>,
    /// Rescheduled end
    pub effective_new_end: Option<ClockTime>,
    /// Substitute teacher
    pub effective_new_teacher: Option<TeacherId>,
    /// Replacement room
    pub effective_new_room: Option<RoomId>,
    /// Half of a session that crosses midnight
    pub is_cross_day_part: bool,
    /// Rendering state
    pub status: SessionStatus,
}

impl ExpandedSchedule {
    /// Second half of a cross-day session
    #[must_use]
    pub fn is_continuation(&self) -> bool {
        self.is_cross_day_part && self.date != self.occurrence_date
    }

    /// Whether the session actually takes place
    #[must_use]
    pub fn takes_place(&self) -> bool {
        !matches!(self.status, SessionStatus::Cancelled | SessionStatus::Suspended)
    }

    /// Whether `teacher_id` teaches or was originally assigned this session
    #[must_use]
    pub fn involves_teacher(&self, teacher_id: TeacherId) -> bool {
        self.teacher_id == Some(teacher_id) || self.original_teacher_id == Some(teacher_id)
    }
}

/// Expansion request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpansionQuery {
    /// Center
    pub center_id: CenterId,
    /// First date
    pub start: NaiveDate,
    /// Last date
    pub end: NaiveDate,
    /// Restrict to these rules
    pub rule_ids: Option<Vec<RuleId>>,
    /// Restrict to sessions involving this teacher: kept when the teacher is
    /// the rule's teacher or the session's effective teacher, so a session
    /// handed to a substitute shows up for both
    pub teacher_id: Option<TeacherId>,
}

impl ExpansionQuery {
    /// Whole-center query
    #[must_use]
    pub fn center(center_id: CenterId, start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            center_id,
            start,
            end,
            rule_ids: None,
            teacher_id: None,
        }
    }

    /// Restrict to one teacher
    #[must_use]
    pub fn with_teacher(mut self, teacher_id: TeacherId) -> Self {
        self.teacher_id = Some(teacher_id);
        self
    }

    /// Restrict to a set of rules
    #[must_use]
    pub fn with_rules(mut self, rule_ids: Vec<RuleId>) -> Self {
        self.rule_ids = Some(rule_ids);
        self
    }

    /// Check the window bounds
    pub fn validate(&self) -> Result<()> {
        if self.end < self.start {
            return Err(Error::validation("end date precedes start date"));
        }
        if (self.end - self.start).num_days() >= MAX_EXPANSION_DAYS {
            return Err(Error::validation(format!(
                "window exceeds {} days",
                MAX_EXPANSION_DAYS
            )));
        }
        Ok(())
    }
}

/// Pick the exception observed for each (rule, date) pair.
///
/// Only PENDING and APPROVED rows count. Approved wins over pending; among
/// duplicates of the same status the most recently updated wins.
fn observed_exceptions<'a>(
    rules: &HashMap<RuleId, &ScheduleRule>,
    exceptions: &'a [ScheduleException],
) -> HashMap<(RuleId, NaiveDate), &'a ScheduleException> {
    let mut chosen: HashMap<(RuleId, NaiveDate), &ScheduleException> = HashMap::new();
    for exception in exceptions.iter().filter(|e| e.status.is_blocking()) {
        let Some(rule) = rules.get(&exception.rule_id) else {
            continue;
        };
        if !rule.effective_range.contains(exception.original_date)
            || weekday_of(exception.original_date) != rule.weekday
        {
            debug!(
                exception_id = exception.id,
                rule_id = rule.id,
                date = %exception.original_date,
                "Ignoring exception outside its rule's occurrences"
            );
            continue;
        }
        let key = (exception.rule_id, exception.original_date);
        match chosen.get(&key) {
            None => {
                chosen.insert(key, exception);
            }
            Some(current) => {
                warn!(
                    rule_id = key.0,
                    date = %key.1,
                    kept = current.id,
                    other = exception.id,
                    "Multiple active exceptions for one occurrence"
                );
                if precedence(exception) > precedence(current) {
                    chosen.insert(key, exception);
                }
            }
        }
    }
    chosen
}

fn precedence(e: &ScheduleException) -> (bool, chrono::DateTime<chrono::Utc>, ExceptionId) {
    (e.status == ExceptionStatus::Approved, e.updated_at, e.id)
}

fn base_session(rule: &ScheduleRule, date: NaiveDate) -> ExpandedSchedule {
    ExpandedSchedule {
        rule_id: rule.id,
        center_id: rule.center_id,
        offering_id: rule.offering_id,
        teacher_id: rule.teacher_id,
        original_teacher_id: rule.teacher_id,
        room_id: rule.room_id,
        date,
        occurrence_date: date,
        weekday: weekday_of(date),
        start_time: rule.start_time,
        end_time: rule.end_time,
        duration_minutes: rule.duration_minutes,
        is_holiday: false,
        has_exception: false,
        exception_id: None,
        exception_kind: None,
        exception_status: None,
        effective_new_date: None,
        effective_new_start: None,
        effective_new_end: None,
        effective_new_teacher: None,
        effective_new_room: None,
        is_cross_day_part: false,
        status: SessionStatus::Scheduled,
    }
}

fn apply_approved(session: &mut ExpandedSchedule, exception: &ScheduleException) {
    match exception.exception_type {
        ExceptionType::Cancel => {
            session.status = SessionStatus::Cancelled;
        }
        ExceptionType::Reschedule => {
            if let (Some(start_at), Some(end_at)) = (exception.new_start_at, exception.new_end_at) {
                let start = ClockTime::of(start_at);
                let end = ClockTime::of(end_at);
                session.start_time = start;
                session.end_time = end;
                session.duration_minutes = (end_at - start_at).num_minutes().max(0) as u32;
                session.effective_new_date = Some(start_at.date());
                session.effective_new_start = Some(start);
                session.effective_new_end = Some(end);
            }
            if let Some(teacher_id) = exception.new_teacher_id {
                session.teacher_id = Some(teacher_id);
                session.effective_new_teacher = Some(teacher_id);
            }
            if let Some(room_id) = exception.new_room_id {
                session.room_id = room_id;
                session.effective_new_room = Some(room_id);
            }
            session.status = SessionStatus::Rescheduled;
        }
        ExceptionType::ReplaceTeacher => {
            if let Some(teacher_id) = exception.new_teacher_id {
                session.teacher_id = Some(teacher_id);
                session.effective_new_teacher = Some(teacher_id);
            }
            session.status = SessionStatus::TeacherReplaced;
        }
    }
}

/// Split a session whose window wraps past midnight into its two calendar
/// days; other sessions pass through unchanged.
fn split_cross_day(session: ExpandedSchedule) -> Vec<ExpandedSchedule> {
    if !crosses_midnight(session.start_time, session.end_time) {
        return vec![session];
    }
    let mut first = session.clone();
    first.end_time = ClockTime::END_OF_DAY;
    first.duration_minutes = u32::from(MINUTES_PER_DAY - session.start_time.minutes());
    first.is_cross_day_part = true;

    let mut second = session;
    second.date = first.date + Duration::days(1);
    second.weekday = weekday_of(second.date);
    second.start_time = ClockTime::MIDNIGHT;
    second.duration_minutes = u32::from(second.end_time.minutes());
    second.effective_new_date = second.effective_new_date.map(|d| d + Duration::days(1));
    second.is_cross_day_part = true;

    vec![first, second]
}

/// Expand rules over `[start, end]`.
///
/// Pure: the output depends only on the arguments. Records are ordered by
/// `(date, start_time, rule_id)`.
#[must_use]
pub fn expand_rules(
    rules: &[ScheduleRule],
    exceptions: &[ScheduleException],
    holidays: &HolidayIndex,
    start: NaiveDate,
    end: NaiveDate,
    teacher_filter: Option<TeacherId>,
) -> Vec<ExpandedSchedule> {
    let by_id: HashMap<RuleId, &ScheduleRule> = rules.iter().map(|r| (r.id, r)).collect();
    let observed = observed_exceptions(&by_id, exceptions);

    let mut sessions = Vec::new();
    for rule in rules.iter().filter(|r| r.is_active) {
        let Some(span) = rule.effective_range.clamp(start, end) else {
            continue;
        };
        for date in span.weekdays(rule.weekday) {
            let mut session = base_session(rule, date);
            let on_holiday = holidays.is_holiday(rule.center_id, date);

            match observed.get(&(rule.id, date)) {
                Some(exception) => {
                    session.has_exception = true;
                    session.exception_id = Some(exception.id);
                    session.exception_kind = Some(exception.exception_type);
                    session.exception_status = Some(exception.status);
                    if exception.status == ExceptionStatus::Approved {
                        apply_approved(&mut session, exception);
                    } else if on_holiday {
                        session.is_holiday = true;
                        session.status = SessionStatus::Suspended;
                    }
                }
                None if on_holiday => {
                    session.is_holiday = true;
                    session.status = SessionStatus::Suspended;
                }
                None => {}
            }

            if let Some(teacher_id) = teacher_filter {
                if !session.involves_teacher(teacher_id) {
                    continue;
                }
            }
            sessions.extend(split_cross_day(session));
        }
    }

    sessions.sort_by(|a, b| {
        (a.date, a.start_time, a.rule_id, a.end_time).cmp(&(b.date, b.start_time, b.rule_id, b.end_time))
    });
    sessions
}

/// Loads rules, exceptions and holidays and runs [`expand_rules`]
#[derive(Clone)]
pub struct ExpansionEngine {
    rules: Arc<dyn RuleRepository>,
    exceptions: Arc<dyn ExceptionRepository>,
    holidays: Arc<dyn HolidayRepository>,
}

impl ExpansionEngine {
    /// Engine over repositories
    pub fn new(
        rules: Arc<dyn RuleRepository>,
        exceptions: Arc<dyn ExceptionRepository>,
        holidays: Arc<dyn HolidayRepository>,
    ) -> Self {
        Self {
            rules,
            exceptions,
            holidays,
        }
    }

    /// Expand a query against current repository contents
    pub async fn expand(&self, query: &ExpansionQuery) -> Result<Vec<ExpandedSchedule>> {
        query.validate()?;

        let mut rules = self
            .rules
            .list_intersecting(query.center_id, query.start, query.end)
            .await?;
        if let Some(ids) = &query.rule_ids {
            rules.retain(|r| ids.contains(&r.id));
        }
        if rules.is_empty() {
            return Ok(Vec::new());
        }

        let holidays = HolidayIndex::from_rows(
            query.center_id,
            self.holidays
                .list_by_center_in_range(query.center_id, query.start, query.end)
                .await?,
        );

        let rule_ids: Vec<RuleId> = rules.iter().map(|r| r.id).collect();
        let exceptions = self
            .exceptions
            .list_by_rules_in_range(&rule_ids, query.start, query.end)
            .await?;

        let sessions = expand_rules(
            &rules,
            &exceptions,
            &holidays,
            query.start,
            query.end,
            query.teacher_id,
        );
        debug!(
            center_id = query.center_id,
            start = %query.start,
            end = %query.end,
            rules = rules.len(),
            sessions = sessions.len(),
            "Expanded schedule"
        );
        Ok(sessions)
    }
}
