//! Exception lifecycle
//!
//! Every status change goes through [`transition`], which owns the
//! `(from, to)` table and the actor guards. [`ExceptionService`] wraps it
//! with loading, conflict checks on approval, persistence, cache
//! invalidation and notifications.
//!
//! ```text
//! PENDING ──admin──▶ APPROVED ──admin, before the date──▶ REVOKED
//!    ├────admin──▶ REJECTED
//!    ├──own teacher──▶ REVOKED
//!    └──system, date passed──▶ EXPIRED
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::ExpansionCache;
use crate::calendar::{weekday_of, Calendar, ClockTime, EffectiveRange, SharedClock};
use crate::dispatch::{Notification, NotificationDispatcher};
use crate::error::{Error, ErrorKind, Result};
use crate::models::{
    Actor, AdminId, CenterId, ExceptionDraft, ExceptionId, ExceptionStatus, ExceptionType,
    NewException, Requester, RuleId, ScheduleException, ScheduleRule, StatusChange, TeacherId,
};
use crate::repository::ExceptionRepository;
use crate::rule_lock::RuleLock;
use crate::rules::RuleStore;
use crate::validation::{ConflictValidator, ProposedSlot, WeeklySlot};

/// Check a status change against the lifecycle table.
///
/// Returns the admin to stamp as reviewer, if the actor is one.
pub fn transition(
    exception: &ScheduleException,
    to: ExceptionStatus,
    actor: &Actor,
    today: NaiveDate,
) -> Result<Option<AdminId>> {
    use ExceptionStatus::{Approved, Expired, Pending, Rejected, Revoked};

    let from = exception.status;
    let invalid = || Error::InvalidStatus { from, to };
    let center_id = exception.center_id;

    match (from, to) {
        (Pending, Approved) | (Pending, Rejected) => actor.require_admin(center_id).map(Some),
        (Pending, Revoked) => match actor {
            Actor::Teacher { teacher_id }
                if exception.requested_by == Requester::Teacher(*teacher_id) =>
            {
                Ok(None)
            }
            _ => Err(Error::Forbidden(
                "only the requesting teacher may withdraw a pending exception".to_string(),
            )),
        },
        (Pending, Expired) => {
            if *actor != Actor::System {
                return Err(Error::Forbidden(
                    "exceptions are expired by the scheduler".to_string(),
                ));
            }
            if today <= exception.original_date {
                return Err(invalid());
            }
            Ok(None)
        }
        (Approved, Revoked) => {
            let admin_id = actor.require_admin(center_id)?;
            if today >= exception.original_date {
                return Err(invalid());
            }
            Ok(Some(admin_id))
        }
        _ => Err(invalid()),
    }
}

/// Admin decision on a pending exception
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewDecision {
    /// Accept; buffer shortfalls pass when `override_buffer` is set and the
    /// offering allows it
    Approve {
        /// Bypass buffer conflicts
        override_buffer: bool,
    },
    /// Decline
    Reject,
}

impl ReviewDecision {
    fn target(self) -> ExceptionStatus {
        match self {
            Self::Approve { .. } => ExceptionStatus::Approved,
            Self::Reject => ExceptionStatus::Rejected,
        }
    }
}

/// Result of an expiry sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExpireReport {
    /// Pending exceptions looked at
    pub examined: usize,
    /// Moved to EXPIRED
    pub expired: usize,
    /// Changed by someone else during the sweep
    pub skipped: usize,
}

/// Slot an exception would occupy, `None` for cancellations
pub(crate) fn occurrence_slot(rule: &ScheduleRule, draft: &ExceptionDraft) -> Option<ProposedSlot> {
    let teacher_id = draft.new_teacher_id.or(rule.teacher_id);
    let room_id = draft.new_room_id.unwrap_or(rule.room_id);
    let (date, slot) = match draft.exception_type {
        ExceptionType::Cancel => return None,
        ExceptionType::Reschedule => {
            let (start, end) = (draft.new_start_at?, draft.new_end_at?);
            (
                start.date(),
                WeeklySlot {
                    weekday: weekday_of(start.date()),
                    start_time: ClockTime::of(start),
                    end_time: ClockTime::of(end),
                },
            )
        }
        ExceptionType::ReplaceTeacher => (draft.original_date, WeeklySlot::of_rule(rule)),
    };
    Some(ProposedSlot {
        center_id: rule.center_id,
        teacher_id,
        room_id,
        offering_id: rule.offering_id,
        slot,
        effective_range: EffectiveRange::single(date),
        exclude_rule_id: Some(rule.id),
    })
}

/// Exception workflows
#[derive(Clone)]
pub struct ExceptionService {
    exceptions: Arc<dyn ExceptionRepository>,
    rules: RuleStore,
    validator: ConflictValidator,
    lock: RuleLock,
    cache: ExpansionCache,
    notifier: Option<Arc<NotificationDispatcher>>,
    calendar: Calendar,
    clock: SharedClock,
}

impl ExceptionService {
    /// Service over its collaborators
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exceptions: Arc<dyn ExceptionRepository>,
        rules: RuleStore,
        validator: ConflictValidator,
        lock: RuleLock,
        cache: ExpansionCache,
        calendar: Calendar,
        clock: SharedClock,
    ) -> Self {
        Self {
            exceptions,
            rules,
            validator,
            lock,
            cache,
            notifier: None,
            calendar,
            clock,
        }
    }

    /// Emit notifications through a dispatcher
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<NotificationDispatcher>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    fn today(&self) -> NaiveDate {
        self.calendar.today(self.clock.now())
    }

    fn notify(&self, notification: Notification) {
        if let Some(notifier) = &self.notifier {
            notifier.dispatch(notification);
        }
    }

    /// File a change request for one occurrence. Admins of the center and the
    /// rule's own teacher may submit; teachers are subject to the rule lock.
    pub async fn submit(
        &self,
        actor: &Actor,
        center_id: CenterId,
        draft: ExceptionDraft,
    ) -> Result<ScheduleException> {
        let rule = self.rules.get(center_id, draft.rule_id).await?;
        let requested_by = match actor {
            Actor::Admin { admin_id, .. } if actor.is_admin_of(center_id) => {
                Requester::Admin(*admin_id)
            }
            Actor::Teacher { teacher_id } if rule.teacher_id == Some(*teacher_id) => {
                Requester::Teacher(*teacher_id)
            }
            _ => {
                return Err(Error::Forbidden(format!(
                    "not allowed to file exceptions for rule {}",
                    rule.id
                )))
            }
        };

        if matches!(requested_by, Requester::Teacher(_)) {
            self.lock.ensure_unlocked(&rule, draft.original_date).await?;
        }
        self.check_draft(&rule, &draft).await?;

        let created = self
            .exceptions
            .create(NewException {
                center_id,
                draft,
                status: ExceptionStatus::Pending,
                requested_by,
                reviewed_by: None,
                reviewed_at: None,
            })
            .await?;
        info!(
            center_id = center_id,
            exception_id = created.id,
            rule_id = created.rule_id,
            date = %created.original_date,
            kind = %created.exception_type,
            "Exception submitted"
        );

        self.invalidate(&rule, &created).await;
        self.notify(Notification::ExceptionSubmitted {
            center_id,
            exception_id: created.id,
            rule_id: created.rule_id,
            original_date: created.original_date,
            exception_type: created.exception_type,
            requested_by,
        });
        Ok(created)
    }

    /// Record an already-approved exception on behalf of an admin, after the
    /// same conflict checks an approval runs.
    pub async fn create_approved(
        &self,
        actor: &Actor,
        center_id: CenterId,
        draft: ExceptionDraft,
        override_buffer: bool,
    ) -> Result<ScheduleException> {
        let admin_id = actor.require_admin(center_id)?;
        let rule = self.rules.get(center_id, draft.rule_id).await?;
        self.check_draft(&rule, &draft).await?;
        self.check_conflicts(&rule, &draft, override_buffer).await?;

        let created = self
            .exceptions
            .create(NewException {
                center_id,
                draft,
                status: ExceptionStatus::Approved,
                requested_by: Requester::Admin(admin_id),
                reviewed_by: Some(admin_id),
                reviewed_at: Some(self.clock.now()),
            })
            .await?;
        info!(
            center_id = center_id,
            exception_id = created.id,
            rule_id = created.rule_id,
            date = %created.original_date,
            kind = %created.exception_type,
            "Exception recorded as approved"
        );
        self.invalidate(&rule, &created).await;
        Ok(created)
    }

    /// Approve or reject a pending exception
    pub async fn review(
        &self,
        actor: &Actor,
        center_id: CenterId,
        id: ExceptionId,
        decision: ReviewDecision,
        note: Option<String>,
    ) -> Result<ScheduleException> {
        let exception = self.exceptions.get_by_id(center_id, id).await?;
        let to = decision.target();
        let reviewer = transition(&exception, to, actor, self.today())?;
        let rule = self.rules.get(center_id, exception.rule_id).await?;

        if let ReviewDecision::Approve { override_buffer } = decision {
            self.check_conflicts(&rule, &exception.to_draft(), override_buffer)
                .await?;
        }

        let updated = self
            .exceptions
            .update_status(
                id,
                exception.updated_at,
                StatusChange {
                    to,
                    reviewed_by: reviewer,
                    reviewed_at: Some(self.clock.now()),
                    review_note: note,
                },
            )
            .await?;
        info!(
            center_id = center_id,
            exception_id = id,
            status = %updated.status,
            reviewed_by = ?reviewer,
            "Exception reviewed"
        );
        self.invalidate(&rule, &updated).await;
        self.notify_reviewed(&rule, &updated);
        Ok(updated)
    }

    /// Withdraw an exception: a pending one by its requesting teacher, an
    /// approved one by an admin before the session date
    pub async fn revoke(
        &self,
        actor: &Actor,
        center_id: CenterId,
        id: ExceptionId,
    ) -> Result<ScheduleException> {
        let exception = self.exceptions.get_by_id(center_id, id).await?;
        let reviewer = transition(&exception, ExceptionStatus::Revoked, actor, self.today())?;
        let rule = self.rules.get(center_id, exception.rule_id).await?;

        let updated = self
            .exceptions
            .update_status(
                id,
                exception.updated_at,
                StatusChange {
                    to: ExceptionStatus::Revoked,
                    reviewed_by: reviewer,
                    reviewed_at: reviewer.map(|_| self.clock.now()),
                    review_note: None,
                },
            )
            .await?;
        info!(center_id = center_id, exception_id = id, "Exception revoked");
        self.invalidate(&rule, &updated).await;
        self.notify_reviewed(&rule, &updated);
        Ok(updated)
    }

    /// Move every pending exception whose date has passed to EXPIRED.
    /// Safe to run repeatedly.
    pub async fn expire_overdue(&self) -> Result<ExpireReport> {
        let today = self.today();
        let pending = self
            .exceptions
            .list_by_status(None, ExceptionStatus::Pending)
            .await?;

        let mut report = ExpireReport {
            examined: pending.len(),
            ..ExpireReport::default()
        };
        let mut touched: BTreeSet<CenterId> = BTreeSet::new();

        for exception in pending {
            if transition(&exception, ExceptionStatus::Expired, &Actor::System, today).is_err() {
                continue;
            }
            let change = StatusChange {
                to: ExceptionStatus::Expired,
                reviewed_by: None,
                reviewed_at: None,
                review_note: None,
            };
            match self
                .exceptions
                .update_status(exception.id, exception.updated_at, change)
                .await
            {
                Ok(_) => {
                    report.expired += 1;
                    touched.insert(exception.center_id);
                    debug!(exception_id = exception.id, date = %exception.original_date, "Exception expired");
                }
                Err(e) if e.kind() == ErrorKind::ConcurrentModified => {
                    report.skipped += 1;
                    debug!(exception_id = exception.id, "Exception changed during sweep, skipped");
                }
                Err(e) => return Err(e),
            }
        }

        for center_id in touched {
            self.cache.invalidate_center(center_id).await;
        }
        if report.expired > 0 {
            info!(
                examined = report.examined,
                expired = report.expired,
                skipped = report.skipped,
                "Expired overdue exceptions"
            );
        }
        Ok(report)
    }

    /// Exception by id
    pub async fn get(&self, center_id: CenterId, id: ExceptionId) -> Result<ScheduleException> {
        self.exceptions.get_by_id(center_id, id).await
    }

    /// Pending exceptions of a center, oldest date first
    pub async fn list_pending(&self, center_id: CenterId) -> Result<Vec<ScheduleException>> {
        self.list_by_status(center_id, ExceptionStatus::Pending).await
    }

    /// Exceptions of a center in one status, ordered by date
    pub async fn list_by_status(
        &self,
        center_id: CenterId,
        status: ExceptionStatus,
    ) -> Result<Vec<ScheduleException>> {
        let mut rows = self
            .exceptions
            .list_by_status(Some(center_id), status)
            .await?;
        rows.sort_by_key(|e| (e.original_date, e.id));
        Ok(rows)
    }

    /// Exceptions of one rule dated within `[start, end]`, any status
    pub async fn list_for_rule(
        &self,
        center_id: CenterId,
        rule_id: RuleId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<ScheduleException>> {
        if end < start {
            return Err(Error::validation("end date precedes start date"));
        }
        let rule = self.rules.get(center_id, rule_id).await?;
        let mut rows = self
            .exceptions
            .list_by_rules_in_range(&[rule.id], start, end)
            .await?;
        rows.sort_by_key(|e| (e.original_date, e.id));
        Ok(rows)
    }

    async fn check_draft(&self, rule: &ScheduleRule, draft: &ExceptionDraft) -> Result<()> {
        draft.validate()?;
        if !rule.occurs_on(draft.original_date) {
            return Err(Error::validation(format!(
                "rule {} has no session on {}",
                rule.id, draft.original_date
            )));
        }
        if draft.new_room_id.is_some() || draft.new_teacher_id.is_some() {
            self.rules
                .check_ownership(
                    rule.center_id,
                    rule.offering_id,
                    draft.new_room_id.unwrap_or(rule.room_id),
                    draft.new_teacher_id.or(rule.teacher_id),
                )
                .await?;
        }
        if let Some(existing) = self
            .exceptions
            .get_by_rule_and_date(rule.id, draft.original_date)
            .await?
        {
            return Err(Error::RuleConflict(format!(
                "exception {} is already {} for rule {} on {}",
                existing.id, existing.status, rule.id, draft.original_date
            )));
        }
        Ok(())
    }

    /// Overlap and buffer checks for the slot an exception moves a session to
    pub(crate) async fn check_conflicts(
        &self,
        rule: &ScheduleRule,
        draft: &ExceptionDraft,
        override_buffer: bool,
    ) -> Result<()> {
        let Some(proposed) = occurrence_slot(rule, draft) else {
            return Ok(());
        };
        let policy = self.validator.buffer_policy(&proposed).await?;
        let result = self
            .validator
            .validate_full(&proposed, override_buffer && policy.allow_override)
            .await?;
        if !result.valid {
            warn!(
                rule_id = rule.id,
                date = %draft.original_date,
                conflicts = result.conflicts.len(),
                "Exception conflicts with existing sessions"
            );
        }
        result.into_result()
    }

    async fn invalidate(&self, rule: &ScheduleRule, exception: &ScheduleException) {
        let teachers: Vec<TeacherId> = rule
            .teacher_id
            .into_iter()
            .chain(exception.new_teacher_id)
            .collect();
        self.cache.invalidate(rule.center_id, &teachers).await;
    }

    fn notify_reviewed(&self, rule: &ScheduleRule, exception: &ScheduleException) {
        let teacher_id = match exception.requested_by {
            Requester::Teacher(t) => Some(t),
            Requester::Admin(_) => rule.teacher_id,
        };
        self.notify(Notification::ExceptionReviewed {
            center_id: exception.center_id,
            exception_id: exception.id,
            rule_id: exception.rule_id,
            original_date: exception.original_date,
            status: exception.status,
            teacher_id,
        });
    }
}
