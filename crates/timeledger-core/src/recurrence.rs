//! Series edits
//!
//! An edit targets one occurrence `(rule_id, anchor_date)` and a scope:
//! - `Single` records an approved exception on the anchor date.
//! - `Future` ends the rule the day before the anchor and starts a successor
//!   rule on the anchor, re-keying live exceptions from the anchor on.
//! - `All` changes the rule in place; existing exceptions stay put.
//!
//! Deletes follow the same scopes.

use chrono::{DateTime, Duration, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::calendar::{crosses_midnight, Calendar, ClockTime, EffectiveRange, SharedClock};
use crate::error::{Error, Result};
use crate::exceptions::ExceptionService;
use crate::expansion::{ExpansionEngine, ExpansionQuery};
use crate::models::{
    Actor, CenterId, ExceptionDraft, ExceptionId, RuleDraft, RuleId, ScheduleException,
    ScheduleRule,
};
use crate::rule_lock::RuleLock;
use crate::rules::{validate_rule, RulePatch, RuleStore};
use crate::validation::{ConflictValidator, ProposedSlot};

/// Scope of an edit or delete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EditMode {
    /// The anchor occurrence only
    Single,
    /// The anchor occurrence and everything after it
    Future,
    /// The whole series
    All,
}

/// Change to a series
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditRequest {
    /// Rule being edited
    pub rule_id: RuleId,
    /// Occurrence the edit starts from
    pub anchor_date: NaiveDate,
    /// Scope
    pub mode: EditMode,
    /// New values
    pub changes: RulePatch,
    /// Accept buffer shortfalls when the offering allows it
    #[serde(default)]
    pub override_buffer: bool,
    /// Concurrency token the caller read
    #[serde(default)]
    pub expected_updated_at: Option<DateTime<Utc>>,
}

/// Result of an edit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EditOutcome {
    /// Scope applied
    pub mode: EditMode,
    /// The edited rule as stored afterwards
    pub rule: ScheduleRule,
    /// Successor rule (`Future`)
    pub successor: Option<ScheduleRule>,
    /// Exception recorded (`Single`)
    pub exception: Option<ScheduleException>,
    /// Exceptions moved to the successor (`Future`)
    pub migrated: Vec<ExceptionId>,
}

/// Removal of part of a series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRequest {
    /// Rule
    pub rule_id: RuleId,
    /// First occurrence removed
    pub anchor_date: NaiveDate,
    /// Scope
    pub mode: EditMode,
}

/// Result of a delete
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteOutcome {
    /// Scope applied
    pub mode: EditMode,
    /// The rule as stored afterwards
    pub rule: ScheduleRule,
    /// Cancellation recorded (`Single`)
    pub exception: Option<ScheduleException>,
}

/// Sessions an edit would touch over the coming year
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EditPreview {
    /// Scope
    pub mode: EditMode,
    /// Number of sessions affected
    pub affected_count: usize,
    /// Their dates, ascending
    pub affected_dates: Vec<NaiveDate>,
    /// Whether a successor rule would be created
    pub creates_rule: bool,
    /// First day looked at
    pub window_start: NaiveDate,
    /// Last day looked at
    pub window_end: NaiveDate,
}

/// `rule` ending the day before `anchor`, or retired when nothing remains
fn truncated(rule: &ScheduleRule, anchor: NaiveDate) -> ScheduleRule {
    let mut next = rule.clone();
    if anchor <= rule.effective_range.start_date {
        next.is_active = false;
    } else {
        next.effective_range =
            EffectiveRange::new(rule.effective_range.start_date, Some(anchor - Duration::days(1)));
    }
    next
}

/// Exception equivalent of applying `patch` to one occurrence
pub(crate) fn single_occurrence_draft(
    rule: &ScheduleRule,
    anchor: NaiveDate,
    patch: &RulePatch,
) -> Result<ExceptionDraft> {
    if patch.is_empty() {
        return Err(Error::validation("edit changes nothing"));
    }
    if patch.name.is_some() || patch.effective_range.is_some() || patch.lock_at.is_some() {
        return Err(Error::validation(
            "name, range and lock changes apply to a series, not one session",
        ));
    }

    let moves = patch.room_id.is_some()
        || patch.weekday.is_some()
        || patch.start_time.is_some()
        || patch.end_time.is_some();
    if !moves {
        // Teacher only
        let Some(Some(teacher_id)) = patch.teacher_id else {
            return Err(Error::validation("a single session cannot be unassigned"));
        };
        return Ok(ExceptionDraft::replace_teacher(rule.id, anchor, teacher_id));
    }

    let next = patch.apply_to(rule);
    validate_rule(&next)?;
    let day = anchor + Duration::days(i64::from(next.weekday) - i64::from(rule.weekday));
    let (end_day, end_time) =
        if next.end_time == ClockTime::MIDNIGHT || next.end_time == ClockTime::END_OF_DAY {
            (day + Duration::days(1), ClockTime::MIDNIGHT)
        } else if crosses_midnight(next.start_time, next.end_time) {
            (day + Duration::days(1), next.end_time)
        } else {
            (day, next.end_time)
        };

    let mut draft = ExceptionDraft::reschedule(
        rule.id,
        anchor,
        next.start_time.on(day),
        end_time.on(end_day),
    );
    if next.room_id != rule.room_id {
        draft.new_room_id = Some(next.room_id);
    }
    if next.teacher_id != rule.teacher_id {
        let Some(teacher_id) = next.teacher_id else {
            return Err(Error::validation("a single session cannot be unassigned"));
        };
        draft.new_teacher_id = Some(teacher_id);
    }
    Ok(draft)
}

/// Applies series edits and deletes
#[derive(Clone)]
pub struct RecurrenceEditor {
    rules: RuleStore,
    exceptions: ExceptionService,
    validator: ConflictValidator,
    lock: RuleLock,
    engine: ExpansionEngine,
    calendar: Calendar,
    clock: SharedClock,
}

impl RecurrenceEditor {
    /// Editor over its collaborators
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rules: RuleStore,
        exceptions: ExceptionService,
        validator: ConflictValidator,
        lock: RuleLock,
        engine: ExpansionEngine,
        calendar: Calendar,
        clock: SharedClock,
    ) -> Self {
        Self {
            rules,
            exceptions,
            validator,
            lock,
            engine,
            calendar,
            clock,
        }
    }

    async fn load(
        &self,
        center_id: CenterId,
        rule_id: RuleId,
        expected_updated_at: Option<DateTime<Utc>>,
    ) -> Result<ScheduleRule> {
        let rule = self.rules.get(center_id, rule_id).await?;
        if expected_updated_at.is_some_and(|token| token != rule.updated_at) {
            return Err(Error::concurrent("rule", rule_id));
        }
        if !rule.is_active {
            return Err(Error::RuleConflict(format!("rule {} is inactive", rule_id)));
        }
        Ok(rule)
    }

    async fn check_slot(&self, proposed: &ProposedSlot, override_buffer: bool) -> Result<()> {
        let policy = self.validator.buffer_policy(proposed).await?;
        self.validator
            .validate_full(proposed, override_buffer && policy.allow_override)
            .await?
            .into_result()
    }

    /// Apply an edit
    pub async fn edit(
        &self,
        actor: &Actor,
        center_id: CenterId,
        request: &EditRequest,
    ) -> Result<EditOutcome> {
        actor.require_admin(center_id)?;
        let rule = self
            .load(center_id, request.rule_id, request.expected_updated_at)
            .await?;

        let outcome = match request.mode {
            EditMode::Single => self.edit_single(actor, center_id, rule, request).await?,
            EditMode::Future => self.edit_future(rule, request).await?,
            EditMode::All => self.edit_all(center_id, rule, request).await?,
        };
        info!(
            center_id = center_id,
            rule_id = request.rule_id,
            mode = ?request.mode,
            anchor = %request.anchor_date,
            successor = ?outcome.successor.as_ref().map(|r| r.id),
            migrated = outcome.migrated.len(),
            "Series edited"
        );
        Ok(outcome)
    }

    async fn edit_single(
        &self,
        actor: &Actor,
        center_id: CenterId,
        rule: ScheduleRule,
        request: &EditRequest,
    ) -> Result<EditOutcome> {
        self.lock.ensure_unlocked(&rule, request.anchor_date).await?;
        let draft = single_occurrence_draft(&rule, request.anchor_date, &request.changes)?;
        let exception = self
            .exceptions
            .create_approved(actor, center_id, draft, request.override_buffer)
            .await?;
        Ok(EditOutcome {
            mode: EditMode::Single,
            rule,
            successor: None,
            exception: Some(exception),
            migrated: Vec::new(),
        })
    }

    async fn edit_future(&self, rule: ScheduleRule, request: &EditRequest) -> Result<EditOutcome> {
        let anchor = request.anchor_date;
        if !rule.effective_range.contains(anchor) {
            return Err(Error::validation(format!(
                "anchor {} is outside the rule's effective range",
                anchor
            )));
        }
        self.lock.ensure_unlocked(&rule, anchor).await?;

        let mut successor = request.changes.apply_to(&rule);
        let end_date = request
            .changes
            .effective_range
            .map_or(rule.effective_range.end_date, |r| r.end_date);
        successor.effective_range = EffectiveRange::new(anchor, end_date);
        validate_rule(&successor)?;
        let draft = RuleDraft::from_rule(&successor);
        self.check_slot(
            &ProposedSlot::of_draft(&draft).excluding(rule.id),
            request.override_buffer,
        )
        .await?;

        let split = self
            .rules
            .split(&rule, truncated(&rule, anchor), draft, anchor)
            .await?;

        Ok(EditOutcome {
            mode: EditMode::Future,
            rule: split.original,
            successor: Some(split.successor),
            exception: None,
            migrated: split.migrated,
        })
    }

    async fn edit_all(
        &self,
        center_id: CenterId,
        rule: ScheduleRule,
        request: &EditRequest,
    ) -> Result<EditOutcome> {
        if request.changes.is_empty() {
            return Err(Error::validation("edit changes nothing"));
        }
        let next = request.changes.apply_to(&rule);
        validate_rule(&next)?;
        if request.changes.touches_slot() {
            self.check_slot(
                &ProposedSlot::of_rule(&next).excluding(rule.id),
                request.override_buffer,
            )
            .await?;
        }
        let updated = self
            .rules
            .update(center_id, rule.id, &request.changes, Some(rule.updated_at))
            .await?;
        Ok(EditOutcome {
            mode: EditMode::All,
            rule: updated,
            successor: None,
            exception: None,
            migrated: Vec::new(),
        })
    }

    /// End a rule the day before `anchor`, or retire it when nothing remains
    async fn truncate(&self, rule: ScheduleRule, anchor: NaiveDate) -> Result<ScheduleRule> {
        if anchor <= rule.effective_range.start_date {
            return self.rules.deactivate(rule.center_id, rule.id).await;
        }
        let shrunk = truncated(&rule, anchor);
        self.rules.save(&rule, shrunk).await
    }

    /// Remove part of a series
    pub async fn delete(
        &self,
        actor: &Actor,
        center_id: CenterId,
        request: &DeleteRequest,
    ) -> Result<DeleteOutcome> {
        actor.require_admin(center_id)?;
        let rule = self.load(center_id, request.rule_id, None).await?;
        let anchor = request.anchor_date;

        let outcome = match request.mode {
            EditMode::Single => {
                self.lock.ensure_unlocked(&rule, anchor).await?;
                let exception = self
                    .exceptions
                    .create_approved(
                        actor,
                        center_id,
                        ExceptionDraft::cancel(rule.id, anchor, "removed from series"),
                        false,
                    )
                    .await?;
                DeleteOutcome {
                    mode: EditMode::Single,
                    rule,
                    exception: Some(exception),
                }
            }
            EditMode::Future => {
                if !rule.effective_range.contains(anchor) {
                    return Err(Error::validation(format!(
                        "anchor {} is outside the rule's effective range",
                        anchor
                    )));
                }
                self.lock.ensure_unlocked(&rule, anchor).await?;
                DeleteOutcome {
                    mode: EditMode::Future,
                    rule: self.truncate(rule, anchor).await?,
                    exception: None,
                }
            }
            EditMode::All => DeleteOutcome {
                mode: EditMode::All,
                rule: self.rules.deactivate(center_id, rule.id).await?,
                exception: None,
            },
        };
        info!(
            center_id = center_id,
            rule_id = request.rule_id,
            mode = ?request.mode,
            anchor = %anchor,
            "Series deleted"
        );
        Ok(outcome)
    }

    /// Sessions an edit would touch within the next twelve months. Read-only.
    pub async fn preview(&self, center_id: CenterId, request: &EditRequest) -> Result<EditPreview> {
        let rule = self.rules.get(center_id, request.rule_id).await?;
        let today = self.calendar.today(self.clock.now());
        let window_end = today
            .checked_add_months(Months::new(12))
            .map(|d| d - Duration::days(1))
            .ok_or_else(|| Error::validation("preview window out of range"))?;

        let from = match request.mode {
            EditMode::Single => {
                let dates = if rule.occurs_on(request.anchor_date) {
                    vec![request.anchor_date]
                } else {
                    Vec::new()
                };
                return Ok(EditPreview {
                    mode: EditMode::Single,
                    affected_count: dates.len(),
                    affected_dates: dates,
                    creates_rule: false,
                    window_start: today,
                    window_end,
                });
            }
            EditMode::Future => request.anchor_date.max(today),
            EditMode::All => today,
        };

        let mut dates = Vec::new();
        if from <= window_end {
            let query = ExpansionQuery::center(center_id, from, window_end).with_rules(vec![rule.id]);
            dates = self
                .engine
                .expand(&query)
                .await?
                .into_iter()
                .filter(|s| !s.is_continuation())
                .map(|s| s.occurrence_date)
                .collect();
            dates.dedup();
        }
        Ok(EditPreview {
            mode: request.mode,
            affected_count: dates.len(),
            affected_dates: dates,
            creates_rule: request.mode == EditMode::Future,
            window_start: from,
            window_end,
        })
    }
}
