//! Rule store
//!
//! Validated access to weekly rules. Writes check that the offering, room and
//! teacher belong to the rule's center, bump the concurrency token through the
//! repository, and invalidate the center's cached expansions before returning.
//! Splitting a series is the recurrence editor's job, never this module's.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::ExpansionCache;
use crate::calendar::{duration_minutes, each_date_in_range, weekday_of, ClockTime, EffectiveRange};
use crate::error::{Error, ErrorKind, Result};
use crate::expansion::MAX_EXPANSION_DAYS;
use crate::models::{
    validate_rule_shape, CenterId, OfferingId, RoomId, RuleDraft, RuleId, ScheduleRule, TeacherId,
};
use crate::repository::{
    CatalogRepository, MembershipRepository, RuleRepository, RuleSplit, SplitResult,
};

/// Whitelisted rule fields an update may change
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulePatch {
    /// Display name
    pub name: Option<String>,
    /// Teacher (`Some(None)` unassigns)
    pub teacher_id: Option<Option<TeacherId>>,
    /// Room
    pub room_id: Option<RoomId>,
    /// ISO weekday
    pub weekday: Option<u8>,
    /// Start
    pub start_time: Option<ClockTime>,
    /// End
    pub end_time: Option<ClockTime>,
    /// Validity window
    pub effective_range: Option<EffectiveRange>,
    /// Hard lock time (`Some(None)` clears it)
    pub lock_at: Option<Option<DateTime<Utc>>>,
}

impl RulePatch {
    /// Whether the patch changes nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Whether the patch moves the session in the week or changes its resources
    #[must_use]
    pub fn touches_slot(&self) -> bool {
        self.teacher_id.is_some()
            || self.room_id.is_some()
            || self.weekday.is_some()
            || self.start_time.is_some()
            || self.end_time.is_some()
            || self.effective_range.is_some()
    }

    /// Set the times
    #[must_use]
    pub fn with_times(mut self, start: ClockTime, end: ClockTime) -> Self {
        self.start_time = Some(start);
        self.end_time = Some(end);
        self
    }

    /// Set the teacher
    #[must_use]
    pub fn with_teacher(mut self, teacher_id: Option<TeacherId>) -> Self {
        self.teacher_id = Some(teacher_id);
        self
    }

    /// Set the room
    #[must_use]
    pub fn with_room(mut self, room_id: RoomId) -> Self {
        self.room_id = Some(room_id);
        self
    }

    /// The rule with the patch applied and its duration recomputed
    #[must_use]
    pub fn apply_to(&self, rule: &ScheduleRule) -> ScheduleRule {
        let mut next = rule.clone();
        if let Some(name) = &self.name {
            next.name = name.clone();
        }
        if let Some(teacher_id) = self.teacher_id {
            next.teacher_id = teacher_id;
        }
        if let Some(room_id) = self.room_id {
            next.room_id = room_id;
        }
        if let Some(weekday) = self.weekday {
            next.weekday = weekday;
        }
        if let Some(start) = self.start_time {
            next.start_time = start;
        }
        if let Some(end) = self.end_time {
            next.end_time = end;
        }
        if let Some(range) = self.effective_range {
            next.effective_range = range;
        }
        if let Some(lock_at) = self.lock_at {
            next.lock_at = lock_at;
        }
        next.duration_minutes = duration_minutes(next.start_time, next.end_time);
        next
    }
}

/// Structural checks shared by every rule write
pub(crate) fn validate_rule(rule: &ScheduleRule) -> Result<()> {
    validate_rule_shape(
        rule.weekday,
        rule.start_time,
        rule.end_time,
        &rule.effective_range,
    )?;
    if rule.name.trim().is_empty() {
        return Err(Error::validation("rule name is required"));
    }
    Ok(())
}

fn sort_for_display(rules: &mut [ScheduleRule]) {
    rules.sort_by(|a, b| (a.weekday, a.start_time, a.id).cmp(&(b.weekday, b.start_time, b.id)));
}

/// What changed at a phase boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseAttribute {
    /// Governing rule set
    Rule,
    /// Rooms used
    Room,
    /// Teachers assigned
    Teacher,
    /// Weekday or times
    Time,
}

/// Kind of phase boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransitionKind {
    /// First governed date in the window
    Start,
    /// Rules change without a gap
    Change,
    /// No rule governs from this date
    Gap,
    /// Rules govern again after a gap
    Resume,
}

/// Date on which the rules governing an offering change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseTransition {
    /// First date of the new phase
    pub date: NaiveDate,
    /// Boundary kind
    pub kind: TransitionKind,
    /// Rules governing the new phase
    pub rule_ids: Vec<RuleId>,
    /// Attributes differing from the previous phase
    pub changed: Vec<PhaseAttribute>,
}

#[derive(PartialEq, Eq, Default)]
struct Phase {
    rules: BTreeSet<RuleId>,
    rooms: BTreeSet<RoomId>,
    teachers: BTreeSet<Option<TeacherId>>,
    times: BTreeSet<(u8, ClockTime, ClockTime)>,
}

impl Phase {
    fn on(rules: &[ScheduleRule], date: NaiveDate) -> Self {
        let mut phase = Self::default();
        for rule in rules
            .iter()
            .filter(|r| r.is_active && r.effective_range.contains(date))
        {
            phase.rules.insert(rule.id);
            phase.rooms.insert(rule.room_id);
            phase.teachers.insert(rule.teacher_id);
            phase.times.insert((rule.weekday, rule.start_time, rule.end_time));
        }
        phase
    }

    fn diff(&self, other: &Phase) -> Vec<PhaseAttribute> {
        let mut changed = Vec::new();
        if self.rules != other.rules {
            changed.push(PhaseAttribute::Rule);
        }
        if self.rooms != other.rooms {
            changed.push(PhaseAttribute::Room);
        }
        if self.teachers != other.teachers {
            changed.push(PhaseAttribute::Teacher);
        }
        if self.times != other.times {
            changed.push(PhaseAttribute::Time);
        }
        changed
    }
}

/// Dates in `[start, end]` where the set of rules governing an offering changes
#[must_use]
pub fn phase_transitions(
    rules: &[ScheduleRule],
    start: NaiveDate,
    end: NaiveDate,
) -> Vec<PhaseTransition> {
    let mut transitions = Vec::new();
    let mut previous: Option<Phase> = None;
    let mut seen_rule = false;

    for date in each_date_in_range(start, end) {
        let current = Phase::on(rules, date);
        let kind = match &previous {
            Some(prev) if *prev == current => None,
            _ if current.rules.is_empty() && !seen_rule => None,
            _ if current.rules.is_empty() => Some(TransitionKind::Gap),
            _ if !seen_rule => Some(TransitionKind::Start),
            Some(prev) if prev.rules.is_empty() => Some(TransitionKind::Resume),
            _ => Some(TransitionKind::Change),
        };
        if let Some(kind) = kind {
            let changed = previous
                .as_ref()
                .map(|prev| prev.diff(&current))
                .unwrap_or_default();
            transitions.push(PhaseTransition {
                date,
                kind,
                rule_ids: current.rules.iter().copied().collect(),
                changed,
            });
        }
        seen_rule |= !current.rules.is_empty();
        previous = Some(current);
    }
    transitions
}

/// Rule governing an offering's session on `date`.
///
/// Among several rules occurring on that weekday the one whose effective
/// range started last wins, ties broken by the higher id.
#[must_use]
pub fn effective_rule_for_date(rules: &[ScheduleRule], date: NaiveDate) -> Option<&ScheduleRule> {
    let weekday = weekday_of(date);
    rules
        .iter()
        .filter(|r| r.is_active && r.weekday == weekday && r.effective_range.contains(date))
        .max_by_key(|r| (r.effective_range.start_date, r.id))
}

/// Validated rule reads and writes
#[derive(Clone)]
pub struct RuleStore {
    rules: Arc<dyn RuleRepository>,
    catalog: Arc<dyn CatalogRepository>,
    memberships: Arc<dyn MembershipRepository>,
    cache: ExpansionCache,
}

impl RuleStore {
    /// Store over repositories and the expansion cache
    pub fn new(
        rules: Arc<dyn RuleRepository>,
        catalog: Arc<dyn CatalogRepository>,
        memberships: Arc<dyn MembershipRepository>,
        cache: ExpansionCache,
    ) -> Self {
        Self {
            rules,
            catalog,
            memberships,
            cache,
        }
    }

    /// Check that the rule's resources belong to its center
    pub async fn check_ownership(
        &self,
        center_id: CenterId,
        offering_id: OfferingId,
        room_id: RoomId,
        teacher_id: Option<TeacherId>,
    ) -> Result<()> {
        self.catalog.get_offering(center_id, offering_id).await?;

        match self.catalog.get_room(center_id, room_id).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::RuleConflict(format!(
                    "room {} does not belong to center {}",
                    room_id, center_id
                )));
            }
            Err(e) => return Err(e),
        }

        if let Some(teacher_id) = teacher_id {
            let membership = self
                .memberships
                .get_by_center_and_teacher(center_id, teacher_id)
                .await?;
            if !membership.is_some_and(|m| m.is_active()) {
                return Err(Error::RuleConflict(format!(
                    "teacher {} is not an active member of center {}",
                    teacher_id, center_id
                )));
            }
        }
        Ok(())
    }

    /// Validate and persist a new rule
    pub async fn create(&self, draft: RuleDraft) -> Result<ScheduleRule> {
        draft.validate()?;
        self.check_ownership(draft.center_id, draft.offering_id, draft.room_id, draft.teacher_id)
            .await?;
        let rule = self.rules.create(draft).await?;
        info!(
            center_id = rule.center_id,
            rule_id = rule.id,
            weekday = rule.weekday,
            start = %rule.start_time,
            end = %rule.end_time,
            "Rule created"
        );
        self.invalidate_for(&[&rule]).await;
        Ok(rule)
    }

    /// Rule by id within a center
    pub async fn get(&self, center_id: CenterId, id: RuleId) -> Result<ScheduleRule> {
        self.rules.get_by_id(center_id, id).await
    }

    /// Apply whitelisted changes. `expected_updated_at`, when given, must
    /// match the stored token.
    pub async fn update(
        &self,
        center_id: CenterId,
        id: RuleId,
        patch: &RulePatch,
        expected_updated_at: Option<DateTime<Utc>>,
    ) -> Result<ScheduleRule> {
        let current = self.rules.get_by_id(center_id, id).await?;
        if expected_updated_at.is_some_and(|token| token != current.updated_at) {
            return Err(Error::concurrent("rule", id));
        }
        if !current.is_active {
            return Err(Error::RuleConflict(format!("rule {} is inactive", id)));
        }
        self.save(&current, patch.apply_to(&current)).await
    }

    /// Persist `next` over `current`, checking shape and ownership
    pub(crate) async fn save(
        &self,
        current: &ScheduleRule,
        next: ScheduleRule,
    ) -> Result<ScheduleRule> {
        validate_rule(&next)?;
        if next.room_id != current.room_id || next.teacher_id != current.teacher_id {
            self.check_ownership(next.center_id, next.offering_id, next.room_id, next.teacher_id)
                .await?;
        }
        let saved = self.rules.update(&next).await?;
        info!(center_id = saved.center_id, rule_id = saved.id, "Rule updated");
        self.invalidate_for(&[current, &saved]).await;
        Ok(saved)
    }

    /// Replace `current` with `original` and start `successor` on `anchor`,
    /// moving open exceptions from the anchor on. One repository write.
    pub(crate) async fn split(
        &self,
        current: &ScheduleRule,
        original: ScheduleRule,
        successor: RuleDraft,
        anchor: NaiveDate,
    ) -> Result<SplitResult> {
        validate_rule(&original)?;
        successor.validate()?;
        self.check_ownership(
            successor.center_id,
            successor.offering_id,
            successor.room_id,
            successor.teacher_id,
        )
        .await?;
        let split = self
            .rules
            .split(RuleSplit {
                original,
                successor,
                anchor,
            })
            .await?;
        info!(
            center_id = split.original.center_id,
            rule_id = split.original.id,
            successor_id = split.successor.id,
            migrated = split.migrated.len(),
            "Rule split"
        );
        self.invalidate_for(&[current, &split.original, &split.successor])
            .await;
        Ok(split)
    }

    /// Soft-delete a rule
    pub async fn deactivate(&self, center_id: CenterId, id: RuleId) -> Result<ScheduleRule> {
        let current = self.rules.get_by_id(center_id, id).await?;
        if !current.is_active {
            return Ok(current);
        }
        let rule = self
            .rules
            .set_active(center_id, id, false, current.updated_at)
            .await?;
        info!(center_id = center_id, rule_id = id, "Rule deactivated");
        self.invalidate_for(&[&rule]).await;
        Ok(rule)
    }

    /// Active rules of a center ordered by weekday and start time
    pub async fn list_by_center(&self, center_id: CenterId) -> Result<Vec<ScheduleRule>> {
        let mut rules = self.rules.list_by_center(center_id).await?;
        sort_for_display(&mut rules);
        Ok(rules)
    }

    /// Active rules of a teacher in a center, same order as [`Self::list_by_center`]
    pub async fn list_by_teacher(
        &self,
        teacher_id: TeacherId,
        center_id: CenterId,
    ) -> Result<Vec<ScheduleRule>> {
        let mut rules = self
            .rules
            .list_by_teacher_and_center(teacher_id, center_id)
            .await?;
        sort_for_display(&mut rules);
        Ok(rules)
    }

    /// Active rules whose range intersects `[start, end]`
    pub async fn list_intersecting(
        &self,
        center_id: CenterId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<ScheduleRule>> {
        if end < start {
            return Err(Error::validation("end date precedes start date"));
        }
        let mut rules = self.rules.list_intersecting(center_id, start, end).await?;
        sort_for_display(&mut rules);
        Ok(rules)
    }

    /// Rule of an offering governing `date`
    pub async fn effective_rule_for_date(
        &self,
        center_id: CenterId,
        offering_id: OfferingId,
        date: NaiveDate,
    ) -> Result<Option<ScheduleRule>> {
        let rules = self.rules.list_by_offering(center_id, offering_id).await?;
        Ok(effective_rule_for_date(&rules, date).cloned())
    }

    /// Phase boundaries of an offering within `[start, end]`
    pub async fn phase_transitions(
        &self,
        center_id: CenterId,
        offering_id: OfferingId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PhaseTransition>> {
        if end < start || (end - start).num_days() >= MAX_EXPANSION_DAYS {
            return Err(Error::validation(format!(
                "phase window must be ordered and shorter than {} days",
                MAX_EXPANSION_DAYS
            )));
        }
        let rules = self.rules.list_by_offering(center_id, offering_id).await?;
        Ok(phase_transitions(&rules, start, end))
    }

    async fn invalidate_for(&self, rules: &[&ScheduleRule]) {
        let Some(center_id) = rules.first().map(|r| r.center_id) else {
            return;
        };
        let teachers: BTreeSet<TeacherId> = rules.iter().filter_map(|r| r.teacher_id).collect();
        let teachers: Vec<TeacherId> = teachers.into_iter().collect();
        self.cache.invalidate(center_id, &teachers).await;
    }
}

#[cfg(test)]
mod tests;
