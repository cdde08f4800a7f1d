//! Conflict and buffer validation
//!
//! Rules are compared on a weekly minute timeline (Monday 00:00 = 0), so a
//! session that crosses midnight is one interval, not two halves. Two
//! half-open intervals `[a, b)` and `[c, d)` overlap iff `a < d && c < b`;
//! the week wraps, so each comparison also tries the other interval shifted
//! by one week in either direction.
//!
//! Overlaps are hard failures. Buffer shortfalls are soft: they carry
//! `can_override = true` and the deficit in minutes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::calendar::{duration_minutes, ClockTime, EffectiveRange, MINUTES_PER_DAY};
use crate::error::{Error, Result};
use crate::models::{
    BufferPolicy, CenterId, OfferingId, RoomId, RuleDraft, RuleId, ScheduleRule, TeacherId,
};
use crate::repository::{CatalogRepository, RuleRepository};

const MINUTES_PER_WEEK: i64 = 7 * MINUTES_PER_DAY as i64;

/// Kind of conflict found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictKind {
    /// Same teacher, intersecting times
    TeacherOverlap,
    /// Same room, intersecting times
    RoomOverlap,
    /// Teacher gap below the required buffer
    TeacherBuffer,
    /// Room gap below the required buffer
    RoomBuffer,
}

impl ConflictKind {
    /// Hard overlap (never overridable)
    #[must_use]
    pub fn is_overlap(self) -> bool {
        matches!(self, Self::TeacherOverlap | Self::RoomOverlap)
    }
}

/// One conflict against an existing session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    /// What clashed
    pub kind: ConflictKind,
    /// Existing rule involved
    pub rule_id: Option<RuleId>,
    /// Human-readable description
    pub message: String,
    /// Whether the caller may proceed anyway
    pub can_override: bool,
    /// Required buffer in minutes
    pub required_minutes: Option<u32>,
    /// Actual gap in minutes
    pub gap_minutes: Option<i64>,
    /// Missing minutes (`required - gap`)
    pub diff_minutes: Option<i64>,
}

/// A session position within the week
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklySlot {
    /// ISO weekday of the start
    pub weekday: u8,
    /// Start
    pub start_time: ClockTime,
    /// End (at or before start means the next day)
    pub end_time: ClockTime,
}

impl WeeklySlot {
    /// Slot of a stored rule
    #[must_use]
    pub fn of_rule(rule: &ScheduleRule) -> Self {
        Self {
            weekday: rule.weekday,
            start_time: rule.start_time,
            end_time: rule.end_time,
        }
    }

    fn begin(&self) -> i64 {
        (i64::from(self.weekday) - 1) * i64::from(MINUTES_PER_DAY)
            + i64::from(self.start_time.minutes())
    }

    fn len(&self) -> i64 {
        i64::from(duration_minutes(self.start_time, self.end_time))
    }

    /// Whether the two slots share any minute of the week
    #[must_use]
    pub fn overlaps(&self, other: &WeeklySlot) -> bool {
        let (a, b) = (self.begin(), self.begin() + self.len());
        [-MINUTES_PER_WEEK, 0, MINUTES_PER_WEEK].iter().any(|shift| {
            let (c, d) = (other.begin() + shift, other.begin() + other.len() + shift);
            a < d && c < b
        })
    }

    /// Minutes from the end of `previous` to the start of `self`
    #[must_use]
    pub fn gap_after(&self, previous: &WeeklySlot) -> i64 {
        (self.begin() - (previous.begin() + previous.len())).rem_euclid(MINUTES_PER_WEEK)
    }

    /// Minutes from the end of `self` to the start of `next`
    #[must_use]
    pub fn gap_before(&self, next: &WeeklySlot) -> i64 {
        next.gap_after(self)
    }
}

/// Same-resource overlap predicate
#[must_use]
pub fn slots_overlap(a: &WeeklySlot, b: &WeeklySlot) -> bool {
    a.overlaps(b)
}

/// Existing session next to a proposed one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Neighbor {
    /// Rule producing the session
    pub rule_id: Option<RuleId>,
    /// Where it sits in the week
    pub slot: WeeklySlot,
}

impl Neighbor {
    /// Neighbor taken from a rule
    #[must_use]
    pub fn of_rule(rule: &ScheduleRule) -> Self {
        Self {
            rule_id: Some(rule.id),
            slot: WeeklySlot::of_rule(rule),
        }
    }
}

/// Buffer conflicts of `proposed` against its nearest preceding and
/// succeeding neighbors. Overlapping neighbors are left to the overlap check.
#[must_use]
pub fn buffer_conflicts(
    kind: ConflictKind,
    proposed: &WeeklySlot,
    neighbors: &[Neighbor],
    required: u32,
) -> Vec<Conflict> {
    if required == 0 {
        return Vec::new();
    }
    let candidates: Vec<&Neighbor> = neighbors
        .iter()
        .filter(|n| !n.slot.overlaps(proposed))
        .collect();
    let preceding = candidates
        .iter()
        .map(|n| (proposed.gap_after(&n.slot), *n))
        .min_by_key(|(gap, n)| (*gap, n.rule_id));
    let succeeding = candidates
        .iter()
        .map(|n| (proposed.gap_before(&n.slot), *n))
        .min_by_key(|(gap, n)| (*gap, n.rule_id));

    let mut conflicts: Vec<Conflict> = Vec::new();
    for (side, found) in [("before", preceding), ("after", succeeding)] {
        let Some((gap, neighbor)) = found else {
            continue;
        };
        let required_i = i64::from(required);
        if gap >= required_i {
            continue;
        }
        if conflicts.iter().any(|c| c.rule_id == neighbor.rule_id && c.gap_minutes == Some(gap)) {
            continue;
        }
        let resource = if kind == ConflictKind::TeacherBuffer {
            "teacher"
        } else {
            "room"
        };
        conflicts.push(Conflict {
            kind,
            rule_id: neighbor.rule_id,
            message: format!(
                "{} gap {} the session is {} min, {} min required",
                resource, side, gap, required
            ),
            can_override: true,
            required_minutes: Some(required),
            gap_minutes: Some(gap),
            diff_minutes: Some(required_i - gap),
        });
    }
    conflicts
}

/// A session being validated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposedSlot {
    /// Center
    pub center_id: CenterId,
    /// Teacher, `None` = unassigned
    pub teacher_id: Option<TeacherId>,
    /// Room
    pub room_id: RoomId,
    /// Offering, for buffer lookup
    pub offering_id: OfferingId,
    /// Weekly position
    pub slot: WeeklySlot,
    /// Validity window
    pub effective_range: EffectiveRange,
    /// Rule to ignore (the one being edited)
    pub exclude_rule_id: Option<RuleId>,
}

impl ProposedSlot {
    /// Proposed slot for a rule as stored or patched
    #[must_use]
    pub fn of_rule(rule: &ScheduleRule) -> Self {
        Self {
            center_id: rule.center_id,
            teacher_id: rule.teacher_id,
            room_id: rule.room_id,
            offering_id: rule.offering_id,
            slot: WeeklySlot::of_rule(rule),
            effective_range: rule.effective_range,
            exclude_rule_id: None,
        }
    }

    /// Proposed slot for a rule not yet stored
    #[must_use]
    pub fn of_draft(draft: &RuleDraft) -> Self {
        Self {
            center_id: draft.center_id,
            teacher_id: draft.teacher_id,
            room_id: draft.room_id,
            offering_id: draft.offering_id,
            slot: WeeklySlot {
                weekday: draft.weekday,
                start_time: draft.start_time,
                end_time: draft.end_time,
            },
            effective_range: draft.effective_range,
            exclude_rule_id: None,
        }
    }

    /// Ignore a rule during checks
    #[must_use]
    pub fn excluding(mut self, rule_id: RuleId) -> Self {
        self.exclude_rule_id = Some(rule_id);
        self
    }
}

/// Composite validation outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    /// Whether the write may proceed
    pub valid: bool,
    /// Every conflict found
    pub conflicts: Vec<Conflict>,
}

impl ValidationResult {
    /// Hard overlaps
    pub fn overlaps(&self) -> impl Iterator<Item = &Conflict> {
        self.conflicts.iter().filter(|c| c.kind.is_overlap())
    }

    /// Buffer shortfalls
    pub fn buffer_shortfalls(&self) -> impl Iterator<Item = &Conflict> {
        self.conflicts.iter().filter(|c| !c.kind.is_overlap())
    }

    /// `Ok` when valid, else `Overlap` (preferred) or `Buffer`
    pub fn into_result(self) -> Result<()> {
        if self.valid {
            return Ok(());
        }
        let (overlaps, buffers): (Vec<Conflict>, Vec<Conflict>) =
            self.conflicts.into_iter().partition(|c| c.kind.is_overlap());
        if !overlaps.is_empty() {
            return Err(Error::Overlap {
                conflicts: overlaps,
            });
        }
        let deficit = buffers
            .iter()
            .filter_map(|c| c.diff_minutes)
            .max()
            .unwrap_or(0);
        Err(Error::Buffer {
            conflicts: buffers,
            deficit,
        })
    }
}

/// Checks proposed slots against the active rules of a center
#[derive(Clone)]
pub struct ConflictValidator {
    rules: Arc<dyn RuleRepository>,
    catalog: Arc<dyn CatalogRepository>,
}

impl ConflictValidator {
    /// Validator over repositories
    pub fn new(rules: Arc<dyn RuleRepository>, catalog: Arc<dyn CatalogRepository>) -> Self {
        Self { rules, catalog }
    }

    /// Active rules of the center sharing part of the proposal's validity window
    async fn concurrent_rules(&self, proposed: &ProposedSlot) -> Result<Vec<ScheduleRule>> {
        let rules = self.rules.list_by_center(proposed.center_id).await?;
        Ok(rules
            .into_iter()
            .filter(|r| {
                r.is_active
                    && Some(r.id) != proposed.exclude_rule_id
                    && r.effective_range.overlaps(&proposed.effective_range)
            })
            .collect())
    }

    /// Hard overlaps on the same teacher or the same room
    pub async fn check_overlap(&self, proposed: &ProposedSlot) -> Result<Vec<Conflict>> {
        let rules = self.concurrent_rules(proposed).await?;
        Ok(overlap_conflicts(proposed, &rules))
    }

    /// Teacher buffer shortfalls. Neighbors are derived from the teacher's
    /// rules when not supplied.
    pub async fn check_teacher_buffer(
        &self,
        proposed: &ProposedSlot,
        neighbors: Option<&[Neighbor]>,
    ) -> Result<Vec<Conflict>> {
        let Some(teacher_id) = proposed.teacher_id else {
            return Ok(Vec::new());
        };
        let policy = self.buffer_policy(proposed).await?;
        let derived;
        let neighbors = match neighbors {
            Some(n) => n,
            None => {
                derived = self
                    .concurrent_rules(proposed)
                    .await?
                    .iter()
                    .filter(|r| r.teacher_id == Some(teacher_id))
                    .map(Neighbor::of_rule)
                    .collect::<Vec<_>>();
                derived.as_slice()
            }
        };
        Ok(buffer_conflicts(
            ConflictKind::TeacherBuffer,
            &proposed.slot,
            neighbors,
            policy.teacher_min,
        ))
    }

    /// Room buffer shortfalls. Neighbors are derived from the room's rules
    /// when not supplied.
    pub async fn check_room_buffer(
        &self,
        proposed: &ProposedSlot,
        neighbors: Option<&[Neighbor]>,
    ) -> Result<Vec<Conflict>> {
        let policy = self.buffer_policy(proposed).await?;
        let derived;
        let neighbors = match neighbors {
            Some(n) => n,
            None => {
                derived = self
                    .concurrent_rules(proposed)
                    .await?
                    .iter()
                    .filter(|r| r.room_id == proposed.room_id)
                    .map(Neighbor::of_rule)
                    .collect::<Vec<_>>();
                derived.as_slice()
            }
        };
        Ok(buffer_conflicts(
            ConflictKind::RoomBuffer,
            &proposed.slot,
            neighbors,
            policy.room_min,
        ))
    }

    /// Overlap and buffer checks together. Overlaps always invalidate;
    /// buffer shortfalls invalidate unless `allow_buffer_override` is set.
    pub async fn validate_full(
        &self,
        proposed: &ProposedSlot,
        allow_buffer_override: bool,
    ) -> Result<ValidationResult> {
        let rules = self.concurrent_rules(proposed).await?;
        let policy = self.buffer_policy(proposed).await?;

        let mut conflicts = overlap_conflicts(proposed, &rules);
        if let Some(teacher_id) = proposed.teacher_id {
            let neighbors: Vec<Neighbor> = rules
                .iter()
                .filter(|r| r.teacher_id == Some(teacher_id))
                .map(Neighbor::of_rule)
                .collect();
            conflicts.extend(buffer_conflicts(
                ConflictKind::TeacherBuffer,
                &proposed.slot,
                &neighbors,
                policy.teacher_min,
            ));
        }
        let room_neighbors: Vec<Neighbor> = rules
            .iter()
            .filter(|r| r.room_id == proposed.room_id)
            .map(Neighbor::of_rule)
            .collect();
        conflicts.extend(buffer_conflicts(
            ConflictKind::RoomBuffer,
            &proposed.slot,
            &room_neighbors,
            policy.room_min,
        ));

        let has_overlap = conflicts.iter().any(|c| c.kind.is_overlap());
        let has_buffer = conflicts.iter().any(|c| !c.kind.is_overlap());
        let valid = !has_overlap && (!has_buffer || allow_buffer_override);
        debug!(
            center_id = proposed.center_id,
            conflicts = conflicts.len(),
            valid = valid,
            "Validated slot"
        );
        Ok(ValidationResult { valid, conflicts })
    }

    /// Buffer policy of the proposal's offering
    pub async fn buffer_policy(&self, proposed: &ProposedSlot) -> Result<BufferPolicy> {
        let offering = self
            .catalog
            .get_offering(proposed.center_id, proposed.offering_id)
            .await?;
        let course = self
            .catalog
            .get_course(proposed.center_id, offering.course_id)
            .await?;
        Ok(BufferPolicy::resolve(&offering, &course))
    }
}

fn overlap_conflicts(proposed: &ProposedSlot, rules: &[ScheduleRule]) -> Vec<Conflict> {
    let mut conflicts = Vec::new();
    for rule in rules {
        if !proposed.slot.overlaps(&WeeklySlot::of_rule(rule)) {
            continue;
        }
        if proposed.teacher_id.is_some() && rule.teacher_id == proposed.teacher_id {
            conflicts.push(overlap(ConflictKind::TeacherOverlap, rule, "teacher"));
        }
        if rule.room_id == proposed.room_id {
            conflicts.push(overlap(ConflictKind::RoomOverlap, rule, "room"));
        }
    }
    conflicts
}

fn overlap(kind: ConflictKind, rule: &ScheduleRule, resource: &str) -> Conflict {
    Conflict {
        kind,
        rule_id: Some(rule.id),
        message: format!(
            "{} already booked by rule {} ({} {}-{})",
            resource, rule.name, rule.weekday, rule.start_time, rule.end_time
        ),
        can_override: false,
        required_minutes: None,
        gap_minutes: None,
        diff_minutes: None,
    }
}

#[cfg(test)]
mod tests;
