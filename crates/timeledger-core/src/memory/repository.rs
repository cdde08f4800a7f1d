use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::{
    Center, CenterHoliday, CenterId, CenterMembership, Course, CourseId, ExceptionId,
    ExceptionStatus, HolidayId, MembershipStatus, NewException, NewTeacher, Offering, OfferingId,
    PersonalEvent, ReadMarker, Room, RoomId, RuleDraft, RuleId, ScheduleException, ScheduleRule,
    StatusChange, Teacher, TeacherId, Term, TermId,
};
use crate::repository::{
    CatalogRepository, ExceptionRepository, HolidayRepository, HolidayUpsert,
    MembershipRepository, PersonalEventRepository, ReadMarkerRepository, RuleRepository, RuleSplit,
    SplitResult,
};

#[derive(Default)]
struct State {
    next_id: i64,
    centers: BTreeMap<CenterId, Center>,
    courses: BTreeMap<CourseId, Course>,
    offerings: BTreeMap<OfferingId, Offering>,
    rooms: BTreeMap<RoomId, Room>,
    terms: BTreeMap<TermId, Term>,
    teachers: BTreeMap<TeacherId, Teacher>,
    memberships: Vec<CenterMembership>,
    rules: BTreeMap<RuleId, ScheduleRule>,
    exceptions: BTreeMap<ExceptionId, ScheduleException>,
    holidays: BTreeMap<HolidayId, CenterHoliday>,
    personal_events: BTreeMap<i64, PersonalEvent>,
    read_markers: BTreeMap<i64, ReadMarker>,
}

impl State {
    fn allocate(&mut self, requested: i64) -> i64 {
        if requested > 0 {
            self.next_id = self.next_id.max(requested);
            requested
        } else {
            self.next_id += 1;
            self.next_id
        }
    }

    fn insert_rule(&mut self, draft: RuleDraft) -> ScheduleRule {
        let now = Utc::now();
        let id = self.allocate(0);
        let rule = ScheduleRule {
            id,
            center_id: draft.center_id,
            offering_id: draft.offering_id,
            teacher_id: draft.teacher_id,
            room_id: draft.room_id,
            duration_minutes: draft.duration_minutes(),
            name: draft.name,
            weekday: draft.weekday,
            start_time: draft.start_time,
            end_time: draft.end_time,
            effective_range: draft.effective_range,
            lock_at: draft.lock_at,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        self.rules.insert(id, rule.clone());
        rule
    }

    fn blocking_exception(&self, rule_id: RuleId, date: NaiveDate) -> Option<&ScheduleException> {
        self.exceptions.values().find(|e| {
            e.rule_id == rule_id && e.original_date == date && e.status.is_blocking()
        })
    }
}

/// Next concurrency token, strictly after the previous one
fn next_token(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > previous {
        now
    } else {
        previous + Duration::microseconds(1)
    }
}

/// All repositories over one in-process state
#[derive(Default)]
pub struct InMemoryRepository {
    state: RwLock<State>,
}

impl InMemoryRepository {
    /// Empty repository
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RuleRepository for InMemoryRepository {
    async fn create(&self, draft: RuleDraft) -> Result<ScheduleRule> {
        let mut state = self.state.write().await;
        let rule = state.insert_rule(draft);
        debug!(rule_id = rule.id, center_id = rule.center_id, "Rule created");
        Ok(rule)
    }

    async fn get_by_id(&self, center_id: CenterId, id: RuleId) -> Result<ScheduleRule> {
        let state = self.state.read().await;
        state
            .rules
            .get(&id)
            .filter(|r| r.center_id == center_id)
            .cloned()
            .ok_or_else(|| Error::not_found("rule", id))
    }

    async fn update(&self, rule: &ScheduleRule) -> Result<ScheduleRule> {
        let mut state = self.state.write().await;
        let stored = state
            .rules
            .get_mut(&rule.id)
            .filter(|r| r.center_id == rule.center_id)
            .ok_or_else(|| Error::not_found("rule", rule.id))?;
        if stored.updated_at != rule.updated_at {
            return Err(Error::concurrent("rule", rule.id));
        }
        let mut next = rule.clone();
        next.created_at = stored.created_at;
        next.updated_at = next_token(stored.updated_at);
        *stored = next.clone();
        Ok(next)
    }

    async fn list_by_center(&self, center_id: CenterId) -> Result<Vec<ScheduleRule>> {
        let state = self.state.read().await;
        Ok(state
            .rules
            .values()
            .filter(|r| r.center_id == center_id && r.is_active)
            .cloned()
            .collect())
    }

    async fn list_by_teacher_and_center(
        &self,
        teacher_id: TeacherId,
        center_id: CenterId,
    ) -> Result<Vec<ScheduleRule>> {
        let state = self.state.read().await;
        Ok(state
            .rules
            .values()
            .filter(|r| {
                r.center_id == center_id && r.is_active && r.teacher_id == Some(teacher_id)
            })
            .cloned()
            .collect())
    }

    async fn list_intersecting(
        &self,
        center_id: CenterId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<ScheduleRule>> {
        let state = self.state.read().await;
        Ok(state
            .rules
            .values()
            .filter(|r| {
                r.center_id == center_id && r.is_active && r.effective_range.intersects(start, end)
            })
            .cloned()
            .collect())
    }

    async fn list_by_offering(
        &self,
        center_id: CenterId,
        offering_id: OfferingId,
    ) -> Result<Vec<ScheduleRule>> {
        let state = self.state.read().await;
        Ok(state
            .rules
            .values()
            .filter(|r| r.center_id == center_id && r.is_active && r.offering_id == offering_id)
            .cloned()
            .collect())
    }

    async fn set_active(
        &self,
        center_id: CenterId,
        id: RuleId,
        active: bool,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<ScheduleRule> {
        let mut state = self.state.write().await;
        let stored = state
            .rules
            .get_mut(&id)
            .filter(|r| r.center_id == center_id)
            .ok_or_else(|| Error::not_found("rule", id))?;
        if stored.updated_at != expected_updated_at {
            return Err(Error::concurrent("rule", id));
        }
        stored.is_active = active;
        stored.updated_at = next_token(stored.updated_at);
        Ok(stored.clone())
    }

    async fn split(&self, split: RuleSplit) -> Result<SplitResult> {
        // Every check runs before the first write
        let mut state = self.state.write().await;
        let RuleSplit {
            original,
            successor,
            anchor,
        } = split;
        let stored = state
            .rules
            .get(&original.id)
            .filter(|r| r.center_id == original.center_id)
            .ok_or_else(|| Error::not_found("rule", original.id))?;
        if stored.updated_at != original.updated_at {
            return Err(Error::concurrent("rule", original.id));
        }

        let mut next = original;
        next.created_at = stored.created_at;
        next.updated_at = next_token(stored.updated_at);
        state.rules.insert(next.id, next.clone());
        let successor = state.insert_rule(successor);

        let mut migrated = Vec::new();
        for exception in state.exceptions.values_mut() {
            if exception.rule_id == next.id
                && exception.original_date >= anchor
                && exception.status.is_blocking()
            {
                exception.rule_id = successor.id;
                exception.updated_at = next_token(exception.updated_at);
                migrated.push(exception.id);
            }
        }
        debug!(
            rule_id = next.id,
            successor_id = successor.id,
            migrated = migrated.len(),
            "Rule split"
        );
        Ok(SplitResult {
            original: next,
            successor,
            migrated,
        })
    }
}

#[async_trait]
impl ExceptionRepository for InMemoryRepository {
    async fn create(&self, exception: NewException) -> Result<ScheduleException> {
        let mut state = self.state.write().await;
        let draft = exception.draft;
        if exception.status.is_blocking()
            && state
                .blocking_exception(draft.rule_id, draft.original_date)
                .is_some()
        {
            return Err(Error::concurrent(
                "exception",
                format!("{}@{}", draft.rule_id, draft.original_date),
            ));
        }
        let now = Utc::now();
        let id = state.allocate(0);
        let row = ScheduleException {
            id,
            center_id: exception.center_id,
            rule_id: draft.rule_id,
            original_date: draft.original_date,
            exception_type: draft.exception_type,
            status: exception.status,
            new_start_at: draft.new_start_at,
            new_end_at: draft.new_end_at,
            new_teacher_id: draft.new_teacher_id,
            new_room_id: draft.new_room_id,
            reason: draft.reason,
            requested_by: exception.requested_by,
            reviewed_by: exception.reviewed_by,
            reviewed_at: exception.reviewed_at,
            review_note: None,
            created_at: now,
            updated_at: now,
        };
        state.exceptions.insert(id, row.clone());
        Ok(row)
    }

    async fn get_by_id(&self, center_id: CenterId, id: ExceptionId) -> Result<ScheduleException> {
        let state = self.state.read().await;
        state
            .exceptions
            .get(&id)
            .filter(|e| e.center_id == center_id)
            .cloned()
            .ok_or_else(|| Error::not_found("exception", id))
    }

    async fn get_by_rule_and_date(
        &self,
        rule_id: RuleId,
        date: NaiveDate,
    ) -> Result<Option<ScheduleException>> {
        let state = self.state.read().await;
        Ok(state.blocking_exception(rule_id, date).cloned())
    }

    async fn list_by_rules_in_range(
        &self,
        rule_ids: &[RuleId],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<ScheduleException>> {
        let state = self.state.read().await;
        Ok(state
            .exceptions
            .values()
            .filter(|e| {
                rule_ids.contains(&e.rule_id) && e.original_date >= start && e.original_date <= end
            })
            .cloned()
            .collect())
    }

    async fn list_by_status(
        &self,
        center_id: Option<CenterId>,
        status: ExceptionStatus,
    ) -> Result<Vec<ScheduleException>> {
        let state = self.state.read().await;
        Ok(state
            .exceptions
            .values()
            .filter(|e| e.status == status && center_id.map_or(true, |c| e.center_id == c))
            .cloned()
            .collect())
    }

    async fn update_status(
        &self,
        id: ExceptionId,
        expected_updated_at: DateTime<Utc>,
        change: StatusChange,
    ) -> Result<ScheduleException> {
        let mut state = self.state.write().await;
        let stored = state
            .exceptions
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("exception", id))?;
        if stored.updated_at != expected_updated_at {
            return Err(Error::concurrent("exception", id));
        }
        stored.status = change.to;
        stored.reviewed_by = change.reviewed_by.or(stored.reviewed_by);
        stored.reviewed_at = change.reviewed_at.or(stored.reviewed_at);
        if change.review_note.is_some() {
            stored.review_note = change.review_note;
        }
        stored.updated_at = next_token(stored.updated_at);
        Ok(stored.clone())
    }

    async fn update_fields(&self, exception: &ScheduleException) -> Result<ScheduleException> {
        let mut state = self.state.write().await;
        let current = state
            .exceptions
            .get(&exception.id)
            .ok_or_else(|| Error::not_found("exception", exception.id))?;
        if current.updated_at != exception.updated_at {
            return Err(Error::concurrent("exception", exception.id));
        }
        let created_at = current.created_at;
        let previous_token = current.updated_at;
        if exception.status.is_blocking() {
            let clash = state.exceptions.values().any(|e| {
                e.id != exception.id
                    && e.rule_id == exception.rule_id
                    && e.original_date == exception.original_date
                    && e.status.is_blocking()
            });
            if clash {
                return Err(Error::concurrent("exception", exception.id));
            }
        }
        let mut next = exception.clone();
        next.created_at = created_at;
        next.updated_at = next_token(previous_token);
        state.exceptions.insert(next.id, next.clone());
        Ok(next)
    }
}

#[async_trait]
impl HolidayRepository for InMemoryRepository {
    async fn list_by_center_in_range(
        &self,
        center_id: CenterId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<CenterHoliday>> {
        let state = self.state.read().await;
        let mut rows: Vec<CenterHoliday> = state
            .holidays
            .values()
            .filter(|h| h.center_id == center_id && h.date >= start && h.date <= end)
            .cloned()
            .collect();
        rows.sort_by_key(|h| h.date);
        Ok(rows)
    }

    async fn upsert(&self, center_id: CenterId, date: NaiveDate, name: &str) -> Result<HolidayUpsert> {
        let mut state = self.state.write().await;
        if let Some(existing) = state
            .holidays
            .values_mut()
            .find(|h| h.center_id == center_id && h.date == date)
        {
            existing.name = name.to_string();
            return Ok(HolidayUpsert {
                holiday: existing.clone(),
                created: false,
            });
        }
        let id = state.allocate(0);
        let holiday = CenterHoliday {
            id,
            center_id,
            date,
            name: name.to_string(),
        };
        state.holidays.insert(id, holiday.clone());
        Ok(HolidayUpsert {
            holiday,
            created: true,
        })
    }

    async fn get_by_id(&self, id: HolidayId) -> Result<CenterHoliday> {
        let state = self.state.read().await;
        state
            .holidays
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("holiday", id))
    }

    async fn delete(&self, id: HolidayId) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .holidays
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("holiday", id))
    }
}

#[async_trait]
impl MembershipRepository for InMemoryRepository {
    async fn get_active_by_teacher(&self, teacher_id: TeacherId) -> Result<Vec<CenterMembership>> {
        let state = self.state.read().await;
        Ok(state
            .memberships
            .iter()
            .filter(|m| m.teacher_id == teacher_id && m.is_active())
            .cloned()
            .collect())
    }

    async fn get_by_center_and_teacher(
        &self,
        center_id: CenterId,
        teacher_id: TeacherId,
    ) -> Result<Option<CenterMembership>> {
        let state = self.state.read().await;
        Ok(state
            .memberships
            .iter()
            .find(|m| m.center_id == center_id && m.teacher_id == teacher_id)
            .cloned())
    }

    async fn save(&self, membership: CenterMembership) -> Result<CenterMembership> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.memberships.iter_mut().find(|m| {
            m.center_id == membership.center_id && m.teacher_id == membership.teacher_id
        }) {
            existing.role = membership.role;
            existing.status = membership.status;
            return Ok(existing.clone());
        }
        let mut membership = membership;
        membership.id = state.allocate(membership.id);
        state.memberships.push(membership.clone());
        Ok(membership)
    }

    async fn set_status(
        &self,
        center_id: CenterId,
        teacher_id: TeacherId,
        status: MembershipStatus,
    ) -> Result<CenterMembership> {
        let mut state = self.state.write().await;
        let membership = state
            .memberships
            .iter_mut()
            .find(|m| m.center_id == center_id && m.teacher_id == teacher_id)
            .ok_or_else(|| Error::not_found("membership", format!("{}/{}", center_id, teacher_id)))?;
        membership.status = status;
        Ok(membership.clone())
    }
}

#[async_trait]
impl CatalogRepository for InMemoryRepository {
    async fn get_center(&self, id: CenterId) -> Result<Center> {
        let state = self.state.read().await;
        state
            .centers
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("center", id))
    }

    async fn list_centers(&self) -> Result<Vec<Center>> {
        let state = self.state.read().await;
        Ok(state.centers.values().cloned().collect())
    }

    async fn create_center(&self, center: Center) -> Result<Center> {
        let mut state = self.state.write().await;
        let mut center = center;
        center.id = state.allocate(center.id);
        state.centers.insert(center.id, center.clone());
        Ok(center)
    }

    async fn get_course(&self, center_id: CenterId, id: CourseId) -> Result<Course> {
        let state = self.state.read().await;
        state
            .courses
            .get(&id)
            .filter(|c| c.center_id == center_id)
            .cloned()
            .ok_or_else(|| Error::not_found("course", id))
    }

    async fn create_course(&self, course: Course) -> Result<Course> {
        let mut state = self.state.write().await;
        let mut course = course;
        course.id = state.allocate(course.id);
        state.courses.insert(course.id, course.clone());
        Ok(course)
    }

    async fn get_offering(&self, center_id: CenterId, id: OfferingId) -> Result<Offering> {
        let state = self.state.read().await;
        state
            .offerings
            .get(&id)
            .filter(|o| o.center_id == center_id)
            .cloned()
            .ok_or_else(|| Error::not_found("offering", id))
    }

    async fn create_offering(&self, offering: Offering) -> Result<Offering> {
        let mut state = self.state.write().await;
        let mut offering = offering;
        offering.id = state.allocate(offering.id);
        state.offerings.insert(offering.id, offering.clone());
        Ok(offering)
    }

    async fn get_room(&self, center_id: CenterId, id: RoomId) -> Result<Room> {
        let state = self.state.read().await;
        state
            .rooms
            .get(&id)
            .filter(|r| r.center_id == center_id)
            .cloned()
            .ok_or_else(|| Error::not_found("room", id))
    }

    async fn create_room(&self, room: Room) -> Result<Room> {
        let mut state = self.state.write().await;
        let mut room = room;
        room.id = state.allocate(room.id);
        state.rooms.insert(room.id, room.clone());
        Ok(room)
    }

    async fn get_term(&self, center_id: CenterId, id: TermId) -> Result<Term> {
        let state = self.state.read().await;
        state
            .terms
            .get(&id)
            .filter(|t| t.center_id == center_id)
            .cloned()
            .ok_or_else(|| Error::not_found("term", id))
    }

    async fn create_term(&self, term: Term) -> Result<Term> {
        let mut state = self.state.write().await;
        let mut term = term;
        term.id = state.allocate(term.id);
        state.terms.insert(term.id, term.clone());
        Ok(term)
    }

    async fn get_teacher(&self, id: TeacherId) -> Result<Teacher> {
        let state = self.state.read().await;
        state
            .teachers
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("teacher", id))
    }

    async fn find_teacher_by_identity(&self, handle: &str) -> Result<Option<Teacher>> {
        let state = self.state.read().await;
        Ok(state
            .teachers
            .values()
            .find(|t| t.identity_handle.as_deref() == Some(handle))
            .cloned())
    }

    async fn create_teacher(&self, teacher: NewTeacher) -> Result<Teacher> {
        let mut state = self.state.write().await;
        let id = state.allocate(0);
        let teacher = Teacher {
            id,
            name: teacher.name,
            identity_handle: teacher.identity_handle,
            email: teacher.email,
            phone: teacher.phone,
            open_to_hiring: teacher.open_to_hiring,
            created_at: Utc::now(),
        };
        state.teachers.insert(id, teacher.clone());
        Ok(teacher)
    }
}

#[async_trait]
impl PersonalEventRepository for InMemoryRepository {
    async fn list_by_teacher_in_range(
        &self,
        teacher_id: TeacherId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PersonalEvent>> {
        let state = self.state.read().await;
        Ok(state
            .personal_events
            .values()
            .filter(|e| {
                e.teacher_id == teacher_id
                    && e.start_at.date() <= end
                    && e.end_at.date() >= start
            })
            .cloned()
            .collect())
    }

    async fn create(&self, event: PersonalEvent) -> Result<PersonalEvent> {
        let mut state = self.state.write().await;
        let mut event = event;
        event.id = state.allocate(event.id);
        state.personal_events.insert(event.id, event.clone());
        Ok(event)
    }
}

#[async_trait]
impl ReadMarkerRepository for InMemoryRepository {
    async fn mark_read(
        &self,
        teacher_id: TeacherId,
        item_key: &str,
        at: DateTime<Utc>,
    ) -> Result<ReadMarker> {
        let mut state = self.state.write().await;
        if let Some(existing) = state
            .read_markers
            .values_mut()
            .find(|m| m.teacher_id == teacher_id && m.item_key == item_key)
        {
            existing.read_at = at;
            return Ok(existing.clone());
        }
        let id = state.allocate(0);
        let marker = ReadMarker {
            id,
            teacher_id,
            item_key: item_key.to_string(),
            read_at: at,
        };
        state.read_markers.insert(id, marker.clone());
        Ok(marker)
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.write().await;
        let before = state.read_markers.len();
        state.read_markers.retain(|_, m| m.read_at >= cutoff);
        Ok((before - state.read_markers.len()) as u64)
    }
}
