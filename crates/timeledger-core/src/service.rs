//! Schedule service
//!
//! The entrypoint the outer layers call. It composes the rule store,
//! exception workflow, recurrence editor, holiday service and expansion
//! cache over one set of repositories, and runs every operation inside the
//! panic recovery boundary.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, info};

use crate::cache::{center_key, teacher_key, CategoryCache, ExpansionCache};
use crate::calendar::{Calendar, ClockTime, EffectiveRange, SharedClock, SystemClock};
use crate::config::CoreConfig;
use crate::dispatch::NotificationDispatcher;
use crate::error::{guard, Error, ErrorKind, Result};
use crate::exceptions::{ExceptionService, ExpireReport, ReviewDecision};
use crate::expansion::{ExpandedSchedule, ExpansionEngine, ExpansionQuery};
use crate::holiday::{BulkHolidayReport, HolidayEntry, HolidayService};
use crate::models::{
    Actor, CenterHoliday, CenterId, CenterMembership, ExceptionDraft, ExceptionId,
    ExceptionStatus, HolidayId, MembershipStatus, OfferingId, PersonalEvent, RuleDraft, RuleId,
    ScheduleException, ScheduleRule, TeacherId, TermId,
};
use crate::recurrence::{
    DeleteOutcome, DeleteRequest, EditOutcome, EditPreview, EditRequest, RecurrenceEditor,
};
use crate::repository::{CacheStore, Repositories};
use crate::rule_lock::{LockStatus, RuleLock};
use crate::rules::{PhaseTransition, RuleStore};
use crate::validation::{ConflictValidator, ProposedSlot, ValidationResult};

/// One entry of a teacher's merged calendar
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "source", content = "item", rename_all = "snake_case")]
pub enum TeacherScheduleItem {
    /// Session expanded from a center's rules
    Session(ExpandedSchedule),
    /// The teacher's own event
    Personal(PersonalEvent),
}

impl TeacherScheduleItem {
    fn sort_key(&self) -> (NaiveDate, ClockTime) {
        match self {
            Self::Session(s) => (s.date, s.start_time),
            Self::Personal(e) => (e.start_at.date(), ClockTime::of(e.start_at)),
        }
    }
}

/// A rule that was not copied into the target term
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedCopy {
    /// Source rule
    pub rule_id: RuleId,
    /// Error code of the refusal
    pub code: &'static str,
    /// Why
    pub reason: String,
}

/// Result of copying a term's rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CopyReport {
    /// Term copied from
    pub source_term_id: TermId,
    /// Term copied into
    pub target_term_id: TermId,
    /// New rules
    pub copied: Vec<ScheduleRule>,
    /// Rules left out
    pub skipped: Vec<SkippedCopy>,
}

/// Facade over the schedule engine
#[derive(Clone)]
pub struct ScheduleService {
    repos: Repositories,
    cache: ExpansionCache,
    calendar: Calendar,
    clock: SharedClock,
    default_lead_days: i64,
    dispatcher: Option<Arc<NotificationDispatcher>>,
    engine: ExpansionEngine,
    rules: RuleStore,
    validator: ConflictValidator,
    lock: RuleLock,
    exceptions: ExceptionService,
    editor: RecurrenceEditor,
    holidays: HolidayService,
}

impl ScheduleService {
    /// Service over repositories and a cache store, using the system clock
    pub fn new(
        repos: Repositories,
        cache_store: Arc<dyn CacheStore>,
        config: &CoreConfig,
    ) -> Result<Self> {
        config.validate()?;
        let cache = ExpansionCache::new(
            CategoryCache::new(cache_store, config.cache.namespace.clone()),
            config.expansion_cache(),
        );
        Ok(Self::assemble(
            repos,
            cache,
            config.calendar()?,
            Arc::new(SystemClock),
            config.center.exception_lead_days,
            None,
        ))
    }

    /// Replace the clock
    #[must_use]
    pub fn with_clock(self, clock: SharedClock) -> Self {
        Self::assemble(
            self.repos,
            self.cache,
            self.calendar,
            clock,
            self.default_lead_days,
            self.dispatcher,
        )
    }

    /// Emit workflow notifications through a dispatcher
    #[must_use]
    pub fn with_dispatcher(self, dispatcher: Arc<NotificationDispatcher>) -> Self {
        Self::assemble(
            self.repos,
            self.cache,
            self.calendar,
            self.clock,
            self.default_lead_days,
            Some(dispatcher),
        )
    }

    fn assemble(
        repos: Repositories,
        cache: ExpansionCache,
        calendar: Calendar,
        clock: SharedClock,
        default_lead_days: i64,
        dispatcher: Option<Arc<NotificationDispatcher>>,
    ) -> Self {
        let engine = ExpansionEngine::new(
            repos.rules.clone(),
            repos.exceptions.clone(),
            repos.holidays.clone(),
        );
        let rules = RuleStore::new(
            repos.rules.clone(),
            repos.catalog.clone(),
            repos.memberships.clone(),
            cache.clone(),
        );
        let validator = ConflictValidator::new(repos.rules.clone(), repos.catalog.clone());
        let lock = RuleLock::new(
            repos.catalog.clone(),
            repos.rules.clone(),
            calendar,
            clock.clone(),
            default_lead_days,
        );
        let mut exceptions = ExceptionService::new(
            repos.exceptions.clone(),
            rules.clone(),
            validator.clone(),
            lock.clone(),
            cache.clone(),
            calendar,
            clock.clone(),
        );
        if let Some(dispatcher) = &dispatcher {
            exceptions = exceptions.with_notifier(dispatcher.clone());
        }
        let editor = RecurrenceEditor::new(
            rules.clone(),
            exceptions.clone(),
            validator.clone(),
            lock.clone(),
            engine.clone(),
            calendar,
            clock.clone(),
        );
        let holidays = HolidayService::new(repos.holidays.clone(), cache.clone());

        Self {
            repos,
            cache,
            calendar,
            clock,
            default_lead_days,
            dispatcher,
            engine,
            rules,
            validator,
            lock,
            exceptions,
            editor,
            holidays,
        }
    }

    /// Deployment calendar
    #[must_use]
    pub fn calendar(&self) -> Calendar {
        self.calendar
    }

    /// Exception workflow, for wiring background jobs
    #[must_use]
    pub fn exception_service(&self) -> &ExceptionService {
        &self.exceptions
    }

    /// Expansion engine, for wiring background jobs
    #[must_use]
    pub fn engine(&self) -> &ExpansionEngine {
        &self.engine
    }

    // ---- expansion ----

    /// Sessions of a center over `[start, end]`, served from cache when
    /// possible
    pub async fn expand_center(
        &self,
        center_id: CenterId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<ExpandedSchedule>> {
        guard("expand_center", async {
            let query = ExpansionQuery::center(center_id, start, end);
            query.validate()?;
            let engine = &self.engine;
            self.cache
                .get_or_load(center_key(center_id, start, end), move || async move {
                    engine.expand(&query).await
                })
                .await
        })
        .await
    }

    /// Sessions of one teacher in one center over `[start, end]`, cached
    pub async fn expand_teacher(
        &self,
        teacher_id: TeacherId,
        center_id: CenterId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<ExpandedSchedule>> {
        guard("expand_teacher", self.expand_teacher_cached(teacher_id, center_id, start, end))
            .await
    }

    async fn expand_teacher_cached(
        &self,
        teacher_id: TeacherId,
        center_id: CenterId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<ExpandedSchedule>> {
        let query = ExpansionQuery::center(center_id, start, end).with_teacher(teacher_id);
        query.validate()?;
        let engine = &self.engine;
        self.cache
            .get_or_load(
                teacher_key(teacher_id, center_id, start, end),
                move || async move { engine.expand(&query).await },
            )
            .await
    }

    /// Expansion straight from the repositories, bypassing the cache
    pub async fn expand_fresh(&self, query: &ExpansionQuery) -> Result<Vec<ExpandedSchedule>> {
        guard("expand_fresh", self.engine.expand(query)).await
    }

    /// A teacher's sessions across every center with an active membership,
    /// merged with their personal events and ordered by date and start
    pub async fn teacher_schedule(
        &self,
        teacher_id: TeacherId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<TeacherScheduleItem>> {
        guard("teacher_schedule", async {
            let memberships = self.repos.memberships.get_active_by_teacher(teacher_id).await?;
            let mut items = Vec::new();
            for membership in memberships.iter().filter(|m| m.is_active()) {
                let sessions = self
                    .expand_teacher_cached(teacher_id, membership.center_id, start, end)
                    .await?;
                items.extend(sessions.into_iter().map(TeacherScheduleItem::Session));
            }
            let events = self
                .repos
                .personal_events
                .list_by_teacher_in_range(teacher_id, start, end)
                .await?;
            items.extend(events.into_iter().map(TeacherScheduleItem::Personal));
            items.sort_by_key(TeacherScheduleItem::sort_key);
            debug!(
                teacher_id = teacher_id,
                centers = memberships.len(),
                items = items.len(),
                "Teacher schedule merged"
            );
            Ok(items)
        })
        .await
    }

    // ---- rules ----

    /// Validate a new rule against overlaps and buffers, then persist it
    pub async fn create_rule(
        &self,
        actor: &Actor,
        draft: RuleDraft,
        override_buffer: bool,
    ) -> Result<ScheduleRule> {
        guard("create_rule", async {
            actor.require_admin(draft.center_id)?;
            self.create_checked(draft, override_buffer).await
        })
        .await
    }

    async fn create_checked(&self, draft: RuleDraft, override_buffer: bool) -> Result<ScheduleRule> {
        draft.validate()?;
        let proposed = ProposedSlot::of_draft(&draft);
        let policy = self.validator.buffer_policy(&proposed).await?;
        self.validator
            .validate_full(&proposed, override_buffer && policy.allow_override)
            .await?
            .into_result()?;
        self.rules.create(draft).await
    }

    /// Overlap and buffer report for a draft without writing anything
    pub async fn validate_rule(
        &self,
        draft: &RuleDraft,
        override_buffer: bool,
    ) -> Result<ValidationResult> {
        guard("validate_rule", async {
            draft.validate()?;
            let proposed = ProposedSlot::of_draft(draft);
            let policy = self.validator.buffer_policy(&proposed).await?;
            self.validator
                .validate_full(&proposed, override_buffer && policy.allow_override)
                .await
        })
        .await
    }

    /// Rule by id
    pub async fn get_rule(&self, center_id: CenterId, rule_id: RuleId) -> Result<ScheduleRule> {
        guard("get_rule", self.rules.get(center_id, rule_id)).await
    }

    /// Active rules of a center
    pub async fn list_rules(&self, center_id: CenterId) -> Result<Vec<ScheduleRule>> {
        guard("list_rules", self.rules.list_by_center(center_id)).await
    }

    /// Active rules of a teacher in a center
    pub async fn list_teacher_rules(
        &self,
        teacher_id: TeacherId,
        center_id: CenterId,
    ) -> Result<Vec<ScheduleRule>> {
        guard("list_teacher_rules", self.rules.list_by_teacher(teacher_id, center_id)).await
    }

    /// Edit a series
    pub async fn edit_rule(
        &self,
        actor: &Actor,
        center_id: CenterId,
        request: &EditRequest,
    ) -> Result<EditOutcome> {
        guard("edit_rule", self.editor.edit(actor, center_id, request)).await
    }

    /// Delete part or all of a series
    pub async fn delete_rule(
        &self,
        actor: &Actor,
        center_id: CenterId,
        request: &DeleteRequest,
    ) -> Result<DeleteOutcome> {
        guard("delete_rule", self.editor.delete(actor, center_id, request)).await
    }

    /// Sessions an edit would touch
    pub async fn preview_edit(
        &self,
        center_id: CenterId,
        request: &EditRequest,
    ) -> Result<EditPreview> {
        guard("preview_edit", self.editor.preview(center_id, request)).await
    }

    /// Lock state of one occurrence
    pub async fn check_rule_lock(
        &self,
        center_id: CenterId,
        rule_id: RuleId,
        date: NaiveDate,
    ) -> Result<LockStatus> {
        guard("check_rule_lock", self.lock.check(center_id, rule_id, date)).await
    }

    /// Rule of an offering governing `date`
    pub async fn effective_rule_for_date(
        &self,
        center_id: CenterId,
        offering_id: OfferingId,
        date: NaiveDate,
    ) -> Result<Option<ScheduleRule>> {
        guard(
            "effective_rule_for_date",
            self.rules.effective_rule_for_date(center_id, offering_id, date),
        )
        .await
    }

    /// Phase boundaries of an offering
    pub async fn phase_transitions(
        &self,
        center_id: CenterId,
        offering_id: OfferingId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PhaseTransition>> {
        guard(
            "phase_transitions",
            self.rules.phase_transitions(center_id, offering_id, start, end),
        )
        .await
    }

    /// Duplicate every active rule intersecting the source term into the
    /// target term's dates. Copies that fail validation are skipped.
    pub async fn copy_term_rules(
        &self,
        actor: &Actor,
        center_id: CenterId,
        source_term_id: TermId,
        target_term_id: TermId,
    ) -> Result<CopyReport> {
        guard("copy_term_rules", async {
            actor.require_admin(center_id)?;
            let source = self.repos.catalog.get_term(center_id, source_term_id).await?;
            let target = self.repos.catalog.get_term(center_id, target_term_id).await?;
            let target_range = EffectiveRange::new(target.start_date, Some(target.end_date));
            if !target_range.is_valid() {
                return Err(Error::validation(format!(
                    "term {} ends before it starts",
                    target.id
                )));
            }

            let originals = self
                .rules
                .list_intersecting(center_id, source.start_date, source.end_date)
                .await?;
            let mut report = CopyReport {
                source_term_id,
                target_term_id,
                copied: Vec::new(),
                skipped: Vec::new(),
            };

            for rule in originals {
                let draft = RuleDraft {
                    center_id,
                    offering_id: rule.offering_id,
                    teacher_id: rule.teacher_id,
                    room_id: rule.room_id,
                    name: rule.name.clone(),
                    weekday: rule.weekday,
                    start_time: rule.start_time,
                    end_time: rule.end_time,
                    effective_range: target_range,
                    lock_at: None,
                };
                match self.create_checked(draft, false).await {
                    Ok(copy) => report.copied.push(copy),
                    Err(e) if e.kind() == ErrorKind::System => return Err(e),
                    Err(e) => {
                        debug!(rule_id = rule.id, error = %e, "Rule not copied");
                        report.skipped.push(SkippedCopy {
                            rule_id: rule.id,
                            code: e.kind().code(),
                            reason: e.to_string(),
                        });
                    }
                }
            }

            info!(
                center_id = center_id,
                source_term_id = source_term_id,
                target_term_id = target_term_id,
                copied = report.copied.len(),
                skipped = report.skipped.len(),
                "Term rules copied"
            );
            Ok(report)
        })
        .await
    }

    // ---- exceptions ----

    /// File a change request for one occurrence
    pub async fn submit_exception(
        &self,
        actor: &Actor,
        center_id: CenterId,
        draft: ExceptionDraft,
    ) -> Result<ScheduleException> {
        guard("submit_exception", self.exceptions.submit(actor, center_id, draft)).await
    }

    /// Record an admin change that is approved on creation
    pub async fn create_approved_exception(
        &self,
        actor: &Actor,
        center_id: CenterId,
        draft: ExceptionDraft,
        override_buffer: bool,
    ) -> Result<ScheduleException> {
        guard(
            "create_approved_exception",
            self.exceptions
                .create_approved(actor, center_id, draft, override_buffer),
        )
        .await
    }

    /// Approve or reject a pending request
    pub async fn review_exception(
        &self,
        actor: &Actor,
        center_id: CenterId,
        id: ExceptionId,
        decision: ReviewDecision,
        note: Option<String>,
    ) -> Result<ScheduleException> {
        guard(
            "review_exception",
            self.exceptions.review(actor, center_id, id, decision, note),
        )
        .await
    }

    /// Withdraw a request or reverse an approval
    pub async fn revoke_exception(
        &self,
        actor: &Actor,
        center_id: CenterId,
        id: ExceptionId,
    ) -> Result<ScheduleException> {
        guard("revoke_exception", self.exceptions.revoke(actor, center_id, id)).await
    }

    /// Exception by id
    pub async fn get_exception(
        &self,
        center_id: CenterId,
        id: ExceptionId,
    ) -> Result<ScheduleException> {
        guard("get_exception", self.exceptions.get(center_id, id)).await
    }

    /// Pending requests of a center
    pub async fn list_pending_exceptions(
        &self,
        center_id: CenterId,
    ) -> Result<Vec<ScheduleException>> {
        guard("list_pending_exceptions", self.exceptions.list_pending(center_id)).await
    }

    /// Exceptions of a center in one status
    pub async fn list_exceptions_by_status(
        &self,
        center_id: CenterId,
        status: ExceptionStatus,
    ) -> Result<Vec<ScheduleException>> {
        guard(
            "list_exceptions_by_status",
            self.exceptions.list_by_status(center_id, status),
        )
        .await
    }

    /// Exceptions of a rule within `[start, end]`
    pub async fn list_rule_exceptions(
        &self,
        center_id: CenterId,
        rule_id: RuleId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<ScheduleException>> {
        guard(
            "list_rule_exceptions",
            self.exceptions.list_for_rule(center_id, rule_id, start, end),
        )
        .await
    }

    /// Expire overdue pending requests
    pub async fn expire_overdue_exceptions(&self) -> Result<ExpireReport> {
        guard("expire_overdue_exceptions", self.exceptions.expire_overdue()).await
    }

    // ---- holidays ----

    /// Holidays of a center within `[start, end]`
    pub async fn list_holidays(
        &self,
        center_id: CenterId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<CenterHoliday>> {
        guard("list_holidays", self.holidays.list(center_id, start, end)).await
    }

    /// Add or rename a holiday
    pub async fn upsert_holiday(
        &self,
        actor: &Actor,
        center_id: CenterId,
        date: NaiveDate,
        name: &str,
    ) -> Result<CenterHoliday> {
        guard("upsert_holiday", self.holidays.upsert(actor, center_id, date, name)).await
    }

    /// Insert several holidays, skipping dates that already have one
    pub async fn bulk_create_holidays(
        &self,
        actor: &Actor,
        center_id: CenterId,
        entries: &[HolidayEntry],
    ) -> Result<BulkHolidayReport> {
        guard(
            "bulk_create_holidays",
            self.holidays.bulk_create(actor, center_id, entries),
        )
        .await
    }

    /// Delete a holiday
    pub async fn delete_holiday(
        &self,
        actor: &Actor,
        center_id: CenterId,
        id: HolidayId,
    ) -> Result<()> {
        guard("delete_holiday", self.holidays.delete(actor, center_id, id)).await
    }

    // ---- memberships ----

    /// Activate or deactivate a teacher in a center
    pub async fn set_membership_status(
        &self,
        actor: &Actor,
        center_id: CenterId,
        teacher_id: TeacherId,
        status: MembershipStatus,
    ) -> Result<CenterMembership> {
        guard("set_membership_status", async {
            actor.require_admin(center_id)?;
            let membership = self
                .repos
                .memberships
                .set_status(center_id, teacher_id, status)
                .await?;
            info!(
                center_id = center_id,
                teacher_id = teacher_id,
                status = ?status,
                "Membership status changed"
            );
            self.cache.invalidate(center_id, &[teacher_id]).await;
            Ok(membership)
        })
        .await
    }
}
