//! Shared fixtures for unit tests

use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};

use crate::cache::{CategoryCache, ExpansionCache, ExpansionCacheConfig};
use crate::calendar::{parse_hhmm, Calendar, ClockTime, EffectiveRange, FixedClock, SharedClock};
use crate::config::CoreConfig;
use crate::exceptions::ExceptionService;
use crate::expansion::ExpansionEngine;
use crate::memory::{InMemoryCache, InMemoryRepository};
use crate::models::{
    Actor, Center, CenterMembership, CenterSettings, Course, MembershipRole, MembershipStatus,
    NewTeacher, Offering, Room, RuleDraft, TeacherId,
};
use crate::recurrence::RecurrenceEditor;
use crate::repository::{CatalogRepository, MembershipRepository, Repositories};
use crate::rule_lock::RuleLock;
use crate::rules::RuleStore;
use crate::service::ScheduleService;
use crate::validation::ConflictValidator;

pub(crate) const CENTER: i64 = 1;
pub(crate) const OTHER_CENTER: i64 = 2;
pub(crate) const COURSE: i64 = 10;
pub(crate) const OFFERING: i64 = 20;
pub(crate) const ROOM_A: i64 = 30;
pub(crate) const ROOM_B: i64 = 31;
pub(crate) const FOREIGN_ROOM: i64 = 32;
pub(crate) const ADMIN: i64 = 900;

pub(crate) fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

pub(crate) fn time(s: &str) -> ClockTime {
    parse_hhmm(s).unwrap()
}

pub(crate) fn at(day: &str, clock: &str) -> NaiveDateTime {
    time(clock).on(date(day))
}

/// Clock fixed at 10:00 center-local time on `day`
pub(crate) fn clock(day: &str) -> SharedClock {
    let local = at(day, "10:00");
    let utc = Calendar::default()
        .tz()
        .from_local_datetime(&local)
        .unwrap()
        .with_timezone(&Utc);
    Arc::new(FixedClock(utc))
}

pub(crate) fn admin() -> Actor {
    Actor::Admin {
        admin_id: ADMIN,
        center_id: CENTER,
    }
}

pub(crate) fn teacher(teacher_id: TeacherId) -> Actor {
    Actor::Teacher { teacher_id }
}

pub(crate) fn draft(weekday: u8, start: &str, end: &str, teacher_id: Option<TeacherId>) -> RuleDraft {
    RuleDraft {
        center_id: CENTER,
        offering_id: OFFERING,
        teacher_id,
        room_id: ROOM_A,
        name: "Piano".to_string(),
        weekday,
        start_time: time(start),
        end_time: time(end),
        effective_range: EffectiveRange::new(date("2026-01-01"), Some(date("2026-12-31"))),
        lock_at: None,
    }
}

pub(crate) struct Fixture {
    pub repos: Repositories,
    pub cache_store: Arc<InMemoryCache>,
    pub cache: ExpansionCache,
    /// Teachers 1 and 2 are active in the center, 3 only in the other one
    pub teachers: [TeacherId; 3],
}

impl Fixture {
    pub(crate) async fn new() -> Self {
        Self::with_buffers(0, 0).await
    }

    pub(crate) async fn with_buffers(teacher_min: u32, room_min: u32) -> Self {
        let repo = Arc::new(InMemoryRepository::new());
        let repos = Repositories::from_single(repo);

        let mut teachers = [0; 3];
        for (i, slot) in teachers.iter_mut().enumerate() {
            *slot = repos
                .catalog
                .create_teacher(NewTeacher {
                    name: format!("Teacher {}", i + 1),
                    ..NewTeacher::default()
                })
                .await
                .unwrap()
                .id;
        }

        for (id, name) in [(CENTER, "North"), (OTHER_CENTER, "South")] {
            repos
                .catalog
                .create_center(Center {
                    id,
                    name: name.to_string(),
                    settings: CenterSettings::default(),
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        repos
            .catalog
            .create_course(Course {
                id: COURSE,
                center_id: CENTER,
                name: "Piano".to_string(),
                default_duration: 60,
                color_hex: "#3366FF".to_string(),
                teacher_buffer_min: teacher_min,
                room_buffer_min: room_min,
            })
            .await
            .unwrap();
        repos
            .catalog
            .create_offering(Offering {
                id: OFFERING,
                center_id: CENTER,
                course_id: COURSE,
                name: "Piano A".to_string(),
                default_room_id: Some(ROOM_A),
                default_teacher_id: None,
                allow_buffer_override: true,
                teacher_buffer_min: None,
                room_buffer_min: None,
            })
            .await
            .unwrap();
        for (id, center_id) in [(ROOM_A, CENTER), (ROOM_B, CENTER), (FOREIGN_ROOM, OTHER_CENTER)] {
            repos
                .catalog
                .create_room(Room {
                    id,
                    center_id,
                    name: format!("Room {}", id),
                    capacity: 8,
                })
                .await
                .unwrap();
        }
        for (center_id, teacher_id) in [
            (CENTER, teachers[0]),
            (CENTER, teachers[1]),
            (OTHER_CENTER, teachers[2]),
        ] {
            repos
                .memberships
                .save(CenterMembership {
                    id: 0,
                    center_id,
                    teacher_id,
                    role: MembershipRole::Teacher,
                    status: MembershipStatus::Active,
                })
                .await
                .unwrap();
        }

        let cache_store = Arc::new(InMemoryCache::new());
        let cache = ExpansionCache::new(
            CategoryCache::new(cache_store.clone(), "test"),
            ExpansionCacheConfig::default(),
        );

        Self {
            repos,
            cache_store,
            cache,
            teachers,
        }
    }
}

impl Fixture {
    pub(crate) fn rule_store(&self) -> RuleStore {
        RuleStore::new(
            self.repos.rules.clone(),
            self.repos.catalog.clone(),
            self.repos.memberships.clone(),
            self.cache.clone(),
        )
    }

    pub(crate) fn validator(&self) -> ConflictValidator {
        ConflictValidator::new(self.repos.rules.clone(), self.repos.catalog.clone())
    }

    pub(crate) fn rule_lock(&self, clock: SharedClock) -> RuleLock {
        RuleLock::new(
            self.repos.catalog.clone(),
            self.repos.rules.clone(),
            Calendar::default(),
            clock,
            14,
        )
    }

    pub(crate) fn exception_service(&self, clock: SharedClock) -> ExceptionService {
        ExceptionService::new(
            self.repos.exceptions.clone(),
            self.rule_store(),
            self.validator(),
            self.rule_lock(clock.clone()),
            self.cache.clone(),
            Calendar::default(),
            clock,
        )
    }

    pub(crate) fn engine(&self) -> ExpansionEngine {
        ExpansionEngine::new(
            self.repos.rules.clone(),
            self.repos.exceptions.clone(),
            self.repos.holidays.clone(),
        )
    }

    pub(crate) fn editor(&self, clock: SharedClock) -> RecurrenceEditor {
        RecurrenceEditor::new(
            self.rule_store(),
            self.exception_service(clock.clone()),
            self.validator(),
            self.rule_lock(clock.clone()),
            self.engine(),
            Calendar::default(),
            clock,
        )
    }

    pub(crate) fn service(&self, clock: SharedClock) -> ScheduleService {
        let mut config = CoreConfig::default();
        config.cache.namespace = "svc".to_string();
        ScheduleService::new(self.repos.clone(), self.cache_store.clone(), &config)
            .unwrap()
            .with_clock(clock)
    }
}
