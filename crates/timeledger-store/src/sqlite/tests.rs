use super::*;

use chrono::{Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};
use timeledger_core::calendar::parse_hhmm;
use timeledger_core::models::{
    Center, CenterMembership, CenterSettings, Course, ExceptionDraft, ExceptionStatus,
    MembershipRole, MembershipStatus, NewException, NewTeacher, Offering, PersonalEvent,
    Requester, Room, RuleDraft, ScheduleRule, StatusChange,
};
use timeledger_core::repository::{
    CatalogRepository, ExceptionRepository, HolidayRepository, MembershipRepository,
    PersonalEventRepository, ReadMarkerRepository, RuleRepository, RuleSplit,
};
use timeledger_core::{
    Actor, CoreConfig, EffectiveRange, ErrorKind, FixedClock, InMemoryCache, ScheduleService,
};

const CENTER: i64 = 1;
const COURSE: i64 = 10;
const OFFERING: i64 = 20;
const ROOM: i64 = 30;

fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

async fn seeded() -> SqliteStore {
    let store = SqliteStore::in_memory().await.unwrap();
    store
        .create_center(Center {
            id: CENTER,
            name: "North".to_string(),
            settings: CenterSettings::default(),
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    store
        .create_course(Course {
            id: COURSE,
            center_id: CENTER,
            name: "Piano".to_string(),
            default_duration: 60,
            color_hex: "#3366FF".to_string(),
            teacher_buffer_min: 0,
            room_buffer_min: 0,
        })
        .await
        .unwrap();
    store
        .create_offering(Offering {
            id: OFFERING,
            center_id: CENTER,
            course_id: COURSE,
            name: "Piano A".to_string(),
            default_room_id: Some(ROOM),
            default_teacher_id: None,
            allow_buffer_override: false,
            teacher_buffer_min: None,
            room_buffer_min: None,
        })
        .await
        .unwrap();
    store
        .create_room(Room {
            id: ROOM,
            center_id: CENTER,
            name: "Room 30".to_string(),
            capacity: 8,
        })
        .await
        .unwrap();
    store
}

async fn teacher(store: &SqliteStore, name: &str) -> i64 {
    let teacher = store
        .create_teacher(NewTeacher {
            name: name.to_string(),
            ..NewTeacher::default()
        })
        .await
        .unwrap();
    store
        .save(CenterMembership {
            id: 0,
            center_id: CENTER,
            teacher_id: teacher.id,
            role: MembershipRole::Teacher,
            status: MembershipStatus::Active,
        })
        .await
        .unwrap();
    teacher.id
}

fn monday_draft(teacher_id: i64) -> RuleDraft {
    RuleDraft {
        center_id: CENTER,
        offering_id: OFFERING,
        teacher_id: Some(teacher_id),
        room_id: ROOM,
        name: "Piano A weekly".to_string(),
        weekday: 1,
        start_time: parse_hhmm("10:00").unwrap(),
        end_time: parse_hhmm("11:00").unwrap(),
        effective_range: EffectiveRange::new(date("2026-01-05"), Some(date("2026-03-30"))),
        lock_at: None,
    }
}

fn pending(rule_id: i64, on: &str, teacher_id: i64) -> NewException {
    NewException {
        center_id: CENTER,
        draft: ExceptionDraft::cancel(rule_id, date(on), "sick"),
        status: ExceptionStatus::Pending,
        requested_by: Requester::Teacher(teacher_id),
        reviewed_by: None,
        reviewed_at: None,
    }
}

#[tokio::test]
async fn test_file_store_persists_across_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ledger.db");

    let rule_id = {
        let store = SqliteStore::from_path(&path, 2).await.unwrap();
        store
            .create_center(Center {
                id: CENTER,
                name: "North".to_string(),
                settings: CenterSettings::default(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let rule = RuleRepository::create(&store, monday_draft(7)).await.unwrap();
        store.close().await;
        rule.id
    };

    let store = SqliteStore::from_path(&path, 2).await.unwrap();
    assert!(store.health_check().await.unwrap());
    let rule = RuleRepository::get_by_id(&store, CENTER, rule_id).await.unwrap();
    assert_eq!(rule.start_time, parse_hhmm("10:00").unwrap());
    assert_eq!(rule.duration_minutes, 60);
    assert_eq!(store.get_center(CENTER).await.unwrap().name, "North");
}

#[tokio::test]
async fn test_rule_update_is_compare_and_set() {
    let store = seeded().await;
    let rule = RuleRepository::create(&store, monday_draft(7)).await.unwrap();

    let mut renamed = rule.clone();
    renamed.name = "Renamed".to_string();
    let stored = store.update(&renamed).await.unwrap();
    assert!(stored.updated_at > rule.updated_at);
    assert_eq!(stored.name, "Renamed");

    // The first token is now stale
    let err = store.update(&renamed).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConcurrentModified);

    let mut missing = stored.clone();
    missing.id = 999;
    let err = store.update(&missing).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

fn split_at(rule: &ScheduleRule, anchor: &str) -> RuleSplit {
    let mut original = rule.clone();
    let last_day = date(anchor) - ChronoDuration::days(1);
    original.effective_range = EffectiveRange::new(rule.effective_range.start_date, Some(last_day));
    RuleSplit {
        original,
        successor: RuleDraft {
            start_time: parse_hhmm("11:00").unwrap(),
            end_time: parse_hhmm("12:00").unwrap(),
            effective_range: EffectiveRange::new(date(anchor), rule.effective_range.end_date),
            ..monday_draft(7)
        },
        anchor: date(anchor),
    }
}

#[tokio::test]
async fn test_split_moves_open_exceptions_to_successor() {
    let store = seeded().await;
    let rule = RuleRepository::create(&store, monday_draft(7)).await.unwrap();
    let before = ExceptionRepository::create(&store, pending(rule.id, "2026-01-12", 7))
        .await
        .unwrap();
    let after = ExceptionRepository::create(&store, pending(rule.id, "2026-02-16", 7))
        .await
        .unwrap();
    let rejected = ExceptionRepository::create(
        &store,
        NewException {
            status: ExceptionStatus::Rejected,
            ..pending(rule.id, "2026-02-23", 7)
        },
    )
    .await
    .unwrap();

    let split = assert_ok!(store.split(split_at(&rule, "2026-02-09")).await);
    assert_eq!(split.original.effective_range.end_date, Some(date("2026-02-08")));
    assert!(split.original.updated_at > rule.updated_at);
    assert_eq!(split.successor.effective_range.start_date, date("2026-02-09"));
    assert_eq!(split.successor.start_time, parse_hhmm("11:00").unwrap());
    assert_eq!(split.migrated, vec![after.id]);

    let moved = ExceptionRepository::get_by_id(&store, CENTER, after.id).await.unwrap();
    assert_eq!(moved.rule_id, split.successor.id);
    assert!(moved.updated_at > after.updated_at);
    for id in [before.id, rejected.id] {
        let kept = ExceptionRepository::get_by_id(&store, CENTER, id).await.unwrap();
        assert_eq!(kept.rule_id, rule.id);
    }
    assert_eq!(store.list_by_center(CENTER).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_split_with_stale_token_writes_nothing() {
    let store = seeded().await;
    let rule = RuleRepository::create(&store, monday_draft(7)).await.unwrap();
    let open = ExceptionRepository::create(&store, pending(rule.id, "2026-02-16", 7))
        .await
        .unwrap();

    let mut renamed = rule.clone();
    renamed.name = "Renamed".to_string();
    store.update(&renamed).await.unwrap();

    let err = assert_err!(store.split(split_at(&rule, "2026-02-09")).await);
    assert_eq!(err.kind(), ErrorKind::ConcurrentModified);

    let rules = store.list_by_center(CENTER).await.unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].effective_range.end_date, Some(date("2026-03-30")));
    let kept = ExceptionRepository::get_by_id(&store, CENTER, open.id).await.unwrap();
    assert_eq!(kept.rule_id, rule.id);
    assert_eq!(kept.updated_at, open.updated_at);
}

#[tokio::test]
async fn test_rule_reads_are_center_scoped() {
    let store = seeded().await;
    let rule = RuleRepository::create(&store, monday_draft(7)).await.unwrap();

    let err = RuleRepository::get_by_id(&store, 2, rule.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(store.list_by_center(2).await.unwrap().is_empty());
    assert_eq!(store.list_by_teacher_and_center(7, CENTER).await.unwrap().len(), 1);
    assert_eq!(store.list_by_offering(CENTER, OFFERING).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_list_intersecting_skips_inactive_and_disjoint() {
    let store = seeded().await;
    let open_ended = RuleRepository::create(
        &store,
        RuleDraft {
            effective_range: EffectiveRange::new(date("2026-01-05"), None),
            ..monday_draft(7)
        },
    )
    .await
    .unwrap();
    let ended = RuleRepository::create(&store, monday_draft(8)).await.unwrap();
    store
        .set_active(CENTER, ended.id, false, ended.updated_at)
        .await
        .unwrap();

    let found = store
        .list_intersecting(CENTER, date("2026-06-01"), date("2026-06-30"))
        .await
        .unwrap();
    assert_eq!(found.iter().map(|r| r.id).collect::<Vec<_>>(), vec![open_ended.id]);
    assert!(store
        .list_intersecting(CENTER, date("2025-01-01"), date("2025-12-31"))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_one_open_exception_per_occurrence() {
    let store = seeded().await;
    let rule = RuleRepository::create(&store, monday_draft(7)).await.unwrap();

    let first = ExceptionRepository::create(&store, pending(rule.id, "2026-01-12", 7))
        .await
        .unwrap();
    let err = ExceptionRepository::create(&store, pending(rule.id, "2026-01-12", 7))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConcurrentModified);

    let open = store
        .get_by_rule_and_date(rule.id, date("2026-01-12"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(open.id, first.id);
    assert_eq!(open.requested_by, Requester::Teacher(7));

    // A rejected exception no longer blocks the occurrence
    let rejected = store
        .update_status(
            first.id,
            first.updated_at,
            StatusChange {
                to: ExceptionStatus::Rejected,
                reviewed_by: Some(900),
                reviewed_at: Some(Utc::now()),
                review_note: Some("no cover".to_string()),
            },
        )
        .await
        .unwrap();
    assert_eq!(rejected.review_note.as_deref(), Some("no cover"));
    assert!(store
        .get_by_rule_and_date(rule.id, date("2026-01-12"))
        .await
        .unwrap()
        .is_none());
    assert!(ExceptionRepository::create(&store, pending(rule.id, "2026-01-12", 7))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_update_status_keeps_review_fields_when_absent() {
    let store = seeded().await;
    let rule = RuleRepository::create(&store, monday_draft(7)).await.unwrap();
    let created = ExceptionRepository::create(&store, pending(rule.id, "2026-01-19", 7))
        .await
        .unwrap();

    let approved = store
        .update_status(
            created.id,
            created.updated_at,
            StatusChange {
                to: ExceptionStatus::Approved,
                reviewed_by: Some(900),
                reviewed_at: Some(Utc::now()),
                review_note: Some("ok".to_string()),
            },
        )
        .await
        .unwrap();
    let revoked = store
        .update_status(
            approved.id,
            approved.updated_at,
            StatusChange {
                to: ExceptionStatus::Revoked,
                reviewed_by: None,
                reviewed_at: None,
                review_note: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(revoked.status, ExceptionStatus::Revoked);
    assert_eq!(revoked.reviewed_by, Some(900));
    assert_eq!(revoked.review_note.as_deref(), Some("ok"));

    let err = store
        .update_status(
            created.id,
            created.updated_at,
            StatusChange {
                to: ExceptionStatus::Expired,
                reviewed_by: None,
                reviewed_at: None,
                review_note: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConcurrentModified);
}

#[tokio::test]
async fn test_update_fields_moves_exception_between_rules() {
    let store = seeded().await;
    let original = RuleRepository::create(&store, monday_draft(7)).await.unwrap();
    let successor = RuleRepository::create(&store, monday_draft(7)).await.unwrap();
    let exception = ExceptionRepository::create(&store, pending(original.id, "2026-02-16", 7))
        .await
        .unwrap();

    let mut moved = exception.clone();
    moved.rule_id = successor.id;
    let stored = store.update_fields(&moved).await.unwrap();
    assert_eq!(stored.rule_id, successor.id);

    let in_range = store
        .list_by_rules_in_range(
            &[original.id, successor.id],
            date("2026-02-01"),
            date("2026-02-28"),
        )
        .await
        .unwrap();
    assert_eq!(in_range.len(), 1);
    assert_eq!(in_range[0].rule_id, successor.id);
    assert!(store
        .list_by_rules_in_range(&[], date("2026-02-01"), date("2026-02-28"))
        .await
        .unwrap()
        .is_empty());

    let pending_all = store
        .list_by_status(None, ExceptionStatus::Pending)
        .await
        .unwrap();
    assert_eq!(pending_all.len(), 1);
    assert!(store
        .list_by_status(Some(2), ExceptionStatus::Pending)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_holiday_upsert_is_idempotent_by_date() {
    let store = seeded().await;
    let first = store
        .upsert(CENTER, date("2026-01-12"), "Founders Day")
        .await
        .unwrap();
    assert!(first.created);

    let second = store
        .upsert(CENTER, date("2026-01-12"), "Founders Day (observed)")
        .await
        .unwrap();
    assert!(!second.created);
    assert_eq!(second.holiday.id, first.holiday.id);
    assert_eq!(second.holiday.name, "Founders Day (observed)");

    let listed = store
        .list_by_center_in_range(CENTER, date("2026-01-01"), date("2026-01-31"))
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);

    HolidayRepository::delete(&store, first.holiday.id).await.unwrap();
    let err = HolidayRepository::delete(&store, first.holiday.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_membership_save_upserts_and_set_status() {
    let store = seeded().await;
    let teacher_id = teacher(&store, "Ada").await;

    let updated = store
        .save(CenterMembership {
            id: 0,
            center_id: CENTER,
            teacher_id,
            role: MembershipRole::Substitute,
            status: MembershipStatus::Active,
        })
        .await
        .unwrap();
    assert_eq!(updated.role, MembershipRole::Substitute);
    assert_eq!(store.get_active_by_teacher(teacher_id).await.unwrap().len(), 1);

    store
        .set_status(CENTER, teacher_id, MembershipStatus::Inactive)
        .await
        .unwrap();
    assert!(store.get_active_by_teacher(teacher_id).await.unwrap().is_empty());

    let err = store
        .set_status(2, teacher_id, MembershipStatus::Active)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_teacher_identity_lookup() {
    let store = seeded().await;
    let created = store
        .create_teacher(NewTeacher {
            name: "Ada".to_string(),
            identity_handle: Some("line:U123".to_string()),
            ..NewTeacher::default()
        })
        .await
        .unwrap();
    let found = store
        .find_teacher_by_identity("line:U123")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, created.id);
    assert!(store.find_teacher_by_identity("line:U999").await.unwrap().is_none());

    let err = store
        .create_teacher(NewTeacher {
            name: "Impostor".to_string(),
            identity_handle: Some("line:U123".to_string()),
            ..NewTeacher::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_personal_events_touching_range() {
    let store = seeded().await;
    let at = |d: &str, t: &str| parse_hhmm(t).unwrap().on(date(d));
    for (start, end) in [
        (at("2026-01-10", "22:00"), at("2026-01-11", "02:00")),
        (at("2026-01-20", "09:00"), at("2026-01-20", "10:00")),
    ] {
        PersonalEventRepository::create(
            &store,
            PersonalEvent {
                id: 0,
                teacher_id: 7,
                title: "Clinic".to_string(),
                start_at: start,
                end_at: end,
            },
        )
        .await
        .unwrap();
    }

    let touching = store
        .list_by_teacher_in_range(7, date("2026-01-11"), date("2026-01-15"))
        .await
        .unwrap();
    assert_eq!(touching.len(), 1);
    assert_eq!(touching[0].end_at, at("2026-01-11", "02:00"));
    assert!(store
        .list_by_teacher_in_range(8, date("2026-01-01"), date("2026-01-31"))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_read_markers_upsert_and_purge() {
    let store = seeded().await;
    let now = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();

    store
        .mark_read(7, "exception:1", now - ChronoDuration::days(40))
        .await
        .unwrap();
    let refreshed = store.mark_read(7, "exception:1", now).await.unwrap();
    assert_eq!(refreshed.read_at, now);
    store
        .mark_read(7, "exception:2", now - ChronoDuration::days(40))
        .await
        .unwrap();

    let removed = store
        .purge_older_than(now - ChronoDuration::days(30))
        .await
        .unwrap();
    assert_eq!(removed, 1);
}

#[tokio::test]
async fn test_service_expands_over_sqlite() {
    let store = seeded().await;
    let teacher_id = teacher(&store, "Ada").await;
    let clock = FixedClock(Utc.with_ymd_and_hms(2026, 1, 1, 2, 0, 0).unwrap());
    let service = ScheduleService::new(
        store.clone().repositories(),
        Arc::new(InMemoryCache::new()),
        &CoreConfig::default(),
    )
    .unwrap()
    .with_clock(Arc::new(clock));
    let admin = Actor::Admin {
        admin_id: 900,
        center_id: CENTER,
    };

    let rule = service
        .create_rule(&admin, monday_draft(teacher_id), false)
        .await
        .unwrap();
    service
        .upsert_holiday(&admin, CENTER, date("2026-01-12"), "Closed")
        .await
        .unwrap();

    let sessions = service
        .expand_center(CENTER, date("2026-01-05"), date("2026-01-26"))
        .await
        .unwrap();
    assert_eq!(sessions.len(), 4);
    assert!(sessions.iter().all(|s| s.rule_id == rule.id));
    assert_eq!(
        sessions.iter().filter(|s| s.is_holiday).map(|s| s.date).collect::<Vec<_>>(),
        vec![date("2026-01-12")]
    );
}
