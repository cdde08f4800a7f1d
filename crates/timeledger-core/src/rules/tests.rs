use super::*;
use crate::repository::CacheStore;
use crate::testing::{date, draft, time, Fixture, CENTER, FOREIGN_ROOM, OFFERING, ROOM_B};

fn store(fx: &Fixture) -> RuleStore {
    RuleStore::new(
        fx.repos.rules.clone(),
        fx.repos.catalog.clone(),
        fx.repos.memberships.clone(),
        fx.cache.clone(),
    )
}

fn ranged(d: RuleDraft, from: &str, to: Option<&str>) -> RuleDraft {
    RuleDraft {
        effective_range: EffectiveRange::new(date(from), to.map(date)),
        ..d
    }
}

#[tokio::test]
async fn test_create_rejects_invalid_shape() {
    let fx = Fixture::new().await;
    let mut bad = draft(8, "10:00", "11:00", None);
    let err = store(&fx).create(bad.clone()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    bad.weekday = 1;
    bad.end_time = time("10:00");
    let err = store(&fx).create(bad).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_create_rejects_foreign_room_and_inactive_teacher() {
    let fx = Fixture::new().await;
    let mut foreign = draft(1, "10:00", "11:00", None);
    foreign.room_id = FOREIGN_ROOM;
    let err = store(&fx).create(foreign).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RuleConflict);

    // Teacher 3 is only a member of the other center
    let err = store(&fx)
        .create(draft(1, "10:00", "11:00", Some(fx.teachers[2])))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RuleConflict);
}

#[tokio::test]
async fn test_create_computes_duration_for_cross_midnight() {
    let fx = Fixture::new().await;
    let rule = store(&fx)
        .create(draft(5, "22:30", "01:00", Some(fx.teachers[0])))
        .await
        .unwrap();
    assert_eq!(rule.duration_minutes, 150);
    assert!(rule.crosses_midnight());
}

#[tokio::test]
async fn test_list_by_center_orders_by_weekday_then_start() {
    let fx = Fixture::new().await;
    let s = store(&fx);
    let wed = s.create(draft(3, "09:00", "10:00", None)).await.unwrap();
    let mon_late = s.create(draft(1, "15:00", "16:00", None)).await.unwrap();
    let mon_early = s.create(draft(1, "08:00", "09:00", None)).await.unwrap();

    let ids: Vec<_> = s
        .list_by_center(CENTER)
        .await
        .unwrap()
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(ids, vec![mon_early.id, mon_late.id, wed.id]);
}

#[tokio::test]
async fn test_list_by_teacher_filters() {
    let fx = Fixture::new().await;
    let s = store(&fx);
    let mine = s
        .create(draft(1, "08:00", "09:00", Some(fx.teachers[0])))
        .await
        .unwrap();
    s.create(draft(1, "10:00", "11:00", Some(fx.teachers[1])))
        .await
        .unwrap();
    let listed = s.list_by_teacher(fx.teachers[0], CENTER).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, mine.id);
}

#[tokio::test]
async fn test_update_applies_whitelisted_fields() {
    let fx = Fixture::new().await;
    let s = store(&fx);
    let rule = s.create(draft(1, "10:00", "11:00", None)).await.unwrap();

    let patch = RulePatch::default()
        .with_times(time("11:00"), time("12:30"))
        .with_room(ROOM_B)
        .with_teacher(Some(fx.teachers[1]));
    let updated = s
        .update(CENTER, rule.id, &patch, Some(rule.updated_at))
        .await
        .unwrap();
    assert_eq!(updated.start_time, time("11:00"));
    assert_eq!(updated.duration_minutes, 90);
    assert_eq!(updated.room_id, ROOM_B);
    assert_eq!(updated.teacher_id, Some(fx.teachers[1]));
    assert_eq!(updated.offering_id, OFFERING);

    // Stale token
    let err = s
        .update(CENTER, rule.id, &patch, Some(rule.updated_at))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConcurrentModified);
}

#[tokio::test]
async fn test_update_revalidates_ownership() {
    let fx = Fixture::new().await;
    let s = store(&fx);
    let rule = s.create(draft(1, "10:00", "11:00", None)).await.unwrap();
    let err = s
        .update(CENTER, rule.id, &RulePatch::default().with_room(FOREIGN_ROOM), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RuleConflict);
}

#[tokio::test]
async fn test_deactivate_hides_rule_and_clears_cache() {
    let fx = Fixture::new().await;
    let s = store(&fx);
    let rule = s.create(draft(1, "10:00", "11:00", None)).await.unwrap();
    fx.cache_store
        .set_with_ttl(
            "test:schedule:expand:center:1:start:x:end:y",
            "[]".to_string(),
            std::time::Duration::from_secs(60),
        )
        .await
        .unwrap();

    let gone = s.deactivate(CENTER, rule.id).await.unwrap();
    assert!(!gone.is_active);
    assert!(s.list_by_center(CENTER).await.unwrap().is_empty());
    assert!(fx.cache_store.is_empty());
    // Still readable by id
    assert!(s.get(CENTER, rule.id).await.is_ok());
}

#[tokio::test]
async fn test_effective_rule_prefers_latest_phase() {
    let fx = Fixture::new().await;
    let s = store(&fx);
    let old = s
        .create(ranged(draft(1, "10:00", "11:00", None), "2026-01-01", None))
        .await
        .unwrap();
    let new = s
        .create(ranged(draft(1, "11:00", "12:00", None), "2026-03-02", None))
        .await
        .unwrap();

    let jan = s
        .effective_rule_for_date(CENTER, OFFERING, date("2026-01-12"))
        .await
        .unwrap();
    assert_eq!(jan.map(|r| r.id), Some(old.id));
    let mar = s
        .effective_rule_for_date(CENTER, OFFERING, date("2026-03-09"))
        .await
        .unwrap();
    assert_eq!(mar.map(|r| r.id), Some(new.id));
    // Tuesday has no session
    let tue = s
        .effective_rule_for_date(CENTER, OFFERING, date("2026-03-10"))
        .await
        .unwrap();
    assert!(tue.is_none());
}

#[tokio::test]
async fn test_phase_transitions_report_changes_and_gaps() {
    let fx = Fixture::new().await;
    let s = store(&fx);
    let first = s
        .create(ranged(
            draft(1, "10:00", "11:00", None),
            "2026-01-05",
            Some("2026-01-31"),
        ))
        .await
        .unwrap();
    let mut moved = ranged(
        draft(1, "11:00", "12:00", None),
        "2026-02-01",
        Some("2026-02-14"),
    );
    moved.room_id = ROOM_B;
    let second = s.create(moved).await.unwrap();
    let third = s
        .create(ranged(draft(2, "11:00", "12:00", None), "2026-03-01", None))
        .await
        .unwrap();

    let phases = s
        .phase_transitions(CENTER, OFFERING, date("2026-01-01"), date("2026-03-10"))
        .await
        .unwrap();
    let summary: Vec<_> = phases.iter().map(|p| (p.date, p.kind)).collect();
    assert_eq!(
        summary,
        vec![
            (date("2026-01-05"), TransitionKind::Start),
            (date("2026-02-01"), TransitionKind::Change),
            (date("2026-02-15"), TransitionKind::Gap),
            (date("2026-03-01"), TransitionKind::Resume),
        ]
    );
    assert_eq!(phases[0].rule_ids, vec![first.id]);
    assert_eq!(
        phases[1].changed,
        vec![PhaseAttribute::Rule, PhaseAttribute::Room, PhaseAttribute::Time]
    );
    assert_eq!(phases[1].rule_ids, vec![second.id]);
    assert!(phases[2].rule_ids.is_empty());
    assert_eq!(phases[3].rule_ids, vec![third.id]);
}

#[test]
fn test_patch_emptiness() {
    assert!(RulePatch::default().is_empty());
    let patch = RulePatch {
        name: Some("x".to_string()),
        ..RulePatch::default()
    };
    assert!(!patch.is_empty());
    assert!(!patch.touches_slot());
    assert!(RulePatch::default().with_room(1).touches_slot());
}
