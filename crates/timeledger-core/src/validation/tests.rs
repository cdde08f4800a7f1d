use super::*;
use crate::error::ErrorKind;
use crate::testing::{draft, time, Fixture, ROOM_B};

fn slot(weekday: u8, start: &str, end: &str) -> WeeklySlot {
    WeeklySlot {
        weekday,
        start_time: time(start),
        end_time: time(end),
    }
}

fn validator(fx: &Fixture) -> ConflictValidator {
    ConflictValidator::new(fx.repos.rules.clone(), fx.repos.catalog.clone())
}

#[test]
fn test_half_open_intervals_touching_do_not_overlap() {
    assert!(!slots_overlap(&slot(1, "09:00", "10:00"), &slot(1, "10:00", "11:00")));
    assert!(slots_overlap(&slot(1, "10:00", "11:00"), &slot(1, "10:30", "11:30")));
    assert!(!slots_overlap(&slot(1, "10:00", "11:00"), &slot(2, "10:00", "11:00")));
}

#[test]
fn test_overlap_is_symmetric() {
    let samples = [
        slot(1, "10:00", "11:00"),
        slot(1, "10:30", "11:30"),
        slot(1, "23:00", "01:00"),
        slot(2, "00:30", "02:00"),
        slot(7, "23:30", "00:30"),
        slot(1, "00:00", "00:45"),
        slot(3, "12:00", "00:00"),
    ];
    for a in &samples {
        for b in &samples {
            assert_eq!(slots_overlap(a, b), slots_overlap(b, a), "{:?} vs {:?}", a, b);
        }
    }
}

#[test]
fn test_cross_midnight_slot_is_one_interval() {
    let late = slot(1, "23:00", "01:00");
    assert!(late.overlaps(&slot(2, "00:30", "02:00")));
    assert!(!late.overlaps(&slot(2, "01:00", "02:00")));
    // Sunday night wraps into Monday morning
    assert!(slot(7, "23:30", "00:30").overlaps(&slot(1, "00:00", "00:45")));
}

#[test]
fn test_buffer_conflict_reports_gap_and_deficit() {
    let neighbors = [Neighbor {
        rule_id: Some(3),
        slot: slot(1, "08:00", "09:00"),
    }];
    let conflicts = buffer_conflicts(
        ConflictKind::TeacherBuffer,
        &slot(1, "09:10", "10:10"),
        &neighbors,
        15,
    );
    assert_eq!(conflicts.len(), 1);
    let c = &conflicts[0];
    assert!(c.can_override);
    assert_eq!(c.required_minutes, Some(15));
    assert_eq!(c.gap_minutes, Some(10));
    assert_eq!(c.diff_minutes, Some(5));
}

#[test]
fn test_buffer_ignores_distant_and_zero_requirement() {
    let neighbors = [Neighbor {
        rule_id: Some(3),
        slot: slot(1, "08:00", "09:00"),
    }];
    assert!(buffer_conflicts(
        ConflictKind::RoomBuffer,
        &slot(1, "09:30", "10:00"),
        &neighbors,
        15
    )
    .is_empty());
    assert!(buffer_conflicts(
        ConflictKind::RoomBuffer,
        &slot(1, "09:00", "10:00"),
        &neighbors,
        0
    )
    .is_empty());
}

#[test]
fn test_buffer_checks_following_session() {
    let neighbors = [Neighbor {
        rule_id: Some(9),
        slot: slot(4, "15:05", "16:00"),
    }];
    let conflicts = buffer_conflicts(
        ConflictKind::RoomBuffer,
        &slot(4, "14:00", "15:00"),
        &neighbors,
        10,
    );
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].gap_minutes, Some(5));
    assert!(conflicts[0].message.contains("after"));
}

#[tokio::test]
async fn test_same_room_overlap_is_hard_conflict() {
    let fx = Fixture::new().await;
    let existing = fx
        .repos
        .rules
        .create(draft(1, "10:00", "11:00", Some(fx.teachers[0])))
        .await
        .unwrap();

    let proposed = ProposedSlot::of_draft(&draft(1, "10:30", "11:30", Some(fx.teachers[1])));
    let result = validator(&fx).validate_full(&proposed, true).await.unwrap();
    assert!(!result.valid);
    let overlaps: Vec<_> = result.overlaps().collect();
    assert_eq!(overlaps.len(), 1);
    assert_eq!(overlaps[0].kind, ConflictKind::RoomOverlap);
    assert_eq!(overlaps[0].rule_id, Some(existing.id));
    assert!(!overlaps[0].can_override);

    let err = result.into_result().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Overlap);
}

#[tokio::test]
async fn test_same_teacher_overlap_in_other_room() {
    let fx = Fixture::new().await;
    fx.repos
        .rules
        .create(draft(1, "10:00", "11:00", Some(fx.teachers[0])))
        .await
        .unwrap();

    let mut other_room = draft(1, "10:30", "11:30", Some(fx.teachers[0]));
    other_room.room_id = ROOM_B;
    let conflicts = validator(&fx)
        .check_overlap(&ProposedSlot::of_draft(&other_room))
        .await
        .unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].kind, ConflictKind::TeacherOverlap);
}

#[tokio::test]
async fn test_excluded_rule_is_skipped() {
    let fx = Fixture::new().await;
    let existing = fx
        .repos
        .rules
        .create(draft(1, "10:00", "11:00", Some(fx.teachers[0])))
        .await
        .unwrap();
    let moved = ProposedSlot::of_draft(&draft(1, "10:15", "11:15", Some(fx.teachers[0])))
        .excluding(existing.id);
    assert!(validator(&fx).check_overlap(&moved).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_teacher_buffer_override_makes_result_valid() {
    let fx = Fixture::with_buffers(15, 0).await;
    let mut early = draft(1, "08:00", "09:00", Some(fx.teachers[0]));
    early.room_id = ROOM_B;
    fx.repos.rules.create(early).await.unwrap();

    let proposed = ProposedSlot::of_draft(&draft(1, "09:10", "10:10", Some(fx.teachers[0])));
    let v = validator(&fx);

    let strict = v.validate_full(&proposed, false).await.unwrap();
    assert!(!strict.valid);
    let shortfall: Vec<_> = strict.buffer_shortfalls().collect();
    assert_eq!(shortfall.len(), 1);
    assert!(shortfall[0].can_override);
    assert_eq!(shortfall[0].required_minutes, Some(15));
    assert_eq!(shortfall[0].diff_minutes, Some(5));
    let err = strict.into_result().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Buffer);
    assert_eq!(err.deficit(), Some(5));

    let relaxed = v.validate_full(&proposed, true).await.unwrap();
    assert!(relaxed.valid);
    assert!(relaxed.into_result().is_ok());
}

#[tokio::test]
async fn test_unassigned_rule_is_exempt_from_teacher_buffer() {
    let fx = Fixture::with_buffers(15, 0).await;
    let mut early = draft(1, "08:00", "09:00", None);
    early.room_id = ROOM_B;
    fx.repos.rules.create(early).await.unwrap();

    let proposed = ProposedSlot::of_draft(&draft(1, "09:05", "10:00", None));
    let conflicts = validator(&fx)
        .check_teacher_buffer(&proposed, None)
        .await
        .unwrap();
    assert!(conflicts.is_empty());
}

#[tokio::test]
async fn test_room_buffer_with_supplied_neighbors() {
    let fx = Fixture::with_buffers(0, 10).await;
    let proposed = ProposedSlot::of_draft(&draft(2, "14:00", "15:00", None));
    let neighbors = [Neighbor {
        rule_id: None,
        slot: slot(2, "13:00", "13:55"),
    }];
    let conflicts = validator(&fx)
        .check_room_buffer(&proposed, Some(&neighbors))
        .await
        .unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].kind, ConflictKind::RoomBuffer);
    assert_eq!(conflicts[0].diff_minutes, Some(5));
}
