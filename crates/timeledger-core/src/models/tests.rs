use super::*;
use crate::calendar::{parse_hhmm, parse_ymd};

fn draft() -> RuleDraft {
    RuleDraft {
        center_id: 1,
        offering_id: 1,
        teacher_id: Some(1),
        room_id: 1,
        name: "Piano A".to_string(),
        weekday: 1,
        start_time: parse_hhmm("10:00").unwrap(),
        end_time: parse_hhmm("11:00").unwrap(),
        effective_range: EffectiveRange::new(parse_ymd("2026-01-05").unwrap(), None),
        lock_at: None,
    }
}

#[test]
fn test_rule_draft_validation() {
    assert!(draft().validate().is_ok());

    let mut bad = draft();
    bad.weekday = 0;
    assert!(bad.validate().is_err());
    bad.weekday = 8;
    assert!(bad.validate().is_err());

    let mut range = draft();
    range.effective_range.end_date = Some(parse_ymd("2026-01-01").unwrap());
    assert!(range.validate().is_err());

    let mut unnamed = draft();
    unnamed.name = "  ".to_string();
    assert!(unnamed.validate().is_err());
}

#[test]
fn test_cross_midnight_draft_is_valid() {
    let mut night = draft();
    night.start_time = parse_hhmm("22:00").unwrap();
    night.end_time = parse_hhmm("01:00").unwrap();
    assert!(night.validate().is_ok());
    assert_eq!(night.duration_minutes(), 180);
}

#[test]
fn test_equal_start_and_end_is_a_full_day() {
    let mut day_long = draft();
    day_long.end_time = day_long.start_time;
    assert!(day_long.validate().is_ok());
    assert_eq!(day_long.duration_minutes(), 1440);
    assert!(crate::calendar::crosses_midnight(day_long.start_time, day_long.end_time));
}

#[test]
fn test_exception_status_terminality() {
    assert!(!ExceptionStatus::Pending.is_terminal());
    assert!(!ExceptionStatus::Approved.is_terminal());
    assert!(ExceptionStatus::Rejected.is_terminal());
    assert!(ExceptionStatus::Revoked.is_terminal());
    assert!(ExceptionStatus::Expired.is_terminal());
    assert!(ExceptionStatus::Approved.is_blocking());
    assert!(!ExceptionStatus::Expired.is_blocking());
}

#[test]
fn test_exception_enums_round_trip_wire_names() {
    for status in [
        ExceptionStatus::Pending,
        ExceptionStatus::Approved,
        ExceptionStatus::Rejected,
        ExceptionStatus::Revoked,
        ExceptionStatus::Expired,
    ] {
        assert_eq!(status.as_str().parse::<ExceptionStatus>().unwrap(), status);
    }
    assert_eq!(
        serde_json::to_string(&ExceptionType::ReplaceTeacher).unwrap(),
        "\"REPLACE_TEACHER\""
    );
}

#[test]
fn test_exception_draft_validation() {
    let date = parse_ymd("2026-01-19").unwrap();
    assert!(ExceptionDraft::cancel(1, date, "sick").validate().is_ok());

    let mut reschedule = ExceptionDraft::reschedule(
        1,
        date,
        date.and_hms_opt(14, 0, 0).unwrap(),
        date.and_hms_opt(15, 0, 0).unwrap(),
    );
    assert!(reschedule.validate().is_ok());
    reschedule.new_end_at = reschedule.new_start_at;
    assert!(reschedule.validate().is_err());

    let mut replace = ExceptionDraft::replace_teacher(1, date, 9);
    assert!(replace.validate().is_ok());
    replace.new_teacher_id = None;
    assert!(replace.validate().is_err());
}

#[test]
fn test_buffer_policy_falls_back_to_course() {
    let course = Course {
        id: 1,
        center_id: 1,
        name: "Piano".to_string(),
        default_duration: 60,
        color_hex: "#336699".to_string(),
        teacher_buffer_min: 15,
        room_buffer_min: 10,
    };
    let mut offering = Offering {
        id: 1,
        center_id: 1,
        course_id: 1,
        name: "Piano Mon".to_string(),
        default_room_id: None,
        default_teacher_id: None,
        allow_buffer_override: true,
        teacher_buffer_min: None,
        room_buffer_min: Some(0),
    };
    let policy = BufferPolicy::resolve(&offering, &course);
    assert_eq!(policy.teacher_min, 15);
    assert_eq!(policy.room_min, 0);
    assert!(policy.allow_override);

    offering.teacher_buffer_min = Some(30);
    assert_eq!(BufferPolicy::resolve(&offering, &course).teacher_min, 30);
}

#[test]
fn test_actor_admin_scope() {
    let admin = Actor::Admin {
        admin_id: 5,
        center_id: 1,
    };
    assert!(admin.is_admin_of(1));
    assert_eq!(admin.require_admin(1).unwrap(), 5);
    assert!(admin.require_admin(2).is_err());
    assert!(Actor::Teacher { teacher_id: 1 }.require_admin(1).is_err());
}
