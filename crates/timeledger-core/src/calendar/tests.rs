use super::*;
use chrono::Weekday;

fn d(s: &str) -> NaiveDate {
    parse_ymd(s).unwrap()
}

fn t(s: &str) -> ClockTime {
    parse_hhmm(s).unwrap()
}

#[test]
fn test_parse_date_is_zone_anchored_midnight() {
    let cal = Calendar::default();
    let midnight = cal.parse_date("2026-01-05").unwrap();
    assert_eq!(midnight.date_naive(), d("2026-01-05"));
    assert_eq!(midnight.time(), NaiveTime::MIN);
    // Taipei is UTC+8 all year
    assert_eq!(
        midnight.with_timezone(&Utc).to_rfc3339(),
        "2026-01-04T16:00:00+00:00"
    );
}

#[test]
fn test_parse_date_rejects_garbage() {
    assert!(parse_ymd("2026/01/05").is_err());
    assert!(parse_ymd("2026-02-30").is_err());
    assert!(parse_ymd("").is_err());
}

#[test]
fn test_parse_hhmm_formats() {
    assert_eq!(t("09:05"), ClockTime::from_hm(9, 5).unwrap());
    assert_eq!(t("23:59:00"), ClockTime::from_hm(23, 59).unwrap());
    assert_eq!(t("24:00"), ClockTime::END_OF_DAY);

    for bad in ["9:05", "25:00", "10:60", "10:00:30", "10-00", "ab:cd", "24:30", ""] {
        let err = parse_hhmm(bad).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation, "{}", bad);
    }
}

#[test]
fn test_clock_time_serializes_as_hhmm() {
    let json = serde_json::to_string(&t("14:00")).unwrap();
    assert_eq!(json, "\"14:00\"");
    let back: ClockTime = serde_json::from_str("\"07:30:00\"").unwrap();
    assert_eq!(back, t("07:30"));
}

#[test]
fn test_weekday_normalization() {
    // 2026-01-05 is a Monday
    assert_eq!(weekday_of(d("2026-01-05")), 1);
    assert_eq!(weekday_of(d("2026-01-10")), 6);
    assert_eq!(weekday_of(d("2026-01-11")), 7);

    let mut date = d("2024-01-01");
    for _ in 0..800 {
        let w = weekday_of(date);
        assert!((1..=7).contains(&w));
        assert_eq!(w == 7, date.weekday() == Weekday::Sun);
        date = date.succ_opt().unwrap();
    }
}

#[test]
fn test_duration_minutes() {
    assert_eq!(duration_minutes(t("10:00"), t("11:00")), 60);
    assert_eq!(duration_minutes(t("22:00"), t("01:30")), 210);
    assert_eq!(duration_minutes(t("10:00"), t("10:00")), 1440);
    assert_eq!(duration_minutes(t("23:00"), t("00:00")), 60);
    assert_eq!(duration_minutes(t("23:00"), t("24:00")), 60);
}

#[test]
fn test_crosses_midnight() {
    assert!(crosses_midnight(t("22:00"), t("01:00")));
    assert!(!crosses_midnight(t("22:00"), t("00:00")));
    assert!(!crosses_midnight(t("10:00"), t("11:00")));
}

#[test]
fn test_each_date_in_range_is_restartable() {
    let span = each_date_in_range(d("2026-01-30"), d("2026-02-02"));
    let first: Vec<_> = span.iter().collect();
    let second: Vec<_> = span.into_iter().collect();
    assert_eq!(first, second);
    assert_eq!(
        first,
        vec![d("2026-01-30"), d("2026-01-31"), d("2026-02-01"), d("2026-02-02")]
    );
    assert_eq!(span.len(), 4);

    let empty = each_date_in_range(d("2026-02-02"), d("2026-01-30"));
    assert!(empty.is_empty());
    assert_eq!(empty.iter().count(), 0);
}

#[test]
fn test_span_weekdays() {
    let span = each_date_in_range(d("2026-01-05"), d("2026-01-26"));
    let mondays: Vec<_> = span.weekdays(1).collect();
    assert_eq!(
        mondays,
        vec![d("2026-01-05"), d("2026-01-12"), d("2026-01-19"), d("2026-01-26")]
    );
    let sundays: Vec<_> = span.weekdays(7).collect();
    assert_eq!(sundays, vec![d("2026-01-11"), d("2026-01-18"), d("2026-01-25")]);
}

#[test]
fn test_effective_range_intersection() {
    let range = EffectiveRange::new(d("2026-01-05"), Some(d("2026-03-30")));
    assert!(range.intersects(d("2026-03-30"), d("2026-04-30")));
    assert!(!range.intersects(d("2026-03-31"), d("2026-04-30")));
    assert!(!range.intersects(d("2025-12-01"), d("2026-01-04")));

    let open = EffectiveRange::new(d("2026-01-05"), None);
    assert!(open.intersects(d("2030-01-01"), d("2030-01-31")));

    let span = range.clamp(d("2026-03-01"), d("2026-12-31")).unwrap();
    assert_eq!(span.start(), d("2026-03-01"));
    assert_eq!(span.end(), d("2026-03-30"));
}

#[test]
fn test_effective_range_overlaps() {
    let a = EffectiveRange::new(d("2026-01-01"), Some(d("2026-01-31")));
    let b = EffectiveRange::new(d("2026-01-31"), None);
    let c = EffectiveRange::new(d("2026-02-01"), Some(d("2026-02-28")));
    assert!(a.overlaps(&b));
    assert!(b.overlaps(&a));
    assert!(!a.overlaps(&c));
    assert!(b.overlaps(&c));
}

#[test]
fn test_calendar_from_name() {
    assert!(Calendar::from_name("Europe/Berlin").is_ok());
    assert!(Calendar::from_name("Mars/Olympus").is_err());
}

#[test]
fn test_clock_time_on_end_of_day_rolls_over() {
    let dt = ClockTime::END_OF_DAY.on(d("2026-01-05"));
    assert_eq!(dt, d("2026-01-06").and_time(NaiveTime::MIN));
}
