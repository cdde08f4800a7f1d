//! Column codecs and row conversion

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use timeledger_core::models::{
    Center, CenterHoliday, CenterMembership, Course, MembershipRole, MembershipStatus, Offering,
    PersonalEvent, ReadMarker, Requester, Room, ScheduleException, ScheduleRule, Teacher, Term,
};
use timeledger_core::{ClockTime, EffectiveRange};

use crate::error::{Result, StoreError};

const DATE_FORMAT: &str = "%Y-%m-%d";
const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub(crate) fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(entity: &'static str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::corrupt(entity, format!("timestamp {:?}: {}", raw, e)))
}

/// Current instant truncated to what the text encoding keeps
pub(crate) fn now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}

/// Next concurrency token, strictly after the previous one
pub(crate) fn next_token(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = now();
    if now > previous {
        now
    } else {
        previous + Duration::microseconds(1)
    }
}

pub(crate) fn day(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub(crate) fn parse_day(entity: &'static str, raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT)
        .map_err(|e| StoreError::corrupt(entity, format!("date {:?}: {}", raw, e)))
}

pub(crate) fn local(at: NaiveDateTime) -> String {
    at.format(DATETIME_FORMAT).to_string()
}

pub(crate) fn parse_local(entity: &'static str, raw: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, DATETIME_FORMAT)
        .map_err(|e| StoreError::corrupt(entity, format!("datetime {:?}: {}", raw, e)))
}

fn clock(entity: &'static str, minutes: i64) -> Result<ClockTime> {
    u16::try_from(minutes)
        .ok()
        .and_then(ClockTime::from_minutes)
        .ok_or_else(|| StoreError::corrupt(entity, format!("time of day {}", minutes)))
}

fn unsigned(entity: &'static str, column: &str, value: i64) -> Result<u32> {
    u32::try_from(value).map_err(|_| StoreError::corrupt(entity, format!("{} {}", column, value)))
}

fn col<'r, T>(row: &'r SqliteRow, entity: &'static str, column: &str) -> Result<T>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(column)
        .map_err(|e| StoreError::corrupt(entity, format!("column {}: {}", column, e)))
}

pub(crate) fn requester_columns(requester: Requester) -> (&'static str, i64) {
    match requester {
        Requester::Admin(id) => ("ADMIN", id),
        Requester::Teacher(id) => ("TEACHER", id),
    }
}

pub(crate) fn role_str(role: MembershipRole) -> &'static str {
    match role {
        MembershipRole::Teacher => "TEACHER",
        MembershipRole::Substitute => "SUBSTITUTE",
    }
}

pub(crate) fn status_str(status: MembershipStatus) -> &'static str {
    match status {
        MembershipStatus::Active => "ACTIVE",
        MembershipStatus::Inactive => "INACTIVE",
    }
}

pub(crate) fn row_to_rule(row: &SqliteRow) -> Result<ScheduleRule> {
    const E: &str = "rule";
    let weekday: i64 = col(row, E, "weekday")?;
    let end_date: Option<String> = col(row, E, "end_date")?;
    let lock_at: Option<String> = col(row, E, "lock_at")?;
    Ok(ScheduleRule {
        id: col(row, E, "id")?,
        center_id: col(row, E, "center_id")?,
        offering_id: col(row, E, "offering_id")?,
        teacher_id: col(row, E, "teacher_id")?,
        room_id: col(row, E, "room_id")?,
        name: col(row, E, "name")?,
        weekday: u8::try_from(weekday)
            .map_err(|_| StoreError::corrupt(E, format!("weekday {}", weekday)))?,
        start_time: clock(E, col(row, E, "start_min")?)?,
        end_time: clock(E, col(row, E, "end_min")?)?,
        duration_minutes: unsigned(E, "duration_minutes", col(row, E, "duration_minutes")?)?,
        effective_range: EffectiveRange::new(
            parse_day(E, &col::<String>(row, E, "start_date")?)?,
            end_date.map(|d| parse_day(E, &d)).transpose()?,
        ),
        lock_at: lock_at.map(|t| parse_ts(E, &t)).transpose()?,
        is_active: col(row, E, "is_active")?,
        created_at: parse_ts(E, &col::<String>(row, E, "created_at")?)?,
        updated_at: parse_ts(E, &col::<String>(row, E, "updated_at")?)?,
    })
}

pub(crate) fn row_to_exception(row: &SqliteRow) -> Result<ScheduleException> {
    const E: &str = "exception";
    let kind: String = col(row, E, "exception_type")?;
    let status: String = col(row, E, "status")?;
    let requester_kind: String = col(row, E, "requester_kind")?;
    let requester_id: i64 = col(row, E, "requester_id")?;
    let new_start_at: Option<String> = col(row, E, "new_start_at")?;
    let new_end_at: Option<String> = col(row, E, "new_end_at")?;
    let reviewed_at: Option<String> = col(row, E, "reviewed_at")?;

    let requested_by = match requester_kind.as_str() {
        "ADMIN" => Requester::Admin(requester_id),
        "TEACHER" => Requester::Teacher(requester_id),
        other => return Err(StoreError::corrupt(E, format!("requester kind {:?}", other))),
    };

    Ok(ScheduleException {
        id: col(row, E, "id")?,
        center_id: col(row, E, "center_id")?,
        rule_id: col(row, E, "rule_id")?,
        original_date: parse_day(E, &col::<String>(row, E, "original_date")?)?,
        exception_type: kind
            .parse()
            .map_err(|e: timeledger_core::Error| StoreError::corrupt(E, e.to_string()))?,
        status: status
            .parse()
            .map_err(|e: timeledger_core::Error| StoreError::corrupt(E, e.to_string()))?,
        new_start_at: new_start_at.map(|t| parse_local(E, &t)).transpose()?,
        new_end_at: new_end_at.map(|t| parse_local(E, &t)).transpose()?,
        new_teacher_id: col(row, E, "new_teacher_id")?,
        new_room_id: col(row, E, "new_room_id")?,
        reason: col(row, E, "reason")?,
        requested_by,
        reviewed_by: col(row, E, "reviewed_by")?,
        reviewed_at: reviewed_at.map(|t| parse_ts(E, &t)).transpose()?,
        review_note: col(row, E, "review_note")?,
        created_at: parse_ts(E, &col::<String>(row, E, "created_at")?)?,
        updated_at: parse_ts(E, &col::<String>(row, E, "updated_at")?)?,
    })
}

pub(crate) fn row_to_center(row: &SqliteRow) -> Result<Center> {
    const E: &str = "center";
    let settings: String = col(row, E, "settings")?;
    Ok(Center {
        id: col(row, E, "id")?,
        name: col(row, E, "name")?,
        settings: serde_json::from_str(&settings)
            .map_err(|e| StoreError::corrupt(E, format!("settings: {}", e)))?,
        created_at: parse_ts(E, &col::<String>(row, E, "created_at")?)?,
    })
}

pub(crate) fn row_to_teacher(row: &SqliteRow) -> Result<Teacher> {
    const E: &str = "teacher";
    Ok(Teacher {
        id: col(row, E, "id")?,
        name: col(row, E, "name")?,
        identity_handle: col(row, E, "identity_handle")?,
        email: col(row, E, "email")?,
        phone: col(row, E, "phone")?,
        open_to_hiring: col(row, E, "open_to_hiring")?,
        created_at: parse_ts(E, &col::<String>(row, E, "created_at")?)?,
    })
}

pub(crate) fn row_to_room(row: &SqliteRow) -> Result<Room> {
    const E: &str = "room";
    Ok(Room {
        id: col(row, E, "id")?,
        center_id: col(row, E, "center_id")?,
        name: col(row, E, "name")?,
        capacity: unsigned(E, "capacity", col(row, E, "capacity")?)?,
    })
}

pub(crate) fn row_to_course(row: &SqliteRow) -> Result<Course> {
    const E: &str = "course";
    Ok(Course {
        id: col(row, E, "id")?,
        center_id: col(row, E, "center_id")?,
        name: col(row, E, "name")?,
        default_duration: unsigned(E, "default_duration", col(row, E, "default_duration")?)?,
        color_hex: col(row, E, "color_hex")?,
        teacher_buffer_min: unsigned(E, "teacher_buffer_min", col(row, E, "teacher_buffer_min")?)?,
        room_buffer_min: unsigned(E, "room_buffer_min", col(row, E, "room_buffer_min")?)?,
    })
}

pub(crate) fn row_to_offering(row: &SqliteRow) -> Result<Offering> {
    const E: &str = "offering";
    let teacher_buffer: Option<i64> = col(row, E, "teacher_buffer_min")?;
    let room_buffer: Option<i64> = col(row, E, "room_buffer_min")?;
    Ok(Offering {
        id: col(row, E, "id")?,
        center_id: col(row, E, "center_id")?,
        course_id: col(row, E, "course_id")?,
        name: col(row, E, "name")?,
        default_room_id: col(row, E, "default_room_id")?,
        default_teacher_id: col(row, E, "default_teacher_id")?,
        allow_buffer_override: col(row, E, "allow_buffer_override")?,
        teacher_buffer_min: teacher_buffer
            .map(|v| unsigned(E, "teacher_buffer_min", v))
            .transpose()?,
        room_buffer_min: room_buffer
            .map(|v| unsigned(E, "room_buffer_min", v))
            .transpose()?,
    })
}

pub(crate) fn row_to_term(row: &SqliteRow) -> Result<Term> {
    const E: &str = "term";
    Ok(Term {
        id: col(row, E, "id")?,
        center_id: col(row, E, "center_id")?,
        name: col(row, E, "name")?,
        start_date: parse_day(E, &col::<String>(row, E, "start_date")?)?,
        end_date: parse_day(E, &col::<String>(row, E, "end_date")?)?,
    })
}

pub(crate) fn row_to_membership(row: &SqliteRow) -> Result<CenterMembership> {
    const E: &str = "membership";
    let role: String = col(row, E, "role")?;
    let status: String = col(row, E, "status")?;
    Ok(CenterMembership {
        id: col(row, E, "id")?,
        center_id: col(row, E, "center_id")?,
        teacher_id: col(row, E, "teacher_id")?,
        role: match role.as_str() {
            "TEACHER" => MembershipRole::Teacher,
            "SUBSTITUTE" => MembershipRole::Substitute,
            other => return Err(StoreError::corrupt(E, format!("role {:?}", other))),
        },
        status: match status.as_str() {
            "ACTIVE" => MembershipStatus::Active,
            "INACTIVE" => MembershipStatus::Inactive,
            other => return Err(StoreError::corrupt(E, format!("status {:?}", other))),
        },
    })
}

pub(crate) fn row_to_holiday(row: &SqliteRow) -> Result<CenterHoliday> {
    const E: &str = "holiday";
    Ok(CenterHoliday {
        id: col(row, E, "id")?,
        center_id: col(row, E, "center_id")?,
        date: parse_day(E, &col::<String>(row, E, "date")?)?,
        name: col(row, E, "name")?,
    })
}

pub(crate) fn row_to_event(row: &SqliteRow) -> Result<PersonalEvent> {
    const E: &str = "personal_event";
    Ok(PersonalEvent {
        id: col(row, E, "id")?,
        teacher_id: col(row, E, "teacher_id")?,
        title: col(row, E, "title")?,
        start_at: parse_local(E, &col::<String>(row, E, "start_at")?)?,
        end_at: parse_local(E, &col::<String>(row, E, "end_at")?)?,
    })
}

pub(crate) fn row_to_marker(row: &SqliteRow) -> Result<ReadMarker> {
    const E: &str = "read_marker";
    Ok(ReadMarker {
        id: col(row, E, "id")?,
        teacher_id: col(row, E, "teacher_id")?,
        item_key: col(row, E, "item_key")?,
        read_at: parse_ts(E, &col::<String>(row, E, "read_at")?)?,
    })
}

/// Bind value for an id column; non-positive ids let SQLite assign one
pub(crate) fn requested_id(id: i64) -> Option<i64> {
    (id > 0).then_some(id)
}
