//! Schema, applied idempotently on open

/// Statements in application order
pub(crate) const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS centers (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        settings TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS teachers (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        identity_handle TEXT UNIQUE,
        email TEXT,
        phone TEXT,
        open_to_hiring INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS rooms (
        id INTEGER PRIMARY KEY,
        center_id INTEGER NOT NULL REFERENCES centers(id),
        name TEXT NOT NULL,
        capacity INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS courses (
        id INTEGER PRIMARY KEY,
        center_id INTEGER NOT NULL REFERENCES centers(id),
        name TEXT NOT NULL,
        default_duration INTEGER NOT NULL,
        color_hex TEXT NOT NULL,
        teacher_buffer_min INTEGER NOT NULL DEFAULT 0,
        room_buffer_min INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS offerings (
        id INTEGER PRIMARY KEY,
        center_id INTEGER NOT NULL REFERENCES centers(id),
        course_id INTEGER NOT NULL REFERENCES courses(id),
        name TEXT NOT NULL,
        default_room_id INTEGER,
        default_teacher_id INTEGER,
        allow_buffer_override INTEGER NOT NULL DEFAULT 0,
        teacher_buffer_min INTEGER,
        room_buffer_min INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS terms (
        id INTEGER PRIMARY KEY,
        center_id INTEGER NOT NULL REFERENCES centers(id),
        name TEXT NOT NULL,
        start_date TEXT NOT NULL,
        end_date TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS center_memberships (
        id INTEGER PRIMARY KEY,
        center_id INTEGER NOT NULL,
        teacher_id INTEGER NOT NULL,
        role TEXT NOT NULL,
        status TEXT NOT NULL,
        UNIQUE (center_id, teacher_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS schedule_rules (
        id INTEGER PRIMARY KEY,
        center_id INTEGER NOT NULL,
        offering_id INTEGER NOT NULL,
        teacher_id INTEGER,
        room_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        weekday INTEGER NOT NULL CHECK (weekday BETWEEN 1 AND 7),
        start_min INTEGER NOT NULL,
        end_min INTEGER NOT NULL,
        duration_minutes INTEGER NOT NULL,
        start_date TEXT NOT NULL,
        end_date TEXT,
        lock_at TEXT,
        is_active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_rules_center_active
    ON schedule_rules(center_id, is_active)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_rules_teacher
    ON schedule_rules(teacher_id, center_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS schedule_exceptions (
        id INTEGER PRIMARY KEY,
        center_id INTEGER NOT NULL,
        rule_id INTEGER NOT NULL,
        original_date TEXT NOT NULL,
        exception_type TEXT NOT NULL,
        status TEXT NOT NULL,
        new_start_at TEXT,
        new_end_at TEXT,
        new_teacher_id INTEGER,
        new_room_id INTEGER,
        reason TEXT NOT NULL DEFAULT '',
        requester_kind TEXT NOT NULL,
        requester_id INTEGER NOT NULL,
        reviewed_by INTEGER,
        reviewed_at TEXT,
        review_note TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    // At most one open exception per occurrence
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS ux_exceptions_open
    ON schedule_exceptions(rule_id, original_date)
    WHERE status IN ('PENDING', 'APPROVED')
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_exceptions_status
    ON schedule_exceptions(status, center_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS center_holidays (
        id INTEGER PRIMARY KEY,
        center_id INTEGER NOT NULL,
        date TEXT NOT NULL,
        name TEXT NOT NULL,
        UNIQUE (center_id, date)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS personal_events (
        id INTEGER PRIMARY KEY,
        teacher_id INTEGER NOT NULL,
        title TEXT NOT NULL,
        start_at TEXT NOT NULL,
        end_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_personal_events_teacher
    ON personal_events(teacher_id, start_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS read_markers (
        id INTEGER PRIMARY KEY,
        teacher_id INTEGER NOT NULL,
        item_key TEXT NOT NULL,
        read_at TEXT NOT NULL,
        UNIQUE (teacher_id, item_key)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_read_markers_read_at
    ON read_markers(read_at)
    "#,
];
