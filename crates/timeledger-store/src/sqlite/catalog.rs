//! Centers, catalog rows, teachers and memberships

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use timeledger_core::models::{
    Center, CenterId, CenterMembership, Course, CourseId, MembershipStatus, NewTeacher, Offering,
    OfferingId, Room, RoomId, Teacher, TeacherId, Term, TermId,
};
use timeledger_core::repository::{CatalogRepository, MembershipRepository};
use timeledger_core::{Error, Result};
use tracing::debug;

use super::helpers::{
    day, now, requested_id, role_str, row_to_center, row_to_course, row_to_membership,
    row_to_offering, row_to_room, row_to_teacher, row_to_term, status_str, ts,
};
use super::SqliteStore;
use crate::error::StoreError;

const MEMBERSHIP_COLUMNS: &str = "id, center_id, teacher_id, role, status";

impl SqliteStore {
    /// Single row scoped to a center, `NotFound` when absent
    async fn fetch_scoped<T>(
        &self,
        entity: &'static str,
        table: &str,
        center_id: CenterId,
        id: i64,
        convert: fn(&SqliteRow) -> crate::Result<T>,
    ) -> Result<T> {
        let sql = format!("SELECT * FROM {} WHERE id = ? AND center_id = ?", table);
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(center_id)
            .fetch_optional(self.pool())
            .await
            .map_err(StoreError::db("get catalog row"))?
            .ok_or_else(|| Error::not_found(entity, id))?;
        Ok(convert(&row)?)
    }
}

#[async_trait]
impl CatalogRepository for SqliteStore {
    async fn get_center(&self, id: CenterId) -> Result<Center> {
        let row = sqlx::query("SELECT * FROM centers WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(StoreError::db("get center"))?
            .ok_or_else(|| Error::not_found("center", id))?;
        Ok(row_to_center(&row)?)
    }

    async fn list_centers(&self) -> Result<Vec<Center>> {
        let rows = sqlx::query("SELECT * FROM centers ORDER BY id")
            .fetch_all(self.pool())
            .await
            .map_err(StoreError::db("list centers"))?;
        Ok(rows.iter().map(row_to_center).collect::<crate::Result<_>>()?)
    }

    async fn create_center(&self, center: Center) -> Result<Center> {
        let settings = serde_json::to_string(&center.settings)
            .map_err(|e| Error::system_with("failed to encode center settings", e))?;
        let row = sqlx::query(
            "INSERT INTO centers (id, name, settings, created_at) VALUES (?, ?, ?, ?) RETURNING *",
        )
        .bind(requested_id(center.id))
        .bind(&center.name)
        .bind(settings)
        .bind(ts(center.created_at))
        .fetch_one(self.pool())
        .await
        .map_err(StoreError::db("create center"))?;
        let created = row_to_center(&row)?;
        debug!(center_id = created.id, "Center created");
        Ok(created)
    }

    async fn get_course(&self, center_id: CenterId, id: CourseId) -> Result<Course> {
        self.fetch_scoped("course", "courses", center_id, id, row_to_course)
            .await
    }

    async fn create_course(&self, course: Course) -> Result<Course> {
        let row = sqlx::query(
            "INSERT INTO courses (id, center_id, name, default_duration, color_hex, \
             teacher_buffer_min, room_buffer_min) VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING *",
        )
        .bind(requested_id(course.id))
        .bind(course.center_id)
        .bind(&course.name)
        .bind(i64::from(course.default_duration))
        .bind(&course.color_hex)
        .bind(i64::from(course.teacher_buffer_min))
        .bind(i64::from(course.room_buffer_min))
        .fetch_one(self.pool())
        .await
        .map_err(StoreError::db("create course"))?;
        Ok(row_to_course(&row)?)
    }

    async fn get_offering(&self, center_id: CenterId, id: OfferingId) -> Result<Offering> {
        self.fetch_scoped("offering", "offerings", center_id, id, row_to_offering)
            .await
    }

    async fn create_offering(&self, offering: Offering) -> Result<Offering> {
        let row = sqlx::query(
            "INSERT INTO offerings (id, center_id, course_id, name, default_room_id, \
             default_teacher_id, allow_buffer_override, teacher_buffer_min, room_buffer_min) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING *",
        )
        .bind(requested_id(offering.id))
        .bind(offering.center_id)
        .bind(offering.course_id)
        .bind(&offering.name)
        .bind(offering.default_room_id)
        .bind(offering.default_teacher_id)
        .bind(offering.allow_buffer_override)
        .bind(offering.teacher_buffer_min.map(i64::from))
        .bind(offering.room_buffer_min.map(i64::from))
        .fetch_one(self.pool())
        .await
        .map_err(StoreError::db("create offering"))?;
        Ok(row_to_offering(&row)?)
    }

    async fn get_room(&self, center_id: CenterId, id: RoomId) -> Result<Room> {
        self.fetch_scoped("room", "rooms", center_id, id, row_to_room)
            .await
    }

    async fn create_room(&self, room: Room) -> Result<Room> {
        let row = sqlx::query(
            "INSERT INTO rooms (id, center_id, name, capacity) VALUES (?, ?, ?, ?) RETURNING *",
        )
        .bind(requested_id(room.id))
        .bind(room.center_id)
        .bind(&room.name)
        .bind(i64::from(room.capacity))
        .fetch_one(self.pool())
        .await
        .map_err(StoreError::db("create room"))?;
        Ok(row_to_room(&row)?)
    }

    async fn get_term(&self, center_id: CenterId, id: TermId) -> Result<Term> {
        self.fetch_scoped("term", "terms", center_id, id, row_to_term)
            .await
    }

    async fn create_term(&self, term: Term) -> Result<Term> {
        let row = sqlx::query(
            "INSERT INTO terms (id, center_id, name, start_date, end_date) \
             VALUES (?, ?, ?, ?, ?) RETURNING *",
        )
        .bind(requested_id(term.id))
        .bind(term.center_id)
        .bind(&term.name)
        .bind(day(term.start_date))
        .bind(day(term.end_date))
        .fetch_one(self.pool())
        .await
        .map_err(StoreError::db("create term"))?;
        Ok(row_to_term(&row)?)
    }

    async fn get_teacher(&self, id: TeacherId) -> Result<Teacher> {
        let row = sqlx::query("SELECT * FROM teachers WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(StoreError::db("get teacher"))?
            .ok_or_else(|| Error::not_found("teacher", id))?;
        Ok(row_to_teacher(&row)?)
    }

    async fn find_teacher_by_identity(&self, handle: &str) -> Result<Option<Teacher>> {
        let row = sqlx::query("SELECT * FROM teachers WHERE identity_handle = ?")
            .bind(handle)
            .fetch_optional(self.pool())
            .await
            .map_err(StoreError::db("find teacher by identity"))?;
        Ok(row.as_ref().map(row_to_teacher).transpose()?)
    }

    async fn create_teacher(&self, teacher: NewTeacher) -> Result<Teacher> {
        let row = sqlx::query(
            "INSERT INTO teachers (name, identity_handle, email, phone, open_to_hiring, created_at) \
             VALUES (?, ?, ?, ?, ?, ?) RETURNING *",
        )
        .bind(&teacher.name)
        .bind(&teacher.identity_handle)
        .bind(&teacher.email)
        .bind(&teacher.phone)
        .bind(teacher.open_to_hiring)
        .bind(ts(now()))
        .fetch_one(self.pool())
        .await
        .map_err(|source| {
            let err = StoreError::Database {
                op: "create teacher",
                source,
            };
            if err.is_unique_violation() {
                Error::validation("identity handle is already bound to a teacher")
            } else {
                err.into()
            }
        })?;
        let created = row_to_teacher(&row)?;
        debug!(teacher_id = created.id, "Teacher created");
        Ok(created)
    }
}

#[async_trait]
impl MembershipRepository for SqliteStore {
    async fn get_active_by_teacher(&self, teacher_id: TeacherId) -> Result<Vec<CenterMembership>> {
        let sql = format!(
            "SELECT {} FROM center_memberships WHERE teacher_id = ? AND status = 'ACTIVE' \
             ORDER BY center_id",
            MEMBERSHIP_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(teacher_id)
            .fetch_all(self.pool())
            .await
            .map_err(StoreError::db("list memberships"))?;
        Ok(rows.iter().map(row_to_membership).collect::<crate::Result<_>>()?)
    }

    async fn get_by_center_and_teacher(
        &self,
        center_id: CenterId,
        teacher_id: TeacherId,
    ) -> Result<Option<CenterMembership>> {
        let sql = format!(
            "SELECT {} FROM center_memberships WHERE center_id = ? AND teacher_id = ?",
            MEMBERSHIP_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(center_id)
            .bind(teacher_id)
            .fetch_optional(self.pool())
            .await
            .map_err(StoreError::db("get membership"))?;
        Ok(row.as_ref().map(row_to_membership).transpose()?)
    }

    async fn save(&self, membership: CenterMembership) -> Result<CenterMembership> {
        let sql = format!(
            "INSERT INTO center_memberships (id, center_id, teacher_id, role, status) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT (center_id, teacher_id) \
             DO UPDATE SET role = excluded.role, status = excluded.status \
             RETURNING {}",
            MEMBERSHIP_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(requested_id(membership.id))
            .bind(membership.center_id)
            .bind(membership.teacher_id)
            .bind(role_str(membership.role))
            .bind(status_str(membership.status))
            .fetch_one(self.pool())
            .await
            .map_err(StoreError::db("save membership"))?;
        Ok(row_to_membership(&row)?)
    }

    async fn set_status(
        &self,
        center_id: CenterId,
        teacher_id: TeacherId,
        status: MembershipStatus,
    ) -> Result<CenterMembership> {
        let sql = format!(
            "UPDATE center_memberships SET status = ? \
             WHERE center_id = ? AND teacher_id = ? RETURNING {}",
            MEMBERSHIP_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(status_str(status))
            .bind(center_id)
            .bind(teacher_id)
            .fetch_optional(self.pool())
            .await
            .map_err(StoreError::db("set membership status"))?
            .ok_or_else(|| {
                Error::not_found("membership", format!("{}/{}", center_id, teacher_id))
            })?;
        debug!(center_id, teacher_id, status = status_str(status), "Membership status changed");
        Ok(row_to_membership(&row)?)
    }
}
