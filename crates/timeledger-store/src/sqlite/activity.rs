//! Holidays, personal events and read markers

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use timeledger_core::models::{
    CenterHoliday, CenterId, HolidayId, PersonalEvent, ReadMarker, TeacherId,
};
use timeledger_core::repository::{
    HolidayRepository, HolidayUpsert, PersonalEventRepository, ReadMarkerRepository,
};
use timeledger_core::{Error, Result};
use tracing::{debug, info};

use super::helpers::{
    day, local, requested_id, row_to_event, row_to_holiday, row_to_marker, ts,
};
use super::SqliteStore;
use crate::error::StoreError;

#[async_trait]
impl HolidayRepository for SqliteStore {
    async fn list_by_center_in_range(
        &self,
        center_id: CenterId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<CenterHoliday>> {
        let rows = sqlx::query(
            "SELECT * FROM center_holidays \
             WHERE center_id = ? AND date >= ? AND date <= ? ORDER BY date",
        )
        .bind(center_id)
        .bind(day(start))
        .bind(day(end))
        .fetch_all(self.pool())
        .await
        .map_err(StoreError::db("list holidays"))?;
        Ok(rows.iter().map(row_to_holiday).collect::<crate::Result<_>>()?)
    }

    async fn upsert(&self, center_id: CenterId, date: NaiveDate, name: &str) -> Result<HolidayUpsert> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(StoreError::db("begin holiday upsert"))?;

        let existing: Option<i64> =
            sqlx::query_scalar("SELECT id FROM center_holidays WHERE center_id = ? AND date = ?")
                .bind(center_id)
                .bind(day(date))
                .fetch_optional(&mut *tx)
                .await
                .map_err(StoreError::db("find holiday"))?;

        let (row, created) = match existing {
            Some(id) => {
                let row = sqlx::query("UPDATE center_holidays SET name = ? WHERE id = ? RETURNING *")
                    .bind(name)
                    .bind(id)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(StoreError::db("rename holiday"))?;
                (row, false)
            }
            None => {
                let row = sqlx::query(
                    "INSERT INTO center_holidays (center_id, date, name) VALUES (?, ?, ?) RETURNING *",
                )
                .bind(center_id)
                .bind(day(date))
                .bind(name)
                .fetch_one(&mut *tx)
                .await
                .map_err(StoreError::db("insert holiday"))?;
                (row, true)
            }
        };

        tx.commit()
            .await
            .map_err(StoreError::db("commit holiday upsert"))?;

        let holiday = row_to_holiday(&row)?;
        debug!(center_id, date = %date, created, "Holiday stored");
        Ok(HolidayUpsert { holiday, created })
    }

    async fn get_by_id(&self, id: HolidayId) -> Result<CenterHoliday> {
        let row = sqlx::query("SELECT * FROM center_holidays WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(StoreError::db("get holiday"))?
            .ok_or_else(|| Error::not_found("holiday", id))?;
        Ok(row_to_holiday(&row)?)
    }

    async fn delete(&self, id: HolidayId) -> Result<()> {
        let result = sqlx::query("DELETE FROM center_holidays WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(StoreError::db("delete holiday"))?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("holiday", id));
        }
        Ok(())
    }
}

#[async_trait]
impl PersonalEventRepository for SqliteStore {
    async fn list_by_teacher_in_range(
        &self,
        teacher_id: TeacherId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PersonalEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM personal_events \
             WHERE teacher_id = ? AND date(start_at) <= ? AND date(end_at) >= ? \
             ORDER BY start_at, id",
        )
        .bind(teacher_id)
        .bind(day(end))
        .bind(day(start))
        .fetch_all(self.pool())
        .await
        .map_err(StoreError::db("list personal events"))?;
        Ok(rows.iter().map(row_to_event).collect::<crate::Result<_>>()?)
    }

    async fn create(&self, event: PersonalEvent) -> Result<PersonalEvent> {
        let row = sqlx::query(
            "INSERT INTO personal_events (id, teacher_id, title, start_at, end_at) \
             VALUES (?, ?, ?, ?, ?) RETURNING *",
        )
        .bind(requested_id(event.id))
        .bind(event.teacher_id)
        .bind(&event.title)
        .bind(local(event.start_at))
        .bind(local(event.end_at))
        .fetch_one(self.pool())
        .await
        .map_err(StoreError::db("create personal event"))?;
        Ok(row_to_event(&row)?)
    }
}

#[async_trait]
impl ReadMarkerRepository for SqliteStore {
    async fn mark_read(
        &self,
        teacher_id: TeacherId,
        item_key: &str,
        at: DateTime<Utc>,
    ) -> Result<ReadMarker> {
        let row = sqlx::query(
            "INSERT INTO read_markers (teacher_id, item_key, read_at) VALUES (?, ?, ?) \
             ON CONFLICT (teacher_id, item_key) DO UPDATE SET read_at = excluded.read_at \
             RETURNING *",
        )
        .bind(teacher_id)
        .bind(item_key)
        .bind(ts(at))
        .fetch_one(self.pool())
        .await
        .map_err(StoreError::db("mark read"))?;
        Ok(row_to_marker(&row)?)
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM read_markers WHERE read_at < ?")
            .bind(ts(cutoff))
            .execute(self.pool())
            .await
            .map_err(StoreError::db("purge read markers"))?;
        let removed = result.rows_affected();
        if removed > 0 {
            info!(removed, cutoff = %cutoff, "Purged read markers");
        }
        Ok(removed)
    }
}
