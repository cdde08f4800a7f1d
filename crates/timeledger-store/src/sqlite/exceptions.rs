//! Schedule exception persistence
//!
//! The partial unique index `ux_exceptions_open` enforces one PENDING or
//! APPROVED exception per occurrence; a write rejected by it surfaces as
//! `ConcurrentModified`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{QueryBuilder, Sqlite};
use timeledger_core::models::{
    CenterId, ExceptionId, ExceptionStatus, NewException, RuleId, ScheduleException,
    StatusChange,
};
use timeledger_core::repository::ExceptionRepository;
use timeledger_core::{Error, Result};
use tracing::debug;

use super::helpers::{
    day, local, next_token, now, requester_columns, row_to_exception, ts,
};
use super::SqliteStore;
use crate::error::StoreError;

const EXCEPTION_COLUMNS: &str = "id, center_id, rule_id, original_date, exception_type, status, \
     new_start_at, new_end_at, new_teacher_id, new_room_id, reason, requester_kind, \
     requester_id, reviewed_by, reviewed_at, review_note, created_at, updated_at";

/// Map a rejected write, turning unique-index hits into `ConcurrentModified`
fn write_error(op: &'static str, id: impl ToString) -> impl FnOnce(sqlx::Error) -> Error {
    move |source| {
        let err = StoreError::Database { op, source };
        if err.is_unique_violation() {
            Error::concurrent("exception", id)
        } else {
            err.into()
        }
    }
}

impl SqliteStore {
    async fn exception_write_failed(&self, id: ExceptionId) -> Error {
        let sql = "SELECT 1 FROM schedule_exceptions WHERE id = ?";
        match sqlx::query(sql).bind(id).fetch_optional(self.pool()).await {
            Ok(Some(_)) => Error::concurrent("exception", id),
            Ok(None) => Error::not_found("exception", id),
            Err(e) => StoreError::db("get exception")(e).into(),
        }
    }
}

#[async_trait]
impl ExceptionRepository for SqliteStore {
    async fn create(&self, exception: NewException) -> Result<ScheduleException> {
        let now = now();
        let draft = &exception.draft;
        let (requester_kind, requester_id) = requester_columns(exception.requested_by);
        let sql = format!(
            "INSERT INTO schedule_exceptions (center_id, rule_id, original_date, exception_type, \
             status, new_start_at, new_end_at, new_teacher_id, new_room_id, reason, \
             requester_kind, requester_id, reviewed_by, reviewed_at, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING {}",
            EXCEPTION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(exception.center_id)
            .bind(draft.rule_id)
            .bind(day(draft.original_date))
            .bind(draft.exception_type.as_str())
            .bind(exception.status.as_str())
            .bind(draft.new_start_at.map(local))
            .bind(draft.new_end_at.map(local))
            .bind(draft.new_teacher_id)
            .bind(draft.new_room_id)
            .bind(&draft.reason)
            .bind(requester_kind)
            .bind(requester_id)
            .bind(exception.reviewed_by)
            .bind(exception.reviewed_at.map(ts))
            .bind(ts(now))
            .bind(ts(now))
            .fetch_one(self.pool())
            .await
            .map_err(write_error(
                "create exception",
                format!("{}@{}", draft.rule_id, draft.original_date),
            ))?;
        let created = row_to_exception(&row)?;
        debug!(
            exception_id = created.id,
            rule_id = created.rule_id,
            status = %created.status,
            "Exception created"
        );
        Ok(created)
    }

    async fn get_by_id(&self, center_id: CenterId, id: ExceptionId) -> Result<ScheduleException> {
        let sql = format!(
            "SELECT {} FROM schedule_exceptions WHERE id = ? AND center_id = ?",
            EXCEPTION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(center_id)
            .fetch_optional(self.pool())
            .await
            .map_err(StoreError::db("get exception"))?
            .ok_or_else(|| Error::not_found("exception", id))?;
        Ok(row_to_exception(&row)?)
    }

    async fn get_by_rule_and_date(
        &self,
        rule_id: RuleId,
        date: NaiveDate,
    ) -> Result<Option<ScheduleException>> {
        let sql = format!(
            "SELECT {} FROM schedule_exceptions \
             WHERE rule_id = ? AND original_date = ? AND status IN ('PENDING', 'APPROVED')",
            EXCEPTION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(rule_id)
            .bind(day(date))
            .fetch_optional(self.pool())
            .await
            .map_err(StoreError::db("get open exception"))?;
        Ok(row.as_ref().map(row_to_exception).transpose()?)
    }

    async fn list_by_rules_in_range(
        &self,
        rule_ids: &[RuleId],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<ScheduleException>> {
        if rule_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder: QueryBuilder<'_, Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM schedule_exceptions WHERE original_date >= ",
            EXCEPTION_COLUMNS
        ));
        builder.push_bind(day(start));
        builder.push(" AND original_date <= ");
        builder.push_bind(day(end));
        builder.push(" AND rule_id IN (");
        let mut ids = builder.separated(", ");
        for id in rule_ids {
            ids.push_bind(*id);
        }
        ids.push_unseparated(") ORDER BY original_date, id");

        let rows = builder
            .build()
            .fetch_all(self.pool())
            .await
            .map_err(StoreError::db("list exceptions in range"))?;
        Ok(rows.iter().map(row_to_exception).collect::<crate::Result<_>>()?)
    }

    async fn list_by_status(
        &self,
        center_id: Option<CenterId>,
        status: ExceptionStatus,
    ) -> Result<Vec<ScheduleException>> {
        let sql = format!(
            "SELECT {} FROM schedule_exceptions \
             WHERE status = ? AND (? IS NULL OR center_id = ?) ORDER BY original_date, id",
            EXCEPTION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(center_id)
            .bind(center_id)
            .fetch_all(self.pool())
            .await
            .map_err(StoreError::db("list exceptions by status"))?;
        Ok(rows.iter().map(row_to_exception).collect::<crate::Result<_>>()?)
    }

    async fn update_status(
        &self,
        id: ExceptionId,
        expected_updated_at: DateTime<Utc>,
        change: StatusChange,
    ) -> Result<ScheduleException> {
        let sql = format!(
            "UPDATE schedule_exceptions SET status = ?, \
             reviewed_by = COALESCE(?, reviewed_by), \
             reviewed_at = COALESCE(?, reviewed_at), \
             review_note = COALESCE(?, review_note), \
             updated_at = ? \
             WHERE id = ? AND updated_at = ? RETURNING {}",
            EXCEPTION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(change.to.as_str())
            .bind(change.reviewed_by)
            .bind(change.reviewed_at.map(ts))
            .bind(change.review_note)
            .bind(ts(next_token(expected_updated_at)))
            .bind(id)
            .bind(ts(expected_updated_at))
            .fetch_optional(self.pool())
            .await
            .map_err(write_error("update exception status", id))?;
        match row {
            Some(row) => Ok(row_to_exception(&row)?),
            None => Err(self.exception_write_failed(id).await),
        }
    }

    async fn update_fields(&self, exception: &ScheduleException) -> Result<ScheduleException> {
        let (requester_kind, requester_id) = requester_columns(exception.requested_by);
        let sql = format!(
            "UPDATE schedule_exceptions SET rule_id = ?, original_date = ?, exception_type = ?, \
             status = ?, new_start_at = ?, new_end_at = ?, new_teacher_id = ?, new_room_id = ?, \
             reason = ?, requester_kind = ?, requester_id = ?, reviewed_by = ?, reviewed_at = ?, \
             review_note = ?, updated_at = ? \
             WHERE id = ? AND updated_at = ? RETURNING {}",
            EXCEPTION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(exception.rule_id)
            .bind(day(exception.original_date))
            .bind(exception.exception_type.as_str())
            .bind(exception.status.as_str())
            .bind(exception.new_start_at.map(local))
            .bind(exception.new_end_at.map(local))
            .bind(exception.new_teacher_id)
            .bind(exception.new_room_id)
            .bind(&exception.reason)
            .bind(requester_kind)
            .bind(requester_id)
            .bind(exception.reviewed_by)
            .bind(exception.reviewed_at.map(ts))
            .bind(&exception.review_note)
            .bind(ts(next_token(exception.updated_at)))
            .bind(exception.id)
            .bind(ts(exception.updated_at))
            .fetch_optional(self.pool())
            .await
            .map_err(write_error("update exception", exception.id))?;
        match row {
            Some(row) => Ok(row_to_exception(&row)?),
            None => Err(self.exception_write_failed(exception.id).await),
        }
    }
}
