//! Schedule rule persistence

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::SqliteExecutor;
use timeledger_core::models::{CenterId, OfferingId, RuleDraft, RuleId, ScheduleRule, TeacherId};
use timeledger_core::repository::{RuleRepository, RuleSplit, SplitResult};
use timeledger_core::{Error, Result};
use tracing::debug;

use super::helpers::{day, next_token, now, parse_ts, row_to_rule, ts};
use super::SqliteStore;
use crate::error::StoreError;

const RULE_COLUMNS: &str = "id, center_id, offering_id, teacher_id, room_id, name, weekday, \
     start_min, end_min, duration_minutes, start_date, end_date, lock_at, is_active, \
     created_at, updated_at";

async fn insert_rule<'e, E>(executor: E, draft: &RuleDraft) -> sqlx::Result<SqliteRow>
where
    E: SqliteExecutor<'e>,
{
    let now = now();
    let sql = format!(
        "INSERT INTO schedule_rules (center_id, offering_id, teacher_id, room_id, name, \
         weekday, start_min, end_min, duration_minutes, start_date, end_date, lock_at, \
         is_active, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?) RETURNING {}",
        RULE_COLUMNS
    );
    sqlx::query(&sql)
        .bind(draft.center_id)
        .bind(draft.offering_id)
        .bind(draft.teacher_id)
        .bind(draft.room_id)
        .bind(&draft.name)
        .bind(i64::from(draft.weekday))
        .bind(i64::from(draft.start_time.minutes()))
        .bind(i64::from(draft.end_time.minutes()))
        .bind(i64::from(draft.duration_minutes()))
        .bind(day(draft.effective_range.start_date))
        .bind(draft.effective_range.end_date.map(day))
        .bind(draft.lock_at.map(ts))
        .bind(ts(now))
        .bind(ts(now))
        .fetch_one(executor)
        .await
}

/// Compare-and-set write of every mutable column; `None` when the token is stale
async fn update_rule<'e, E>(executor: E, rule: &ScheduleRule) -> sqlx::Result<Option<SqliteRow>>
where
    E: SqliteExecutor<'e>,
{
    let sql = format!(
        "UPDATE schedule_rules SET offering_id = ?, teacher_id = ?, room_id = ?, name = ?, \
         weekday = ?, start_min = ?, end_min = ?, duration_minutes = ?, start_date = ?, \
         end_date = ?, lock_at = ?, is_active = ?, updated_at = ? \
         WHERE id = ? AND center_id = ? AND updated_at = ? RETURNING {}",
        RULE_COLUMNS
    );
    sqlx::query(&sql)
        .bind(rule.offering_id)
        .bind(rule.teacher_id)
        .bind(rule.room_id)
        .bind(&rule.name)
        .bind(i64::from(rule.weekday))
        .bind(i64::from(rule.start_time.minutes()))
        .bind(i64::from(rule.end_time.minutes()))
        .bind(i64::from(rule.duration_minutes))
        .bind(day(rule.effective_range.start_date))
        .bind(rule.effective_range.end_date.map(day))
        .bind(rule.lock_at.map(ts))
        .bind(rule.is_active)
        .bind(ts(next_token(rule.updated_at)))
        .bind(rule.id)
        .bind(rule.center_id)
        .bind(ts(rule.updated_at))
        .fetch_optional(executor)
        .await
}

impl SqliteStore {
    async fn fetch_rules(&self, sql: &str, binds: &[i64]) -> Result<Vec<ScheduleRule>> {
        let mut query = sqlx::query(sql);
        for value in binds {
            query = query.bind(*value);
        }
        let rows = query
            .fetch_all(self.pool())
            .await
            .map_err(StoreError::db("list rules"))?;
        Ok(rows.iter().map(row_to_rule).collect::<crate::Result<_>>()?)
    }

    /// `NotFound` when the rule is absent, else `ConcurrentModified`
    async fn rule_write_failed(&self, center_id: CenterId, id: RuleId) -> Error {
        match RuleRepository::get_by_id(self, center_id, id).await {
            Ok(_) => Error::concurrent("rule", id),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl RuleRepository for SqliteStore {
    async fn create(&self, draft: RuleDraft) -> Result<ScheduleRule> {
        let row = insert_rule(self.pool(), &draft)
            .await
            .map_err(StoreError::db("create rule"))?;
        let rule = row_to_rule(&row)?;
        debug!(rule_id = rule.id, center_id = rule.center_id, "Rule created");
        Ok(rule)
    }

    async fn get_by_id(&self, center_id: CenterId, id: RuleId) -> Result<ScheduleRule> {
        let sql = format!(
            "SELECT {} FROM schedule_rules WHERE id = ? AND center_id = ?",
            RULE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(center_id)
            .fetch_optional(self.pool())
            .await
            .map_err(StoreError::db("get rule"))?
            .ok_or_else(|| Error::not_found("rule", id))?;
        Ok(row_to_rule(&row)?)
    }

    async fn update(&self, rule: &ScheduleRule) -> Result<ScheduleRule> {
        let row = update_rule(self.pool(), rule)
            .await
            .map_err(StoreError::db("update rule"))?;
        match row {
            Some(row) => Ok(row_to_rule(&row)?),
            None => Err(self.rule_write_failed(rule.center_id, rule.id).await),
        }
    }

    async fn list_by_center(&self, center_id: CenterId) -> Result<Vec<ScheduleRule>> {
        let sql = format!(
            "SELECT {} FROM schedule_rules WHERE center_id = ? AND is_active = 1 ORDER BY id",
            RULE_COLUMNS
        );
        self.fetch_rules(&sql, &[center_id]).await
    }

    async fn list_by_teacher_and_center(
        &self,
        teacher_id: TeacherId,
        center_id: CenterId,
    ) -> Result<Vec<ScheduleRule>> {
        let sql = format!(
            "SELECT {} FROM schedule_rules \
             WHERE teacher_id = ? AND center_id = ? AND is_active = 1 ORDER BY id",
            RULE_COLUMNS
        );
        self.fetch_rules(&sql, &[teacher_id, center_id]).await
    }

    async fn list_intersecting(
        &self,
        center_id: CenterId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<ScheduleRule>> {
        let sql = format!(
            "SELECT {} FROM schedule_rules \
             WHERE center_id = ? AND is_active = 1 AND start_date <= ? \
             AND (end_date IS NULL OR end_date >= ?) ORDER BY id",
            RULE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(center_id)
            .bind(day(end))
            .bind(day(start))
            .fetch_all(self.pool())
            .await
            .map_err(StoreError::db("list intersecting rules"))?;
        Ok(rows.iter().map(row_to_rule).collect::<crate::Result<_>>()?)
    }

    async fn list_by_offering(
        &self,
        center_id: CenterId,
        offering_id: OfferingId,
    ) -> Result<Vec<ScheduleRule>> {
        let sql = format!(
            "SELECT {} FROM schedule_rules \
             WHERE center_id = ? AND offering_id = ? AND is_active = 1 ORDER BY id",
            RULE_COLUMNS
        );
        self.fetch_rules(&sql, &[center_id, offering_id]).await
    }

    async fn set_active(
        &self,
        center_id: CenterId,
        id: RuleId,
        active: bool,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<ScheduleRule> {
        let sql = format!(
            "UPDATE schedule_rules SET is_active = ?, updated_at = ? \
             WHERE id = ? AND center_id = ? AND updated_at = ? RETURNING {}",
            RULE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(active)
            .bind(ts(next_token(expected_updated_at)))
            .bind(id)
            .bind(center_id)
            .bind(ts(expected_updated_at))
            .fetch_optional(self.pool())
            .await
            .map_err(StoreError::db("set rule active"))?;
        match row {
            Some(row) => Ok(row_to_rule(&row)?),
            None => Err(self.rule_write_failed(center_id, id).await),
        }
    }

    async fn split(&self, split: RuleSplit) -> Result<SplitResult> {
        let original = &split.original;
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(StoreError::db("begin rule split"))?;

        let Some(row) = update_rule(&mut *tx, original)
            .await
            .map_err(StoreError::db("truncate rule"))?
        else {
            tx.rollback()
                .await
                .map_err(StoreError::db("roll back rule split"))?;
            return Err(self.rule_write_failed(original.center_id, original.id).await);
        };
        let truncated = row_to_rule(&row)?;

        let row = insert_rule(&mut *tx, &split.successor)
            .await
            .map_err(StoreError::db("create successor rule"))?;
        let successor = row_to_rule(&row)?;

        let open: Vec<(i64, String)> = sqlx::query_as(
            "SELECT id, updated_at FROM schedule_exceptions \
             WHERE rule_id = ? AND original_date >= ? AND status IN ('PENDING', 'APPROVED') \
             ORDER BY id",
        )
        .bind(original.id)
        .bind(day(split.anchor))
        .fetch_all(&mut *tx)
        .await
        .map_err(StoreError::db("list exceptions to migrate"))?;

        let mut migrated = Vec::with_capacity(open.len());
        for (id, token) in open {
            let token = parse_ts("schedule_exceptions", &token)?;
            sqlx::query("UPDATE schedule_exceptions SET rule_id = ?, updated_at = ? WHERE id = ?")
                .bind(successor.id)
                .bind(ts(next_token(token)))
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::db("migrate exception"))?;
            migrated.push(id);
        }

        tx.commit()
            .await
            .map_err(StoreError::db("commit rule split"))?;
        debug!(
            rule_id = truncated.id,
            successor_id = successor.id,
            migrated = migrated.len(),
            "Rule split"
        );
        Ok(SplitResult {
            original: truncated,
            successor,
            migrated,
        })
    }
}
