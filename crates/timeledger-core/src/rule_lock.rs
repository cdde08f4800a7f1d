//! Modification deadline for rule occurrences
//!
//! A session is locked once `today + lead_days > session_date`, where
//! `lead_days` comes from the center settings (falling back to the deployment
//! default). A rule's `lock_at`, when set and passed, locks every occurrence.
//! Nothing here is persisted: the deadline is recomputed on every call.

use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use serde::Serialize;

use crate::calendar::{Calendar, SharedClock};
use crate::error::{Error, Result};
use crate::models::{CenterId, RuleId, ScheduleRule};
use crate::repository::{CatalogRepository, RuleRepository};

/// Why a session is locked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockReason {
    /// Inside the center's exception lead time
    LeadTime,
    /// The rule's own lock time has passed
    RuleLockAt,
}

impl LockReason {
    fn describe(self, lead_days: i64) -> String {
        match self {
            Self::LeadTime => format!("changes close {} day(s) before the session", lead_days),
            Self::RuleLockAt => "the rule has been locked".to_string(),
        }
    }
}

/// Lock evaluation for one occurrence
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockStatus {
    /// Whether changes are refused
    pub locked: bool,
    /// Last day on which changes are accepted
    pub deadline: NaiveDate,
    /// Days from today to the deadline, zero once passed
    pub days_remaining: i64,
    /// Lead time applied
    pub lead_days: i64,
    /// Set when locked
    pub reason: Option<LockReason>,
}

impl LockStatus {
    /// `Err(Locked)` when locked
    pub fn into_result(self) -> Result<()> {
        match self.reason {
            Some(reason) if self.locked => Err(Error::Locked {
                deadline: self.deadline,
                days_remaining: self.days_remaining,
                reason: reason.describe(self.lead_days),
            }),
            _ => Ok(()),
        }
    }
}

/// Lead-time lock for a session date as seen on `today`
#[must_use]
pub fn evaluate(today: NaiveDate, session_date: NaiveDate, lead_days: i64) -> LockStatus {
    let lead_days = lead_days.max(0);
    let deadline = session_date - Duration::days(lead_days);
    let locked = today + Duration::days(lead_days) > session_date;
    LockStatus {
        locked,
        deadline,
        days_remaining: (deadline - today).num_days().max(0),
        lead_days,
        reason: locked.then_some(LockReason::LeadTime),
    }
}

/// Computes lock state from center settings and the clock
#[derive(Clone)]
pub struct RuleLock {
    catalog: Arc<dyn CatalogRepository>,
    rules: Arc<dyn RuleRepository>,
    calendar: Calendar,
    clock: SharedClock,
    default_lead_days: i64,
}

impl RuleLock {
    /// Lock policy over repositories
    pub fn new(
        catalog: Arc<dyn CatalogRepository>,
        rules: Arc<dyn RuleRepository>,
        calendar: Calendar,
        clock: SharedClock,
        default_lead_days: i64,
    ) -> Self {
        Self {
            catalog,
            rules,
            calendar,
            clock,
            default_lead_days,
        }
    }

    /// Lead days in force for a center
    pub async fn lead_days(&self, center_id: CenterId) -> Result<i64> {
        let center = self.catalog.get_center(center_id).await?;
        Ok(if center.settings.exception_lead_days > 0 {
            center.settings.exception_lead_days
        } else {
            self.default_lead_days
        })
    }

    /// Lock state of one occurrence of a rule
    pub async fn check(
        &self,
        center_id: CenterId,
        rule_id: RuleId,
        session_date: NaiveDate,
    ) -> Result<LockStatus> {
        let rule = self.rules.get_by_id(center_id, rule_id).await?;
        self.check_rule(&rule, session_date).await
    }

    /// Lock state of one occurrence of an already loaded rule
    pub async fn check_rule(&self, rule: &ScheduleRule, session_date: NaiveDate) -> Result<LockStatus> {
        let now = self.clock.now();
        let today = self.calendar.today(now);
        let lead_days = self.lead_days(rule.center_id).await?;

        if let Some(lock_at) = rule.lock_at {
            if now >= lock_at {
                return Ok(LockStatus {
                    locked: true,
                    deadline: self.calendar.today(lock_at),
                    days_remaining: 0,
                    lead_days,
                    reason: Some(LockReason::RuleLockAt),
                });
            }
        }
        Ok(evaluate(today, session_date, lead_days))
    }

    /// `Err(Locked)` when the occurrence can no longer change
    pub async fn ensure_unlocked(&self, rule: &ScheduleRule, session_date: NaiveDate) -> Result<()> {
        self.check_rule(rule, session_date).await?.into_result()
    }
}
