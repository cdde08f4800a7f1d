//! The recurring maintenance jobs

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::engine::Job;
use super::triggers::JobTrigger;
use crate::calendar::{Calendar, SharedClock};
use crate::dispatch::{Notification, NotificationDispatcher};
use crate::error::{Error, Result};
use crate::exceptions::ExceptionService;
use crate::expansion::{ExpandedSchedule, ExpansionEngine, ExpansionQuery};
use crate::models::CenterId;
use crate::repository::{CatalogRepository, ReadMarkerRepository};

/// Name of the exception expiry job
pub const EXPIRE_EXCEPTIONS: &str = "expire_exceptions";
/// Name of the reminder job
pub const REMINDER_SWEEP: &str = "reminder_sweep";
/// Name of the read-marker cleanup job
pub const CLEANUP_READS: &str = "cleanup_reads";

/// Moves overdue pending exceptions to EXPIRED
pub struct ExpireExceptionsJob {
    service: ExceptionService,
    period: Duration,
}

impl ExpireExceptionsJob {
    /// Job running every `period`
    pub fn new(service: ExceptionService, period: Duration) -> Self {
        Self { service, period }
    }
}

#[async_trait]
impl Job for ExpireExceptionsJob {
    fn name(&self) -> &'static str {
        EXPIRE_EXCEPTIONS
    }

    fn trigger(&self) -> JobTrigger {
        JobTrigger::every(self.period)
    }

    async fn run(&self) -> Result<String> {
        let report = self.service.expire_overdue().await?;
        Ok(format!(
            "examined={} expired={} skipped={}",
            report.examined, report.expired, report.skipped
        ))
    }
}

/// Counts from one reminder sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReminderReport {
    /// Session date reminded about
    pub date: Option<NaiveDate>,
    /// Centers swept
    pub centers: usize,
    /// Reminders queued
    pub queued: usize,
    /// Centers already reminded for the date
    pub already_sent: usize,
    /// Centers whose expansion failed
    pub failed: usize,
}

/// Queues a reminder for every session taking place tomorrow
pub struct ReminderSweepJob {
    catalog: Arc<dyn CatalogRepository>,
    engine: ExpansionEngine,
    dispatcher: Arc<NotificationDispatcher>,
    calendar: Calendar,
    clock: SharedClock,
    hour: u16,
    sent: Mutex<HashSet<(NaiveDate, CenterId)>>,
}

impl ReminderSweepJob {
    /// Job running daily at `hour` center-local time
    pub fn new(
        catalog: Arc<dyn CatalogRepository>,
        engine: ExpansionEngine,
        dispatcher: Arc<NotificationDispatcher>,
        calendar: Calendar,
        clock: SharedClock,
        hour: u16,
    ) -> Self {
        Self {
            catalog,
            engine,
            dispatcher,
            calendar,
            clock,
            hour,
            sent: Mutex::new(HashSet::new()),
        }
    }

    /// Queue reminders for tomorrow. A center is reminded at most once per
    /// date by this process; failed centers are retried on the next run.
    pub async fn sweep(&self) -> Result<ReminderReport> {
        let today = self.calendar.today(self.clock.now());
        let tomorrow = today
            .succ_opt()
            .ok_or_else(|| Error::system("calendar overflow"))?;
        self.forget_before(tomorrow);

        let centers = self.catalog.list_centers().await?;
        let mut report = ReminderReport {
            date: Some(tomorrow),
            centers: centers.len(),
            ..ReminderReport::default()
        };
        let mut first_error = None;

        for center in centers {
            if self.already_sent(tomorrow, center.id) {
                report.already_sent += 1;
                continue;
            }
            let query = ExpansionQuery::center(center.id, tomorrow, tomorrow);
            let sessions = match self.engine.expand(&query).await {
                Ok(sessions) => sessions,
                Err(e) => {
                    warn!(center_id = center.id, error = %e, "Reminder expansion failed");
                    report.failed += 1;
                    first_error.get_or_insert(e);
                    continue;
                }
            };

            for notification in reminders(&sessions, tomorrow) {
                if self.dispatcher.dispatch(notification) {
                    report.queued += 1;
                }
            }
            self.mark_sent(tomorrow, center.id);
            debug!(center_id = center.id, date = %tomorrow, "Center reminded");
        }

        info!(
            date = %tomorrow,
            centers = report.centers,
            queued = report.queued,
            failed = report.failed,
            "Reminder sweep finished"
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    fn sent(&self) -> std::sync::MutexGuard<'_, HashSet<(NaiveDate, CenterId)>> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn already_sent(&self, date: NaiveDate, center_id: CenterId) -> bool {
        self.sent().contains(&(date, center_id))
    }

    fn mark_sent(&self, date: NaiveDate, center_id: CenterId) {
        self.sent().insert((date, center_id));
    }

    fn forget_before(&self, date: NaiveDate) {
        self.sent().retain(|(d, _)| *d >= date);
    }
}

/// Reminder records for the sessions of one occurrence date. Cross-day
/// sessions are reminded once with their real end time.
fn reminders(sessions: &[ExpandedSchedule], date: NaiveDate) -> Vec<Notification> {
    sessions
        .iter()
        .filter(|s| s.occurrence_date == date && !s.is_continuation() && s.takes_place())
        .map(|s| {
            let end_time = if s.is_cross_day_part {
                sessions
                    .iter()
                    .find(|c| c.rule_id == s.rule_id && c.occurrence_date == date && c.is_continuation())
                    .map_or(s.end_time, |c| c.end_time)
            } else {
                s.end_time
            };
            Notification::SessionReminder {
                center_id: s.center_id,
                rule_id: s.rule_id,
                teacher_id: s.teacher_id,
                room_id: s.room_id,
                date: s.effective_new_date.unwrap_or(s.date),
                start_time: s.start_time,
                end_time,
            }
        })
        .collect()
}

#[async_trait]
impl Job for ReminderSweepJob {
    fn name(&self) -> &'static str {
        REMINDER_SWEEP
    }

    fn trigger(&self) -> JobTrigger {
        JobTrigger::daily_at(self.hour)
    }

    async fn run(&self) -> Result<String> {
        let report = self.sweep().await?;
        Ok(format!(
            "centers={} queued={} already_sent={}",
            report.centers, report.queued, report.already_sent
        ))
    }
}

/// Purges read markers past the retention window
pub struct CleanupReadsJob {
    read_markers: Arc<dyn ReadMarkerRepository>,
    clock: SharedClock,
    retention_days: i64,
    period: Duration,
}

impl CleanupReadsJob {
    /// Job keeping `retention_days` of markers, running every `period`
    pub fn new(
        read_markers: Arc<dyn ReadMarkerRepository>,
        clock: SharedClock,
        retention_days: i64,
        period: Duration,
    ) -> Self {
        Self {
            read_markers,
            clock,
            retention_days,
            period,
        }
    }
}

#[async_trait]
impl Job for CleanupReadsJob {
    fn name(&self) -> &'static str {
        CLEANUP_READS
    }

    fn trigger(&self) -> JobTrigger {
        JobTrigger::every(self.period)
    }

    async fn run(&self) -> Result<String> {
        let cutoff = self.clock.now() - chrono::Duration::days(self.retention_days);
        let purged = self.read_markers.purge_older_than(cutoff).await?;
        if purged > 0 {
            info!(purged, cutoff = %cutoff, "Purged read markers");
        }
        Ok(format!("purged={}", purged))
    }
}
