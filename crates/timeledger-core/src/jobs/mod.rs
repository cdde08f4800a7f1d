//! Recurring background jobs
//!
//! Three idempotent jobs keep the schedule tidy:
//!
//! - **expire_exceptions**: pending requests whose date has passed become EXPIRED
//! - **reminder_sweep**: once a day, a reminder for each session taking place tomorrow
//! - **cleanup_reads**: read markers past the retention window are purged
//!
//! ```ignore
//! let scheduler = JobScheduler::builder()
//!     .job(Arc::new(ExpireExceptionsJob::new(exceptions, Duration::from_secs(900))))
//!     .alerts(Arc::new(WebhookAlertSink::new(url)?))
//!     .shutdown(controller.clone())
//!     .build()?;
//! scheduler.run(controller.token()).await;
//! ```

mod alert;
mod engine;
mod sweeps;
mod triggers;

pub use alert::{AlertSink, JobAlert, TracingAlertSink, WebhookAlertSink, WEBHOOK_TIMEOUT};
pub use engine::{Job, JobScheduler, JobSchedulerBuilder, JobSchedulerConfig, TriggerOutcome};
pub use sweeps::{
    CleanupReadsJob, ExpireExceptionsJob, ReminderReport, ReminderSweepJob, CLEANUP_READS,
    EXPIRE_EXCEPTIONS, REMINDER_SWEEP,
};
pub use triggers::JobTrigger;

#[cfg(test)]
mod tests;
