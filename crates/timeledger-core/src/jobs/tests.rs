use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use super::*;
use crate::calendar::{Calendar, Clock, FixedClock, SharedClock};
use crate::dispatch::{DispatchConfig, Notification, NotificationDispatcher, NotificationSink};
use crate::error::{Error, ErrorKind, Result};
use crate::models::{ExceptionDraft, ExceptionStatus, NewException, Requester};
use crate::shutdown::ShutdownController;
use crate::testing::{clock, date, draft, time, Fixture, ADMIN, CENTER, ROOM_B};

/// Wall clock that follows tokio's (possibly paused) time
struct TokioClock {
    base: DateTime<Utc>,
    origin: tokio::time::Instant,
}

impl TokioClock {
    fn shared(base: DateTime<Utc>) -> SharedClock {
        Arc::new(Self {
            base,
            origin: tokio::time::Instant::now(),
        })
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.origin.elapsed()).unwrap();
        self.base + elapsed
    }
}

struct CountingJob {
    name: &'static str,
    period: Duration,
    runs: AtomicUsize,
    work: Duration,
}

impl CountingJob {
    fn new(name: &'static str, period: Duration) -> Arc<Self> {
        Arc::new(Self {
            name,
            period,
            runs: AtomicUsize::new(0),
            work: Duration::ZERO,
        })
    }

    fn slow(name: &'static str, work: Duration) -> Arc<Self> {
        Arc::new(Self {
            name,
            period: Duration::from_secs(3600),
            runs: AtomicUsize::new(0),
            work,
        })
    }

    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Job for CountingJob {
    fn name(&self) -> &'static str {
        self.name
    }

    fn trigger(&self) -> JobTrigger {
        JobTrigger::every(self.period)
    }

    async fn run(&self) -> Result<String> {
        if !self.work.is_zero() {
            tokio::time::sleep(self.work).await;
        }
        let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("run {}", n))
    }
}

struct FailingJob {
    panic: bool,
}

#[async_trait]
impl Job for FailingJob {
    fn name(&self) -> &'static str {
        if self.panic {
            "panicking"
        } else {
            "failing"
        }
    }

    fn trigger(&self) -> JobTrigger {
        JobTrigger::every(Duration::from_secs(60))
    }

    async fn run(&self) -> Result<String> {
        if self.panic {
            panic!("boom");
        }
        Err(Error::system("upstream down"))
    }
}

#[derive(Default)]
struct RecordingAlerts(Mutex<Vec<JobAlert>>);

#[async_trait]
impl AlertSink for RecordingAlerts {
    async fn alert(&self, alert: &JobAlert) -> Result<()> {
        self.0.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

#[derive(Default)]
struct RecordingSink(Mutex<Vec<Notification>>);

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        self.0.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    Calendar::default()
        .tz()
        .with_ymd_and_hms(y, m, d, h, min, 0)
        .unwrap()
        .with_timezone(&Utc)
}

#[test]
fn test_daily_trigger_next_run() {
    let calendar = Calendar::default();
    let trigger = JobTrigger::daily_at(18);

    assert_eq!(
        trigger.next_after(&calendar, utc(2026, 10, 19, 9, 0)),
        utc(2026, 10, 19, 18, 0)
    );
    assert_eq!(
        trigger.next_after(&calendar, utc(2026, 10, 19, 18, 0)),
        utc(2026, 10, 20, 18, 0)
    );
}

#[test]
fn test_every_trigger_next_run() {
    let now = utc(2026, 10, 19, 9, 0);
    let next = JobTrigger::every(Duration::from_secs(900)).next_after(&Calendar::default(), now);
    assert_eq!(next - now, chrono::Duration::minutes(15));
}

#[tokio::test(start_paused = true)]
async fn test_run_loop_fires_due_jobs() {
    let job = CountingJob::new("counter", Duration::from_secs(60));
    let scheduler = JobScheduler::builder()
        .job(job.clone())
        .clock(TokioClock::shared(utc(2026, 10, 19, 9, 0)))
        .config(JobSchedulerConfig {
            tick: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(5),
        })
        .build()
        .unwrap();

    let token = CancellationToken::new();
    let handle = tokio::spawn({
        let scheduler = scheduler.clone();
        let token = token.clone();
        async move { scheduler.run(token).await }
    });

    tokio::time::sleep(Duration::from_secs(185)).await;
    token.cancel();
    handle.await.unwrap();

    assert_eq!(job.runs(), 3);
    assert!(!scheduler.is_accepting());
    assert_eq!(scheduler.trigger("counter"), TriggerOutcome::ShuttingDown);
}

#[tokio::test(start_paused = true)]
async fn test_trigger_does_not_overlap() {
    let job = CountingJob::slow("slow", Duration::from_secs(5));
    let scheduler = JobScheduler::builder().job(job.clone()).build().unwrap();

    assert_eq!(scheduler.trigger("slow"), TriggerOutcome::Started);
    assert_eq!(scheduler.trigger("slow"), TriggerOutcome::AlreadyRunning);
    assert_eq!(scheduler.trigger("nope"), TriggerOutcome::UnknownJob);
    assert!(scheduler.is_running("slow"));

    assert!(scheduler.wait_for_running(Duration::from_secs(30)).await);
    assert_eq!(job.runs(), 1);
    assert_eq!(scheduler.trigger("slow"), TriggerOutcome::Started);
}

#[tokio::test]
async fn test_run_once_reports_errors_and_alerts() {
    let alerts = Arc::new(RecordingAlerts::default());
    let scheduler = JobScheduler::builder()
        .job(Arc::new(FailingJob { panic: false }))
        .job(Arc::new(FailingJob { panic: true }))
        .alerts(alerts.clone())
        .clock(clock("2026-10-19"))
        .build()
        .unwrap();

    let err = scheduler.run_once("failing").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::System);

    let err = scheduler.run_once("panicking").await.unwrap_err();
    assert!(err.stack().is_some());
    assert!(err.to_string().contains("boom"));

    let recorded = alerts.0.lock().unwrap();
    assert_eq!(recorded.len(), 2);
    assert_eq!(recorded[0].job, "failing");
    assert_eq!(recorded[0].code, "SYSTEM_ERROR");
    assert_eq!(recorded[1].job, "panicking");
    drop(recorded);

    assert_eq!(scheduler.running_count(), 0);
    let err = scheduler.run_once("missing").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_controller_waits_for_job() {
    let controller = ShutdownController::new();
    let job = CountingJob::slow("slow", Duration::from_secs(3));
    let scheduler = JobScheduler::builder()
        .job(job.clone())
        .shutdown(controller.clone())
        .build()
        .unwrap();

    assert_eq!(scheduler.trigger("slow"), TriggerOutcome::Started);
    assert_eq!(controller.active_task_count(), 1);

    assert!(controller.shutdown().await);
    assert_eq!(job.runs(), 1);
    assert_eq!(scheduler.trigger("slow"), TriggerOutcome::ShuttingDown);
}

#[test]
fn test_duplicate_job_names_rejected() {
    let err = JobScheduler::builder()
        .job(CountingJob::new("a", Duration::from_secs(1)))
        .job(CountingJob::new("a", Duration::from_secs(2)))
        .build()
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_expire_job_is_idempotent() {
    let fx = Fixture::new().await;
    let rule = fx
        .rule_store()
        .create(draft(1, "10:00", "11:00", Some(fx.teachers[0])))
        .await
        .unwrap();
    fx.repos
        .exceptions
        .create(NewException {
            center_id: CENTER,
            draft: ExceptionDraft::cancel(rule.id, date("2026-10-12"), "sick"),
            status: ExceptionStatus::Pending,
            requested_by: Requester::Teacher(fx.teachers[0]),
            reviewed_by: None,
            reviewed_at: None,
        })
        .await
        .unwrap();

    let job = ExpireExceptionsJob::new(
        fx.exception_service(clock("2026-10-19")),
        Duration::from_secs(900),
    );
    assert_eq!(job.name(), EXPIRE_EXCEPTIONS);
    assert_eq!(job.run().await.unwrap(), "examined=1 expired=1 skipped=0");
    assert_eq!(job.run().await.unwrap(), "examined=0 expired=0 skipped=0");
}

#[tokio::test]
async fn test_reminder_sweep_skips_cancelled_and_dedups() {
    let fx = Fixture::new().await;
    let store = fx.rule_store();
    let morning = store
        .create(draft(1, "10:00", "11:00", Some(fx.teachers[0])))
        .await
        .unwrap();
    let mut late = draft(1, "23:00", "01:00", Some(fx.teachers[1]));
    late.room_id = ROOM_B;
    let late = store.create(late).await.unwrap();
    let mut cancelled = draft(1, "14:00", "15:00", Some(fx.teachers[0]));
    cancelled.room_id = ROOM_B;
    let cancelled = store.create(cancelled).await.unwrap();
    fx.repos
        .exceptions
        .create(NewException {
            center_id: CENTER,
            draft: ExceptionDraft::cancel(cancelled.id, date("2026-10-19"), "closed"),
            status: ExceptionStatus::Approved,
            requested_by: Requester::Admin(ADMIN),
            reviewed_by: Some(ADMIN),
            reviewed_at: Some(Utc::now()),
        })
        .await
        .unwrap();

    let sink = Arc::new(RecordingSink::default());
    let dispatcher = Arc::new(NotificationDispatcher::start(
        sink.clone(),
        DispatchConfig::default(),
    ));
    let job = ReminderSweepJob::new(
        fx.repos.catalog.clone(),
        fx.engine(),
        dispatcher.clone(),
        Calendar::default(),
        clock("2026-10-18"),
        18,
    );
    assert_eq!(job.trigger(), JobTrigger::daily_at(18));

    let report = job.sweep().await.unwrap();
    assert_eq!(report.date, Some(date("2026-10-19")));
    assert_eq!(report.centers, 2);
    assert_eq!(report.queued, 2);

    let again = job.sweep().await.unwrap();
    assert_eq!(again.queued, 0);
    assert_eq!(again.already_sent, 2);

    assert!(dispatcher.shutdown(Duration::from_secs(5)).await);
    let mut delivered = sink.0.lock().unwrap().clone();
    delivered.sort_by_key(|n| match n {
        Notification::SessionReminder { start_time, .. } => *start_time,
        _ => time("00:00"),
    });
    assert_eq!(delivered.len(), 2);
    match &delivered[0] {
        Notification::SessionReminder { rule_id, date: on, .. } => {
            assert_eq!(*rule_id, morning.id);
            assert_eq!(*on, date("2026-10-19"));
        }
        other => panic!("unexpected {:?}", other),
    }
    match &delivered[1] {
        Notification::SessionReminder {
            rule_id, end_time, ..
        } => {
            assert_eq!(*rule_id, late.id);
            assert_eq!(*end_time, time("01:00"));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_cleanup_purges_old_markers() {
    let fx = Fixture::new().await;
    let now = utc(2026, 10, 19, 10, 0);
    fx.repos
        .read_markers
        .mark_read(fx.teachers[0], "exception:1", now - chrono::Duration::days(120))
        .await
        .unwrap();
    fx.repos
        .read_markers
        .mark_read(fx.teachers[0], "exception:2", now - chrono::Duration::days(10))
        .await
        .unwrap();

    let job = CleanupReadsJob::new(
        fx.repos.read_markers.clone(),
        Arc::new(FixedClock(now)),
        90,
        Duration::from_secs(86_400),
    );
    assert_eq!(job.run().await.unwrap(), "purged=1");
    assert_eq!(job.run().await.unwrap(), "purged=0");
}
