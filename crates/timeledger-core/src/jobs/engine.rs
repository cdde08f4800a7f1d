//! Job scheduler
//!
//! Keeps the next due instant of every registered job, checks them on a
//! fixed tick and runs due jobs on their own tasks. A job never overlaps
//! itself. Every run goes through the panic recovery boundary and failures
//! are reported to the [`AlertSink`]. On shutdown the scheduler stops
//! accepting triggers and waits for in-flight runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::alert::{AlertSink, JobAlert, TracingAlertSink};
use super::triggers::JobTrigger;
use crate::calendar::{Calendar, SharedClock, SystemClock};
use crate::error::{guard, Error, Result};
use crate::shutdown::{ShutdownController, TaskGuard};

/// A periodic, idempotent unit of background work
#[async_trait]
pub trait Job: Send + Sync {
    /// Stable name used in logs, alerts and manual triggers
    fn name(&self) -> &'static str;

    /// When the job becomes due
    fn trigger(&self) -> JobTrigger;

    /// Run once, returning a short summary
    async fn run(&self) -> Result<String>;
}

/// Scheduler settings
#[derive(Debug, Clone, Copy)]
pub struct JobSchedulerConfig {
    /// How often due jobs are checked
    pub tick: Duration,
    /// How long `run` waits for in-flight jobs after cancellation
    pub shutdown_timeout: Duration,
}

impl Default for JobSchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Result of a manual trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOutcome {
    /// A run was spawned
    Started,
    /// The job is already running
    AlreadyRunning,
    /// Shutdown has started
    ShuttingDown,
    /// No job by that name
    UnknownJob,
}

struct Inner {
    jobs: Vec<Arc<dyn Job>>,
    alerts: Arc<dyn AlertSink>,
    calendar: Calendar,
    clock: SharedClock,
    config: JobSchedulerConfig,
    running: Mutex<HashMap<&'static str, DateTime<Utc>>>,
    accepting: AtomicBool,
    shutdown: Option<Arc<ShutdownController>>,
}

/// Marks a job as running until dropped
struct RunSlot {
    inner: Arc<Inner>,
    name: &'static str,
    _task: Option<TaskGuard>,
}

impl Drop for RunSlot {
    fn drop(&mut self) {
        self.inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(self.name);
    }
}

/// Runs registered jobs on their triggers
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<Inner>,
}

impl JobScheduler {
    /// Start building a scheduler
    #[must_use]
    pub fn builder() -> JobSchedulerBuilder {
        JobSchedulerBuilder::new()
    }

    /// Registered job names
    #[must_use]
    pub fn job_names(&self) -> Vec<&'static str> {
        self.inner.jobs.iter().map(|j| j.name()).collect()
    }

    /// Jobs currently running
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.running().len()
    }

    /// Whether `name` is running
    #[must_use]
    pub fn is_running(&self, name: &str) -> bool {
        self.running().contains_key(name)
    }

    /// Whether triggers are still accepted
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
            && self
                .inner
                .shutdown
                .as_ref()
                .is_none_or(|s| s.is_accepting_work())
    }

    /// Refuse further triggers
    pub fn stop_accepting(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
    }

    fn running(&self) -> std::sync::MutexGuard<'_, HashMap<&'static str, DateTime<Utc>>> {
        self.inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn claim(&self, name: &str) -> std::result::Result<(Arc<dyn Job>, RunSlot), TriggerOutcome> {
        if !self.is_accepting() {
            return Err(TriggerOutcome::ShuttingDown);
        }
        let job = self
            .inner
            .jobs
            .iter()
            .find(|j| j.name() == name)
            .cloned()
            .ok_or(TriggerOutcome::UnknownJob)?;

        let task = match &self.inner.shutdown {
            Some(controller) => Some(
                controller
                    .register_task()
                    .ok_or(TriggerOutcome::ShuttingDown)?,
            ),
            None => None,
        };

        let mut running = self.running();
        if running.contains_key(job.name()) {
            return Err(TriggerOutcome::AlreadyRunning);
        }
        running.insert(job.name(), self.inner.clock.now());
        drop(running);

        let slot = RunSlot {
            inner: self.inner.clone(),
            name: job.name(),
            _task: task,
        };
        Ok((job, slot))
    }

    /// Start a run of `name` in the background
    pub fn trigger(&self, name: &str) -> TriggerOutcome {
        match self.claim(name) {
            Ok((job, slot)) => {
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    let _ = execute(&inner, job.as_ref()).await;
                    drop(slot);
                });
                TriggerOutcome::Started
            }
            Err(outcome) => {
                debug!(job = name, outcome = ?outcome, "Job trigger not started");
                outcome
            }
        }
    }

    /// Run `name` now and wait for its result
    pub async fn run_once(&self, name: &str) -> Result<String> {
        let (job, slot) = self.claim(name).map_err(|outcome| match outcome {
            TriggerOutcome::UnknownJob => Error::not_found("job", name),
            TriggerOutcome::AlreadyRunning => Error::concurrent("job", name),
            _ => Error::system(format!("cannot run {}: scheduler is shutting down", name)),
        })?;
        let result = execute(&self.inner, job.as_ref()).await;
        drop(slot);
        result
    }

    /// Drive the jobs until `shutdown` is cancelled, then wait for
    /// in-flight runs
    pub async fn run(&self, shutdown: CancellationToken) {
        let calendar = self.inner.calendar;
        let mut due: Vec<DateTime<Utc>> = {
            let now = self.inner.clock.now();
            self.inner
                .jobs
                .iter()
                .map(|j| j.trigger().next_after(&calendar, now))
                .collect()
        };

        info!(jobs = self.inner.jobs.len(), "Job scheduler starting");
        for (job, next) in self.inner.jobs.iter().zip(&due) {
            info!(job = job.name(), trigger = %job.trigger(), next_run = %next, "Job registered");
        }

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Job scheduler shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.inner.config.tick) => {}
            }

            let now = self.inner.clock.now();
            for (job, next) in self.inner.jobs.iter().zip(due.iter_mut()) {
                if now < *next {
                    continue;
                }
                if self.trigger(job.name()) == TriggerOutcome::AlreadyRunning {
                    warn!(job = job.name(), "Job still running, skipping this run");
                }
                *next = job.trigger().next_after(&calendar, now);
            }
        }

        self.stop_accepting();
        self.wait_for_running(self.inner.config.shutdown_timeout).await;
        info!("Job scheduler stopped");
    }

    /// Wait until no job runs or `timeout` passes. Returns whether all
    /// runs finished.
    pub async fn wait_for_running(&self, timeout: Duration) -> bool {
        let started = tokio::time::Instant::now();
        loop {
            let count = self.running_count();
            if count == 0 {
                return true;
            }
            if started.elapsed() >= timeout {
                warn!(running = count, "Timeout waiting for running jobs");
                return false;
            }
            debug!(running = count, "Waiting for running jobs");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

async fn execute(inner: &Inner, job: &dyn Job) -> Result<String> {
    let name = job.name();
    let started = tokio::time::Instant::now();
    debug!(job = name, "Job started");

    match guard(name, job.run()).await {
        Ok(summary) => {
            info!(
                job = name,
                elapsed_ms = started.elapsed().as_millis() as u64,
                summary = %summary,
                "Job finished"
            );
            Ok(summary)
        }
        Err(e) => {
            error!(job = name, code = e.kind().code(), error = %e, "Job failed");
            let alert = JobAlert::from_error(name, &e, inner.clock.now());
            if let Err(alert_err) = inner.alerts.alert(&alert).await {
                warn!(job = name, error = %alert_err, "Alert delivery failed");
            }
            Err(e)
        }
    }
}

/// Builder for [`JobScheduler`]
pub struct JobSchedulerBuilder {
    jobs: Vec<Arc<dyn Job>>,
    alerts: Arc<dyn AlertSink>,
    calendar: Calendar,
    clock: SharedClock,
    config: JobSchedulerConfig,
    shutdown: Option<Arc<ShutdownController>>,
}

impl JobSchedulerBuilder {
    /// Empty builder with the system clock and a tracing alert sink
    #[must_use]
    pub fn new() -> Self {
        Self {
            jobs: Vec::new(),
            alerts: Arc::new(TracingAlertSink),
            calendar: Calendar::default(),
            clock: Arc::new(SystemClock),
            config: JobSchedulerConfig::default(),
            shutdown: None,
        }
    }

    /// Register a job
    #[must_use]
    pub fn job(mut self, job: Arc<dyn Job>) -> Self {
        self.jobs.push(job);
        self
    }

    /// Alert destination
    #[must_use]
    pub fn alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    /// Calendar for daily triggers
    #[must_use]
    pub fn calendar(mut self, calendar: Calendar) -> Self {
        self.calendar = calendar;
        self
    }

    /// Clock
    #[must_use]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Settings
    #[must_use]
    pub fn config(mut self, config: JobSchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Count runs as in-flight work of a shutdown controller
    #[must_use]
    pub fn shutdown(mut self, controller: Arc<ShutdownController>) -> Self {
        self.shutdown = Some(controller);
        self
    }

    /// Build; duplicate job names are rejected
    pub fn build(self) -> Result<JobScheduler> {
        let mut seen = std::collections::HashSet::new();
        for job in &self.jobs {
            if !seen.insert(job.name()) {
                return Err(Error::validation(format!("duplicate job name: {}", job.name())));
            }
        }
        Ok(JobScheduler {
            inner: Arc::new(Inner {
                jobs: self.jobs,
                alerts: self.alerts,
                calendar: self.calendar,
                clock: self.clock,
                config: self.config,
                running: Mutex::new(HashMap::new()),
                accepting: AtomicBool::new(true),
                shutdown: self.shutdown,
            }),
        })
    }
}

impl Default for JobSchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
