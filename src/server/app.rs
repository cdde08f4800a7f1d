//! Component wiring shared by the server and one-shot CLI commands

use super::config::AppConfig;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use timeledger_core::{
    AlertSink, CleanupReadsJob, ExpireExceptionsJob, IdentityLock, IdentityRegistrar,
    JobScheduler, NotificationDispatcher, ReminderSweepJob, ScheduleService, SharedClock,
    ShutdownController, SystemClock, TracingAlertSink, TracingSink, WebhookAlertSink,
};
use timeledger_store::Backends;
use tracing::info;

/// Everything a running process needs
pub struct App {
    pub config: AppConfig,
    pub backends: Backends,
    pub service: ScheduleService,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub registrar: IdentityRegistrar,
    pub shutdown: Arc<ShutdownController>,
    clock: SharedClock,
}

impl App {
    /// Open storage and assemble the services
    pub async fn build(config: AppConfig) -> Result<Self> {
        let backends = Backends::from_config(&config.store)
            .await
            .context("Failed to open storage backends")?;

        let dispatcher = Arc::new(NotificationDispatcher::start(
            Arc::new(TracingSink),
            config.core.dispatch(),
        ));
        let clock: SharedClock = Arc::new(SystemClock);
        let service = ScheduleService::new(backends.repos.clone(), backends.cache.clone(), &config.core)
            .context("Failed to build schedule service")?
            .with_clock(clock.clone())
            .with_dispatcher(dispatcher.clone());

        let registrar = IdentityRegistrar::new(
            backends.repos.catalog.clone(),
            IdentityLock::new(backends.locks.clone(), config.core.identity_lock()),
        );
        let shutdown = ShutdownController::with_timeout(config.core.scheduler.shutdown_timeout());

        info!(
            timezone = %config.core.timezone,
            backend = %config.store.backend,
            "Schedule service assembled"
        );
        Ok(Self {
            config,
            backends,
            service,
            dispatcher,
            registrar,
            shutdown,
            clock,
        })
    }

    /// Job scheduler with the expiry, reminder and cleanup jobs
    pub fn job_scheduler(&self) -> Result<JobScheduler> {
        let settings = &self.config.core.scheduler;
        let alerts: Arc<dyn AlertSink> = match &self.config.alerts.webhook_url {
            Some(url) => Arc::new(
                WebhookAlertSink::with_timeout(
                    url.clone(),
                    Duration::from_secs(self.config.alerts.timeout_secs),
                )
                .context("Failed to build alert webhook client")?,
            ),
            None => Arc::new(TracingAlertSink),
        };

        JobScheduler::builder()
            .job(Arc::new(ExpireExceptionsJob::new(
                self.service.exception_service().clone(),
                settings.expire_interval(),
            )))
            .job(Arc::new(ReminderSweepJob::new(
                self.backends.repos.catalog.clone(),
                self.service.engine().clone(),
                self.dispatcher.clone(),
                self.service.calendar(),
                self.clock.clone(),
                settings.reminder_hour,
            )))
            .job(Arc::new(CleanupReadsJob::new(
                self.backends.repos.read_markers.clone(),
                self.clock.clone(),
                settings.read_retention_days,
                settings.cleanup_interval(),
            )))
            .alerts(alerts)
            .calendar(self.service.calendar())
            .clock(self.clock.clone())
            .config(self.config.core.job_scheduler())
            .shutdown(self.shutdown.clone())
            .build()
            .context("Failed to build job scheduler")
    }

    /// Drain notifications and close storage
    pub async fn close(&self) {
        let timeout = Duration::from_secs(self.config.core.dispatch.task_timeout_secs);
        if !self.dispatcher.shutdown(timeout).await {
            tracing::warn!("Notification queue not drained before timeout");
        }
        self.backends.close().await;
    }
}
