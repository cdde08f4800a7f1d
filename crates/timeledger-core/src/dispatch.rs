//! Notification dispatch
//!
//! Notifications are typed records handed to a [`NotificationSink`]; delivery
//! itself (messaging, email) lives outside the core. The dispatcher runs
//! deliveries on a bounded pool: a fixed-capacity queue feeds at most
//! `workers` concurrent deliveries, each under its own timeout. A full queue
//! drops the notification with a warning instead of blocking the caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::calendar::ClockTime;
use crate::error::Result;
use crate::models::{
    CenterId, ExceptionId, ExceptionStatus, ExceptionType, Requester, RoomId, RuleId, TeacherId,
};

/// Typed notification record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Notification {
    /// A change request awaits review
    ExceptionSubmitted {
        /// Center
        center_id: CenterId,
        /// Exception
        exception_id: ExceptionId,
        /// Rule
        rule_id: RuleId,
        /// Occurrence date
        original_date: NaiveDate,
        /// Kind
        exception_type: ExceptionType,
        /// Filer
        requested_by: Requester,
    },
    /// A change request was decided or withdrawn
    ExceptionReviewed {
        /// Center
        center_id: CenterId,
        /// Exception
        exception_id: ExceptionId,
        /// Rule
        rule_id: RuleId,
        /// Occurrence date
        original_date: NaiveDate,
        /// New status
        status: ExceptionStatus,
        /// Teacher to inform
        teacher_id: Option<TeacherId>,
    },
    /// A session takes place tomorrow
    SessionReminder {
        /// Center
        center_id: CenterId,
        /// Rule
        rule_id: RuleId,
        /// Teacher
        teacher_id: Option<TeacherId>,
        /// Room
        room_id: RoomId,
        /// Session date
        date: NaiveDate,
        /// Start
        start_time: ClockTime,
        /// End
        end_time: ClockTime,
    },
}

impl Notification {
    /// Short name for logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExceptionSubmitted { .. } => "exception_submitted",
            Self::ExceptionReviewed { .. } => "exception_reviewed",
            Self::SessionReminder { .. } => "session_reminder",
        }
    }

    /// Center concerned
    #[must_use]
    pub fn center_id(&self) -> CenterId {
        match self {
            Self::ExceptionSubmitted { center_id, .. }
            | Self::ExceptionReviewed { center_id, .. }
            | Self::SessionReminder { center_id, .. } => *center_id,
        }
    }
}

/// Delivery backend
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver one notification
    async fn deliver(&self, notification: &Notification) -> Result<()>;
}

/// Sink that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        let payload = serde_json::to_string(notification).unwrap_or_default();
        info!(
            kind = notification.kind(),
            center_id = notification.center_id(),
            payload = %payload,
            "Notification"
        );
        Ok(())
    }
}

/// Dispatcher settings
#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    /// Concurrent deliveries
    pub workers: usize,
    /// Queued notifications before dropping
    pub queue_capacity: usize,
    /// Per-delivery deadline
    pub task_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 256,
            task_timeout: Duration::from_secs(10),
        }
    }
}

/// Dispatcher counters
#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time dispatcher counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    /// Queued successfully
    pub accepted: u64,
    /// Delivered
    pub delivered: u64,
    /// Sink returned an error
    pub failed: u64,
    /// Exceeded the per-delivery deadline
    pub timed_out: u64,
    /// Refused because the queue was full or closed
    pub dropped: u64,
}

/// Bounded, supervised notification pool
pub struct NotificationDispatcher {
    tx: mpsc::Sender<Notification>,
    counters: Arc<Counters>,
    permits: Arc<Semaphore>,
    workers: usize,
    cancel: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationDispatcher {
    /// Start the pool. Must be called inside a Tokio runtime.
    pub fn start(sink: Arc<dyn NotificationSink>, config: DispatchConfig) -> Self {
        let workers = config.workers.max(1);
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let counters = Arc::new(Counters::default());
        let permits = Arc::new(Semaphore::new(workers));
        let cancel = CancellationToken::new();

        let pump = tokio::spawn(pump(
            rx,
            sink,
            permits.clone(),
            counters.clone(),
            cancel.clone(),
            config.task_timeout,
        ));

        Self {
            tx,
            counters,
            permits,
            workers,
            cancel,
            pump: Mutex::new(Some(pump)),
        }
    }

    /// Queue a notification without waiting. Returns whether it was accepted.
    pub fn dispatch(&self, notification: Notification) -> bool {
        if self.cancel.is_cancelled() {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(kind = notification.kind(), "Dispatcher shutting down, notification dropped");
            return false;
        }
        match self.tx.try_send(notification) {
            Ok(()) => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(n)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(kind = n.kind(), center_id = n.center_id(), "Notification queue full, dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(n)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(kind = n.kind(), "Notification queue closed, dropped");
                false
            }
        }
    }

    /// Current counters
    #[must_use]
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting, deliver what is queued, and wait up to `timeout` for
    /// in-flight deliveries. Returns whether everything finished in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.cancel.cancel();
        let handle = self.pump.lock().await.take();
        let drained = async {
            if let Some(handle) = handle {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Notification pump ended abnormally");
                }
            }
            // Every permit back means no delivery is running
            let all = u32::try_from(self.workers).unwrap_or(u32::MAX);
            let _ = self.permits.acquire_many(all).await;
        };
        match tokio::time::timeout(timeout, drained).await {
            Ok(()) => {
                info!(stats = ?self.stats(), "Notification dispatcher stopped");
                true
            }
            Err(_) => {
                warn!(
                    timeout_secs = timeout.as_secs(),
                    "Notification dispatcher shutdown timed out"
                );
                false
            }
        }
    }
}

async fn pump(
    mut rx: mpsc::Receiver<Notification>,
    sink: Arc<dyn NotificationSink>,
    permits: Arc<Semaphore>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
    task_timeout: Duration,
) {
    loop {
        let next = tokio::select! {
            biased;
            n = rx.recv() => n,
            _ = cancel.cancelled() => rx.try_recv().ok(),
        };
        let Some(notification) = next else {
            break;
        };
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let sink = sink.clone();
        let counters = counters.clone();
        tokio::spawn(async move {
            let _permit = permit;
            match tokio::time::timeout(task_timeout, sink.deliver(&notification)).await {
                Ok(Ok(())) => {
                    counters.delivered.fetch_add(1, Ordering::Relaxed);
                    debug!(kind = notification.kind(), "Notification delivered");
                }
                Ok(Err(e)) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(kind = notification.kind(), error = %e, "Notification delivery failed");
                }
                Err(_) => {
                    counters.timed_out.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        kind = notification.kind(),
                        timeout_secs = task_timeout.as_secs(),
                        "Notification delivery timed out"
                    );
                }
            }
        });
    }
    debug!("Notification pump stopped");
}
