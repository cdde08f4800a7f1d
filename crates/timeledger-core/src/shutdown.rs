//! Graceful shutdown coordination
//!
//! The controller hands out cancellation tokens and counts in-flight work.
//! `shutdown()` stops new work, cancels the tokens, then waits for the
//! counted work to drain within a timeout.
//!
//! ```ignore
//! let shutdown = ShutdownController::new();
//! tokio::spawn(scheduler.run(shutdown.token()));
//! wait_for_shutdown_signal().await;
//! shutdown.shutdown().await;
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default drain timeout
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Shutdown phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    /// Normal operation
    Running,
    /// No new work accepted
    Stopping,
    /// Waiting for in-flight work
    Draining,
    /// Drain timed out
    Terminating,
    /// Done
    Terminated,
}

impl ShutdownPhase {
    fn from_u32(value: u32) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::Stopping,
            2 => Self::Draining,
            3 => Self::Terminating,
            _ => Self::Terminated,
        }
    }
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "Running"),
            Self::Stopping => write!(f, "Stopping"),
            Self::Draining => write!(f, "Draining"),
            Self::Terminating => write!(f, "Terminating"),
            Self::Terminated => write!(f, "Terminated"),
        }
    }
}

/// Coordinates shutdown across the server, the job scheduler and the
/// notification dispatcher
pub struct ShutdownController {
    cancel_token: CancellationToken,
    phase_tx: broadcast::Sender<ShutdownPhase>,
    phase: AtomicU32,
    initiated: AtomicBool,
    active_tasks: AtomicU32,
    timeout: Duration,
}

impl ShutdownController {
    /// Controller with the default drain timeout
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_timeout(DEFAULT_SHUTDOWN_TIMEOUT)
    }

    /// Controller with a custom drain timeout
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Arc<Self> {
        let (phase_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            cancel_token: CancellationToken::new(),
            phase_tx,
            phase: AtomicU32::new(ShutdownPhase::Running as u32),
            initiated: AtomicBool::new(false),
            active_tasks: AtomicU32::new(0),
            timeout,
        })
    }

    /// Token cancelled when shutdown starts
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    /// Phase change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownPhase> {
        self.phase_tx.subscribe()
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> ShutdownPhase {
        ShutdownPhase::from_u32(self.phase.load(Ordering::SeqCst))
    }

    /// Whether shutdown has started
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.initiated.load(Ordering::SeqCst)
    }

    /// Whether new work may start
    #[must_use]
    pub fn is_accepting_work(&self) -> bool {
        self.phase() == ShutdownPhase::Running
    }

    /// Count a unit of in-flight work until the guard drops. Returns `None`
    /// once shutdown has started.
    pub fn register_task(self: &Arc<Self>) -> Option<TaskGuard> {
        if !self.is_accepting_work() {
            return None;
        }
        self.active_tasks.fetch_add(1, Ordering::SeqCst);
        Some(TaskGuard {
            controller: self.clone(),
            completed: false,
        })
    }

    /// In-flight work
    #[must_use]
    pub fn active_task_count(&self) -> u32 {
        self.active_tasks.load(Ordering::SeqCst)
    }

    fn set_phase(&self, phase: ShutdownPhase) {
        self.phase.store(phase as u32, Ordering::SeqCst);
        let _ = self.phase_tx.send(phase);
        info!(phase = %phase, "Shutdown phase changed");
    }

    /// Stop accepting work, cancel tokens and wait for in-flight work.
    /// Returns whether everything drained before the timeout.
    pub async fn shutdown(&self) -> bool {
        if self
            .initiated
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Shutdown already initiated");
            return true;
        }

        info!("Initiating graceful shutdown");
        self.set_phase(ShutdownPhase::Stopping);
        self.set_phase(ShutdownPhase::Draining);
        self.cancel_token.cancel();

        let started = tokio::time::Instant::now();
        let drained = loop {
            let active = self.active_task_count();
            if active == 0 {
                info!("All tasks completed");
                break true;
            }
            if started.elapsed() >= self.timeout {
                warn!(
                    active_tasks = active,
                    timeout_secs = self.timeout.as_secs(),
                    "Shutdown timeout exceeded, abandoning in-flight work"
                );
                self.set_phase(ShutdownPhase::Terminating);
                break false;
            }
            debug!(active_tasks = active, "Waiting for tasks to complete");
            tokio::time::sleep(DRAIN_POLL).await;
        };

        self.set_phase(ShutdownPhase::Terminated);
        drained
    }

    /// Cancel everything without draining
    pub fn force_shutdown(&self) {
        if self
            .initiated
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            warn!("Force shutdown initiated");
            self.set_phase(ShutdownPhase::Terminating);
            self.cancel_token.cancel();
            self.set_phase(ShutdownPhase::Terminated);
        }
    }
}

/// One unit of in-flight work; decrements the count when dropped
pub struct TaskGuard {
    controller: Arc<ShutdownController>,
    completed: bool,
}

impl TaskGuard {
    /// Mark the work done
    pub fn complete(mut self) {
        self.completed = true;
        self.controller.active_tasks.fetch_sub(1, Ordering::SeqCst);
    }

    /// Whether shutdown was requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.controller.cancel_token.is_cancelled()
    }

    /// Token cancelled on shutdown
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.controller.token()
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if !self.completed {
            self.controller.active_tasks.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Resolve on Ctrl+C or SIGTERM. A handler that cannot be installed is
/// logged and never fires.
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Wait for a signal, then run the controller's shutdown
pub async fn shutdown_on_signal(controller: Arc<ShutdownController>) -> bool {
    wait_for_shutdown_signal().await;
    controller.shutdown().await
}

#[cfg(test)]
mod tests;
