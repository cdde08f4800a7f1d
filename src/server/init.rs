//! Server run loop
//!
//! Starts the background jobs and waits for Ctrl+C or SIGTERM, then drains
//! in-flight work before closing storage.

use super::app::App;
use super::config::AppConfig;
use anyhow::Result;
use timeledger_core::shutdown::shutdown_on_signal;
use tracing::{error, info, warn};

/// Run until a shutdown signal arrives
pub async fn run(config: AppConfig) -> Result<()> {
    info!("Starting TimeLedger v{}", env!("CARGO_PKG_VERSION"));

    let app = App::build(config).await?;
    if !app.backends.health_check().await.unwrap_or(false) {
        warn!("Storage health check failed; continuing");
    }

    let scheduler = app.job_scheduler()?;
    let token = app.shutdown.token();
    let scheduler_task = tokio::spawn(async move {
        scheduler.run(token).await;
    });

    info!("TimeLedger running, press Ctrl+C to stop");
    let drained = shutdown_on_signal(app.shutdown.clone()).await;
    if !drained {
        warn!("Shutdown timed out with work still in flight");
    }

    if let Err(e) = scheduler_task.await {
        error!(error = %e, "Job scheduler task failed");
    }
    app.close().await;
    info!("TimeLedger stopped");
    Ok(())
}
