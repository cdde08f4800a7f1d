//! Job failure alerts

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::{Error, Result};

/// Default timeout for webhook delivery
pub const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// A failed job run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAlert {
    /// Job name
    pub job: String,
    /// Error code (`SYSTEM_ERROR`, ...)
    pub code: String,
    /// Error text
    pub message: String,
    /// When the run failed
    pub at: DateTime<Utc>,
}

impl JobAlert {
    /// Alert for a job error
    #[must_use]
    pub fn from_error(job: &str, err: &Error, at: DateTime<Utc>) -> Self {
        Self {
            job: job.to_string(),
            code: err.kind().code().to_string(),
            message: err.to_string(),
            at,
        }
    }
}

/// External telemetry receiving job failures
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Report one failure
    async fn alert(&self, alert: &JobAlert) -> Result<()>;
}

/// Logs alerts at error level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn alert(&self, alert: &JobAlert) -> Result<()> {
        error!(
            job = %alert.job,
            code = %alert.code,
            message = %alert.message,
            "Job alert"
        );
        Ok(())
    }
}

/// Posts alerts as JSON to a webhook
#[derive(Debug, Clone)]
pub struct WebhookAlertSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlertSink {
    /// Sink for `url` with the default timeout
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(url, WEBHOOK_TIMEOUT)
    }

    /// Sink for `url` with a custom timeout
    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::system_with("failed to build alert client", e))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    /// Target URL
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn alert(&self, alert: &JobAlert) -> Result<()> {
        self.client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| Error::system_with("alert webhook failed", e))?;
        Ok(())
    }
}
