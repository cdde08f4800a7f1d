//! Error types for timeledger-core
//!
//! Every failure the engine can surface maps onto one [`ErrorKind`], whose
//! wire code and status class are stable. Entrypoints run under [`guard`],
//! which turns a panic into a system error carrying the captured stack.

use std::any::Any;
use std::backtrace::Backtrace;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use chrono::NaiveDate;
use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use crate::models::ExceptionStatus;
use crate::validation::Conflict;

/// Boxed low-level cause attached to system errors
pub type BoxedSource = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Core error type
#[derive(Debug, Error)]
pub enum Error {
    /// Referenced id is absent or outside the caller's tenant
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity name (rule, exception, ...)
        entity: &'static str,
        /// Identifier as given by the caller
        id: String,
    },

    /// Input violates a declared invariant
    #[error("validation failed: {0}")]
    Validation(String),

    /// Action not permitted for the actor
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Disallowed exception status transition
    #[error("invalid status transition: {from} -> {to}")]
    InvalidStatus {
        /// Current status
        from: ExceptionStatus,
        /// Requested status
        to: ExceptionStatus,
    },

    /// Hard scheduling overlap (never overridable)
    #[error("schedule overlap with {} existing session(s)", conflicts.len())]
    Overlap {
        /// Conflicting sessions
        conflicts: Vec<Conflict>,
    },

    /// Buffer requirement not met (overridable when the offering allows it)
    #[error("buffer requirement not met, short by {deficit} minute(s)")]
    Buffer {
        /// Buffer conflicts
        conflicts: Vec<Conflict>,
        /// Largest deficit in minutes
        deficit: i64,
    },

    /// Write refers to resources that do not belong together
    #[error("rule conflict: {0}")]
    RuleConflict(String),

    /// Edit or exception attempted past the modification deadline
    #[error("locked since {deadline}: {reason}")]
    Locked {
        /// Last day on which changes were allowed
        deadline: NaiveDate,
        /// Days until the deadline (zero once passed)
        days_remaining: i64,
        /// Which policy locked the session
        reason: String,
    },

    /// Optimistic concurrency token mismatch
    #[error("{entity} {id} was modified concurrently")]
    ConcurrentModified {
        /// Entity name
        entity: &'static str,
        /// Identifier
        id: String,
    },

    /// Unexpected upstream failure
    #[error("system error: {message}")]
    System {
        /// Description of the failure
        message: String,
        /// Original low-level error
        #[source]
        source: Option<BoxedSource>,
        /// Captured stack, present for recovered panics
        stack: Option<String>,
    },
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Stable error classification shared with callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// `NOT_FOUND`
    NotFound,
    /// `PARAMS_VALIDATE_ERROR`
    Validation,
    /// `INVALID_STATUS`
    InvalidStatus,
    /// `SCHED_OVERLAP`
    Overlap,
    /// `SCHED_BUFFER`
    Buffer,
    /// `SCHED_RULE_CONFLICT`
    RuleConflict,
    /// `ERR_RESOURCE_LOCKED`
    Locked,
    /// `ERR_CONCURRENT_MODIFIED`
    ConcurrentModified,
    /// `FORBIDDEN`
    Forbidden,
    /// `SYSTEM_ERROR`
    System,
}

impl ErrorKind {
    /// Wire code
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::Validation => "PARAMS_VALIDATE_ERROR",
            Self::InvalidStatus => "INVALID_STATUS",
            Self::Overlap => "SCHED_OVERLAP",
            Self::Buffer => "SCHED_BUFFER",
            Self::RuleConflict => "SCHED_RULE_CONFLICT",
            Self::Locked => "ERR_RESOURCE_LOCKED",
            Self::ConcurrentModified => "ERR_CONCURRENT_MODIFIED",
            Self::Forbidden => "FORBIDDEN",
            Self::System => "SYSTEM_ERROR",
        }
    }

    /// HTTP-style status class a transport layer should map this kind to
    #[must_use]
    pub fn status_class(self) -> u16 {
        match self {
            Self::Validation | Self::InvalidStatus => 400,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::Overlap
            | Self::Buffer
            | Self::RuleConflict
            | Self::Locked
            | Self::ConcurrentModified => 409,
            Self::System => 500,
        }
    }

    /// Whether a client may retry the same request unchanged
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::ConcurrentModified | Self::System)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

impl Error {
    /// Classify this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Validation(_) => ErrorKind::Validation,
            Error::Forbidden(_) => ErrorKind::Forbidden,
            Error::InvalidStatus { .. } => ErrorKind::InvalidStatus,
            Error::Overlap { .. } => ErrorKind::Overlap,
            Error::Buffer { .. } => ErrorKind::Buffer,
            Error::RuleConflict(_) => ErrorKind::RuleConflict,
            Error::Locked { .. } => ErrorKind::Locked,
            Error::ConcurrentModified { .. } => ErrorKind::ConcurrentModified,
            Error::System { .. } => ErrorKind::System,
        }
    }

    /// Not-found error for an entity id
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    /// Concurrent-modification error for an entity id
    pub fn concurrent(entity: &'static str, id: impl ToString) -> Self {
        Error::ConcurrentModified {
            entity,
            id: id.to_string(),
        }
    }

    /// System error without an underlying cause
    pub fn system(message: impl Into<String>) -> Self {
        Error::System {
            message: message.into(),
            source: None,
            stack: None,
        }
    }

    /// System error wrapping the original low-level error
    pub fn system_with<E>(message: impl Into<String>, source: E) -> Self
    where
        E: Into<BoxedSource>,
    {
        Error::System {
            message: message.into(),
            source: Some(source.into()),
            stack: None,
        }
    }

    /// Numeric deficit carried by buffer errors
    #[must_use]
    pub fn deficit(&self) -> Option<i64> {
        match self {
            Error::Buffer { deficit, .. } => Some(*deficit),
            _ => None,
        }
    }

    /// Captured stack of a recovered panic
    #[must_use]
    pub fn stack(&self) -> Option<&str> {
        match self {
            Error::System { stack, .. } => stack.as_deref(),
            _ => None,
        }
    }
}

/// Human-readable rendering of core errors for operators
pub trait UserFriendlyError {
    /// Short message suitable for a terminal or chat surface
    fn user_message(&self) -> String;

    /// Hint on how to resolve the error
    fn suggestion(&self) -> Option<String>;
}

impl UserFriendlyError for Error {
    fn user_message(&self) -> String {
        match self {
            Error::NotFound { entity, id } => format!("No {} with id {} in this center.", entity, id),
            Error::Validation(msg) => format!("Invalid input: {}", msg),
            Error::Forbidden(msg) => format!("Not allowed: {}", msg),
            Error::InvalidStatus { from, to } => {
                format!("An exception in state {} cannot move to {}.", from, to)
            }
            Error::Overlap { conflicts } => format!(
                "The session overlaps {} existing session(s).",
                conflicts.len()
            ),
            Error::Buffer { deficit, .. } => format!(
                "Not enough break between sessions ({} minute(s) short).",
                deficit
            ),
            Error::RuleConflict(msg) => format!("Schedule rule conflict: {}", msg),
            Error::Locked {
                deadline, reason, ..
            } => format!("Changes closed on {} ({}).", deadline, reason),
            Error::ConcurrentModified { entity, .. } => {
                format!("The {} was changed by someone else.", entity)
            }
            Error::System { message, .. } => format!("Internal error: {}", message),
        }
    }

    fn suggestion(&self) -> Option<String> {
        match self {
            Error::Buffer { .. } => Some(
                "Move the session or approve with buffer override if the offering allows it."
                    .to_string(),
            ),
            Error::ConcurrentModified { .. } => {
                Some("Reload the latest version and try again.".to_string())
            }
            Error::Locked { .. } => Some("Ask a center admin to make the change.".to_string()),
            _ => None,
        }
    }
}

/// Format an error for the CLI
pub fn format_error_for_cli(error: &Error) -> String {
    let mut output = format!("[{}] {}", error.kind(), error.user_message());
    if let Some(suggestion) = error.suggestion() {
        output.push('\n');
        output.push_str(&suggestion);
    }
    output
}

/// Run an entrypoint future under a panic recovery boundary.
///
/// A panic becomes [`Error::System`] with the panic message and a captured
/// stack; the process keeps running.
pub async fn guard<F, T>(operation: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            let stack = Backtrace::force_capture().to_string();
            error!(
                operation = operation,
                panic = %message,
                stack = %stack,
                "Recovered panic in entrypoint"
            );
            Err(Error::System {
                message: format!("{} panicked: {}", operation, message),
                source: None,
                stack: Some(stack),
            })
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
