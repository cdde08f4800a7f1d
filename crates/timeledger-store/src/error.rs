//! Error types for timeledger-store

use thiserror::Error;

/// Adapter error type
///
/// Converted into [`timeledger_core::Error`] at the trait boundary: bad
/// configuration becomes a validation error, everything else a system error
/// carrying this value as its source.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite failure
    #[error("database error during {op}: {source}")]
    Database {
        /// Operation being performed
        op: &'static str,
        /// Driver error
        #[source]
        source: sqlx::Error,
    },

    /// Redis failure
    #[error("redis error during {op}: {source}")]
    Redis {
        /// Command being run
        op: &'static str,
        /// Client error
        #[source]
        source: redis::RedisError,
    },

    /// Stored value that no longer decodes
    #[error("corrupt {entity} row: {reason}")]
    Corrupt {
        /// Table
        entity: &'static str,
        /// What failed to decode
        reason: String,
    },

    /// Unusable store settings
    #[error("invalid store configuration: {0}")]
    Config(String),

    /// Filesystem failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Wrap a driver error
    pub fn db(op: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| Self::Database { op, source }
    }

    /// Wrap a redis error
    pub fn redis(op: &'static str) -> impl FnOnce(redis::RedisError) -> Self {
        move |source| Self::Redis { op, source }
    }

    /// Decode failure
    pub fn corrupt(entity: &'static str, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            entity,
            reason: reason.into(),
        }
    }

    /// Whether the driver rejected a write on a unique index
    #[must_use]
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::Database {
                source: sqlx::Error::Database(db),
                ..
            } => db.is_unique_violation(),
            _ => false,
        }
    }
}

impl From<StoreError> for timeledger_core::Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Config(message) => timeledger_core::Error::validation(message),
            other => {
                let message = other.to_string();
                timeledger_core::Error::system_with(message, other)
            }
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;
    use timeledger_core::ErrorKind;

    #[test]
    fn test_config_error_is_validation() {
        let err: timeledger_core::Error = StoreError::Config("bad backend".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_corrupt_row_is_system_with_source() {
        let err: timeledger_core::Error = StoreError::corrupt("rule", "start_min 9999").into();
        assert_eq!(err.kind(), ErrorKind::System);
        assert!(err.to_string().contains("corrupt rule row"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
