//! Utility modules for timeledger-core
//!
//! - retry: bounded retries with linear backoff

mod retry;

pub use retry::{retry_with_backoff, RetryConfig, RetryError};
