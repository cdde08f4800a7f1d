//! TimeLedger Store - persistence adapters
//!
//! This crate implements the repository, cache and lock traits of
//! `timeledger-core`:
//! - [`SqliteStore`]: every repository over one SQLite pool
//! - [`RedisCache`] / [`RedisLockStore`]: shared expansion cache and locks
//! - [`Backends`]: wiring from a [`StoreConfig`]

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod error;
pub mod redis_store;
pub mod sqlite;

pub use backend::{Backends, StoreConfig};
pub use error::{Result, StoreError};
pub use redis_store::{RedisCache, RedisLockStore};
pub use sqlite::SqliteStore;
