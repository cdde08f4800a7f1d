//! In-process adapters
//!
//! - [`InMemoryRepository`]: every repository trait over one locked state,
//!   enforcing the same invariants as the SQL adapter (exception uniqueness,
//!   compare-and-set tokens, tenancy on reads)
//! - [`InMemoryCache`]: TTL key/value cache with glob pattern deletion
//! - [`InMemoryLockStore`]: set-if-absent locks with expiry
//!
//! Used by tests and single-process deployments without Redis.

mod cache;
mod repository;

pub use cache::{InMemoryCache, InMemoryLockStore};
pub use repository::InMemoryRepository;
