//! SQLite repositories
//!
//! One [`SqliteStore`] implements every repository trait of the core over a
//! single pool. Timestamps are RFC 3339 text with microsecond precision so
//! that `updated_at` round-trips exactly and can serve as the
//! compare-and-set token on rules and exceptions.

mod activity;
mod catalog;
mod exceptions;
mod helpers;
mod migrations;
mod rules;

#[cfg(test)]
mod tests;

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use timeledger_core::Repositories;
use tracing::{debug, info};

use crate::error::{Result, StoreError};

/// Default pool size for file databases
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// SQLite-backed repositories
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Wrap an existing pool; the schema must already be applied
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) a database file and apply the schema
    pub async fn from_path(path: impl AsRef<Path>, max_connections: u32) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(StoreError::db("parse sqlite path"))?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(StoreError::db("connect"))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!(path = %path.display(), max_connections, "SQLite store initialized");
        Ok(store)
    }

    /// Private in-memory database (tests, demos)
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(StoreError::db("connect"))?;

        let store = Self { pool };
        store.run_migrations().await?;
        debug!("In-memory SQLite store initialized");
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        for statement in migrations::SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(StoreError::db("migrate"))?;
        }
        debug!(statements = migrations::SCHEMA.len(), "SQLite schema applied");
        Ok(())
    }

    /// Underlying pool
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Round-trip a trivial query
    pub async fn health_check(&self) -> Result<bool> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::db("health check"))?;
        Ok(true)
    }

    /// Every repository handle served by this store
    #[must_use]
    pub fn repositories(self) -> Repositories {
        Repositories::from_single(Arc::new(self))
    }

    /// Close the pool, waiting for checked-out connections
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
