//! Backend selection from configuration

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use timeledger_core::repository::{CacheStore, LockStore};
use timeledger_core::{InMemoryCache, InMemoryLockStore, InMemoryRepository, Repositories};
use tracing::info;

use crate::error::{Result, StoreError};
use crate::redis_store::{RedisCache, RedisLockStore, DEFAULT_PREFIX};
use crate::sqlite::{SqliteStore, DEFAULT_MAX_CONNECTIONS};

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Repository backend: "sqlite" (default) or "memory"
    #[serde(default = "default_backend")]
    pub backend: String,

    /// SQLite database file
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: PathBuf,

    /// SQLite pool size
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Cache and lock backend: "memory" (default) or "redis"
    #[serde(default = "default_cache_backend")]
    pub cache_backend: String,

    /// Redis URL (only used when cache_backend = "redis")
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Namespace for every Redis key
    #[serde(default = "default_redis_prefix")]
    pub redis_prefix: String,
}

fn default_backend() -> String {
    "sqlite".to_string()
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("data/timeledger.db")
}

fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}

fn default_cache_backend() -> String {
    "memory".to_string()
}

fn default_redis_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            sqlite_path: default_sqlite_path(),
            max_connections: default_max_connections(),
            cache_backend: default_cache_backend(),
            redis_url: None,
            redis_prefix: default_redis_prefix(),
        }
    }
}

/// Repository, cache and lock handles wired from a [`StoreConfig`]
#[derive(Clone)]
pub struct Backends {
    /// Repository handles
    pub repos: Repositories,
    /// Key/value cache
    pub cache: Arc<dyn CacheStore>,
    /// Lock primitive
    pub locks: Arc<dyn LockStore>,
    sqlite: Option<SqliteStore>,
}

impl Backends {
    /// Open the configured backends
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Config` for unknown backend names and propagates
    /// connection failures.
    pub async fn from_config(config: &StoreConfig) -> Result<Self> {
        let (repos, sqlite) = match config.backend.as_str() {
            "sqlite" => {
                let store = SqliteStore::from_path(&config.sqlite_path, config.max_connections).await?;
                (store.clone().repositories(), Some(store))
            }
            "memory" => (
                Repositories::from_single(Arc::new(InMemoryRepository::new())),
                None,
            ),
            other => {
                return Err(StoreError::Config(format!(
                    "Unknown storage backend: '{}'. Use 'sqlite' or 'memory'.",
                    other
                )))
            }
        };

        let (cache, locks): (Arc<dyn CacheStore>, Arc<dyn LockStore>) =
            match config.cache_backend.as_str() {
                "memory" => (
                    Arc::new(InMemoryCache::new()),
                    Arc::new(InMemoryLockStore::new()),
                ),
                "redis" => {
                    let url = config.redis_url.as_deref().ok_or_else(|| {
                        StoreError::Config("cache_backend 'redis' requires redis_url".to_string())
                    })?;
                    (
                        Arc::new(RedisCache::with_prefix(url, &config.redis_prefix)?),
                        Arc::new(RedisLockStore::with_prefix(url, &config.redis_prefix)?),
                    )
                }
                other => {
                    return Err(StoreError::Config(format!(
                        "Unknown cache backend: '{}'. Use 'memory' or 'redis'.",
                        other
                    )))
                }
            };

        info!(
            backend = %config.backend,
            cache_backend = %config.cache_backend,
            "Storage backends ready"
        );
        Ok(Self {
            repos,
            cache,
            locks,
            sqlite,
        })
    }

    /// Ping the database when one is configured
    pub async fn health_check(&self) -> Result<bool> {
        match &self.sqlite {
            Some(store) => store.health_check().await,
            None => Ok(true),
        }
    }

    /// Release pooled connections
    pub async fn close(&self) {
        if let Some(store) = &self.sqlite {
            store.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_from_empty_document() {
        let config: StoreConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.backend, "sqlite");
        assert_eq!(config.cache_backend, "memory");
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert!(config.redis_url.is_none());
    }

    #[tokio::test]
    async fn test_unknown_backend_is_config_error() {
        let config = StoreConfig {
            backend: "postgres".to_string(),
            ..StoreConfig::default()
        };
        let err = Backends::from_config(&config).await.err().unwrap();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[tokio::test]
    async fn test_redis_cache_requires_url() {
        let config = StoreConfig {
            backend: "memory".to_string(),
            cache_backend: "redis".to_string(),
            ..StoreConfig::default()
        };
        let err = Backends::from_config(&config).await.err().unwrap();
        assert!(err.to_string().contains("redis_url"));
    }

    #[tokio::test]
    async fn test_sqlite_backend_opens_file() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            sqlite_path: dir.path().join("nested").join("ledger.db"),
            ..StoreConfig::default()
        };
        let backends = Backends::from_config(&config).await.unwrap();
        assert!(backends.health_check().await.unwrap());
        assert!(backends.repos.catalog.list_centers().await.unwrap().is_empty());
        backends.close().await;
    }
}
