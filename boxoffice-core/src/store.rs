//! Identity store connection handling.
//!
//! [`IdentityStore`] owns the SQLite connection pool that backs
//! [`SqliteAccountRepository`](crate::SqliteAccountRepository). It is
//! constructed explicitly from a [`StoreConfig`] and handed to the
//! repository; there is no process-wide instance.
//!
//! # Example
//!
//! ```rust,ignore
//! use boxoffice_core::{IdentityStore, SqliteAccountRepository, StoreConfig};
//!
//! let store = IdentityStore::connect(&StoreConfig::default()).await?;
//! store.migrate().await?;
//! let repo = SqliteAccountRepository::new(&store);
//! ```

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Error type for store setup and maintenance.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database URL could not be parsed.
    #[error("invalid database URL: {0}")]
    InvalidUrl(#[source] sqlx::Error),

    /// The pool could not open a connection.
    #[error("unable to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    /// Schema migrations failed.
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// The database did not answer a ping.
    #[error("database unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),
}

/// Connection pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite URL, e.g. `sqlite://boxoffice.db` or `sqlite::memory:`.
    pub url: String,

    pub max_connections: u32,

    pub min_connections: u32,

    /// Maximum lifetime of a pooled connection, in seconds.
    pub max_lifetime_secs: u64,

    /// How long to wait for a free connection, in seconds.
    pub acquire_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://boxoffice.db".to_string(),
            max_connections: 10,
            min_connections: 1,
            max_lifetime_secs: 3600,
            acquire_timeout_secs: 5,
        }
    }
}

impl StoreConfig {
    /// Settings for a private in-memory database.
    ///
    /// In-memory SQLite databases live inside one connection, so the pool
    /// is pinned to a single connection that never expires.
    pub fn in_memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            min_connections: 1,
            max_lifetime_secs: 0,
            ..Self::default()
        }
    }

    fn is_in_memory(&self) -> bool {
        self.url.contains(":memory:") || self.url.contains("mode=memory")
    }
}

/// Snapshot of pool health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreHealth {
    /// `"up"` or `"down"`.
    pub status: String,
    pub message: String,
    pub open_connections: u32,
    pub idle_connections: usize,
    pub max_connections: u32,
}

/// Owned handle to the relational identity store.
#[derive(Debug, Clone)]
pub struct IdentityStore {
    pool: SqlitePool,
    max_connections: u32,
}

impl IdentityStore {
    /// Open a connection pool using the given settings.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let mut options = SqliteConnectOptions::from_str(&config.url)
            .map_err(StoreError::InvalidUrl)?
            .create_if_missing(true)
            .foreign_keys(true);

        if !config.is_in_memory() {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs));

        pool_options = if config.is_in_memory() {
            pool_options.max_lifetime(None).idle_timeout(None)
        } else {
            pool_options
                .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
                .idle_timeout(Duration::from_secs(300))
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(StoreError::Connect)?;

        info!(
            max_connections = config.max_connections,
            in_memory = config.is_in_memory(),
            "Connected to identity store"
        );

        Ok(Self {
            pool,
            max_connections: config.max_connections.max(1),
        })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: SqlitePool) -> Self {
        let max_connections = pool.options().get_max_connections();
        Self {
            pool,
            max_connections,
        }
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        debug!("Identity store migrations applied");
        Ok(())
    }

    /// Check that the database answers.
    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(StoreError::Unavailable)?;
        Ok(())
    }

    /// Ping the database and summarize pool usage.
    pub async fn health(&self) -> StoreHealth {
        let open_connections = self.pool.size();
        let idle_connections = self.pool.num_idle();

        if let Err(e) = self.ping().await {
            return StoreHealth {
                status: "down".to_string(),
                message: e.to_string(),
                open_connections,
                idle_connections,
                max_connections: self.max_connections,
            };
        }

        let busy = (open_connections as usize).saturating_sub(idle_connections);
        let message = if idle_connections == 0 && open_connections >= self.max_connections {
            "Connection pool is exhausted, consider increasing max connections."
        } else if busy as f64 > f64::from(self.max_connections) * 0.8 {
            "The database is experiencing heavy load."
        } else {
            "It's healthy"
        };

        StoreHealth {
            status: "up".to_string(),
            message: message.to_string(),
            open_connections,
            idle_connections,
            max_connections: self.max_connections,
        }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close all connections, waiting for checked-out ones to return.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_in_memory_and_migrate() {
        let store = IdentityStore::connect(&StoreConfig::in_memory())
            .await
            .unwrap();
        store.migrate().await.unwrap();
        store.ping().await.unwrap();

        let health = store.health().await;
        assert_eq!(health.status, "up");
        assert_eq!(health.max_connections, 1);
    }

    #[tokio::test]
    async fn test_migrate_is_repeatable() {
        let store = IdentityStore::connect(&StoreConfig::in_memory())
            .await
            .unwrap();
        store.migrate().await.unwrap();
        store.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn test_health_reports_down_after_close() {
        let store = IdentityStore::connect(&StoreConfig::in_memory())
            .await
            .unwrap();
        store.close().await;

        let health = store.health().await;
        assert_eq!(health.status, "down");
    }

    #[test]
    fn test_config_defaults_fill_missing_fields() {
        let config: StoreConfig = serde_json::from_str(r#"{"url": "sqlite::memory:"}"#).unwrap();
        assert_eq!(config.url, "sqlite::memory:");
        assert_eq!(config.max_connections, StoreConfig::default().max_connections);
        assert!(config.is_in_memory());
    }

    #[tokio::test]
    async fn test_file_database_persists_across_reconnect() {
        use crate::model::NewAccount;
        use crate::repository::{AccountRepository, SqliteAccountRepository};

        let dir = tempfile::TempDir::new().unwrap();
        let config = StoreConfig {
            url: format!("sqlite://{}", dir.path().join("boxoffice.db").display()),
            max_connections: 2,
            ..StoreConfig::default()
        };

        let store = IdentityStore::connect(&config).await.unwrap();
        store.migrate().await.unwrap();
        let created = SqliteAccountRepository::new(&store)
            .create_account(&NewAccount::new("a@x.com", "Ada"))
            .await
            .unwrap();
        store.close().await;

        let store = IdentityStore::connect(&config).await.unwrap();
        store.migrate().await.unwrap();
        let found = SqliteAccountRepository::new(&store)
            .find_by_email("a@x.com")
            .await
            .unwrap();
        assert_eq!(found.id, created.id);
        store.close().await;
    }
}
