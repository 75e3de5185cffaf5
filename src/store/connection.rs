//! SQLite pool construction with durability pragmas

use crate::store::{schema, StoreError, StoreResult};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::time::Duration;

/// Pool sizing and timeout tuning
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Maximum pooled connections
    pub max_connections: u32,

    /// Acquire timeout in seconds
    pub connect_timeout: u64,

    /// SQLite busy timeout in milliseconds
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_connections: 8,
            connect_timeout: 30,
            busy_timeout_ms: 5_000,
        }
    }
}

/// Shared handle to the embedded database
///
/// Durability contract: WAL journal mode and `synchronous=FULL` are applied
/// per connection, so every committed transaction is flushed before the
/// commit returns. Foreign keys are enabled per connection for cascade
/// delete from jobs to target outcomes.
#[derive(Clone)]
pub struct StorePool {
    pool: SqlitePool,
}

impl StorePool {
    /// Open (creating if missing) the store at the given path and run
    /// outstanding migrations
    pub async fn open(path: &Path, config: StoreConfig) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|_| StoreError::InvalidPath(path.to_path_buf()))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout))
            .connect_with(options)
            .await?;

        let store = Self { pool };
        schema::run_migrations(&store).await?;
        Ok(store)
    }

    /// Open an in-memory store for tests
    ///
    /// A single pooled connection keeps every caller on the same in-memory
    /// database.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .journal_mode(SqliteJournalMode::Memory)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        schema::run_migrations(&store).await?;
        Ok(store)
    }

    /// Underlying pool, for query execution
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the pool, flushing outstanding work
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_in_memory_runs_migrations() {
        let store = StorePool::open_in_memory().await.unwrap();
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM jobs")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(row.0, 0);
    }

    #[tokio::test]
    async fn test_open_on_disk_is_reopenable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store/forker.db");

        let store = StorePool::open(&path, StoreConfig::default()).await.unwrap();
        sqlx::query("INSERT INTO events (job_id, kind, payload, timestamp) VALUES ('j', 'k', '{}', 't')")
            .execute(store.pool())
            .await
            .unwrap();
        store.close().await;

        let reopened = StorePool::open(&path, StoreConfig::default()).await.unwrap();
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM events")
            .fetch_one(reopened.pool())
            .await
            .unwrap();
        assert_eq!(row.0, 1);
    }
}
