//! Durable local state
//!
//! This module owns everything that must survive a process restart while the
//! roster datastore is unreachable:
//! - SQLite-backed transaction queue storage
//! - Lease storage (SQLite for single-host deployments, PostgreSQL otherwise)
//! - The transaction queue built on top of the store

pub mod lease_store;
pub mod queue_store;
pub mod transaction_queue;

pub use lease_store::{LeaseStore, PgLeaseStore, SqliteLeaseStore};
pub use queue_store::{QueueStats, QueueStore};
pub use transaction_queue::TransactionQueue;

use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::error::Result;

/// Timestamps are stored as epoch milliseconds in SQLite
pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

/// Open (creating if needed) the local queue database and run migrations
pub async fn open_sqlite_pool(path: impl AsRef<Path>) -> Result<SqlitePool> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations/sqlite").run(&pool).await?;
    info!("Queue database ready at {}", path.display());
    Ok(pool)
}

/// Single-connection in-memory database, for tests and dry runs
pub async fn open_memory_pool() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations/sqlite").run(&pool).await?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_roundtrip_truncates_to_ms() {
        let ts = from_millis(1_700_000_000_123);
        assert_eq!(to_millis(ts), 1_700_000_000_123);
    }

    #[tokio::test]
    async fn test_open_file_pool_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("queue.db");

        let pool = open_sqlite_pool(&path).await.unwrap();
        assert!(path.exists());
        pool.close().await;
    }
}
