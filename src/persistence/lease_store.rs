//! Lease storage
//!
//! Every backend implements acquire-or-renew as ONE conditional upsert, so two
//! instances racing on an expired lease cannot both win: the row is inserted
//! when absent, and otherwise updated only when the caller already owns it or
//! the stored expiry has passed. No row comes back from the statement when the
//! condition fails, which is reported as `Denied`.
//!
//! `renew_count` is reset to 0 whenever ownership changes and incremented on
//! renewal, which is how `Acquired` is told apart from `Renewed`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use super::{from_millis, to_millis};
use crate::domain::{LeaseOutcome, LockLease};
use crate::error::{Result, RosterError};

/// Backing store for mutation-authority leases
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Atomically acquire, renew or take over the lease on `resource`.
    async fn try_acquire(
        &self,
        resource: &str,
        owner_id: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<LeaseOutcome>;

    /// Clear the lease only if `owner_id` still holds it. Returns whether a row was removed.
    async fn release(&self, resource: &str, owner_id: &str) -> Result<bool>;

    /// Current lease row, expired or not
    async fn current(&self, resource: &str) -> Result<Option<LockLease>>;

    /// Remove the lease regardless of owner (operator recovery only)
    async fn force_clear(&self, resource: &str) -> Result<bool>;
}

fn outcome_from_renew_count(renew_count: Option<i64>) -> LeaseOutcome {
    match renew_count {
        None => LeaseOutcome::Denied,
        Some(0) => LeaseOutcome::Acquired,
        Some(_) => LeaseOutcome::Renewed,
    }
}

/// SQLite lease store, for instances sharing one host and for tests
#[derive(Clone)]
pub struct SqliteLeaseStore {
    pool: SqlitePool,
}

impl SqliteLeaseStore {
    /// Wrap an already-migrated pool (see [`super::open_sqlite_pool`])
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeaseStore for SqliteLeaseStore {
    #[instrument(skip(self))]
    async fn try_acquire(
        &self,
        resource: &str,
        owner_id: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<LeaseOutcome> {
        let row = sqlx::query(
            r#"
            INSERT INTO bot_leases (resource_name, owner_id, acquired_at, expires_at, renew_count)
            VALUES (?1, ?2, ?3, ?4, 0)
            ON CONFLICT (resource_name) DO UPDATE SET
                renew_count = CASE WHEN bot_leases.owner_id = excluded.owner_id
                                   THEN bot_leases.renew_count + 1 ELSE 0 END,
                acquired_at = CASE WHEN bot_leases.owner_id = excluded.owner_id
                                   THEN bot_leases.acquired_at ELSE excluded.acquired_at END,
                owner_id = excluded.owner_id,
                expires_at = excluded.expires_at
            WHERE bot_leases.owner_id = excluded.owner_id
               OR bot_leases.expires_at <= ?3
            RETURNING renew_count
            "#,
        )
        .bind(resource)
        .bind(owner_id)
        .bind(to_millis(now))
        .bind(to_millis(expires_at))
        .fetch_optional(&self.pool)
        .await?;

        let outcome = outcome_from_renew_count(row.map(|r| r.get::<i64, _>("renew_count")));
        debug!("Lease {} for {}: {}", resource, owner_id, outcome);
        Ok(outcome)
    }

    async fn release(&self, resource: &str, owner_id: &str) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM bot_leases WHERE resource_name = ?1 AND owner_id = ?2")
                .bind(resource)
                .bind(owner_id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn current(&self, resource: &str) -> Result<Option<LockLease>> {
        let row = sqlx::query(
            r#"
            SELECT resource_name, owner_id, acquired_at, expires_at, renew_count
            FROM bot_leases WHERE resource_name = ?1
            "#,
        )
        .bind(resource)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| LockLease {
            resource_name: r.get("resource_name"),
            owner_id: r.get("owner_id"),
            acquired_at: from_millis(r.get("acquired_at")),
            expires_at: from_millis(r.get("expires_at")),
            renew_count: r.get::<i64, _>("renew_count").max(0) as u64,
        }))
    }

    async fn force_clear(&self, resource: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM bot_leases WHERE resource_name = ?1")
            .bind(resource)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            warn!("Lease {} forcefully cleared", resource);
        }
        Ok(result.rows_affected() > 0)
    }
}

/// PostgreSQL lease store on the shared datastore.
///
/// The lease table is migrated on first successful use, so the process can
/// start while the datastore is down.
#[derive(Clone)]
pub struct PgLeaseStore {
    pool: PgPool,
    migrated: Arc<OnceCell<()>>,
}

impl PgLeaseStore {
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            migrated: Arc::new(OnceCell::new()),
        }
    }

    /// Run lease migrations (once per store)
    pub async fn migrate(&self) -> Result<()> {
        self.migrated
            .get_or_try_init(|| async {
                sqlx::migrate!("./migrations/postgres").run(&self.pool).await?;
                info!("Lease migrations completed");
                Ok::<(), RosterError>(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for PgLeaseStore {
    #[instrument(skip(self))]
    async fn try_acquire(
        &self,
        resource: &str,
        owner_id: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<LeaseOutcome> {
        self.migrate().await?;
        let row = sqlx::query(
            r#"
            INSERT INTO bot_leases (resource_name, owner_id, acquired_at, expires_at, renew_count)
            VALUES ($1, $2, $3, $4, 0)
            ON CONFLICT (resource_name) DO UPDATE SET
                renew_count = CASE WHEN bot_leases.owner_id = EXCLUDED.owner_id
                                   THEN bot_leases.renew_count + 1 ELSE 0 END,
                acquired_at = CASE WHEN bot_leases.owner_id = EXCLUDED.owner_id
                                   THEN bot_leases.acquired_at ELSE EXCLUDED.acquired_at END,
                owner_id = EXCLUDED.owner_id,
                expires_at = EXCLUDED.expires_at
            WHERE bot_leases.owner_id = EXCLUDED.owner_id
               OR bot_leases.expires_at <= $3
            RETURNING renew_count
            "#,
        )
        .bind(resource)
        .bind(owner_id)
        .bind(now)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await?;

        let outcome = outcome_from_renew_count(row.map(|r| r.get::<i64, _>("renew_count")));
        debug!("Lease {} for {}: {}", resource, owner_id, outcome);
        Ok(outcome)
    }

    async fn release(&self, resource: &str, owner_id: &str) -> Result<bool> {
        self.migrate().await?;
        let result =
            sqlx::query("DELETE FROM bot_leases WHERE resource_name = $1 AND owner_id = $2")
                .bind(resource)
                .bind(owner_id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn current(&self, resource: &str) -> Result<Option<LockLease>> {
        self.migrate().await?;
        let row = sqlx::query(
            r#"
            SELECT resource_name, owner_id, acquired_at, expires_at, renew_count
            FROM bot_leases WHERE resource_name = $1
            "#,
        )
        .bind(resource)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| LockLease {
            resource_name: r.get("resource_name"),
            owner_id: r.get("owner_id"),
            acquired_at: r.get("acquired_at"),
            expires_at: r.get("expires_at"),
            renew_count: r.get::<i64, _>("renew_count").max(0) as u64,
        }))
    }

    async fn force_clear(&self, resource: &str) -> Result<bool> {
        self.migrate().await?;
        let result = sqlx::query("DELETE FROM bot_leases WHERE resource_name = $1")
            .bind(resource)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            warn!("Lease {} forcefully cleared", resource);
        }
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::open_memory_pool;
    use chrono::Duration;
    use std::sync::Arc;

    const RES: &str = "bot_authority";

    async fn store() -> SqliteLeaseStore {
        SqliteLeaseStore::from_pool(open_memory_pool().await.unwrap())
    }

    #[tokio::test]
    async fn test_acquire_renew_and_deny() {
        let store = store().await;
        let now = Utc::now();
        let ttl = Duration::seconds(120);

        assert_eq!(
            store.try_acquire(RES, "A", now, now + ttl).await.unwrap(),
            LeaseOutcome::Acquired
        );
        assert_eq!(
            store.try_acquire(RES, "A", now, now + ttl).await.unwrap(),
            LeaseOutcome::Renewed
        );
        assert_eq!(
            store.try_acquire(RES, "B", now, now + ttl).await.unwrap(),
            LeaseOutcome::Denied
        );

        let lease = store.current(RES).await.unwrap().unwrap();
        assert_eq!(lease.owner_id, "A");
        assert_eq!(lease.renew_count, 1);
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let store = store().await;
        let t0 = Utc::now();
        store
            .try_acquire(RES, "A", t0, t0 + Duration::seconds(10))
            .await
            .unwrap();

        let later = t0 + Duration::seconds(11);
        assert_eq!(
            store
                .try_acquire(RES, "B", later, later + Duration::seconds(10))
                .await
                .unwrap(),
            LeaseOutcome::Acquired
        );

        let lease = store.current(RES).await.unwrap().unwrap();
        assert_eq!(lease.owner_id, "B");
        assert_eq!(lease.renew_count, 0);
    }

    #[tokio::test]
    async fn test_concurrent_takeover_has_single_winner() {
        let store = Arc::new(store().await);
        let t0 = Utc::now();
        store
            .try_acquire(RES, "crashed", t0, t0 + Duration::seconds(1))
            .await
            .unwrap();

        let later = t0 + Duration::seconds(5);
        let mut handles = Vec::new();
        for owner in ["B", "C"] {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .try_acquire(RES, owner, later, later + Duration::seconds(120))
                    .await
                    .unwrap()
            }));
        }

        let mut outcomes = Vec::new();
        for h in handles {
            outcomes.push(h.await.unwrap());
        }
        assert_eq!(
            outcomes.iter().filter(|o| **o == LeaseOutcome::Acquired).count(),
            1
        );
        assert_eq!(
            outcomes.iter().filter(|o| **o == LeaseOutcome::Denied).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_release_only_by_owner() {
        let store = store().await;
        let now = Utc::now();
        store
            .try_acquire(RES, "A", now, now + Duration::seconds(60))
            .await
            .unwrap();

        assert!(!store.release(RES, "B").await.unwrap());
        assert!(store.current(RES).await.unwrap().is_some());
        assert!(store.release(RES, "A").await.unwrap());
        assert!(store.current(RES).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_force_clear() {
        let store = store().await;
        let now = Utc::now();
        store
            .try_acquire(RES, "A", now, now + Duration::seconds(60))
            .await
            .unwrap();

        assert!(store.force_clear(RES).await.unwrap());
        assert!(!store.force_clear(RES).await.unwrap());
    }
}
