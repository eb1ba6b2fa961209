//! SQLite storage for the transaction queue
//!
//! Every status change is a single conditional `UPDATE` keyed on the id and
//! the expected current status. Two drains racing for the same item are
//! serialized by SQLite and exactly one of them sees a changed row.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use tracing::{debug, instrument};

use super::{from_millis, to_millis};
use crate::domain::{QueuedTransaction, TransactionKind, TransactionPayload, TransactionStatus};
use crate::error::{Result, RosterError};

const SELECT_COLUMNS: &str = "id, kind, payload, status, retries, max_retries, last_error, \
     enqueued_at, next_attempt_at, claimed_by, claimed_at, updated_at";

/// Aggregate view of the queue for status surfaces
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total: usize,
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    /// Pending free-agent moves
    pub free_agent_moves: usize,
    /// Pending trade approvals
    pub trade_approvals: usize,
    pub oldest_pending_at: Option<DateTime<Utc>>,
}

impl QueueStats {
    /// Items not yet in a terminal state
    pub fn pending(&self) -> usize {
        self.queued + self.processing
    }
}

/// Durable queue rows in enqueue (`seq`) order
#[derive(Clone)]
pub struct QueueStore {
    pool: SqlitePool,
}

impl QueueStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    #[instrument(skip(self, tx), fields(transaction_id = %tx.id, kind = %tx.kind))]
    pub async fn insert(&self, tx: &QueuedTransaction) -> Result<()> {
        let payload = serde_json::to_string(&tx.payload)?;

        sqlx::query(
            r#"
            INSERT INTO transaction_queue
                (id, kind, payload, status, retries, max_retries, last_error,
                 enqueued_at, next_attempt_at, claimed_by, claimed_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(&tx.id)
        .bind(tx.kind.as_str())
        .bind(payload)
        .bind(tx.status.as_str())
        .bind(tx.retries as i64)
        .bind(tx.max_retries as i64)
        .bind(&tx.last_error)
        .bind(to_millis(tx.enqueued_at))
        .bind(to_millis(tx.next_attempt_at))
        .bind(&tx.claimed_by)
        .bind(tx.claimed_at.map(to_millis))
        .bind(to_millis(tx.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<QueuedTransaction>> {
        let sql = format!("SELECT {} FROM transaction_queue WHERE id = ?1", SELECT_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(row_to_transaction).transpose()
    }

    /// Queued and processing items in enqueue order, optionally for one kind
    pub async fn list_pending(&self, kind: Option<TransactionKind>) -> Result<Vec<QueuedTransaction>> {
        let rows = match kind {
            Some(kind) => {
                let sql = format!(
                    "SELECT {} FROM transaction_queue \
                     WHERE status IN ('queued', 'processing') AND kind = ?1 ORDER BY seq",
                    SELECT_COLUMNS
                );
                sqlx::query(&sql)
                    .bind(kind.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM transaction_queue \
                     WHERE status IN ('queued', 'processing') ORDER BY seq",
                    SELECT_COLUMNS
                );
                sqlx::query(&sql).fetch_all(&self.pool).await?
            }
        };

        rows.iter().map(row_to_transaction).collect()
    }

    /// One page of all records, optionally filtered by status
    pub async fn list_page(
        &self,
        status: Option<TransactionStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<QueuedTransaction>> {
        let rows = match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {} FROM transaction_queue WHERE status = ?1 \
                     ORDER BY seq LIMIT ?2 OFFSET ?3",
                    SELECT_COLUMNS
                );
                sqlx::query(&sql)
                    .bind(status.as_str())
                    .bind(limit as i64)
                    .bind(offset as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM transaction_queue ORDER BY seq LIMIT ?1 OFFSET ?2",
                    SELECT_COLUMNS
                );
                sqlx::query(&sql)
                    .bind(limit as i64)
                    .bind(offset as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter().map(row_to_transaction).collect()
    }

    /// Oldest queued item whose backoff has elapsed
    pub async fn next_due(&self, now: DateTime<Utc>) -> Result<Option<QueuedTransaction>> {
        let sql = format!(
            "SELECT {} FROM transaction_queue \
             WHERE status = 'queued' AND next_attempt_at <= ?1 ORDER BY seq LIMIT 1",
            SELECT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(to_millis(now))
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_transaction).transpose()
    }

    /// Earliest `next_attempt_at` among queued items
    pub async fn earliest_next_attempt(&self) -> Result<Option<DateTime<Utc>>> {
        let earliest: Option<i64> = sqlx::query_scalar(
            "SELECT MIN(next_attempt_at) FROM transaction_queue WHERE status = 'queued'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(earliest.map(from_millis))
    }

    /// `Queued -> Processing`. Returns false when the item is not currently queued.
    #[instrument(skip(self))]
    pub async fn claim(&self, id: &str, owner_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE transaction_queue
            SET status = 'processing', claimed_by = ?2, claimed_at = ?3, updated_at = ?3
            WHERE id = ?1 AND status = 'queued'
            "#,
        )
        .bind(id)
        .bind(owner_id)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// `Processing -> Completed`
    pub async fn complete(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE transaction_queue
            SET status = 'completed', claimed_by = NULL, claimed_at = NULL, updated_at = ?2
            WHERE id = ?1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Count a failed attempt on a processing item. The item goes back to
    /// `Queued` (not before `next_attempt_at`) until `retries` reaches
    /// `max_retries`, then becomes `Failed`. Returns the new status and retry
    /// count, or `None` if the item was not processing.
    #[instrument(skip(self))]
    pub async fn record_failure(
        &self,
        id: &str,
        error: &str,
        now: DateTime<Utc>,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<Option<(TransactionStatus, u32)>> {
        let row = sqlx::query(
            r#"
            UPDATE transaction_queue
            SET retries = retries + 1,
                status = CASE WHEN retries + 1 >= max_retries THEN 'failed' ELSE 'queued' END,
                last_error = ?2,
                next_attempt_at = ?4,
                claimed_by = NULL,
                claimed_at = NULL,
                updated_at = ?3
            WHERE id = ?1 AND status = 'processing'
            RETURNING status, retries
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(to_millis(now))
        .bind(to_millis(next_attempt_at))
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            let status = TransactionStatus::try_from(r.get::<String, _>("status").as_str())?;
            Ok((status, r.get::<i64, _>("retries").max(0) as u32))
        })
        .transpose()
    }

    /// Terminal failure without consuming a retry
    pub async fn reject(&self, id: &str, reason: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE transaction_queue
            SET status = 'failed', last_error = ?2, claimed_by = NULL, claimed_at = NULL,
                updated_at = ?3
            WHERE id = ?1 AND status IN ('queued', 'processing')
            "#,
        )
        .bind(id)
        .bind(reason)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Return processing claims taken at or before `cutoff` to the queue
    pub async fn reclaim_stale(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE transaction_queue
            SET status = 'queued', claimed_by = NULL, claimed_at = NULL, updated_at = ?2
            WHERE status = 'processing' AND claimed_at <= ?1
            "#,
        )
        .bind(to_millis(cutoff))
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Return every claim held by `owner_id` to the queue
    pub async fn release_claims_by(&self, owner_id: &str, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE transaction_queue
            SET status = 'queued', claimed_by = NULL, claimed_at = NULL, updated_at = ?2
            WHERE status = 'processing' AND claimed_by = ?1
            "#,
        )
        .bind(owner_id)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Operator requeue: `Failed -> Queued` with the retry budget restored
    pub async fn requeue_failed(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE transaction_queue
            SET status = 'queued', retries = 0, next_attempt_at = ?2, updated_at = ?2
            WHERE id = ?1 AND status = 'failed'
            "#,
        )
        .bind(id)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Delete terminal records last touched before `cutoff`
    pub async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM transaction_queue
            WHERE status IN ('completed', 'failed') AND updated_at < ?1
            "#,
        )
        .bind(to_millis(cutoff))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            debug!("Purged {} terminal queue records", result.rows_affected());
        }
        Ok(result.rows_affected())
    }

    pub async fn clear(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM transaction_queue")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn pending_count(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM transaction_queue WHERE status IN ('queued', 'processing')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as usize)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let rows = sqlx::query(
            "SELECT kind, status, COUNT(*) AS n FROM transaction_queue GROUP BY kind, status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = QueueStats::default();
        for row in rows {
            let kind = TransactionKind::try_from(row.get::<String, _>("kind").as_str())?;
            let status = TransactionStatus::try_from(row.get::<String, _>("status").as_str())?;
            let n = row.get::<i64, _>("n").max(0) as usize;

            stats.total += n;
            match status {
                TransactionStatus::Queued => stats.queued += n,
                TransactionStatus::Processing => stats.processing += n,
                TransactionStatus::Completed => stats.completed += n,
                TransactionStatus::Failed => stats.failed += n,
            }
            if status.is_pending() {
                match kind {
                    TransactionKind::FreeAgentMove => stats.free_agent_moves += n,
                    TransactionKind::TradeApproval => stats.trade_approvals += n,
                }
            }
        }

        let oldest: Option<i64> = sqlx::query_scalar(
            "SELECT MIN(enqueued_at) FROM transaction_queue WHERE status IN ('queued', 'processing')",
        )
        .fetch_one(&self.pool)
        .await?;
        stats.oldest_pending_at = oldest.map(from_millis);

        Ok(stats)
    }
}

fn row_to_transaction(row: &SqliteRow) -> Result<QueuedTransaction> {
    let kind = TransactionKind::try_from(row.get::<String, _>("kind").as_str())?;
    let status = TransactionStatus::try_from(row.get::<String, _>("status").as_str())?;
    let payload: TransactionPayload = serde_json::from_str(&row.get::<String, _>("payload"))?;

    if payload.kind() != kind {
        return Err(RosterError::Validation(format!(
            "payload kind {} does not match row kind {}",
            payload.kind(),
            kind
        )));
    }

    Ok(QueuedTransaction {
        id: row.get("id"),
        kind,
        payload,
        status,
        enqueued_at: from_millis(row.get("enqueued_at")),
        retries: row.get::<i64, _>("retries").max(0) as u32,
        max_retries: row.get::<i64, _>("max_retries").max(0) as u32,
        last_error: row.get("last_error"),
        next_attempt_at: from_millis(row.get("next_attempt_at")),
        claimed_by: row.get("claimed_by"),
        claimed_at: row.get::<Option<i64>, _>("claimed_at").map(from_millis),
        updated_at: from_millis(row.get("updated_at")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FreeAgentMove, TradeApproval};
    use crate::persistence::open_memory_pool;
    use chrono::Duration;

    fn fa(n: u32) -> QueuedTransaction {
        QueuedTransaction::new(
            TransactionPayload::FreeAgentMove(FreeAgentMove {
                team: "Lakers".to_string(),
                drop_player: format!("Drop{}", n),
                sign_player: format!("Sign{}", n),
                bid_amount: n,
                user_id: "user123".to_string(),
                message_id: format!("msg-{}", n),
            }),
            3,
        )
    }

    fn trade() -> QueuedTransaction {
        QueuedTransaction::new(
            TransactionPayload::TradeApproval(TradeApproval {
                message_id: "trade-msg".to_string(),
                team_one: "Lakers".to_string(),
                team_two: "Celtics".to_string(),
                team_one_sends: vec!["A".to_string()],
                team_two_sends: vec!["B".to_string(), "C".to_string()],
                user_id: "admin".to_string(),
            }),
            3,
        )
    }

    async fn store() -> QueueStore {
        QueueStore::from_pool(open_memory_pool().await.unwrap())
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = store().await;
        let tx = trade();
        store.insert(&tx).await.unwrap();

        let loaded = store.get(&tx.id).await.unwrap().unwrap();
        assert_eq!(loaded.payload, tx.payload);
        assert_eq!(loaded.status, TransactionStatus::Queued);
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_pending_preserves_order_and_filters_kind() {
        let store = store().await;
        let (a, t, b) = (fa(1), trade(), fa(2));
        for tx in [&a, &t, &b] {
            store.insert(tx).await.unwrap();
        }

        let all: Vec<String> = store
            .list_pending(None)
            .await
            .unwrap()
            .into_iter()
            .map(|tx| tx.id)
            .collect();
        assert_eq!(all, vec![a.id.clone(), t.id.clone(), b.id.clone()]);

        let fas = store
            .list_pending(Some(TransactionKind::FreeAgentMove))
            .await
            .unwrap();
        assert_eq!(fas.len(), 2);
        assert_eq!(fas[0].id, a.id);
    }

    #[tokio::test]
    async fn test_claim_only_once() {
        let store = store().await;
        let tx = fa(1);
        store.insert(&tx).await.unwrap();

        let now = Utc::now();
        assert!(store.claim(&tx.id, "A", now).await.unwrap());
        assert!(!store.claim(&tx.id, "B", now).await.unwrap());

        let loaded = store.get(&tx.id).await.unwrap().unwrap();
        assert_eq!(loaded.claimed_by.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn test_record_failure_until_terminal() {
        let store = store().await;
        let tx = fa(1);
        store.insert(&tx).await.unwrap();
        let now = Utc::now();

        for expected in 1..3u32 {
            assert!(store.claim(&tx.id, "A", now).await.unwrap());
            let (status, retries) = store
                .record_failure(&tx.id, "timeout", now, now)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(status, TransactionStatus::Queued);
            assert_eq!(retries, expected);
        }

        assert!(store.claim(&tx.id, "A", now).await.unwrap());
        let (status, retries) = store
            .record_failure(&tx.id, "timeout", now, now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, TransactionStatus::Failed);
        assert_eq!(retries, 3);

        // Not processing anymore
        assert!(store
            .record_failure(&tx.id, "timeout", now, now)
            .await
            .unwrap()
            .is_none());
        assert!(!store.claim(&tx.id, "A", now).await.unwrap());
    }

    #[tokio::test]
    async fn test_next_due_respects_backoff() {
        let store = store().await;
        let (a, b) = (fa(1), fa(2));
        store.insert(&a).await.unwrap();
        store.insert(&b).await.unwrap();
        let now = Utc::now();

        store.claim(&a.id, "A", now).await.unwrap();
        store
            .record_failure(&a.id, "timeout", now, now + Duration::seconds(30))
            .await
            .unwrap();

        assert_eq!(store.next_due(now).await.unwrap().unwrap().id, b.id);
        assert_eq!(
            store.earliest_next_attempt().await.unwrap().map(to_millis),
            Some(to_millis(b.next_attempt_at))
        );
        store.claim(&b.id, "A", now).await.unwrap();
        assert!(store.next_due(now).await.unwrap().is_none());
        assert_eq!(
            store
                .next_due(now + Duration::seconds(31))
                .await
                .unwrap()
                .unwrap()
                .id,
            a.id
        );
    }

    #[tokio::test]
    async fn test_reclaim_and_release_claims() {
        let store = store().await;
        let (a, b) = (fa(1), fa(2));
        store.insert(&a).await.unwrap();
        store.insert(&b).await.unwrap();
        let t0 = Utc::now();

        store.claim(&a.id, "crashed", t0).await.unwrap();
        store.claim(&b.id, "me", t0 + Duration::seconds(200)).await.unwrap();

        let reclaimed = store
            .reclaim_stale(t0 + Duration::seconds(100), t0 + Duration::seconds(400))
            .await
            .unwrap();
        assert_eq!(reclaimed, 1);
        assert_eq!(
            store.get(&a.id).await.unwrap().unwrap().status,
            TransactionStatus::Queued
        );

        assert_eq!(store.release_claims_by("me", Utc::now()).await.unwrap(), 1);
        assert_eq!(store.stats().await.unwrap().queued, 2);
    }

    #[tokio::test]
    async fn test_reject_requeue_and_purge() {
        let store = store().await;
        let (a, b) = (fa(1), fa(2));
        store.insert(&a).await.unwrap();
        store.insert(&b).await.unwrap();
        let now = Utc::now();

        assert!(store.reject(&a.id, "player already signed", now).await.unwrap());
        let rejected = store.get(&a.id).await.unwrap().unwrap();
        assert_eq!(rejected.status, TransactionStatus::Failed);
        assert_eq!(rejected.retries, 0);

        assert!(store.requeue_failed(&a.id, now).await.unwrap());
        assert!(!store.requeue_failed(&b.id, now).await.unwrap());

        store.claim(&b.id, "A", now).await.unwrap();
        store.complete(&b.id, now).await.unwrap();
        let purged = store
            .purge_terminal_before(now + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(store.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stats_by_kind_and_status() {
        let store = store().await;
        let (a, b, t) = (fa(1), fa(2), trade());
        for tx in [&a, &b, &t] {
            store.insert(tx).await.unwrap();
        }
        let now = Utc::now();
        store.claim(&a.id, "A", now).await.unwrap();
        store.complete(&a.id, now).await.unwrap();
        store.claim(&t.id, "A", now).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.processing, 1);
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.free_agent_moves, 1);
        assert_eq!(stats.trade_approvals, 1);
        assert_eq!(stats.pending(), 2);
        assert!(stats.oldest_pending_at.is_some());
    }
}
