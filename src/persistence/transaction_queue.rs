//! Transaction Queue
//!
//! Ordered, durable buffer of user actions accepted while the roster datastore
//! is down. Admission never fails: when the local store itself rejects a write
//! the record is held in an in-memory spill list and written out, in order, on
//! the next queue operation.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::queue_store::{QueueStats, QueueStore};
use crate::coordination::RetryPolicy;
use crate::domain::{QueuedTransaction, TransactionKind, TransactionPayload, TransactionStatus};
use crate::error::{Result, RosterError};

/// Queue tuning
#[derive(Debug, Clone)]
pub struct TransactionQueueConfig {
    /// Retry bound stamped on newly enqueued items
    pub max_retries: u32,
    /// Pending size above which admission logs a warning
    pub capacity_warning: usize,
    /// Age after which a processing claim is considered abandoned
    pub processing_timeout: ChronoDuration,
}

impl Default for TransactionQueueConfig {
    fn default() -> Self {
        Self {
            max_retries: crate::domain::DEFAULT_MAX_RETRIES,
            capacity_warning: 1000,
            processing_timeout: ChronoDuration::seconds(300),
        }
    }
}

/// Durable FIFO of pending transactions
pub struct TransactionQueue {
    store: QueueStore,
    config: TransactionQueueConfig,
    /// Per-item backoff schedule for failed attempts
    backoff: RetryPolicy,
    spill: Mutex<Vec<QueuedTransaction>>,
    /// Serializes spill flushes with new inserts so store order follows admission order
    admission: tokio::sync::Mutex<()>,
    buffering: AtomicBool,
}

impl TransactionQueue {
    pub fn new(store: QueueStore, config: TransactionQueueConfig, backoff: RetryPolicy) -> Self {
        Self {
            store,
            config,
            backoff,
            spill: Mutex::new(Vec::new()),
            admission: tokio::sync::Mutex::new(()),
            buffering: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &QueueStore {
        &self.store
    }

    pub fn config(&self) -> &TransactionQueueConfig {
        &self.config
    }

    /// Switch buffering mode on or off (driven by degradation transitions)
    pub fn set_buffering(&self, buffering: bool) {
        let was = self.buffering.swap(buffering, Ordering::SeqCst);
        if was != buffering {
            if buffering {
                info!("Transaction queue switched to buffering mode");
            } else {
                info!("Transaction queue left buffering mode");
            }
        }
    }

    pub fn is_buffering(&self) -> bool {
        self.buffering.load(Ordering::SeqCst)
    }

    /// Accept a transaction and return its id. Never fails.
    pub async fn enqueue(&self, payload: TransactionPayload) -> String {
        let tx = QueuedTransaction::new(payload, self.config.max_retries);
        let id = tx.id.clone();

        {
            // Nothing new reaches the store while older items are spilled
            let _admission = self.admission.lock().await;
            if self.write_spill().await && self.try_insert(&tx).await {
                info!(
                    transaction_id = %id,
                    kind = %tx.kind,
                    "Queued {}",
                    tx.payload.describe()
                );
            } else {
                self.lock_spill().push(tx);
                warn!(transaction_id = %id, "Queue store unavailable, holding transaction in memory");
            }
        }

        if let Ok(pending) = self.size().await {
            if pending > self.config.capacity_warning {
                warn!(
                    "Transaction queue has {} pending items (warning threshold {})",
                    pending, self.config.capacity_warning
                );
            }
        }

        id
    }

    async fn try_insert(&self, tx: &QueuedTransaction) -> bool {
        match self.store.insert(tx).await {
            Ok(()) => true,
            Err(e) => {
                error!(transaction_id = %tx.id, "Failed to persist queued transaction: {}", e);
                false
            }
        }
    }

    /// Write spilled records to the store in order. Returns true when the spill is empty.
    pub async fn flush_spill(&self) -> bool {
        let _admission = self.admission.lock().await;
        self.write_spill().await
    }

    /// Caller holds `admission`, so no enqueue can slip in between spilled records
    async fn write_spill(&self) -> bool {
        let pending: Vec<QueuedTransaction> = {
            let mut spill = self.lock_spill();
            if spill.is_empty() {
                return true;
            }
            std::mem::take(&mut *spill)
        };

        let mut iter = pending.into_iter();
        let mut written = 0usize;
        while let Some(tx) = iter.next() {
            if !self.try_insert(&tx).await {
                let mut remaining = vec![tx];
                remaining.extend(iter);
                *self.lock_spill() = remaining;
                return false;
            }
            written += 1;
        }

        info!("Flushed {} spilled transactions to the queue store", written);
        self.lock_spill().is_empty()
    }

    fn lock_spill(&self) -> std::sync::MutexGuard<'_, Vec<QueuedTransaction>> {
        self.spill.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn spilled(&self) -> usize {
        self.lock_spill().len()
    }

    /// Pending items in enqueue order, optionally for one kind
    pub async fn list_pending(&self, kind: Option<TransactionKind>) -> Result<Vec<QueuedTransaction>> {
        self.flush_spill().await;
        let mut pending = self.store.list_pending(kind).await?;
        pending.extend(
            self.lock_spill()
                .iter()
                .filter(|tx| kind.map_or(true, |k| tx.kind == k))
                .cloned(),
        );
        Ok(pending)
    }

    /// Paged listing of all records for the dashboard
    pub async fn list_page(
        &self,
        status: Option<TransactionStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<QueuedTransaction>> {
        self.flush_spill().await;
        self.store.list_page(status, limit, offset).await
    }

    pub async fn get(&self, id: &str) -> Result<QueuedTransaction> {
        if let Some(tx) = self.store.get(id).await? {
            return Ok(tx);
        }
        self.lock_spill()
            .iter()
            .find(|tx| tx.id == id)
            .cloned()
            .ok_or_else(|| RosterError::TransactionNotFound(id.to_string()))
    }

    /// Atomically claim a queued item for `owner_id`
    pub async fn mark_processing(&self, id: &str, owner_id: &str) -> Result<bool> {
        let claimed = self.store.claim(id, owner_id, Utc::now()).await?;
        if claimed {
            debug!(transaction_id = %id, owner_id = %owner_id, "Claimed transaction");
        }
        Ok(claimed)
    }

    pub async fn mark_completed(&self, id: &str) -> Result<()> {
        if self.store.complete(id, Utc::now()).await? {
            info!(transaction_id = %id, "Transaction completed");
            Ok(())
        } else {
            Err(self.transition_error(id, TransactionStatus::Completed).await)
        }
    }

    /// Record a transient failure. Returns the resulting status:
    /// `Queued` (with per-item backoff) or terminal `Failed`.
    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<TransactionStatus> {
        let current = self.get(id).await?;
        let now = Utc::now();
        let delay = self.backoff.delay_for(current.retries);
        let next_attempt_at =
            now + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::zero());

        match self.store.record_failure(id, error, now, next_attempt_at).await? {
            Some((TransactionStatus::Failed, retries)) => {
                error!(
                    transaction_id = %id,
                    "Transaction failed permanently after {} attempts: {}",
                    retries, error
                );
                Ok(TransactionStatus::Failed)
            }
            Some((status, retries)) => {
                warn!(
                    transaction_id = %id,
                    "Transaction attempt {} failed ({}), next attempt in {:?}",
                    retries, error, delay
                );
                Ok(status)
            }
            None => Err(self.transition_error(id, TransactionStatus::Failed).await),
        }
    }

    /// Terminal failure for a business-rule violation; retries are not consumed
    pub async fn mark_rejected(&self, id: &str, reason: &str) -> Result<()> {
        if self.store.reject(id, reason, Utc::now()).await? {
            warn!(transaction_id = %id, "Transaction rejected: {}", reason);
            Ok(())
        } else {
            Err(self.transition_error(id, TransactionStatus::Failed).await)
        }
    }

    async fn transition_error(&self, id: &str, to: TransactionStatus) -> RosterError {
        match self.store.get(id).await {
            Ok(Some(tx)) => RosterError::InvalidStateTransition {
                from: tx.status.to_string(),
                to: to.to_string(),
            },
            Ok(None) => RosterError::TransactionNotFound(id.to_string()),
            Err(e) => e,
        }
    }

    /// Oldest claimable item
    pub async fn next_due(&self, now: DateTime<Utc>) -> Result<Option<QueuedTransaction>> {
        self.flush_spill().await;
        self.store.next_due(now).await
    }

    /// When the next backed-off item becomes claimable
    pub async fn earliest_next_attempt(&self) -> Result<Option<DateTime<Utc>>> {
        self.store.earliest_next_attempt().await
    }

    /// Return claims older than the processing timeout to `Queued`
    pub async fn reclaim_stale(&self) -> Result<u64> {
        let now = Utc::now();
        let reclaimed = self
            .store
            .reclaim_stale(now - self.config.processing_timeout, now)
            .await?;
        if reclaimed > 0 {
            warn!("Reclaimed {} abandoned processing claims", reclaimed);
        }
        Ok(reclaimed)
    }

    /// Release this instance's claims, on shutdown
    pub async fn release_claims_by(&self, owner_id: &str) -> Result<u64> {
        let released = self.store.release_claims_by(owner_id, Utc::now()).await?;
        if released > 0 {
            info!("Released {} processing claims held by {}", released, owner_id);
        }
        Ok(released)
    }

    /// Operator requeue of a terminal `Failed` item
    pub async fn requeue_failed(&self, id: &str) -> Result<()> {
        if self.store.requeue_failed(id, Utc::now()).await? {
            info!(transaction_id = %id, "Failed transaction requeued by operator");
            Ok(())
        } else {
            Err(self.transition_error(id, TransactionStatus::Queued).await)
        }
    }

    /// Delete completed/failed records older than `retention`
    pub async fn purge_terminal(&self, retention: ChronoDuration) -> Result<u64> {
        self.store.purge_terminal_before(Utc::now() - retention).await
    }

    /// Drop every record, spilled ones included
    pub async fn clear(&self) -> Result<u64> {
        let spilled = std::mem::take(&mut *self.lock_spill()).len() as u64;
        let removed = self.store.clear().await? + spilled;
        warn!("Transaction queue cleared ({} records)", removed);
        Ok(removed)
    }

    /// Pending items, spilled ones included
    pub async fn size(&self) -> Result<usize> {
        Ok(self.store.pending_count().await? + self.spilled())
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let mut stats = self.store.stats().await?;
        for tx in self.lock_spill().iter() {
            stats.total += 1;
            stats.queued += 1;
            match tx.kind {
                TransactionKind::FreeAgentMove => stats.free_agent_moves += 1,
                TransactionKind::TradeApproval => stats.trade_approvals += 1,
            }
            stats.oldest_pending_at = Some(
                stats
                    .oldest_pending_at
                    .map_or(tx.enqueued_at, |oldest| oldest.min(tx.enqueued_at)),
            );
        }
        Ok(stats)
    }
}
