//! Chat command entry points
//!
//! One call per transaction kind. Each decides between applying the action
//! right away and buffering it in the queue:
//! - a repeated chat message within the dedupe window returns its first outcome
//! - a lapsed lease is re-acquired first; when another instance holds it the
//!   action is refused, since only the holder drains its own queue
//! - a degraded datastore, or a lease store that cannot be reached, enqueues
//! - otherwise the action is applied directly; a transient failure there
//!   enqueues it and counts as a failed probe

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::adapters::{apply_payload, RosterDatastore};
use crate::collections::{BoundedTtlCache, EvictionPolicy};
use crate::coordination::{DegradationDetector, DegradationTransition, LockManager};
use crate::domain::{FreeAgentMove, TradeApproval, TransactionPayload};
use crate::error::{DatastoreError, RosterError};
use crate::persistence::{QueueStats, TransactionQueue};
use crate::services::metrics::MetricsRecorder;

/// What the caller should tell the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmissionOutcome {
    /// Applied against the datastore now
    Applied { summary: String },
    /// Buffered; will be applied automatically once the datastore is back
    Queued { id: String, reason: QueueReason },
    /// Refused on a business rule
    Rejected { reason: String },
    /// Another instance holds the authority lease; nothing was recorded here
    Standby,
}

/// Why an action was buffered instead of applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueReason {
    /// The detector considers the datastore down
    Degraded,
    /// The direct apply failed with a transient datastore error
    DatastoreError,
    /// The authority lease could not be confirmed
    LeaseUnconfirmed,
}

impl SubmissionOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, SubmissionOutcome::Queued { .. })
    }

    /// Reply text for the chat platform
    pub fn user_message(&self) -> String {
        match self {
            SubmissionOutcome::Applied { summary } => format!("✅ {}", summary),
            SubmissionOutcome::Queued { id, reason } => match reason {
                QueueReason::Degraded => format!(
                    "⏳ The database is temporarily unavailable. Your request was queued (`{}`) and will be applied automatically when it recovers.",
                    id
                ),
                QueueReason::DatastoreError => format!(
                    "⏳ The database did not respond. Your request was queued (`{}`) and will be applied automatically.",
                    id
                ),
                QueueReason::LeaseUnconfirmed => format!(
                    "⏳ The bot could not confirm it is the active instance. Your request was queued (`{}`) and will be applied automatically once it is.",
                    id
                ),
            },
            SubmissionOutcome::Rejected { reason } => format!("❌ {}", reason),
            SubmissionOutcome::Standby => {
                "🔁 Another bot instance is handling roster changes right now. Please send your request again in a moment.".to_string()
            }
        }
    }
}

/// Switch the queue into buffering mode and open a degradation episode
pub(crate) async fn enter_degraded_mode(
    queue: &TransactionQueue,
    metrics: &MetricsRecorder,
    at: DateTime<Utc>,
) {
    queue.set_buffering(true);
    let queue_size = queue.size().await.unwrap_or(0);
    metrics.open_episode(at, queue_size);
    warn!("Entered degraded mode, queueing transactions ({} pending)", queue_size);
}

pub struct SubmissionGateway {
    queue: Arc<TransactionQueue>,
    datastore: Arc<dyn RosterDatastore>,
    lock: Arc<LockManager>,
    detector: Arc<DegradationDetector>,
    metrics: Arc<MetricsRecorder>,
    seen: Mutex<BoundedTtlCache<String, SubmissionOutcome>>,
}

impl SubmissionGateway {
    pub fn new(
        queue: Arc<TransactionQueue>,
        datastore: Arc<dyn RosterDatastore>,
        lock: Arc<LockManager>,
        detector: Arc<DegradationDetector>,
        metrics: Arc<MetricsRecorder>,
        dedupe: EvictionPolicy,
    ) -> Self {
        Self {
            queue,
            datastore,
            lock,
            detector,
            metrics,
            seen: Mutex::new(BoundedTtlCache::new(dedupe)),
        }
    }

    pub async fn submit_free_agent_move(&self, mv: FreeAgentMove) -> SubmissionOutcome {
        self.submit(TransactionPayload::FreeAgentMove(mv)).await
    }

    pub async fn submit_trade_approval(&self, trade: TradeApproval) -> SubmissionOutcome {
        self.submit(TransactionPayload::TradeApproval(trade)).await
    }

    async fn submit(&self, payload: TransactionPayload) -> SubmissionOutcome {
        let message_id = payload.message_id().to_string();
        if let Some(previous) = self.previous_outcome(&message_id) {
            debug!(message_id = %message_id, "Duplicate submission, returning first outcome");
            return previous;
        }

        let outcome = self.route(payload).await;
        // A standby refusal is retried by the user, possibly after a takeover
        if !message_id.is_empty() && outcome != SubmissionOutcome::Standby {
            self.lock_seen().insert(message_id, outcome.clone());
        }
        outcome
    }

    async fn route(&self, payload: TransactionPayload) -> SubmissionOutcome {
        match self.lock.require_authority().await {
            Ok(()) => {}
            Err(RosterError::LeaseNotHeld { .. }) => {
                info!(kind = %payload.kind(), "Lease held by another instance, refusing {}", payload.describe());
                return SubmissionOutcome::Standby;
            }
            Err(e) => {
                warn!(kind = %payload.kind(), "Could not confirm the authority lease, queueing: {}", e);
                let reason = if self.detector.is_degraded() {
                    QueueReason::Degraded
                } else {
                    QueueReason::LeaseUnconfirmed
                };
                return self.enqueue(payload, reason).await;
            }
        }
        if self.detector.is_degraded() {
            return self.enqueue(payload, QueueReason::Degraded).await;
        }

        match apply_payload(self.datastore.as_ref(), &payload).await {
            Ok(summary) => {
                info!(kind = %payload.kind(), "Applied {}", payload.describe());
                SubmissionOutcome::Applied { summary }
            }
            Err(DatastoreError::RuleViolation(reason)) => {
                info!(kind = %payload.kind(), "Rejected {}: {}", payload.describe(), reason);
                SubmissionOutcome::Rejected { reason }
            }
            Err(DatastoreError::Transient(e)) => {
                warn!(kind = %payload.kind(), "Datastore error on direct apply, queueing: {}", e);
                let outcome = self.enqueue(payload, QueueReason::DatastoreError).await;
                if let Some(DegradationTransition::Degraded { at }) =
                    self.detector.report_probe_result(false)
                {
                    enter_degraded_mode(&self.queue, &self.metrics, at).await;
                }
                outcome
            }
        }
    }

    async fn enqueue(&self, payload: TransactionPayload, reason: QueueReason) -> SubmissionOutcome {
        let id = self.queue.enqueue(payload).await;
        SubmissionOutcome::Queued { id, reason }
    }

    fn previous_outcome(&self, message_id: &str) -> Option<SubmissionOutcome> {
        if message_id.is_empty() {
            return None;
        }
        self.lock_seen().get(&message_id.to_string()).cloned()
    }

    fn lock_seen(&self) -> std::sync::MutexGuard<'_, BoundedTtlCache<String, SubmissionOutcome>> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drop expired dedupe entries; returns how many were removed
    pub fn sweep_dedupe(&self) -> usize {
        self.lock_seen().sweep()
    }

    pub fn dedupe_len(&self) -> usize {
        self.lock_seen().len()
    }

    /// Status reply for the chat platform
    pub async fn status_message(&self) -> String {
        let stats = self.queue.stats().await.unwrap_or_default();
        let status = self.metrics.degradation_status(Utc::now());
        format_status_message(status.is_active, status.duration_ms.max(0) as u64, &stats)
    }
}

/// Render the chat status reply
pub fn format_status_message(degraded: bool, degraded_for_ms: u64, stats: &QueueStats) -> String {
    if !degraded {
        return "✅ **System Status**: All systems operational".to_string();
    }

    [
        format!("⚠️ **System Degraded** ({}s)", degraded_for_ms / 1000),
        format!("📊 **Queue Status**: {} transactions queued", stats.pending()),
        format!("  • FA Moves: {}", stats.free_agent_moves),
        format!("  • Trades: {}", stats.trade_approvals),
        format!(
            "  • Status: {} queued, {} processing, {} completed, {} failed",
            stats.queued, stats.processing, stats.completed, stats.failed
        ),
        "💡 Transactions will be processed automatically when the database recovers.".to_string(),
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::postgres::MockRosterDatastore;
    use crate::coordination::{DegradationDetectorConfig, LockManagerConfig, RetryPolicy};
    use crate::domain::TransactionStatus;
    use crate::persistence::transaction_queue::TransactionQueueConfig;
    use crate::persistence::{open_memory_pool, QueueStore, SqliteLeaseStore};
    use std::time::Duration;

    fn mv(message_id: &str) -> FreeAgentMove {
        FreeAgentMove {
            team: "Lakers".to_string(),
            drop_player: "Player1".to_string(),
            sign_player: "Player2".to_string(),
            bid_amount: 5,
            user_id: "user123".to_string(),
            message_id: message_id.to_string(),
        }
    }

    struct Parts {
        queue: Arc<TransactionQueue>,
        lock: Arc<LockManager>,
        detector: Arc<DegradationDetector>,
        metrics: Arc<MetricsRecorder>,
    }

    async fn parts(acquire: bool) -> Parts {
        let pool = open_memory_pool().await.unwrap();
        let lock = Arc::new(LockManager::new(
            Arc::new(SqliteLeaseStore::from_pool(pool.clone())),
            "instance-a",
            LockManagerConfig::default(),
            RetryPolicy::fixed(1, 0, 1.0, 0),
        ));
        if acquire {
            lock.acquire_or_renew().await.unwrap();
        }
        Parts {
            queue: Arc::new(TransactionQueue::new(
                QueueStore::from_pool(pool),
                TransactionQueueConfig::default(),
                RetryPolicy::fixed(3, 0, 2.0, 0),
            )),
            lock,
            detector: Arc::new(DegradationDetector::new(DegradationDetectorConfig {
                failure_threshold: 1,
                success_threshold: 2,
            })),
            metrics: Arc::new(MetricsRecorder::new()),
        }
    }

    fn gateway(p: &Parts, mock: MockRosterDatastore) -> SubmissionGateway {
        SubmissionGateway::new(
            p.queue.clone(),
            Arc::new(mock),
            p.lock.clone(),
            p.detector.clone(),
            p.metrics.clone(),
            EvictionPolicy::new(Duration::from_secs(600), 100),
        )
    }

    #[tokio::test]
    async fn test_healthy_submission_applies_directly() {
        let p = parts(true).await;
        let mut mock = MockRosterDatastore::new();
        mock.expect_check_free_agent_move().returning(|_| Ok(()));
        mock.expect_apply_free_agent_move()
            .times(1)
            .returning(|_| Ok("Lakers signed Player2".to_string()));

        let outcome = gateway(&p, mock).submit_free_agent_move(mv("m1")).await;
        assert_eq!(
            outcome,
            SubmissionOutcome::Applied {
                summary: "Lakers signed Player2".to_string()
            }
        );
        assert_eq!(p.queue.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_degraded_submission_is_queued() {
        let p = parts(true).await;
        p.detector.report_probe_result(false);
        let mut mock = MockRosterDatastore::new();
        mock.expect_check_free_agent_move().never();

        let outcome = gateway(&p, mock).submit_free_agent_move(mv("m1")).await;
        let SubmissionOutcome::Queued { id, reason } = outcome.clone() else {
            panic!("expected queued outcome");
        };
        assert_eq!(reason, QueueReason::Degraded);
        assert!(outcome.user_message().contains("temporarily unavailable"));
        assert_eq!(p.queue.get(&id).await.unwrap().status, TransactionStatus::Queued);
    }

    #[tokio::test]
    async fn test_lapsed_lease_is_reacquired_before_applying() {
        let p = parts(false).await;
        let mut mock = MockRosterDatastore::new();
        mock.expect_check_free_agent_move().times(1).returning(|_| Ok(()));
        mock.expect_apply_free_agent_move()
            .times(1)
            .returning(|_| Ok("Lakers signed Player2".to_string()));

        let outcome = gateway(&p, mock).submit_free_agent_move(mv("m1")).await;
        assert!(matches!(outcome, SubmissionOutcome::Applied { .. }));
        assert!(p.lock.holds_authority());
    }

    #[tokio::test]
    async fn test_standby_instance_refuses_without_queueing() {
        let p = parts(false).await;
        let holder = LockManager::new(
            Arc::new(SqliteLeaseStore::from_pool(p.queue.store().pool().clone())),
            "instance-b",
            LockManagerConfig::default(),
            RetryPolicy::fixed(1, 0, 1.0, 0),
        );
        holder.acquire_or_renew().await.unwrap();

        let mut mock = MockRosterDatastore::new();
        mock.expect_check_free_agent_move().never();
        let gateway = gateway(&p, mock);

        let outcome = gateway.submit_free_agent_move(mv("m1")).await;
        assert_eq!(outcome, SubmissionOutcome::Standby);
        assert!(outcome.user_message().contains("Another bot instance"));
        assert_eq!(p.queue.size().await.unwrap(), 0);
        assert_eq!(gateway.dedupe_len(), 0);
    }

    #[tokio::test]
    async fn test_transient_error_queues_and_degrades() {
        let p = parts(true).await;
        let mut mock = MockRosterDatastore::new();
        mock.expect_check_free_agent_move()
            .returning(|_| Err(DatastoreError::Transient("connection refused".into())));

        let outcome = gateway(&p, mock).submit_free_agent_move(mv("m1")).await;
        assert!(matches!(
            outcome,
            SubmissionOutcome::Queued { reason: QueueReason::DatastoreError, .. }
        ));
        assert!(p.detector.is_degraded());
        assert!(p.queue.is_buffering());
        assert!(p.metrics.degradation_status(Utc::now()).is_active);
    }

    #[tokio::test]
    async fn test_rule_violation_is_reported() {
        let p = parts(true).await;
        let mut mock = MockRosterDatastore::new();
        mock.expect_check_free_agent_move()
            .returning(|_| Err(DatastoreError::RuleViolation("Player2 is no longer a free agent".into())));

        let outcome = gateway(&p, mock).submit_free_agent_move(mv("m1")).await;
        assert!(outcome.user_message().contains("no longer a free agent"));
        assert!(!p.detector.is_degraded());
    }

    #[tokio::test]
    async fn test_duplicate_message_returns_first_outcome() {
        let p = parts(true).await;
        p.detector.report_probe_result(false);
        let gateway = gateway(&p, MockRosterDatastore::new());

        let first = gateway.submit_free_agent_move(mv("m1")).await;
        let second = gateway.submit_free_agent_move(mv("m1")).await;
        assert_eq!(first, second);
        assert_eq!(p.queue.size().await.unwrap(), 1);
        assert_eq!(gateway.dedupe_len(), 1);
    }

    #[test]
    fn test_status_message() {
        let healthy = format_status_message(false, 0, &QueueStats::default());
        assert!(healthy.contains("All systems operational"));

        let stats = QueueStats {
            total: 3,
            queued: 2,
            processing: 1,
            free_agent_moves: 2,
            trade_approvals: 1,
            ..Default::default()
        };
        let degraded = format_status_message(true, 42_500, &stats);
        assert!(degraded.contains("(42s)"));
        assert!(degraded.contains("3 transactions queued"));
        assert!(degraded.contains("FA Moves: 2"));
        assert!(degraded.contains("2 queued, 1 processing"));
    }
}
