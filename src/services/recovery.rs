//! Recovery Processor
//!
//! Drains the transaction queue once the datastore is reachable again. A drain
//! keeps claiming the oldest due item while this instance holds the lease, the
//! detector reports healthy and no shutdown was requested. Each item is
//! re-validated before it is applied:
//! - success completes it
//! - a rule violation rejects it terminally
//! - a transient error sends it back with per-item backoff (or fails it once
//!   the retry bound is reached)
//!
//! Triggers are idempotent: a trigger while a drain is running is collapsed
//! into the running pass.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::adapters::{apply_payload, RosterDatastore};
use crate::coordination::{DegradationDetector, LockManager, ShutdownToken};
use crate::domain::{QueuedTransaction, TransactionStatus};
use crate::error::DatastoreError;
use crate::persistence::TransactionQueue;
use crate::services::metrics::MetricsRecorder;

/// Longest single wait for a backed-off item before conditions are re-checked
const MAX_IDLE_WAIT: Duration = Duration::from_secs(5);

/// Why a drain pass ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainStop {
    /// No pending items left
    Empty,
    /// The lease is not held (or renewal is paused)
    LostAuthority,
    /// The detector flipped back to degraded
    Degraded,
    /// A transient error on an item and the datastore no longer answers pings
    DatastoreUnavailable,
    Shutdown,
    /// The local queue store failed
    StoreError(String),
}

impl std::fmt::Display for DrainStop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DrainStop::Empty => write!(f, "empty"),
            DrainStop::LostAuthority => write!(f, "lost_authority"),
            DrainStop::Degraded => write!(f, "degraded"),
            DrainStop::DatastoreUnavailable => write!(f, "datastore_unavailable"),
            DrainStop::Shutdown => write!(f, "shutdown"),
            DrainStop::StoreError(e) => write!(f, "store_error: {}", e),
        }
    }
}

/// Outcome of one drain pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DrainReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Items this pass claimed
    pub claimed: u64,
    pub completed: u64,
    /// Transient failures sent back to the queue
    pub retried: u64,
    /// Items that exhausted their retries
    pub failed: u64,
    /// Items rejected on a business-rule violation
    pub rejected: u64,
    /// Items another drain claimed first
    pub skipped: u64,
    /// Pending items left when the pass stopped
    pub remaining: usize,
    pub stop: DrainStop,
}

impl DrainReport {
    fn start(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            finished_at: started_at,
            claimed: 0,
            completed: 0,
            retried: 0,
            failed: 0,
            rejected: 0,
            skipped: 0,
            remaining: 0,
            stop: DrainStop::Empty,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at).num_milliseconds().max(0) as u64
    }
}

/// Recovery statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryStats {
    pub runs: u64,
    pub collapsed_triggers: u64,
    pub last_report: Option<DrainReport>,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct RecoveryProcessor {
    queue: Arc<TransactionQueue>,
    datastore: Arc<dyn RosterDatastore>,
    lock: Arc<LockManager>,
    detector: Arc<DegradationDetector>,
    metrics: Arc<MetricsRecorder>,
    shutdown: ShutdownToken,
    running: AtomicBool,
    runs: AtomicU64,
    collapsed_triggers: AtomicU64,
    last_report: Mutex<Option<DrainReport>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RecoveryProcessor {
    pub fn new(
        queue: Arc<TransactionQueue>,
        datastore: Arc<dyn RosterDatastore>,
        lock: Arc<LockManager>,
        detector: Arc<DegradationDetector>,
        metrics: Arc<MetricsRecorder>,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            queue,
            datastore,
            lock,
            detector,
            metrics,
            shutdown,
            running: AtomicBool::new(false),
            runs: AtomicU64::new(0),
            collapsed_triggers: AtomicU64::new(0),
            last_report: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start a drain in the background. Returns false if one is already running.
    pub fn trigger(self: &Arc<Self>) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            self.collapsed_triggers.fetch_add(1, Ordering::Relaxed);
            debug!("Drain already running, trigger collapsed");
            return false;
        }

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let _guard = RunningGuard(&this.running);
            this.drain().await;
        });
        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        true
    }

    /// Operator trigger; a no-op unless healthy and holding the lease
    pub fn trigger_manual(self: &Arc<Self>) -> bool {
        if self.detector.is_degraded() {
            info!("Manual recovery ignored: datastore still degraded");
            return false;
        }
        if !self.lock.holds_authority() {
            info!("Manual recovery ignored: lease held by another instance");
            return false;
        }
        info!("Manual recovery triggered");
        self.trigger()
    }

    /// Run a drain on the caller's task. Returns None if one is already running.
    pub async fn drain_once(&self) -> Option<DrainReport> {
        if self.running.swap(true, Ordering::SeqCst) {
            self.collapsed_triggers.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let _guard = RunningGuard(&self.running);
        Some(self.drain().await)
    }

    /// Wait for a background drain started by [`trigger`](Self::trigger)
    pub async fn wait_idle(&self) {
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Drain task failed: {}", e);
            }
        }
    }

    pub fn stats(&self) -> RecoveryStats {
        RecoveryStats {
            runs: self.runs.load(Ordering::Relaxed),
            collapsed_triggers: self.collapsed_triggers.load(Ordering::Relaxed),
            last_report: self
                .last_report
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }

    fn stop_condition(&self) -> Option<DrainStop> {
        if self.shutdown.is_shutdown_requested() {
            Some(DrainStop::Shutdown)
        } else if !self.lock.holds_authority() {
            Some(DrainStop::LostAuthority)
        } else if self.detector.is_degraded() {
            Some(DrainStop::Degraded)
        } else {
            None
        }
    }

    async fn drain(&self) -> DrainReport {
        let started_at = Utc::now();
        let mut report = DrainReport::start(started_at);
        self.runs.fetch_add(1, Ordering::Relaxed);

        let queue_size = self.queue.size().await.unwrap_or(0);
        self.metrics.record_recovery_attempt(started_at, queue_size);
        info!("Recovery drain started ({} pending)", queue_size);

        self.queue.flush_spill().await;
        if let Err(e) = self.queue.reclaim_stale().await {
            warn!("Failed to reclaim stale claims: {}", e);
        }

        report.stop = loop {
            if let Some(stop) = self.stop_condition() {
                break stop;
            }

            match self.queue.next_due(Utc::now()).await {
                Ok(Some(tx)) => {
                    if let Some(stop) = self.process(&tx, &mut report).await {
                        break stop;
                    }
                }
                Ok(None) => match self.queue.earliest_next_attempt().await {
                    Ok(Some(due)) => self.wait_until(due).await,
                    Ok(None) => break DrainStop::Empty,
                    Err(e) => break DrainStop::StoreError(e.to_string()),
                },
                Err(e) => break DrainStop::StoreError(e.to_string()),
            }
        };

        report.finished_at = Utc::now();
        report.remaining = self.queue.size().await.unwrap_or(0);
        if let Ok(stats) = self.queue.stats().await {
            self.metrics.observe_queue(stats);
        }
        self.metrics.record_drain(&report);

        info!(
            "Recovery drain stopped ({}): {} completed, {} retried, {} failed, {} rejected, {} remaining in {}ms",
            report.stop,
            report.completed,
            report.retried,
            report.failed,
            report.rejected,
            report.remaining,
            report.duration_ms()
        );
        *self.last_report.lock().unwrap_or_else(|e| e.into_inner()) = Some(report.clone());
        report
    }

    /// Sleep until `due`, waking early on shutdown or a detector change
    async fn wait_until(&self, due: DateTime<Utc>) {
        let wait = (due - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        if wait.is_zero() {
            return;
        }
        let wait = wait.min(MAX_IDLE_WAIT);
        debug!("Next queued item due in {:?}", wait);

        let mut shutdown = self.shutdown.clone();
        let mut state = self.detector.subscribe_state();
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.wait_for_shutdown() => {}
            _ = state.changed() => {}
        }
    }

    /// Claim and apply one item. Returns a stop reason if the drain must end.
    async fn process(&self, tx: &QueuedTransaction, report: &mut DrainReport) -> Option<DrainStop> {
        match self.queue.mark_processing(&tx.id, self.lock.owner_id()).await {
            Ok(true) => report.claimed += 1,
            Ok(false) => {
                report.skipped += 1;
                return None;
            }
            Err(e) => return Some(DrainStop::StoreError(e.to_string())),
        }

        debug!(
            transaction_id = %tx.id,
            kind = %tx.kind,
            "Applying queued {}",
            tx.payload.describe()
        );

        let outcome = apply_payload(self.datastore.as_ref(), &tx.payload).await;
        let recorded = match outcome {
            Ok(summary) => {
                info!(transaction_id = %tx.id, "Recovered: {}", summary);
                report.completed += 1;
                self.queue.mark_completed(&tx.id).await
            }
            Err(DatastoreError::RuleViolation(reason)) => {
                report.rejected += 1;
                self.queue.mark_rejected(&tx.id, &reason).await
            }
            Err(DatastoreError::Transient(e)) => {
                match self.queue.mark_failed(&tx.id, &e).await {
                    Ok(TransactionStatus::Failed) => report.failed += 1,
                    Ok(_) => report.retried += 1,
                    Err(e) => return Some(DrainStop::StoreError(e.to_string())),
                }
                if self.datastore.ping().await.is_err() {
                    warn!("Datastore stopped answering during recovery, pausing drain");
                    return Some(DrainStop::DatastoreUnavailable);
                }
                Ok(())
            }
        };

        match recorded {
            Ok(()) => None,
            Err(e) => {
                error!(transaction_id = %tx.id, "Failed to record outcome: {}", e);
                Some(DrainStop::StoreError(e.to_string()))
            }
        }
    }
}
