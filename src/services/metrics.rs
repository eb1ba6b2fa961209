//! Metrics & timeline recorder
//!
//! Bookkeeping for degradation episodes and recovery runs. Every write is
//! infallible and never blocks on I/O; readers get plain snapshots for the
//! dashboard, the CLI and the Prometheus endpoint.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::domain::DegradationEpisode;
use crate::persistence::QueueStats;
use crate::services::recovery::DrainReport;

/// Closed episodes kept in memory
const MAX_EPISODES: usize = 100;
/// Timeline events kept in memory
const MAX_TIMELINE_EVENTS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineEventType {
    DegradationStarted,
    DegradationEnded,
    RecoveryAttempted,
    DrainCompleted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineEvent {
    #[serde(rename = "type")]
    pub event_type: TimelineEventType,
    pub timestamp: DateTime<Utc>,
    pub details: Map<String, Value>,
}

/// Dashboard view of the current degradation state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DegradationStatus {
    pub is_active: bool,
    pub active_since: Option<DateTime<Utc>>,
    pub duration_ms: i64,
    pub queue_size: usize,
    pub recovery_attempt_count: u32,
    pub last_recovery_attempt: Option<DateTime<Utc>>,
}

/// Dashboard view of recovery outcomes
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryMetrics {
    pub recovery_attempts: u64,
    pub success_rate: f64,
    pub average_recovery_time_ms: u64,
    pub current_queue_size: usize,
    pub completed_transactions: u64,
    pub failed_transactions: u64,
    pub processing_transactions: usize,
}

#[derive(Debug, Default)]
struct RecorderState {
    /// Oldest first; the last one may still be open
    episodes: VecDeque<DegradationEpisode>,
    timeline: VecDeque<TimelineEvent>,
    recovery_attempts: u64,
    last_recovery_attempt: Option<DateTime<Utc>>,
    drain_runs: u64,
    total_drain_ms: u64,
    completed: u64,
    failed: u64,
    queue: QueueStats,
}

impl RecorderState {
    fn push_event(&mut self, event_type: TimelineEventType, timestamp: DateTime<Utc>, details: Value) {
        let details = match details {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.timeline.push_back(TimelineEvent {
            event_type,
            timestamp,
            details,
        });
        while self.timeline.len() > MAX_TIMELINE_EVENTS {
            self.timeline.pop_front();
        }
    }

    fn open_episode(&self) -> Option<&DegradationEpisode> {
        self.episodes.back().filter(|e| e.is_open())
    }

    /// Episode a recovery run belongs to: the open one, else the latest
    fn current_episode_mut(&mut self) -> Option<&mut DegradationEpisode> {
        self.episodes.back_mut()
    }
}

#[derive(Debug, Default)]
pub struct MetricsRecorder {
    state: Mutex<RecorderState>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RecorderState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open an episode; ignored while one is already open
    pub fn open_episode(&self, at: DateTime<Utc>, queue_size: usize) {
        let mut state = self.lock();
        if state.open_episode().is_some() {
            return;
        }

        state.episodes.push_back(DegradationEpisode::open(at, queue_size));
        while state.episodes.len() > MAX_EPISODES {
            state.episodes.pop_front();
        }
        state.push_event(
            TimelineEventType::DegradationStarted,
            at,
            json!({
                "reason": "Database unavailable",
                "queuedTransactions": queue_size,
            }),
        );
    }

    /// Close the open episode. `queue_size` is the backlog recovery starts with.
    pub fn close_episode(&self, at: DateTime<Utc>, queue_size: usize) -> Option<DegradationEpisode> {
        let mut state = self.lock();
        let episode = match state.episodes.back_mut() {
            Some(e) if e.is_open() => {
                e.ended_at = Some(at);
                e.queue_size_at_start = queue_size;
                e.clone()
            }
            _ => return None,
        };

        state.push_event(
            TimelineEventType::DegradationEnded,
            at,
            json!({
                "durationMs": episode.duration_ms(at),
                "queuedTransactions": queue_size,
            }),
        );
        Some(episode)
    }

    pub fn record_recovery_attempt(&self, at: DateTime<Utc>, queue_size: usize) {
        let mut state = self.lock();
        state.recovery_attempts += 1;
        state.last_recovery_attempt = Some(at);
        let attempt_number = match state.current_episode_mut() {
            Some(episode) => {
                episode.recovery_attempt_count += 1;
                episode.recovery_attempt_count
            }
            None => 0,
        };
        let failed = state.failed;

        state.push_event(
            TimelineEventType::RecoveryAttempted,
            at,
            json!({
                "attemptNumber": attempt_number,
                "queuedTransactions": queue_size,
                "failedTransactions": failed,
            }),
        );
    }

    /// Tally a finished drain run and stamp the episode's end-of-recovery backlog
    pub fn record_drain(&self, report: &DrainReport) {
        let mut state = self.lock();
        state.drain_runs += 1;
        state.total_drain_ms += report.duration_ms();
        state.completed += report.completed;
        state.failed += report.failed + report.rejected;

        if let Some(episode) = state.current_episode_mut() {
            if !episode.is_open() && episode.queue_size_at_end.is_none() {
                episode.queue_size_at_end = Some(report.remaining);
            }
        }

        state.push_event(
            TimelineEventType::DrainCompleted,
            report.finished_at,
            json!({
                "completed": report.completed,
                "retried": report.retried,
                "failed": report.failed,
                "rejected": report.rejected,
                "remaining": report.remaining,
                "stopReason": report.stop.to_string(),
                "durationMs": report.duration_ms(),
            }),
        );
        debug!("Recorded drain run: {}", report.stop);
    }

    /// Latest queue snapshot, used for queue-size reads
    pub fn observe_queue(&self, stats: QueueStats) {
        self.lock().queue = stats;
    }

    /// `completed / (completed + failed) * 100`, 100 when nothing has finished
    pub fn success_rate(&self) -> f64 {
        let state = self.lock();
        let finished = state.completed + state.failed;
        if finished == 0 {
            100.0
        } else {
            state.completed as f64 / finished as f64 * 100.0
        }
    }

    /// Mean drain-run duration, 0 when no run has finished
    pub fn average_recovery_time_ms(&self) -> u64 {
        let state = self.lock();
        if state.drain_runs == 0 {
            0
        } else {
            state.total_drain_ms / state.drain_runs
        }
    }

    pub fn current_queue_size(&self) -> usize {
        self.lock().queue.pending()
    }

    pub fn recovery_attempts(&self) -> u64 {
        self.lock().recovery_attempts
    }

    pub fn degradation_status(&self, now: DateTime<Utc>) -> DegradationStatus {
        let state = self.lock();
        let open = state.open_episode();
        DegradationStatus {
            is_active: open.is_some(),
            active_since: open.map(|e| e.started_at),
            duration_ms: open.map_or(0, |e| e.duration_ms(now)),
            queue_size: state.queue.pending(),
            recovery_attempt_count: state
                .episodes
                .back()
                .map_or(0, |e| e.recovery_attempt_count),
            last_recovery_attempt: state.last_recovery_attempt,
        }
    }

    pub fn recovery_metrics(&self) -> RecoveryMetrics {
        let (recovery_attempts, completed, failed, current_queue_size, processing) = {
            let state = self.lock();
            (
                state.recovery_attempts,
                state.completed,
                state.failed,
                state.queue.pending(),
                state.queue.processing,
            )
        };

        RecoveryMetrics {
            recovery_attempts,
            success_rate: self.success_rate(),
            average_recovery_time_ms: self.average_recovery_time_ms(),
            current_queue_size,
            completed_transactions: completed,
            failed_transactions: failed,
            processing_transactions: processing,
        }
    }

    /// The most recent `limit` events, oldest first
    pub fn timeline(&self, limit: usize) -> Vec<TimelineEvent> {
        let state = self.lock();
        let skip = state.timeline.len().saturating_sub(limit);
        state.timeline.iter().skip(skip).cloned().collect()
    }

    pub fn episodes(&self) -> Vec<DegradationEpisode> {
        self.lock().episodes.iter().cloned().collect()
    }

    /// Export metrics in Prometheus format
    pub fn prometheus(&self, now: DateTime<Utc>) -> String {
        let status = self.degradation_status(now);
        let metrics = self.recovery_metrics();
        let queue = self.lock().queue.clone();

        format!(
            r#"# HELP rosterd_degraded Degradation mode active (1=degraded, 0=healthy)
# TYPE rosterd_degraded gauge
rosterd_degraded {}

# HELP rosterd_degradation_duration_ms Duration of the open degradation episode
# TYPE rosterd_degradation_duration_ms gauge
rosterd_degradation_duration_ms {}

# HELP rosterd_queue_pending Pending transactions in the queue
# TYPE rosterd_queue_pending gauge
rosterd_queue_pending {}

# HELP rosterd_queue_failed Transactions in terminal failed state
# TYPE rosterd_queue_failed gauge
rosterd_queue_failed {}

# HELP rosterd_recovery_attempts_total Recovery drains started
# TYPE rosterd_recovery_attempts_total counter
rosterd_recovery_attempts_total {}

# HELP rosterd_recovered_transactions_total Transactions completed by recovery
# TYPE rosterd_recovered_transactions_total counter
rosterd_recovered_transactions_total {}

# HELP rosterd_recovery_failed_transactions_total Transactions that failed permanently in recovery
# TYPE rosterd_recovery_failed_transactions_total counter
rosterd_recovery_failed_transactions_total {}

# HELP rosterd_recovery_success_rate Recovery success rate in percent
# TYPE rosterd_recovery_success_rate gauge
rosterd_recovery_success_rate {:.1}

# HELP rosterd_recovery_average_ms Mean drain run duration
# TYPE rosterd_recovery_average_ms gauge
rosterd_recovery_average_ms {}
"#,
            if status.is_active { 1 } else { 0 },
            status.duration_ms,
            queue.pending(),
            queue.failed,
            metrics.recovery_attempts,
            metrics.completed_transactions,
            metrics.failed_transactions,
            metrics.success_rate,
            metrics.average_recovery_time_ms,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::recovery::DrainStop;
    use chrono::Duration;

    fn report(completed: u64, failed: u64, remaining: usize, ms: i64) -> DrainReport {
        let started_at = Utc::now();
        DrainReport {
            started_at,
            finished_at: started_at + Duration::milliseconds(ms),
            claimed: completed + failed,
            completed,
            retried: 0,
            failed,
            rejected: 0,
            skipped: 0,
            remaining,
            stop: DrainStop::Empty,
        }
    }

    #[test]
    fn test_defaults_before_any_recovery() {
        let m = MetricsRecorder::new();
        assert_eq!(m.success_rate(), 100.0);
        assert_eq!(m.average_recovery_time_ms(), 0);
        assert!(!m.degradation_status(Utc::now()).is_active);
    }

    #[test]
    fn test_episode_lifecycle() {
        let m = MetricsRecorder::new();
        let t0 = Utc::now();

        m.open_episode(t0, 0);
        // Second open while one is active is ignored
        m.open_episode(t0 + Duration::seconds(1), 5);
        assert_eq!(m.episodes().len(), 1);

        let status = m.degradation_status(t0 + Duration::seconds(10));
        assert!(status.is_active);
        assert_eq!(status.duration_ms, 10_000);

        let closed = m.close_episode(t0 + Duration::seconds(30), 3).unwrap();
        assert_eq!(closed.queue_size_at_open, 0);
        assert_eq!(closed.queue_size_at_start, 3);
        assert!(m.close_episode(t0 + Duration::seconds(31), 3).is_none());

        m.record_recovery_attempt(t0 + Duration::seconds(30), 3);
        m.record_drain(&report(3, 0, 0, 400));

        let episode = &m.episodes()[0];
        assert_eq!(episode.recovery_attempt_count, 1);
        assert_eq!(episode.queue_size_at_end, Some(0));
        assert!(!m.degradation_status(Utc::now()).is_active);
    }

    #[test]
    fn test_success_rate_and_average() {
        let m = MetricsRecorder::new();
        m.record_drain(&report(3, 1, 0, 100));
        m.record_drain(&report(0, 0, 0, 300));

        assert_eq!(m.success_rate(), 75.0);
        assert_eq!(m.average_recovery_time_ms(), 200);
        assert_eq!(m.recovery_metrics().completed_transactions, 3);
    }

    #[test]
    fn test_timeline_keeps_order_and_limit() {
        let m = MetricsRecorder::new();
        let t0 = Utc::now();
        m.open_episode(t0, 2);
        m.close_episode(t0 + Duration::seconds(5), 2);
        m.record_recovery_attempt(t0 + Duration::seconds(5), 2);

        let all = m.timeline(10);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].event_type, TimelineEventType::DegradationStarted);
        assert_eq!(all[0].details["queuedTransactions"], 2);

        let last = m.timeline(1);
        assert_eq!(last[0].event_type, TimelineEventType::RecoveryAttempted);
        assert_eq!(last[0].details["attemptNumber"], 1);
    }

    #[test]
    fn test_queue_snapshot_feeds_reads() {
        let m = MetricsRecorder::new();
        m.observe_queue(QueueStats {
            total: 5,
            queued: 2,
            processing: 1,
            completed: 2,
            ..Default::default()
        });

        assert_eq!(m.current_queue_size(), 3);
        assert_eq!(m.recovery_metrics().processing_transactions, 1);
        assert!(m.prometheus(Utc::now()).contains("rosterd_queue_pending 3"));
    }
}
