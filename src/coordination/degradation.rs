//! Degradation Detector
//!
//! Hysteresis state machine over datastore probe results. `failure_threshold`
//! consecutive failures move `Healthy -> Degraded`; `success_threshold`
//! consecutive successes move `Degraded -> Healthy`. Any opposite result
//! resets the streak, so a lone timeout between successes never flips state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::domain::DetectorState;

/// Configuration for the degradation detector
#[derive(Debug, Clone, Deserialize)]
pub struct DegradationDetectorConfig {
    /// Consecutive probe failures before entering degraded mode
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Consecutive probe successes before leaving degraded mode
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_success_threshold() -> u32 {
    2
}

impl Default for DegradationDetectorConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
        }
    }
}

/// State-transition event emitted on a threshold crossing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DegradationTransition {
    /// Healthy -> Degraded
    Degraded { at: DateTime<Utc> },
    /// Degraded -> Healthy
    Recovered { at: DateTime<Utc> },
}

impl DegradationTransition {
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            DegradationTransition::Degraded { at } | DegradationTransition::Recovered { at } => *at,
        }
    }

    pub fn target(&self) -> DetectorState {
        match self {
            DegradationTransition::Degraded { .. } => DetectorState::Degraded,
            DegradationTransition::Recovered { .. } => DetectorState::Healthy,
        }
    }
}

#[derive(Debug, Default)]
struct Streaks {
    consecutive_failures: u32,
    consecutive_successes: u32,
}

/// Hysteresis detector for datastore availability
pub struct DegradationDetector {
    config: DegradationDetectorConfig,
    streaks: Mutex<Streaks>,
    state_tx: watch::Sender<DetectorState>,
    transitions_tx: broadcast::Sender<DegradationTransition>,
    total_transitions: AtomicU64,
}

impl DegradationDetector {
    /// Create a detector that starts out `Healthy`
    pub fn new(config: DegradationDetectorConfig) -> Self {
        let (state_tx, _) = watch::channel(DetectorState::Healthy);
        let (transitions_tx, _) = broadcast::channel(32);
        Self {
            config: DegradationDetectorConfig {
                failure_threshold: config.failure_threshold.max(1),
                success_threshold: config.success_threshold.max(1),
            },
            streaks: Mutex::new(Streaks::default()),
            state_tx,
            transitions_tx,
            total_transitions: AtomicU64::new(0),
        }
    }

    /// Create with default thresholds (3 failures / 2 successes)
    pub fn with_defaults() -> Self {
        Self::new(DegradationDetectorConfig::default())
    }

    /// Feed one probe outcome; returns the transition if a threshold was crossed
    pub fn report_probe_result(&self, success: bool) -> Option<DegradationTransition> {
        let mut streaks = self.streaks.lock().unwrap_or_else(|e| e.into_inner());
        let state = *self.state_tx.borrow();

        if success {
            streaks.consecutive_failures = 0;
            streaks.consecutive_successes = streaks.consecutive_successes.saturating_add(1);
        } else {
            streaks.consecutive_successes = 0;
            streaks.consecutive_failures = streaks.consecutive_failures.saturating_add(1);
        }

        let transition = match state {
            DetectorState::Healthy
                if !success && streaks.consecutive_failures >= self.config.failure_threshold =>
            {
                warn!(
                    "Datastore unreachable after {} consecutive probe failures, entering degraded mode",
                    streaks.consecutive_failures
                );
                Some(DegradationTransition::Degraded { at: Utc::now() })
            }
            DetectorState::Degraded
                if success && streaks.consecutive_successes >= self.config.success_threshold =>
            {
                info!(
                    "Datastore reachable after {} consecutive probe successes, leaving degraded mode",
                    streaks.consecutive_successes
                );
                Some(DegradationTransition::Recovered { at: Utc::now() })
            }
            _ => {
                debug!(
                    "Probe {} (state: {}, failures: {}, successes: {})",
                    if success { "ok" } else { "failed" },
                    state,
                    streaks.consecutive_failures,
                    streaks.consecutive_successes
                );
                None
            }
        };

        if let Some(t) = transition {
            // Publish while still holding the streak lock so observers see
            // transitions in the order they happened.
            self.state_tx.send_replace(t.target());
            self.total_transitions.fetch_add(1, Ordering::SeqCst);
            let _ = self.transitions_tx.send(t);
        }

        transition
    }

    /// Current state (pure read)
    pub fn current_state(&self) -> DetectorState {
        *self.state_tx.borrow()
    }

    pub fn is_degraded(&self) -> bool {
        self.current_state() == DetectorState::Degraded
    }

    /// Watch the state; used by the drain loop to stop when degradation recurs
    pub fn subscribe_state(&self) -> watch::Receiver<DetectorState> {
        self.state_tx.subscribe()
    }

    /// Subscribe to transition events
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<DegradationTransition> {
        self.transitions_tx.subscribe()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.streaks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .consecutive_failures
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.streaks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .consecutive_successes
    }

    pub fn total_transitions(&self) -> u64 {
        self.total_transitions.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &DegradationDetectorConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(failures: u32, successes: u32) -> DegradationDetector {
        DegradationDetector::new(DegradationDetectorConfig {
            failure_threshold: failures,
            success_threshold: successes,
        })
    }

    #[test]
    fn test_enters_degraded_after_threshold() {
        let d = detector(3, 2);

        assert!(d.report_probe_result(false).is_none());
        assert!(d.report_probe_result(false).is_none());
        let t = d.report_probe_result(false);

        assert!(matches!(t, Some(DegradationTransition::Degraded { .. })));
        assert_eq!(d.current_state(), DetectorState::Degraded);
        assert_eq!(d.total_transitions(), 1);
    }

    #[test]
    fn test_single_failure_between_successes_never_degrades() {
        let d = detector(3, 2);

        for _ in 0..20 {
            assert!(d.report_probe_result(true).is_none());
            assert!(d.report_probe_result(false).is_none());
            assert!(d.report_probe_result(true).is_none());
        }
        assert_eq!(d.current_state(), DetectorState::Healthy);
        assert_eq!(d.total_transitions(), 0);
    }

    #[test]
    fn test_two_failures_then_success_resets_streak() {
        let d = detector(3, 2);

        d.report_probe_result(false);
        d.report_probe_result(false);
        d.report_probe_result(true);
        d.report_probe_result(false);
        d.report_probe_result(false);

        assert_eq!(d.current_state(), DetectorState::Healthy);
        assert_eq!(d.consecutive_failures(), 2);
    }

    #[test]
    fn test_recovers_after_success_threshold() {
        let d = detector(1, 2);
        d.report_probe_result(false);
        assert!(d.is_degraded());

        assert!(d.report_probe_result(true).is_none());
        assert!(d.is_degraded());
        // A failure in between resets the success streak
        assert!(d.report_probe_result(false).is_none());
        assert!(d.report_probe_result(true).is_none());
        let t = d.report_probe_result(true);

        assert!(matches!(t, Some(DegradationTransition::Recovered { .. })));
        assert_eq!(d.current_state(), DetectorState::Healthy);
    }

    #[test]
    fn test_extra_failures_while_degraded_do_not_retrigger() {
        let d = detector(2, 2);
        d.report_probe_result(false);
        assert!(d.report_probe_result(false).is_some());

        for _ in 0..5 {
            assert!(d.report_probe_result(false).is_none());
        }
        assert_eq!(d.total_transitions(), 1);
    }

    #[test]
    fn test_zero_thresholds_are_clamped() {
        let d = detector(0, 0);
        assert_eq!(d.config().failure_threshold, 1);
        assert!(d.report_probe_result(false).is_some());
    }

    #[tokio::test]
    async fn test_transition_events_are_broadcast() {
        let d = detector(1, 1);
        let mut rx = d.subscribe_transitions();
        let mut state_rx = d.subscribe_state();

        d.report_probe_result(false);
        d.report_probe_result(true);

        assert_eq!(rx.recv().await.unwrap().target(), DetectorState::Degraded);
        assert_eq!(rx.recv().await.unwrap().target(), DetectorState::Healthy);
        assert_eq!(*state_rx.borrow_and_update(), DetectorState::Healthy);
    }
}
