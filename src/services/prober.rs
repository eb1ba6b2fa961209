//! Datastore health prober
//!
//! Issues one `ping` per tick. A ping that does not answer within
//! `timeout_ms` counts as a failure. The only state kept is a rolling count
//! of consecutive failures plus totals for the status surfaces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::adapters::RosterDatastore;
use crate::error::RosterError;

/// Probe schedule
#[derive(Debug, Clone, Deserialize)]
pub struct ProberConfig {
    /// Seconds between probes (default: 5)
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Per-probe timeout in milliseconds (default: 3000)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_interval_secs() -> u64 {
    5
}

fn default_timeout_ms() -> u64 {
    3000
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl ProberConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Outcome of one liveness check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub success: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

pub struct HealthProber {
    datastore: Arc<dyn RosterDatastore>,
    config: ProberConfig,
    consecutive_failures: AtomicU32,
    total_probes: AtomicU64,
    total_failures: AtomicU64,
    last_result: Mutex<Option<ProbeResult>>,
}

impl HealthProber {
    pub fn new(datastore: Arc<dyn RosterDatastore>, config: ProberConfig) -> Self {
        Self {
            datastore,
            config,
            consecutive_failures: AtomicU32::new(0),
            total_probes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            last_result: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ProberConfig {
        &self.config
    }

    /// Run one probe
    pub async fn probe(&self) -> ProbeResult {
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.config.timeout(), self.datastore.ping()).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(
                RosterError::ProbeTimeout {
                    elapsed_ms: latency_ms,
                }
                .to_string(),
            ),
        };

        let result = ProbeResult {
            success: error.is_none(),
            latency_ms,
            error,
            at: Utc::now(),
        };
        self.record(&result);
        result
    }

    fn record(&self, result: &ProbeResult) {
        self.total_probes.fetch_add(1, Ordering::Relaxed);
        if result.success {
            self.consecutive_failures.store(0, Ordering::SeqCst);
            debug!("Datastore probe ok ({}ms)", result.latency_ms);
        } else {
            self.total_failures.fetch_add(1, Ordering::Relaxed);
            let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
            warn!(
                "Datastore probe failed ({} in a row): {}",
                failures,
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
        *self.last_result.lock().unwrap_or_else(|e| e.into_inner()) = Some(result.clone());
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn total_probes(&self) -> u64 {
        self.total_probes.load(Ordering::Relaxed)
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures.load(Ordering::Relaxed)
    }

    pub fn last_result(&self) -> Option<ProbeResult> {
        self.last_result
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::postgres::MockRosterDatastore;
    use crate::error::DatastoreError;

    fn prober(mock: MockRosterDatastore, timeout_ms: u64) -> HealthProber {
        HealthProber::new(
            Arc::new(mock),
            ProberConfig {
                interval_secs: 1,
                timeout_ms,
            },
        )
    }

    #[tokio::test]
    async fn test_successful_probe_resets_failures() {
        let mut mock = MockRosterDatastore::new();
        let mut calls = 0;
        mock.expect_ping().times(3).returning(move || {
            calls += 1;
            if calls < 3 {
                Err(DatastoreError::Transient("connection refused".into()))
            } else {
                Ok(())
            }
        });
        let prober = prober(mock, 1000);

        assert!(!prober.probe().await.success);
        assert!(!prober.probe().await.success);
        assert_eq!(prober.consecutive_failures(), 2);

        assert!(prober.probe().await.success);
        assert_eq!(prober.consecutive_failures(), 0);
        assert_eq!(prober.total_probes(), 3);
        assert_eq!(prober.total_failures(), 2);
    }

    #[tokio::test]
    async fn test_slow_ping_counts_as_failure() {
        struct SlowStore;

        #[async_trait::async_trait]
        impl RosterDatastore for SlowStore {
            async fn ping(&self) -> Result<(), DatastoreError> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            }
            async fn check_free_agent_move(
                &self,
                _: &crate::domain::FreeAgentMove,
            ) -> Result<(), DatastoreError> {
                Ok(())
            }
            async fn apply_free_agent_move(
                &self,
                _: &crate::domain::FreeAgentMove,
            ) -> Result<String, DatastoreError> {
                Ok(String::new())
            }
            async fn check_trade_approval(
                &self,
                _: &crate::domain::TradeApproval,
            ) -> Result<(), DatastoreError> {
                Ok(())
            }
            async fn apply_trade_approval(
                &self,
                _: &crate::domain::TradeApproval,
            ) -> Result<String, DatastoreError> {
                Ok(String::new())
            }
        }

        let prober = HealthProber::new(
            Arc::new(SlowStore),
            ProberConfig {
                interval_secs: 1,
                timeout_ms: 20,
            },
        );

        let result = prober.probe().await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
        assert_eq!(prober.consecutive_failures(), 1);
    }
}
