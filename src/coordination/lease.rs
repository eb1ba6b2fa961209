//! Distributed Lock Manager
//!
//! Decides whether this process may mutate roster state. Authority is a lease
//! row in a shared store, written with one atomic conditional upsert (see
//! [`crate::persistence::lease_store`]). Locally, authority is held only while
//! the last successful write's expiry is in the future, so a holder that cannot
//! renew loses authority implicitly once the lease runs out.
//!
//! Renewal errors are tolerated up to `max_renewal_failures` in a row; past
//! that the mutation path is paused until a renewal succeeds again. A `Denied`
//! outcome means another instance owns the lease and drops authority at once.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::retry::RetryPolicy;
use super::shutdown::ShutdownToken;
use crate::domain::{LeaseOutcome, LockLease, BOT_AUTHORITY_RESOURCE};
use crate::error::{Result, RosterError};
use crate::persistence::LeaseStore;

/// Lease timing
#[derive(Debug, Clone, Deserialize)]
pub struct LockManagerConfig {
    /// Resource guarding mutation authority
    #[serde(default = "default_resource")]
    pub resource: String,
    /// Lease lifetime in seconds (default: 120)
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,
    /// Seconds between renewals (default: 30)
    #[serde(default = "default_renewal_interval_secs")]
    pub renewal_interval_secs: u64,
    /// Consecutive renewal errors tolerated before pausing mutations
    #[serde(default = "default_max_renewal_failures")]
    pub max_renewal_failures: u32,
}

fn default_resource() -> String {
    BOT_AUTHORITY_RESOURCE.to_string()
}

fn default_duration_secs() -> u64 {
    120
}

fn default_renewal_interval_secs() -> u64 {
    30
}

fn default_max_renewal_failures() -> u32 {
    3
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            resource: default_resource(),
            duration_secs: default_duration_secs(),
            renewal_interval_secs: default_renewal_interval_secs(),
            max_renewal_failures: default_max_renewal_failures(),
        }
    }
}

impl LockManagerConfig {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub fn renewal_interval(&self) -> Duration {
        Duration::from_secs(self.renewal_interval_secs)
    }
}

/// Per-instance view of the authority lease
pub struct LockManager {
    store: Arc<dyn LeaseStore>,
    owner_id: String,
    config: LockManagerConfig,
    renewal_retry: RetryPolicy,
    renewal_failures: AtomicU32,
    /// Expiry of the last lease write this instance won
    held_until: Mutex<Option<DateTime<Utc>>>,
    /// False while paused after repeated renewal failures or after a denial
    authority_tx: watch::Sender<bool>,
}

impl LockManager {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        owner_id: impl Into<String>,
        config: LockManagerConfig,
        renewal_retry: RetryPolicy,
    ) -> Self {
        let (authority_tx, _) = watch::channel(false);
        Self {
            store,
            owner_id: owner_id.into(),
            config,
            renewal_retry,
            renewal_failures: AtomicU32::new(0),
            held_until: Mutex::new(None),
            authority_tx,
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn resource(&self) -> &str {
        &self.config.resource
    }

    pub fn config(&self) -> &LockManagerConfig {
        &self.config
    }

    /// One acquire-or-renew write at the current time
    pub async fn acquire_or_renew(&self) -> Result<LeaseOutcome> {
        self.acquire_or_renew_at(Utc::now()).await
    }

    /// One acquire-or-renew write as of `now`
    pub async fn acquire_or_renew_at(&self, now: DateTime<Utc>) -> Result<LeaseOutcome> {
        let expires_at = now
            + chrono::Duration::from_std(self.config.lease_duration())
                .map_err(|e| RosterError::Validation(format!("lease duration: {}", e)))?;

        match self
            .store
            .try_acquire(&self.config.resource, &self.owner_id, now, expires_at)
            .await
        {
            Ok(outcome) => {
                self.renewal_failures.store(0, Ordering::SeqCst);
                self.apply_outcome(outcome, expires_at);
                Ok(outcome)
            }
            Err(e) => {
                self.record_renewal_failure(&e);
                Err(e)
            }
        }
    }

    fn apply_outcome(&self, outcome: LeaseOutcome, expires_at: DateTime<Utc>) {
        let was_authoritative = *self.authority_tx.borrow();
        match outcome {
            LeaseOutcome::Acquired | LeaseOutcome::Renewed => {
                *self.lock_held_until() = Some(expires_at);
                if !was_authoritative {
                    info!(
                        owner_id = %self.owner_id,
                        resource = %self.config.resource,
                        "Mutation authority {} (lease until {})",
                        outcome,
                        expires_at
                    );
                }
                self.authority_tx.send_replace(true);
            }
            LeaseOutcome::Denied => {
                *self.lock_held_until() = None;
                if was_authoritative {
                    warn!(
                        owner_id = %self.owner_id,
                        resource = %self.config.resource,
                        "Lease taken over by another instance, mutation authority lost"
                    );
                } else {
                    debug!("Lease {} held by another instance", self.config.resource);
                }
                self.authority_tx.send_replace(false);
            }
        }
    }

    fn record_renewal_failure(&self, err: &RosterError) {
        let failures = self.renewal_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.config.max_renewal_failures.max(1) {
            if *self.authority_tx.borrow() {
                error!(
                    owner_id = %self.owner_id,
                    "Lease renewal failed {} times in a row ({}), pausing mutations",
                    failures, err
                );
            }
            self.authority_tx.send_replace(false);
        } else {
            warn!(
                owner_id = %self.owner_id,
                "Lease renewal failed ({}/{}): {}",
                failures, self.config.max_renewal_failures, err
            );
        }
    }

    /// Renewal tick: acquire-or-renew with the shared retry policy.
    /// An exhausted retry budget counts as one renewal failure.
    pub async fn renew(&self) -> Result<LeaseOutcome> {
        let expires_in = chrono::Duration::from_std(self.config.lease_duration())
            .map_err(|e| RosterError::Validation(format!("lease duration: {}", e)))?;

        let started = Utc::now();
        let result = self
            .renewal_retry
            .run(|_| {
                let now = Utc::now();
                self.store
                    .try_acquire(&self.config.resource, &self.owner_id, now, now + expires_in)
            })
            .await;

        match result {
            Ok(outcome) => {
                self.renewal_failures.store(0, Ordering::SeqCst);
                // Never later than the expiry the store recorded
                self.apply_outcome(outcome, started + expires_in);
                Ok(outcome)
            }
            Err(e) => {
                self.record_renewal_failure(&e);
                Err(e)
            }
        }
    }

    /// Whether this instance may mutate right now
    pub fn holds_authority(&self) -> bool {
        self.holds_authority_at(Utc::now())
    }

    pub fn holds_authority_at(&self, now: DateTime<Utc>) -> bool {
        *self.authority_tx.borrow()
            && self
                .lock_held_until()
                .map_or(false, |held_until| now < held_until)
    }

    /// Confirm authority before a mutation, re-acquiring a lapsed lease.
    /// `LeaseNotHeld` means another instance owns it; store errors pass through.
    pub async fn require_authority(&self) -> Result<()> {
        if self.holds_authority() {
            return Ok(());
        }
        if self.acquire_or_renew().await?.is_held() {
            Ok(())
        } else {
            Err(RosterError::LeaseNotHeld {
                resource: self.config.resource.clone(),
                owner_id: self.owner_id.clone(),
            })
        }
    }

    pub fn subscribe_authority(&self) -> watch::Receiver<bool> {
        self.authority_tx.subscribe()
    }

    pub fn renewal_failures(&self) -> u32 {
        self.renewal_failures.load(Ordering::SeqCst)
    }

    /// Clear the lease if this instance still owns it
    pub async fn release(&self) -> Result<bool> {
        self.authority_tx.send_replace(false);
        *self.lock_held_until() = None;
        let released = self
            .store
            .release(&self.config.resource, &self.owner_id)
            .await?;
        if released {
            info!(owner_id = %self.owner_id, "Released lease {}", self.config.resource);
        }
        Ok(released)
    }

    pub async fn current_lease(&self) -> Result<Option<LockLease>> {
        self.store.current(&self.config.resource).await
    }

    /// Drop the lease whoever holds it. Operator recovery only.
    pub async fn force_clear(&self) -> Result<bool> {
        self.store.force_clear(&self.config.resource).await
    }

    fn lock_held_until(&self) -> std::sync::MutexGuard<'_, Option<DateTime<Utc>>> {
        self.held_until.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Acquire immediately, then renew every `renewal_interval` until shutdown
    pub async fn run_renewal_loop(self: Arc<Self>, mut shutdown: ShutdownToken) {
        let mut interval = tokio::time::interval(self.config.renewal_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            owner_id = %self.owner_id,
            "Lease renewal loop started (every {}s, lease {}s)",
            self.config.renewal_interval_secs, self.config.duration_secs
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    // Failures are logged and counted inside renew()
                    let _ = self.renew().await;
                }
                _ = shutdown.wait_for_shutdown() => {
                    debug!("Lease renewal loop stopping");
                    break;
                }
            }
        }
    }
}
