//! Graceful Shutdown Handler
//!
//! Coordinates an orderly stop: background loops are signalled and awaited,
//! in-flight queue claims are handed back, and the authority lease is released
//! so a standby instance can take over without waiting for expiry.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Normal graceful shutdown (SIGTERM, SIGINT)
    Graceful,
    /// Urgent shutdown - skip waiting on background tasks
    Urgent,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Graceful => write!(f, "graceful"),
            ShutdownSignal::Urgent => write!(f, "urgent"),
        }
    }
}

/// Configuration for graceful shutdown
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time to wait for background loops (including a running drain) to stop (default: 30s)
    pub task_stop_timeout_secs: u64,
    /// Time allowed for releasing claims and the lease (default: 10s)
    pub release_timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            task_stop_timeout_secs: 30,
            release_timeout_secs: 10,
        }
    }
}

/// Shutdown phase tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    /// Waiting for probe, renewal, status and drain loops to exit
    StoppingTasks,
    /// Returning this instance's processing claims to the queue
    ReleasingClaims,
    /// Clearing the authority lease
    ReleasingLease,
    Complete,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownPhase::Running => write!(f, "running"),
            ShutdownPhase::StoppingTasks => write!(f, "stopping_tasks"),
            ShutdownPhase::ReleasingClaims => write!(f, "releasing_claims"),
            ShutdownPhase::ReleasingLease => write!(f, "releasing_lease"),
            ShutdownPhase::Complete => write!(f, "complete"),
        }
    }
}

pub type StepFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Graceful shutdown coordinator
pub struct GracefulShutdown {
    config: ShutdownConfig,
    shutdown_requested: AtomicBool,
    phase: watch::Sender<ShutdownPhase>,
    signal_tx: watch::Sender<Option<ShutdownSignal>>,
}

impl GracefulShutdown {
    pub fn new(config: ShutdownConfig) -> Self {
        let (phase, _) = watch::channel(ShutdownPhase::Running);
        let (signal_tx, _) = watch::channel(None);

        Self {
            config,
            shutdown_requested: AtomicBool::new(false),
            phase,
            signal_tx,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ShutdownConfig::default())
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn current_phase(&self) -> ShutdownPhase {
        *self.phase.borrow()
    }

    /// Request shutdown with specified signal type
    pub fn request_shutdown(&self, signal: ShutdownSignal) {
        if self.shutdown_requested.swap(true, Ordering::SeqCst) {
            warn!("Shutdown already requested, ignoring duplicate signal: {}", signal);
            return;
        }

        info!("Shutdown requested: {}", signal);
        self.signal_tx.send_replace(Some(signal));
    }

    fn set_phase(&self, phase: ShutdownPhase) {
        self.phase.send_replace(phase);
        info!("Shutdown phase: {}", phase);
    }

    /// Token for background loops; observes requests made before it was created
    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            signal_rx: self.signal_tx.subscribe(),
        }
    }

    /// Execute the shutdown sequence:
    /// 1. Wait for background loops to stop
    /// 2. Release processing claims held by this instance
    /// 3. Release the authority lease
    pub async fn execute<F1, F2, F3>(
        &self,
        stop_tasks: F1,
        release_claims: F2,
        release_lease: F3,
    ) where
        F1: FnOnce() -> StepFuture<()>,
        F2: FnOnce() -> StepFuture<Result<u64, String>>,
        F3: FnOnce() -> StepFuture<Result<bool, String>>,
    {
        let start = std::time::Instant::now();
        let urgent = *self.signal_tx.borrow() == Some(ShutdownSignal::Urgent);
        info!("Starting graceful shutdown");

        self.set_phase(ShutdownPhase::StoppingTasks);
        if urgent {
            debug!("Urgent shutdown, not waiting on background tasks");
        } else {
            let timeout = Duration::from_secs(self.config.task_stop_timeout_secs);
            if tokio::time::timeout(timeout, stop_tasks()).await.is_err() {
                warn!(
                    "Background tasks did not stop within {}s, proceeding anyway",
                    self.config.task_stop_timeout_secs
                );
            }
        }

        let release_timeout = Duration::from_secs(self.config.release_timeout_secs);

        self.set_phase(ShutdownPhase::ReleasingClaims);
        match tokio::time::timeout(release_timeout, release_claims()).await {
            Ok(Ok(n)) => debug!("Released {} processing claims", n),
            Ok(Err(e)) => warn!("Failed to release processing claims: {}", e),
            Err(_) => warn!("Releasing processing claims timed out"),
        }

        self.set_phase(ShutdownPhase::ReleasingLease);
        match tokio::time::timeout(release_timeout, release_lease()).await {
            Ok(Ok(true)) => debug!("Authority lease released"),
            Ok(Ok(false)) => debug!("No authority lease held"),
            Ok(Err(e)) => warn!("Failed to release authority lease: {}", e),
            Err(_) => warn!("Releasing authority lease timed out"),
        }

        self.set_phase(ShutdownPhase::Complete);
        info!("Graceful shutdown completed in {:?}", start.elapsed());
    }
}

/// Cloneable handle for checking shutdown status in async tasks
#[derive(Clone)]
pub struct ShutdownToken {
    signal_rx: watch::Receiver<Option<ShutdownSignal>>,
}

impl ShutdownToken {
    pub fn is_shutdown_requested(&self) -> bool {
        self.signal_rx.borrow().is_some()
    }

    /// Resolve once shutdown is requested
    pub async fn wait_for_shutdown(&mut self) -> ShutdownSignal {
        loop {
            if let Some(signal) = *self.signal_rx.borrow_and_update() {
                return signal;
            }
            if self.signal_rx.changed().await.is_err() {
                // Coordinator dropped
                return ShutdownSignal::Urgent;
            }
        }
    }
}

/// Install SIGTERM/SIGINT/SIGQUIT handlers that request shutdown
pub async fn install_signal_handlers(shutdown: Arc<GracefulShutdown>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        for (kind, name, sig) in [
            (SignalKind::terminate(), "SIGTERM", ShutdownSignal::Graceful),
            (SignalKind::interrupt(), "SIGINT", ShutdownSignal::Graceful),
            (SignalKind::quit(), "SIGQUIT", ShutdownSignal::Urgent),
        ] {
            let shutdown = shutdown.clone();
            match signal(kind) {
                Ok(mut stream) => {
                    tokio::spawn(async move {
                        stream.recv().await;
                        info!("Received {}", name);
                        shutdown.request_shutdown(sig);
                    });
                }
                Err(e) => warn!("Failed to install {} handler: {}", name, e),
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C");
                shutdown.request_shutdown(ShutdownSignal::Graceful);
            }
        });
    }
}
