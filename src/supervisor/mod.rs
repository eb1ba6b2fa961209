//! Bot supervisor
//!
//! Owns every degradation component for one process and the fixed-interval
//! loops that drive them:
//! - probe loop: ping the datastore, feed the detector, react to transitions
//! - renewal loop: keep the authority lease
//! - status loop: refresh queue gauges, log backlog while degraded, and start a
//!   drain when due work is waiting and nothing is draining
//! - maintenance loop: sweep dedupe entries and purge old terminal records
//!
//! Tests build a supervisor over an in-memory queue and a fake datastore and
//! call [`BotSupervisor::probe_once`] to step it deterministically.

use chrono::Utc;
use futures::future::join_all;
use sqlx::SqlitePool;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::adapters::{PgRosterStore, RosterDatastore};
use crate::config::{AppConfig, LeaseBackend};
use crate::coordination::{
    install_signal_handlers, DegradationDetector, DegradationTransition, GracefulShutdown,
    LockManager, ShutdownSignal,
};
use crate::domain::generate_owner_id;
use crate::error::{Result, RosterError};
use crate::persistence::{
    open_sqlite_pool, LeaseStore, PgLeaseStore, QueueStore, SqliteLeaseStore, TransactionQueue,
};
use crate::services::submission::enter_degraded_mode;
use crate::services::{
    DashboardServer, DashboardState, HealthProber, MetricsRecorder, ProbeResult,
    RecoveryProcessor, SubmissionGateway,
};

/// Interval of the dedupe sweep and terminal-record purge
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(300);

pub struct BotSupervisor {
    config: AppConfig,
    started_at: chrono::DateTime<Utc>,
    queue: Arc<TransactionQueue>,
    detector: Arc<DegradationDetector>,
    lock: Arc<LockManager>,
    prober: Arc<HealthProber>,
    metrics: Arc<MetricsRecorder>,
    recovery: Arc<RecoveryProcessor>,
    gateway: Arc<SubmissionGateway>,
    shutdown: Arc<GracefulShutdown>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BotSupervisor {
    /// Open the local queue and the roster datastore described by `config`
    pub async fn connect(config: AppConfig) -> Result<Self> {
        let queue_pool = open_sqlite_pool(&config.queue.path).await?;
        let roster = PgRosterStore::connect(&config.database.url, config.database.max_connections).await?;

        let lease_store: Arc<dyn LeaseStore> = match config.lease.backend {
            LeaseBackend::Postgres => Arc::new(PgLeaseStore::from_pool(roster.pool().clone())),
            LeaseBackend::Sqlite => Arc::new(SqliteLeaseStore::from_pool(queue_pool.clone())),
        };

        Ok(Self::new(
            config,
            Arc::new(roster),
            queue_pool,
            lease_store,
            generate_owner_id(),
        ))
    }

    /// Wire components over explicit stores
    pub fn new(
        config: AppConfig,
        datastore: Arc<dyn RosterDatastore>,
        queue_pool: SqlitePool,
        lease_store: Arc<dyn LeaseStore>,
        owner_id: impl Into<String>,
    ) -> Self {
        let shutdown = Arc::new(GracefulShutdown::with_defaults());
        let queue = Arc::new(TransactionQueue::new(
            QueueStore::from_pool(queue_pool),
            config.queue.queue_config(),
            config.retry.clone(),
        ));
        let detector = Arc::new(DegradationDetector::new(config.detector.clone()));
        let lock = Arc::new(LockManager::new(
            lease_store,
            owner_id,
            config.lease.manager.clone(),
            config.retry.clone(),
        ));
        let metrics = Arc::new(MetricsRecorder::new());
        let prober = Arc::new(HealthProber::new(datastore.clone(), config.prober.clone()));
        let recovery = Arc::new(RecoveryProcessor::new(
            queue.clone(),
            datastore.clone(),
            lock.clone(),
            detector.clone(),
            metrics.clone(),
            shutdown.token(),
        ));
        let gateway = Arc::new(SubmissionGateway::new(
            queue.clone(),
            datastore,
            lock.clone(),
            detector.clone(),
            metrics.clone(),
            config.dedupe.policy(),
        ));

        info!(owner_id = %lock.owner_id(), "Supervisor initialized");

        Self {
            config,
            started_at: Utc::now(),
            queue,
            detector,
            lock,
            prober,
            metrics,
            recovery,
            gateway,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn queue(&self) -> &Arc<TransactionQueue> {
        &self.queue
    }

    pub fn detector(&self) -> &Arc<DegradationDetector> {
        &self.detector
    }

    pub fn lock(&self) -> &Arc<LockManager> {
        &self.lock
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    pub fn recovery(&self) -> &Arc<RecoveryProcessor> {
        &self.recovery
    }

    pub fn gateway(&self) -> &Arc<SubmissionGateway> {
        &self.gateway
    }

    pub fn shutdown_handle(&self) -> &Arc<GracefulShutdown> {
        &self.shutdown
    }

    pub fn dashboard_state(&self) -> DashboardState {
        DashboardState {
            started_at: self.started_at,
            queue: self.queue.clone(),
            detector: self.detector.clone(),
            lock: self.lock.clone(),
            metrics: self.metrics.clone(),
            prober: self.prober.clone(),
            recovery: self.recovery.clone(),
        }
    }

    /// Run one probe and apply any resulting transition
    pub async fn probe_once(&self) -> ProbeResult {
        let result = self.prober.probe().await;
        self.handle_probe_result(result.success).await;
        result
    }

    /// Feed a probe outcome to the detector and react to a threshold crossing
    pub async fn handle_probe_result(&self, success: bool) -> Option<DegradationTransition> {
        let transition = self.detector.report_probe_result(success)?;
        self.apply_transition(transition).await;
        Some(transition)
    }

    /// React to a detector transition. Safe to call more than once per transition.
    pub async fn apply_transition(&self, transition: DegradationTransition) {
        self.responder().apply(transition).await;
    }

    fn responder(&self) -> TransitionResponder {
        TransitionResponder {
            queue: self.queue.clone(),
            metrics: self.metrics.clone(),
            lock: self.lock.clone(),
            recovery: self.recovery.clone(),
        }
    }

    /// Take the lease (if free) and spawn the background loops
    pub async fn start(&self) {
        if let Err(e) = self.lock.acquire_or_renew().await {
            warn!("Initial lease acquisition failed: {}", e);
        }
        let probe = self.spawn_probe_loop();
        let renewal = tokio::spawn(self.lock.clone().run_renewal_loop(self.shutdown.token()));
        let status = self.spawn_status_loop();
        let maintenance = self.spawn_maintenance_loop();

        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend([probe, renewal, status, maintenance]);
    }

    fn spawn_probe_loop(&self) -> JoinHandle<()> {
        let prober = self.prober.clone();
        let detector = self.detector.clone();
        let responder = self.responder();
        let mut shutdown = self.shutdown.token();
        let interval = self.config.prober.interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let result = prober.probe().await;
                        if let Some(transition) = detector.report_probe_result(result.success) {
                            responder.apply(transition).await;
                        }
                    }
                    _ = shutdown.wait_for_shutdown() => {
                        debug!("Probe loop stopping");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_status_loop(&self) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let detector = self.detector.clone();
        let lock = self.lock.clone();
        let metrics = self.metrics.clone();
        let recovery = self.recovery.clone();
        let mut shutdown = self.shutdown.token();
        let interval = self.config.status_log_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let stats = match queue.stats().await {
                            Ok(stats) => stats,
                            Err(e) => {
                                warn!("Failed to read queue stats: {}", e);
                                continue;
                            }
                        };
                        metrics.observe_queue(stats.clone());

                        if detector.is_degraded() {
                            info!(
                                "Queue status: {} pending ({} FA moves, {} trades), {} failed",
                                stats.pending(),
                                stats.free_agent_moves,
                                stats.trade_approvals,
                                stats.failed
                            );
                        } else if stats.queued > 0 && lock.holds_authority() && !recovery.is_running() {
                            debug!("Queued work found while healthy, starting drain");
                            recovery.trigger();
                        }
                    }
                    _ = shutdown.wait_for_shutdown() => {
                        debug!("Status loop stopping");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_maintenance_loop(&self) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let gateway = self.gateway.clone();
        let retention = self.config.queue.retention();
        let mut shutdown = self.shutdown.token();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let swept = gateway.sweep_dedupe();
                        if swept > 0 {
                            debug!("Swept {} expired dedupe entries", swept);
                        }
                        match queue.purge_terminal(retention).await {
                            Ok(0) => {}
                            Ok(n) => info!("Purged {} terminal transactions", n),
                            Err(e) => warn!("Failed to purge terminal transactions: {}", e),
                        }
                    }
                    _ = shutdown.wait_for_shutdown() => {
                        debug!("Maintenance loop stopping");
                        break;
                    }
                }
            }
        })
    }

    /// Run until a shutdown signal, serving the dashboard meanwhile
    pub async fn run(&self) -> Result<()> {
        install_signal_handlers(self.shutdown.clone()).await;
        self.start().await;

        let mut dashboard_token = self.shutdown.token();
        let server = DashboardServer::new(self.dashboard_state(), self.config.dashboard.port);
        let dashboard = tokio::spawn(async move {
            let stop = async move {
                dashboard_token.wait_for_shutdown().await;
            };
            if let Err(e) = server.run(stop).await {
                error!("Dashboard server failed: {}", e);
            }
        });

        let signal = self.shutdown.token().wait_for_shutdown().await;
        info!("Stopping supervisor ({})", signal);
        self.stop().await;
        if let Err(e) = dashboard.await {
            error!("Dashboard task failed: {}", e);
        }
        Ok(())
    }

    /// Request shutdown and run the release sequence
    pub async fn shutdown(&self, signal: ShutdownSignal) {
        self.shutdown.request_shutdown(signal);
        self.stop().await;
    }

    async fn stop(&self) {
        let tasks: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        let recovery = self.recovery.clone();
        let queue = self.queue.clone();
        let lock = self.lock.clone();
        let owner_id = self.lock.owner_id().to_string();

        self.shutdown
            .execute(
                move || {
                    Box::pin(async move {
                        recovery.wait_idle().await;
                        for result in join_all(tasks).await {
                            if let Err(e) = result {
                                error!("Background task failed: {}", e);
                            }
                        }
                    })
                },
                move || {
                    Box::pin(async move {
                        queue
                            .release_claims_by(&owner_id)
                            .await
                            .map_err(|e| e.to_string())
                    })
                },
                move || Box::pin(async move { lock.release().await.map_err(|e| e.to_string()) }),
            )
            .await;
    }
}

/// Component handles the probe loop needs to react to transitions
struct TransitionResponder {
    queue: Arc<TransactionQueue>,
    metrics: Arc<MetricsRecorder>,
    lock: Arc<LockManager>,
    recovery: Arc<RecoveryProcessor>,
}

impl TransitionResponder {
    async fn apply(&self, transition: DegradationTransition) {
        match transition {
            DegradationTransition::Degraded { at } => {
                enter_degraded_mode(&self.queue, &self.metrics, at).await;
            }
            DegradationTransition::Recovered { at } => {
                self.queue.set_buffering(false);
                let backlog = self.queue.size().await.unwrap_or(0);
                if let Some(episode) = self.metrics.close_episode(at, backlog) {
                    info!(
                        "Datastore recovered after {}ms, {} transactions to drain",
                        episode.duration_ms(at),
                        backlog
                    );
                }
                // Renewals may have failed for the whole outage and let the lease lapse
                match self.lock.require_authority().await {
                    Ok(()) => {
                        self.recovery.trigger();
                    }
                    Err(RosterError::LeaseNotHeld { .. }) => {
                        info!("Not the lease holder, leaving the backlog to the active instance");
                    }
                    Err(e) => {
                        warn!("Could not confirm the authority lease after recovery: {}", e);
                    }
                }
            }
        }
    }
}
