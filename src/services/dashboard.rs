//! Dashboard HTTP surface
//!
//! Read-only views of degradation state, queue contents, recovery metrics and
//! the lease, plus liveness/metrics endpoints for process supervision. The one
//! write route is the operator's manual recovery trigger.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::coordination::{DegradationDetector, LockManager};
use crate::domain::{DetectorState, LockLease, QueuedTransaction, TransactionStatus};
use crate::error::RosterError;
use crate::persistence::{QueueStats, TransactionQueue};
use crate::services::metrics::{DegradationStatus, MetricsRecorder, RecoveryMetrics, TimelineEvent};
use crate::services::prober::{HealthProber, ProbeResult};
use crate::services::recovery::RecoveryProcessor;

const DEFAULT_PAGE_SIZE: u32 = 50;
const MAX_PAGE_SIZE: u32 = 500;
const DEFAULT_TIMELINE_LIMIT: usize = 50;

/// Shared state for dashboard handlers
#[derive(Clone)]
pub struct DashboardState {
    pub started_at: DateTime<Utc>,
    pub queue: Arc<TransactionQueue>,
    pub detector: Arc<DegradationDetector>,
    pub lock: Arc<LockManager>,
    pub metrics: Arc<MetricsRecorder>,
    pub prober: Arc<HealthProber>,
    pub recovery: Arc<RecoveryProcessor>,
}

impl DashboardState {
    /// Refresh the recorder's queue snapshot before a read
    async fn refresh_queue(&self) -> Result<QueueStats, (StatusCode, String)> {
        let stats = self.queue.stats().await.map_err(internal)?;
        self.metrics.observe_queue(stats.clone());
        Ok(stats)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: DetectorState,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub holds_authority: bool,
    pub queue_size: usize,
    pub buffering: bool,
    pub last_probe: Option<ProbeResult>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuePage {
    pub items: Vec<QueuedTransaction>,
    pub limit: u32,
    pub offset: u32,
    pub total: usize,
}

#[derive(Debug, Deserialize)]
pub struct QueueQuery {
    pub status: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct TimelineQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockStatus {
    pub resource: String,
    pub instance_id: String,
    pub holds_authority: bool,
    pub renewal_failures: u32,
    pub lease: Option<LockLease>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TriggerResponse {
    pub started: bool,
}

fn internal(e: RosterError) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

pub fn create_router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/degradation/status", get(get_degradation_status))
        .route("/api/degradation/timeline", get(get_timeline))
        .route("/api/queue", get(get_queue))
        .route("/api/queue/stats", get(get_queue_stats))
        .route("/api/recovery/metrics", get(get_recovery_metrics))
        .route("/api/recovery/trigger", post(trigger_recovery))
        .route("/api/lock", get(get_lock))
        .with_state(state)
        .layer(cors)
}

pub struct DashboardServer {
    state: DashboardState,
    port: u16,
}

impl DashboardServer {
    pub fn new(state: DashboardState, port: u16) -> Self {
        Self { state, port }
    }

    /// Serve until `shutdown` resolves
    pub async fn run<F>(self, shutdown: F) -> crate::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let app = create_router(self.state);
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting dashboard server on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| RosterError::Internal(format!("Dashboard server error: {}", e)))?;

        Ok(())
    }
}

/// Full health view. Degraded still answers 200: the process is up and buffering.
async fn health_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let queue_size = state.queue.size().await.unwrap_or(0);
    let now = Utc::now();
    Json(HealthResponse {
        status: state.detector.current_state(),
        timestamp: now,
        uptime_seconds: (now - state.started_at).num_seconds().max(0) as u64,
        holds_authority: state.lock.holds_authority(),
        queue_size,
        buffering: state.queue.is_buffering(),
        last_probe: state.prober.last_result(),
    })
}

async fn liveness_handler() -> impl IntoResponse {
    StatusCode::OK
}

/// GET /api/degradation/status
async fn get_degradation_status(
    State(state): State<DashboardState>,
) -> std::result::Result<Json<DegradationStatus>, (StatusCode, String)> {
    state.refresh_queue().await?;
    Ok(Json(state.metrics.degradation_status(Utc::now())))
}

/// GET /api/degradation/timeline?limit=N
async fn get_timeline(
    State(state): State<DashboardState>,
    Query(query): Query<TimelineQuery>,
) -> Json<Vec<TimelineEvent>> {
    let limit = query.limit.unwrap_or(DEFAULT_TIMELINE_LIMIT);
    Json(state.metrics.timeline(limit))
}

/// GET /api/queue?status=queued&limit=50&offset=0
async fn get_queue(
    State(state): State<DashboardState>,
    Query(query): Query<QueueQuery>,
) -> std::result::Result<Json<QueuePage>, (StatusCode, String)> {
    let status = query
        .status
        .as_deref()
        .map(TransactionStatus::try_from)
        .transpose()
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0);

    let items = state
        .queue
        .list_page(status, limit, offset)
        .await
        .map_err(internal)?;
    let stats = state.refresh_queue().await?;
    let total = match status {
        Some(TransactionStatus::Queued) => stats.queued,
        Some(TransactionStatus::Processing) => stats.processing,
        Some(TransactionStatus::Completed) => stats.completed,
        Some(TransactionStatus::Failed) => stats.failed,
        None => stats.total,
    };

    Ok(Json(QueuePage {
        items,
        limit,
        offset,
        total,
    }))
}

/// GET /api/queue/stats
async fn get_queue_stats(
    State(state): State<DashboardState>,
) -> std::result::Result<Json<QueueStats>, (StatusCode, String)> {
    Ok(Json(state.refresh_queue().await?))
}

/// GET /api/recovery/metrics
async fn get_recovery_metrics(
    State(state): State<DashboardState>,
) -> std::result::Result<Json<RecoveryMetrics>, (StatusCode, String)> {
    state.refresh_queue().await?;
    Ok(Json(state.metrics.recovery_metrics()))
}

/// POST /api/recovery/trigger
async fn trigger_recovery(State(state): State<DashboardState>) -> Json<TriggerResponse> {
    Json(TriggerResponse {
        started: state.recovery.trigger_manual(),
    })
}

/// GET /api/lock
async fn get_lock(
    State(state): State<DashboardState>,
) -> std::result::Result<Json<LockStatus>, (StatusCode, String)> {
    let lease = state.lock.current_lease().await.map_err(internal)?;
    Ok(Json(LockStatus {
        resource: state.lock.resource().to_string(),
        instance_id: state.lock.owner_id().to_string(),
        holds_authority: state.lock.holds_authority(),
        renewal_failures: state.lock.renewal_failures(),
        lease,
    }))
}

/// Prometheus metrics endpoint
async fn metrics_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    if let Ok(stats) = state.queue.stats().await {
        state.metrics.observe_queue(stats);
    }
    let authority = u8::from(state.lock.holds_authority());
    let body = format!(
        "{}\n# HELP rosterd_lease_held Authority lease held by this instance\n# TYPE rosterd_lease_held gauge\nrosterd_lease_held {}\n\n# HELP rosterd_probe_failures_total Failed datastore probes\n# TYPE rosterd_probe_failures_total counter\nrosterd_probe_failures_total {}\n",
        state.metrics.prometheus(Utc::now()),
        authority,
        state.prober.total_failures(),
    );

    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; charset=utf-8",
        )],
        body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::postgres::MockRosterDatastore;
    use crate::coordination::{
        DegradationDetectorConfig, GracefulShutdown, LockManagerConfig, RetryPolicy,
    };
    use crate::domain::{FreeAgentMove, TransactionPayload};
    use crate::persistence::transaction_queue::TransactionQueueConfig;
    use crate::persistence::{open_memory_pool, QueueStore, SqliteLeaseStore};
    use crate::services::prober::ProberConfig;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn state() -> DashboardState {
        let pool = open_memory_pool().await.unwrap();
        let queue = Arc::new(TransactionQueue::new(
            QueueStore::from_pool(pool.clone()),
            TransactionQueueConfig::default(),
            RetryPolicy::fixed(3, 0, 2.0, 0),
        ));
        let lock = Arc::new(LockManager::new(
            Arc::new(SqliteLeaseStore::from_pool(pool)),
            "instance-a",
            LockManagerConfig::default(),
            RetryPolicy::fixed(1, 0, 1.0, 0),
        ));
        lock.acquire_or_renew().await.unwrap();
        let detector = Arc::new(DegradationDetector::new(DegradationDetectorConfig::default()));
        let metrics = Arc::new(MetricsRecorder::new());
        let datastore = Arc::new(MockRosterDatastore::new());
        let shutdown = GracefulShutdown::with_defaults();

        DashboardState {
            started_at: Utc::now(),
            queue: queue.clone(),
            detector: detector.clone(),
            lock: lock.clone(),
            metrics: metrics.clone(),
            prober: Arc::new(HealthProber::new(datastore.clone(), ProberConfig::default())),
            recovery: Arc::new(RecoveryProcessor::new(
                queue,
                datastore,
                lock,
                detector,
                metrics,
                shutdown.token(),
            )),
        }
    }

    fn fa(n: u32) -> TransactionPayload {
        TransactionPayload::FreeAgentMove(FreeAgentMove {
            team: "Lakers".to_string(),
            drop_player: format!("Drop{}", n),
            sign_player: format!("Sign{}", n),
            bid_amount: n,
            user_id: "user123".to_string(),
            message_id: format!("msg-{}", n),
        })
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_liveness() {
        let app = create_router(state().await);
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_degradation_status_reports_queue_size() {
        let state = state().await;
        state.metrics.open_episode(Utc::now(), 0);
        state.queue.enqueue(fa(1)).await;
        state.queue.enqueue(fa(2)).await;

        let (status, body) = get_json(create_router(state), "/api/degradation/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["isActive"], true);
        assert_eq!(body["queueSize"], 2);
        assert_eq!(body["recoveryAttemptCount"], 0);
    }

    #[tokio::test]
    async fn test_queue_is_paged() {
        let state = state().await;
        for n in 1..=5 {
            state.queue.enqueue(fa(n)).await;
        }

        let (status, body) = get_json(create_router(state), "/api/queue?limit=2&offset=1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 5);
        let items = body["items"].as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["payload"]["bid_amount"], 2);
        assert_eq!(items[0]["status"], "queued");
    }

    #[tokio::test]
    async fn test_queue_rejects_unknown_status() {
        let (status, _) = get_json(create_router(state().await), "/api/queue?status=resolved").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_recovery_metrics_defaults() {
        let (status, body) = get_json(create_router(state().await), "/api/recovery/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["recoveryAttempts"], 0);
        assert_eq!(body["successRate"], 100.0);
        assert_eq!(body["currentQueueSize"], 0);
    }

    #[tokio::test]
    async fn test_lock_view() {
        let (status, body) = get_json(create_router(state().await), "/api/lock").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["holdsAuthority"], true);
        assert_eq!(body["lease"]["owner_id"], "instance-a");
    }

    #[tokio::test]
    async fn test_prometheus_output() {
        let app = create_router(state().await);
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("rosterd_degraded 0"));
        assert!(text.contains("rosterd_lease_held 1"));
    }
}
