pub mod dashboard;
pub mod metrics;
pub mod prober;
pub mod recovery;
pub mod submission;

pub use dashboard::{create_router, DashboardServer, DashboardState};
pub use metrics::{
    DegradationStatus, MetricsRecorder, RecoveryMetrics, TimelineEvent, TimelineEventType,
};
pub use prober::{HealthProber, ProbeResult, ProberConfig};
pub use recovery::{DrainReport, DrainStop, RecoveryProcessor, RecoveryStats};
pub use submission::{format_status_message, QueueReason, SubmissionGateway, SubmissionOutcome};
