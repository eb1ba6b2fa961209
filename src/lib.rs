pub mod adapters;
pub mod cli;
pub mod collections;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod persistence;
pub mod services;
pub mod supervisor;

pub use adapters::{PgRosterStore, RosterDatastore};
pub use config::AppConfig;
pub use coordination::{
    DegradationDetector, DegradationDetectorConfig, DegradationTransition, GracefulShutdown,
    LockManager, LockManagerConfig, RetryPolicy, ShutdownSignal,
};
pub use domain::{
    DegradationEpisode, DetectorState, FreeAgentMove, LeaseOutcome, LockLease, QueuedTransaction,
    TradeApproval, TransactionKind, TransactionPayload, TransactionStatus,
};
pub use error::{DatastoreError, Result, RosterError};
pub use persistence::{LeaseStore, PgLeaseStore, QueueStats, SqliteLeaseStore, TransactionQueue};
pub use services::{
    HealthProber, MetricsRecorder, QueueReason, RecoveryProcessor, SubmissionGateway,
    SubmissionOutcome,
};
pub use supervisor::BotSupervisor;
