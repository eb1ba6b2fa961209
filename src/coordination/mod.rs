//! Coordination Layer
//!
//! This module provides the state machines that decide when and where
//! mutations may run:
//! - Degradation detector with hysteresis over datastore probes
//! - Lease-based lock manager arbitrating mutation authority between instances
//! - Shared retry/backoff policy
//! - Graceful shutdown handling

pub mod degradation;
pub mod lease;
pub mod retry;
pub mod shutdown;

pub use degradation::{DegradationDetector, DegradationDetectorConfig, DegradationTransition};
pub use lease::{LockManager, LockManagerConfig};
pub use retry::RetryPolicy;
pub use shutdown::{
    install_signal_handlers, GracefulShutdown, ShutdownConfig, ShutdownPhase, ShutdownSignal,
    ShutdownToken,
};
