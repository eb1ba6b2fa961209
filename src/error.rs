use thiserror::Error;

/// Main error type for the roster bot core
#[derive(Error, Debug)]
pub enum RosterError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Queue errors
    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Unknown transaction kind: {0}")]
    UnknownKind(String),

    // Coordination errors
    #[error("Lease on {resource} not held by {owner_id}")]
    LeaseNotHeld { resource: String, owner_id: String },

    #[error("Probe timed out after {elapsed_ms}ms")]
    ProbeTimeout { elapsed_ms: u64 },

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for RosterError
pub type Result<T> = std::result::Result<T, RosterError>;

/// Outcome classification for calls into the roster datastore.
///
/// `Transient` failures are retried with backoff; `RuleViolation` failures are
/// terminal and never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DatastoreError {
    #[error("Datastore unavailable: {0}")]
    Transient(String),

    #[error("Rule violation: {0}")]
    RuleViolation(String),
}

impl DatastoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DatastoreError::Transient(_))
    }
}

impl From<sqlx::Error> for DatastoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DatastoreError::RuleViolation(err.to_string()),
            other => DatastoreError::Transient(other.to_string()),
        }
    }
}

impl From<DatastoreError> for RosterError {
    fn from(err: DatastoreError) -> Self {
        RosterError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datastore_error_classification() {
        assert!(DatastoreError::Transient("timeout".into()).is_retryable());
        assert!(!DatastoreError::RuleViolation("already signed".into()).is_retryable());
    }

    #[test]
    fn test_pool_errors_are_transient() {
        let err: DatastoreError = sqlx::Error::PoolTimedOut.into();
        assert!(err.is_retryable());

        let err: DatastoreError = sqlx::Error::RowNotFound.into();
        assert!(!err.is_retryable());
    }
}
