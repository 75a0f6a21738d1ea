//! Error types for the sync layer.

use std::time::Duration;

use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while replicating shapes into the local database.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network failure talking to the shape endpoint.
    #[error("transport error: {0}")]
    Transport(String),

    /// A shape request did not complete within the request timeout.
    #[error("shape request timed out after {0:?}")]
    Timeout(Duration),

    /// The shape endpoint answered with an unexpected status.
    #[error("shape endpoint returned status {status}: {message}")]
    UpstreamStatus { status: u16, message: String },

    /// A response body or header could not be decoded.
    #[error("failed to decode shape response: {0}")]
    Decode(String),

    /// Error from the embedded database.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Filesystem error preparing the database location.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Error running bookkeeping migrations.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// An insert or update arrived without a row payload.
    #[error("{kind} for key '{key}' in table '{table}' carries no row payload")]
    MissingPayload {
        table: String,
        key: String,
        kind: &'static str,
    },

    /// A row did not contain the table's primary key columns.
    #[error("row in table '{table}' is missing primary key column '{column}'")]
    MissingPrimaryKey { table: String, column: String },

    /// A table definition is not usable.
    #[error("invalid table '{name}': {reason}")]
    InvalidTable { name: String, reason: String },

    /// The table catalog has unknown or cyclic dependencies.
    #[error("invalid table catalog: {0}")]
    Catalog(String),

    /// The embedded database handle is unusable.
    #[error("embedded database connection is dead: {0}")]
    ConnectionDead(String),

    /// The operation was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// The coordinator is not running.
    #[error("sync session is not running")]
    NotRunning,
}

impl SyncError {
    /// Returns true for transient upstream failures that are retried with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport(_) | SyncError::Timeout(_) | SyncError::Decode(_) => true,
            SyncError::UpstreamStatus { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            SyncError::Decode(e.to_string())
        } else {
            SyncError::Transport(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::Transport("connection reset".into()).is_retryable());
        assert!(SyncError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(SyncError::UpstreamStatus {
            status: 503,
            message: "unavailable".into()
        }
        .is_retryable());
        assert!(SyncError::UpstreamStatus {
            status: 429,
            message: "slow down".into()
        }
        .is_retryable());
        assert!(!SyncError::UpstreamStatus {
            status: 400,
            message: "bad table".into()
        }
        .is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::MissingPayload {
            table: "projects".into(),
            key: "p1".into(),
            kind: "insert",
        };
        assert_eq!(
            err.to_string(),
            "insert for key 'p1' in table 'projects' carries no row payload"
        );
        assert_eq!(SyncError::NotRunning.to_string(), "sync session is not running");
    }
}
