//! Error types for docsync-core

use thiserror::Error;

use crate::remote::RemoteError;

/// Result type alias using docsync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in docsync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Document not found locally
    #[error("Document not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Object storage configuration or client error
    #[error("Storage error: {0}")]
    Storage(String),

    /// No authenticated principal; sync is blocked until re-authentication
    #[error("Identity unavailable: {0}")]
    IdentityUnavailable(String),

    /// Failure reported by a remote collaborator
    #[error("Remote error: {0}")]
    Remote(RemoteError),

    /// A sync state change that the state machine does not allow
    #[error("Invalid sync state transition for {sync_id}: {from} on {trigger}")]
    InvalidTransition {
        sync_id: String,
        from: String,
        trigger: String,
    },

    /// Enqueue attempted before persisted entries were reloaded
    #[error("Offline queue has not been initialized")]
    QueueNotInitialized,

    /// New-path copy is inconsistent with the legacy source
    #[error("Migration verification failed for {path}: {reason}")]
    MigrationVerificationFailed { path: String, reason: String },

    /// File missing under both the current and the legacy path
    #[error("File not found at current or legacy path: {0}")]
    FileNotFound(String),

    /// A shared sync pass ended without a summary
    #[error("Sync pass failed: {0}")]
    SyncFailed(String),
}

impl From<RemoteError> for Error {
    fn from(error: RemoteError) -> Self {
        match error {
            RemoteError::IdentityUnavailable(message) => Self::IdentityUnavailable(message),
            other => Self::Remote(other),
        }
    }
}

impl Error {
    /// Whether retrying the same call later can succeed without user action.
    pub const fn is_retriable(&self) -> bool {
        match self {
            Self::Remote(remote) => remote.is_retriable(),
            Self::MigrationVerificationFailed { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_remote_error_maps_to_identity_unavailable() {
        let error: Error = RemoteError::IdentityUnavailable("signed out".to_string()).into();
        assert!(matches!(error, Error::IdentityUnavailable(_)));
        assert!(!error.is_retriable());
    }

    #[test]
    fn transient_remote_errors_are_retriable() {
        let error: Error = RemoteError::Transient("connection reset".to_string()).into();
        assert!(error.is_retriable());

        let error: Error = RemoteError::Validation("bad payload".to_string()).into();
        assert!(!error.is_retriable());
    }
}
