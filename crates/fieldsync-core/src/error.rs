//! Error taxonomy
//!
//! Every failure the engine reports is classified exactly once into a closed
//! [`ErrorKind`]. Remote errors are classified where the propagation attempt
//! returns; local commit errors are classified where the commit returns.
//! Callers match on the kind instead of inspecting error messages.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::RecordId;

/// Stable classification of an engine failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Local storage fault; fatal for the request and never retried
    LocalCommit,
    /// Network blip, timeout or unreachable backend; retried, then queued
    TransientNetwork,
    /// Quota, authentication or rejection; surfaced immediately and queued
    PermanentRemote,
    /// Concurrent edits that need a user decision
    ConflictUnresolved,
    /// Superseded or torn down; an expected outcome, not a failure
    Cancelled,
    /// Empty record id, empty mutation, malformed field name
    InvalidRequest,
}

impl ErrorKind {
    /// Whether the retry loop may try again after this kind of failure
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::TransientNetwork)
    }

    /// Short machine-readable name
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::LocalCommit => "local_commit",
            ErrorKind::TransientNetwork => "transient_network",
            ErrorKind::PermanentRemote => "permanent_remote",
            ErrorKind::ConflictUnresolved => "conflict_unresolved",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InvalidRequest => "invalid_request",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason a remote rejected a change for good
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermanentReason {
    QuotaExceeded,
    Unauthorized,
    Rejected,
}

/// Errors returned by a remote backend
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    /// Temporary failure; the same request may succeed later
    #[error("Transient remote error: {0}")]
    Transient(String),

    /// The attempt did not finish within its timeout
    #[error("Remote attempt timed out after {0:?}")]
    Timeout(Duration),

    /// Backend is not reachable at all
    #[error("Remote backend is unreachable")]
    Unreachable,

    /// Retrying cannot fix this
    #[error("Remote rejected the change ({reason:?}): {message}")]
    Permanent {
        reason: PermanentReason,
        message: String,
    },
}

impl RemoteError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            RemoteError::Transient(_) | RemoteError::Timeout(_) | RemoteError::Unreachable => {
                ErrorKind::TransientNetwork
            }
            RemoteError::Permanent { .. } => ErrorKind::PermanentRemote,
        }
    }

    pub fn quota_exceeded(message: impl Into<String>) -> Self {
        RemoteError::Permanent {
            reason: PermanentReason::QuotaExceeded,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        RemoteError::Permanent {
            reason: PermanentReason::Unauthorized,
            message: message.into(),
        }
    }
}

/// Errors from the local persistence collaborator
#[derive(Error, Debug)]
pub enum LocalCommitError {
    /// Disk is full or quota exceeded
    #[error("Local storage is full: {0}")]
    StorageFull(String),

    /// SQLite database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Stored payload could not be encoded or decoded
    #[error("Corrupt record '{record_id}': {details}")]
    Corrupt { record_id: RecordId, details: String },

    /// Failed to open the store location
    #[error("Failed to open local store at '{path}': {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Anything else the store wants to report
    #[error("Local commit failed: {0}")]
    Other(String),
}

impl LocalCommitError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::LocalCommit
    }

    /// Classify a SQLite error, separating out a full disk
    pub fn from_sqlite(error: rusqlite::Error) -> Self {
        match error {
            rusqlite::Error::SqliteFailure(ref inner, _)
                if inner.code == rusqlite::ErrorCode::DiskFull =>
            {
                LocalCommitError::StorageFull(error.to_string())
            }
            other => LocalCommitError::Database(other),
        }
    }

    /// Classify an I/O error raised while opening the store
    pub fn from_io(error: io::Error, path: PathBuf) -> Self {
        if is_disk_full_error(&error) {
            LocalCommitError::StorageFull(format!("{}: {}", path.display(), error))
        } else {
            LocalCommitError::Open {
                path,
                source: error,
            }
        }
    }
}

/// Check if an I/O error indicates a disk full condition
fn is_disk_full_error(error: &io::Error) -> bool {
    let msg = error.to_string().to_lowercase();
    msg.contains("no space left")
        || msg.contains("disk full")
        || msg.contains("quota exceeded")
        || msg.contains("not enough space")
}

/// Errors from the pending change queue
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Queue payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to create queue directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Top-level engine error for operations that are not save outcomes
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Local(#[from] LocalCommitError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            EngineError::Local(e) => e.kind(),
            EngineError::Remote(e) => e.kind(),
            // Queue writes are local storage writes
            EngineError::Queue(_) => ErrorKind::LocalCommit,
        }
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_classification() {
        assert_eq!(
            RemoteError::Transient("reset".into()).kind(),
            ErrorKind::TransientNetwork
        );
        assert_eq!(
            RemoteError::Timeout(Duration::from_secs(5)).kind(),
            ErrorKind::TransientNetwork
        );
        assert_eq!(RemoteError::Unreachable.kind(), ErrorKind::TransientNetwork);
        assert_eq!(
            RemoteError::quota_exceeded("full").kind(),
            ErrorKind::PermanentRemote
        );
        assert_eq!(
            RemoteError::unauthorized("expired").kind(),
            ErrorKind::PermanentRemote
        );
    }

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(ErrorKind::TransientNetwork.is_retryable());
        assert!(!ErrorKind::PermanentRemote.is_retryable());
        assert!(!ErrorKind::LocalCommit.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
    }

    #[test]
    fn test_engine_error_kind() {
        let err = EngineError::from(LocalCommitError::StorageFull("no space left".into()));
        assert_eq!(err.kind(), ErrorKind::LocalCommit);

        let err = EngineError::InvalidRequest("empty".into());
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[test]
    fn test_disk_full_detection() {
        let io_err = io::Error::new(io::ErrorKind::Other, "No space left on device");
        let err = LocalCommitError::from_io(io_err, PathBuf::from("/full/disk"));
        assert!(matches!(err, LocalCommitError::StorageFull(_)));

        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        let err = LocalCommitError::from_io(io_err, PathBuf::from("/locked"));
        assert!(matches!(err, LocalCommitError::Open { .. }));
        assert!(err.to_string().contains("/locked"));
    }

    #[test]
    fn test_error_display() {
        let err = RemoteError::quota_exceeded("storage plan exhausted");
        let msg = err.to_string();
        assert!(msg.contains("QuotaExceeded"));
        assert!(msg.contains("storage plan exhausted"));
        assert_eq!(ErrorKind::PermanentRemote.to_string(), "permanent_remote");
    }
}
