//! Error types for the replication subsystem.

use std::path::PathBuf;
use std::time::Duration;

use tessera_store::StoreError;
use thiserror::Error;

/// Result type alias for replication operations.
pub type ReplResult<T> = Result<T, ReplError>;

/// Errors that can occur in the replication subsystem.
#[derive(Debug, Error)]
pub enum ReplError {
    /// Error raised by the store layer (configuration, engine, reads).
    #[error(transparent)]
    Store(#[from] StoreError),

    /// I/O error while publishing or copying.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Manifest encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A generation marker does not contain a generation number.
    #[error("malformed generation marker {path}: {content:?}")]
    MalformedMarker {
        /// Path of the marker file.
        path: PathBuf,
        /// What was found in it.
        content: String,
    },

    /// A copied generation does not match its manifest.
    #[error("manifest mismatch in {directory}: {reason}")]
    ManifestMismatch {
        /// Directory being verified.
        directory: String,
        /// Description of the mismatch.
        reason: String,
    },

    /// A slave copy exceeded its time bound.
    #[error("copy of {directory} timed out after {timeout:?}")]
    CopyTimeout {
        /// Directory being copied.
        directory: String,
        /// Configured bound.
        timeout: Duration,
    },

    /// A transfer was cancelled before it completed.
    #[error("transfer cancelled")]
    Cancelled,

    /// The refresh scheduler was shut down.
    #[error("refresh scheduler shut down")]
    Shutdown,
}

impl ReplError {
    /// Whether the next scheduled tick may succeed without intervention.
    pub fn is_transient(&self) -> bool {
        match self {
            ReplError::Io(_)
            | ReplError::MalformedMarker { .. }
            | ReplError::ManifestMismatch { .. }
            | ReplError::CopyTimeout { .. }
            | ReplError::Cancelled => true,
            ReplError::Store(e) => matches!(
                e,
                StoreError::Io(_) | StoreError::CorruptIndex { .. } | StoreError::Serialization(_)
            ),
            ReplError::Serialization(_) => true,
            ReplError::Shutdown => false,
        }
    }

    pub(crate) fn task_failed(e: tokio::task::JoinError) -> Self {
        ReplError::Io(std::io::Error::other(format!(
            "background task failed: {}",
            e
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let io = ReplError::Io(std::io::Error::other("disk busy"));
        assert!(io.is_transient());

        let timeout = ReplError::CopyTimeout {
            directory: "Animal.0".to_string(),
            timeout: Duration::from_secs(600),
        };
        assert!(timeout.is_transient());

        let config = ReplError::Store(StoreError::config("shard_count must be at least 1"));
        assert!(!config.is_transient());
        assert!(!ReplError::Shutdown.is_transient());
    }

    #[test]
    fn test_store_error_is_transparent() {
        let err = ReplError::from(StoreError::ReadOnly {
            directory: "Animal.1".to_string(),
        });
        assert_eq!(format!("{}", err), "Directory Animal.1 is read-only");
    }

    #[test]
    fn test_copy_timeout_message() {
        let err = ReplError::CopyTimeout {
            directory: "Animal.1".to_string(),
            timeout: Duration::from_secs(30),
        };
        assert_eq!(format!("{}", err), "copy of Animal.1 timed out after 30s");
    }
}
