//! Error types for the store subsystem.

use thiserror::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Error variants for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Invalid or incomplete configuration. Fatal at startup, never retried.
    #[error("Configuration error: {reason}")]
    Configuration {
        /// Description of the problem.
        reason: String,
    },

    /// The entity type has no sharding strategy registered.
    #[error("Unknown entity type: {entity}")]
    UnknownEntity {
        /// The entity type that was looked up.
        entity: String,
    },

    /// A slave directory was read before its first successful copy.
    #[error("Directory {directory} is not yet initialized: no generation has been copied")]
    NotYetInitialized {
        /// Name of the directory.
        directory: String,
    },

    /// A write was attempted on a read-only directory.
    #[error("Directory {directory} is read-only")]
    ReadOnly {
        /// Name of the directory.
        directory: String,
    },

    /// The on-disk index could not be interpreted.
    #[error("Corrupt index in {directory}: {reason}")]
    CorruptIndex {
        /// Name or path of the directory.
        directory: String,
        /// Description of the corruption.
        reason: String,
    },

    /// One or more shards failed while others answered.
    #[error("Partial query failure: {} shard(s) failed: {}", failed.len(), failed.join(", "))]
    PartialQueryFailure {
        /// Names of the directories whose read failed.
        failed: Vec<String>,
    },

    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Shorthand for a configuration error.
    pub fn config(reason: impl Into<String>) -> Self {
        StoreError::Configuration {
            reason: reason.into(),
        }
    }
}
