//! Error types for the Berth persistence layer.

use thiserror::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by the persister and the typed stores above it.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("invalid status transition for task {task}: {from} -> {to}")]
    InvalidTransition {
        task: String,
        from: String,
        to: String,
    },

    #[error("invalid goal override transition for task {0}")]
    InvalidOverrideTransition(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),
}
