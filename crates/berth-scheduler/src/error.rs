//! Scheduler error types.

use thiserror::Error;

/// Result type alias for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors raised while assembling or running the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] berth_store::StoreError),

    #[error("invalid service spec: {0}")]
    InvalidSpec(String),

    #[error("secrets client error: {0}")]
    Secrets(String),
}
