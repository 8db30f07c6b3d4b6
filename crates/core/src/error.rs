//! Error types for the queuectl job queue library.

use thiserror::Error;

/// The main error type for the queuectl library.
#[derive(Error, Debug)]
pub enum QueueError {
    /// Underlying SQLite engine failure. Fatal to a worker.
    #[error("storage error: {0}")]
    Storage(String),

    /// A settle was rejected because the claim has been stolen by lease
    /// expiry. The reclaiming worker owns the outcome.
    #[error("lease on job {0} is no longer held by this worker")]
    LeaseStolen(i64),

    /// DLQ retry targeted a job that is not in the dead-letter queue.
    #[error("job {0} not found in the dead-letter queue")]
    NotInDlq(i64),

    /// Malformed admin input (empty command, unknown state name, ...).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias using QueueError.
pub type Result<T> = std::result::Result<T, QueueError>;
