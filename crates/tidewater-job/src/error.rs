//! Job layer errors.

use tidewater_core::error::{ConfigError, IngestError, SourceError};

/// Errors raised by a [`ProgressStore`](crate::store::ProgressStore).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// File system error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted document could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by job management operations.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// No job with this id is known.
    #[error("job '{0}' not found")]
    JobNotFound(String),

    /// A job with this id is already running.
    #[error("job '{0}' is already running")]
    AlreadyRunning(String),

    /// The latest consistency check of a job has not finished yet.
    #[error("consistency check '{check_job_id}' of job '{job_id}' has not finished")]
    CheckInProgress {
        /// Migration job id.
        job_id: String,
        /// Unfinished check job id.
        check_job_id: String,
    },

    /// The migration job has no consistency check.
    #[error("job '{0}' has no consistency check")]
    CheckNotFound(String),

    /// A job item or check task panicked.
    #[error("{task} panicked: {message}")]
    TaskPanicked {
        /// Which task, e.g. `job item 0 of j1`.
        task: String,
        /// Panic detail.
        message: String,
    },

    /// A job or table definition is invalid.
    #[error("invalid job definition: {0}")]
    InvalidDefinition(String),

    /// Persistence failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Dumper or position failure.
    #[error(transparent)]
    Ingest(#[from] IngestError),

    /// Configuration failure.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Source failure outside a dumper.
    #[error(transparent)]
    Source(#[from] SourceError),
}
