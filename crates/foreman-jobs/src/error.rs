//! Job engine error types.

use foreman_core::ForemanError;
use thiserror::Error;

/// Result type for job engine operations.
pub type JobResult<T> = Result<T, JobError>;

/// Job engine errors.
#[derive(Debug, Error)]
pub enum JobError {
    /// The persistence write failed; nothing was admitted.
    #[error("Failed to enqueue job {unique_id} for {function}: {reason}")]
    Enqueue {
        function: String,
        unique_id: String,
        reason: String,
    },

    /// The function's queue is at capacity.
    #[error("Queue for {function} is full ({capacity} jobs)")]
    QueueFull { function: String, capacity: usize },

    /// Backend read or delete failure.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The job was not in the state the operation requires.
    #[error("Job {handle} is {actual}, expected {expected}")]
    IllegalStateTransition {
        handle: String,
        expected: String,
        actual: String,
    },

    /// No live job carries this handle.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Redis pool error.
    #[error("Redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobError {
    /// Returns true if the error rejects a submission and must reach the
    /// submitting client.
    pub fn is_admission_error(&self) -> bool {
        matches!(self, JobError::Enqueue { .. } | JobError::QueueFull { .. })
    }

    /// Returns true if the caller can log the error and carry on.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            JobError::Persistence(_)
                | JobError::IllegalStateTransition { .. }
                | JobError::JobNotFound(_)
                | JobError::Redis(_)
                | JobError::Pool(_)
        )
    }

    /// Wire error code used in `ERROR` packets.
    pub fn code(&self) -> &'static str {
        match self {
            JobError::Enqueue { .. } => "ERR_ENQUEUE",
            JobError::QueueFull { .. } => "ERR_QUEUE_FULL",
            JobError::IllegalStateTransition { .. } => "ERR_ILLEGAL_STATE",
            JobError::JobNotFound(_) => "ERR_JOB_NOT_FOUND",
            _ => "ERR_INTERNAL",
        }
    }
}

impl From<JobError> for ForemanError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::Persistence(_) | JobError::Redis(_) | JobError::Pool(_) => {
                ForemanError::Persistence(err.to_string())
            }
            JobError::Configuration(msg) => ForemanError::Configuration(msg),
            other => ForemanError::Engine(other.to_string()),
        }
    }
}
