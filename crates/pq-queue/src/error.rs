use pq_common::JobState;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Lock lost for job {0}")]
    LockMismatch(String),

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Operation not supported for jobs in state {0:?}")]
    InvalidState(JobState),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid queue name: {0}")]
    InvalidName(String),
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for QueueError {
    fn from(e: redis::RedisError) -> Self {
        QueueError::Backend(e.to_string())
    }
}
