use pq_queue::QueueError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Handler failed for job {job_id}: {source}")]
    Handler {
        job_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Invalid job: {0}")]
    InvalidJob(String),
}

/// Marks a handler failure that must not be retried.
///
/// ```rust,ignore
/// return Err(UnrecoverableError::new("prompt rejected").into());
/// ```
#[derive(Error, Debug, Clone)]
#[error("{0}")]
pub struct UnrecoverableError(pub String);

impl UnrecoverableError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}
