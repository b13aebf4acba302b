use std::time::Duration;

use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;

/// Errors returned by a job queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job queue unavailable: {0}")]
    Unavailable(String),

    #[error("job queue call timed out after {0:?}")]
    Timeout(Duration),

    #[error("unknown job: {0}")]
    UnknownJob(String),

    #[error("job {job} rejected by {host}: {reason}")]
    Rejected {
        job: String,
        host: String,
        reason: String,
    },
}
