//! Error taxonomy of the job queue.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job, token or worker does not exist")]
    NotExist,

    #[error("job is not pending")]
    NotPending,

    #[error("job is not running")]
    NotRunning,

    #[error("job was canceled")]
    Canceled,

    #[error("dequeue timed out or was canceled")]
    DequeueTimeout,

    #[error("worker still owns active jobs")]
    ActiveJobs,

    #[error("worker does not exist")]
    WorkerNotExist,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;
