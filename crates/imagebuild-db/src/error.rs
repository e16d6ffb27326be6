//! Database error types.

use imagebuild_core::QueueError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("stored payload is not valid JSON: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<DbError> for QueueError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Queue(err) => err,
            DbError::Payload(err) => QueueError::Serialization(err),
            other => QueueError::Backend(Box::new(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_errors_pass_through() {
        let err: QueueError = DbError::Queue(QueueError::NotPending).into();
        assert!(matches!(err, QueueError::NotPending));
    }

    #[test]
    fn test_database_errors_become_backend() {
        let err: QueueError = DbError::Database(sqlx::Error::RowNotFound).into();
        assert!(matches!(err, QueueError::Backend(_)));
    }
}
