//! Storage errors.

use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The writer queue is full; the batch was dropped.
    #[error("storage writer queue is full")]
    Backpressure,

    /// The writer task has shut down.
    #[error("storage writer is closed")]
    WriterClosed,

    /// A stored device config or capability blob did not round-trip.
    #[error("stored json is invalid: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl<T> From<TrySendError<T>> for StorageError {
    fn from(e: TrySendError<T>) -> Self {
        match e {
            TrySendError::Full(_) => Self::Backpressure,
            TrySendError::Closed(_) => Self::WriterClosed,
        }
    }
}
