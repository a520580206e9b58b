//! Errors surfaced to queue callers.

use thiserror::Error;

use taskforge_core::{DomainError, TaskId};

use crate::store::TaskStoreError;

/// Error returned by the enqueue and maintenance API.
///
/// Processor failures never show up here: the runner records them on the task
/// and reschedules it.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    /// Malformed input, rejected before any store call.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("task already exists: {0}")]
    DuplicateId(TaskId),

    #[error("task store unavailable: {0}")]
    StoreUnavailable(String),
}

pub type QueueResult<T> = Result<T, QueueError>;

impl From<DomainError> for QueueError {
    fn from(err: DomainError) -> Self {
        QueueError::InvalidArgument(err.to_string())
    }
}

impl From<TaskStoreError> for QueueError {
    fn from(err: TaskStoreError) -> Self {
        match err {
            TaskStoreError::DuplicateId(id) => QueueError::DuplicateId(id),
            TaskStoreError::Invalid(msg) => QueueError::InvalidArgument(msg),
            TaskStoreError::Unavailable(msg) => QueueError::StoreUnavailable(msg),
            TaskStoreError::Corrupt(msg) => QueueError::StoreUnavailable(msg),
        }
    }
}
