use thiserror::Error;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::TaskStatus;

/// Failures inside the delivery pipeline.
///
/// Transport failures are not part of this enum: the sender reports them as
/// `SendOutcome::RetryableFailure` / `SendOutcome::PermanentFailure` and the
/// state machine turns them into task status.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("task store unavailable: {0}")]
    StorageUnavailable(String),

    #[error("dispatch queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("task {0} not found")]
    NotFound(Uuid),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid task: {0}")]
    Validation(String),
}

impl From<sqlx::Error> for DeliveryError {
    fn from(err: sqlx::Error) -> Self {
        DeliveryError::StorageUnavailable(err.to_string())
    }
}

impl From<redis::RedisError> for DeliveryError {
    fn from(err: redis::RedisError) -> Self {
        DeliveryError::QueueUnavailable(err.to_string())
    }
}

impl From<DeliveryError> for AppError {
    fn from(err: DeliveryError) -> Self {
        match err {
            DeliveryError::NotFound(id) => AppError::NotFound(format!("Task {} not found", id)),
            DeliveryError::Conflict(msg) => AppError::Conflict(msg),
            DeliveryError::Validation(msg) => AppError::Validation(msg),
            // Driver detail stays in the logs.
            DeliveryError::StorageUnavailable(msg) => {
                tracing::warn!(error = %msg, "Task store unavailable");
                AppError::Unavailable("Task store unavailable".to_string())
            }
            DeliveryError::QueueUnavailable(msg) => {
                tracing::warn!(error = %msg, "Dispatch queue unavailable");
                AppError::Unavailable("Dispatch queue unavailable".to_string())
            }
            err @ DeliveryError::InvalidTransition { .. } => AppError::Internal(err.to_string()),
        }
    }
}
