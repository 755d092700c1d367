//! Task failure taxonomy and its consequences.

use thiserror::Error;

/// What a task outcome means for the entity it acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Task completed successfully
    Success,
    /// Entity cannot proceed until an operator changes something
    Blocked,
    /// Entity stays in a retryable state; the next tick tries again
    NeedRetry,
    /// Entity goes to ERROR
    Failed,
    /// The whole batch goes to ERROR
    BatchFailed,
    /// Shutdown interrupted the task; nothing is recorded
    Cancelled,
}

impl TaskStatus {
    /// Returns true if the task completed successfully.
    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Success)
    }

    /// Returns true if the task should be retried on a later tick.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskStatus::NeedRetry | TaskStatus::Cancelled)
    }

    /// Returns true if the task failed permanently.
    pub fn is_failure(&self) -> bool {
        matches!(self, TaskStatus::Failed | TaskStatus::BatchFailed)
    }
}

/// Error type for orchestration task failures.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// Input does not satisfy placement or restriction rules
    #[error("{message}")]
    Validation { message: String },

    /// An external system could not be reached
    #[error("{message}")]
    Connectivity { message: String },

    /// An external operation ran and failed
    #[error("{message}")]
    Execution { message: String },

    /// A supervised party stopped reporting
    #[error("{message}")]
    Liveness { message: String },

    /// Something shared by the whole batch is wrong
    #[error("{message}")]
    BatchStructural { message: String },

    /// Shutdown was requested
    #[error("Cancelled")]
    Cancelled,

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl TaskError {
    pub fn validation(message: impl Into<String>) -> Self {
        TaskError::Validation {
            message: message.into(),
        }
    }

    pub fn connectivity(message: impl Into<String>) -> Self {
        TaskError::Connectivity {
            message: message.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        TaskError::Execution {
            message: message.into(),
        }
    }

    pub fn liveness(message: impl Into<String>) -> Self {
        TaskError::Liveness {
            message: message.into(),
        }
    }

    pub fn batch_structural(message: impl Into<String>) -> Self {
        TaskError::BatchStructural {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        TaskError::Internal {
            message: message.into(),
        }
    }

    /// Prefixes the message with context, keeping the classification.
    pub fn context(self, context: impl std::fmt::Display) -> Self {
        match self {
            TaskError::Validation { message } => TaskError::validation(format!("{context}: {message}")),
            TaskError::Connectivity { message } => {
                TaskError::connectivity(format!("{context}: {message}"))
            }
            TaskError::Execution { message } => TaskError::execution(format!("{context}: {message}")),
            TaskError::Liveness { message } => TaskError::liveness(format!("{context}: {message}")),
            TaskError::BatchStructural { message } => {
                TaskError::batch_structural(format!("{context}: {message}"))
            }
            TaskError::Cancelled => TaskError::Cancelled,
            TaskError::Internal { message } => TaskError::internal(format!("{context}: {message}")),
        }
    }

    /// Converts this error to a TaskStatus.
    pub fn to_status(&self) -> TaskStatus {
        match self {
            TaskError::Validation { .. } => TaskStatus::Blocked,
            TaskError::Connectivity { .. } => TaskStatus::NeedRetry,
            TaskError::Execution { .. } => TaskStatus::Failed,
            TaskError::Liveness { .. } => TaskStatus::Failed,
            TaskError::BatchStructural { .. } => TaskStatus::BatchFailed,
            TaskError::Cancelled => TaskStatus::Cancelled,
            TaskError::Internal { .. } => TaskStatus::Failed,
        }
    }
}

/// Result type for task processing.
pub type TaskResult<T> = Result<T, TaskError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_classification() {
        assert!(TaskStatus::Success.is_success());
        assert!(!TaskStatus::Failed.is_success());

        assert!(TaskStatus::NeedRetry.is_retryable());
        assert!(TaskStatus::Cancelled.is_retryable());
        assert!(!TaskStatus::Blocked.is_retryable());

        assert!(TaskStatus::Failed.is_failure());
        assert!(TaskStatus::BatchFailed.is_failure());
        assert!(!TaskStatus::NeedRetry.is_failure());
    }

    #[test]
    fn test_task_error_to_status() {
        assert_eq!(TaskError::validation("x").to_status(), TaskStatus::Blocked);
        assert_eq!(TaskError::connectivity("x").to_status(), TaskStatus::NeedRetry);
        assert_eq!(TaskError::execution("x").to_status(), TaskStatus::Failed);
        assert_eq!(TaskError::liveness("x").to_status(), TaskStatus::Failed);
        assert_eq!(
            TaskError::batch_structural("x").to_status(),
            TaskStatus::BatchFailed
        );
    }

    #[test]
    fn test_context_keeps_classification() {
        let err = TaskError::connectivity("connection refused").context("Failed to connect to target");
        assert_eq!(err.to_status(), TaskStatus::NeedRetry);
        assert_eq!(err.to_string(), "Failed to connect to target: connection refused");
    }
}
