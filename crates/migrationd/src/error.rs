//! Engine error types.

use migration_endpoint::EndpointError;
use migration_orch_common::TaskError;
use migration_types::{BatchStatus, MigrationStatus};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the persistent store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to encode or decode stored record: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("Invalid migration status transition for {uuid}: {from} -> {to}")]
    InvalidTransition {
        uuid: Uuid,
        from: MigrationStatus,
        to: MigrationStatus,
    },

    #[error("Invalid batch status transition for {name}: {from} -> {to}")]
    InvalidBatchTransition {
        name: String,
        from: BatchStatus,
        to: BatchStatus,
    },

    #[error("Schema migration {version} failed: {message}")]
    Schema { version: usize, message: String },
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn already_exists(kind: &'static str, id: impl ToString) -> Self {
        StoreError::AlreadyExists {
            kind,
            id: id.to_string(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for TaskError {
    fn from(e: StoreError) -> Self {
        TaskError::internal(e.to_string())
    }
}

/// Umbrella error for engine operations.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("Invalid expression: {0}")]
    Expression(#[from] crate::expr::ExprError),

    #[error("Invalid placement scriptlet: {0}")]
    Scriptlet(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Batch {name} is {status}: {message}")]
    InvalidState {
        name: String,
        status: BatchStatus,
        message: String,
    },

    #[error("Invalid secret token for instance {0}")]
    Authentication(Uuid),

    #[error("Artifact error: {0}")]
    Artifact(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type MigrationResult<T> = Result<T, MigrationError>;

/// Classifies endpoint failures into the task taxonomy.
///
/// Unreachable endpoints are retryable; everything else the endpoint
/// reports is an execution failure.
pub fn endpoint_task_error(e: EndpointError) -> TaskError {
    if e.is_retryable() {
        TaskError::connectivity(e.to_string())
    } else {
        TaskError::execution(e.to_string())
    }
}

/// Extension for endpoint results used inside orchestration tasks.
pub trait EndpointResultExt<T> {
    /// Converts the error into a [`TaskError`], prefixed with `context`.
    fn task_context(self, context: &str) -> Result<T, TaskError>;
}

impl<T> EndpointResultExt<T> for Result<T, EndpointError> {
    fn task_context(self, context: &str) -> Result<T, TaskError> {
        self.map_err(|e| endpoint_task_error(e).context(context))
    }
}

impl MigrationError {
    /// Classifies the error for a periodic task.
    pub fn into_task_error(self) -> TaskError {
        match self {
            MigrationError::Task(e) => e,
            MigrationError::Endpoint(e) => endpoint_task_error(e),
            MigrationError::Http(e) => TaskError::connectivity(e.to_string()),
            MigrationError::Validation(message) | MigrationError::Scriptlet(message) => {
                TaskError::validation(message)
            }
            MigrationError::Expression(e) => TaskError::validation(e.to_string()),
            other => TaskError::internal(other.to_string()),
        }
    }
}
