//! Endpoint error types.

use thiserror::Error;

/// Error type for endpoint operations.
#[derive(Debug, Clone, Error)]
pub enum EndpointError {
    /// The endpoint could not be reached.
    #[error("Failed to connect to {endpoint}: {message}")]
    Connection { endpoint: String, message: String },

    /// Authentication against the endpoint failed.
    #[error("Authentication to {endpoint} failed: {message}")]
    Authentication { endpoint: String, message: String },

    /// The requested item was not found.
    #[error("Item not found: {item}")]
    NotFound { item: String },

    /// The item already exists.
    #[error("Item already exists: {item}")]
    AlreadyExists { item: String },

    /// A remote operation ran and failed.
    #[error("{operation} failed: {message}")]
    OperationFailed { operation: String, message: String },

    /// A remote operation did not complete in time.
    #[error("Timed out waiting for {operation}")]
    Timeout { operation: String },

    /// No endpoint implementation is registered for the requested kind.
    #[error("Unsupported endpoint type: {kind}")]
    Unsupported { kind: String },

    /// Invalid parameter passed to the endpoint.
    #[error("Invalid parameter: {message}")]
    InvalidParameter { message: String },
}

impl EndpointError {
    pub fn connection(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        EndpointError::Connection {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    pub fn not_found(item: impl Into<String>) -> Self {
        EndpointError::NotFound { item: item.into() }
    }

    pub fn operation(operation: impl Into<String>, message: impl Into<String>) -> Self {
        EndpointError::OperationFailed {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>) -> Self {
        EndpointError::Timeout {
            operation: operation.into(),
        }
    }

    /// Returns true if the condition is transient and a later attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EndpointError::Connection { .. })
    }
}

/// Result type for endpoint operations.
pub type EndpointResult<T> = Result<T, EndpointError>;
