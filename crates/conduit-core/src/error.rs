use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Core error type for the Conduit engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Flow instance not found
    #[error("Flow instance not found: {0}")]
    FlowInstanceNotFound(String),

    /// Flow definition not found
    #[error("Flow definition not found: {0}")]
    FlowDefinitionNotFound(String),

    /// Invalid flow or step configuration, detected when a definition is built
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Invalid input data
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// A resource referenced by a step does not exist
    #[error("Not found: {0}")]
    NotFoundError(String),

    /// The caller lacks the privilege required for the operation
    #[error("Not authorized: {0}")]
    NotAuthorizedError(String),

    /// A transient failure of an external provider
    #[error("Transient external error: {0}")]
    TransientExternalError(String),

    /// An operation did not finish within its allotted time
    #[error("Timeout: {0}")]
    TimeoutError(String),

    /// State store error
    #[error("State store error: {0}")]
    StateStoreError(String),

    /// A required data bag key is missing
    #[error("Missing data bag key: {0}")]
    DataBagMissingKey(String),

    /// A versioned write lost a compare-and-swap race
    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Flow execution error
    #[error("Flow execution error: {0}")]
    FlowExecutionError(String),

    /// Flow trigger error
    #[error("Flow trigger error: {0}")]
    TriggerError(String),

    /// Work was cancelled through the flow cancellation token
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Serializable classification of a failure, carried by step results and
/// flow failure summaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Invalid flow or step configuration
    Configuration,
    /// Invalid or mistyped input data
    Validation,
    /// Missing resource
    NotFound,
    /// Insufficient privilege
    NotAuthorized,
    /// Retryable provider failure
    TransientExternal,
    /// Deadline exceeded
    Timeout,
    /// Persistence failure
    Database,
    /// Required data bag key absent
    DataBagMissingKey,
    /// Lost compare-and-swap race
    Conflict,
    /// Cancelled by the flow token
    Cancelled,
    /// Anything else
    Internal,
}

impl ErrorKind {
    /// Whether a failure of this kind may succeed if the step is run again.
    /// Retryable failures are never stored by the idempotency gate.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::TransientExternal
                | ErrorKind::Database
                | ErrorKind::Conflict
                | ErrorKind::Cancelled
        )
    }
}

impl CoreError {
    /// The kind recorded when this error terminates a step
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::ConfigurationError(_) => ErrorKind::Configuration,
            CoreError::ValidationError(_) | CoreError::SerializationError(_) => {
                ErrorKind::Validation
            }
            CoreError::NotFoundError(_)
            | CoreError::FlowInstanceNotFound(_)
            | CoreError::FlowDefinitionNotFound(_) => ErrorKind::NotFound,
            CoreError::NotAuthorizedError(_) => ErrorKind::NotAuthorized,
            CoreError::TransientExternalError(_) => ErrorKind::TransientExternal,
            CoreError::TimeoutError(_) => ErrorKind::Timeout,
            CoreError::StateStoreError(_) => ErrorKind::Database,
            CoreError::DataBagMissingKey(_) => ErrorKind::DataBagMissingKey,
            CoreError::ConcurrencyConflict(_) => ErrorKind::Conflict,
            CoreError::Cancelled(_) => ErrorKind::Cancelled,
            CoreError::FlowExecutionError(_) | CoreError::TriggerError(_) | CoreError::Other(_) => {
                ErrorKind::Internal
            }
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<String> for CoreError {
    fn from(err: String) -> Self {
        CoreError::Other(err)
    }
}

impl From<&str> for CoreError {
    fn from(err: &str) -> Self {
        CoreError::Other(err.to_string())
    }
}
