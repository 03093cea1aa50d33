//! Error types for the authorization engine

use thiserror::Error;

/// Authorization engine errors
#[derive(Debug, Error)]
pub enum AuthzError {
    /// Malformed or incomplete request (client error)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Referenced entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Entity with the same identity already exists
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Operation not valid for the entity's current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Publish attempted against a policy version that is not valid
    #[error("Cannot publish policy '{policy}': version {version} is {status}")]
    PublishPrecondition {
        policy: String,
        version: u32,
        status: String,
    },

    /// Internal evaluation failure
    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    /// Backing store failure
    #[error("Store error: {0}")]
    Store(String),

    /// Cache backend failure
    #[error("Cache error: {0}")]
    Cache(String),

    /// Audit pipeline is shut down
    #[error("Audit channel closed")]
    AuditClosed,

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for authorization operations
pub type Result<T> = std::result::Result<T, AuthzError>;

impl AuthzError {
    /// Whether this error was caused by the caller's input
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            AuthzError::InvalidRequest(_)
                | AuthzError::NotFound(_)
                | AuthzError::Conflict(_)
                | AuthzError::InvalidState(_)
                | AuthzError::PublishPrecondition { .. }
        )
    }
}
