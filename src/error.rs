//! Error types for the StackSet operator

use std::fmt;

/// Result type alias for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Errors that can occur during operator operations
#[derive(Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    KubeApi(String),
    /// Configuration error
    Configuration(String),
    /// Reconciliation error
    Reconciliation(String),
    /// Serialization error
    Serialization(String),
    /// Resource not found
    NotFound(String),
    /// The StackSet declaration is invalid (e.g. empty stack template)
    InvalidStackSet(String),
    /// Attempted to reduce traffic on the only stack receiving any
    SoleBackend(String),
}

impl fmt::Display for OperatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatorError::KubeApi(msg) => write!(f, "Kubernetes API error: {}", msg),
            OperatorError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            OperatorError::Reconciliation(msg) => write!(f, "Reconciliation error: {}", msg),
            OperatorError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            OperatorError::NotFound(msg) => write!(f, "Resource not found: {}", msg),
            OperatorError::InvalidStackSet(msg) => write!(f, "Invalid StackSet: {}", msg),
            OperatorError::SoleBackend(msg) => write!(f, "Traffic switch rejected: {}", msg),
        }
    }
}

impl std::error::Error for OperatorError {}

impl From<kube::Error> for OperatorError {
    fn from(err: kube::Error) -> Self {
        OperatorError::KubeApi(err.to_string())
    }
}

impl From<serde_json::Error> for OperatorError {
    fn from(err: serde_json::Error) -> Self {
        OperatorError::Serialization(err.to_string())
    }
}
