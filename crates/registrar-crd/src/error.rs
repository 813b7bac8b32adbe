//! Error types for CRD operations

use thiserror::Error;

/// Errors that can occur when working with CRDs
#[derive(Debug, Error)]
pub enum CrdError {
    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Invalid field value
    #[error("Invalid value for field '{field}': {message}")]
    InvalidFieldValue { field: String, message: String },

    /// Object name does not match the name derived from its spec
    #[error("metadata.name '{actual}' must equal '{expected}' (pluralName.group)")]
    NameMismatch { expected: String, actual: String },

    /// Field owned by the server was set by a client
    #[error("Field '{0}' is managed by the server and may not be set")]
    ServerManagedField(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Result type for CRD operations
pub type Result<T> = std::result::Result<T, CrdError>;
