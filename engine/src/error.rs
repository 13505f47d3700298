//! Error types for the Tandem engine.

use thiserror::Error;

/// All possible errors from the Tandem engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Entity errors
    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    #[error("no schema registered for entity: {0}")]
    SchemaNotFound(String),

    // Validation errors
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    // Cache errors
    #[error("invalid cache entry: {0}")]
    InvalidCacheEntry(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
