//! Error types for Parley.

use thiserror::Error;

/// Common error type for Parley.
#[derive(Error, Debug)]
pub enum ParleyError {
    /// Database error.
    ///
    /// Wraps errors from the storage backend. Errors from sqlx are
    /// automatically converted.
    #[error("database error: {0}")]
    Database(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Validation error for inbound event payloads.
    #[error("validation error: {0}")]
    Validation(String),

    /// Resource not found.
    #[error("{0} not found")]
    NotFound(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

// Conversion from sqlx errors
impl From<sqlx::Error> for ParleyError {
    fn from(e: sqlx::Error) -> Self {
        ParleyError::Database(e.to_string())
    }
}

/// Result type alias for Parley operations.
pub type Result<T> = std::result::Result<T, ParleyError>;
