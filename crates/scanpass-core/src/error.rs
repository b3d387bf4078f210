//! Error types for scanpass

use thiserror::Error;

/// Main error type for scanpass operations outside the handshake itself
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidField { field: String, message: String },
}

/// Result type alias using scanpass's Error
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an invalid field error
    pub fn invalid_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::InvalidField {
            field: field.into(),
            message: message.into(),
        }
    }
}
