//! Error types for the Basalt core crate.

use thiserror::Error;

/// Core module errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Invalid format error with detailed description
    #[error("Invalid format: {message}")]
    InvalidFormat { message: String },

    /// Invalid data error with context
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Cryptographic operation failed
    #[error("Cryptography error: {message}")]
    Cryptography { message: String },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Io(#[from] basalt_io::IoError),
}

impl CoreError {
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    pub fn cryptography(message: impl Into<String>) -> Self {
        Self::Cryptography {
            message: message.into(),
        }
    }
}

/// Result type for core operations
pub type CoreResult<T> = std::result::Result<T, CoreError>;
