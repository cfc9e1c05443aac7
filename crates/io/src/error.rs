//! Error types for the Basalt I/O crate.

use thiserror::Error;

/// I/O operation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IoError {
    /// Unexpected end of stream
    #[error("Unexpected end of stream: expected {expected} more bytes while reading {context}")]
    EndOfStream { expected: usize, context: String },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Value exceeds the allowed maximum
    #[error("Value out of range: {context}, got {value}, max {max}")]
    OutOfRange {
        context: String,
        value: u64,
        max: u64,
    },

    /// Deserialization failed
    #[error("Deserialization failed: {0}")]
    Deserialization(String),
}

impl IoError {
    pub fn end_of_stream(expected: usize, context: &str) -> Self {
        Self::EndOfStream {
            expected,
            context: context.to_string(),
        }
    }

    pub fn out_of_range(context: &str, value: u64, max: u64) -> Self {
        Self::OutOfRange {
            context: context.to_string(),
            value,
            max,
        }
    }
}

impl From<std::array::TryFromSliceError> for IoError {
    fn from(err: std::array::TryFromSliceError) -> Self {
        Self::Deserialization(err.to_string())
    }
}

/// Result type for I/O operations
pub type IoResult<T> = std::result::Result<T, IoError>;
