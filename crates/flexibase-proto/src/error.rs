//! Encoding error types.

use thiserror::Error;

/// Errors raised while encoding or decoding shared types.
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization failed.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Invalid value for the expected data type.
    #[error("invalid value: {0}")]
    InvalidValue(String),
}
