//! Error types for the diff crate.

use thiserror::Error;

/// Result type for diff operations.
pub type DiffResult<T> = Result<T, DiffError>;

/// Errors that can occur while applying or decoding diffs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiffError {
    /// A delta does not fit the value it is applied to.
    #[error("invalid diff: {message}")]
    InvalidDiff {
        /// Description of the mismatch.
        message: String,
    },

    /// A text delta string could not be parsed or does not span its source.
    #[error("invalid text delta: {message}")]
    InvalidTextDelta {
        /// Description of the parse or length error.
        message: String,
    },

    /// A wire-encoded delta has an unknown operation code or a missing value.
    #[error("invalid delta encoding: {message}")]
    InvalidEncoding {
        /// Description of the encoding error.
        message: String,
    },
}

impl DiffError {
    /// Create an invalid diff error.
    pub fn invalid_diff(message: impl Into<String>) -> Self {
        Self::InvalidDiff {
            message: message.into(),
        }
    }

    /// Create an invalid text delta error.
    pub fn invalid_text_delta(message: impl Into<String>) -> Self {
        Self::InvalidTextDelta {
            message: message.into(),
        }
    }

    /// Create an invalid encoding error.
    pub fn invalid_encoding(message: impl Into<String>) -> Self {
        Self::InvalidEncoding {
            message: message.into(),
        }
    }
}
