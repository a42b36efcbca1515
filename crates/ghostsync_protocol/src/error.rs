//! Error types for the protocol crate.

use ghostsync_diff::DiffError;
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while parsing or building wire messages.
///
/// A protocol error rejects the single frame or record it was raised for.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A frame is not `<command>:<payload>` or its payload has the wrong shape.
    #[error("malformed frame: {message}")]
    MalformedFrame {
        /// Description of the problem.
        message: String,
    },

    /// A frame names a command this client does not know.
    #[error("unknown command: {command}")]
    UnknownCommand {
        /// The command as received.
        command: String,
    },

    /// A change record is missing a required field or has a field of the
    /// wrong type.
    #[error("malformed change record: {message}")]
    MalformedRecord {
        /// Description of the problem.
        message: String,
    },

    /// JSON payload failed to parse.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An embedded diff failed to decode or apply.
    #[error("diff error: {0}")]
    Diff(#[from] DiffError),
}

impl ProtocolError {
    /// Create a malformed frame error.
    pub fn malformed_frame(message: impl Into<String>) -> Self {
        Self::MalformedFrame {
            message: message.into(),
        }
    }

    /// Create a malformed record error.
    pub fn malformed_record(message: impl Into<String>) -> Self {
        Self::MalformedRecord {
            message: message.into(),
        }
    }

    /// Create an unknown command error.
    pub fn unknown_command(command: impl Into<String>) -> Self {
        Self::UnknownCommand {
            command: command.into(),
        }
    }
}
