//! Error types for the sync engine.

use ghostsync_diff::DiffError;
use ghostsync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A frame or change record could not be understood.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A diff failed to apply or transform.
    #[error("diff error: {0}")]
    Diff(#[from] DiffError),

    /// The ghost store rejected an operation.
    #[error("store error: {message}")]
    Store {
        /// Error message.
        message: String,
    },

    /// The server rejected the channel's credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Invalid state transition.
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// Not connected.
    #[error("not connected to server")]
    NotConnected,

    /// The channel or driver has shut down.
    #[error("channel closed")]
    Closed,
}

impl SyncError {
    /// Creates a store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::NotConnected)
    }
}
