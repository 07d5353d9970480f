//! Error types for the synchronization crate.

use crate::store::StoreError;
use thiserror::Error;

/// Result type alias for synchronization operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during synchronization.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Subscribing to a channel failed or timed out.
    #[error("Failed to subscribe to channel {channel}: {reason}")]
    SubscribeFailed { channel: String, reason: String },

    /// Binding a listener failed.
    #[error("Failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },

    /// The channel is closed or was never established.
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// The session is not connected to its resource channel.
    #[error("Session is not connected")]
    NotConnected,

    /// Operation type is not supported by the reducer.
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Path is empty or does not address the target container.
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Malformed request or operation payload.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Caller lacks access to the resource.
    #[error("Access denied for user {user_id} on {resource}")]
    AccessDenied { user_id: String, resource: String },

    /// Serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Underlying operation or presence store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}
