//! Error taxonomy for the collaboration layer.
//!
//! Nothing here is process-fatal. The worst outcome of any error is a
//! single `error` frame on the originating connection.

use codesync_core::OtError;
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::ProtocolError;
use crate::storage::StorageError;

/// Collaboration token problems. Never fatal: an invalid token on `init`
/// degrades the connection to solo mode instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Invalid or expired collaboration token")]
    InvalidToken,

    #[error("Unable to join room: it is full or no longer accepting members")]
    JoinRejected,

    #[error("Repository not available: {0}")]
    RepositoryUnavailable(String),
}

/// Failures while applying edits to a file session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    #[error("File is not open: {0}")]
    NotOpen(String),

    #[error("Stale revision for {file_id}: server is at {expected}, operation was based on {got}")]
    StaleRevision {
        file_id: String,
        expected: u64,
        got: u64,
    },

    #[error("Operation rejected: {0}")]
    Rejected(#[from] OtError),
}

/// A frame could not be handed to a recipient.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connection {0} is gone")]
    RecipientGone(Uuid),

    #[error("Connection {0} is not registered")]
    UnknownConnection(Uuid),
}

/// Umbrella error for everything a connection can run into.
#[derive(Debug, Error)]
pub enum CollabError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Operation(#[from] OperationError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<OtError> for CollabError {
    fn from(e: OtError) -> Self {
        CollabError::Operation(OperationError::Rejected(e))
    }
}

impl CollabError {
    /// Text sent back to the client in an `error` frame.
    pub fn user_message(&self) -> String {
        match self {
            // Do not leak filesystem details to clients.
            CollabError::Storage(StorageError::Io(_)) => "Storage error".to_string(),
            other => other.to_string(),
        }
    }

    /// Short category name used in log lines.
    pub fn category(&self) -> &'static str {
        match self {
            CollabError::Protocol(_) => "protocol",
            CollabError::Auth(_) => "auth",
            CollabError::Operation(_) => "operation",
            CollabError::Storage(_) => "storage",
            CollabError::Transport(_) => "transport",
        }
    }
}
