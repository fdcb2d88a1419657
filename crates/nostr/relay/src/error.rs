//! Relay error types

use thiserror::Error;
use vine_nostr::{EventError, MessageError};

/// Errors from persistence, sessions and the WebSocket server.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("protocol error: {0}")]
    Message(#[from] MessageError),

    #[error("session closed")]
    SessionClosed,
}

/// Errors returned by [`crate::EventStore`] operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The event failed structural, id or signature checks.
    #[error("validation failed: {0}")]
    Validation(#[from] EventError),

    #[error("event not found: {0}")]
    NotFound(String),

    #[error("{requestor} is not the author of {event_id}")]
    Unauthorized { event_id: String, requestor: String },

    #[error("persistence failed: {0}")]
    Persistence(#[from] RelayError),
}

impl StoreError {
    pub fn is_validation(&self) -> bool {
        matches!(self, StoreError::Validation(_))
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
