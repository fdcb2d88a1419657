//! Client error types

use thiserror::Error;
use vine_nostr::{EventError, FilterError, MessageError};
use vine_relay::{RelayError, StoreError};

/// Client error type
#[derive(Error, Debug)]
pub enum ClientError {
    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// URL parse error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Wire message error
    #[error("Protocol error: {0}")]
    Protocol(#[from] MessageError),

    /// Timeout error
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Not connected
    #[error("Not connected to relay")]
    NotConnected,

    /// The event failed local validation and was never sent
    #[error("Invalid event: {0}")]
    InvalidEvent(#[from] EventError),

    /// The filter was malformed
    #[error("Invalid filter: {0}")]
    InvalidFilter(#[from] FilterError),

    /// Relay closed a query or subscription
    #[error("Subscription closed by relay: {0}")]
    SubscriptionClosed(String),

    /// Local event store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Embedded relay error
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    /// Outbox persistence error
    #[error("Outbox error: {0}")]
    Outbox(#[from] rusqlite::Error),

    /// The component has shut down
    #[error("Shut down")]
    Shutdown,
}

impl ClientError {
    /// Whether the failure says the connection itself is gone.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            ClientError::WebSocket(_) | ClientError::Connection(_) | ClientError::NotConnected
        )
    }

    /// Whether a publish that failed this way is worth retrying later.
    pub fn is_retryable(&self) -> bool {
        self.is_connection_loss() || matches!(self, ClientError::Timeout(_))
    }
}

/// Client result type
pub type Result<T> = std::result::Result<T, ClientError>;
