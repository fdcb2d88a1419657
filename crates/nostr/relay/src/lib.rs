//! Embedded Nostr relay for the Vine sync engine
//!
//! This crate provides:
//! - An in-memory event store with kind-aware replacement and ordered,
//!   restartable queries
//! - Optional SQLite write-through with connection pooling
//! - Per-connection sessions: backfill, EOSE, then live delivery
//! - A loopback WebSocket server so external clients can dial the relay
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │     WebSocket Server (tokio-tungstenite)    │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │   EmbeddedRelay / RelaySession (one task    │
//! │   per connection, subscriptions, metrics)   │
//! └────────────────┬────────────────────────────┘
//!                  │ put / snapshot / accepted feed
//! ┌────────────────▼────────────────────────────┐
//! │   EventStore (indexes behind one RwLock)    │
//! └────────────────┬────────────────────────────┘
//!                  │ write-through
//!   ┌──────────────┼──────────────┐
//!   ▼              ▼              ▼
//! ┌────────┐  ┌────────┐  ┌────────┐
//! │ Writer │  │ Reader │  │ Meta   │
//! │  Pool  │  │  Pool  │  │  Pool  │
//! └────────┘  └────────┘  └────────┘
//! ```

mod db;
mod error;
mod metrics;
mod server;
mod session;
mod store;
mod subscription;


pub use db::{ConnectionPool, DB_PATH_ENV, Database, DatabaseConfig};
pub use error::{RelayError, Result, StoreError};
pub use metrics::{MetricsSnapshot, RelayMetrics};
pub use server::{DEFAULT_PORT, PORT_ENV, RelayServer, RelayServerConfig};
pub use session::{
    EmbeddedRelay, RelaySession, RelayStatus, SessionConfig, SessionSender, ok_reply,
};
pub use store::{
    AcceptedEvent, DEFAULT_ANNOUNCE_CAPACITY, EventStore, Query, Snapshot, StoreConfig,
    StoreOutcome,
};
pub use subscription::{
    MAX_SUBSCRIPTION_ID_LENGTH, RequestError, Subscription, SubscriptionSet, SubscriptionState,
    validate_subscription_id,
};
