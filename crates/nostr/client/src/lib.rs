//! Vine sync engine
//!
//! Keeps the local Nostr relay and a set of remote relays in step for the
//! video feed:
//!
//! - [`RelayEndpoint`]: one control loop per remote relay, reconnecting
//!   with exponential backoff
//! - [`BroadcastCoordinator`]: publishes to the embedded relay and every
//!   remote at once, each bounded by a send timeout
//! - [`Outbox`] and [`RetryWorker`]: durable per-relay retry of events a
//!   relay did not take
//! - [`SubscriptionManager`]: coalesces feed subscriptions onto shared
//!   relay subscriptions
//! - [`NostrService`]: the facade wiring all of the above
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vine_client::{ClientConfig, FeedEvent, NostrService};
//! use vine_nostr::{Filter, SystemClock, KIND_VIDEO};
//! use vine_relay::EmbeddedRelay;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), vine_client::ClientError> {
//!     let config = ClientConfig::from_env();
//!     let service =
//!         NostrService::connect(config, EmbeddedRelay::in_memory(), Arc::new(SystemClock)).await?;
//!
//!     let mut feed = service
//!         .subscribe("videos", Filter::new().kinds([KIND_VIDEO]).limit(50))
//!         .await?;
//!     while let Some(item) = feed.recv().await {
//!         match item {
//!             FeedEvent::Event(event) => println!("video {}", event.identifier()),
//!             FeedEvent::EndOfStoredEvents => println!("caught up"),
//!             FeedEvent::Closed(reason) => {
//!                 println!("closed: {}", reason);
//!                 break;
//!             }
//!         }
//!     }
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```

mod broadcast;
mod config;
mod endpoint;
mod error;
mod outbox;
mod recovery;
mod retry;
mod service;
mod subscription;
mod transport;
mod websocket;

pub use broadcast::{BroadcastCoordinator, BroadcastReport, LOCAL_RELAY, RelayOutcome};
pub use config::{ClientConfig, RELAYS_ENV, SEND_TIMEOUT_ENV};
pub use endpoint::{EndpointConfig, EndpointState, RelayEndpoint};
pub use error::{ClientError, Result};
pub use outbox::{
    OUTBOX_DB_PATH_ENV, Outbox, OutboxConfig, OutboxEntry, OutboxState, PermanentFailure,
    persisted_depth,
};
pub use recovery::{BackoffPolicy, Jitter, ReconnectBackoff};
pub use retry::{RetryPass, RetryWorker};
pub use service::{NostrService, RelaySync, ServiceStatus, SyncReport};
pub use subscription::{
    DEFAULT_SUBSCRIPTION_BUFFER, FeedEvent, SubscriptionHandle, SubscriptionManager,
};
pub use transport::{
    LocalTransport, MockBehavior, MockTransport, PublishConfirmation, RelayTransport,
};
pub use websocket::WebSocketTransport;
