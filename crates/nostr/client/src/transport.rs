//! Relay transports
//!
//! A [`RelayTransport`] is the capability an endpoint's control loop drives:
//! connect, publish one event and wait for its `OK`, or run a one-shot query
//! until `EOSE`. [`crate::WebSocketTransport`] talks to remote relays,
//! [`LocalTransport`] to the embedded relay, and [`MockTransport`] is an
//! in-memory double whose behavior can be switched while it is in use.

use crate::error::{ClientError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use vine_nostr::{Event, Filter, RelayMessage, reason_prefix};
use vine_relay::{EmbeddedRelay, ok_reply};

/// Confirmation result for event publishing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishConfirmation {
    /// Event ID that was published
    pub event_id: String,
    /// Whether the relay accepted the event
    pub accepted: bool,
    /// Message from the relay (empty if accepted, error message if rejected)
    pub message: String,
}

impl PublishConfirmation {
    pub fn accepted(event_id: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            accepted: true,
            message: String::new(),
        }
    }

    pub fn rejected(event_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            accepted: false,
            message: message.into(),
        }
    }

    /// Machine-readable prefix of the relay's message.
    pub fn reason(&self) -> Option<&str> {
        reason_prefix(&self.message)
    }

    /// A rejection that may succeed later (`rate-limited:` or `error:`).
    pub fn is_retryable(&self) -> bool {
        !self.accepted && matches!(self.reason(), Some("rate-limited") | Some("error"))
    }
}

/// Connection to one relay.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    fn url(&self) -> &str;

    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    /// Send an event and wait for the relay's `OK`.
    async fn publish(&self, event: &Event) -> Result<PublishConfirmation>;

    /// Stored events matching any filter, up to `EOSE`.
    async fn query(&self, filters: &[Filter]) -> Result<Vec<Event>>;
}

/// Transport to the in-process [`EmbeddedRelay`].
pub struct LocalTransport {
    url: String,
    relay: EmbeddedRelay,
}

impl LocalTransport {
    pub fn new(url: impl Into<String>, relay: EmbeddedRelay) -> Self {
        Self {
            url: url.into(),
            relay,
        }
    }
}

#[async_trait]
impl RelayTransport for LocalTransport {
    fn url(&self) -> &str {
        &self.url
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn publish(&self, event: &Event) -> Result<PublishConfirmation> {
        let result = self.relay.publish(event.clone());
        match ok_reply(event.id.clone(), &result) {
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => Ok(PublishConfirmation {
                event_id,
                accepted,
                message,
            }),
            other => Err(ClientError::Connection(format!(
                "unexpected reply from embedded relay: {:?}",
                other
            ))),
        }
    }

    async fn query(&self, filters: &[Filter]) -> Result<Vec<Event>> {
        for filter in filters {
            filter.validate()?;
        }
        let snapshot = self.relay.store().snapshot(filters);
        Ok(dedup_by_id(snapshot.queries.into_iter().flatten().map(|e| Event::clone(&e))))
    }
}

pub(crate) fn dedup_by_id(events: impl IntoIterator<Item = Event>) -> Vec<Event> {
    let mut seen = HashSet::new();
    events
        .into_iter()
        .filter(|event| seen.insert(event.id.clone()))
        .collect()
}

/// How a [`MockTransport`] answers publishes and queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockBehavior {
    /// Accept every event
    Accept,
    /// Answer `OK false` with this message
    Reject(String),
    /// Fail with a connection error
    Fail(String),
    /// Never answer
    Hang,
    /// Accept after a delay
    Delay(Duration),
}

#[derive(Debug)]
struct MockState {
    behavior: MockBehavior,
    refuse_connections: bool,
    connected: bool,
    stored: Vec<Event>,
    connect_attempts: usize,
    publish_attempts: usize,
}

/// In-memory relay double. Clones share state.
#[derive(Clone)]
pub struct MockTransport {
    url: String,
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            state: Arc::new(Mutex::new(MockState {
                behavior: MockBehavior::Accept,
                refuse_connections: false,
                connected: false,
                stored: Vec::new(),
                connect_attempts: 0,
                publish_attempts: 0,
            })),
        }
    }

    pub fn with_behavior(self, behavior: MockBehavior) -> Self {
        self.set_behavior(behavior);
        self
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        self.state.lock().behavior = behavior;
    }

    /// Refuse (or allow again) new connections.
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse_connections = refuse;
    }

    /// Pre-load events returned by queries.
    pub fn seed(&self, events: impl IntoIterator<Item = Event>) {
        self.state.lock().stored.extend(events);
    }

    /// Events this relay accepted.
    pub fn published(&self) -> Vec<Event> {
        self.state.lock().stored.clone()
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.lock().connect_attempts
    }

    pub fn publish_attempts(&self) -> usize {
        self.state.lock().publish_attempts
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }
}

#[async_trait]
impl RelayTransport for MockTransport {
    fn url(&self) -> &str {
        &self.url
    }

    async fn connect(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;
        if state.refuse_connections {
            return Err(ClientError::Connection(format!(
                "{} refused connection",
                self.url
            )));
        }
        state.connected = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.state.lock().connected = false;
        Ok(())
    }

    async fn publish(&self, event: &Event) -> Result<PublishConfirmation> {
        let behavior = {
            let mut state = self.state.lock();
            state.publish_attempts += 1;
            if !state.connected {
                return Err(ClientError::NotConnected);
            }
            state.behavior.clone()
        };
        debug!("Mock {} publish {} -> {:?}", self.url, event.id, behavior);

        match behavior {
            MockBehavior::Accept => {}
            MockBehavior::Reject(message) => {
                return Ok(PublishConfirmation::rejected(event.id.clone(), message));
            }
            MockBehavior::Fail(reason) => return Err(ClientError::Connection(reason)),
            MockBehavior::Hang => std::future::pending::<()>().await,
            MockBehavior::Delay(delay) => tokio::time::sleep(delay).await,
        }

        let mut state = self.state.lock();
        if !state.stored.iter().any(|stored| stored.id == event.id) {
            state.stored.push(event.clone());
        }
        Ok(PublishConfirmation::accepted(event.id.clone()))
    }

    async fn query(&self, filters: &[Filter]) -> Result<Vec<Event>> {
        let behavior = {
            let state = self.state.lock();
            if !state.connected {
                return Err(ClientError::NotConnected);
            }
            state.behavior.clone()
        };

        match behavior {
            MockBehavior::Fail(reason) => return Err(ClientError::Connection(reason)),
            MockBehavior::Hang => std::future::pending::<()>().await,
            MockBehavior::Delay(delay) => tokio::time::sleep(delay).await,
            MockBehavior::Accept | MockBehavior::Reject(_) => {}
        }

        let state = self.state.lock();
        Ok(dedup_by_id(
            state
                .stored
                .iter()
                .filter(|event| filters.iter().any(|f| f.matches(event)))
                .cloned(),
        ))
    }
}
