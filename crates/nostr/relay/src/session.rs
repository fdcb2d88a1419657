//! Relay session manager
//!
//! [`EmbeddedRelay`] owns the event store and hands out one [`RelaySession`]
//! per connection. Each session runs a single task that serializes the
//! connection's commands with live delivery:
//!
//! ```text
//!  client ──ClientMessage──▶ session task ──RelayMessage──▶ client
//!                               ▲
//!  EventStore::put ──AcceptedEvent (seq)──┘
//! ```
//!
//! A REQ snapshots the store together with the current sequence number,
//! sends the backfill and EOSE, then goes live. Live events at or below the
//! snapshot's sequence number were already covered by the backfill, so every
//! matching event is delivered exactly once.

use crate::error::{RelayError, StoreError};
use crate::metrics::RelayMetrics;
use crate::store::{AcceptedEvent, EventStore, StoreConfig, StoreOutcome};
use crate::subscription::{Subscription, SubscriptionSet};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vine_nostr::{ClientMessage, Event, KIND_DELETION, RelayMessage};

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Open subscriptions allowed per connection
    pub max_subscriptions: usize,
    /// Buffered messages per direction per connection
    pub channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_subscriptions: 20,
            channel_capacity: 1024,
        }
    }
}

/// Point-in-time view of the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayStatus {
    pub connections: usize,
    pub subscriptions: usize,
    pub stored_events: usize,
}

/// The embedded relay: store plus session bookkeeping.
#[derive(Clone)]
pub struct EmbeddedRelay {
    store: Arc<EventStore>,
    metrics: Arc<RelayMetrics>,
    config: SessionConfig,
    next_session_id: Arc<AtomicU64>,
}

impl EmbeddedRelay {
    pub fn new(store: EventStore, config: SessionConfig) -> Self {
        Self {
            store: Arc::new(store),
            metrics: Arc::new(RelayMetrics::new()),
            config,
            next_session_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Open the store described by `store_config` and wrap it.
    pub fn open(store_config: StoreConfig, config: SessionConfig) -> Result<Self, StoreError> {
        Ok(Self::new(EventStore::open(store_config)?, config))
    }

    pub fn in_memory() -> Self {
        Self::new(EventStore::in_memory(), SessionConfig::default())
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    pub fn metrics(&self) -> Arc<RelayMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn status(&self) -> RelayStatus {
        let snapshot = self.metrics.snapshot();
        RelayStatus {
            connections: snapshot.active_connections,
            subscriptions: snapshot.active_subscriptions,
            stored_events: self.store.len(),
        }
    }

    /// Ingest an event: store it and apply deletion requests it carries.
    pub fn publish(&self, event: Event) -> Result<StoreOutcome, StoreError> {
        self.metrics.event_received();

        let deletion = (event.kind == KIND_DELETION).then(|| {
            let targets: Vec<String> = event.tag_values("e").map(str::to_string).collect();
            (event.pubkey.clone(), targets)
        });
        let event_id = event.id.clone();

        let outcome = self.store.put(event).inspect_err(|e| {
            self.metrics.event_rejected();
            debug!("Rejected event {}: {}", event_id, e);
        })?;

        match &outcome {
            StoreOutcome::Stored | StoreOutcome::Replaced { .. } => self.metrics.event_stored(),
            StoreOutcome::Duplicate | StoreOutcome::StaleReplacement { .. } => {
                self.metrics.event_duplicate()
            }
            StoreOutcome::Deleted => self.metrics.event_rejected(),
            StoreOutcome::Ephemeral => {}
        }

        if outcome.is_new()
            && let Some((author, targets)) = deletion
        {
            self.apply_deletion(&author, &targets);
        }

        Ok(outcome)
    }

    fn apply_deletion(&self, author: &str, targets: &[String]) {
        for target in targets {
            match self.store.delete(target, author) {
                Ok(()) => {
                    self.metrics.event_deleted();
                    debug!("Deletion request by {} removed {}", author, target);
                }
                Err(StoreError::NotFound(_)) => {}
                Err(e) => warn!("Ignoring deletion of {}: {}", target, e),
            }
        }
    }

    /// Open a connection. Must be called inside a tokio runtime.
    pub fn connect(&self) -> RelaySession {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let capacity = self.config.channel_capacity.max(1);
        let (commands_tx, commands_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let accepted = self.store.subscribe_accepted();

        self.metrics.connection_opened();
        debug!("Session {} opened", id);

        let task = SessionTask {
            id,
            relay: self.clone(),
            subscriptions: SubscriptionSet::new(self.config.max_subscriptions),
            outbound: outbound_tx,
        };
        let handle = tokio::spawn(task.run(commands_rx, accepted));

        RelaySession {
            sender: SessionSender {
                id,
                commands: commands_tx,
            },
            outbound: outbound_rx,
            task: handle,
        }
    }
}

enum SessionCommand {
    Message(ClientMessage),
    CloseSubscription {
        subscription_id: String,
        ack: oneshot::Sender<bool>,
    },
    Shutdown,
}

/// Cloneable handle for feeding a session.
#[derive(Clone)]
pub struct SessionSender {
    id: u64,
    commands: mpsc::Sender<SessionCommand>,
}

impl SessionSender {
    pub fn session_id(&self) -> u64 {
        self.id
    }

    pub async fn send(&self, message: ClientMessage) -> Result<(), RelayError> {
        self.commands
            .send(SessionCommand::Message(message))
            .await
            .map_err(|_| RelayError::SessionClosed)
    }

    /// Close a subscription, returning once the session has dropped it.
    ///
    /// Returns whether the subscription existed.
    pub async fn close_subscription(&self, subscription_id: &str) -> Result<bool, RelayError> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(SessionCommand::CloseSubscription {
                subscription_id: subscription_id.to_string(),
                ack,
            })
            .await
            .map_err(|_| RelayError::SessionClosed)?;
        done.await.map_err(|_| RelayError::SessionClosed)
    }
}

/// One connection to the embedded relay.
pub struct RelaySession {
    sender: SessionSender,
    outbound: mpsc::Receiver<RelayMessage>,
    task: JoinHandle<()>,
}

impl RelaySession {
    pub fn id(&self) -> u64 {
        self.sender.id
    }

    pub fn sender(&self) -> SessionSender {
        self.sender.clone()
    }

    pub async fn send(&self, message: ClientMessage) -> Result<(), RelayError> {
        self.sender.send(message).await
    }

    pub async fn close_subscription(&self, subscription_id: &str) -> Result<bool, RelayError> {
        self.sender.close_subscription(subscription_id).await
    }

    /// Next message for the client; `None` once the session has ended.
    pub async fn recv(&mut self) -> Option<RelayMessage> {
        self.outbound.recv().await
    }

    /// Stop the session and wait for its task to finish.
    pub async fn shutdown(self) {
        let RelaySession {
            sender,
            outbound,
            task,
        } = self;
        drop(outbound);
        let _ = sender.commands.send(SessionCommand::Shutdown).await;
        if let Err(e) = task.await {
            warn!("Session {} task failed: {}", sender.id, e);
        }
    }
}

struct SessionTask {
    id: u64,
    relay: EmbeddedRelay,
    subscriptions: SubscriptionSet,
    outbound: mpsc::Sender<RelayMessage>,
}

impl SessionTask {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut accepted: broadcast::Receiver<AcceptedEvent>,
    ) {
        loop {
            let keep_going = tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Message(message)) => {
                        let responses = self.handle_message(message);
                        self.send_all(responses).await
                    }
                    Some(SessionCommand::CloseSubscription { subscription_id, ack }) => {
                        let existed = self.close(&subscription_id);
                        let _ = ack.send(existed);
                        true
                    }
                    Some(SessionCommand::Shutdown) | None => false,
                },
                accepted_event = accepted.recv() => match accepted_event {
                    Ok(accepted_event) => self.deliver_live(accepted_event).await,
                    Err(RecvError::Lagged(missed)) => self.drop_lagging(missed).await,
                    Err(RecvError::Closed) => false,
                },
            };

            if !keep_going {
                break;
            }
        }

        let remaining = self.subscriptions.drain().len();
        self.relay.metrics.subscriptions_closed(remaining);
        self.relay.metrics.connection_closed();
        debug!("Session {} closed", self.id);
    }

    /// Handle one client message, returning the replies in order.
    fn handle_message(&mut self, message: ClientMessage) -> Vec<RelayMessage> {
        match message {
            ClientMessage::Event(event) => {
                let event_id = event.id.clone();
                let result = self.relay.publish(event);
                vec![ok_reply(event_id, &result)]
            }
            ClientMessage::Req {
                subscription_id,
                filters,
            } => self.open_subscription(subscription_id, filters),
            ClientMessage::Close { subscription_id } => {
                self.close(&subscription_id);
                Vec::new()
            }
        }
    }

    fn open_subscription(
        &mut self,
        subscription_id: String,
        filters: Vec<vine_nostr::Filter>,
    ) -> Vec<RelayMessage> {
        if let Err(e) = self.subscriptions.admit(&subscription_id, &filters) {
            self.relay.metrics.subscription_refused();
            debug!(
                "Session {} refused subscription {}: {:?}",
                self.id, subscription_id, e
            );
            return vec![RelayMessage::Closed {
                subscription_id,
                message: e.to_closed_message(),
            }];
        }

        let mut subscription = Subscription::new(subscription_id.clone(), filters);
        let snapshot = self.relay.store.snapshot(&subscription.filters);

        let mut seen = HashSet::new();
        let mut responses = Vec::new();
        for query in snapshot.queries {
            for event in query {
                if seen.insert(event.id.clone()) {
                    responses.push(RelayMessage::Event {
                        subscription_id: subscription_id.clone(),
                        event: Event::clone(&event),
                    });
                }
            }
        }
        debug!(
            "Session {} subscription {} backfilled {} events",
            self.id,
            subscription_id,
            responses.len()
        );
        responses.push(RelayMessage::Eose {
            subscription_id: subscription_id.clone(),
        });

        subscription.go_live(snapshot.watermark);
        if self.subscriptions.insert(subscription) {
            self.relay.metrics.subscription_replaced();
        } else {
            self.relay.metrics.subscription_opened();
        }

        responses
    }

    fn close(&mut self, subscription_id: &str) -> bool {
        let existed = self.subscriptions.remove(subscription_id).is_some();
        if existed {
            self.relay.metrics.subscriptions_closed(1);
            debug!("Session {} closed subscription {}", self.id, subscription_id);
        }
        existed
    }

    async fn deliver_live(&mut self, accepted: AcceptedEvent) -> bool {
        let matching = self.subscriptions.live_matches(accepted.seq, &accepted.event);
        for subscription_id in matching {
            let message = RelayMessage::Event {
                subscription_id,
                event: Event::clone(&accepted.event),
            };
            if self.outbound.send(message).await.is_err() {
                return false;
            }
            self.relay.metrics.live_event_delivered();
        }
        true
    }

    /// The connection fell behind the accepted-event buffer. Its live
    /// subscriptions can no longer be complete, so they are closed with a
    /// reason the client can act on.
    async fn drop_lagging(&mut self, missed: u64) -> bool {
        let dropped = self.subscriptions.drain();
        if dropped.is_empty() {
            return true;
        }

        warn!(
            "Session {} missed {} events, closing {} subscriptions",
            self.id,
            missed,
            dropped.len()
        );
        self.relay.metrics.subscriptions_dropped(dropped.len());
        self.relay.metrics.subscriptions_closed(dropped.len());

        let responses = dropped
            .into_iter()
            .map(|subscription_id| RelayMessage::Closed {
                subscription_id,
                message: format!(
                    "error: connection fell {} events behind, resubscribe",
                    missed
                ),
            })
            .collect();
        self.send_all(responses).await
    }

    async fn send_all(&self, responses: Vec<RelayMessage>) -> bool {
        for response in responses {
            if self.outbound.send(response).await.is_err() {
                info!("Session {} client went away", self.id);
                return false;
            }
        }
        true
    }
}

/// NIP-01 OK reply for an ingest result.
pub fn ok_reply(event_id: String, result: &Result<StoreOutcome, StoreError>) -> RelayMessage {
    let (accepted, message) = match result {
        Ok(StoreOutcome::Stored | StoreOutcome::Replaced { .. } | StoreOutcome::Ephemeral) => {
            (true, String::new())
        }
        Ok(StoreOutcome::Duplicate) => (true, "duplicate: already have this event".to_string()),
        Ok(StoreOutcome::StaleReplacement { .. }) => (
            true,
            "duplicate: a newer version of this event is stored".to_string(),
        ),
        Ok(StoreOutcome::Deleted) => (false, "blocked: event was deleted by its author".to_string()),
        Err(StoreError::Validation(e)) => (false, format!("invalid: {}", e)),
        Err(e) => (false, format!("error: {}", e)),
    };

    RelayMessage::Ok {
        event_id,
        accepted,
        message,
    }
}
