//! WebSocket transport for remote relays
//!
//! One socket per relay. A background reader routes `OK` frames to the
//! publish waiting on that event id and `EVENT`/`EOSE`/`CLOSED` frames to
//! the query owning the subscription id, so publishes and queries can be in
//! flight at the same time.

use crate::error::{ClientError, Result};
use crate::transport::{PublishConfirmation, RelayTransport, dedup_by_id};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;
use vine_nostr::{ClientMessage, Event, Filter, RelayMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Writer = tokio::sync::Mutex<SplitSink<WsStream, Message>>;

type PendingPublishes = Arc<Mutex<PendingOks>>;
type OpenQueries = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<RelayMessage>>>>;

struct Connection {
    writer: Writer,
    pending: PendingPublishes,
    queries: OpenQueries,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Connection {
    async fn send(&self, message: &ClientMessage) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Connection("connection closed".to_string()));
        }
        let text = message.to_json()?;
        self.writer
            .lock()
            .await
            .send(Message::text(text))
            .await
            .map_err(|e| ClientError::WebSocket(e.to_string()))
    }
}

/// Publishes waiting for an `OK`, several per event id when the same event
/// is sent more than once on one socket.
#[derive(Default)]
struct PendingOks {
    next_token: u64,
    waiters: HashMap<String, Vec<(u64, oneshot::Sender<PublishConfirmation>)>>,
}

impl PendingOks {
    fn register(&mut self, event_id: &str) -> (u64, oneshot::Receiver<PublishConfirmation>) {
        let (tx, rx) = oneshot::channel();
        self.next_token += 1;
        let token = self.next_token;
        self.waiters
            .entry(event_id.to_string())
            .or_default()
            .push((token, tx));
        (token, rx)
    }

    /// Hand the relay's verdict to every publish waiting on that event.
    fn resolve(&mut self, confirmation: PublishConfirmation) -> usize {
        let Some(waiters) = self.waiters.remove(&confirmation.event_id) else {
            return 0;
        };
        let count = waiters.len();
        for (_, tx) in waiters {
            let _ = tx.send(confirmation.clone());
        }
        count
    }

    fn cancel(&mut self, event_id: &str, token: u64) {
        if let Some(waiters) = self.waiters.get_mut(event_id) {
            waiters.retain(|(t, _)| *t != token);
            if waiters.is_empty() {
                self.waiters.remove(event_id);
            }
        }
    }

    fn clear(&mut self) {
        self.waiters.clear();
    }
}

/// Drops one publish's waiter when it gives up.
struct PendingOk<'a> {
    pending: &'a Mutex<PendingOks>,
    event_id: String,
    token: u64,
}

impl Drop for PendingOk<'_> {
    fn drop(&mut self) {
        self.pending.lock().cancel(&self.event_id, self.token);
    }
}

/// Removes a map entry when the waiting side gives up.
struct Registration<'a, V> {
    map: &'a Mutex<HashMap<String, V>>,
    key: String,
}

impl<V> Drop for Registration<'_, V> {
    fn drop(&mut self) {
        self.map.lock().remove(&self.key);
    }
}

/// Remote relay over WebSocket
pub struct WebSocketTransport {
    address: String,
    url: Url,
    connect_timeout: Duration,
    connection: tokio::sync::RwLock<Option<Arc<Connection>>>,
}

impl WebSocketTransport {
    pub fn new(url: &str) -> Result<Self> {
        Self::with_timeout(url, Duration::from_secs(10))
    }

    pub fn with_timeout(address: &str, connect_timeout: Duration) -> Result<Self> {
        let url = Url::parse(address)?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(ClientError::InvalidUrl(format!(
                "expected ws:// or wss://, got {}",
                url
            )));
        }
        Ok(Self {
            address: address.to_string(),
            url,
            connect_timeout,
            connection: tokio::sync::RwLock::new(None),
        })
    }

    async fn current(&self) -> Result<Arc<Connection>> {
        self.connection
            .read()
            .await
            .clone()
            .ok_or(ClientError::NotConnected)
    }
}

#[async_trait]
impl RelayTransport for WebSocketTransport {
    fn url(&self) -> &str {
        &self.address
    }

    async fn connect(&self) -> Result<()> {
        let mut slot = self.connection.write().await;
        if let Some(existing) = slot.as_ref()
            && !existing.closed.load(Ordering::Acquire)
        {
            return Ok(());
        }

        info!("Connecting to relay: {}", self.url);
        let (stream, _) = timeout(self.connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| {
                ClientError::Timeout(format!(
                    "connection timeout after {:?}",
                    self.connect_timeout
                ))
            })?
            .map_err(|e| ClientError::WebSocket(e.to_string()))?;

        let (writer, reader) = stream.split();
        let pending: PendingPublishes = Arc::default();
        let queries: OpenQueries = Arc::default();
        let closed = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(read_loop(
            self.url.to_string(),
            reader,
            Arc::clone(&pending),
            Arc::clone(&queries),
            Arc::clone(&closed),
        ));

        *slot = Some(Arc::new(Connection {
            writer: tokio::sync::Mutex::new(writer),
            pending,
            queries,
            closed,
            reader,
        }));
        info!("Connected to relay: {}", self.url);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let Some(connection) = self.connection.write().await.take() else {
            return Ok(());
        };
        info!("Disconnecting from relay: {}", self.url);
        connection.closed.store(true, Ordering::Release);
        let _ = connection.writer.lock().await.close().await;
        connection.reader.abort();
        Ok(())
    }

    async fn publish(&self, event: &Event) -> Result<PublishConfirmation> {
        let connection = self.current().await?;

        let (token, rx) = connection.pending.lock().register(&event.id);
        let _registration = PendingOk {
            pending: &connection.pending,
            event_id: event.id.clone(),
            token,
        };

        connection.send(&ClientMessage::Event(event.clone())).await?;

        rx.await
            .map_err(|_| ClientError::Connection("connection closed before OK".to_string()))
    }

    async fn query(&self, filters: &[Filter]) -> Result<Vec<Event>> {
        let connection = self.current().await?;
        let subscription_id = format!("q-{}", uuid::Uuid::new_v4().simple());

        let (tx, mut rx) = mpsc::unbounded_channel();
        connection.queries.lock().insert(subscription_id.clone(), tx);
        let _registration = Registration {
            map: &connection.queries,
            key: subscription_id.clone(),
        };

        connection
            .send(&ClientMessage::Req {
                subscription_id: subscription_id.clone(),
                filters: filters.to_vec(),
            })
            .await?;

        let mut events = Vec::new();
        loop {
            match rx.recv().await {
                Some(RelayMessage::Event { event, .. }) => events.push(event),
                Some(RelayMessage::Eose { .. }) => break,
                Some(RelayMessage::Closed { message, .. }) => {
                    return Err(ClientError::SubscriptionClosed(message));
                }
                Some(_) => {}
                None => {
                    return Err(ClientError::Connection(
                        "connection closed before EOSE".to_string(),
                    ));
                }
            }
        }

        if let Err(e) = connection
            .send(&ClientMessage::Close {
                subscription_id: subscription_id.clone(),
            })
            .await
        {
            debug!("Failed to close query {}: {}", subscription_id, e);
        }

        debug!(
            "Query {} on {} returned {} events",
            subscription_id,
            self.url,
            events.len()
        );
        Ok(dedup_by_id(events))
    }
}

async fn read_loop(
    url: String,
    mut reader: SplitStream<WsStream>,
    pending: PendingPublishes,
    queries: OpenQueries,
    closed: Arc<AtomicBool>,
) {
    while let Some(frame) = reader.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => {
                info!("Relay {} closed connection", url);
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!("WebSocket error from {}: {}", url, e);
                break;
            }
        };

        let message = match RelayMessage::from_json(text.as_str()) {
            Ok(message) => message,
            Err(e) => {
                debug!("Ignoring unparseable frame from {}: {}", url, e);
                continue;
            }
        };

        match message {
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => {
                pending.lock().resolve(PublishConfirmation {
                    event_id,
                    accepted,
                    message,
                });
            }
            RelayMessage::Notice { message } => {
                warn!("NOTICE from {}: {}", url, message);
            }
            routed => {
                let target = routed
                    .subscription_id()
                    .and_then(|id| queries.lock().get(id).cloned());
                if let Some(tx) = target {
                    let _ = tx.send(routed);
                }
            }
        }
    }

    closed.store(true, Ordering::Release);
    pending.lock().clear();
    queries.lock().clear();
}
