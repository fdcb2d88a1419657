//! Relay endpoint control loops
//!
//! Each remote relay gets one task that owns its transport and its
//! connection state. Everything else talks to the loop through
//! [`RelayEndpoint`]: intents go in over an mpsc channel and state comes out
//! through a `watch` channel, so the state is only ever written by the loop.
//!
//! ```text
//!            intents (mpsc)               state (watch)
//!  caller ─────────────────▶ control loop ─────────────▶ observers
//!                               │   ▲
//!                    spawn op   │   │ connection lost
//!                               ▼   │
//!                            transport
//! ```
//!
//! Failed connects move the endpoint to `Backoff { until }` and the loop
//! reconnects on its own once the delay expires.

use crate::error::{ClientError, Result};
use crate::recovery::{BackoffPolicy, ReconnectBackoff};
use crate::transport::{PublishConfirmation, RelayTransport};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, info, warn};
use vine_nostr::{Clock, Event, Filter};

/// Connection state of one relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EndpointState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting to reconnect; `until` is in clock milliseconds
    Backoff { until: u64 },
}

impl EndpointState {
    pub fn is_connected(&self) -> bool {
        matches!(self, EndpointState::Connected)
    }
}

/// Endpoint configuration
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Bound on a single publish or query
    pub send_timeout: Duration,
    /// Bound on a single connect attempt
    pub connect_timeout: Duration,
    /// Initial reconnection delay
    pub reconnect_delay: Duration,
    /// Maximum reconnection delay
    pub max_reconnect_delay: Duration,
    /// Connect as soon as the loop starts
    pub auto_connect: bool,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
            auto_connect: true,
        }
    }
}

enum Intent {
    Connect,
    Disconnect,
    Publish {
        event: Event,
        reply: oneshot::Sender<Result<PublishConfirmation>>,
    },
    Query {
        filters: Vec<Filter>,
        reply: oneshot::Sender<Result<Vec<Event>>>,
    },
    Shutdown,
}

/// Handle to a relay endpoint's control loop.
#[derive(Clone)]
pub struct RelayEndpoint {
    url: String,
    intents: mpsc::Sender<Intent>,
    state: watch::Receiver<EndpointState>,
}

impl RelayEndpoint {
    /// Start the control loop for `transport`.
    ///
    /// Every transition into `Connected` sends the relay url on `connected`.
    pub fn spawn(
        transport: Arc<dyn RelayTransport>,
        config: EndpointConfig,
        clock: Arc<dyn Clock>,
        connected: Option<mpsc::UnboundedSender<String>>,
    ) -> (Self, JoinHandle<()>) {
        let url = transport.url().to_string();
        let (intents_tx, intents_rx) = mpsc::channel(256);
        let (state_tx, state_rx) = watch::channel(EndpointState::Disconnected);
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();

        let backoff = ReconnectBackoff::new(BackoffPolicy::new(
            config.reconnect_delay,
            config.max_reconnect_delay,
        ));
        let control = ControlLoop {
            url: url.clone(),
            transport,
            config,
            clock,
            state: state_tx,
            backoff,
            reconnect_at: None,
            connected,
            lost_tx,
        };
        let handle = tokio::spawn(control.run(intents_rx, lost_rx));

        (
            Self {
                url,
                intents: intents_tx,
                state: state_rx,
            },
            handle,
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> EndpointState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn watch_state(&self) -> watch::Receiver<EndpointState> {
        self.state.clone()
    }

    /// Wait until the endpoint is connected, up to `limit`.
    pub async fn wait_connected(&self, limit: Duration) -> bool {
        let mut state = self.state.clone();
        timeout(limit, state.wait_for(EndpointState::is_connected))
            .await
            .is_ok_and(|result| result.is_ok())
    }

    pub async fn connect(&self) -> Result<()> {
        self.send(Intent::Connect).await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.send(Intent::Disconnect).await
    }

    /// Publish through the loop. Answers `NotConnected` at once unless the
    /// endpoint is connected.
    pub async fn publish(&self, event: &Event) -> Result<PublishConfirmation> {
        let (reply, rx) = oneshot::channel();
        self.send(Intent::Publish {
            event: event.clone(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| ClientError::Shutdown)?
    }

    pub async fn query(&self, filters: &[Filter]) -> Result<Vec<Event>> {
        let (reply, rx) = oneshot::channel();
        self.send(Intent::Query {
            filters: filters.to_vec(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| ClientError::Shutdown)?
    }

    /// Ask the loop to disconnect and exit.
    pub async fn shutdown(&self) {
        let _ = self.intents.send(Intent::Shutdown).await;
    }

    async fn send(&self, intent: Intent) -> Result<()> {
        self.intents
            .send(intent)
            .await
            .map_err(|_| ClientError::Shutdown)
    }
}

struct ControlLoop {
    url: String,
    transport: Arc<dyn RelayTransport>,
    config: EndpointConfig,
    clock: Arc<dyn Clock>,
    state: watch::Sender<EndpointState>,
    backoff: ReconnectBackoff,
    reconnect_at: Option<Instant>,
    connected: Option<mpsc::UnboundedSender<String>>,
    lost_tx: mpsc::UnboundedSender<String>,
}

impl ControlLoop {
    async fn run(
        mut self,
        mut intents: mpsc::Receiver<Intent>,
        mut lost: mpsc::UnboundedReceiver<String>,
    ) {
        if self.config.auto_connect {
            self.try_connect().await;
        }

        loop {
            tokio::select! {
                intent = intents.recv() => match intent {
                    Some(Intent::Connect) => {
                        if !self.current().is_connected() {
                            self.reconnect_at = None;
                            self.try_connect().await;
                        }
                    }
                    Some(Intent::Disconnect) => {
                        self.reconnect_at = None;
                        self.drop_connection().await;
                        self.set_state(EndpointState::Disconnected);
                    }
                    Some(Intent::Publish { event, reply }) => {
                        if self.current().is_connected() {
                            let transport = Arc::clone(&self.transport);
                            self.spawn_op(reply, async move { transport.publish(&event).await });
                        } else {
                            let _ = reply.send(Err(ClientError::NotConnected));
                        }
                    }
                    Some(Intent::Query { filters, reply }) => {
                        if self.current().is_connected() {
                            let transport = Arc::clone(&self.transport);
                            self.spawn_op(reply, async move { transport.query(&filters).await });
                        } else {
                            let _ = reply.send(Err(ClientError::NotConnected));
                        }
                    }
                    Some(Intent::Shutdown) | None => break,
                },

                Some(reason) = lost.recv() => {
                    if self.current().is_connected() {
                        warn!("Lost connection to {}: {}", self.url, reason);
                        self.drop_connection().await;
                        self.enter_backoff();
                    }
                }

                _ = wait_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.try_connect().await;
                }
            }
        }

        self.drop_connection().await;
        self.set_state(EndpointState::Disconnected);
        debug!("Endpoint {} stopped", self.url);
    }

    fn current(&self) -> EndpointState {
        *self.state.borrow()
    }

    fn set_state(&self, state: EndpointState) {
        self.state.send_replace(state);
    }

    async fn try_connect(&mut self) {
        self.set_state(EndpointState::Connecting);

        let result = match timeout(self.config.connect_timeout, self.transport.connect()).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(format!(
                "connect timed out after {:?}",
                self.config.connect_timeout
            ))),
        };

        match result {
            Ok(()) => {
                self.backoff.reset();
                self.set_state(EndpointState::Connected);
                info!("Endpoint {} connected", self.url);
                if let Some(connected) = &self.connected {
                    let _ = connected.send(self.url.clone());
                }
            }
            Err(e) => {
                warn!("Failed to connect to {}: {}", self.url, e);
                self.enter_backoff();
            }
        }
    }

    fn enter_backoff(&mut self) {
        let delay = self.backoff.next_delay();
        self.reconnect_at = Some(Instant::now() + delay);
        let until = self.clock.now_millis() + delay.as_millis() as u64;
        self.set_state(EndpointState::Backoff { until });
        debug!("Endpoint {} backing off for {:?}", self.url, delay);
    }

    async fn drop_connection(&self) {
        if let Err(e) = self.transport.disconnect().await {
            debug!("Error disconnecting from {}: {}", self.url, e);
        }
    }

    /// Run an operation off the loop, bounded by the send timeout. A
    /// connection-level failure is reported back so the loop can reconnect.
    fn spawn_op<T, F>(&self, reply: oneshot::Sender<Result<T>>, op: F)
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let send_timeout = self.config.send_timeout;
        let lost = self.lost_tx.clone();
        let url = self.url.clone();

        tokio::spawn(async move {
            let result = match timeout(send_timeout, op).await {
                Ok(result) => result,
                Err(_) => Err(ClientError::Timeout(format!(
                    "{} did not answer within {:?}",
                    url, send_timeout
                ))),
            };
            if let Err(e) = &result
                && e.is_connection_loss()
            {
                let _ = lost.send(e.to_string());
            }
            let _ = reply.send(result);
        });
    }
}

async fn wait_until(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockBehavior, MockTransport};
    use vine_nostr::{EventTemplate, ManualClock, finalize_event, generate_secret_key};

    fn test_config() -> EndpointConfig {
        EndpointConfig {
            send_timeout: Duration::from_millis(200),
            connect_timeout: Duration::from_millis(200),
            reconnect_delay: Duration::from_millis(10),
            max_reconnect_delay: Duration::from_millis(40),
            auto_connect: true,
        }
    }

    fn create_test_event() -> Event {
        let template = EventTemplate {
            kind: 1,
            tags: vec![],
            content: "endpoint".to_string(),
            created_at: 1_700_000_000,
        };
        finalize_event(&template, &generate_secret_key()).unwrap()
    }

    fn clock() -> Arc<dyn Clock> {
        Arc::new(ManualClock::new(1_000))
    }

    #[tokio::test]
    async fn test_connects_and_publishes() {
        let mock = MockTransport::new("wss://a");
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        let (endpoint, task) =
            RelayEndpoint::spawn(Arc::new(mock.clone()), test_config(), clock(), Some(signal_tx));

        assert!(endpoint.wait_connected(Duration::from_secs(1)).await);
        assert_eq!(signal_rx.recv().await.as_deref(), Some("wss://a"));

        let event = create_test_event();
        assert!(endpoint.publish(&event).await.unwrap().accepted);
        assert_eq!(mock.published(), vec![event]);

        endpoint.shutdown().await;
        task.await.unwrap();
        assert!(!mock.is_connected());
    }

    #[tokio::test]
    async fn test_publish_while_backing_off_fails_fast() {
        let mock = MockTransport::new("wss://down");
        mock.refuse_connections(true);
        let config = EndpointConfig {
            reconnect_delay: Duration::from_secs(30),
            max_reconnect_delay: Duration::from_secs(30),
            ..test_config()
        };
        let (endpoint, _task) = RelayEndpoint::spawn(Arc::new(mock.clone()), config, clock(), None);

        let mut state = endpoint.watch_state();
        state
            .wait_for(|s| matches!(s, EndpointState::Backoff { .. }))
            .await
            .unwrap();
        match endpoint.state() {
            EndpointState::Backoff { until } => assert!(until >= 1_000),
            other => panic!("expected backoff, got {:?}", other),
        }

        let result = endpoint.publish(&create_test_event()).await;
        assert!(matches!(result, Err(ClientError::NotConnected)));
        assert_eq!(mock.publish_attempts(), 0);
    }

    #[tokio::test]
    async fn test_reconnects_after_backoff() {
        let mock = MockTransport::new("wss://flaky");
        mock.refuse_connections(true);
        let (endpoint, _task) =
            RelayEndpoint::spawn(Arc::new(mock.clone()), test_config(), clock(), None);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!endpoint.is_connected());

        mock.refuse_connections(false);
        assert!(endpoint.wait_connected(Duration::from_secs(2)).await);
        assert!(mock.connect_attempts() >= 2);
    }

    #[tokio::test]
    async fn test_connection_loss_triggers_backoff() {
        let mock = MockTransport::new("wss://drop");
        let (endpoint, _task) =
            RelayEndpoint::spawn(Arc::new(mock.clone()), test_config(), clock(), None);
        assert!(endpoint.wait_connected(Duration::from_secs(1)).await);

        mock.set_behavior(MockBehavior::Fail("socket reset".to_string()));
        mock.refuse_connections(true);
        assert!(endpoint.publish(&create_test_event()).await.is_err());

        let mut state = endpoint.watch_state();
        state
            .wait_for(|s| matches!(s, EndpointState::Backoff { .. }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_hanging_publish_times_out() {
        let mock = MockTransport::new("wss://slow").with_behavior(MockBehavior::Hang);
        let (endpoint, _task) =
            RelayEndpoint::spawn(Arc::new(mock.clone()), test_config(), clock(), None);
        assert!(endpoint.wait_connected(Duration::from_secs(1)).await);

        let result = endpoint.publish(&create_test_event()).await;
        assert!(matches!(result, Err(ClientError::Timeout(_))));
        assert!(endpoint.is_connected());
    }
}
