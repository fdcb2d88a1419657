//! The sync engine facade
//!
//! [`NostrService`] wires the embedded relay, one endpoint loop per remote
//! relay, the broadcast coordinator, the outbox with its retry worker and
//! the feed subscription manager. Everything it uses is passed in: relay,
//! transports and clock, so tests run the whole engine in memory.

use crate::broadcast::{BroadcastCoordinator, BroadcastReport};
use crate::config::ClientConfig;
use crate::endpoint::{EndpointState, RelayEndpoint};
use crate::error::{ClientError, Result};
use crate::outbox::{Outbox, PermanentFailure};
use crate::retry::RetryWorker;
use crate::subscription::{SubscriptionHandle, SubscriptionManager};
use crate::transport::RelayTransport;
use crate::websocket::WebSocketTransport;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vine_nostr::{Clock, Event, EventSigner, EventTemplate, Filter};
use vine_relay::EmbeddedRelay;

/// Point-in-time view of the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub connected_relays: usize,
    /// State of every remote relay, in configuration order
    pub relays: Vec<(String, EndpointState)>,
    pub outbox_depth: usize,
    /// Open feed subscriptions
    pub local_subscriptions: usize,
    /// Events in the local store
    pub local_events: usize,
}

/// What one remote contributed to a sync
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelaySync {
    pub relay_url: String,
    pub fetched: usize,
    /// Events that were new to the local store
    pub stored: usize,
    pub error: Option<String>,
}

/// Result of [`NostrService::sync_from_remotes`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub relays: Vec<RelaySync>,
}

impl SyncReport {
    pub fn stored(&self) -> usize {
        self.relays.iter().map(|r| r.stored).sum()
    }

    pub fn fetched(&self) -> usize {
        self.relays.iter().map(|r| r.fetched).sum()
    }
}

/// The running sync engine
pub struct NostrService {
    config: ClientConfig,
    relay: EmbeddedRelay,
    endpoints: Vec<RelayEndpoint>,
    endpoint_tasks: Vec<JoinHandle<()>>,
    coordinator: BroadcastCoordinator,
    outbox: Arc<Outbox>,
    subscriptions: SubscriptionManager,
    cancel: CancellationToken,
    retry_task: JoinHandle<()>,
}

impl NostrService {
    /// Start the engine over the given relay and transports.
    pub async fn start(
        config: ClientConfig,
        relay: EmbeddedRelay,
        transports: Vec<Arc<dyn RelayTransport>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let outbox = Arc::new(Outbox::open(config.outbox.clone(), Arc::clone(&clock))?);
        let (connected_tx, connected_rx) = mpsc::unbounded_channel();

        let mut endpoints = Vec::with_capacity(transports.len());
        let mut endpoint_tasks = Vec::with_capacity(transports.len());
        for transport in transports {
            let (endpoint, task) = RelayEndpoint::spawn(
                transport,
                config.endpoint(),
                Arc::clone(&clock),
                Some(connected_tx.clone()),
            );
            endpoints.push(endpoint);
            endpoint_tasks.push(task);
        }
        drop(connected_tx);

        let coordinator = BroadcastCoordinator::new(
            Some(relay.clone()),
            endpoints.clone(),
            Arc::clone(&outbox),
            config.send_timeout,
        );

        let cancel = CancellationToken::new();
        let worker = RetryWorker::new(
            Arc::clone(&outbox),
            endpoints.iter().cloned(),
            config.send_timeout,
            config.retry_poll_interval,
        );
        let retry_task = tokio::spawn(worker.run(cancel.clone(), connected_rx));

        let subscriptions = SubscriptionManager::new(relay.clone(), config.subscription_buffer);

        info!(
            "Sync engine started with {} remote relays, {} queued in outbox",
            endpoints.len(),
            outbox.depth()
        );

        Ok(Self {
            config,
            relay,
            endpoints,
            endpoint_tasks,
            coordinator,
            outbox,
            subscriptions,
            cancel,
            retry_task,
        })
    }

    /// Start with a WebSocket transport for every relay in `config.relays`.
    pub async fn connect(
        config: ClientConfig,
        relay: EmbeddedRelay,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let transports = config
            .relays
            .iter()
            .map(|url| {
                WebSocketTransport::with_timeout(url, config.connect_timeout)
                    .map(|t| Arc::new(t) as Arc<dyn RelayTransport>)
            })
            .collect::<Result<Vec<_>>>()?;
        Self::start(config, relay, transports, clock).await
    }

    pub fn relay(&self) -> &EmbeddedRelay {
        &self.relay
    }

    pub fn endpoints(&self) -> &[RelayEndpoint] {
        &self.endpoints
    }

    pub fn endpoint(&self, url: &str) -> Option<&RelayEndpoint> {
        self.endpoints.iter().find(|e| e.url() == url)
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    /// Publish a signed event to the local store and every remote relay.
    pub async fn publish(&self, event: Event) -> Result<BroadcastReport> {
        self.coordinator.broadcast(&event).await
    }

    /// Sign a template with `signer` and publish it.
    pub async fn publish_template(
        &self,
        signer: &dyn EventSigner,
        template: &EventTemplate,
    ) -> Result<BroadcastReport> {
        let event = signer.sign_template(template)?;
        self.publish(event).await
    }

    /// Open a feed on the local store.
    pub async fn subscribe(
        &self,
        feed_key: impl Into<String>,
        filter: Filter,
    ) -> Result<SubscriptionHandle> {
        self.subscriptions.subscribe(feed_key, filter).await
    }

    /// Close a feed; returns once nothing more will be delivered to it.
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) {
        handle.close().await;
    }

    /// Events in the local store matching `filter`.
    pub fn local_store_query(&self, filter: &Filter) -> Result<Vec<Event>> {
        filter.validate()?;
        Ok(self.relay.store().query(filter).into_events())
    }

    pub fn status(&self) -> ServiceStatus {
        let relays: Vec<_> = self
            .endpoints
            .iter()
            .map(|e| (e.url().to_string(), e.state()))
            .collect();
        ServiceStatus {
            connected_relays: relays.iter().filter(|(_, s)| s.is_connected()).count(),
            relays,
            outbox_depth: self.outbox.depth(),
            local_subscriptions: self.subscriptions.subscription_count(),
            local_events: self.relay.store().len(),
        }
    }

    /// Pull events matching `filters` from every connected remote into the
    /// local store.
    pub async fn sync_from_remotes(&self, filters: &[Filter]) -> Result<SyncReport> {
        for filter in filters {
            filter.validate()?;
        }

        let results = join_all(self.endpoints.iter().map(|endpoint| async move {
            if !endpoint.is_connected() {
                return (endpoint.url().to_string(), Err(ClientError::NotConnected));
            }
            let fetched = match timeout(self.config.send_timeout, endpoint.query(filters)).await {
                Ok(result) => result,
                Err(_) => Err(ClientError::Timeout(format!(
                    "query timed out after {:?}",
                    self.config.send_timeout
                ))),
            };
            (endpoint.url().to_string(), fetched)
        }))
        .await;

        let mut report = SyncReport::default();
        for (relay_url, fetched) in results {
            let sync = match fetched {
                Ok(events) => {
                    let fetched = events.len();
                    let stored = events
                        .into_iter()
                        .filter(|event| match self.relay.publish(event.clone()) {
                            Ok(outcome) => outcome.is_new(),
                            Err(e) => {
                                debug!("Skipping {} from {}: {}", event.id, relay_url, e);
                                false
                            }
                        })
                        .count();
                    RelaySync {
                        relay_url,
                        fetched,
                        stored,
                        error: None,
                    }
                }
                Err(e) => {
                    warn!("Sync from {} failed: {}", relay_url, e);
                    RelaySync {
                        relay_url,
                        fetched: 0,
                        stored: 0,
                        error: Some(e.to_string()),
                    }
                }
            };
            report.relays.push(sync);
        }

        info!(
            "Synced {} new events ({} fetched) from {} relays",
            report.stored(),
            report.fetched(),
            report.relays.len()
        );
        Ok(report)
    }

    /// Receive every outbox entry that is given up on from now on.
    pub fn failures(&self) -> broadcast::Receiver<PermanentFailure> {
        self.outbox.subscribe_failures()
    }

    /// Stop the retry worker and every endpoint loop.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.retry_task.await {
            warn!("Retry worker ended abnormally: {}", e);
        }

        for endpoint in &self.endpoints {
            endpoint.shutdown().await;
        }
        for task in self.endpoint_tasks {
            if let Err(e) = task.await {
                warn!("Endpoint loop ended abnormally: {}", e);
            }
        }
        info!("Sync engine stopped");
    }
}
