//! Outbox retry worker
//!
//! Drains due outbox entries and sends each one again through the endpoint
//! it was meant for. The worker wakes on a fixed poll interval and also as
//! soon as an endpoint reports that it connected, in which case that relay's
//! entries are expedited. Entries whose endpoint is offline are deferred
//! without counting an attempt.

use crate::endpoint::RelayEndpoint;
use crate::error::ClientError;
use crate::outbox::{Outbox, OutboxEntry, OutboxState};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Counts from one retry pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPass {
    pub attempted: usize,
    pub succeeded: usize,
    pub rescheduled: usize,
    /// Entries put back untouched because their relay is offline
    pub deferred: usize,
    pub permanently_failed: usize,
}

enum Attempt {
    Delivered,
    /// Not sent; the endpoint is not connected
    Deferred(String),
    Retry(String),
    Permanent(String),
}

/// Background retry loop over the outbox
pub struct RetryWorker {
    outbox: Arc<Outbox>,
    endpoints: HashMap<String, RelayEndpoint>,
    send_timeout: Duration,
    poll_interval: Duration,
}

impl RetryWorker {
    pub fn new(
        outbox: Arc<Outbox>,
        endpoints: impl IntoIterator<Item = RelayEndpoint>,
        send_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            outbox,
            endpoints: endpoints
                .into_iter()
                .map(|endpoint| (endpoint.url().to_string(), endpoint))
                .collect(),
            send_timeout,
            poll_interval,
        }
    }

    /// Retry every due entry once.
    pub async fn run_once(&self) -> RetryPass {
        let due = self.outbox.drain_due();
        if due.is_empty() {
            return RetryPass::default();
        }
        debug!("Retrying {} outbox entries", due.len());

        let attempts = join_all(due.into_iter().map(|entry| self.attempt(entry))).await;

        let mut pass = RetryPass::default();
        for (entry, attempt) in attempts {
            pass.attempted += 1;
            let event_id = entry.event_id();
            let recorded = match attempt {
                Attempt::Delivered => self
                    .outbox
                    .mark_succeeded(event_id, &entry.relay_url)
                    .map(|_| pass.succeeded += 1),
                Attempt::Deferred(reason) => self
                    .outbox
                    .defer(event_id, &entry.relay_url, &reason)
                    .map(|_| pass.deferred += 1),
                Attempt::Retry(reason) => self
                    .outbox
                    .mark_failed(event_id, &entry.relay_url, &reason)
                    .map(|state| match state {
                        Some(OutboxState::PermanentlyFailed) => pass.permanently_failed += 1,
                        _ => pass.rescheduled += 1,
                    }),
                Attempt::Permanent(reason) => self
                    .outbox
                    .mark_permanently_failed(event_id, &entry.relay_url, &reason)
                    .map(|_| pass.permanently_failed += 1),
            };
            if let Err(e) = recorded {
                error!(
                    "Failed to record retry of {} to {}: {}",
                    event_id, entry.relay_url, e
                );
            }
        }

        if pass.succeeded > 0 || pass.permanently_failed > 0 {
            info!(
                "Retry pass: {} delivered, {} rescheduled, {} failed permanently",
                pass.succeeded, pass.rescheduled, pass.permanently_failed
            );
        }
        pass
    }

    async fn attempt(&self, entry: OutboxEntry) -> (OutboxEntry, Attempt) {
        let Some(endpoint) = self.endpoints.get(&entry.relay_url) else {
            return (entry, Attempt::Permanent("unknown relay".to_string()));
        };
        if !endpoint.is_connected() {
            return (entry, Attempt::Deferred("disconnected".to_string()));
        }

        let attempt = match timeout(self.send_timeout, endpoint.publish(&entry.event)).await {
            Err(_) => Attempt::Retry(format!("timeout after {:?}", self.send_timeout)),
            Ok(Ok(confirmation)) if confirmation.accepted => Attempt::Delivered,
            Ok(Ok(confirmation)) if confirmation.is_retryable() => {
                Attempt::Retry(confirmation.message)
            }
            Ok(Ok(confirmation)) => Attempt::Permanent(confirmation.message),
            Ok(Err(ClientError::NotConnected)) => Attempt::Deferred("disconnected".to_string()),
            Ok(Err(e)) if e.is_retryable() => Attempt::Retry(e.to_string()),
            Ok(Err(e)) => Attempt::Permanent(e.to_string()),
        };
        (entry, attempt)
    }

    /// Run until `cancel` fires. Each url received on `connected` has its
    /// entries expedited and triggers an immediate pass.
    pub async fn run(
        self,
        cancel: CancellationToken,
        mut connected: mpsc::UnboundedReceiver<String>,
    ) {
        info!("Retry worker started");
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut connected_open = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                url = connected.recv(), if connected_open => match url {
                    Some(url) => {
                        if self.outbox.expedite(&url) > 0 {
                            debug!("Relay {} connected, retrying its entries", url);
                        }
                        self.run_once().await;
                    }
                    None => connected_open = false,
                },
            }
        }
        info!("Retry worker stopped");
    }
}
