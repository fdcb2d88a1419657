//! Multi-relay broadcast
//!
//! Sends one event to the embedded relay and every remote endpoint at once.
//! Each relay gets its own outcome; relays that could not take the event for
//! a transient reason are handed to the outbox so only they are retried.

use crate::endpoint::RelayEndpoint;
use crate::error::{ClientError, Result};
use crate::outbox::Outbox;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use vine_nostr::{Event, RelayMessage, check_event};
use vine_relay::{EmbeddedRelay, ok_reply};

/// Key the embedded relay is reported under
pub const LOCAL_RELAY: &str = "local";

/// What happened on one relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum RelayOutcome {
    Acked,
    Failed(String),
    /// Not attempted, e.g. because the endpoint was disconnected
    Skipped(String),
}

impl RelayOutcome {
    pub fn is_acked(&self) -> bool {
        matches!(self, RelayOutcome::Acked)
    }
}

/// Per-relay result of one broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub event_id: String,
    /// Outcome per relay url, the embedded relay first when present
    pub outcomes: Vec<(String, RelayOutcome)>,
    /// Relays the event was queued for in the outbox
    pub queued: Vec<String>,
}

impl BroadcastReport {
    /// At least one relay, local included, acknowledged the event.
    pub fn is_successful(&self) -> bool {
        self.outcomes.iter().any(|(_, outcome)| outcome.is_acked())
    }

    pub fn outcome(&self, relay_url: &str) -> Option<&RelayOutcome> {
        self.outcomes
            .iter()
            .find(|(url, _)| url == relay_url)
            .map(|(_, outcome)| outcome)
    }

    pub fn acked_relays(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| outcome.is_acked())
            .map(|(url, _)| url.as_str())
            .collect()
    }

    pub fn failed_relays(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| !outcome.is_acked())
            .map(|(url, _)| url.as_str())
            .collect()
    }
}

/// Outcome for one remote relay and whether it should be retried later.
struct EndpointResult {
    url: String,
    outcome: RelayOutcome,
    retry: bool,
}

impl EndpointResult {
    fn skipped(url: String) -> Self {
        Self {
            url,
            outcome: RelayOutcome::Skipped("disconnected".to_string()),
            retry: true,
        }
    }
}

/// Fans events out to every relay.
pub struct BroadcastCoordinator {
    relay: Option<EmbeddedRelay>,
    endpoints: Vec<RelayEndpoint>,
    outbox: Arc<Outbox>,
    send_timeout: Duration,
}

impl BroadcastCoordinator {
    pub fn new(
        relay: Option<EmbeddedRelay>,
        endpoints: Vec<RelayEndpoint>,
        outbox: Arc<Outbox>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            relay,
            endpoints,
            outbox,
            send_timeout,
        }
    }

    pub fn endpoints(&self) -> &[RelayEndpoint] {
        &self.endpoints
    }

    /// Publish `event` everywhere.
    ///
    /// An event that fails validation is rejected here, before any relay or
    /// the outbox sees it.
    pub async fn broadcast(&self, event: &Event) -> Result<BroadcastReport> {
        check_event(event).map_err(ClientError::InvalidEvent)?;

        let mut outcomes = Vec::with_capacity(self.endpoints.len() + 1);
        if let Some(relay) = &self.relay {
            outcomes.push((LOCAL_RELAY.to_string(), publish_local(relay, event)));
        }

        let remote = join_all(
            self.endpoints
                .iter()
                .map(|endpoint| publish_remote(endpoint, event, self.send_timeout)),
        )
        .await;

        let mut queued = Vec::new();
        for result in remote {
            if result.retry {
                let queued_result = match &result.outcome {
                    RelayOutcome::Skipped(reason) => {
                        self.outbox.enqueue_unsent(event, &result.url, reason)
                    }
                    RelayOutcome::Failed(reason) => self.outbox.enqueue(event, &result.url, reason),
                    RelayOutcome::Acked => Ok(()),
                };
                match queued_result {
                    Ok(()) => queued.push(result.url.clone()),
                    Err(e) => warn!("Failed to queue {} for {}: {}", event.id, result.url, e),
                }
            }
            outcomes.push((result.url, result.outcome));
        }

        let report = BroadcastReport {
            event_id: event.id.clone(),
            outcomes,
            queued,
        };
        info!(
            "Broadcast {}: {} acked, {} queued",
            event.id,
            report.acked_relays().len(),
            report.queued.len()
        );
        Ok(report)
    }
}

fn publish_local(relay: &EmbeddedRelay, event: &Event) -> RelayOutcome {
    let result = relay.publish(event.clone());
    match ok_reply(event.id.clone(), &result) {
        RelayMessage::Ok { accepted: true, .. } => RelayOutcome::Acked,
        RelayMessage::Ok { message, .. } => RelayOutcome::Failed(message),
        other => RelayOutcome::Failed(format!("unexpected reply: {:?}", other)),
    }
}

async fn publish_remote(
    endpoint: &RelayEndpoint,
    event: &Event,
    send_timeout: Duration,
) -> EndpointResult {
    let url = endpoint.url().to_string();

    if !endpoint.is_connected() {
        debug!("Skipping {} for {}: not connected", url, event.id);
        return EndpointResult::skipped(url);
    }

    let (outcome, retry) = match timeout(send_timeout, endpoint.publish(event)).await {
        Err(_) => (
            RelayOutcome::Failed(format!("timeout after {:?}", send_timeout)),
            true,
        ),
        Ok(Err(ClientError::NotConnected)) => return EndpointResult::skipped(url),
        Ok(Ok(confirmation)) if confirmation.accepted => (RelayOutcome::Acked, false),
        Ok(Ok(confirmation)) => {
            let retry = confirmation.is_retryable();
            (RelayOutcome::Failed(confirmation.message), retry)
        }
        Ok(Err(e)) => {
            let retry = e.is_retryable();
            (RelayOutcome::Failed(e.to_string()), retry)
        }
    };

    if !outcome.is_acked() {
        debug!("Relay {} did not take {}: {:?}", url, event.id, outcome);
    }
    EndpointResult {
        url,
        outcome,
        retry,
    }
}
