//! Sync engine configuration

use crate::endpoint::EndpointConfig;
use crate::outbox::{OUTBOX_DB_PATH_ENV, OutboxConfig};
use crate::subscription::DEFAULT_SUBSCRIPTION_BUFFER;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Comma-separated remote relay urls
pub const RELAYS_ENV: &str = "VINE_RELAYS";
/// Per-relay send timeout in milliseconds
pub const SEND_TIMEOUT_ENV: &str = "VINE_SEND_TIMEOUT_MS";

/// Configuration for [`crate::NostrService`]
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Remote relays to publish to and sync from
    pub relays: Vec<String>,
    /// Bound on each relay's publish or query
    pub send_timeout: Duration,
    /// Bound on each connect attempt
    pub connect_timeout: Duration,
    /// Initial reconnect delay
    pub reconnect_base: Duration,
    /// Maximum reconnect delay
    pub reconnect_max: Duration,
    /// How often the retry worker checks the outbox
    pub retry_poll_interval: Duration,
    /// Live buffer per feed subscription
    pub subscription_buffer: usize,
    pub outbox: OutboxConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            send_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(60),
            retry_poll_interval: Duration::from_secs(1),
            subscription_buffer: DEFAULT_SUBSCRIPTION_BUFFER,
            outbox: OutboxConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by `VINE_RELAYS`, `VINE_SEND_TIMEOUT_MS` and
    /// `VINE_OUTBOX_DB_PATH`.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(relays) = lookup(RELAYS_ENV) {
            config.relays = parse_relays(&relays);
        }

        if let Some(raw) = lookup(SEND_TIMEOUT_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(ms) => config.send_timeout = Duration::from_millis(ms),
                Err(e) => warn!("Ignoring {}={:?}: {}", SEND_TIMEOUT_ENV, raw, e),
            }
        }

        if let Some(path) = lookup(OUTBOX_DB_PATH_ENV).filter(|p| !p.trim().is_empty()) {
            config.outbox.db_path = Some(PathBuf::from(path));
        }

        config
    }

    /// Endpoint settings derived from this config.
    pub fn endpoint(&self) -> EndpointConfig {
        EndpointConfig {
            send_timeout: self.send_timeout,
            connect_timeout: self.connect_timeout,
            reconnect_delay: self.reconnect_base,
            max_reconnect_delay: self.reconnect_max,
            auto_connect: true,
        }
    }
}

fn parse_relays(raw: &str) -> Vec<String> {
    let mut relays: Vec<String> = Vec::new();
    for relay in raw.split(',').map(str::trim).filter(|r| !r.is_empty()) {
        if !relays.iter().any(|known| known == relay) {
            relays.push(relay.to_string());
        }
    }
    relays
}
