//! Per-connection subscription state
//!
//! A subscription binds filters to a connection under a client-chosen id.
//! It backfills from a store snapshot, signals EOSE, then streams events
//! accepted after the snapshot's watermark.

use std::collections::HashMap;
use vine_nostr::{Event, Filter, FilterError};

/// Maximum subscription id length accepted from clients.
pub const MAX_SUBSCRIPTION_ID_LENGTH: usize = 64;

/// Lifecycle of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Backfilling,
    LiveStreaming,
    Closed,
}

/// A client subscription
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: String,
    pub filters: Vec<Filter>,
    state: SubscriptionState,
    /// Accepted events with a sequence number at or below this were part of
    /// the backfill snapshot.
    watermark: u64,
}

impl Subscription {
    pub fn new(id: String, filters: Vec<Filter>) -> Self {
        Self {
            id,
            filters,
            state: SubscriptionState::Backfilling,
            watermark: 0,
        }
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    pub fn watermark(&self) -> u64 {
        self.watermark
    }

    /// Backfill finished: stream events accepted after `watermark`.
    pub fn go_live(&mut self, watermark: u64) {
        self.watermark = watermark;
        self.state = SubscriptionState::LiveStreaming;
    }

    pub fn close(&mut self) {
        self.state = SubscriptionState::Closed;
    }

    /// Check if an event matches any filter in this subscription
    pub fn matches(&self, event: &Event) -> bool {
        self.filters.iter().any(|filter| filter.matches(event))
    }

    /// Whether a live event with sequence `seq` should be delivered.
    pub fn wants_live(&self, seq: u64, event: &Event) -> bool {
        self.state == SubscriptionState::LiveStreaming && seq > self.watermark && self.matches(event)
    }
}

/// Why a REQ was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    InvalidId(String),
    NoFilters,
    InvalidFilter(FilterError),
    TooManySubscriptions(usize),
}

impl RequestError {
    /// Message for a `CLOSED` reply, prefixed per NIP-01.
    pub fn to_closed_message(&self) -> String {
        match self {
            RequestError::InvalidId(reason) => format!("invalid: {}", reason),
            RequestError::NoFilters => "invalid: at least one filter is required".to_string(),
            RequestError::InvalidFilter(err) => format!("invalid: {}", err),
            RequestError::TooManySubscriptions(max) => {
                format!("error: too many subscriptions (max {})", max)
            }
        }
    }
}

pub fn validate_subscription_id(id: &str) -> Result<(), RequestError> {
    if id.is_empty() {
        return Err(RequestError::InvalidId("subscription id is empty".to_string()));
    }
    if id.len() > MAX_SUBSCRIPTION_ID_LENGTH {
        return Err(RequestError::InvalidId(format!(
            "subscription id longer than {} characters",
            MAX_SUBSCRIPTION_ID_LENGTH
        )));
    }
    Ok(())
}

/// All subscriptions of one connection
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    subscriptions: HashMap<String, Subscription>,
    max_subscriptions: usize,
}

impl SubscriptionSet {
    pub fn new(max_subscriptions: usize) -> Self {
        Self {
            subscriptions: HashMap::new(),
            max_subscriptions,
        }
    }

    /// Check a REQ before any backfill work is done.
    pub fn admit(&self, id: &str, filters: &[Filter]) -> Result<(), RequestError> {
        validate_subscription_id(id)?;
        if filters.is_empty() {
            return Err(RequestError::NoFilters);
        }
        for filter in filters {
            filter.validate().map_err(RequestError::InvalidFilter)?;
        }
        let replacing = self.subscriptions.contains_key(id);
        if !replacing && self.subscriptions.len() >= self.max_subscriptions {
            return Err(RequestError::TooManySubscriptions(self.max_subscriptions));
        }
        Ok(())
    }

    /// Insert or replace; returns true when an existing id was replaced.
    pub fn insert(&mut self, subscription: Subscription) -> bool {
        self.subscriptions
            .insert(subscription.id.clone(), subscription)
            .is_some()
    }

    pub fn remove(&mut self, id: &str) -> Option<Subscription> {
        self.subscriptions.remove(id).map(|mut sub| {
            sub.close();
            sub
        })
    }

    pub fn get(&self, id: &str) -> Option<&Subscription> {
        self.subscriptions.get(id)
    }

    /// Ids of live subscriptions that want this event.
    pub fn live_matches(&self, seq: u64, event: &Event) -> Vec<String> {
        self.subscriptions
            .values()
            .filter(|sub| sub.wants_live(seq, event))
            .map(|sub| sub.id.clone())
            .collect()
    }

    /// Remove every subscription, returning their ids.
    pub fn drain(&mut self) -> Vec<String> {
        self.subscriptions.drain().map(|(id, _)| id).collect()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}
