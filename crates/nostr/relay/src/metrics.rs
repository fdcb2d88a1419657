//! Embedded relay counters
//!
//! Tracks connections, event ingestion outcomes, subscriptions and live
//! delivery. Everything is a relaxed atomic; snapshots are for status
//! reporting, not accounting.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

/// Relay metrics collector
#[derive(Debug)]
pub struct RelayMetrics {
    start_time: Instant,

    pub active_connections: AtomicUsize,
    pub events_received: AtomicU64,
    pub events_stored: AtomicU64,
    pub events_duplicate: AtomicU64,
    pub events_rejected: AtomicU64,
    pub events_deleted: AtomicU64,
    pub active_subscriptions: AtomicUsize,
    pub subscription_requests: AtomicU64,
    pub subscriptions_refused: AtomicU64,
    pub live_events_delivered: AtomicU64,
    /// Subscriptions closed because their connection fell behind
    pub subscriptions_dropped_lagging: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            active_connections: AtomicUsize::new(0),
            events_received: AtomicU64::new(0),
            events_stored: AtomicU64::new(0),
            events_duplicate: AtomicU64::new(0),
            events_rejected: AtomicU64::new(0),
            events_deleted: AtomicU64::new(0),
            active_subscriptions: AtomicUsize::new(0),
            subscription_requests: AtomicU64::new(0),
            subscriptions_refused: AtomicU64::new(0),
            live_events_delivered: AtomicU64::new(0),
            subscriptions_dropped_lagging: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn event_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_stored(&self) {
        self.events_stored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_duplicate(&self) {
        self.events_duplicate.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_rejected(&self) {
        self.events_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_deleted(&self) {
        self.events_deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscription_opened(&self) {
        self.active_subscriptions.fetch_add(1, Ordering::Relaxed);
        self.subscription_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// A REQ reused an open id; counts the request, not a new subscription.
    pub fn subscription_replaced(&self) {
        self.subscription_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscription_refused(&self) {
        self.subscriptions_refused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscriptions_closed(&self, count: usize) {
        self.active_subscriptions.fetch_sub(count, Ordering::Relaxed);
    }

    pub fn live_event_delivered(&self) {
        self.live_events_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscriptions_dropped(&self, count: usize) {
        self.subscriptions_dropped_lagging
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_in(&self, count: u64) {
        self.bytes_received.fetch_add(count, Ordering::Relaxed);
    }

    pub fn bytes_out(&self, count: u64) {
        self.bytes_sent.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            events_received: self.events_received.load(Ordering::Relaxed),
            events_stored: self.events_stored.load(Ordering::Relaxed),
            events_duplicate: self.events_duplicate.load(Ordering::Relaxed),
            events_rejected: self.events_rejected.load(Ordering::Relaxed),
            events_deleted: self.events_deleted.load(Ordering::Relaxed),
            active_subscriptions: self.active_subscriptions.load(Ordering::Relaxed),
            subscription_requests: self.subscription_requests.load(Ordering::Relaxed),
            subscriptions_refused: self.subscriptions_refused.load(Ordering::Relaxed),
            live_events_delivered: self.live_events_delivered.load(Ordering::Relaxed),
            subscriptions_dropped_lagging: self
                .subscriptions_dropped_lagging
                .load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub active_connections: usize,
    pub events_received: u64,
    pub events_stored: u64,
    pub events_duplicate: u64,
    pub events_rejected: u64,
    pub events_deleted: u64,
    pub active_subscriptions: usize,
    pub subscription_requests: u64,
    pub subscriptions_refused: u64,
    pub live_events_delivered: u64,
    pub subscriptions_dropped_lagging: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

impl MetricsSnapshot {
    /// Share of received events that were stored (%)
    pub fn storage_success_rate(&self) -> f64 {
        if self.events_received == 0 {
            100.0
        } else {
            (self.events_stored as f64 / self.events_received as f64) * 100.0
        }
    }
}
