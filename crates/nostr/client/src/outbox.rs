//! Offline outbox
//!
//! Holds events that did not reach a relay, one entry per `(event, relay)`
//! pair, and schedules their retries with exponential backoff. The retry
//! worker drains due entries, tries them again and reports back through
//! [`Outbox::mark_succeeded`] or [`Outbox::mark_failed`].
//!
//! Entry lifecycle:
//!
//! ```text
//! enqueue ──▶ Pending ──drain_due──▶ InFlight ──▶ Succeeded (removed)
//!                ▲                      │
//!                ├──── mark_failed ─────┤
//!                └──── defer ───────────┤
//!                                       └──▶ PermanentlyFailed (removed,
//!                                            announced on the failure channel)
//! ```
//!
//! `attempt_count` counts sends that reached a relay and failed. Entries
//! whose relay is offline are deferred without using up attempts, and go
//! out again once the relay connects.
//!
//! With a database path configured, every change is written to SQLite
//! before it is applied in memory and entries reload on open. Entries that
//! were in flight when the process stopped come back as `Pending`.

use crate::error::Result;
use crate::recovery::BackoffPolicy;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use vine_nostr::{Clock, Event};

/// Environment variable naming the outbox database file
pub const OUTBOX_DB_PATH_ENV: &str = "VINE_OUTBOX_DB_PATH";

const FAILURE_CHANNEL_CAPACITY: usize = 256;

/// Delivery state of an outbox entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutboxState {
    Pending,
    InFlight,
    Succeeded,
    PermanentlyFailed,
}

impl OutboxState {
    fn as_str(&self) -> &'static str {
        match self {
            OutboxState::Pending => "pending",
            OutboxState::InFlight => "in_flight",
            OutboxState::Succeeded => "succeeded",
            OutboxState::PermanentlyFailed => "permanently_failed",
        }
    }
}

/// One event waiting for one relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntry {
    pub event: Event,
    pub relay_url: String,
    /// Failed sends so far, the original broadcast included
    pub attempt_count: u32,
    /// Clock milliseconds before which the entry is not retried
    pub next_retry_at: u64,
    pub last_error: String,
    pub state: OutboxState,
}

impl OutboxEntry {
    pub fn event_id(&self) -> &str {
        &self.event.id
    }
}

/// An entry the outbox gave up on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermanentFailure {
    pub event_id: String,
    pub relay_url: String,
    pub attempts: u32,
    pub reason: String,
}

/// Configuration for the outbox
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Cap on the retry delay
    pub max_delay: Duration,
    /// Attempts before an entry fails permanently
    pub max_attempts: u32,
    /// SQLite file; `None` keeps the outbox in memory
    pub db_path: Option<PathBuf>,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 10,
            db_path: None,
        }
    }
}

impl OutboxConfig {
    /// Delay before retry number `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        BackoffPolicy::new(self.base_delay, self.max_delay).delay(attempt)
    }
}

type EntryKey = (String, String);

fn key(event_id: &str, relay_url: &str) -> EntryKey {
    (event_id.to_string(), relay_url.to_string())
}

/// Durable retry queue
pub struct Outbox {
    config: OutboxConfig,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<EntryKey, OutboxEntry>>,
    db: Option<Mutex<Connection>>,
    failures: broadcast::Sender<PermanentFailure>,
}

impl Outbox {
    /// Open the outbox, loading persisted entries when a database is configured.
    pub fn open(config: OutboxConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let mut entries = HashMap::new();
        let db = match &config.db_path {
            Some(path) => {
                let conn = Connection::open(path)?;
                init_schema(&conn)?;
                for entry in load_entries(&conn)? {
                    entries.insert(key(&entry.event.id, &entry.relay_url), entry);
                }
                info!(
                    "Outbox opened at {} with {} entries",
                    path.display(),
                    entries.len()
                );
                Some(Mutex::new(conn))
            }
            None => None,
        };

        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        Ok(Self {
            config,
            clock,
            entries: Mutex::new(entries),
            db,
            failures,
        })
    }

    /// In-memory outbox with default settings.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        Self {
            config: OutboxConfig::default(),
            clock,
            entries: Mutex::new(HashMap::new()),
            db: None,
            failures,
        }
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    /// Record a failed delivery of `event` to `relay_url`.
    ///
    /// A new entry counts the failed broadcast as its first attempt. An
    /// entry that already exists only has its error updated.
    pub fn enqueue(&self, event: &Event, relay_url: &str, error: &str) -> Result<()> {
        self.insert(event, relay_url, error, 1)
    }

    /// Queue `event` for a relay it was never sent to, e.g. because the
    /// relay was offline. No attempt is counted.
    pub fn enqueue_unsent(&self, event: &Event, relay_url: &str, reason: &str) -> Result<()> {
        self.insert(event, relay_url, reason, 0)
    }

    fn insert(&self, event: &Event, relay_url: &str, error: &str, attempts: u32) -> Result<()> {
        let mut entries = self.entries.lock();
        let entry_key = key(&event.id, relay_url);

        if let Some(existing) = entries.get_mut(&entry_key) {
            let mut updated = existing.clone();
            updated.last_error = error.to_string();
            self.persist(&updated)?;
            *existing = updated;
            return Ok(());
        }

        let entry = OutboxEntry {
            event: event.clone(),
            relay_url: relay_url.to_string(),
            attempt_count: attempts,
            next_retry_at: self.retry_time(1),
            last_error: error.to_string(),
            state: OutboxState::Pending,
        };
        self.persist(&entry)?;
        debug!(
            "Queued event {} for {}, retry at {}",
            event.id, relay_url, entry.next_retry_at
        );
        entries.insert(entry_key, entry);
        Ok(())
    }

    /// Move every due `Pending` entry to `InFlight` and return them, oldest
    /// schedule first.
    pub fn drain_due(&self) -> Vec<OutboxEntry> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock();

        let mut due: Vec<OutboxEntry> = entries
            .values_mut()
            .filter(|entry| entry.state == OutboxState::Pending && entry.next_retry_at <= now)
            .map(|entry| {
                entry.state = OutboxState::InFlight;
                entry.clone()
            })
            .collect();

        due.sort_by(|a, b| {
            a.next_retry_at
                .cmp(&b.next_retry_at)
                .then_with(|| a.event.id.cmp(&b.event.id))
                .then_with(|| a.relay_url.cmp(&b.relay_url))
        });
        due
    }

    /// The relay acknowledged the event. Returns the finished entry.
    pub fn mark_succeeded(&self, event_id: &str, relay_url: &str) -> Result<Option<OutboxEntry>> {
        let mut entries = self.entries.lock();
        let entry_key = key(event_id, relay_url);
        if !entries.contains_key(&entry_key) {
            return Ok(None);
        }

        self.unpersist(event_id, relay_url)?;
        Ok(entries.remove(&entry_key).map(|mut entry| {
            entry.state = OutboxState::Succeeded;
            debug!("Outbox delivered {} to {}", event_id, relay_url);
            entry
        }))
    }

    /// Another attempt failed. Reschedules the entry, or fails it
    /// permanently once `max_attempts` is reached. Returns the new state.
    pub fn mark_failed(
        &self,
        event_id: &str,
        relay_url: &str,
        error: &str,
    ) -> Result<Option<OutboxState>> {
        let exhausted = {
            let mut entries = self.entries.lock();
            let Some(existing) = entries.get_mut(&key(event_id, relay_url)) else {
                return Ok(None);
            };

            let mut updated = existing.clone();
            updated.attempt_count = updated.attempt_count.saturating_add(1);
            updated.last_error = error.to_string();

            if updated.attempt_count >= self.config.max_attempts {
                *existing = updated;
                true
            } else {
                updated.state = OutboxState::Pending;
                updated.next_retry_at = self.retry_time(updated.attempt_count);
                self.persist(&updated)?;
                debug!(
                    "Retry {} of {} to {} failed: {}",
                    updated.attempt_count, event_id, relay_url, error
                );
                *existing = updated;
                false
            }
        };

        if exhausted {
            self.mark_permanently_failed(event_id, relay_url, error)?;
            return Ok(Some(OutboxState::PermanentlyFailed));
        }
        Ok(Some(OutboxState::Pending))
    }

    /// The entry could not be sent because its relay is offline. Returns it
    /// to `Pending` with its attempt count unchanged.
    pub fn defer(&self, event_id: &str, relay_url: &str, reason: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        let Some(existing) = entries.get_mut(&key(event_id, relay_url)) else {
            return Ok(false);
        };

        let mut updated = existing.clone();
        updated.state = OutboxState::Pending;
        updated.last_error = reason.to_string();
        updated.next_retry_at = self.retry_time(updated.attempt_count.max(1));
        self.persist(&updated)?;
        *existing = updated;
        Ok(true)
    }

    /// Give up on an entry and announce it on the failure channel.
    pub fn mark_permanently_failed(
        &self,
        event_id: &str,
        relay_url: &str,
        reason: &str,
    ) -> Result<Option<PermanentFailure>> {
        let removed = {
            let mut entries = self.entries.lock();
            let entry_key = key(event_id, relay_url);
            if !entries.contains_key(&entry_key) {
                return Ok(None);
            }
            self.unpersist(event_id, relay_url)?;
            entries.remove(&entry_key)
        };

        Ok(removed.map(|entry| {
            let failure = PermanentFailure {
                event_id: event_id.to_string(),
                relay_url: relay_url.to_string(),
                attempts: entry.attempt_count,
                reason: reason.to_string(),
            };
            warn!(
                "Giving up on {} for {} after {} attempts: {}",
                event_id, relay_url, failure.attempts, reason
            );
            // No receivers is fine; the failure is still logged.
            let _ = self.failures.send(failure.clone());
            failure
        }))
    }

    /// Make every pending entry for `relay_url` due now. Returns how many.
    pub fn expedite(&self, relay_url: &str) -> usize {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock();
        let mut count = 0;
        for entry in entries.values_mut() {
            if entry.relay_url == relay_url
                && entry.state == OutboxState::Pending
                && entry.next_retry_at > now
            {
                entry.next_retry_at = now;
                count += 1;
            }
        }
        if count > 0 {
            debug!("Expedited {} outbox entries for {}", count, relay_url);
        }
        count
    }

    /// Entries not yet delivered or given up on.
    pub fn depth(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.depth() == 0
    }

    /// All current entries ordered by event id then relay.
    pub fn entries(&self) -> Vec<OutboxEntry> {
        let mut entries: Vec<_> = self.entries.lock().values().cloned().collect();
        entries.sort_by(|a, b| {
            a.event
                .id
                .cmp(&b.event.id)
                .then_with(|| a.relay_url.cmp(&b.relay_url))
        });
        entries
    }

    pub fn get(&self, event_id: &str, relay_url: &str) -> Option<OutboxEntry> {
        self.entries.lock().get(&key(event_id, relay_url)).cloned()
    }

    /// Receive every permanent failure from now on.
    pub fn subscribe_failures(&self) -> broadcast::Receiver<PermanentFailure> {
        self.failures.subscribe()
    }

    fn retry_time(&self, attempt: u32) -> u64 {
        let delay = self.config.delay_for(attempt).as_millis() as u64;
        self.clock.now_millis().saturating_add(delay)
    }

    fn persist(&self, entry: &OutboxEntry) -> Result<()> {
        let Some(db) = &self.db else {
            return Ok(());
        };
        let raw = serde_json::to_string(&entry.event)?;
        db.lock().execute(
            "INSERT OR REPLACE INTO outbox
                 (event_id, relay_url, raw_event, attempt_count, next_retry_at, last_error, state)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.event.id,
                entry.relay_url,
                raw,
                entry.attempt_count,
                entry.next_retry_at as i64,
                entry.last_error,
                entry.state.as_str(),
            ],
        )?;
        Ok(())
    }

    fn unpersist(&self, event_id: &str, relay_url: &str) -> Result<()> {
        if let Some(db) = &self.db {
            db.lock().execute(
                "DELETE FROM outbox WHERE event_id = ?1 AND relay_url = ?2",
                params![event_id, relay_url],
            )?;
        }
        Ok(())
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         CREATE TABLE IF NOT EXISTS outbox (
             event_id TEXT NOT NULL,
             relay_url TEXT NOT NULL,
             raw_event TEXT NOT NULL,
             attempt_count INTEGER NOT NULL,
             next_retry_at INTEGER NOT NULL,
             last_error TEXT NOT NULL,
             state TEXT NOT NULL,
             PRIMARY KEY (event_id, relay_url)
         );
         CREATE INDEX IF NOT EXISTS idx_outbox_relay ON outbox(relay_url);",
    )?;
    Ok(())
}

fn load_entries(conn: &Connection) -> Result<Vec<OutboxEntry>> {
    let mut stmt = conn.prepare(
        "SELECT relay_url, raw_event, attempt_count, next_retry_at, last_error
         FROM outbox",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, u32>(2)?,
            row.get::<_, i64>(3)?,
            row.get::<_, String>(4)?,
        ))
    })?;

    let mut entries = Vec::new();
    for row in rows {
        let (relay_url, raw, attempt_count, next_retry_at, last_error) = row?;
        match serde_json::from_str::<Event>(&raw) {
            Ok(event) => entries.push(OutboxEntry {
                event,
                relay_url,
                attempt_count,
                next_retry_at: next_retry_at.max(0) as u64,
                last_error,
                // In flight when the process stopped: try again
                state: OutboxState::Pending,
            }),
            Err(e) => warn!("Skipping unreadable outbox row for {}: {}", relay_url, e),
        }
    }
    Ok(entries)
}

/// Number of rows in an outbox database, for diagnostics.
pub fn persisted_depth(path: &std::path::Path) -> Result<usize> {
    let conn = Connection::open(path)?;
    let count: Option<i64> = conn
        .query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))
        .optional()?;
    Ok(count.unwrap_or(0).max(0) as usize)
}
