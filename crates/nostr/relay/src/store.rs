//! Indexed event store.
//!
//! Events live in memory behind a single `RwLock`: `put` and `delete` take
//! the write lock, queries take the read lock and copy out a snapshot of
//! `Arc<Event>` handles. Every accepted event gets a sequence number and is
//! announced on a broadcast channel in acceptance order, which is what live
//! subscriptions consume.

use crate::db::{Database, DatabaseConfig};
use crate::error::StoreError;
use parking_lot::RwLock;
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use vine_nostr::{
    Event, Filter, FilterMismatch, ReplaceKey, ReplaceablePolicy, check_event, compare_recency,
};

/// Capacity of the accepted-event broadcast channel.
pub const DEFAULT_ANNOUNCE_CAPACITY: usize = 4096;

/// Ephemeral ids remembered for duplicate detection.
const RECENT_EPHEMERAL_CAPACITY: usize = 1024;

/// Store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Per-kind replacement rules
    pub policy: ReplaceablePolicy,
    /// SQLite persistence; `None` keeps everything in memory
    pub database: Option<DatabaseConfig>,
    /// How many accepted events a live reader may fall behind
    pub announce_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            policy: ReplaceablePolicy::default(),
            database: DatabaseConfig::from_env(),
            announce_capacity: DEFAULT_ANNOUNCE_CAPACITY,
        }
    }
}

impl StoreConfig {
    /// In-memory store with default policy, ignoring the environment.
    pub fn in_memory() -> Self {
        Self {
            database: None,
            ..Default::default()
        }
    }
}

/// Result of [`EventStore::put`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    /// New event stored
    Stored,
    /// Same id already stored, or an ephemeral id announced recently
    Duplicate,
    /// Stored, superseding an older replaceable event
    Replaced { previous: String },
    /// A replaceable event at least as new already holds the slot
    StaleReplacement { current: String },
    /// Ephemeral kind: announced to live readers, not stored
    Ephemeral,
    /// The id was deleted by its author and is not accepted again
    Deleted,
}

impl StoreOutcome {
    /// Whether the event was announced to live readers.
    pub fn is_new(&self) -> bool {
        matches!(
            self,
            StoreOutcome::Stored | StoreOutcome::Replaced { .. } | StoreOutcome::Ephemeral
        )
    }
}

/// An accepted event together with its acceptance sequence number.
#[derive(Debug, Clone)]
pub struct AcceptedEvent {
    pub seq: u64,
    pub event: Arc<Event>,
}

#[derive(Default)]
struct Indexes {
    events: HashMap<String, Arc<Event>>,
    by_time: BTreeSet<(Reverse<u64>, String)>,
    by_author: HashMap<String, HashSet<String>>,
    by_kind: HashMap<u16, HashSet<String>>,
    by_tag: HashMap<(String, String), HashSet<String>>,
    replaceable: HashMap<ReplaceKey, String>,
    tombstones: HashSet<String>,
    recent_ephemeral: RecentIds,
    seq: u64,
}

/// Bounded set of ids, oldest evicted first.
#[derive(Default)]
struct RecentIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl RecentIds {
    /// Remember `id`. Returns false if it was already present.
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() >= RECENT_EPHEMERAL_CAPACITY
            && let Some(oldest) = self.order.pop_front()
        {
            self.ids.remove(&oldest);
        }
        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string());
        true
    }
}

impl Indexes {
    fn insert(&mut self, event: Arc<Event>, key: Option<ReplaceKey>) {
        let id = event.id.clone();

        self.by_time.insert((Reverse(event.created_at), id.clone()));
        self.by_author
            .entry(event.pubkey.clone())
            .or_default()
            .insert(id.clone());
        self.by_kind.entry(event.kind).or_default().insert(id.clone());
        for (name, value) in indexed_tags(&event) {
            self.by_tag
                .entry((name.to_string(), value.to_string()))
                .or_default()
                .insert(id.clone());
        }
        if let Some(key) = key {
            self.replaceable.insert(key, id.clone());
        }

        self.events.insert(id, event);
    }

    fn remove(&mut self, id: &str, policy: &ReplaceablePolicy) -> Option<Arc<Event>> {
        let event = self.events.remove(id)?;

        self.by_time.remove(&(Reverse(event.created_at), event.id.clone()));
        remove_from(&mut self.by_author, &event.pubkey, id);
        remove_from(&mut self.by_kind, &event.kind, id);
        for (name, value) in indexed_tags(&event) {
            remove_from(&mut self.by_tag, &(name.to_string(), value.to_string()), id);
        }
        if let Some(key) = policy.key_for(&event)
            && self.replaceable.get(&key).map(String::as_str) == Some(id)
        {
            self.replaceable.remove(&key);
        }

        Some(event)
    }

    /// Events that may match `filter`, newest first, from the narrowest index.
    fn candidates<'s>(&'s self, filter: &Filter) -> Vec<Arc<Event>> {
        if let Some(ids) = &filter.ids {
            let mut events: Vec<Arc<Event>> = ids
                .iter()
                .collect::<HashSet<_>>()
                .into_iter()
                .filter_map(|id| self.events.get(id).cloned())
                .collect();
            events.sort_by(|a, b| compare_recency(a, b));
            return events;
        }

        let mut narrowest: Option<HashSet<&'s String>> = None;
        let mut consider = |set: HashSet<&'s String>| {
            if narrowest.as_ref().is_none_or(|current| set.len() < current.len()) {
                narrowest = Some(set);
            }
        };

        for (name, values) in filter.tag_constraints() {
            consider(
                values
                    .iter()
                    .filter_map(|value| self.by_tag.get(&(name.to_string(), value.clone())))
                    .flatten()
                    .collect(),
            );
        }
        if let Some(authors) = &filter.authors {
            consider(
                authors
                    .iter()
                    .filter_map(|author| self.by_author.get(author))
                    .flatten()
                    .collect(),
            );
        }
        if let Some(kinds) = &filter.kinds {
            consider(
                kinds
                    .iter()
                    .filter_map(|kind| self.by_kind.get(kind))
                    .flatten()
                    .collect(),
            );
        }

        match narrowest {
            Some(ids) => {
                let mut events: Vec<Arc<Event>> = ids
                    .into_iter()
                    .filter_map(|id| self.events.get(id).cloned())
                    .collect();
                events.sort_by(|a, b| compare_recency(a, b));
                events
            }
            None => self
                .by_time
                .iter()
                .filter_map(|(_, id)| self.events.get(id).cloned())
                .collect(),
        }
    }
}

fn indexed_tags(event: &Event) -> impl Iterator<Item = (&str, &str)> {
    event.tags.iter().filter_map(|tag| match tag.as_slice() {
        [name, value, ..] if name.len() == 1 => Some((name.as_str(), value.as_str())),
        _ => None,
    })
}

fn remove_from<K: std::hash::Hash + Eq>(
    index: &mut HashMap<K, HashSet<String>>,
    key: &K,
    id: &str,
) {
    if let Some(ids) = index.get_mut(key) {
        ids.remove(id);
        if ids.is_empty() {
            index.remove(key);
        }
    }
}

/// Lazy, finite, restartable view over a store snapshot.
///
/// Matching happens as the iterator advances. Cloning or calling
/// [`Query::restart`] replays the same snapshot.
#[derive(Debug, Clone)]
pub struct Query {
    candidates: Arc<[Arc<Event>]>,
    filter: Filter,
    position: usize,
    yielded: usize,
}

impl Query {
    fn new(candidates: Vec<Arc<Event>>, filter: Filter) -> Self {
        Self {
            candidates: candidates.into(),
            filter,
            position: 0,
            yielded: 0,
        }
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    /// Rewind to the first result of the same snapshot.
    pub fn restart(&mut self) {
        self.position = 0;
        self.yielded = 0;
    }

    /// Collect owned copies of the remaining results.
    pub fn into_events(self) -> Vec<Event> {
        self.map(|event| Event::clone(&event)).collect()
    }
}

impl Iterator for Query {
    type Item = Arc<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.filter.limit.is_some_and(|limit| self.yielded >= limit) {
            return None;
        }

        while let Some(event) = self.candidates.get(self.position) {
            self.position += 1;
            if self.filter.matches(event) {
                self.yielded += 1;
                return Some(Arc::clone(event));
            }
        }

        None
    }
}

/// Queries for several filters taken under one read lock.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub queries: Vec<Query>,
    /// Sequence number of the newest event visible in the snapshot
    pub watermark: u64,
}

/// The event store
pub struct EventStore {
    inner: RwLock<Indexes>,
    policy: ReplaceablePolicy,
    database: Option<Database>,
    accepted_tx: broadcast::Sender<AcceptedEvent>,
}

impl EventStore {
    /// Open a store, reloading persisted events when a database is configured.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let (accepted_tx, _) = broadcast::channel(config.announce_capacity.max(1));
        let mut inner = Indexes::default();

        let database = match config.database {
            Some(db_config) => {
                let db = Database::new(db_config)?;
                inner.tombstones.extend(db.load_tombstones()?);

                for event in db.load_events()? {
                    let key = config.policy.key_for(&event);
                    if let Some(key) = &key
                        && let Some(current) = inner.replaceable.get(key).cloned()
                    {
                        let newer = inner
                            .events
                            .get(&current)
                            .is_some_and(|held| held.created_at >= event.created_at);
                        if newer {
                            continue;
                        }
                        inner.remove(&current, &config.policy);
                    }
                    inner.insert(Arc::new(event), key);
                }

                let persisted = db.count_events()?;
                let loaded = inner.events.len();
                if persisted != loaded as i64 {
                    warn!(
                        "Database holds {} events, {} kept under the current replacement policy",
                        persisted, loaded
                    );
                }
                info!("Loaded {} events from {:?}", loaded, db.path());
                Some(db)
            }
            None => None,
        };

        Ok(Self {
            inner: RwLock::new(inner),
            policy: config.policy,
            database,
            accepted_tx,
        })
    }

    /// In-memory store with the default replacement policy.
    pub fn in_memory() -> Self {
        let (accepted_tx, _) = broadcast::channel(DEFAULT_ANNOUNCE_CAPACITY);
        Self {
            inner: RwLock::new(Indexes::default()),
            policy: ReplaceablePolicy::default(),
            database: None,
            accepted_tx,
        }
    }

    pub fn policy(&self) -> &ReplaceablePolicy {
        &self.policy
    }

    /// Validate and store an event.
    pub fn put(&self, event: Event) -> Result<StoreOutcome, StoreError> {
        check_event(&event)?;

        let mut inner = self.inner.write();

        if inner.tombstones.contains(&event.id) {
            debug!("Refusing deleted event {}", event.id);
            return Ok(StoreOutcome::Deleted);
        }
        if inner.events.contains_key(&event.id) {
            return Ok(StoreOutcome::Duplicate);
        }

        if self.policy.is_ephemeral(event.kind) {
            if !inner.recent_ephemeral.insert(&event.id) {
                return Ok(StoreOutcome::Duplicate);
            }
            self.announce(&mut inner, Arc::new(event));
            return Ok(StoreOutcome::Ephemeral);
        }

        let key = self.policy.key_for(&event);
        let mut previous = None;
        if let Some(key) = &key
            && let Some(current_id) = inner.replaceable.get(key)
        {
            let current_is_newer = inner
                .events
                .get(current_id)
                .is_some_and(|current| current.created_at >= event.created_at);
            if current_is_newer {
                return Ok(StoreOutcome::StaleReplacement {
                    current: current_id.clone(),
                });
            }
            previous = Some(current_id.clone());
        }

        if let Some(db) = &self.database {
            db.replace_event(&event, previous.as_deref())?;
        }

        if let Some(previous) = &previous {
            inner.remove(previous, &self.policy);
            debug!("Event {} replaces {}", event.id, previous);
        }

        let event = Arc::new(event);
        inner.insert(Arc::clone(&event), key);
        self.announce(&mut inner, event);

        Ok(match previous {
            Some(previous) => StoreOutcome::Replaced { previous },
            None => StoreOutcome::Stored,
        })
    }

    fn announce(&self, inner: &mut Indexes, event: Arc<Event>) {
        inner.seq += 1;
        // No receivers is fine: nobody is subscribed yet.
        let _ = self.accepted_tx.send(AcceptedEvent {
            seq: inner.seq,
            event,
        });
    }

    /// Matching events, newest first, capped at the filter's limit.
    pub fn query(&self, filter: &Filter) -> Query {
        let inner = self.inner.read();
        Query::new(inner.candidates(filter), filter.clone())
    }

    /// Queries for every filter plus the sequence number they reflect.
    pub fn snapshot(&self, filters: &[Filter]) -> Snapshot {
        let inner = self.inner.read();
        Snapshot {
            queries: filters
                .iter()
                .map(|filter| Query::new(inner.candidates(filter), filter.clone()))
                .collect(),
            watermark: inner.seq,
        }
    }

    /// Remove an event. Only its author may do so.
    pub fn delete(&self, event_id: &str, requestor: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write();

        let event = inner
            .events
            .get(event_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(event_id.to_string()))?;

        if event.pubkey != requestor {
            warn!("Rejected delete of {} by non-author {}", event_id, requestor);
            return Err(StoreError::Unauthorized {
                event_id: event_id.to_string(),
                requestor: requestor.to_string(),
            });
        }

        if let Some(db) = &self.database {
            db.delete_event(event_id)?;
        }

        inner.remove(event_id, &self.policy);
        inner.tombstones.insert(event_id.to_string());
        debug!("Deleted event {}", event_id);
        Ok(())
    }

    pub fn get(&self, event_id: &str) -> Option<Arc<Event>> {
        self.inner.read().events.get(event_id).cloned()
    }

    /// Number of stored events matching `filter`, ignoring its limit.
    pub fn count(&self, filter: &Filter) -> usize {
        let inner = self.inner.read();
        inner
            .candidates(filter)
            .iter()
            .filter(|event| filter.matches(event))
            .count()
    }

    /// Why a stored event does or does not match `filter`.
    pub fn explain(
        &self,
        filter: &Filter,
        event_id: &str,
    ) -> Result<Option<FilterMismatch>, StoreError> {
        let event = self
            .get(event_id)
            .ok_or_else(|| StoreError::NotFound(event_id.to_string()))?;
        let mismatch = filter.mismatch(&event);
        if let Some(reason) = &mismatch {
            debug!("Event {} excluded by filter: {}", event_id, reason);
        }
        Ok(mismatch)
    }

    pub fn len(&self) -> usize {
        self.inner.read().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sequence number of the last accepted event.
    pub fn current_seq(&self) -> u64 {
        self.inner.read().seq
    }

    /// Receive every event accepted from now on, in acceptance order.
    pub fn subscribe_accepted(&self) -> broadcast::Receiver<AcceptedEvent> {
        self.accepted_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use vine_nostr::{
        EventTemplate, KIND_METADATA, KIND_SHORT_TEXT_NOTE, KIND_VIDEO, Retention,
        finalize_event, generate_secret_key,
    };

    fn event(sk: &[u8; 32], kind: u16, tags: Vec<Vec<String>>, created_at: u64) -> Event {
        let template = EventTemplate {
            kind,
            tags,
            content: format!("content at {}", created_at),
            created_at,
        };
        finalize_event(&template, sk).unwrap()
    }

    fn d_tag(value: &str) -> Vec<Vec<String>> {
        vec![vec!["d".to_string(), value.to_string()]]
    }

    // =========================================================================
    // put
    // =========================================================================

    #[test]
    fn test_put_then_query_by_id() {
        let store = EventStore::in_memory();
        let e = event(&generate_secret_key(), KIND_SHORT_TEXT_NOTE, vec![], 10);

        assert_eq!(store.put(e.clone()).unwrap(), StoreOutcome::Stored);

        let found = store.query(&Filter::new().ids([e.id.clone()])).into_events();
        assert_eq!(found, vec![e]);
    }

    #[test]
    fn test_duplicate_put_leaves_store_unchanged() {
        let store = EventStore::in_memory();
        let e = event(&generate_secret_key(), KIND_SHORT_TEXT_NOTE, vec![], 10);

        store.put(e.clone()).unwrap();
        assert_eq!(store.put(e).unwrap(), StoreOutcome::Duplicate);
        assert_eq!(store.len(), 1);
        assert_eq!(store.current_seq(), 1);
    }

    #[test]
    fn test_put_rejects_invalid_events() {
        let store = EventStore::in_memory();
        let mut e = event(&generate_secret_key(), KIND_SHORT_TEXT_NOTE, vec![], 10);
        e.content = "tampered".to_string();

        let err = store.put(e).unwrap_err();
        assert!(err.is_validation());
        assert!(store.is_empty());
    }

    #[test]
    fn test_replaceable_keeps_newest() {
        let store = EventStore::in_memory();
        let sk = generate_secret_key();
        let old = event(&sk, KIND_METADATA, vec![], 100);
        let new = event(&sk, KIND_METADATA, vec![], 200);

        store.put(old.clone()).unwrap();
        assert_eq!(
            store.put(new.clone()).unwrap(),
            StoreOutcome::Replaced {
                previous: old.id.clone()
            }
        );
        assert_eq!(
            store.put(old.clone()).unwrap(),
            StoreOutcome::StaleReplacement {
                current: new.id.clone()
            }
        );

        let held = store.query(&Filter::new().kinds([KIND_METADATA])).into_events();
        assert_eq!(held, vec![new]);
    }

    #[test]
    fn test_replaceable_convergence_is_order_independent() {
        let sk = generate_secret_key();
        let older = event(&sk, KIND_VIDEO, d_tag("vine_1"), 100);
        let newer = event(&sk, KIND_VIDEO, d_tag("vine_1"), 101);

        let a = EventStore::in_memory();
        a.put(older.clone()).unwrap();
        a.put(newer.clone()).unwrap();

        let b = EventStore::in_memory();
        b.put(newer.clone()).unwrap();
        b.put(older).unwrap();

        let filter = Filter::new().kinds([KIND_VIDEO]);
        assert_eq!(a.query(&filter).into_events(), vec![newer.clone()]);
        assert_eq!(b.query(&filter).into_events(), vec![newer]);
    }

    #[test]
    fn test_addressable_slots_differ_by_d_tag() {
        let store = EventStore::in_memory();
        let sk = generate_secret_key();

        store.put(event(&sk, KIND_VIDEO, d_tag("vine_1"), 100)).unwrap();
        store.put(event(&sk, KIND_VIDEO, d_tag("vine_2"), 100)).unwrap();

        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_policy_override_disables_replacement() {
        let config = StoreConfig {
            policy: ReplaceablePolicy::new().with_override(KIND_VIDEO, Retention::Regular),
            ..StoreConfig::in_memory()
        };
        let store = EventStore::open(config).unwrap();
        let sk = generate_secret_key();

        store.put(event(&sk, KIND_VIDEO, d_tag("vine_1"), 100)).unwrap();
        store.put(event(&sk, KIND_VIDEO, d_tag("vine_1"), 200)).unwrap();

        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_ephemeral_events_are_announced_not_stored() {
        let store = EventStore::in_memory();
        let mut accepted = store.subscribe_accepted();
        let e = event(&generate_secret_key(), 20001, vec![], 10);

        assert_eq!(store.put(e.clone()).unwrap(), StoreOutcome::Ephemeral);
        assert!(store.is_empty());
        assert_eq!(accepted.try_recv().unwrap().event.id, e.id);
    }

    #[test]
    fn test_republished_ephemeral_event_is_announced_once() {
        let store = EventStore::in_memory();
        let mut accepted = store.subscribe_accepted();
        let e = event(&generate_secret_key(), 20001, vec![], 10);

        assert_eq!(store.put(e.clone()).unwrap(), StoreOutcome::Ephemeral);
        assert_eq!(store.put(e.clone()).unwrap(), StoreOutcome::Duplicate);
        assert_eq!(accepted.try_recv().unwrap().event.id, e.id);
        assert!(accepted.try_recv().is_err());
        assert_eq!(store.current_seq(), 1);
    }

    #[test]
    fn test_recent_ids_evict_oldest() {
        let mut recent = RecentIds::default();
        for n in 0..RECENT_EPHEMERAL_CAPACITY {
            assert!(recent.insert(&n.to_string()));
        }
        assert!(!recent.insert("0"));
        assert!(recent.insert("overflow"));
        assert!(recent.insert("0"));
        assert_eq!(recent.order.len(), RECENT_EPHEMERAL_CAPACITY);
    }

    // =========================================================================
    // query
    // =========================================================================

    #[test]
    fn test_query_orders_newest_first_and_applies_limit() {
        let store = EventStore::in_memory();
        let sk = generate_secret_key();
        for ts in [30, 10, 50, 20, 40] {
            store.put(event(&sk, KIND_SHORT_TEXT_NOTE, vec![], ts)).unwrap();
        }

        let times: Vec<u64> = store
            .query(&Filter::new().kinds([KIND_SHORT_TEXT_NOTE]).limit(3))
            .map(|e| e.created_at)
            .collect();
        assert_eq!(times, vec![50, 40, 30]);

        assert_eq!(store.query(&Filter::new().limit(0)).count(), 0);
    }

    #[test]
    fn test_query_is_restartable_snapshot() {
        let store = EventStore::in_memory();
        let sk = generate_secret_key();
        store.put(event(&sk, KIND_SHORT_TEXT_NOTE, vec![], 1)).unwrap();

        let mut query = store.query(&Filter::new());
        store.put(event(&sk, KIND_SHORT_TEXT_NOTE, vec![], 2)).unwrap();

        assert_eq!(query.by_ref().count(), 1);
        assert_eq!(query.next(), None);
        query.restart();
        assert_eq!(query.count(), 1);
    }

    #[test]
    fn test_query_is_sound_and_complete() {
        let store = EventStore::in_memory();
        let alice = generate_secret_key();
        let bob = generate_secret_key();
        let mut all = Vec::new();
        for (i, sk) in [&alice, &bob, &alice, &bob].into_iter().enumerate() {
            let tags = vec![vec!["t".to_string(), if i % 2 == 0 { "cats" } else { "dogs" }.to_string()]];
            let e = event(sk, KIND_SHORT_TEXT_NOTE, tags, 100 + i as u64);
            store.put(e.clone()).unwrap();
            all.push(e);
        }

        let filter = Filter::new().hashtags(["cats"]).since(101);
        let results = store.query(&filter).into_events();

        assert!(results.iter().all(|e| filter.matches(e)));
        let expected = all.iter().filter(|e| filter.matches(e)).count();
        assert_eq!(results.len(), expected);
        assert_eq!(store.count(&filter), expected);
    }

    #[test]
    fn test_explain_names_failing_constraint() {
        let store = EventStore::in_memory();
        let e = event(&generate_secret_key(), KIND_SHORT_TEXT_NOTE, vec![], 10);
        store.put(e.clone()).unwrap();

        assert_eq!(
            store.explain(&Filter::new().kinds([KIND_VIDEO]), &e.id).unwrap(),
            Some(FilterMismatch::Kind {
                kind: KIND_SHORT_TEXT_NOTE
            })
        );
        assert_eq!(store.explain(&Filter::new(), &e.id).unwrap(), None);
        assert!(matches!(
            store.explain(&Filter::new(), "missing"),
            Err(StoreError::NotFound(_))
        ));
    }

    // =========================================================================
    // delete
    // =========================================================================

    #[test]
    fn test_delete_requires_author() {
        let store = EventStore::in_memory();
        let sk = generate_secret_key();
        let e = event(&sk, KIND_SHORT_TEXT_NOTE, vec![], 10);
        store.put(e.clone()).unwrap();

        let stranger = "ab".repeat(32);
        assert!(matches!(
            store.delete(&e.id, &stranger),
            Err(StoreError::Unauthorized { .. })
        ));
        assert_eq!(store.len(), 1);

        store.delete(&e.id, &e.pubkey).unwrap();
        assert!(store.get(&e.id).is_none());
        assert_eq!(store.put(e).unwrap(), StoreOutcome::Deleted);
    }

    #[test]
    fn test_delete_unknown_is_not_found() {
        let store = EventStore::in_memory();
        assert!(matches!(
            store.delete("missing", "someone"),
            Err(StoreError::NotFound(_))
        ));
    }

    // =========================================================================
    // persistence
    // =========================================================================

    #[test]
    fn test_events_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            database: Some(DatabaseConfig::at(dir.path().join("store.db"))),
            ..StoreConfig::in_memory()
        };
        let sk = generate_secret_key();
        let kept = event(&sk, KIND_VIDEO, d_tag("vine_1"), 200);
        let deleted = event(&sk, KIND_SHORT_TEXT_NOTE, vec![], 50);

        {
            let store = EventStore::open(config.clone()).unwrap();
            store.put(event(&sk, KIND_VIDEO, d_tag("vine_1"), 100)).unwrap();
            store.put(kept.clone()).unwrap();
            store.put(deleted.clone()).unwrap();
            store.delete(&deleted.id, &deleted.pubkey).unwrap();
        }

        let store = EventStore::open(config).unwrap();
        assert_eq!(store.query(&Filter::new()).into_events(), vec![kept]);
        assert_eq!(store.put(deleted).unwrap(), StoreOutcome::Deleted);
    }
}
