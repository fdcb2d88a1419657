//! Feed subscription multiplexer
//!
//! Feeds asking for the same events share one subscription on the embedded
//! relay. Filters that differ only in `limit` land in the same group; the
//! group holds a single live `REQ` (with `limit: 0`, so it carries no
//! backfill of its own) and fans incoming events out to its members.
//!
//! Every member still sees the stream it asked for:
//!
//! 1. its own backfill, read from a store snapshot taken by the group loop
//!    after the shared subscription went live,
//! 2. [`FeedEvent::EndOfStoredEvents`],
//! 3. live events matching its filter, minus any already in its backfill.
//!
//! Members are counted under the manager's lock so that the last one out
//! removes the group before anyone can join it again. A member that cannot
//! keep up is detached and flagged instead of slowing the group down.

use crate::error::{ClientError, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use vine_nostr::{ClientMessage, Event, Filter, RelayMessage};
use vine_relay::{EmbeddedRelay, RelaySession};

/// Default per-member live buffer
pub const DEFAULT_SUBSCRIPTION_BUFFER: usize = 1024;

/// Item delivered to a feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    Event(Event),
    /// Backfill is complete; everything after this is live
    EndOfStoredEvents,
    /// The relay ended the subscription
    Closed(String),
}

enum GroupCommand {
    Join {
        member_id: u64,
        filter: Filter,
        overflowed: Arc<AtomicBool>,
        ack: oneshot::Sender<mpsc::Receiver<FeedEvent>>,
    },
    Leave {
        member_id: u64,
        last: bool,
        ack: Option<oneshot::Sender<()>>,
    },
}

struct GroupEntry {
    group_id: u64,
    commands: mpsc::UnboundedSender<GroupCommand>,
    members: usize,
}

type Groups = Arc<Mutex<HashMap<String, GroupEntry>>>;

/// Coalesces feed subscriptions onto the embedded relay.
pub struct SubscriptionManager {
    relay: EmbeddedRelay,
    groups: Groups,
    buffer: usize,
    next_id: AtomicU64,
}

impl SubscriptionManager {
    pub fn new(relay: EmbeddedRelay, buffer: usize) -> Self {
        Self {
            relay,
            groups: Arc::default(),
            buffer: buffer.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe a feed. Returns once the member's backfill and
    /// `EndOfStoredEvents` are queued on the handle.
    pub async fn subscribe(
        &self,
        feed_key: impl Into<String>,
        filter: Filter,
    ) -> Result<SubscriptionHandle> {
        filter.validate()?;
        let feed_key = feed_key.into();
        let key = filter.coalesce_key();
        let member_id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let (group_id, commands) = {
            let mut groups = self.groups.lock();
            match groups.get_mut(&key) {
                Some(entry) => {
                    entry.members += 1;
                    (entry.group_id, entry.commands.clone())
                }
                None => {
                    let group_id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let (commands, commands_rx) = mpsc::unbounded_channel();
                    let group = FeedGroup {
                        group_id,
                        key: key.clone(),
                        relay: self.relay.clone(),
                        groups: Arc::clone(&self.groups),
                        buffer: self.buffer,
                        members: HashMap::new(),
                    };
                    tokio::spawn(group.run(relay_filter(&filter), commands_rx));
                    groups.insert(
                        key.clone(),
                        GroupEntry {
                            group_id,
                            commands: commands.clone(),
                            members: 1,
                        },
                    );
                    info!("Opened feed group {} for {}", group_id, feed_key);
                    (group_id, commands)
                }
            }
        };

        let link = GroupLink {
            key,
            group_id,
            commands,
            groups: Arc::clone(&self.groups),
        };

        let overflowed = Arc::new(AtomicBool::new(false));
        let (ack, ready) = oneshot::channel();
        // Gives the member back if the join fails or this future is dropped.
        let mut pending = PendingJoin {
            link: &link,
            member_id,
            armed: true,
        };
        let _ = link.commands.send(GroupCommand::Join {
            member_id,
            filter: filter.clone(),
            overflowed: Arc::clone(&overflowed),
            ack,
        });
        let receiver = ready
            .await
            .map_err(|_| ClientError::SubscriptionClosed("feed group ended".to_string()))?;
        pending.armed = false;
        drop(pending);

        debug!("Feed {} joined group {} as {}", feed_key, group_id, member_id);
        Ok(SubscriptionHandle {
            id: member_id,
            feed_key,
            filter,
            receiver,
            overflowed,
            link,
            closed: false,
        })
    }

    /// Live members across all groups.
    pub fn subscription_count(&self) -> usize {
        self.groups.lock().values().map(|entry| entry.members).sum()
    }

    /// Shared relay subscriptions currently open.
    pub fn group_count(&self) -> usize {
        self.groups.lock().len()
    }
}

/// The filter the shared relay subscription uses.
fn relay_filter(filter: &Filter) -> Filter {
    let mut shared = filter.clone();
    shared.limit = Some(0);
    shared
}

/// A member's reference to its group.
struct GroupLink {
    key: String,
    group_id: u64,
    commands: mpsc::UnboundedSender<GroupCommand>,
    groups: Groups,
}

impl GroupLink {
    /// Drop one member from the count and tell the group.
    fn leave(&self, member_id: u64, ack: Option<oneshot::Sender<()>>) {
        let last = {
            let mut groups = self.groups.lock();
            match groups.get_mut(&self.key) {
                Some(entry) if entry.group_id == self.group_id => {
                    entry.members = entry.members.saturating_sub(1);
                    let last = entry.members == 0;
                    if last {
                        groups.remove(&self.key);
                    }
                    last
                }
                _ => false,
            }
        };
        let _ = self.commands.send(GroupCommand::Leave {
            member_id,
            last,
            ack,
        });
    }
}

struct PendingJoin<'a> {
    link: &'a GroupLink,
    member_id: u64,
    armed: bool,
}

impl Drop for PendingJoin<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.link.leave(self.member_id, None);
        }
    }
}

/// One feed's view of a shared subscription.
///
/// Dropping the handle unsubscribes without waiting; [`close`](Self::close)
/// waits until the group has detached the member.
pub struct SubscriptionHandle {
    id: u64,
    feed_key: String,
    filter: Filter,
    receiver: mpsc::Receiver<FeedEvent>,
    overflowed: Arc<AtomicBool>,
    link: GroupLink,
    closed: bool,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn feed_key(&self) -> &str {
        &self.feed_key
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    /// Next item; `None` once the member is detached and drained.
    pub async fn recv(&mut self) -> Option<FeedEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<FeedEvent> {
        self.receiver.try_recv().ok()
    }

    /// Whether the member fell behind and was detached.
    pub fn is_overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }

    /// Unsubscribe. Nothing is delivered to this member after it returns.
    pub async fn close(mut self) {
        self.closed = true;
        let (ack, done) = oneshot::channel();
        self.link.leave(self.id, Some(ack));
        // The group may already be gone, which detaches the member too.
        let _ = done.await;
        debug!("Feed {} closed", self.feed_key);
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if !self.closed {
            self.link.leave(self.id, None);
        }
    }
}

struct Member {
    filter: Filter,
    backfill: HashSet<String>,
    sender: mpsc::Sender<FeedEvent>,
    overflowed: Arc<AtomicBool>,
}

/// The loop behind one shared subscription.
struct FeedGroup {
    group_id: u64,
    key: String,
    relay: EmbeddedRelay,
    groups: Groups,
    buffer: usize,
    members: HashMap<u64, Member>,
}

impl FeedGroup {
    async fn run(mut self, filter: Filter, mut commands: mpsc::UnboundedReceiver<GroupCommand>) {
        let mut session = self.relay.connect();
        let subscription_id = format!("feed-{}", uuid::Uuid::new_v4().simple());

        let opened = session
            .send(ClientMessage::Req {
                subscription_id: subscription_id.clone(),
                filters: vec![filter],
            })
            .await;
        let mut ended = match opened {
            Ok(()) => wait_for_eose(&mut session).await.err(),
            Err(e) => Some(format!("error: {}", e)),
        };

        if let Some(reason) = &ended {
            warn!("Feed group {} failed to open: {}", self.group_id, reason);
            self.forget();
        }

        while ended.is_none() {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(GroupCommand::Join { member_id, filter, overflowed, ack }) => {
                        self.join(member_id, filter, overflowed, ack);
                    }
                    Some(GroupCommand::Leave { member_id, last, ack }) => {
                        self.members.remove(&member_id);
                        if let Some(ack) = ack {
                            let _ = ack.send(());
                        }
                        if last {
                            break;
                        }
                    }
                    None => break,
                },

                message = session.recv() => match message {
                    Some(RelayMessage::Event { event, .. }) => self.dispatch(event),
                    Some(RelayMessage::Closed { message, .. }) => {
                        ended = Some(message);
                    }
                    Some(_) => {}
                    None => ended = Some("error: relay session ended".to_string()),
                },
            }
        }

        if let Some(reason) = ended {
            warn!("Feed group {} closed by relay: {}", self.group_id, reason);
            self.forget();
            for member in self.members.values() {
                let _ = member.sender.try_send(FeedEvent::Closed(reason.clone()));
            }
            self.members.clear();
            // Answer anyone still waiting on this group before it goes away.
            commands.close();
            while let Ok(command) = commands.try_recv() {
                if let GroupCommand::Leave { ack: Some(ack), .. } = command {
                    let _ = ack.send(());
                }
            }
        } else if let Err(e) = session.close_subscription(&subscription_id).await {
            debug!("Failed to close feed subscription {}: {}", subscription_id, e);
        }

        session.shutdown().await;
        debug!("Feed group {} stopped", self.group_id);
    }

    fn join(
        &mut self,
        member_id: u64,
        filter: Filter,
        overflowed: Arc<AtomicBool>,
        ack: oneshot::Sender<mpsc::Receiver<FeedEvent>>,
    ) {
        let backfill = self.relay.store().query(&filter).into_events();
        let (sender, receiver) = mpsc::channel(backfill.len() + self.buffer + 1);

        let backfill_ids = backfill.iter().map(|event| event.id.clone()).collect();
        for event in backfill {
            let _ = sender.try_send(FeedEvent::Event(event));
        }
        let _ = sender.try_send(FeedEvent::EndOfStoredEvents);

        if ack.send(receiver).is_ok() {
            self.members.insert(
                member_id,
                Member {
                    filter,
                    backfill: backfill_ids,
                    sender,
                    overflowed,
                },
            );
        }
    }

    fn dispatch(&mut self, event: Event) {
        let mut detached = Vec::new();
        for (id, member) in &self.members {
            if !member.filter.matches(&event) || member.backfill.contains(&event.id) {
                continue;
            }
            match member.sender.try_send(FeedEvent::Event(event.clone())) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Feed member {} fell behind, detaching", id);
                    member.overflowed.store(true, Ordering::Release);
                    detached.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => detached.push(*id),
            }
        }
        for id in detached {
            self.members.remove(&id);
        }
    }

    /// Remove this group from the manager if it is still registered.
    fn forget(&self) {
        let mut groups = self.groups.lock();
        if groups
            .get(&self.key)
            .is_some_and(|entry| entry.group_id == self.group_id)
        {
            groups.remove(&self.key);
        }
    }
}

async fn wait_for_eose(session: &mut RelaySession) -> std::result::Result<(), String> {
    loop {
        match session.recv().await {
            Some(RelayMessage::Eose { .. }) => return Ok(()),
            Some(RelayMessage::Closed { message, .. }) => return Err(message),
            Some(_) => {}
            None => return Err("error: relay session ended".to_string()),
        }
    }
}
