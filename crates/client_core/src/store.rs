//! Normalized, single-writer cache of remote entities.
//!
//! Every collection is keyed and merges incoming copies with a deterministic
//! join, so applying the same batch twice (or two batches in either order)
//! converges on the same content. Mutations publish a [`CacheKey`] on a
//! broadcast channel and mark the store dirty for the persistence flusher.

use std::{
    collections::{BTreeMap, HashMap},
    ops::RangeBounds,
    sync::atomic::{AtomicBool, AtomicI64, Ordering},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shared::domain::{
    CacheEntry, ChannelId, ChannelKey, FriendEdge, Member, Message, MessageId, MessageKey,
    Notification, NotificationId, Profile, Server, ServerId, UserId,
};
use tokio::sync::{broadcast, Notify};

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// A keyed record with a commutative merge.
pub trait Entity: Clone + PartialEq {
    type Key: Ord + Clone;

    fn key(&self) -> Self::Key;

    fn merge(existing: &Self, incoming: Self) -> Self;
}

impl Entity for Message {
    type Key = MessageKey;

    fn key(&self) -> MessageKey {
        MessageKey {
            channel: self.channel_key(),
            message_id: self.message_id,
        }
    }

    fn merge(existing: &Self, incoming: Self) -> Self {
        let rank = |m: &Message| (m.edited, m.timestamp_seconds, m.content.clone());
        if rank(&incoming) >= rank(existing) {
            incoming
        } else {
            existing.clone()
        }
    }
}

impl Entity for Notification {
    type Key = NotificationId;

    fn key(&self) -> NotificationId {
        self.notification_id
    }

    /// Newer copy wins; an equal copy keeps the read flag once it is set.
    fn merge(existing: &Self, incoming: Self) -> Self {
        match incoming.timestamp_seconds.cmp(&existing.timestamp_seconds) {
            std::cmp::Ordering::Greater => incoming,
            std::cmp::Ordering::Less => existing.clone(),
            std::cmp::Ordering::Equal => {
                let read = existing.read || incoming.read;
                let mut winner = if (&incoming.content, &incoming.author_name)
                    >= (&existing.content, &existing.author_name)
                {
                    incoming
                } else {
                    existing.clone()
                };
                winner.read = read;
                winner
            }
        }
    }
}

impl Entity for Profile {
    type Key = UserId;

    fn key(&self) -> UserId {
        self.user_id.clone()
    }

    fn merge(existing: &Self, incoming: Self) -> Self {
        let incoming_wins = incoming.synced_at_millis >= existing.synced_at_millis;
        let pick = |mine: &Option<String>, theirs: Option<String>| match (incoming_wins, theirs) {
            (true, Some(value)) => Some(value),
            (_, theirs) => mine.clone().or(theirs),
        };

        let mut friends: BTreeMap<(UserId, UserId), FriendEdge> = existing
            .friends
            .iter()
            .map(|edge| ((edge.user_a.clone(), edge.user_b.clone()), edge.clone()))
            .collect();
        for edge in incoming.friends {
            let pair = (edge.user_a.clone(), edge.user_b.clone());
            if incoming_wins || !friends.contains_key(&pair) {
                friends.insert(pair, edge);
            }
        }

        Profile {
            user_id: existing.user_id.clone(),
            username: pick(&existing.username, incoming.username),
            display_pfp_ref: pick(&existing.display_pfp_ref, incoming.display_pfp_ref),
            primary_name: pick(&existing.primary_name, incoming.primary_name),
            friends: friends.into_values().collect(),
            synced_at_millis: existing.synced_at_millis.max(incoming.synced_at_millis),
        }
    }
}

impl Entity for CacheEntry<Server> {
    type Key = ServerId;

    fn key(&self) -> ServerId {
        self.data.server_id.clone()
    }

    fn merge(existing: &Self, incoming: Self) -> Self {
        if incoming.fetched_at_millis >= existing.fetched_at_millis {
            incoming
        } else {
            existing.clone()
        }
    }
}

/// Member list of one server, cached apart from the server snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMembers {
    pub server_id: ServerId,
    pub members: Vec<Member>,
}

impl Entity for CacheEntry<ServerMembers> {
    type Key = ServerId;

    fn key(&self) -> ServerId {
        self.data.server_id.clone()
    }

    fn merge(existing: &Self, incoming: Self) -> Self {
        if incoming.fetched_at_millis >= existing.fetched_at_millis {
            incoming
        } else {
            existing.clone()
        }
    }
}

#[derive(Debug, Clone)]
pub struct Collection<E: Entity> {
    items: BTreeMap<E::Key, E>,
}

impl<E: Entity> Default for Collection<E> {
    fn default() -> Self {
        Self {
            items: BTreeMap::new(),
        }
    }
}

impl<E: Entity> Collection<E> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, key: &E::Key) -> Option<&E> {
        self.items.get(key)
    }

    pub fn contains(&self, key: &E::Key) -> bool {
        self.items.contains_key(key)
    }

    /// Merges one entity. Returns whether the stored value changed.
    pub fn upsert_one(&mut self, entity: E) -> bool {
        let key = entity.key();
        let next = match self.items.get(&key) {
            Some(existing) => E::merge(existing, entity),
            None => entity,
        };
        if self.items.get(&key) == Some(&next) {
            return false;
        }
        self.items.insert(key, next);
        true
    }

    /// Returns how many stored values changed.
    pub fn upsert_many(&mut self, entities: impl IntoIterator<Item = E>) -> usize {
        entities
            .into_iter()
            .filter(|entity| self.upsert_one(entity.clone()))
            .count()
    }

    /// Overwrites without merging. Used to roll back speculative edits.
    pub fn replace(&mut self, entity: E) -> Option<E> {
        self.items.insert(entity.key(), entity)
    }

    pub fn remove(&mut self, key: &E::Key) -> Option<E> {
        self.items.remove(key)
    }

    pub fn query(&self, predicate: impl Fn(&E) -> bool) -> Vec<E> {
        self.items.values().filter(|e| predicate(e)).cloned().collect()
    }

    pub fn range<R: RangeBounds<E::Key>>(&self, range: R) -> impl Iterator<Item = &E> {
        self.items.range(range).map(|(_, entity)| entity)
    }

    pub fn values(&self) -> impl Iterator<Item = &E> {
        self.items.values()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut E> {
        self.items.values_mut()
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&E) -> bool) {
        self.items.retain(|_, entity| keep(entity));
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

/// Cache keys observers can subscribe to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Messages(ChannelKey),
    Profile(UserId),
    Server(ServerId),
    Members(ServerId),
    JoinedServers,
    Notifications,
    Unread,
    /// Everything was dropped or swapped (identity change, snapshot restore).
    Reset,
}

impl CacheKey {
    fn affects_unread(&self) -> bool {
        matches!(self, Self::Notifications | Self::JoinedServers | Self::Reset)
    }
}

/// A filtered view of the change stream.
pub struct Subscription {
    key: CacheKey,
    rx: broadcast::Receiver<CacheKey>,
}

impl Subscription {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Waits for the next change to the subscribed key. Returns `false` once
    /// the store is gone. A lagged receiver reports a change, since one may
    /// have been skipped.
    pub async fn changed(&mut self) -> bool {
        loop {
            match self.rx.recv().await {
                Ok(key) if key == self.key || key == CacheKey::Reset => return true,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => return true,
                Err(broadcast::error::RecvError::Closed) => return false,
            }
        }
    }

    /// Drains pending changes without waiting.
    pub fn has_changed(&mut self) -> bool {
        let mut changed = false;
        loop {
            match self.rx.try_recv() {
                Ok(key) => changed |= key == self.key || key == CacheKey::Reset,
                Err(broadcast::error::TryRecvError::Lagged(_)) => changed = true,
                Err(_) => return changed,
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadCounts {
    pub total: usize,
    pub by_server: BTreeMap<ServerId, usize>,
    pub by_channel: BTreeMap<ChannelKey, usize>,
}

/// Unread projection: unread, addressed to `identity`, on a joined server.
/// An unknown joined list counts nothing.
pub fn compute_unread<'a>(
    notifications: impl IntoIterator<Item = &'a Notification>,
    identity: Option<&UserId>,
    joined: Option<&[ServerId]>,
) -> UnreadCounts {
    let mut counts = UnreadCounts::default();
    let (Some(identity), Some(joined)) = (identity, joined) else {
        return counts;
    };
    for notification in notifications {
        if notification.read
            || &notification.user_id != identity
            || !joined.contains(&notification.server_id)
        {
            continue;
        }
        counts.total += 1;
        *counts
            .by_server
            .entry(notification.server_id.clone())
            .or_default() += 1;
        *counts
            .by_channel
            .entry(notification.channel_key())
            .or_default() += 1;
    }
    counts
}

/// Persistable image of the store. Speculative messages are never included.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub schema_version: u32,
    pub identity: Option<UserId>,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub channel_synced: Vec<(ChannelKey, i64)>,
    pub profiles: Vec<Profile>,
    pub servers: Vec<CacheEntry<Server>>,
    pub members: Vec<CacheEntry<ServerMembers>>,
    pub joined: Option<CacheEntry<Vec<ServerId>>>,
    pub notifications: Vec<Notification>,
}

#[derive(Default)]
struct StoreState {
    identity: Option<UserId>,
    messages: Collection<Message>,
    channel_synced: HashMap<ChannelKey, i64>,
    profiles: Collection<Profile>,
    servers: Collection<CacheEntry<Server>>,
    members: Collection<CacheEntry<ServerMembers>>,
    joined: Option<CacheEntry<Vec<ServerId>>>,
    notifications: Collection<Notification>,
    unread: UnreadCounts,
}

impl StoreState {
    fn recompute_unread(&mut self) -> bool {
        let next = compute_unread(
            self.notifications.values(),
            self.identity.as_ref(),
            self.joined.as_ref().map(|entry| entry.data.as_slice()),
        );
        if next == self.unread {
            return false;
        }
        self.unread = next;
        true
    }

    fn evict_notifications(&mut self, retention: usize) {
        let excess = self.notifications.len().saturating_sub(retention);
        if retention == 0 || excess == 0 {
            return;
        }
        let mut order: Vec<(i64, NotificationId)> = self
            .notifications
            .values()
            .map(|n| (n.timestamp_seconds, n.notification_id))
            .collect();
        order.sort_unstable();
        for (_, id) in order.into_iter().take(excess) {
            self.notifications.remove(&id);
        }
    }
}

fn channel_range(channel: &ChannelKey) -> std::ops::RangeInclusive<MessageKey> {
    MessageKey {
        channel: channel.clone(),
        message_id: MessageId(i64::MIN),
    }..=MessageKey {
        channel: channel.clone(),
        message_id: MessageId(i64::MAX),
    }
}

pub struct EntityStore {
    state: Mutex<StoreState>,
    changes: broadcast::Sender<CacheKey>,
    dirty: AtomicBool,
    dirty_notify: Notify,
    next_synthetic: AtomicI64,
    retention: usize,
}

impl EntityStore {
    /// `retention` caps stored notifications; zero disables the cap.
    pub fn new(retention: usize) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(StoreState::default()),
            changes,
            dirty: AtomicBool::new(false),
            dirty_notify: Notify::new(),
            next_synthetic: AtomicI64::new(MessageId::SYNTHETIC_BASE),
            retention,
        }
    }

    fn mutate<R>(
        &self,
        persist: bool,
        f: impl FnOnce(&mut StoreState, &mut Vec<CacheKey>) -> R,
    ) -> R {
        let mut changed = Vec::new();
        let result = {
            let mut state = self.state.lock();
            let result = f(&mut state, &mut changed);
            if changed.iter().any(CacheKey::affects_unread) && state.recompute_unread() {
                changed.push(CacheKey::Unread);
            }
            result
        };
        if changed.is_empty() {
            return result;
        }
        if persist {
            self.mark_dirty();
        }
        for key in changed {
            let _ = self.changes.send(key);
        }
        result
    }

    pub fn subscribe(&self, key: CacheKey) -> Subscription {
        Subscription {
            key,
            rx: self.changes.subscribe(),
        }
    }

    pub fn changes(&self) -> broadcast::Receiver<CacheKey> {
        self.changes.subscribe()
    }

    pub fn identity(&self) -> Option<UserId> {
        self.state.lock().identity.clone()
    }

    pub fn set_identity(&self, identity: Option<UserId>) {
        self.mutate(false, |state, changed| {
            if state.identity != identity {
                state.identity = identity;
                changed.push(CacheKey::Reset);
            }
        });
    }

    /// Drops every cached entity. The identity is kept.
    pub fn clear(&self) {
        self.mutate(false, |state, changed| {
            let identity = state.identity.take();
            *state = StoreState {
                identity,
                ..StoreState::default()
            };
            changed.push(CacheKey::Reset);
        });
        self.dirty.store(false, Ordering::SeqCst);
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        self.dirty_notify.notify_one();
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Clears the dirty flag and reports whether it was set.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::SeqCst)
    }

    pub async fn dirtied(&self) {
        self.dirty_notify.notified().await;
    }

    // Messages

    pub fn next_synthetic_id(&self) -> MessageId {
        MessageId(self.next_synthetic.fetch_add(1, Ordering::SeqCst))
    }

    /// Confirmed messages by id, then pending ones in insertion order.
    pub fn get_messages(&self, channel: &ChannelKey) -> Vec<Message> {
        let state = self.state.lock();
        let (pending, mut confirmed): (Vec<Message>, Vec<Message>) = state
            .messages
            .range(channel_range(channel))
            .cloned()
            .partition(Message::is_pending);
        confirmed.extend(pending);
        confirmed
    }

    pub fn pending_messages(&self, channel: &ChannelKey) -> Vec<Message> {
        let state = self.state.lock();
        state
            .messages
            .range(channel_range(channel))
            .filter(|m| m.is_pending())
            .cloned()
            .collect()
    }

    pub fn get_message(&self, key: &MessageKey) -> Option<Message> {
        self.state.lock().messages.get(key).cloned()
    }

    pub fn channel_synced_at(&self, channel: &ChannelKey) -> Option<i64> {
        self.state.lock().channel_synced.get(channel).copied()
    }

    /// Merges a fetched page and stamps the channel as synced.
    pub fn upsert_messages(&self, channel: &ChannelKey, messages: Vec<Message>, fetched_at: i64) {
        self.mutate(true, |state, changed| {
            let mut touched: Vec<ChannelKey> = Vec::new();
            for message in messages {
                let key = message.channel_key();
                if state.messages.upsert_one(message) && !touched.contains(&key) {
                    touched.push(key);
                }
            }
            let stamp = state.channel_synced.entry(channel.clone()).or_insert(fetched_at);
            *stamp = (*stamp).max(fetched_at);
            changed.extend(touched.into_iter().map(CacheKey::Messages));
        });
    }

    pub fn insert_pending(
        &self,
        channel: &ChannelKey,
        author: UserId,
        content: String,
        timestamp_seconds: i64,
    ) -> Message {
        let message = Message {
            message_id: self.next_synthetic_id(),
            server_id: channel.server_id.clone(),
            channel_id: channel.channel_id.clone(),
            author_id: author,
            content,
            timestamp_seconds,
            edited: false,
        };
        self.mutate(true, |state, changed| {
            state.messages.replace(message.clone());
            changed.push(CacheKey::Messages(channel.clone()));
        });
        message
    }

    /// Swaps a speculative record for its authoritative copy.
    pub fn confirm_pending(&self, synthetic: &MessageKey, confirmed: Message) {
        self.mutate(true, |state, changed| {
            state.messages.remove(synthetic);
            state.messages.upsert_one(confirmed);
            changed.push(CacheKey::Messages(synthetic.channel.clone()));
        });
    }

    pub fn replace_message(&self, message: Message) -> Option<Message> {
        self.mutate(true, |state, changed| {
            let key = message.channel_key();
            let previous = state.messages.replace(message);
            changed.push(CacheKey::Messages(key));
            previous
        })
    }

    pub fn remove_message(&self, key: &MessageKey) -> Option<Message> {
        self.mutate(true, |state, changed| {
            let removed = state.messages.remove(key);
            if removed.is_some() {
                changed.push(CacheKey::Messages(key.channel.clone()));
            }
            removed
        })
    }

    // Profiles

    pub fn get_profile(&self, user: &UserId) -> Option<Profile> {
        self.state.lock().profiles.get(user).cloned()
    }

    pub fn upsert_profiles(&self, profiles: Vec<Profile>) -> usize {
        self.mutate(true, |state, changed| {
            let mut count = 0;
            for profile in profiles {
                let user = profile.user_id.clone();
                if state.profiles.upsert_one(profile) {
                    count += 1;
                    changed.push(CacheKey::Profile(user));
                }
            }
            count
        })
    }

    // Servers and members

    pub fn get_server(&self, server: &ServerId) -> Option<CacheEntry<Server>> {
        self.state.lock().servers.get(server).cloned()
    }

    pub fn upsert_server(&self, entry: CacheEntry<Server>) {
        self.mutate(true, |state, changed| {
            let key = entry.data.server_id.clone();
            if state.servers.upsert_one(entry) {
                changed.push(CacheKey::Server(key));
            }
        });
    }

    pub fn get_members(&self, server: &ServerId) -> Option<CacheEntry<Vec<Member>>> {
        self.state
            .lock()
            .members
            .get(server)
            .map(|entry| CacheEntry::new(entry.data.members.clone(), entry.fetched_at_millis))
    }

    pub fn upsert_members(&self, server: &ServerId, members: Vec<Member>, fetched_at: i64) {
        let entry = CacheEntry::new(
            ServerMembers {
                server_id: server.clone(),
                members,
            },
            fetched_at,
        );
        self.mutate(true, |state, changed| {
            if state.members.upsert_one(entry) {
                changed.push(CacheKey::Members(server.clone()));
            }
        });
    }

    pub fn joined_servers(&self) -> Option<CacheEntry<Vec<ServerId>>> {
        self.state.lock().joined.clone()
    }

    /// Replaces the joined list. Servers no longer joined lose their cached
    /// snapshot and member list; their notifications stay but stop counting.
    pub fn set_joined_servers(&self, servers: Vec<ServerId>, fetched_at: i64) {
        self.mutate(true, |state, changed| {
            if let Some(current) = &state.joined {
                if current.fetched_at_millis > fetched_at {
                    return;
                }
            }
            let left: Vec<ServerId> = state
                .joined
                .as_ref()
                .map(|entry| {
                    entry
                        .data
                        .iter()
                        .filter(|id| !servers.contains(id))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            for server in left {
                if state.servers.remove(&server).is_some() {
                    changed.push(CacheKey::Server(server.clone()));
                }
                if state.members.remove(&server).is_some() {
                    changed.push(CacheKey::Members(server));
                }
            }
            state.joined = Some(CacheEntry::new(servers, fetched_at));
            changed.push(CacheKey::JoinedServers);
        });
    }

    // Notifications

    /// Merges a batch by id and returns the notifications that were not
    /// stored before (and survived retention).
    pub fn ingest_notifications(&self, batch: Vec<Notification>) -> Vec<Notification> {
        let retention = self.retention;
        self.mutate(true, |state, changed| {
            let mut fresh: Vec<NotificationId> = Vec::new();
            let mut any = false;
            for notification in batch {
                let id = notification.notification_id;
                let existed = state.notifications.contains(&id);
                any |= state.notifications.upsert_one(notification);
                if !existed && !fresh.contains(&id) {
                    fresh.push(id);
                }
            }
            state.evict_notifications(retention);
            if any {
                changed.push(CacheKey::Notifications);
            }
            fresh
                .iter()
                .filter_map(|id| state.notifications.get(id).cloned())
                .collect()
        })
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.state.lock().notifications.values().cloned().collect()
    }

    pub fn get_notification(&self, id: NotificationId) -> Option<Notification> {
        self.state.lock().notifications.get(&id).cloned()
    }

    /// Marks `identity`'s unread notifications in the channel as read and
    /// returns their ids.
    pub fn mark_read(&self, identity: &UserId, channel: &ChannelKey) -> Vec<NotificationId> {
        self.mutate(true, |state, changed| {
            let mut marked = Vec::new();
            for notification in state.notifications.values_mut() {
                if !notification.read
                    && &notification.user_id == identity
                    && notification.server_id == channel.server_id
                    && notification.channel_id == channel.channel_id
                {
                    notification.read = true;
                    marked.push(notification.notification_id);
                }
            }
            if !marked.is_empty() {
                changed.push(CacheKey::Notifications);
            }
            marked
        })
    }

    pub fn unread_counts(&self) -> UnreadCounts {
        self.state.lock().unread.clone()
    }

    pub fn unread_total(&self) -> usize {
        self.state.lock().unread.total
    }

    pub fn unread_for_channel(&self, server: &ServerId, channel: &ChannelId) -> usize {
        let key = ChannelKey::new(server.clone(), channel.clone());
        self.state
            .lock()
            .unread
            .by_channel
            .get(&key)
            .copied()
            .unwrap_or(0)
    }

    // Snapshots

    pub fn export_snapshot(&self, schema_version: u32) -> CacheSnapshot {
        let state = self.state.lock();
        CacheSnapshot {
            schema_version,
            identity: state.identity.clone(),
            messages: state.messages.query(|m| !m.is_pending()),
            channel_synced: state
                .channel_synced
                .iter()
                .map(|(key, at)| (key.clone(), *at))
                .collect(),
            profiles: state.profiles.values().cloned().collect(),
            servers: state.servers.values().cloned().collect(),
            members: state.members.values().cloned().collect(),
            joined: state.joined.clone(),
            notifications: state.notifications.values().cloned().collect(),
        }
    }

    /// Merges a snapshot into the current contents without marking the store
    /// dirty. Pending messages in the snapshot are ignored.
    pub fn import_snapshot(&self, snapshot: CacheSnapshot) {
        let retention = self.retention;
        self.mutate(false, |state, changed| {
            state
                .messages
                .upsert_many(snapshot.messages.into_iter().filter(|m| !m.is_pending()));
            for (channel, at) in snapshot.channel_synced {
                let stamp = state.channel_synced.entry(channel).or_insert(at);
                *stamp = (*stamp).max(at);
            }
            state.profiles.upsert_many(snapshot.profiles);
            state.servers.upsert_many(snapshot.servers);
            state.members.upsert_many(snapshot.members);
            if let Some(joined) = snapshot.joined {
                let newer = state
                    .joined
                    .as_ref()
                    .map_or(true, |current| joined.fetched_at_millis >= current.fetched_at_millis);
                if newer {
                    state.joined = Some(joined);
                }
            }
            state.notifications.upsert_many(snapshot.notifications);
            state.evict_notifications(retention);
            changed.push(CacheKey::Reset);
        });
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
