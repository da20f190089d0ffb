use std::{
    collections::{BTreeMap, BTreeSet},
    future::Future,
    sync::Arc,
};

use shared::domain::{
    CacheEntry, ChannelId, ChannelKey, FriendStatus, Member, Message, MessageId, MessageKey,
    Profile, Server, ServerId, UserId,
};
use storage::SnapshotStore;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod fetch;
pub mod identity;
pub mod notifications;
pub mod optimistic;
pub mod persist;
pub mod remote;
pub mod staleness;
pub mod store;
pub mod sync;
pub mod task;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{load_settings, EngineSettings, PollSettings, ResourceClass, ResourcePolicy};
pub use error::FetchError;
pub use events::EngineEvent;
pub use fetch::{AbortScope, FetchCoordinator, ResourceKey};
pub use identity::IdentitySource;
pub use notifications::{NotificationEngine, NotificationHooks, PollOutcome, SilentHooks};
pub use optimistic::{MutationId, MutationState, PendingSend, SendReceipt};
pub use persist::SnapshotPersistence;
pub use remote::{HttpRemoteSource, RemoteResponse, RemoteSource};
pub use staleness::{CacheDecision, StalenessPolicy};
pub use store::{CacheKey, EntityStore, Subscription, UnreadCounts};
pub use task::PollHandle;

use optimistic::OptimisticPipeline;
use sync::{start_message_poller, RemoteSync};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Collaborators that tests and embedders swap out.
pub struct EngineDependencies {
    pub clock: Arc<dyn Clock>,
    pub hooks: Arc<dyn NotificationHooks>,
    pub snapshots: Option<Arc<dyn SnapshotStore>>,
}

impl Default for EngineDependencies {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            hooks: Arc::new(SilentHooks),
            snapshots: None,
        }
    }
}

#[derive(Default)]
struct SessionTasks {
    notifications: Option<PollHandle>,
    flusher: Option<PollHandle>,
    channel: Option<(ChannelKey, PollHandle)>,
}

impl SessionTasks {
    async fn stop_all(&mut self) {
        if let Some((_, poller)) = self.channel.take() {
            poller.stop().await;
        }
        if let Some(poll) = self.notifications.take() {
            poll.stop().await;
        }
        if let Some(flusher) = self.flusher.take() {
            flusher.stop().await;
        }
    }
}

/// The caching engine behind the UI: typed getters read the store, actions
/// go through the coordinator and write results back.
pub struct SyncEngine {
    settings: Arc<EngineSettings>,
    clock: Arc<dyn Clock>,
    identity: IdentitySource,
    store: Arc<EntityStore>,
    coordinator: FetchCoordinator,
    staleness: StalenessPolicy,
    sync: RemoteSync,
    pipeline: OptimisticPipeline,
    notifications: Arc<NotificationEngine>,
    persistence: Option<SnapshotPersistence>,
    events: broadcast::Sender<EngineEvent>,
    session: Mutex<SessionTasks>,
}

impl SyncEngine {
    pub fn new(remote: Arc<dyn RemoteSource>, settings: EngineSettings) -> Self {
        Self::new_with_dependencies(remote, settings, EngineDependencies::default())
    }

    pub fn new_with_dependencies(
        remote: Arc<dyn RemoteSource>,
        settings: EngineSettings,
        dependencies: EngineDependencies,
    ) -> Self {
        let settings = Arc::new(settings);
        let clock = dependencies.clock;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let store = Arc::new(EntityStore::new(settings.notification_retention));
        let coordinator = FetchCoordinator::new(
            settings.policies.clone(),
            clock.clone(),
            events.clone(),
            settings.notice_threshold,
        );
        let staleness = StalenessPolicy::new(settings.policies.clone(), clock.clone());
        let sync = RemoteSync::new(
            remote.clone(),
            coordinator.clone(),
            store.clone(),
            clock.clone(),
            settings.message_page_size,
        );
        let pipeline =
            OptimisticPipeline::new(sync.clone(), store.clone(), clock.clone(), events.clone());
        let notifications = Arc::new(NotificationEngine::new(
            remote,
            coordinator.clone(),
            store.clone(),
            dependencies.hooks,
            settings.notification_poll.clone(),
        ));
        let persistence = dependencies.snapshots.map(|backend| {
            SnapshotPersistence::new(store.clone(), backend, settings.persist_debounce())
        });

        Self {
            settings,
            clock,
            identity: IdentitySource::default(),
            store,
            coordinator,
            staleness,
            sync,
            pipeline,
            notifications,
            persistence,
            events,
            session: Mutex::new(SessionTasks::default()),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &FetchCoordinator {
        &self.coordinator
    }

    pub fn identity(&self) -> &IdentitySource {
        &self.identity
    }

    pub fn current_identity(&self) -> Option<UserId> {
        self.identity.current()
    }

    fn require_identity(&self) -> Result<UserId, FetchError> {
        self.identity.current().ok_or(FetchError::NoIdentity)
    }

    // Session lifecycle

    pub async fn login(&self, user_id: &str) -> Result<(), FetchError> {
        let user = UserId::parse(user_id)?;
        self.rescope(Some(user)).await;
        Ok(())
    }

    pub async fn logout(&self) {
        self.rescope(None).await;
    }

    /// Full re-scope: stop every loop, flush and drop the old identity's
    /// cache and ledgers, then restore and restart for the new one.
    async fn rescope(&self, next: Option<UserId>) {
        let mut session = self.session.lock().await;
        session.stop_all().await;

        self.coordinator.clear();
        self.staleness.clear();
        self.notifications.reset_alerts();
        self.store.clear();
        self.store.set_identity(next.clone());
        self.identity.set(next.clone());

        if let Some(user) = &next {
            if let Some(persistence) = &self.persistence {
                if let Err(err) = persistence.restore(user).await {
                    warn!(user_id = %user, "cache restore failed: {err:#}");
                }
                session.flusher = Some(persistence.start());
            }
            session.notifications = Some(self.notifications.clone().start(user.clone()));
            info!(user_id = %user, "session started");
        } else {
            info!("session ended");
        }
        let _ = self.events.send(EngineEvent::IdentityChanged(next));
    }

    /// Re-scopes the engine whenever `identities` publishes a new value.
    pub fn follow_identity(
        self: &Arc<Self>,
        mut identities: watch::Receiver<Option<UserId>>,
    ) -> PollHandle {
        let engine = Arc::clone(self);
        PollHandle::spawn("identity-follower", move |mut shutdown| async move {
            loop {
                let next = identities.borrow_and_update().clone();
                if next != engine.current_identity() {
                    engine.rescope(next).await;
                }
                let closed = tokio::select! {
                    changed = identities.changed() => changed.is_err(),
                    _ = shutdown.changed() => true,
                };
                if closed {
                    break;
                }
            }
        })
    }

    /// Stops every loop and writes the final snapshot.
    pub async fn shutdown(&self) {
        let mut session = self.session.lock().await;
        session.stop_all().await;
        if let Err(err) = self.flush().await {
            warn!("final snapshot flush failed: {err:#}");
        }
    }

    pub async fn restore(&self) -> anyhow::Result<bool> {
        match (&self.persistence, self.identity.current()) {
            (Some(persistence), Some(user)) => persistence.restore(&user).await,
            _ => Ok(false),
        }
    }

    pub async fn flush(&self) -> anyhow::Result<bool> {
        match &self.persistence {
            Some(persistence) => persistence.flush().await,
            None => Ok(false),
        }
    }

    // Observation

    pub fn subscribe(&self, key: CacheKey) -> Subscription {
        self.store.subscribe(key)
    }

    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    // Getters

    pub fn get_messages(&self, channel: &ChannelKey) -> Vec<Message> {
        self.store.get_messages(channel)
    }

    pub fn get_profile(&self, user: &UserId) -> Option<Profile> {
        self.store.get_profile(user)
    }

    pub fn get_server_members(&self, server: &ServerId) -> Vec<Member> {
        self.store
            .get_members(server)
            .map(|entry| entry.data)
            .unwrap_or_default()
    }

    pub fn get_unread_count(&self) -> usize {
        self.store.unread_total()
    }

    pub fn get_unread_counts_by_server(&self) -> BTreeMap<ServerId, usize> {
        self.store.unread_counts().by_server
    }

    pub fn get_unread_counts_by_channel(&self) -> BTreeMap<ChannelKey, usize> {
        self.store.unread_counts().by_channel
    }

    /// Server nickname, then profile name, then the raw id.
    pub fn display_name(&self, server: &ServerId, user: &UserId) -> String {
        let nickname = self.store.get_members(server).and_then(|entry| {
            entry
                .data
                .into_iter()
                .find(|member| &member.user_id == user)
                .and_then(|member| member.nickname)
        });
        nickname.unwrap_or_else(|| {
            self.store
                .get_profile(user)
                .map(|profile| profile.display_name())
                .unwrap_or_else(|| user.to_string())
        })
    }

    /// Relation between the current identity and `other`, read from either
    /// side's cached friend edges.
    pub fn friend_status(&self, other: &UserId) -> FriendStatus {
        let Some(me) = self.identity.current() else {
            return FriendStatus::None;
        };
        [self.store.get_profile(&me), self.store.get_profile(other)]
            .into_iter()
            .flatten()
            .flat_map(|profile| profile.friends)
            .find(|edge| edge.involves(&me) && edge.involves(other))
            .map(|edge| edge.status_for(&me))
            .unwrap_or(FriendStatus::None)
    }

    pub fn mutation_state(&self, id: MutationId) -> Option<MutationState> {
        self.pipeline.mutation_state(id)
    }

    // Reads with staleness

    async fn resolve<T, Fut>(
        &self,
        key: ResourceKey,
        cached: Option<CacheEntry<T>>,
        force: bool,
        refresh: impl FnOnce() -> Fut,
    ) -> Result<T, FetchError>
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let decision = self
            .staleness
            .decide(&key, cached.as_ref().map(|entry| entry.fetched_at_millis), force);
        match (decision, cached) {
            (CacheDecision::Serve, Some(entry)) => Ok(entry.data),
            (CacheDecision::ServeAndRefresh, Some(entry)) => {
                spawn_background_refresh(key, refresh());
                Ok(entry.data)
            }
            (_, cached) => match refresh().await {
                Ok(data) => Ok(data),
                Err(err) if err.is_transient() && cached.is_some() => {
                    debug!(resource = %key, "serving cached copy after failed refresh: {err}");
                    cached.map(|entry| entry.data).ok_or(err)
                }
                Err(err) => Err(err),
            },
        }
    }

    pub async fn fetch_server_members(
        &self,
        server_id: &str,
        force: bool,
    ) -> Result<Vec<Member>, FetchError> {
        let server = ServerId::parse(server_id)?;
        let sync = self.sync.clone();
        let cached = self.store.get_members(&server);
        let target = server.clone();
        self.resolve(ResourceKey::members(&server), cached, force, move || async move {
            sync.refresh_members(&target).await
        })
        .await
    }

    pub async fn get_server(&self, server_id: &str, force: bool) -> Result<Server, FetchError> {
        let server = ServerId::parse(server_id)?;
        let sync = self.sync.clone();
        let cached = self.store.get_server(&server);
        let target = server.clone();
        self.resolve(ResourceKey::server(&server), cached, force, move || async move {
            sync.refresh_server(&target).await
        })
        .await
    }

    pub async fn fetch_joined_servers(&self, force: bool) -> Result<Vec<ServerId>, FetchError> {
        let user = self.require_identity()?;
        let sync = self.sync.clone();
        let cached = self.store.joined_servers();
        let key = ResourceKey::joined_servers(&user);
        self.resolve(key, cached, force, move || async move {
            sync.refresh_joined(&user).await
        })
        .await
    }

    pub async fn fetch_messages(
        &self,
        server_id: &str,
        channel_id: &str,
        force: bool,
    ) -> Result<Vec<Message>, FetchError> {
        let channel = parse_channel(server_id, channel_id)?;
        let cached = self
            .store
            .channel_synced_at(&channel)
            .map(|at| CacheEntry::new((), at));
        let sync = self.sync.clone();
        let target = channel.clone();
        self.resolve(ResourceKey::messages(&channel), cached, force, move || async move {
            sync.refresh_messages(&target).await.map(|_| ())
        })
        .await?;
        Ok(self.store.get_messages(&channel))
    }

    /// Deduplicates, skips users whose cached profile is still fresh, and
    /// fetches the rest in batches. Every batch is attempted; the first
    /// failure is returned.
    pub async fn fetch_bulk_profiles(&self, user_ids: &[&str]) -> Result<Vec<Profile>, FetchError> {
        let requested = user_ids
            .iter()
            .map(|raw| UserId::parse(*raw))
            .collect::<Result<BTreeSet<_>, _>>()?;
        let ttl_ms = self.coordinator.policy(ResourceClass::Profiles).ttl_ms as i64;
        let now = self.clock.now_millis();
        let stale: Vec<UserId> = requested
            .iter()
            .filter(|user| {
                self.store.get_profile(user).map_or(true, |profile| {
                    ttl_ms == 0 || now.saturating_sub(profile.synced_at_millis) >= ttl_ms
                })
            })
            .cloned()
            .collect();

        let mut first_error = None;
        for batch in stale.chunks(self.settings.profile_batch_size.max(1)) {
            if let Err(err) = self.sync.refresh_profiles(batch.to_vec()).await {
                warn!(batch = batch.len(), "profile batch failed: {err}");
                first_error.get_or_insert(err);
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }
        Ok(requested
            .iter()
            .filter_map(|user| self.store.get_profile(user))
            .collect())
    }

    // Writes

    /// Inserts the speculative message. Follow with [`Self::complete_send`].
    pub fn begin_send(
        &self,
        server_id: &str,
        channel_id: &str,
        content: &str,
    ) -> Result<PendingSend, FetchError> {
        let author = self.require_identity()?;
        let channel = parse_channel(server_id, channel_id)?;
        self.pipeline.begin_send(&author, &channel, content)
    }

    pub async fn complete_send(&self, pending: PendingSend) -> Result<SendReceipt, FetchError> {
        self.pipeline.complete_send(pending).await
    }

    pub async fn send_message(
        &self,
        server_id: &str,
        channel_id: &str,
        content: &str,
    ) -> Result<SendReceipt, FetchError> {
        let pending = self.begin_send(server_id, channel_id, content)?;
        self.complete_send(pending).await
    }

    pub async fn edit_message(
        &self,
        server_id: &str,
        channel_id: &str,
        message_id: i64,
        content: &str,
    ) -> Result<Message, FetchError> {
        self.require_identity()?;
        let key = MessageKey {
            channel: parse_channel(server_id, channel_id)?,
            message_id: MessageId(message_id),
        };
        self.pipeline.edit_message(&key, content).await
    }

    pub async fn delete_message(
        &self,
        server_id: &str,
        channel_id: &str,
        message_id: i64,
    ) -> Result<(), FetchError> {
        self.require_identity()?;
        let key = MessageKey {
            channel: parse_channel(server_id, channel_id)?,
            message_id: MessageId(message_id),
        };
        self.pipeline.delete_message(&key).await
    }

    pub fn mark_notifications_read(
        &self,
        server_id: &str,
        channel_id: &str,
    ) -> Result<usize, FetchError> {
        let user = self.require_identity()?;
        let channel = parse_channel(server_id, channel_id)?;
        Ok(self.notifications.mark_read(&user, &channel))
    }

    pub fn mark_server_invalid(&self, server_id: &str) -> Result<(), FetchError> {
        let server = ServerId::parse(server_id)?;
        self.coordinator.mark_server_invalid(&server);
        Ok(())
    }

    pub fn reset_server(&self, server_id: &str) -> Result<usize, FetchError> {
        let server = ServerId::parse(server_id)?;
        Ok(self.coordinator.reset_server(&server))
    }

    // Navigation

    /// Switches the open channel: aborts the previous channel's reads, starts
    /// periodic refresh for the new one, and marks it read.
    pub async fn open_channel(&self, server_id: &str, channel_id: &str) -> Result<(), FetchError> {
        let user = self.require_identity()?;
        let channel = parse_channel(server_id, channel_id)?;
        let mut session = self.session.lock().await;
        if session.channel.as_ref().is_some_and(|(open, _)| open == &channel) {
            self.notifications.mark_read(&user, &channel);
            return Ok(());
        }
        if let Some((previous, poller)) = session.channel.take() {
            poller.stop().await;
            let scope = if previous.server_id == channel.server_id {
                AbortScope::Channel(previous)
            } else {
                AbortScope::Server(previous.server_id)
            };
            self.coordinator.abort_scope(&scope);
        }
        let poller = start_message_poller(
            self.sync.clone(),
            channel.clone(),
            self.settings.message_refresh_interval(),
        );
        session.channel = Some((channel.clone(), poller));
        self.notifications.mark_read(&user, &channel);
        debug!(channel = %channel, "channel opened");
        Ok(())
    }

    pub async fn close_channel(&self) {
        let mut session = self.session.lock().await;
        if let Some((channel, poller)) = session.channel.take() {
            poller.stop().await;
            self.coordinator.abort_scope(&AbortScope::Channel(channel));
        }
    }

    pub async fn open_channel_key(&self) -> Option<ChannelKey> {
        self.session
            .lock()
            .await
            .channel
            .as_ref()
            .map(|(channel, _)| channel.clone())
    }
}

fn parse_channel(server_id: &str, channel_id: &str) -> Result<ChannelKey, FetchError> {
    Ok(ChannelKey::new(
        ServerId::parse(server_id)?,
        ChannelId::parse(channel_id)?,
    ))
}

/// Fire-and-forget: the caller already has cached data, so failures are only
/// logged.
fn spawn_background_refresh<T, Fut>(key: ResourceKey, refresh: Fut)
where
    T: Send + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
{
    tokio::spawn(async move {
        match refresh.await {
            Ok(_) => debug!(resource = %key, "background refresh complete"),
            Err(err @ (FetchError::RateLimited { .. } | FetchError::Aborted { .. })) => {
                debug!(resource = %key, "background refresh skipped: {err}")
            }
            Err(err) => warn!(resource = %key, "background refresh failed: {err}"),
        }
    });
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
