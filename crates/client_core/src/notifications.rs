use std::{
    collections::{HashSet, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use shared::{
    domain::{ChannelKey, Notification, NotificationId, UserId},
    protocol::{decode, Endpoint, MarkReadRequest, NotificationsRequest, NotificationsResponse},
};
use tracing::{debug, info, warn};

use crate::{
    config::PollSettings,
    error::FetchError,
    fetch::{FetchCoordinator, ResourceKey},
    remote::{remote_call, RemoteSource},
    store::EntityStore,
    task::{sleep_or_shutdown, PollHandle},
};

const ALERT_LEDGER_CAPACITY: usize = 2048;

/// Side effects for newly arrived unread notifications. Both default to
/// no-ops.
pub trait NotificationHooks: Send + Sync {
    fn play_sound(&self, _notification: &Notification) {}

    fn show_alert(&self, _notification: &Notification) {}
}

pub struct SilentHooks;

impl NotificationHooks for SilentHooks {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollOutcome {
    pub fetched: usize,
    pub inserted: usize,
    pub alerted: usize,
    pub unread_total: usize,
}

/// Ids that already triggered hooks, bounded by insertion order.
#[derive(Default)]
struct AlertLedger {
    seen: HashSet<NotificationId>,
    order: VecDeque<NotificationId>,
}

impl AlertLedger {
    fn insert(&mut self, id: NotificationId) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > ALERT_LEDGER_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }
}

/// Poll interval after an attempt: back to base on success, multiplied up to
/// the ceiling on failure.
pub fn next_backoff(settings: &PollSettings, current: Duration, succeeded: bool) -> Duration {
    if succeeded {
        settings.base_interval()
    } else {
        settings.next_backoff(current.max(settings.base_interval()))
    }
}

pub struct NotificationEngine {
    remote: Arc<dyn RemoteSource>,
    coordinator: FetchCoordinator,
    store: Arc<EntityStore>,
    hooks: Arc<dyn NotificationHooks>,
    settings: PollSettings,
    alerted: Mutex<AlertLedger>,
    ack_sequence: AtomicU64,
}

impl NotificationEngine {
    pub fn new(
        remote: Arc<dyn RemoteSource>,
        coordinator: FetchCoordinator,
        store: Arc<EntityStore>,
        hooks: Arc<dyn NotificationHooks>,
        settings: PollSettings,
    ) -> Self {
        Self {
            remote,
            coordinator,
            store,
            hooks,
            settings,
            alerted: Mutex::new(AlertLedger::default()),
            ack_sequence: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &PollSettings {
        &self.settings
    }

    pub async fn poll_once(&self, identity: &UserId) -> Result<PollOutcome, FetchError> {
        let key = ResourceKey::notifications(identity);
        let resource = key.to_string();
        let request = NotificationsRequest {
            user_id: identity.clone(),
            limit: self.settings.batch_limit,
        };
        let value = self
            .coordinator
            .request(
                key,
                remote_call(self.remote.clone(), Endpoint::GetNotifications, resource, request),
            )
            .await?;
        let response: NotificationsResponse = decode("notifications", value)?;

        let batch: Vec<Notification> = response
            .notifications
            .into_iter()
            .filter_map(|record| {
                let id = record.notification_id;
                match record.into_domain() {
                    Ok(notification) => Some(notification),
                    Err(err) => {
                        warn!(notification_id = id, "skipping malformed notification: {err}");
                        None
                    }
                }
            })
            .collect();
        Ok(self.ingest(identity, batch))
    }

    /// Merges a batch for `identity` and fires hooks once per newly stored
    /// unread notification addressed to it. Batches for a stale identity are
    /// dropped.
    pub fn ingest(&self, identity: &UserId, batch: Vec<Notification>) -> PollOutcome {
        let fetched = batch.len();
        if self.store.identity().as_ref() != Some(identity) {
            debug!(user_id = %identity, "dropping notification batch for inactive identity");
            return PollOutcome {
                fetched,
                ..PollOutcome::default()
            };
        }

        let inserted = self.store.ingest_notifications(batch);
        let mut alerted = 0;
        for notification in &inserted {
            if notification.read || &notification.user_id != identity {
                continue;
            }
            if !self.alerted.lock().insert(notification.notification_id) {
                continue;
            }
            self.hooks.play_sound(notification);
            self.hooks.show_alert(notification);
            alerted += 1;
        }

        PollOutcome {
            fetched,
            inserted: inserted.len(),
            alerted,
            unread_total: self.store.unread_total(),
        }
    }

    /// Spawns the poll loop for `identity`. The first poll runs immediately.
    pub fn start(self: Arc<Self>, identity: UserId) -> PollHandle {
        let name = format!("notifications:{identity}");
        PollHandle::spawn(name, move |mut shutdown| async move {
            let mut interval = self.settings.base_interval();
            info!(user_id = %identity, "notification polling started");
            loop {
                let succeeded = match self.poll_once(&identity).await {
                    Ok(outcome) => {
                        if outcome.inserted > 0 {
                            debug!(
                                user_id = %identity,
                                inserted = outcome.inserted,
                                unread = outcome.unread_total,
                                "notifications merged"
                            );
                        }
                        true
                    }
                    Err(err @ FetchError::RateLimited { .. }) => {
                        debug!(user_id = %identity, "notification poll deferred: {err}");
                        false
                    }
                    Err(err) => {
                        warn!(user_id = %identity, "notification poll failed: {err}");
                        false
                    }
                };
                interval = next_backoff(&self.settings, interval, succeeded);
                if sleep_or_shutdown(&mut shutdown, interval).await {
                    break;
                }
            }
            info!(user_id = %identity, "notification polling stopped");
        })
    }

    /// Marks the channel's unread notifications read locally and acknowledges
    /// them remotely in the background. Returns how many changed.
    pub fn mark_read(&self, identity: &UserId, channel: &ChannelKey) -> usize {
        let marked = self.store.mark_read(identity, channel);
        if marked.is_empty() {
            return 0;
        }

        let count = marked.len();
        let sequence = self.ack_sequence.fetch_add(1, Ordering::SeqCst);
        let key = ResourceKey::mark_read(channel, sequence);
        let resource = key.to_string();
        let request = MarkReadRequest {
            user_id: identity.clone(),
            server_id: channel.server_id.clone(),
            channel_id: channel.channel_id.clone(),
            notification_ids: marked,
        };
        let call = remote_call(self.remote.clone(), Endpoint::MarkNotificationsRead, resource, request);
        let coordinator = self.coordinator.clone();
        let channel = channel.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(err) = coordinator.request(key, call).await {
                        warn!(channel = %channel, "read acknowledgement failed: {err}");
                    }
                });
            }
            Err(_) => warn!(channel = %channel, "no runtime; read acknowledgement skipped"),
        }
        count
    }

    pub fn reset_alerts(&self) {
        self.alerted.lock().clear();
    }
}

#[cfg(test)]
#[path = "tests/notifications_tests.rs"]
mod tests;
