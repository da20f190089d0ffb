//! Speculative writes with reconciliation or rollback.
//!
//! A send is split in two: [`OptimisticPipeline::begin_send`] validates and
//! inserts the speculative message synchronously, so the UI sees it before
//! any await; [`OptimisticPipeline::complete_send`] performs the remote call
//! and settles the mutation.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use shared::{
    domain::{ChannelKey, Message, MessageId, MessageKey, UserId},
    error::ValidationError,
    protocol::{
        decode, validate_content, DeleteMessageRequest, EditMessageRequest, Endpoint,
        SendMessageRequest, SendMessageResponse,
    },
};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::{
    clock::Clock,
    error::FetchError,
    events::EngineEvent,
    fetch::ResourceKey,
    remote::remote_call,
    store::EntityStore,
    sync::RemoteSync,
};

pub type MutationId = u64;

const MUTATION_HISTORY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
    Pending,
    Confirmed,
    RolledBack,
}

/// A send whose speculative message is already in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    pub mutation_id: MutationId,
    pub synthetic: MessageKey,
    pub author: UserId,
    pub content: String,
    pub timestamp_seconds: i64,
    /// Authoritative messages with the same author and content that were
    /// already cached; reconciliation never attributes them to this send.
    pub preexisting: BTreeSet<MessageId>,
}

impl PendingSend {
    pub fn channel(&self) -> &ChannelKey {
        &self.synthetic.channel
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub mutation_id: MutationId,
    pub synthetic_id: MessageId,
    /// The authoritative copy, when the remote returned an id or
    /// reconciliation found it.
    pub message: Option<Message>,
}

pub struct OptimisticPipeline {
    sync: RemoteSync,
    store: Arc<EntityStore>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<EngineEvent>,
    next_mutation: AtomicU64,
    history: Mutex<BTreeMap<MutationId, MutationState>>,
    /// Authoritative messages already attributed to a send.
    claimed: Mutex<VecDeque<MessageKey>>,
}

impl OptimisticPipeline {
    pub fn new(
        sync: RemoteSync,
        store: Arc<EntityStore>,
        clock: Arc<dyn Clock>,
        events: broadcast::Sender<EngineEvent>,
    ) -> Self {
        Self {
            sync,
            store,
            clock,
            events,
            next_mutation: AtomicU64::new(1),
            history: Mutex::new(BTreeMap::new()),
            claimed: Mutex::new(VecDeque::new()),
        }
    }

    pub fn mutation_state(&self, id: MutationId) -> Option<MutationState> {
        self.history.lock().get(&id).copied()
    }

    fn track(&self, id: MutationId, state: MutationState) {
        let mut history = self.history.lock();
        history.insert(id, state);
        while history.len() > MUTATION_HISTORY {
            history.pop_first();
        }
    }

    fn claim(claimed: &mut VecDeque<MessageKey>, key: MessageKey) {
        claimed.push_back(key);
        while claimed.len() > MUTATION_HISTORY {
            claimed.pop_front();
        }
    }

    fn allocate(&self) -> MutationId {
        let id = self.next_mutation.fetch_add(1, Ordering::SeqCst);
        self.track(id, MutationState::Pending);
        id
    }

    fn fail(&self, id: MutationId, channel: &ChannelKey, err: &FetchError) {
        self.track(id, MutationState::RolledBack);
        warn!(mutation_id = id, channel = %channel, "mutation rolled back: {err}");
        let _ = self.events.send(EngineEvent::MutationFailed {
            mutation_id: id,
            channel: channel.clone(),
            reason: err.to_string(),
        });
    }

    fn confirm(&self, id: MutationId, message: Option<&Message>) {
        self.track(id, MutationState::Confirmed);
        if let Some(message) = message {
            let _ = self.events.send(EngineEvent::MutationConfirmed {
                mutation_id: id,
                channel: message.channel_key(),
                message_id: message.message_id,
            });
        }
    }

    pub fn begin_send(
        &self,
        author: &UserId,
        channel: &ChannelKey,
        content: &str,
    ) -> Result<PendingSend, FetchError> {
        validate_content(content)?;
        let mutation_id = self.allocate();
        let timestamp_seconds = self.clock.now_seconds();
        let preexisting = self
            .store
            .get_messages(channel)
            .into_iter()
            .filter(|m| !m.is_pending() && &m.author_id == author && m.content == content)
            .map(|m| m.message_id)
            .collect();
        let message =
            self.store
                .insert_pending(channel, author.clone(), content.to_string(), timestamp_seconds);
        Ok(PendingSend {
            mutation_id,
            synthetic: message.key(),
            author: author.clone(),
            content: content.to_string(),
            timestamp_seconds,
            preexisting,
        })
    }

    pub async fn complete_send(&self, pending: PendingSend) -> Result<SendReceipt, FetchError> {
        let channel = pending.channel().clone();
        let key = ResourceKey::send(&channel, pending.mutation_id);
        let resource = key.to_string();
        let request = SendMessageRequest {
            server_id: channel.server_id.clone(),
            channel_id: channel.channel_id.clone(),
            author_id: pending.author.clone(),
            content: pending.content.clone(),
        };

        let outcome = self
            .sync
            .coordinator()
            .request(
                key,
                remote_call(self.sync.remote().clone(), Endpoint::SendMessage, resource, request),
            )
            .await
            .and_then(|value| {
                if value.is_null() {
                    return Ok(SendMessageResponse::default());
                }
                decode::<SendMessageResponse>("send_message", value).map_err(FetchError::from)
            });

        let response = match outcome {
            Ok(response) => response,
            Err(err) => {
                self.store.remove_message(&pending.synthetic);
                self.fail(pending.mutation_id, &channel, &err);
                return Err(err);
            }
        };

        let message = match response.message_id.filter(|id| *id >= 0) {
            Some(id) => {
                let confirmed = Message {
                    message_id: MessageId(id),
                    server_id: channel.server_id.clone(),
                    channel_id: channel.channel_id.clone(),
                    author_id: pending.author.clone(),
                    content: pending.content.clone(),
                    timestamp_seconds: response
                        .timestamp_seconds
                        .unwrap_or(pending.timestamp_seconds),
                    edited: false,
                };
                Self::claim(&mut self.claimed.lock(), confirmed.key());
                self.store.confirm_pending(&pending.synthetic, confirmed.clone());
                Some(confirmed)
            }
            None => self.reconcile(&pending).await,
        };

        info!(
            mutation_id = pending.mutation_id,
            channel = %channel,
            confirmed = message.is_some(),
            "message sent"
        );
        self.confirm(pending.mutation_id, message.as_ref());
        Ok(SendReceipt {
            mutation_id: pending.mutation_id,
            synthetic_id: pending.synthetic.message_id,
            message,
        })
    }

    /// The send succeeded without an id: refetch the channel under this
    /// mutation's own key and drop the speculative copy either way. The
    /// oldest matching message not yet attributed to another send wins.
    async fn reconcile(&self, pending: &PendingSend) -> Option<Message> {
        let fetched = self
            .sync
            .reconcile_messages(pending.channel(), pending.mutation_id)
            .await;
        self.store.remove_message(&pending.synthetic);
        match fetched {
            Ok(messages) => {
                let mut claimed = self.claimed.lock();
                let found = messages
                    .into_iter()
                    .filter(|m| m.author_id == pending.author && m.content == pending.content)
                    .filter(|m| !pending.preexisting.contains(&m.message_id))
                    .filter(|m| !claimed.contains(&m.key()))
                    .min_by_key(|m| m.message_id);
                if let Some(message) = &found {
                    Self::claim(&mut claimed, message.key());
                } else {
                    warn!(
                        mutation_id = pending.mutation_id,
                        channel = %pending.channel(),
                        "sent message not visible after reconciliation"
                    );
                }
                found
            }
            Err(err) => {
                warn!(
                    mutation_id = pending.mutation_id,
                    channel = %pending.channel(),
                    "reconciliation fetch failed; speculative copy dropped: {err}"
                );
                None
            }
        }
    }

    fn confirmed_message(&self, key: &MessageKey) -> Result<Message, FetchError> {
        if key.message_id.is_synthetic() {
            return Err(ValidationError::PendingMessage {
                message_id: key.message_id.0,
            }
            .into());
        }
        self.store.get_message(key).ok_or_else(|| {
            ValidationError::UnknownMessage {
                message_id: key.message_id.0,
            }
            .into()
        })
    }

    /// Applies the edit locally, restoring the previous copy on failure.
    pub async fn edit_message(&self, key: &MessageKey, content: &str) -> Result<Message, FetchError> {
        validate_content(content)?;
        let previous = self.confirmed_message(key)?;
        let mutation_id = self.allocate();
        let edited = Message {
            content: content.to_string(),
            edited: true,
            ..previous.clone()
        };
        self.store.replace_message(edited.clone());

        let request_key = ResourceKey::edit(&key.channel, mutation_id);
        let resource = request_key.to_string();
        let request = EditMessageRequest {
            server_id: key.channel.server_id.clone(),
            channel_id: key.channel.channel_id.clone(),
            message_id: key.message_id,
            content: content.to_string(),
        };
        let result = self
            .sync
            .coordinator()
            .request(
                request_key,
                remote_call(self.sync.remote().clone(), Endpoint::EditMessage, resource, request),
            )
            .await;

        match result {
            Ok(_) => {
                self.confirm(mutation_id, Some(&edited));
                Ok(edited)
            }
            Err(err) => {
                self.store.replace_message(previous);
                self.fail(mutation_id, &key.channel, &err);
                Err(err)
            }
        }
    }

    /// Removes the message locally, reinserting it on failure.
    pub async fn delete_message(&self, key: &MessageKey) -> Result<(), FetchError> {
        let previous = self.confirmed_message(key)?;
        let mutation_id = self.allocate();
        self.store.remove_message(key);

        let request_key = ResourceKey::edit(&key.channel, mutation_id);
        let resource = request_key.to_string();
        let request = DeleteMessageRequest {
            server_id: key.channel.server_id.clone(),
            channel_id: key.channel.channel_id.clone(),
            message_id: key.message_id,
        };
        let result = self
            .sync
            .coordinator()
            .request(
                request_key,
                remote_call(self.sync.remote().clone(), Endpoint::DeleteMessage, resource, request),
            )
            .await;

        match result {
            Ok(_) => {
                self.track(mutation_id, MutationState::Confirmed);
                Ok(())
            }
            Err(err) => {
                self.store.replace_message(previous);
                self.fail(mutation_id, &key.channel, &err);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/optimistic_tests.rs"]
mod tests;
