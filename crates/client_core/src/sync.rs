//! Coordinated reads that land in the entity store.

use std::{sync::Arc, time::Duration};

use shared::{
    domain::{CacheEntry, ChannelKey, Member, Message, Profile, Server, ServerId, UserId},
    protocol::{
        decode, Endpoint, GetMessagesRequest, GetProfilesRequest, JoinedServersRequest,
        JoinedServersResponse, MembersResponse, MemberRecord, MessageRecord, MessagesResponse,
        ProfilesResponse, ServerRecord, ServerRequest,
    },
    error::ValidationError,
};
use tracing::{debug, warn};

use crate::{
    clock::Clock,
    error::FetchError,
    fetch::{FetchCoordinator, ResourceKey},
    remote::{remote_call, RemoteSource},
    store::EntityStore,
    task::{sleep_or_shutdown, PollHandle},
};

#[derive(Clone)]
pub struct RemoteSync {
    remote: Arc<dyn RemoteSource>,
    coordinator: FetchCoordinator,
    store: Arc<EntityStore>,
    clock: Arc<dyn Clock>,
    message_page_size: u32,
}

impl RemoteSync {
    pub fn new(
        remote: Arc<dyn RemoteSource>,
        coordinator: FetchCoordinator,
        store: Arc<EntityStore>,
        clock: Arc<dyn Clock>,
        message_page_size: u32,
    ) -> Self {
        Self {
            remote,
            coordinator,
            store,
            clock,
            message_page_size,
        }
    }

    pub fn remote(&self) -> &Arc<dyn RemoteSource> {
        &self.remote
    }

    pub fn coordinator(&self) -> &FetchCoordinator {
        &self.coordinator
    }

    async fn call<B>(
        &self,
        key: ResourceKey,
        endpoint: Endpoint,
        body: B,
    ) -> Result<(serde_json::Value, Option<UserId>), FetchError>
    where
        B: serde::Serialize + Clone + Send + Sync + 'static,
    {
        let scope = self.store.identity();
        let resource = key.to_string();
        let value = self
            .coordinator
            .request(key, remote_call(self.remote.clone(), endpoint, resource, body))
            .await?;
        Ok((value, scope))
    }

    /// Results fetched under a previous identity are dropped.
    fn ensure_scope(&self, scope: &Option<UserId>, resource: &str) -> Result<(), FetchError> {
        if &self.store.identity() != scope {
            debug!(resource, "dropping result fetched under a previous identity");
            return Err(FetchError::Aborted {
                resource: resource.to_string(),
            });
        }
        Ok(())
    }

    pub async fn refresh_messages(&self, channel: &ChannelKey) -> Result<Vec<Message>, FetchError> {
        self.load_messages(ResourceKey::messages(channel), channel).await
    }

    /// Same read as [`Self::refresh_messages`] under a per-mutation key.
    pub async fn reconcile_messages(
        &self,
        channel: &ChannelKey,
        mutation_id: u64,
    ) -> Result<Vec<Message>, FetchError> {
        self.load_messages(ResourceKey::reconcile(channel, mutation_id), channel)
            .await
    }

    async fn load_messages(
        &self,
        key: ResourceKey,
        channel: &ChannelKey,
    ) -> Result<Vec<Message>, FetchError> {
        let resource = key.to_string();
        let request = GetMessagesRequest {
            server_id: channel.server_id.clone(),
            channel_id: channel.channel_id.clone(),
            limit: self.message_page_size,
            before: None,
        };
        let (value, scope) = self.call(key, Endpoint::GetMessages, request).await?;
        let response: MessagesResponse = decode("messages", value)?;
        let messages = response
            .messages
            .into_iter()
            .map(MessageRecord::into_domain)
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(stray) = messages.iter().find(|m| &m.channel_key() != channel) {
            return Err(ValidationError::MalformedPayload {
                schema: "messages",
                reason: format!("message {} belongs to {}", stray.message_id, stray.channel_key()),
            }
            .into());
        }
        self.ensure_scope(&scope, &resource)?;
        self.store
            .upsert_messages(channel, messages.clone(), self.clock.now_millis());
        Ok(messages)
    }

    pub async fn refresh_server(&self, server: &ServerId) -> Result<Server, FetchError> {
        let key = ResourceKey::server(server);
        let resource = key.to_string();
        let request = ServerRequest {
            server_id: server.clone(),
        };
        let (value, scope) = self.call(key, Endpoint::GetServer, request).await?;
        let record: ServerRecord = decode("server", value)?;
        let snapshot = record.into_domain()?;
        if &snapshot.server_id != server {
            return Err(ValidationError::MalformedPayload {
                schema: "server",
                reason: format!("asked for {server}, received {}", snapshot.server_id),
            }
            .into());
        }
        self.ensure_scope(&scope, &resource)?;
        self.store
            .upsert_server(CacheEntry::new(snapshot.clone(), self.clock.now_millis()));
        Ok(snapshot)
    }

    pub async fn refresh_members(&self, server: &ServerId) -> Result<Vec<Member>, FetchError> {
        let key = ResourceKey::members(server);
        let resource = key.to_string();
        let request = ServerRequest {
            server_id: server.clone(),
        };
        let (value, scope) = self.call(key, Endpoint::GetServerMembers, request).await?;
        let response: MembersResponse = decode("members", value)?;
        let members = response
            .members
            .into_iter()
            .map(MemberRecord::into_domain)
            .collect::<Result<Vec<_>, _>>()?;
        self.ensure_scope(&scope, &resource)?;
        self.store
            .upsert_members(server, members.clone(), self.clock.now_millis());
        Ok(members)
    }

    pub async fn refresh_joined(&self, user: &UserId) -> Result<Vec<ServerId>, FetchError> {
        let key = ResourceKey::joined_servers(user);
        let resource = key.to_string();
        let request = JoinedServersRequest {
            user_id: user.clone(),
        };
        let (value, scope) = self.call(key, Endpoint::GetJoinedServers, request).await?;
        let response: JoinedServersResponse = decode("joined_servers", value)?;
        let mut servers = response
            .server_ids
            .into_iter()
            .map(ServerId::parse)
            .collect::<Result<Vec<_>, _>>()?;
        servers.sort();
        servers.dedup();
        self.ensure_scope(&scope, &resource)?;
        self.store
            .set_joined_servers(servers.clone(), self.clock.now_millis());
        Ok(servers)
    }

    /// Fetches one batch. Requested users the remote does not know still get
    /// an empty profile so they read as synced.
    pub async fn refresh_profiles(&self, batch: Vec<UserId>) -> Result<Vec<Profile>, FetchError> {
        let key = ResourceKey::profiles(&batch);
        let resource = key.to_string();
        let request = GetProfilesRequest {
            user_ids: batch.clone(),
        };
        let (value, scope) = self.call(key, Endpoint::GetProfiles, request).await?;
        let response: ProfilesResponse = decode("profiles", value)?;
        let synced_at = self.clock.now_millis();
        let mut profiles = response
            .profiles
            .into_iter()
            .map(|record| record.into_domain(synced_at))
            .collect::<Result<Vec<_>, _>>()?;
        for user in batch {
            if !profiles.iter().any(|p| p.user_id == user) {
                profiles.push(Profile::empty(user, synced_at));
            }
        }
        self.ensure_scope(&scope, &resource)?;
        self.store.upsert_profiles(profiles.clone());
        Ok(profiles)
    }
}

/// Periodic refresh of the open channel. The first refresh runs immediately.
pub fn start_message_poller(sync: RemoteSync, channel: ChannelKey, interval: Duration) -> PollHandle {
    PollHandle::spawn(format!("messages:{channel}"), move |mut shutdown| async move {
        loop {
            match sync.refresh_messages(&channel).await {
                Ok(messages) => debug!(channel = %channel, count = messages.len(), "channel refreshed"),
                Err(FetchError::RateLimited { .. } | FetchError::Aborted { .. }) => {}
                Err(err) => warn!(channel = %channel, "channel refresh failed: {err}"),
            }
            if sleep_or_shutdown(&mut shutdown, interval).await {
                break;
            }
        }
    })
}
