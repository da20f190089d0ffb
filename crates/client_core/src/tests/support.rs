use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use shared::{
    domain::{ChannelId, ChannelKey, Notification, NotificationId, ServerId, UserId},
    error::ErrorCode,
    protocol::{CallMethod, Endpoint},
};

use crate::{
    clock::ManualClock,
    error::FetchError,
    remote::{RemoteResponse, RemoteSource},
};

pub const T0: i64 = 1_700_000_000_000;

#[derive(Debug, Clone)]
pub enum Reply {
    Json(Value),
    Status(u16, ErrorCode, &'static str),
    Transport(&'static str),
}

/// Scripted remote: queued replies are consumed first, then the endpoint's
/// standing reply. Unscripted endpoints fail at the transport.
#[derive(Default)]
pub struct FakeRemote {
    queued: Mutex<HashMap<&'static str, VecDeque<Reply>>>,
    standing: Mutex<HashMap<&'static str, Reply>>,
    calls: Mutex<Vec<(String, Value)>>,
    delay: Mutex<Option<Duration>>,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn always(&self, endpoint: Endpoint, reply: Reply) {
        self.standing.lock().insert(endpoint.as_str(), reply);
    }

    pub fn once(&self, endpoint: Endpoint, reply: Reply) {
        self.queued
            .lock()
            .entry(endpoint.as_str())
            .or_default()
            .push_back(reply);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn calls(&self, endpoint: Endpoint) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|(name, _)| name == endpoint.as_str())
            .count()
    }

    pub fn bodies(&self, endpoint: Endpoint) -> Vec<Value> {
        self.calls
            .lock()
            .iter()
            .filter(|(name, _)| name == endpoint.as_str())
            .map(|(_, body)| body.clone())
            .collect()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().len()
    }

    fn next_reply(&self, endpoint: &str) -> Reply {
        if let Some(reply) = self
            .queued
            .lock()
            .get_mut(endpoint)
            .and_then(VecDeque::pop_front)
        {
            return reply;
        }
        self.standing
            .lock()
            .get(endpoint)
            .cloned()
            .unwrap_or(Reply::Transport("no reply scripted"))
    }
}

#[async_trait]
impl RemoteSource for FakeRemote {
    async fn fetch_resource(
        &self,
        endpoint: &str,
        _method: CallMethod,
        body: Value,
    ) -> Result<RemoteResponse, FetchError> {
        self.calls.lock().push((endpoint.to_string(), body));
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.next_reply(endpoint) {
            Reply::Json(value) => Ok(RemoteResponse::ok(value)),
            Reply::Status(status, code, message) => {
                Ok(RemoteResponse::error(status, code, message))
            }
            Reply::Transport(message) => Err(FetchError::Network(message.to_string())),
        }
    }
}

pub fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(T0))
}

pub fn user(id: &str) -> UserId {
    UserId::parse(id).expect("valid user id")
}

pub fn server(id: &str) -> ServerId {
    ServerId::parse(id).expect("valid server id")
}

pub fn channel(server_id: &str, channel_id: &str) -> ChannelKey {
    ChannelKey::new(
        server(server_id),
        ChannelId::parse(channel_id).expect("valid channel id"),
    )
}

pub fn message_json(id: i64, channel: &ChannelKey, author: &str, content: &str, ts: i64) -> Value {
    json!({
        "message_id": id,
        "server_id": channel.server_id.as_str(),
        "channel_id": channel.channel_id.as_str(),
        "author_id": author,
        "content": content,
        "timestamp_seconds": ts
    })
}

pub fn notification(id: i64, recipient: &str, channel: &ChannelKey, ts: i64) -> Notification {
    Notification {
        notification_id: NotificationId(id),
        user_id: user(recipient),
        server_id: channel.server_id.clone(),
        channel_id: channel.channel_id.clone(),
        author_id: user("alice"),
        author_name: "Alice".to_string(),
        content: format!("mention {id}"),
        timestamp_seconds: ts,
        read: false,
    }
}

pub fn notification_json(id: i64, recipient: &str, channel: &ChannelKey, ts: i64) -> Value {
    json!({
        "notification_id": id,
        "user_id": recipient,
        "server_id": channel.server_id.as_str(),
        "channel_id": channel.channel_id.as_str(),
        "author_id": "alice",
        "author_name": "Alice",
        "content": format!("mention {id}"),
        "timestamp_seconds": ts
    })
}
