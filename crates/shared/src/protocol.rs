//! Request and response schemas for the remote compute calls.
//!
//! Every response is decoded into a `*Record` type and then converted into a
//! domain entity with `into_domain`, which is where ids and required fields are
//! validated. Nothing loosely typed crosses into the entity store.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    domain::{
        Channel, ChannelId, FriendEdge, Member, Message, MessageId, Notification, NotificationId,
        Profile, Server, ServerId, UserId,
    },
    error::ValidationError,
};

pub const MAX_MESSAGE_CONTENT_CHARS: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallMethod {
    Query,
    Update,
}

impl CallMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Update => "update",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    GetMessages,
    SendMessage,
    EditMessage,
    DeleteMessage,
    GetProfiles,
    GetServer,
    GetServerMembers,
    GetJoinedServers,
    GetNotifications,
    MarkNotificationsRead,
}

impl Endpoint {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GetMessages => "get_messages",
            Self::SendMessage => "send_message",
            Self::EditMessage => "edit_message",
            Self::DeleteMessage => "delete_message",
            Self::GetProfiles => "get_profiles",
            Self::GetServer => "get_server",
            Self::GetServerMembers => "get_server_members",
            Self::GetJoinedServers => "get_joined_servers",
            Self::GetNotifications => "get_notifications",
            Self::MarkNotificationsRead => "mark_notifications_read",
        }
    }

    pub fn method(self) -> CallMethod {
        match self {
            Self::SendMessage
            | Self::EditMessage
            | Self::DeleteMessage
            | Self::MarkNotificationsRead => CallMethod::Update,
            _ => CallMethod::Query,
        }
    }
}

pub fn decode<T: DeserializeOwned>(
    schema: &'static str,
    value: serde_json::Value,
) -> Result<T, ValidationError> {
    serde_json::from_value(value).map_err(|err| ValidationError::MalformedPayload {
        schema,
        reason: err.to_string(),
    })
}

pub fn validate_content(content: &str) -> Result<(), ValidationError> {
    if content.trim().is_empty() {
        return Err(ValidationError::EmptyContent);
    }
    if content.chars().count() > MAX_MESSAGE_CONTENT_CHARS {
        return Err(ValidationError::ContentTooLong {
            max: MAX_MESSAGE_CONTENT_CHARS,
        });
    }
    Ok(())
}

fn malformed(schema: &'static str, reason: impl Into<String>) -> ValidationError {
    ValidationError::MalformedPayload {
        schema,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GetMessagesRequest {
    pub server_id: ServerId,
    pub channel_id: ChannelId,
    pub limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_id: i64,
    pub server_id: String,
    pub channel_id: String,
    pub author_id: String,
    pub content: String,
    pub timestamp_seconds: i64,
    #[serde(default)]
    pub edited: bool,
}

impl MessageRecord {
    pub fn into_domain(self) -> Result<Message, ValidationError> {
        if self.message_id < 0 {
            return Err(malformed(
                "message",
                format!("authoritative message id {} is negative", self.message_id),
            ));
        }
        Ok(Message {
            message_id: MessageId(self.message_id),
            server_id: ServerId::parse(self.server_id)?,
            channel_id: ChannelId::parse(self.channel_id)?,
            author_id: UserId::parse(self.author_id)?,
            content: self.content,
            timestamp_seconds: self.timestamp_seconds,
            edited: self.edited,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub messages: Vec<MessageRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SendMessageRequest {
    pub server_id: ServerId,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendMessageResponse {
    #[serde(default)]
    pub message_id: Option<i64>,
    #[serde(default)]
    pub timestamp_seconds: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EditMessageRequest {
    pub server_id: ServerId,
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteMessageRequest {
    pub server_id: ServerId,
    pub channel_id: ChannelId,
    pub message_id: MessageId,
}

#[derive(Debug, Clone, Serialize)]
pub struct GetProfilesRequest {
    pub user_ids: Vec<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendRecord {
    pub user_a: String,
    pub user_b: String,
    #[serde(default)]
    pub a_accepted: bool,
    #[serde(default)]
    pub b_accepted: bool,
}

impl FriendRecord {
    pub fn into_domain(self) -> Result<FriendEdge, ValidationError> {
        let a = UserId::parse(self.user_a)?;
        let b = UserId::parse(self.user_b)?;
        if a == b {
            return Err(malformed("friend", "friend edge must join two users"));
        }
        Ok(FriendEdge::new(a, self.a_accepted, b, self.b_accepted))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub user_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub display_pfp_ref: Option<String>,
    #[serde(default)]
    pub primary_name: Option<String>,
    #[serde(default)]
    pub friends: Vec<FriendRecord>,
}

impl ProfileRecord {
    pub fn into_domain(self, synced_at_millis: i64) -> Result<Profile, ValidationError> {
        let friends = self
            .friends
            .into_iter()
            .map(FriendRecord::into_domain)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Profile {
            user_id: UserId::parse(self.user_id)?,
            username: self.username.filter(|v| !v.is_empty()),
            display_pfp_ref: self.display_pfp_ref.filter(|v| !v.is_empty()),
            primary_name: self.primary_name.filter(|v| !v.is_empty()),
            friends,
            synced_at_millis,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfilesResponse {
    pub profiles: Vec<ProfileRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerRequest {
    pub server_id: ServerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub channel_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberRecord {
    pub user_id: String,
    #[serde(default)]
    pub nickname: Option<String>,
}

impl MemberRecord {
    pub fn into_domain(self) -> Result<Member, ValidationError> {
        Ok(Member {
            user_id: UserId::parse(self.user_id)?,
            nickname: self.nickname.filter(|v| !v.is_empty()),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRecord {
    pub server_id: String,
    pub name: String,
    #[serde(default)]
    pub icon_ref: Option<String>,
    #[serde(default)]
    pub member_count: Option<u64>,
    pub owner_id: String,
    #[serde(default)]
    pub channels: Vec<ChannelRecord>,
    #[serde(default)]
    pub members: Vec<MemberRecord>,
}

impl ServerRecord {
    pub fn into_domain(self) -> Result<Server, ValidationError> {
        let channels = self
            .channels
            .into_iter()
            .map(|c| {
                Ok(Channel {
                    channel_id: ChannelId::parse(c.channel_id)?,
                    name: c.name,
                })
            })
            .collect::<Result<Vec<_>, ValidationError>>()?;
        let members = self
            .members
            .into_iter()
            .map(MemberRecord::into_domain)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Server {
            server_id: ServerId::parse(self.server_id)?,
            name: self.name,
            icon_ref: self.icon_ref.filter(|v| !v.is_empty()),
            member_count: self.member_count.unwrap_or(members.len() as u64),
            owner_id: UserId::parse(self.owner_id)?,
            channels,
            members,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembersResponse {
    pub members: Vec<MemberRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JoinedServersRequest {
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinedServersResponse {
    pub server_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationsRequest {
    pub user_id: UserId,
    pub limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub notification_id: i64,
    pub user_id: String,
    pub server_id: String,
    pub channel_id: String,
    pub author_id: String,
    #[serde(default)]
    pub author_name: Option<String>,
    pub content: String,
    pub timestamp_seconds: i64,
}

impl NotificationRecord {
    /// Remote batches only carry new items, so every record enters unread.
    pub fn into_domain(self) -> Result<Notification, ValidationError> {
        let author_id = UserId::parse(self.author_id)?;
        let author_name = self
            .author_name
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| author_id.to_string());
        Ok(Notification {
            notification_id: NotificationId(self.notification_id),
            user_id: UserId::parse(self.user_id)?,
            server_id: ServerId::parse(self.server_id)?,
            channel_id: ChannelId::parse(self.channel_id)?,
            author_id,
            author_name,
            content: self.content,
            timestamp_seconds: self.timestamp_seconds,
            read: false,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsResponse {
    pub notifications: Vec<NotificationRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarkReadRequest {
    pub user_id: UserId,
    pub server_id: ServerId,
    pub channel_id: ChannelId,
    pub notification_ids: Vec<NotificationId>,
}
