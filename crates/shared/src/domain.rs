use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

const MAX_TEXT_ID_LEN: usize = 128;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

macro_rules! text_id_newtype {
    ($name:ident, $label:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn parse(raw: impl Into<String>) -> Result<Self, ValidationError> {
                let raw = raw.into();
                validate_text_id($label, &raw)?;
                Ok(Self(raw))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValidationError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(value)
            }
        }

        impl TryFrom<&str> for $name {
            type Error = ValidationError;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                Self::parse(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

text_id_newtype!(ServerId, "server id");
text_id_newtype!(ChannelId, "channel id");
text_id_newtype!(UserId, "user id");

id_newtype!(MessageId);
id_newtype!(NotificationId);

impl From<i64> for ChannelId {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

fn validate_text_id(label: &'static str, raw: &str) -> Result<(), ValidationError> {
    if raw.is_empty() {
        return Err(ValidationError::EmptyId { label });
    }
    if raw.len() > MAX_TEXT_ID_LEN {
        return Err(ValidationError::IdTooLong {
            label,
            max: MAX_TEXT_ID_LEN,
        });
    }
    if let Some(bad) = raw
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')))
    {
        return Err(ValidationError::InvalidIdCharacter {
            label,
            value: raw.to_string(),
            character: bad,
        });
    }
    Ok(())
}

/// Synthetic ids are allocated upward from `i64::MIN`; authoritative ids are
/// never negative.
impl MessageId {
    pub const SYNTHETIC_BASE: i64 = i64::MIN;

    pub fn is_synthetic(self) -> bool {
        self.0 < 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelKey {
    pub server_id: ServerId,
    pub channel_id: ChannelId,
}

impl ChannelKey {
    pub fn new(server_id: ServerId, channel_id: ChannelId) -> Self {
        Self {
            server_id,
            channel_id,
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.server_id, self.channel_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageKey {
    pub channel: ChannelKey,
    pub message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub server_id: ServerId,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub content: String,
    pub timestamp_seconds: i64,
    pub edited: bool,
}

impl Message {
    pub fn channel_key(&self) -> ChannelKey {
        ChannelKey::new(self.server_id.clone(), self.channel_id.clone())
    }

    pub fn key(&self) -> MessageKey {
        MessageKey {
            channel: self.channel_key(),
            message_id: self.message_id,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.message_id.is_synthetic()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FriendStatus {
    None,
    PendingSent,
    PendingReceived,
    Friends,
}

/// Unordered friend relation; `user_a <= user_b` after [`FriendEdge::new`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendEdge {
    pub user_a: UserId,
    pub user_b: UserId,
    pub a_accepted: bool,
    pub b_accepted: bool,
}

impl FriendEdge {
    pub fn new(first: UserId, first_accepted: bool, second: UserId, second_accepted: bool) -> Self {
        if first <= second {
            Self {
                user_a: first,
                user_b: second,
                a_accepted: first_accepted,
                b_accepted: second_accepted,
            }
        } else {
            Self {
                user_a: second,
                user_b: first,
                a_accepted: second_accepted,
                b_accepted: first_accepted,
            }
        }
    }

    pub fn pair(&self) -> (&UserId, &UserId) {
        (&self.user_a, &self.user_b)
    }

    pub fn involves(&self, user: &UserId) -> bool {
        &self.user_a == user || &self.user_b == user
    }

    pub fn other(&self, viewer: &UserId) -> Option<&UserId> {
        if &self.user_a == viewer {
            Some(&self.user_b)
        } else if &self.user_b == viewer {
            Some(&self.user_a)
        } else {
            None
        }
    }

    pub fn status_for(&self, viewer: &UserId) -> FriendStatus {
        let (mine, theirs) = if &self.user_a == viewer {
            (self.a_accepted, self.b_accepted)
        } else if &self.user_b == viewer {
            (self.b_accepted, self.a_accepted)
        } else {
            return FriendStatus::None;
        };
        match (mine, theirs) {
            (true, true) => FriendStatus::Friends,
            (true, false) => FriendStatus::PendingSent,
            (false, true) => FriendStatus::PendingReceived,
            (false, false) => FriendStatus::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: UserId,
    pub username: Option<String>,
    pub display_pfp_ref: Option<String>,
    pub primary_name: Option<String>,
    pub friends: Vec<FriendEdge>,
    pub synced_at_millis: i64,
}

impl Profile {
    pub fn empty(user_id: UserId, synced_at_millis: i64) -> Self {
        Self {
            user_id,
            username: None,
            display_pfp_ref: None,
            primary_name: None,
            friends: Vec::new(),
            synced_at_millis,
        }
    }

    /// Preferred label: primary name, then username, then the raw id.
    pub fn display_name(&self) -> String {
        self.primary_name
            .clone()
            .or_else(|| self.username.clone())
            .unwrap_or_else(|| self.user_id.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub channel_id: ChannelId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub user_id: UserId,
    pub nickname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub server_id: ServerId,
    pub name: String,
    pub icon_ref: Option<String>,
    pub member_count: u64,
    pub owner_id: UserId,
    pub channels: Vec<Channel>,
    pub members: Vec<Member>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub notification_id: NotificationId,
    pub user_id: UserId,
    pub server_id: ServerId,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub author_name: String,
    pub content: String,
    pub timestamp_seconds: i64,
    pub read: bool,
}

impl Notification {
    pub fn channel_key(&self) -> ChannelKey {
        ChannelKey::new(self.server_id.clone(), self.channel_id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub data: T,
    pub fetched_at_millis: i64,
}

impl<T> CacheEntry<T> {
    pub fn new(data: T, fetched_at_millis: i64) -> Self {
        Self {
            data,
            fetched_at_millis,
        }
    }

    pub fn age_millis(&self, now_millis: i64) -> i64 {
        now_millis.saturating_sub(self.fetched_at_millis).max(0)
    }
}
