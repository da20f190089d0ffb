use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error codes the remote attaches to non-200 responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    NotFound,
    Unsupported,
    Validation,
    RateLimited,
    Internal,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Input rejected before it reaches the network or the store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{label} must not be empty")]
    EmptyId { label: &'static str },
    #[error("{label} exceeds {max} characters")]
    IdTooLong { label: &'static str, max: usize },
    #[error("{label} '{value}' contains invalid character {character:?}")]
    InvalidIdCharacter {
        label: &'static str,
        value: String,
        character: char,
    },
    #[error("message content must not be empty")]
    EmptyContent,
    #[error("message content exceeds {max} characters")]
    ContentTooLong { max: usize },
    #[error("message {message_id} is not in the local cache")]
    UnknownMessage { message_id: i64 },
    #[error("message {message_id} has not been confirmed yet")]
    PendingMessage { message_id: i64 },
    #[error("malformed {schema} payload: {reason}")]
    MalformedPayload { schema: &'static str, reason: String },
}
