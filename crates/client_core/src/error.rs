use shared::error::ValidationError;
use thiserror::Error;

/// Errors surfaced by the fetch coordinator and everything routed through it.
///
/// `Clone` because a single in-flight result is shared by every caller that
/// joined it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),
    #[error("{resource} is rate limited; retry in {retry_after_ms} ms")]
    RateLimited {
        resource: String,
        retry_after_ms: u64,
    },
    #[error("{resource} is invalid: {reason}")]
    InvalidResource { resource: String, reason: String },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("fetch for {resource} was superseded or cancelled")]
    Aborted { resource: String },
    #[error("remote returned status {status}: {message}")]
    Remote { status: u16, message: String },
    #[error("no current identity")]
    NoIdentity,
}

impl FetchError {
    /// Failures worth repeating with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Remote { .. })
    }

    /// Failures the UI should hide unless they persist.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Remote { .. } | Self::RateLimited { .. }
        )
    }

    /// Terminal until the user explicitly resets the resource.
    pub fn requires_user_action(&self) -> bool {
        matches!(self, Self::InvalidResource { .. })
    }
}
