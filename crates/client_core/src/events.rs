use shared::domain::{ChannelKey, MessageId, UserId};

use crate::optimistic::MutationId;

/// Engine-level events for the presentation layer. Cache value changes are
/// delivered separately through [`crate::store::Subscription`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A transient failure persisted past the notice threshold. Raised once
    /// per failure streak.
    Notice { resource: String, message: String },
    /// The resource stays blocked until a manual reset.
    CircuitOpened { resource: String },
    MutationConfirmed {
        mutation_id: MutationId,
        channel: ChannelKey,
        message_id: MessageId,
    },
    /// The speculative write has already been rolled back when this fires.
    MutationFailed {
        mutation_id: MutationId,
        channel: ChannelKey,
        reason: String,
    },
    IdentityChanged(Option<UserId>),
}
