//! Error types for the conversation queue.

use atrium_core::error::AtriumError;
use atrium_core::types::ConversationKey;

use crate::types::{ConversationState, TurnId};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The conversation buffer is at capacity. Callers apply backpressure.
    #[error("Queue full for {key}: {limit} fragments pending")]
    QueueFull { key: ConversationKey, limit: usize },
    /// No in-flight attempt with this id. Usually a superseded attempt.
    #[error("Unknown or superseded turn: {0}")]
    UnknownTurn(TurnId),
    #[error("Invalid conversation transition: {0} -> {1}")]
    InvalidTransition(ConversationState, ConversationState),
    #[error("Queue is closed")]
    Closed,
    #[error("Storage error: {0}")]
    Storage(#[from] AtriumError),
}

impl QueueError {
    pub fn is_backpressure(&self) -> bool {
        matches!(self, QueueError::QueueFull { .. } | QueueError::Closed)
    }
}
