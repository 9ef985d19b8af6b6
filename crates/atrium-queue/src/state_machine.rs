//! Conversation state machine with validated transitions.
//!
//! Idle -> Collecting -> InFlight -> Idle | Collecting | InFlight

use crate::error::QueueError;
use crate::types::ConversationState;

/// Validate that a conversation state transition is allowed.
///
/// Valid transitions:
/// - Idle -> Collecting (first fragment)
/// - Collecting -> InFlight (flush)
/// - InFlight -> Idle (resolved, nothing buffered)
/// - InFlight -> Collecting (resolved, fragments arrived meanwhile)
/// - InFlight -> InFlight (retry, or immediate flush of the next turn)
pub fn validate_transition(
    from: ConversationState,
    to: ConversationState,
) -> Result<(), QueueError> {
    let valid = matches!(
        (from, to),
        (ConversationState::Idle, ConversationState::Collecting)
            | (ConversationState::Collecting, ConversationState::InFlight)
            | (ConversationState::InFlight, ConversationState::Idle)
            | (ConversationState::InFlight, ConversationState::Collecting)
            | (ConversationState::InFlight, ConversationState::InFlight)
    );

    if valid {
        Ok(())
    } else {
        Err(QueueError::InvalidTransition(from, to))
    }
}
