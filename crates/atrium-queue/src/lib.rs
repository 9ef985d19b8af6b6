//! Conversation queue for atrium.
//!
//! Coalesces bursts of client messages into turns, keeps at most one turn
//! in flight per conversation, and applies the retry and fallback policy
//! when processing fails or stalls.

pub mod driver;
pub mod error;
pub mod queue;
pub mod state_machine;
pub mod types;

pub use driver::QueueDriver;
pub use error::QueueError;
pub use queue::ConversationQueue;
pub use types::{
    ConversationState, ConversationSnapshot, Dispatch, EnqueueResult, Fragment, QueueStats, Turn,
    TurnId, TurnOutcome,
};
