use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use atrium_core::types::ConversationKey;

// =============================================================================
// ConversationState
// =============================================================================

/// Processing state of one conversation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    /// Nothing buffered, nothing in flight.
    Idle,
    /// Fragments buffered, waiting for the debounce window to close.
    Collecting,
    /// One turn is being processed.
    InFlight,
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationState::Idle => write!(f, "idle"),
            ConversationState::Collecting => write!(f, "collecting"),
            ConversationState::InFlight => write!(f, "in_flight"),
        }
    }
}

impl FromStr for ConversationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(ConversationState::Idle),
            "collecting" => Ok(ConversationState::Collecting),
            "in_flight" => Ok(ConversationState::InFlight),
            _ => Err(format!("Unknown conversation state: {}", s)),
        }
    }
}

// =============================================================================
// Turn
// =============================================================================

/// Identifier of one processing attempt of a turn.
///
/// A retried turn keeps its sequence number but gets a fresh id, so a late
/// completion from a superseded attempt can be told apart and ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TurnId(pub Uuid);

impl TurnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TurnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One raw inbound message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub text: String,
    pub received_at: DateTime<Utc>,
}

/// Immutable snapshot of coalesced input handed to the turn processor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub id: TurnId,
    pub key: ConversationKey,
    /// Per-conversation sequence number, gapless, shared by all attempts.
    pub seq: u64,
    /// Fragments in arrival order.
    pub fragments: Vec<Fragment>,
    /// 1 for the first attempt.
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    /// Fragments joined into the text the model sees.
    pub fn text(&self) -> String {
        self.fragments
            .iter()
            .map(|f| f.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Same input, next attempt.
    pub(crate) fn retry(&self, now: DateTime<Utc>) -> Turn {
        Turn {
            id: TurnId::new(),
            key: self.key.clone(),
            seq: self.seq,
            fragments: self.fragments.clone(),
            attempt: self.attempt + 1,
            created_at: now,
        }
    }
}

/// Result reported by the turn processor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TurnOutcome {
    Success,
    Failure(String),
}

/// Work item emitted by the queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// Process this turn.
    Turn(Turn),
    /// Retries are exhausted; send the static fallback reply for this turn.
    Fallback { turn: Turn, reason: String },
}

impl Dispatch {
    pub fn turn(&self) -> &Turn {
        match self {
            Dispatch::Turn(turn) | Dispatch::Fallback { turn, .. } => turn,
        }
    }
}

/// Accepted outcomes of `enqueue`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EnqueueResult {
    /// Buffered for the turn currently being collected.
    Accepted { pending: usize },
    /// A turn is in flight; buffered for the next one.
    Held { pending: usize },
}

impl EnqueueResult {
    pub fn pending(&self) -> usize {
        match self {
            EnqueueResult::Accepted { pending } | EnqueueResult::Held { pending } => *pending,
        }
    }
}

// =============================================================================
// Introspection
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    pub key: ConversationKey,
    pub state: ConversationState,
    pub pending: usize,
    pub next_seq: u64,
    pub in_flight_attempt: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub conversations: usize,
    pub idle: usize,
    pub collecting: usize,
    pub in_flight: usize,
    pub pending_fragments: usize,
}
