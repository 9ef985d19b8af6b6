//! Turn processing for atrium.
//!
//! Takes one coalesced turn at a time, asks the language model what the
//! client wants, drives the booking allocator accordingly, records the
//! exchange in the dialogue store and hands the reply to the outbound sinks.

pub mod credentials;
pub mod dates;
pub mod error;
pub mod gateway;
pub mod intent;
pub mod model;
pub mod processor;
pub mod prompts;
pub mod registry;
pub mod sink;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;

pub use credentials::{Credential, CredentialPool};
pub use error::{AgentError, ModelError};
pub use gateway::{AiGateway, ReplyContext};
pub use intent::{BookingRef, Classification, Intent};
pub use model::{AnthropicClient, CompletionRequest, LanguageModel, Purpose};
pub use processor::{ActionOutcome, TurnProcessor, TurnReport, FALLBACK_REPLY};
pub use registry::{ProjectEntry, ProjectRegistry};
pub use sink::{BroadcastReplySink, FanoutReplySink, OutboundReply, ReplyKind, ReplySink, WebhookReplySink};
pub use worker::TurnWorker;
