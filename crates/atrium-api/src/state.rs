//! Application state shared across all route handlers.
//!
//! AppState holds references to the queue, the project registry, the
//! dialogue store and the outbound streams. It is passed to handlers via
//! axum's State extractor.

use std::sync::Arc;
use std::time::Instant;

use atrium_agent::{BroadcastReplySink, ProjectEntry, ProjectRegistry};
use atrium_core::clock::Clock;
use atrium_core::config::AtriumConfig;
use atrium_core::types::ProjectId;
use atrium_mirror::Reconciler;
use atrium_queue::ConversationQueue;
use atrium_storage::DialogueRepository;

use crate::error::ApiError;
use crate::rate_limit::ClientRateLimiter;

/// Shared application state.
///
/// Cloned into every handler; shared parts sit behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (read-only at runtime).
    pub config: Arc<AtriumConfig>,
    /// Inbound message queue.
    pub queue: Arc<ConversationQueue>,
    /// Projects with their allocators.
    pub projects: Arc<ProjectRegistry>,
    /// Dialogue history.
    pub dialogues: Arc<DialogueRepository>,
    /// Outbound replies, re-broadcast on the operator stream.
    pub replies: Arc<BroadcastReplySink>,
    /// Mirror reconciliation, when the mirror is enabled.
    pub reconciler: Option<Arc<Reconciler>>,
    /// Per-client inbound message limit.
    pub client_limiter: ClientRateLimiter,
    pub clock: Arc<dyn Clock>,
    /// Bearer token for protected routes.
    pub api_token: String,
    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        config: AtriumConfig,
        queue: Arc<ConversationQueue>,
        projects: Arc<ProjectRegistry>,
        dialogues: Arc<DialogueRepository>,
        replies: Arc<BroadcastReplySink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let client_limiter =
            ClientRateLimiter::new(config.api.max_messages_per_minute, Arc::clone(&clock));
        Self {
            config: Arc::new(config),
            queue,
            projects,
            dialogues,
            replies,
            reconciler: None,
            client_limiter,
            clock,
            api_token: String::new(),
            start_time: Instant::now(),
        }
    }

    pub fn with_reconciler(mut self, reconciler: Arc<Reconciler>) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    /// Registered project or 404.
    pub fn project(&self, project_id: &str) -> Result<Arc<ProjectEntry>, ApiError> {
        self.projects
            .get(&ProjectId::from(project_id))
            .ok_or_else(|| ApiError::NotFound(format!("Unknown project: {}", project_id)))
    }
}
