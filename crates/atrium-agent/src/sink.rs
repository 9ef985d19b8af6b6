//! Outbound reply delivery.
//!
//! Replies are persisted before they are delivered, so a delivery failure
//! is logged and never fails the turn.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use atrium_core::config::ProjectConfig;
use atrium_core::error::AtriumError;
use atrium_core::types::{ClientId, ProjectId};

use crate::error::AgentError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyKind {
    /// Answer to a processed turn.
    Turn,
    /// Static apology after the turn exhausted its retries.
    Fallback,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundReply {
    pub project_id: ProjectId,
    pub client_id: ClientId,
    pub turn_seq: u64,
    pub kind: ReplyKind,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn deliver(&self, reply: &OutboundReply) -> Result<(), AgentError>;
}

// =============================================================================
// Broadcast (operator stream)
// =============================================================================

pub struct BroadcastReplySink {
    tx: broadcast::Sender<OutboundReply>,
}

impl BroadcastReplySink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutboundReply> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl ReplySink for BroadcastReplySink {
    async fn deliver(&self, reply: &OutboundReply) -> Result<(), AgentError> {
        // No subscribers is not an error: nobody is watching the stream.
        let receivers = self.tx.send(reply.clone()).unwrap_or(0);
        debug!(receivers, client_id = %reply.client_id, "Reply broadcast");
        Ok(())
    }
}

// =============================================================================
// Webhook
// =============================================================================

/// POSTs each reply as JSON to the project's `reply_webhook`. Projects
/// without a webhook are skipped.
pub struct WebhookReplySink {
    http_client: reqwest::Client,
    webhooks: HashMap<ProjectId, String>,
}

impl WebhookReplySink {
    pub fn new(projects: &[ProjectConfig], timeout: Duration) -> Result<Self, AtriumError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AtriumError::Config(format!("Failed to build HTTP client: {}", e)))?;
        let webhooks = projects
            .iter()
            .filter_map(|p| {
                p.reply_webhook
                    .as_ref()
                    .map(|url| (ProjectId::from(p.project_id.as_str()), url.clone()))
            })
            .collect();
        Ok(Self {
            http_client,
            webhooks,
        })
    }

    pub fn configured(&self) -> usize {
        self.webhooks.len()
    }
}

#[async_trait]
impl ReplySink for WebhookReplySink {
    async fn deliver(&self, reply: &OutboundReply) -> Result<(), AgentError> {
        let Some(url) = self.webhooks.get(&reply.project_id) else {
            return Ok(());
        };
        let response = self
            .http_client
            .post(url)
            .json(reply)
            .send()
            .await
            .map_err(|e| AgentError::Delivery(format!("webhook request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(AgentError::Delivery(format!(
                "webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Fan-out
// =============================================================================

/// Delivers to every sink; one failing sink does not stop the others.
pub struct FanoutReplySink {
    sinks: Vec<Arc<dyn ReplySink>>,
}

impl FanoutReplySink {
    pub fn new(sinks: Vec<Arc<dyn ReplySink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl ReplySink for FanoutReplySink {
    async fn deliver(&self, reply: &OutboundReply) -> Result<(), AgentError> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.deliver(reply).await {
                warn!(client_id = %reply.client_id, error = %e, "Reply sink failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
