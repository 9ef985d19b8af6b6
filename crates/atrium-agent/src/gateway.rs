//! The three logical model calls of a turn, plus history compression.
//!
//! Each call is tried on every available credential before it fails with
//! `AiUnavailable`. Rate-limited credentials are put into cooldown. Retrying
//! the turn itself is the queue's job.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use serde::Serialize;
use tracing::{debug, warn};

use atrium_core::config::{AiConfig, ProjectConfig};
use atrium_core::error::AtriumError;
use atrium_core::types::{Booking, ConversationKey};
use atrium_storage::HistoryCompressor;

use crate::credentials::CredentialPool;
use crate::error::{AgentError, ModelError};
use crate::intent::{parse_classification, parse_reply, parse_service, Classification, Intent};
use crate::model::{AnthropicClient, CompletionRequest, LanguageModel, Purpose};
use crate::processor::ActionOutcome;
use crate::prompts;

/// Output budget for the short classification calls.
const CLASSIFY_MAX_TOKENS: u32 = 300;

/// Everything the reply call needs besides the turn itself.
#[derive(Clone, Debug, Serialize)]
pub struct ReplyContext {
    pub project_name: String,
    pub today: NaiveDate,
    pub now: NaiveTime,
    pub calendar: String,
    pub services: BTreeMap<String, u32>,
    pub specialists: Vec<String>,
    pub client_bookings: Vec<Booking>,
    pub zip_history: Option<String>,
}

pub struct AiGateway {
    model: Arc<dyn LanguageModel>,
    pool: CredentialPool,
    max_tokens: u32,
}

impl AiGateway {
    pub fn new(model: Arc<dyn LanguageModel>, pool: CredentialPool, max_tokens: u32) -> Self {
        Self {
            model,
            pool,
            max_tokens,
        }
    }

    /// Anthropic client with the configured key pool.
    pub fn from_config(config: &AiConfig) -> Result<Self, AtriumError> {
        let model = Arc::new(AnthropicClient::new(config)?);
        let pool = CredentialPool::new(
            config.api_keys.clone(),
            Duration::from_secs(config.rate_limit_cooldown_secs),
        );
        if pool.is_empty() {
            warn!("No AI credentials configured; every turn will fall back");
        }
        Ok(Self::new(model, pool, config.max_tokens))
    }

    pub fn credentials(&self) -> &CredentialPool {
        &self.pool
    }

    async fn complete(&self, request: CompletionRequest) -> Result<String, AgentError> {
        let rotation = self.pool.rotation().await;
        if rotation.is_empty() {
            let cooling = self.pool.cooling_down().await;
            let last = if cooling > 0 {
                format!("all {} credentials in rate-limit cooldown", cooling)
            } else {
                "no credential available".to_string()
            };
            return Err(AgentError::AiUnavailable { attempts: 0, last });
        }

        let attempts = rotation.len();
        let mut last = String::new();
        for credential in rotation {
            match self.model.complete(credential.key(), &request).await {
                Ok(text) => {
                    debug!(
                        purpose = %request.purpose,
                        credential = credential.index,
                        response_chars = text.len(),
                        "Completion received"
                    );
                    return Ok(text);
                }
                Err(ModelError::RateLimited(detail)) => {
                    self.pool.record_rate_limit(&credential).await;
                    last = ModelError::RateLimited(detail).to_string();
                }
                Err(e) => {
                    warn!(
                        purpose = %request.purpose,
                        credential = credential.index,
                        error = %e,
                        "Completion failed, trying next credential"
                    );
                    last = e.to_string();
                }
            }
        }
        Err(AgentError::AiUnavailable { attempts, last })
    }

    pub async fn classify_intent(
        &self,
        project: &ProjectConfig,
        calendar: &str,
        history: &str,
        turn_text: &str,
        today: NaiveDate,
    ) -> Result<Classification, AgentError> {
        let raw = self
            .complete(CompletionRequest {
                purpose: Purpose::Intent,
                system: Some(prompts::INTENT_SYSTEM.to_string()),
                prompt: prompts::intent_prompt(project, calendar, history, turn_text),
                max_tokens: CLASSIFY_MAX_TOKENS,
            })
            .await?;
        Ok(parse_classification(&raw, today))
    }

    /// The configured service the client means, as `(name, slots)`.
    pub async fn identify_service(
        &self,
        project: &ProjectConfig,
        turn_text: &str,
    ) -> Result<Option<(String, u32)>, AgentError> {
        if project.services.is_empty() {
            return Ok(None);
        }
        let raw = self
            .complete(CompletionRequest {
                purpose: Purpose::Service,
                system: Some(prompts::SERVICE_SYSTEM.to_string()),
                prompt: prompts::service_prompt(project, turn_text),
                max_tokens: CLASSIFY_MAX_TOKENS,
            })
            .await?;
        Ok(parse_service(&raw, project))
    }

    pub async fn generate_reply(
        &self,
        context: &ReplyContext,
        history: &str,
        turn_text: &str,
        intent: &Intent,
        outcome: &ActionOutcome,
    ) -> Result<String, AgentError> {
        let raw = self
            .complete(CompletionRequest {
                purpose: Purpose::Reply,
                system: Some(prompts::REPLY_SYSTEM.to_string()),
                prompt: prompts::reply_prompt(context, history, turn_text, intent, outcome),
                max_tokens: self.max_tokens,
            })
            .await?;
        parse_reply(&raw).ok_or_else(|| AgentError::InvalidReply("empty client response".to_string()))
    }
}

#[async_trait]
impl HistoryCompressor for AiGateway {
    async fn compress(
        &self,
        key: &ConversationKey,
        previous: Option<&str>,
        transcript: &str,
    ) -> Result<String, AtriumError> {
        let summary = self
            .complete(CompletionRequest {
                purpose: Purpose::Compression,
                system: Some(prompts::COMPRESSION_SYSTEM.to_string()),
                prompt: prompts::compression_prompt(previous, transcript),
                max_tokens: self.max_tokens / 2,
            })
            .await
            .map_err(|e| AtriumError::Api(format!("compression for {} failed: {}", key, e)))?;
        Ok(summary.trim().to_string())
    }
}
