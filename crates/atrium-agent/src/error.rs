//! Error types for turn processing.

use std::time::Duration;

use atrium_booking::AllocationError;
use atrium_core::error::AtriumError;
use atrium_core::types::ProjectId;

/// Failure of one call to the language model with one credential.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("model unavailable: {0}")]
    Unavailable(String),
    #[error("invalid model response: {0}")]
    InvalidResponse(String),
}

/// Errors that fail a turn attempt.
///
/// Every variant counts against the turn's retry budget; the queue decides
/// whether to retry or fall back.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("AI unavailable after trying {attempts} credential(s): {last}")]
    AiUnavailable { attempts: usize, last: String },
    #[error("model reply unusable: {0}")]
    InvalidReply(String),
    #[error("processing timed out after {0:?}")]
    ProcessingTimeout(Duration),
    #[error("unknown project: {0}")]
    UnknownProject(ProjectId),
    #[error("allocation error: {0}")]
    Allocation(#[from] AllocationError),
    #[error("reply delivery failed: {0}")]
    Delivery(String),
    #[error("storage error: {0}")]
    Storage(#[from] AtriumError),
}

impl AgentError {
    /// Whether the language model was the cause.
    pub fn is_ai_failure(&self) -> bool {
        matches!(
            self,
            AgentError::AiUnavailable { .. } | AgentError::InvalidReply(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_error_display() {
        let err = AgentError::AiUnavailable {
            attempts: 2,
            last: "rate limited: 429".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "AI unavailable after trying 2 credential(s): rate limited: 429"
        );
        assert!(err.is_ai_failure());

        let err = AgentError::ProcessingTimeout(Duration::from_secs(30));
        assert_eq!(err.to_string(), "processing timed out after 30s");
        assert!(!err.is_ai_failure());

        let err = AgentError::UnknownProject(ProjectId::from("nope"));
        assert_eq!(err.to_string(), "unknown project: nope");
    }

    #[test]
    fn test_agent_error_from_atrium_error() {
        let err: AgentError = AtriumError::Storage("disk full".to_string()).into();
        assert!(matches!(err, AgentError::Storage(_)));
        assert_eq!(err.to_string(), "storage error: Storage error: disk full");
    }

    #[test]
    fn test_model_error_display() {
        assert_eq!(
            ModelError::InvalidResponse("empty".to_string()).to_string(),
            "invalid model response: empty"
        );
    }
}
