use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{AtriumError, Result};

/// Top-level configuration for the atrium service.
///
/// Loaded from `~/.atrium/config.toml` by default. Each section corresponds
/// to one subsystem; `[[projects]]` entries describe the tenants served.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AtriumConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub mirror: MirrorConfig,
    #[serde(default)]
    pub dialogue: DialogueConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub projects: Vec<ProjectConfig>,
}

impl AtriumConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read, parsed or fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AtriumConfig = toml::from_str(&content)?;
        config.validate()?;
        info!(
            projects = config.projects.len(),
            "Configuration loaded from {}",
            path.display()
        );
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.schedule.slot_minutes == 0 || 24 * 60 % self.schedule.slot_minutes != 0 {
            return Err(AtriumError::Config(format!(
                "schedule.slot_minutes must divide a day, got {}",
                self.schedule.slot_minutes
            )));
        }
        if self.queue.retry_attempts == 0 {
            return Err(AtriumError::Config(
                "queue.retry_attempts must be at least 1".to_string(),
            ));
        }
        if self.queue.max_wait_ms < self.queue.debounce_ms {
            return Err(AtriumError::Config(format!(
                "queue.max_wait_ms ({}) must not be shorter than queue.debounce_ms ({})",
                self.queue.max_wait_ms, self.queue.debounce_ms
            )));
        }

        let mut seen = HashSet::new();
        for project in &self.projects {
            project.validate()?;
            if !seen.insert(project.project_id.as_str()) {
                return Err(AtriumError::Config(format!(
                    "duplicate project_id '{}'",
                    project.project_id
                )));
            }
        }
        Ok(())
    }

    /// Look up a project by id.
    pub fn project(&self, project_id: &str) -> Option<&ProjectConfig> {
        self.projects.iter().find(|p| p.project_id == project_id)
    }
}

/// General service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Data directory for the SQLite database and the API token.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
    /// HTTP port.
    pub port: u16,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.atrium/data".to_string(),
            log_level: "info".to_string(),
            port: 3040,
        }
    }
}

/// Conversation queue timing and capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Quiet period after the last fragment before a turn is flushed.
    pub debounce_ms: u64,
    /// Hard cap on how long a burst may keep resetting the debounce window.
    pub max_wait_ms: u64,
    /// Hard cap on fragments coalesced into one turn.
    pub flood_fragment_threshold: usize,
    /// Pending fragments per conversation before enqueue fails with QueueFull.
    pub max_queue_size: usize,
    /// Attempts per turn before the fallback reply is sent.
    pub retry_attempts: u32,
    /// Seconds an in-flight turn may run before it counts as a failed attempt.
    pub processing_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 3_000,
            max_wait_ms: 15_000,
            flood_fragment_threshold: 20,
            max_queue_size: 1_000,
            retry_attempts: 3,
            processing_timeout_secs: 30,
        }
    }
}

impl QueueConfig {
    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs(self.processing_timeout_secs)
    }
}

/// Schedule grid settings shared by every project.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Length of one slot in minutes.
    pub slot_minutes: u32,
    /// How many days ahead clients may book.
    pub horizon_days: u32,
    /// Offset of the business timezone from UTC, in minutes.
    pub utc_offset_minutes: i32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            slot_minutes: 30,
            horizon_days: 30,
            utc_offset_minutes: 0,
        }
    }
}

/// Language model collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    /// Model name sent with every request.
    pub model: String,
    /// Interchangeable API keys forming the credential pool.
    pub api_keys: Vec<String>,
    /// Messages endpoint.
    pub base_url: String,
    /// Maximum tokens per completion.
    pub max_tokens: u32,
    /// HTTP timeout per request.
    pub request_timeout_secs: u64,
    /// How long a rate-limited key is skipped.
    pub rate_limit_cooldown_secs: u64,
    /// Dialogue turns included as context.
    pub history_turns: usize,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-20250514".to_string(),
            api_keys: vec![],
            base_url: "https://api.anthropic.com/v1/messages".to_string(),
            max_tokens: 2_000,
            request_timeout_secs: 60,
            rate_limit_cooldown_secs: 60,
            history_turns: 10,
        }
    }
}

/// Spreadsheet mirror.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Whether booking events are projected to the sheet service.
    pub enabled: bool,
    /// Base URL of the sheet bridge service.
    pub endpoint: Option<String>,
    /// Seconds between reconciliation passes.
    pub sync_interval_secs: u64,
    /// First retry delay for a failed write.
    pub retry_base_ms: u64,
    /// Upper bound on the retry delay.
    pub retry_max_ms: u64,
    /// Attempts per event before it is reported as MirrorWriteFailed.
    pub max_attempts: u32,
    /// Days ahead (from today) covered by reconciliation.
    pub reconcile_days: u32,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            sync_interval_secs: 300,
            retry_base_ms: 500,
            retry_max_ms: 30_000,
            max_attempts: 8,
            reconcile_days: 14,
        }
    }
}

/// Dialogue history retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialogueConfig {
    /// Inactivity after which a client's history is compressed.
    pub archive_after_hours: u32,
    /// Seconds between archival passes.
    pub archive_interval_secs: u64,
    /// Seconds to wait after a failed pass.
    pub error_backoff_secs: u64,
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            archive_after_hours: 24,
            archive_interval_secs: 3_600,
            error_backoff_secs: 600,
        }
    }
}

/// HTTP API limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Global requests per second.
    pub rate_limit_per_sec: u64,
    /// Inbound messages per client per minute.
    pub max_messages_per_minute: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            rate_limit_per_sec: 100,
            max_messages_per_minute: 60,
        }
    }
}

/// Working-hours window, `HH:MM` strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkHours {
    pub start: String,
    pub end: String,
}

impl Default for WorkHours {
    fn default() -> Self {
        Self {
            start: "09:00".to_string(),
            end: "18:00".to_string(),
        }
    }
}

impl WorkHours {
    /// Parsed `(start, end)`.
    pub fn bounds(&self) -> Result<(NaiveTime, NaiveTime)> {
        let parse = |s: &str| {
            NaiveTime::parse_from_str(s, "%H:%M")
                .map_err(|e| AtriumError::Config(format!("invalid work hour '{}': {}", s, e)))
        };
        let start = parse(&self.start)?;
        let end = parse(&self.end)?;
        if start >= end {
            return Err(AtriumError::Config(format!(
                "work_hours.start ({}) must be before work_hours.end ({})",
                self.start, self.end
            )));
        }
        Ok((start, end))
    }
}

/// One tenant: its specialists, services and working hours.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub project_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub specialists: Vec<String>,
    /// Identifier of the mirrored spreadsheet.
    #[serde(default)]
    pub sheet_id: Option<String>,
    /// Where outbound replies are POSTed.
    #[serde(default)]
    pub reply_webhook: Option<String>,
    /// Service name to duration in slot units.
    #[serde(default)]
    pub services: BTreeMap<String, u32>,
    #[serde(default)]
    pub work_hours: WorkHours,
}

impl ProjectConfig {
    pub fn validate(&self) -> Result<()> {
        if self.project_id.trim().is_empty() {
            return Err(AtriumError::Config("project_id must not be empty".to_string()));
        }
        self.work_hours.bounds()?;
        if let Some((name, _)) = self.services.iter().find(|(_, slots)| **slots == 0) {
            return Err(AtriumError::Config(format!(
                "service '{}' in project '{}' has zero duration",
                name, self.project_id
            )));
        }
        Ok(())
    }

    pub fn has_specialist(&self, name: &str) -> bool {
        self.specialists.iter().any(|s| s == name)
    }

    /// Resolve a specialist name case-insensitively to its configured spelling.
    pub fn find_specialist(&self, name: &str) -> Option<&str> {
        let wanted = name.trim().to_lowercase();
        self.specialists
            .iter()
            .find(|s| s.to_lowercase() == wanted)
            .map(String::as_str)
    }

    /// Resolve a service name case-insensitively to `(name, slots)`.
    pub fn find_service(&self, name: &str) -> Option<(&str, u32)> {
        let wanted = name.trim().to_lowercase();
        self.services
            .iter()
            .find(|(s, _)| s.to_lowercase() == wanted)
            .map(|(s, slots)| (s.as_str(), *slots))
    }
}
