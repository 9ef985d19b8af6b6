//! Parsing of model output into typed values.
//!
//! Model responses are parsed exactly once, here. Downstream code matches
//! on [`Intent`] and never looks at the raw JSON again.

use std::sync::LazyLock;

use chrono::{NaiveDate, NaiveTime};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use atrium_core::config::ProjectConfig;

use crate::dates::{parse_date, parse_time};

// =============================================================================
// Types
// =============================================================================

/// How the client referred to an existing booking.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRef {
    pub date: Option<NaiveDate>,
    pub time: Option<NaiveTime>,
}

/// What the client wants from this turn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum Intent {
    /// Asks for free times. Missing date means today, unless a time window
    /// is given: then the coming days are searched within that window.
    Query {
        date: Option<NaiveDate>,
        specialist: Option<String>,
        time_from: Option<NaiveTime>,
        time_to: Option<NaiveTime>,
    },
    /// Wants a new booking at a concrete date and time.
    Allocate {
        date: NaiveDate,
        start: NaiveTime,
        specialist: Option<String>,
        client_name: Option<String>,
    },
    /// Wants to move an existing booking.
    Modify {
        target: BookingRef,
        date: NaiveDate,
        start: NaiveTime,
        specialist: Option<String>,
    },
    Cancel {
        target: BookingRef,
    },
    Smalltalk,
    Unknown,
}

/// The classifier's full answer: what the client wants, plus any comment
/// they made about the business along the way.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Classification {
    pub intent: Intent,
    pub feedback: Option<String>,
}

impl Intent {
    pub fn name(&self) -> &'static str {
        match self {
            Intent::Query { .. } => "query",
            Intent::Allocate { .. } => "allocate",
            Intent::Modify { .. } => "modify",
            Intent::Cancel { .. } => "cancel",
            Intent::Smalltalk => "smalltalk",
            Intent::Unknown => "unknown",
        }
    }

    /// Whether the service duration is needed to act on this intent.
    pub fn needs_service(&self) -> bool {
        matches!(
            self,
            Intent::Query { .. } | Intent::Allocate { .. } | Intent::Modify { .. }
        )
    }
}

// =============================================================================
// Cleanup
// =============================================================================

static FENCED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^```[A-Za-z]*\s*(.*?)\s*```$").expect("Invalid fence regex")
});

static CONTROL_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\x00-\x1f\x7f-\x9f]").expect("Invalid control-char regex"));

/// Strip markdown fences, a leading `json` tag, control characters and any
/// prose around the outermost JSON object.
pub fn clean_model_json(raw: &str) -> String {
    let mut text = raw.trim();
    if let Some(caps) = FENCED.captures(text) {
        if let Some(inner) = caps.get(1) {
            text = inner.as_str().trim();
        }
    }
    if text.get(..4).is_some_and(|tag| tag.eq_ignore_ascii_case("json")) {
        text = text[4..].trim_start();
    }
    if let (Some(open), Some(close)) = (text.find('{'), text.rfind('}')) {
        if open < close {
            text = &text[open..=close];
        }
    }
    CONTROL_CHARS.replace_all(text, "").into_owned()
}

/// Treat empty strings and the model's "don't know" markers as absent.
fn present(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .filter(|v| {
            let lower = v.to_lowercase();
            !matches!(lower.as_str(), "null" | "none" | "unknown" | "n/a")
        })
}

// =============================================================================
// Intent
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawIntent {
    intent: String,
    date: Option<String>,
    time: Option<String>,
    specialist: Option<String>,
    client_name: Option<String>,
    target_date: Option<String>,
    target_time: Option<String>,
    time_from: Option<String>,
    time_to: Option<String>,
    feedback: Option<String>,
}

/// Parse the intent classifier's answer.
///
/// Unparsable output yields `Unknown`. A booking request without a usable
/// date and time degrades to an availability query for what was given.
pub fn parse_classification(raw: &str, today: NaiveDate) -> Classification {
    let cleaned = clean_model_json(raw);
    let parsed: RawIntent = match serde_json::from_str(&cleaned) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(error = %e, "Failed to parse intent response, treating as unknown");
            return Classification {
                intent: Intent::Unknown,
                feedback: None,
            };
        }
    };

    let date = present(parsed.date).and_then(|d| parse_date(&d, today));
    let start = present(parsed.time).and_then(|t| parse_time(&t));
    let specialist = present(parsed.specialist);
    let target = BookingRef {
        date: present(parsed.target_date).and_then(|d| parse_date(&d, today)),
        time: present(parsed.target_time).and_then(|t| parse_time(&t)),
    };
    let time_from = present(parsed.time_from).and_then(|t| parse_time(&t));
    let time_to = present(parsed.time_to).and_then(|t| parse_time(&t));
    let query = Intent::Query {
        date,
        specialist: specialist.clone(),
        time_from,
        time_to,
    };

    let intent = match parsed.intent.trim().to_lowercase().as_str() {
        "query" | "availability" => query,
        "allocate" | "book" => match (date, start) {
            (Some(date), Some(start)) => Intent::Allocate {
                date,
                start,
                specialist,
                client_name: present(parsed.client_name),
            },
            _ => query,
        },
        "modify" | "reschedule" => match (date, start) {
            (Some(date), Some(start)) => Intent::Modify {
                target,
                date,
                start,
                specialist,
            },
            _ => query,
        },
        "cancel" => Intent::Cancel { target },
        "smalltalk" | "greeting" | "info" => Intent::Smalltalk,
        _ => Intent::Unknown,
    };
    let feedback = present(parsed.feedback);
    debug!(
        intent = intent.name(),
        feedback = feedback.is_some(),
        "Intent parsed"
    );
    Classification { intent, feedback }
}

// =============================================================================
// Service
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawService {
    service: Option<String>,
}

/// Parse the service identifier's answer into a configured `(name, slots)`.
pub fn parse_service(raw: &str, project: &ProjectConfig) -> Option<(String, u32)> {
    let cleaned = clean_model_json(raw);
    let name = match serde_json::from_str::<RawService>(&cleaned) {
        Ok(parsed) => present(parsed.service)?,
        Err(e) => {
            warn!(error = %e, "Failed to parse service response");
            return None;
        }
    };
    match project.find_service(&name) {
        Some((name, slots)) => Some((name.to_string(), slots)),
        None => {
            debug!(service = %name, "Model named a service that is not configured");
            None
        }
    }
}

// =============================================================================
// Reply
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawReply {
    client_response: Option<String>,
    reply: Option<String>,
}

/// Extract the client-facing text. Accepts plain text or a JSON object with
/// `client_response` / `reply`.
pub fn parse_reply(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let cleaned = clean_model_json(trimmed);
    if cleaned.starts_with('{') {
        if let Ok(parsed) = serde_json::from_str::<RawReply>(&cleaned) {
            return present(parsed.client_response.or(parsed.reply));
        }
    }
    Some(trimmed.to_string())
}
