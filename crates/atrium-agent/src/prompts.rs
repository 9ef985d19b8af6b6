//! Prompt construction for the four model calls.
//!
//! Only the functional contract is fixed here: what context goes in and
//! which JSON shape comes back.

use atrium_core::config::ProjectConfig;

use crate::gateway::ReplyContext;
use crate::intent::Intent;
use crate::processor::ActionOutcome;

pub const INTENT_SYSTEM: &str = "You classify messages sent to a booking assistant. \
Answer with a single JSON object and nothing else.";

pub const SERVICE_SYSTEM: &str = "You map a client's message to one of a fixed list of \
services. Answer with a single JSON object and nothing else.";

pub const REPLY_SYSTEM: &str = "You are the booking assistant of a small business. \
Write the next message to the client. Never claim a booking exists unless the \
outcome says so.";

pub const COMPRESSION_SYSTEM: &str = "You summarise conversations between a client and \
a booking assistant so the assistant can continue later.";

fn list(items: impl IntoIterator<Item = String>) -> String {
    let joined: Vec<String> = items.into_iter().collect();
    if joined.is_empty() {
        "(none)".to_string()
    } else {
        joined.join(", ")
    }
}

pub fn intent_prompt(
    project: &ProjectConfig,
    calendar: &str,
    history: &str,
    turn_text: &str,
) -> String {
    format!(
        "Business: {name}\n\
         Specialists: {specialists}\n\
         Calendar:\n{calendar}\n\n\
         Conversation so far:\n{history}\n\n\
         New client message:\n{turn_text}\n\n\
         Return JSON with keys:\n\
         - \"intent\": one of \"query\", \"allocate\", \"modify\", \"cancel\", \"smalltalk\", \"unknown\"\n\
         - \"date\": requested date as DD.MM.YYYY, or null\n\
         - \"time\": requested start time as HH:MM, or null\n\
         - \"specialist\": requested specialist name, or null\n\
         - \"client_name\": the client's name if they gave it, or null\n\
         - \"target_date\", \"target_time\": the existing booking to change or cancel, or null\n\
         - \"time_from\", \"time_to\": when the client names a time of day but no date \
         (\"any evening after 17:00\"), the window as HH:MM, or null\n\
         - \"feedback\": the client's opinion of the business or a past visit, quoted, or null\n\
         Use \"allocate\" only when the client confirmed a concrete date and time.",
        name = project.name,
        specialists = list(project.specialists.iter().cloned()),
        calendar = calendar,
        history = if history.is_empty() { "(new conversation)" } else { history },
        turn_text = turn_text,
    )
}

pub fn service_prompt(project: &ProjectConfig, turn_text: &str) -> String {
    format!(
        "Services: {services}\n\n\
         Client message:\n{turn_text}\n\n\
         Return JSON {{\"service\": <exact service name from the list, or \"unknown\">}}.",
        services = list(project.services.keys().cloned()),
        turn_text = turn_text,
    )
}

pub fn reply_prompt(
    context: &ReplyContext,
    history: &str,
    turn_text: &str,
    intent: &Intent,
    outcome: &ActionOutcome,
) -> String {
    let bookings = serde_json::to_string(&context.client_bookings).unwrap_or_default();
    let intent = serde_json::to_string(intent).unwrap_or_default();
    let outcome = serde_json::to_string(outcome).unwrap_or_default();
    format!(
        "Business: {name}\n\
         Now: {today} {now}\n\
         Services (duration in slots): {services}\n\
         Specialists: {specialists}\n\
         Calendar:\n{calendar}\n\n\
         Earlier conversation summary: {summary}\n\
         Client's active bookings: {bookings}\n\n\
         Conversation so far:\n{history}\n\n\
         New client message:\n{turn_text}\n\n\
         Detected intent: {intent}\n\
         Outcome of the requested action: {outcome}\n\n\
         Return JSON {{\"client_response\": <message to send>}}.",
        name = context.project_name,
        today = crate::dates::format_date(context.today),
        now = crate::dates::format_time(context.now),
        services = list(
            context
                .services
                .iter()
                .map(|(name, slots)| format!("{} ({})", name, slots))
        ),
        specialists = list(context.specialists.iter().cloned()),
        calendar = context.calendar,
        summary = context.zip_history.as_deref().unwrap_or("(none)"),
        bookings = bookings,
        history = if history.is_empty() { "(new conversation)" } else { history },
        turn_text = turn_text,
        intent = intent,
        outcome = outcome,
    )
}

pub fn compression_prompt(previous: Option<&str>, transcript: &str) -> String {
    format!(
        "Previous summary:\n{previous}\n\n\
         New messages:\n{transcript}\n\n\
         Write one updated summary covering both: who the client is, what they \
         booked, changed or cancelled, and anything still open. Plain text.",
        previous = previous.unwrap_or("(none)"),
        transcript = transcript,
    )
}
