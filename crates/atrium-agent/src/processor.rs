//! The turn processor.
//!
//! One call to [`TurnProcessor::process`] handles one turn end to end:
//! classify, act on the allocator, generate the reply, persist the exchange
//! and deliver the reply. It keeps no state between turns.
//!
//! Allocator operations are all-or-nothing, so a failure before the reply is
//! persisted leaves nothing half-applied. The retried turn repeats the same
//! steps: `allocate` returns the booking it already made, a cancel finds the
//! booking it already cancelled, and a modify finds the booking already at
//! the requested placement. Once a booking change has committed, a failing
//! reply call no longer fails the turn: a template reply describing the
//! change is sent instead.

use std::sync::Arc;

use chrono::{Duration, NaiveDate, NaiveTime, Timelike};
use serde::Serialize;
use tracing::{error, info, warn};

use atrium_booking::{AllocationError, AllocationRequest, BookingAllocator, CancelAck, Reschedule};
use atrium_core::clock::Clock;
use atrium_core::config::{ProjectConfig, ScheduleConfig};
use atrium_core::types::{Booking, SpecialistId, Timestamp};
use atrium_queue::{Turn, TurnId};
use atrium_storage::archive::render_transcript;
use atrium_storage::{DialogueRepository, FeedbackRepository};

use crate::dates::{self, format_date, format_time};
use crate::error::AgentError;
use crate::gateway::{AiGateway, ReplyContext};
use crate::intent::{BookingRef, Intent};
use crate::registry::{ProjectEntry, ProjectRegistry};
use crate::sink::{OutboundReply, ReplyKind, ReplySink};

/// Sent when a turn exhausted its retries.
pub const FALLBACK_REPLY: &str =
    "Sorry, something went wrong on our side. Please write to us again in a few minutes.";

/// Days searched, today included, when the client gave a time window but
/// no date.
const WINDOW_SEARCH_DAYS: i64 = 7;

// =============================================================================
// Outcome types
// =============================================================================

/// Free start times of one specialist.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SpecialistSlots {
    pub specialist_id: SpecialistId,
    pub starts: Vec<NaiveTime>,
}

/// Free start times of one day inside a requested time window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DaySlots {
    pub date: NaiveDate,
    pub free: Vec<SpecialistSlots>,
}

/// What the allocator said about the client's request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ActionOutcome {
    NoAction,
    Availability {
        date: NaiveDate,
        service: Option<String>,
        free: Vec<SpecialistSlots>,
    },
    /// Free times within a window over the coming days. Days with nothing
    /// free are left out.
    WindowAvailability {
        time_from: Option<NaiveTime>,
        time_to: Option<NaiveTime>,
        service: Option<String>,
        days: Vec<DaySlots>,
    },
    Booked {
        booking: Booking,
    },
    Rescheduled {
        booking: Booking,
    },
    Cancelled {
        booking: Booking,
        already_cancelled: bool,
    },
    /// The requested time is taken; `alternatives` lists what is free that day.
    Conflict {
        date: NaiveDate,
        requested: NaiveTime,
        alternatives: Vec<SpecialistSlots>,
    },
    /// The booking to change or cancel could not be identified.
    TargetNotFound,
    Rejected {
        reason: String,
    },
}

impl ActionOutcome {
    pub fn name(&self) -> &'static str {
        match self {
            ActionOutcome::NoAction => "no_action",
            ActionOutcome::Availability { .. } => "availability",
            ActionOutcome::WindowAvailability { .. } => "window_availability",
            ActionOutcome::Booked { .. } => "booked",
            ActionOutcome::Rescheduled { .. } => "rescheduled",
            ActionOutcome::Cancelled { .. } => "cancelled",
            ActionOutcome::Conflict { .. } => "conflict",
            ActionOutcome::TargetNotFound => "target_not_found",
            ActionOutcome::Rejected { .. } => "rejected",
        }
    }

    /// Whether the allocator state reflects a change made for this turn.
    pub fn is_committed(&self) -> bool {
        matches!(
            self,
            ActionOutcome::Booked { .. }
                | ActionOutcome::Rescheduled { .. }
                | ActionOutcome::Cancelled { .. }
        )
    }
}

/// Result of a processed turn.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnReport {
    pub turn_id: TurnId,
    pub intent: Intent,
    pub outcome: ActionOutcome,
    pub reply: String,
    /// The reply is a template because the model failed after a commit.
    pub templated: bool,
}

// =============================================================================
// Processor
// =============================================================================

pub struct TurnProcessor {
    projects: Arc<ProjectRegistry>,
    gateway: Arc<AiGateway>,
    dialogues: Arc<DialogueRepository>,
    feedback: Arc<FeedbackRepository>,
    sink: Arc<dyn ReplySink>,
    clock: Arc<dyn Clock>,
    schedule: ScheduleConfig,
    history_turns: usize,
}

impl TurnProcessor {
    pub fn new(
        projects: Arc<ProjectRegistry>,
        gateway: Arc<AiGateway>,
        dialogues: Arc<DialogueRepository>,
        feedback: Arc<FeedbackRepository>,
        sink: Arc<dyn ReplySink>,
        clock: Arc<dyn Clock>,
        schedule: ScheduleConfig,
        history_turns: usize,
    ) -> Self {
        Self {
            projects,
            gateway,
            dialogues,
            feedback,
            sink,
            clock,
            schedule,
            history_turns,
        }
    }

    pub fn projects(&self) -> &Arc<ProjectRegistry> {
        &self.projects
    }

    pub async fn process(&self, turn: &Turn) -> Result<TurnReport, AgentError> {
        let key = &turn.key;
        let entry = self
            .projects
            .get(&key.project_id)
            .ok_or_else(|| AgentError::UnknownProject(key.project_id.clone()))?;
        let project = &entry.config;

        let local = self.clock.local_now(self.schedule.utc_offset_minutes);
        let (today, now) = (local.date(), local.time());
        let calendar = dates::calendar(today, self.schedule.horizon_days);
        let history = render_transcript(
            &self.dialogues.get_recent_history(key, self.history_turns)?,
            self.schedule.utc_offset_minutes,
        );
        let text = turn.text();

        let classified = self
            .gateway
            .classify_intent(project, &calendar, &history, &text, today)
            .await?;
        let intent = classified.intent;
        let service = if intent.needs_service() {
            self.gateway.identify_service(project, &text).await?
        } else {
            None
        };

        let outcome = self.execute(&entry, turn, &intent, service.as_ref(), today, now)?;
        info!(
            project_id = %key.project_id,
            client_id = %key.client_id,
            turn_seq = turn.seq,
            turn_id = %turn.id,
            attempt = turn.attempt,
            intent = intent.name(),
            outcome = outcome.name(),
            "Turn action resolved"
        );

        if let Some(comment) = classified.feedback.as_deref() {
            self.feedback.record(
                key,
                turn.seq,
                comment,
                Timestamp::from_datetime(self.clock.now()),
            )?;
            info!(
                project_id = %key.project_id,
                client_id = %key.client_id,
                turn_seq = turn.seq,
                "Client feedback captured"
            );
        }

        let context = ReplyContext {
            project_name: project.name.clone(),
            today,
            now,
            calendar,
            services: project.services.clone(),
            specialists: project.specialists.clone(),
            client_bookings: entry.allocator.client_bookings(&key.client_id)?,
            zip_history: self.dialogues.zip_history(key)?,
        };
        let (reply, templated) = match self
            .gateway
            .generate_reply(&context, &history, &text, &intent, &outcome)
            .await
        {
            Ok(reply) => (reply, false),
            Err(e) if outcome.is_committed() => {
                warn!(
                    project_id = %key.project_id,
                    client_id = %key.client_id,
                    turn_seq = turn.seq,
                    error = %e,
                    "Reply generation failed after commit, using template"
                );
                (template_reply(&outcome), true)
            }
            Err(e) => return Err(e),
        };

        let fragments: Vec<String> = turn.fragments.iter().map(|f| f.text.clone()).collect();
        self.dialogues.append_turn(
            key,
            &fragments,
            &reply,
            Timestamp::from_datetime(self.clock.now()),
        )?;
        self.deliver(turn, ReplyKind::Turn, &reply).await;

        Ok(TurnReport {
            turn_id: turn.id,
            intent,
            outcome,
            reply,
            templated,
        })
    }

    /// Record and send the static apology for a turn that exhausted its
    /// retries.
    pub async fn deliver_fallback(&self, turn: &Turn, reason: &str) {
        let key = &turn.key;
        error!(
            project_id = %key.project_id,
            client_id = %key.client_id,
            turn_seq = turn.seq,
            turn_id = %turn.id,
            attempt = turn.attempt,
            reason,
            "Turn failed permanently, sending fallback reply"
        );
        let fragments: Vec<String> = turn.fragments.iter().map(|f| f.text.clone()).collect();
        if let Err(e) = self.dialogues.append_turn(
            key,
            &fragments,
            FALLBACK_REPLY,
            Timestamp::from_datetime(self.clock.now()),
        ) {
            warn!(client_id = %key.client_id, error = %e, "Failed to record fallback turn");
        }
        self.deliver(turn, ReplyKind::Fallback, FALLBACK_REPLY).await;
    }

    async fn deliver(&self, turn: &Turn, kind: ReplyKind, text: &str) {
        let reply = OutboundReply {
            project_id: turn.key.project_id.clone(),
            client_id: turn.key.client_id.clone(),
            turn_seq: turn.seq,
            kind,
            text: text.to_string(),
            sent_at: self.clock.now(),
        };
        if let Err(e) = self.sink.deliver(&reply).await {
            warn!(
                project_id = %turn.key.project_id,
                client_id = %turn.key.client_id,
                turn_seq = turn.seq,
                error = %e,
                "Reply delivery failed"
            );
        }
    }

    // =========================================================================
    // Allocator actions
    // =========================================================================

    fn execute(
        &self,
        entry: &ProjectEntry,
        turn: &Turn,
        intent: &Intent,
        service: Option<&(String, u32)>,
        today: NaiveDate,
        now: NaiveTime,
    ) -> Result<ActionOutcome, AgentError> {
        let allocator = &entry.allocator;
        let project = &entry.config;
        let service_slots = service.map(|(_, slots)| *slots);

        match intent {
            Intent::Query {
                date,
                specialist,
                time_from,
                time_to,
            } => {
                let window = TimeWindow {
                    from: *time_from,
                    to: *time_to,
                };
                if window.is_empty() {
                    return Ok(rejected("the requested time window is empty"));
                }
                let Some(candidates) = candidates(project, specialist.as_deref()) else {
                    return Ok(rejected("unknown specialist"));
                };
                let duration = service_slots.unwrap_or(1);
                let service = service.map(|(name, _)| name.clone());

                let Some(date) = date.or(window.is_open().then_some(today)) else {
                    let mut days = Vec::new();
                    for offset in 0..WINDOW_SEARCH_DAYS {
                        let date = today + Duration::days(offset);
                        let free =
                            availability(allocator, &candidates, date, duration, &window, today, now)?;
                        if !free.is_empty() {
                            days.push(DaySlots { date, free });
                        }
                    }
                    return Ok(ActionOutcome::WindowAvailability {
                        time_from: window.from,
                        time_to: window.to,
                        service,
                        days,
                    });
                };
                if date < today {
                    return Ok(rejected("the requested date is in the past"));
                }
                let free = availability(allocator, &candidates, date, duration, &window, today, now)?;
                Ok(ActionOutcome::Availability {
                    date,
                    service,
                    free,
                })
            }

            Intent::Allocate {
                date,
                start,
                specialist,
                client_name,
            } => {
                if is_past(*date, *start, today, now) {
                    return Ok(rejected("the requested time is in the past"));
                }
                let Some(candidates) = candidates(project, specialist.as_deref()) else {
                    return Ok(rejected("unknown specialist"));
                };
                let duration = service_slots.unwrap_or(1);
                let client_name = match client_name {
                    Some(name) => name.clone(),
                    None => allocator
                        .client_bookings(&turn.key.client_id)?
                        .first()
                        .map(|b| b.client_name.clone())
                        .unwrap_or_default(),
                };
                for specialist_id in &candidates {
                    let request = AllocationRequest {
                        specialist_id: specialist_id.clone(),
                        date: *date,
                        start_time: *start,
                        duration,
                        client_id: turn.key.client_id.clone(),
                        client_name: client_name.clone(),
                        service_name: service.map(|(name, _)| name.clone()).unwrap_or_default(),
                    };
                    match allocator.allocate(request) {
                        Ok(booking) => return Ok(ActionOutcome::Booked { booking }),
                        Err(e) if e.is_conflict() => continue,
                        Err(e) => return rejected_by(e),
                    }
                }
                Ok(ActionOutcome::Conflict {
                    date: *date,
                    requested: *start,
                    alternatives: availability(
                        allocator,
                        &candidates,
                        *date,
                        duration,
                        &TimeWindow::OPEN,
                        today,
                        now,
                    )?,
                })
            }

            Intent::Modify {
                target,
                date,
                start,
                specialist,
            } => {
                if is_past(*date, *start, today, now) {
                    return Ok(rejected("the requested time is in the past"));
                }
                let requested = match specialist.as_deref() {
                    Some(name) => match project.find_specialist(name) {
                        Some(found) => Some(SpecialistId::from(found)),
                        None => return Ok(rejected("unknown specialist")),
                    },
                    None => None,
                };
                let bookings = allocator.client_bookings(&turn.key.client_id)?;
                let Some(existing) = resolve_target(&bookings, target) else {
                    // A retry of a committed move no longer finds the booking
                    // where the client said it was.
                    return Ok(
                        match already_moved(&bookings, *date, *start, requested.as_ref(), service_slots) {
                            Some(booking) => ActionOutcome::Rescheduled { booking },
                            None => ActionOutcome::TargetNotFound,
                        },
                    );
                };
                let specialist_id = requested.unwrap_or_else(|| existing.specialist_id.clone());
                let duration = service_slots.unwrap_or(existing.duration);
                if existing.date == *date
                    && existing.start_time == *start
                    && existing.specialist_id == specialist_id
                    && existing.duration == duration
                {
                    return Ok(ActionOutcome::Rescheduled { booking: existing });
                }
                let target = Reschedule {
                    date: *date,
                    start_time: *start,
                    duration,
                    specialist_id: Some(specialist_id.clone()),
                };
                match allocator.modify(existing.booking_id, target) {
                    Ok(booking) => Ok(ActionOutcome::Rescheduled { booking }),
                    Err(e) if e.is_conflict() => Ok(ActionOutcome::Conflict {
                        date: *date,
                        requested: *start,
                        alternatives: availability(
                            allocator,
                            &[specialist_id],
                            *date,
                            duration,
                            &TimeWindow::OPEN,
                            today,
                            now,
                        )?,
                    }),
                    Err(AllocationError::NotFound(_)) => Ok(ActionOutcome::TargetNotFound),
                    Err(e) => rejected_by(e),
                }
            }

            Intent::Cancel { target } => {
                let bookings = allocator.client_bookings(&turn.key.client_id)?;
                let existing = match resolve_target(&bookings, target) {
                    Some(existing) => existing,
                    None => {
                        // Upcoming cancelled bookings, so a retried cancel is
                        // acknowledged as already done.
                        let cancelled: Vec<Booking> = allocator
                            .client_history(&turn.key.client_id)?
                            .into_iter()
                            .filter(|b| !b.is_active() && b.date >= today)
                            .collect();
                        match resolve_target(&cancelled, target) {
                            Some(existing) => existing,
                            None => return Ok(ActionOutcome::TargetNotFound),
                        }
                    }
                };
                match allocator.cancel(existing.booking_id) {
                    Ok(ack) => Ok(ActionOutcome::Cancelled {
                        already_cancelled: matches!(ack, CancelAck::AlreadyCancelled(_)),
                        booking: ack.booking().clone(),
                    }),
                    Err(AllocationError::NotFound(_)) => Ok(ActionOutcome::TargetNotFound),
                    Err(e) => rejected_by(e),
                }
            }

            Intent::Smalltalk | Intent::Unknown => Ok(ActionOutcome::NoAction),
        }
    }
}

fn rejected(reason: &str) -> ActionOutcome {
    ActionOutcome::Rejected {
        reason: reason.to_string(),
    }
}

/// Validation failures go back to the client; storage failures fail the turn.
fn rejected_by(err: AllocationError) -> Result<ActionOutcome, AgentError> {
    match err {
        AllocationError::Storage(e) => Err(AgentError::Storage(e)),
        other => Ok(ActionOutcome::Rejected {
            reason: other.to_string(),
        }),
    }
}

fn is_past(date: NaiveDate, start: NaiveTime, today: NaiveDate, now: NaiveTime) -> bool {
    date < today || (date == today && start <= now)
}

/// Specialists to consider: the named one, or all. `None` if the name is
/// not configured.
fn candidates(project: &ProjectConfig, specialist: Option<&str>) -> Option<Vec<SpecialistId>> {
    match specialist {
        Some(name) => project
            .find_specialist(name)
            .map(|found| vec![SpecialistId::from(found)]),
        None => Some(
            project
                .specialists
                .iter()
                .map(|s| SpecialistId::from(s.as_str()))
                .collect(),
        ),
    }
}

/// Time of day the client wants to be served in. Either bound may be open.
#[derive(Clone, Copy, Debug)]
struct TimeWindow {
    from: Option<NaiveTime>,
    to: Option<NaiveTime>,
}

impl TimeWindow {
    const OPEN: TimeWindow = TimeWindow {
        from: None,
        to: None,
    };

    fn is_open(&self) -> bool {
        self.from.is_none() && self.to.is_none()
    }

    fn is_empty(&self) -> bool {
        matches!((self.from, self.to), (Some(from), Some(to)) if from >= to)
    }

    /// Whether a booking of `duration` slots starting at `start` lies inside.
    fn admits(&self, start: NaiveTime, duration: u32, slot_minutes: u32) -> bool {
        let start_min = start.num_seconds_from_midnight() / 60;
        let end_min = start_min + duration * slot_minutes;
        self.from
            .map_or(true, |from| start_min >= from.num_seconds_from_midnight() / 60)
            && self
                .to
                .map_or(true, |to| end_min <= to.num_seconds_from_midnight() / 60)
    }
}

/// Free starts per specialist inside `window`, already-passed starts of
/// today removed.
fn availability(
    allocator: &BookingAllocator,
    specialists: &[SpecialistId],
    date: NaiveDate,
    duration: u32,
    window: &TimeWindow,
    today: NaiveDate,
    now: NaiveTime,
) -> Result<Vec<SpecialistSlots>, AgentError> {
    let slot_minutes = allocator.slot_minutes();
    let mut free = Vec::new();
    for specialist_id in specialists {
        let starts: Vec<NaiveTime> = allocator
            .query_available(specialist_id, date, duration)?
            .into_iter()
            .filter(|start| !is_past(date, *start, today, now))
            .filter(|start| window.admits(*start, duration, slot_minutes))
            .collect();
        if !starts.is_empty() {
            free.push(SpecialistSlots {
                specialist_id: specialist_id.clone(),
                starts,
            });
        }
    }
    Ok(free)
}

/// The booking a client refers to: the single active booking matching the
/// given date and time, or their only booking when nothing was given.
fn resolve_target(bookings: &[Booking], target: &BookingRef) -> Option<Booking> {
    let matches: Vec<&Booking> = bookings
        .iter()
        .filter(|b| target.date.map_or(true, |d| b.date == d))
        .filter(|b| target.time.map_or(true, |t| b.start_time == t))
        .collect();
    match matches.as_slice() {
        [only] => Some((*only).clone()),
        _ => None,
    }
}

/// The one booking already sitting at the requested placement after an
/// earlier move. Untouched bookings (version 1) never count.
fn already_moved(
    bookings: &[Booking],
    date: NaiveDate,
    start: NaiveTime,
    specialist: Option<&SpecialistId>,
    duration: Option<u32>,
) -> Option<Booking> {
    let matches: Vec<&Booking> = bookings
        .iter()
        .filter(|b| b.version > 1 && b.date == date && b.start_time == start)
        .filter(|b| specialist.map_or(true, |s| &b.specialist_id == s))
        .filter(|b| duration.map_or(true, |d| b.duration == d))
        .collect();
    match matches.as_slice() {
        [only] => Some((*only).clone()),
        _ => None,
    }
}

/// Deterministic reply describing a committed change.
pub fn template_reply(outcome: &ActionOutcome) -> String {
    match outcome {
        ActionOutcome::Booked { booking } => format!(
            "You are booked with {} on {} at {}.",
            booking.specialist_id,
            format_date(booking.date),
            format_time(booking.start_time)
        ),
        ActionOutcome::Rescheduled { booking } => format!(
            "Your booking has been moved to {} at {} with {}.",
            format_date(booking.date),
            format_time(booking.start_time),
            booking.specialist_id
        ),
        ActionOutcome::Cancelled { booking, .. } => format!(
            "Your booking on {} at {} has been cancelled.",
            format_date(booking.date),
            format_time(booking.start_time)
        ),
        _ => FALLBACK_REPLY.to_string(),
    }
}
