//! Route handler functions for all API endpoints.
//!
//! Each handler extracts query/path parameters via axum extractors,
//! interacts with AppState services, and returns JSON responses.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::pin::Pin;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use axum::Json;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{info, warn};
use uuid::Uuid;

use atrium_agent::dates::{format_time, parse_date, parse_time};
use atrium_agent::ProjectEntry;
use atrium_booking::{AllocationRequest, BookingStats, CancelAck, Reschedule};
use atrium_core::types::{Booking, BookingId, ClientId, ConversationKey, SpecialistId};
use atrium_mirror::ReconcileReport;
use atrium_queue::{EnqueueResult, QueueStats};
use atrium_storage::DialogueEntry;

use crate::error::ApiError;
use crate::state::AppState;

/// Default and maximum rows returned by the history endpoint.
const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 500;

// =============================================================================
// Request types
// =============================================================================

/// Platform-neutral inbound chat message.
#[derive(Debug, Deserialize)]
pub struct InboundMessage {
    pub client_id: String,
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct AvailabilityParams {
    pub date: String,
    pub specialist: Option<String>,
    pub service: Option<String>,
    pub duration: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct BookingListParams {
    pub date: Option<String>,
    pub specialist: Option<String>,
    pub client_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateBookingRequest {
    pub specialist_id: String,
    pub date: String,
    pub start_time: String,
    pub service_name: Option<String>,
    /// Slot units; taken from the service when one is given.
    pub duration: Option<u32>,
    pub client_id: String,
    pub client_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ModifyBookingRequest {
    pub date: String,
    pub start_time: String,
    /// Slot units; the booking keeps its duration when omitted.
    pub duration: Option<u32>,
    pub specialist_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct DivergenceParams {
    pub project_id: Option<String>,
}

// =============================================================================
// Response types
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub projects: usize,
    pub queue: QueueStats,
    pub mirror_enabled: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueueResponse {
    /// "accepted" while collecting, "held" while a turn is in flight.
    pub status: String,
    pub pending: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SpecialistAvailability {
    pub specialist_id: String,
    pub starts: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AvailabilityResponse {
    pub date: NaiveDate,
    pub duration: u32,
    pub specialists: Vec<SpecialistAvailability>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BookingsResponse {
    pub bookings: Vec<Booking>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    /// "cancelled", or "already_cancelled" for a repeated cancel.
    pub status: String,
    pub booking: Booking,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProjectStatsResponse {
    pub project_id: String,
    pub name: String,
    pub specialists: Vec<String>,
    pub services: BTreeMap<String, u32>,
    pub bookings: BookingStats,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub project_id: String,
    pub client_id: String,
    pub zip_history: Option<String>,
    pub entries: Vec<DialogueEntry>,
}

#[derive(Debug, Serialize)]
pub struct DivergencesResponse {
    pub enabled: bool,
    pub report: Option<ReconcileReport>,
}

// =============================================================================
// Helpers
// =============================================================================

fn today(state: &AppState) -> NaiveDate {
    state
        .clock
        .local_now(state.config.schedule.utc_offset_minutes)
        .date()
}

fn parse_date_param(state: &AppState, raw: &str) -> Result<NaiveDate, ApiError> {
    parse_date(raw, today(state))
        .ok_or_else(|| ApiError::BadRequest(format!("Invalid date: {}", raw)))
}

/// Configured spelling of a specialist; unknown names pass through for the
/// allocator to reject.
fn specialist_id(entry: &ProjectEntry, name: &str) -> SpecialistId {
    entry
        .config
        .find_specialist(name)
        .map(SpecialistId::from)
        .unwrap_or_else(|| SpecialistId::from(name.trim()))
}

/// `(service_name, duration)` from an optional service and explicit duration.
fn resolve_service(
    entry: &ProjectEntry,
    service: Option<&str>,
    duration: Option<u32>,
) -> Result<(Option<String>, Option<u32>), ApiError> {
    match service.map(str::trim).filter(|s| !s.is_empty()) {
        Some(name) => {
            let (name, slots) = entry
                .config
                .find_service(name)
                .ok_or_else(|| ApiError::UnprocessableEntity(format!("Unknown service: {}", name)))?;
            Ok((Some(name.to_string()), Some(slots)))
        }
        None => Ok((None, duration)),
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// GET /health - service health and queue overview.
pub async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    let queue = state
        .queue
        .stats()
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        projects: state.projects.len(),
        queue,
        mirror_enabled: state.reconciler.is_some(),
    }))
}

/// POST /webhook/:project_id - enqueue one inbound message.
///
/// Returns 202 once the fragment is buffered. A full conversation buffer or
/// a client over its per-minute allowance yields 429 with `Retry-After`.
pub async fn webhook(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(message): Json<InboundMessage>,
) -> Result<(StatusCode, Json<EnqueueResponse>), ApiError> {
    state.project(&project_id)?;
    let client_id = message.client_id.trim();
    if client_id.is_empty() {
        return Err(ApiError::UnprocessableEntity(
            "client_id must not be empty".to_string(),
        ));
    }
    let text = message.text.trim();
    if text.is_empty() {
        return Err(ApiError::UnprocessableEntity(
            "text must not be empty".to_string(),
        ));
    }

    let key = ConversationKey::new(project_id.as_str(), client_id);
    if !state.client_limiter.try_acquire(&key) {
        warn!(
            project_id = %key.project_id,
            client_id = %key.client_id,
            "Client message rate exceeded"
        );
        return Err(ApiError::TooManyRequests {
            message: "Too many messages from this client".to_string(),
            retry_after_secs: state.client_limiter.retry_after_secs(),
        });
    }

    let retry_after_secs = state.config.queue.max_wait_ms.div_ceil(1_000).max(1);
    let result = state
        .queue
        .enqueue(key.project_id, key.client_id, text)
        .map_err(|e| ApiError::from_queue(e, retry_after_secs))?;
    let status = match result {
        EnqueueResult::Accepted { .. } => "accepted",
        EnqueueResult::Held { .. } => "held",
    };
    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            status: status.to_string(),
            pending: result.pending(),
        }),
    ))
}

type EventStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

/// GET /stream - SSE of outbound replies and committed booking events.
pub async fn stream(State(state): State<AppState>) -> Sse<KeepAliveStream<EventStream>> {
    let replies = BroadcastStream::new(state.replies.subscribe()).filter_map(|result| match result {
        Ok(reply) => {
            let data = serde_json::to_string(&reply).unwrap_or_default();
            Some(Ok(Event::default().event("reply").data(data)))
        }
        Err(_) => None,
    });

    let mut merged: EventStream = Box::pin(replies);
    for (_, entry) in state.projects.iter() {
        let events = BroadcastStream::new(entry.allocator.feed().subscribe()).filter_map(
            |result| match result {
                Ok(event) => {
                    let data = serde_json::to_string(&event).unwrap_or_default();
                    Some(Ok(Event::default().event(event.event_name()).data(data)))
                }
                Err(_) => None,
            },
        );
        merged = Box::pin(merged.merge(events));
    }

    Sse::new(merged).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

/// GET /projects/:project_id/availability - free start times per specialist.
pub async fn availability(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Query(params): Query<AvailabilityParams>,
) -> Result<Json<AvailabilityResponse>, ApiError> {
    let entry = state.project(&project_id)?;
    let date = parse_date_param(&state, &params.date)?;
    let (_, duration) = resolve_service(&entry, params.service.as_deref(), params.duration)?;
    let duration = duration.unwrap_or(1);

    let specialists: Vec<SpecialistId> = match params.specialist.as_deref() {
        Some(name) => vec![specialist_id(&entry, name)],
        None => entry.allocator.specialists().to_vec(),
    };

    let mut result = Vec::with_capacity(specialists.len());
    for specialist in specialists {
        let starts = entry
            .allocator
            .query_available(&specialist, date, duration)?
            .into_iter()
            .map(format_time)
            .collect();
        result.push(SpecialistAvailability {
            specialist_id: specialist.0,
            starts,
        });
    }

    Ok(Json(AvailabilityResponse {
        date,
        duration,
        specialists: result,
    }))
}

/// GET /projects/:project_id/bookings - active bookings by client or by day.
pub async fn list_bookings(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Query(params): Query<BookingListParams>,
) -> Result<Json<BookingsResponse>, ApiError> {
    let entry = state.project(&project_id)?;

    if let Some(client_id) = params.client_id.as_deref() {
        let bookings = entry
            .allocator
            .client_bookings(&ClientId::from(client_id.trim()))?;
        return Ok(Json(BookingsResponse { bookings }));
    }

    let Some(raw_date) = params.date.as_deref() else {
        return Err(ApiError::BadRequest(
            "Either 'date' or 'client_id' is required".to_string(),
        ));
    };
    let date = parse_date_param(&state, raw_date)?;
    let specialists: Vec<SpecialistId> = match params.specialist.as_deref() {
        Some(name) => vec![specialist_id(&entry, name)],
        None => entry.allocator.specialists().to_vec(),
    };

    let mut bookings = Vec::new();
    for specialist in &specialists {
        bookings.extend(entry.allocator.bookings_on(specialist, date)?);
    }
    bookings.sort_by(|a, b| {
        a.start_time
            .cmp(&b.start_time)
            .then_with(|| a.specialist_id.cmp(&b.specialist_id))
    });
    Ok(Json(BookingsResponse { bookings }))
}

/// POST /projects/:project_id/bookings - allocate a booking directly.
pub async fn create_booking(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(body): Json<CreateBookingRequest>,
) -> Result<(StatusCode, Json<Booking>), ApiError> {
    let entry = state.project(&project_id)?;
    let date = parse_date_param(&state, &body.date)?;
    let start_time = parse_time(&body.start_time)
        .ok_or_else(|| ApiError::BadRequest(format!("Invalid time: {}", body.start_time)))?;
    let (service_name, duration) =
        resolve_service(&entry, body.service_name.as_deref(), body.duration)?;
    let duration = duration.ok_or_else(|| {
        ApiError::UnprocessableEntity("Either 'service_name' or 'duration' is required".to_string())
    })?;
    let client_id = body.client_id.trim();
    if client_id.is_empty() {
        return Err(ApiError::UnprocessableEntity(
            "client_id must not be empty".to_string(),
        ));
    }

    let booking = entry.allocator.allocate(AllocationRequest {
        specialist_id: specialist_id(&entry, &body.specialist_id),
        date,
        start_time,
        duration,
        client_id: ClientId::from(client_id),
        client_name: body.client_name.unwrap_or_default(),
        service_name: service_name.unwrap_or_default(),
    })?;
    info!(
        project_id = %booking.project_id,
        booking_id = %booking.booking_id,
        specialist_id = %booking.specialist_id,
        "Booking created via API"
    );
    Ok((StatusCode::CREATED, Json(booking)))
}

/// PUT /projects/:project_id/bookings/:booking_id - move or resize a booking.
pub async fn modify_booking(
    State(state): State<AppState>,
    Path((project_id, booking_id)): Path<(String, Uuid)>,
    Json(body): Json<ModifyBookingRequest>,
) -> Result<Json<Booking>, ApiError> {
    let entry = state.project(&project_id)?;
    let booking_id = BookingId(booking_id);
    let date = parse_date_param(&state, &body.date)?;
    let start_time = parse_time(&body.start_time)
        .ok_or_else(|| ApiError::BadRequest(format!("Invalid time: {}", body.start_time)))?;
    let duration = match body.duration {
        Some(duration) => duration,
        None => entry.allocator.get(booking_id)?.duration,
    };

    let booking = entry.allocator.modify(
        booking_id,
        Reschedule {
            date,
            start_time,
            duration,
            specialist_id: body
                .specialist_id
                .as_deref()
                .map(|name| specialist_id(&entry, name)),
        },
    )?;
    Ok(Json(booking))
}

/// DELETE /projects/:project_id/bookings/:booking_id - cancel (idempotent).
pub async fn cancel_booking(
    State(state): State<AppState>,
    Path((project_id, booking_id)): Path<(String, Uuid)>,
) -> Result<Json<CancelResponse>, ApiError> {
    let entry = state.project(&project_id)?;
    let response = match entry.allocator.cancel(BookingId(booking_id))? {
        CancelAck::Cancelled(booking) => CancelResponse {
            status: "cancelled".to_string(),
            booking,
        },
        CancelAck::AlreadyCancelled(booking) => CancelResponse {
            status: "already_cancelled".to_string(),
            booking,
        },
    };
    Ok(Json(response))
}

/// GET /projects/:project_id/stats - booking counts and configuration.
pub async fn project_stats(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Result<Json<ProjectStatsResponse>, ApiError> {
    let entry = state.project(&project_id)?;
    Ok(Json(ProjectStatsResponse {
        project_id: entry.config.project_id.clone(),
        name: entry.config.name.clone(),
        specialists: entry.config.specialists.clone(),
        services: entry.config.services.clone(),
        bookings: entry.allocator.stats()?,
    }))
}

/// GET /projects/:project_id/clients/:client_id/history - dialogue log.
pub async fn client_history(
    State(state): State<AppState>,
    Path((project_id, client_id)): Path<(String, String)>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryResponse>, ApiError> {
    state.project(&project_id)?;
    let limit = params
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let key = ConversationKey::new(project_id.as_str(), client_id.as_str());
    let entries = state.dialogues.transcript(&key, limit)?;
    let zip_history = state.dialogues.zip_history(&key)?;
    Ok(Json(HistoryResponse {
        project_id,
        client_id,
        zip_history,
        entries,
    }))
}

/// GET /mirror/divergences - latest reconciliation report.
pub async fn mirror_divergences(
    State(state): State<AppState>,
    Query(params): Query<DivergenceParams>,
) -> Json<DivergencesResponse> {
    let Some(reconciler) = state.reconciler.as_ref() else {
        return Json(DivergencesResponse {
            enabled: false,
            report: None,
        });
    };
    let report = reconciler.latest().map(|mut report| {
        if let Some(project_id) = params.project_id.as_deref() {
            report
                .divergences
                .retain(|d| d.project_id().as_str() == project_id);
        }
        report
    });
    Json(DivergencesResponse {
        enabled: true,
        report,
    })
}

/// GET /queue/stats - conversation counts per state.
pub async fn queue_stats(State(state): State<AppState>) -> Result<Json<QueueStats>, ApiError> {
    let stats = state
        .queue
        .stats()
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(stats))
}
