//! Integration tests for the Atrium API.
//!
//! Drives the router with `oneshot` requests against in-memory state: the
//! webhook and its backpressure paths, booking administration, history,
//! mirror reports and authentication.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{TimeZone, Utc};
use serde_json::Value;
use tower::ServiceExt;

use atrium_agent::{BroadcastReplySink, ProjectRegistry};
use atrium_api::create_router;
use atrium_api::handlers::{
    AvailabilityResponse, BookingsResponse, CancelResponse, EnqueueResponse, HealthResponse,
    HistoryResponse, ProjectStatsResponse,
};
use atrium_api::state::AppState;
use atrium_booking::{BookingAllocator, EventFeed};
use atrium_core::clock::{Clock, ManualClock};
use atrium_core::config::{AtriumConfig, MirrorConfig, ProjectConfig, WorkHours};
use atrium_core::journal::{BookingJournal, MemoryJournal};
use atrium_core::types::{Booking, ConversationKey, Timestamp};
use atrium_mirror::{InMemorySheet, Reconciler, SheetClient};
use atrium_queue::{ConversationQueue, QueueStats};
use atrium_storage::{Database, DialogueRepository};

// =============================================================================
// Helpers
// =============================================================================

const TEST_TOKEN: &str = "test-token-12345";

fn salon() -> ProjectConfig {
    ProjectConfig {
        project_id: "salon".to_string(),
        name: "Salon Aurora".to_string(),
        specialists: vec!["Anna".to_string(), "Olga".to_string()],
        sheet_id: None,
        reply_webhook: None,
        services: BTreeMap::from([
            ("Haircut".to_string(), 2),
            ("Manicure".to_string(), 1),
        ]),
        work_hours: WorkHours::default(),
    }
}

/// Fresh state over in-memory storage, with the clock at Monday
/// 2026-03-02 08:00 UTC.
fn make_state_with(config: AtriumConfig) -> AppState {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap(),
    ));
    let mut registry = ProjectRegistry::new();
    for project in &config.projects {
        let allocator = BookingAllocator::new(
            project,
            config.schedule.slot_minutes,
            Arc::new(MemoryJournal::new()) as Arc<dyn BookingJournal>,
            Arc::new(EventFeed::new()),
        )
        .unwrap();
        registry.insert(project.clone(), Arc::new(allocator));
    }
    let queue = Arc::new(ConversationQueue::new(
        config.queue.clone(),
        Arc::clone(&clock),
    ));
    let dialogues = Arc::new(DialogueRepository::new(Arc::new(
        Database::in_memory().unwrap(),
    )));
    let mut state = AppState::new(
        config,
        queue,
        Arc::new(registry),
        dialogues,
        Arc::new(BroadcastReplySink::new(16)),
        clock,
    );
    state.api_token = TEST_TOKEN.to_string();
    state
}

fn make_state() -> AppState {
    make_state_with(AtriumConfig {
        projects: vec![salon()],
        ..AtriumConfig::default()
    })
}

fn authed(method: &str, uri: &str, json: Option<&str>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {}", TEST_TOKEN));
    match json {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

fn authed_get(uri: &str) -> Request<Body> {
    authed("GET", uri, None)
}

fn webhook(project: &str, client: &str, text: &str) -> Request<Body> {
    Request::post(format!("/webhook/{}", project))
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({ "client_id": client, "text": text }).to_string(),
        ))
        .unwrap()
}

async fn body_bytes(resp: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(resp.into_body(), 1024 * 1024)
        .await
        .unwrap()
        .to_vec()
}

async fn create_booking(state: &AppState, json: &str) -> axum::response::Response {
    create_router(state.clone())
        .oneshot(authed("POST", "/projects/salon/bookings", Some(json)))
        .await
        .unwrap()
}

const HAIRCUT_AT_TEN: &str = r#"{
    "specialist_id": "anna",
    "date": "2026-03-03",
    "start_time": "10:00",
    "service_name": "haircut",
    "client_id": "c1",
    "client_name": "Maria"
}"#;

// =============================================================================
// Public endpoints
// =============================================================================

#[tokio::test]
async fn test_health_happy_path() {
    let resp = create_router(make_state())
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let health: HealthResponse = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(health.status, "healthy");
    assert_eq!(health.projects, 1);
    assert_eq!(health.queue.conversations, 0);
    assert!(!health.mirror_enabled);
}

#[tokio::test]
async fn test_webhook_accepts_and_buffers() {
    let state = make_state();
    let app = create_router(state.clone());
    let resp = app.oneshot(webhook("salon", "c1", "hello")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let body: EnqueueResponse = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(body.status, "accepted");
    assert_eq!(body.pending, 1);

    let resp = create_router(state.clone())
        .oneshot(webhook("salon", "c1", "is 10:00 free?"))
        .await
        .unwrap();
    let body: EnqueueResponse = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(body.pending, 2);

    let snapshot = state
        .queue
        .snapshot(&ConversationKey::new("salon", "c1"))
        .unwrap();
    assert_eq!(snapshot.pending, 2);
}

#[tokio::test]
async fn test_webhook_unknown_project_is_404() {
    let resp = create_router(make_state())
        .oneshot(webhook("bakery", "c1", "hello"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_webhook_blank_text_is_422() {
    let resp = create_router(make_state())
        .oneshot(webhook("salon", "c1", "   "))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let json: Value = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(json["error"], "unprocessable_entity");
}

#[tokio::test]
async fn test_webhook_queue_full_is_429_with_retry_after() {
    let mut config = AtriumConfig {
        projects: vec![salon()],
        ..AtriumConfig::default()
    };
    config.queue.max_queue_size = 2;
    let state = make_state_with(config);

    for text in ["one", "two"] {
        let resp = create_router(state.clone())
            .oneshot(webhook("salon", "c1", text))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
    }
    let resp = create_router(state.clone())
        .oneshot(webhook("salon", "c1", "three"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    // max_wait_ms defaults to 15s.
    assert_eq!(resp.headers()["retry-after"], "15");

    // Other conversations are unaffected.
    let resp = create_router(state)
        .oneshot(webhook("salon", "c2", "hi"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_webhook_per_client_rate_limit() {
    let mut config = AtriumConfig {
        projects: vec![salon()],
        ..AtriumConfig::default()
    };
    config.api.max_messages_per_minute = 2;
    let state = make_state_with(config);

    for _ in 0..2 {
        let resp = create_router(state.clone())
            .oneshot(webhook("salon", "c1", "hi"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
    }
    let resp = create_router(state)
        .oneshot(webhook("salon", "c1", "hi again"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    // The clock sits on a minute boundary.
    assert_eq!(resp.headers()["retry-after"], "60");
}

// =============================================================================
// Authentication
// =============================================================================

#[tokio::test]
async fn test_protected_route_requires_token() {
    let resp = create_router(make_state())
        .oneshot(Request::get("/queue/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = create_router(make_state())
        .oneshot(
            Request::get("/queue/stats")
                .header("authorization", "Bearer wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let json: Value = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(json["message"], "Invalid bearer token");
}

#[tokio::test]
async fn test_queue_stats_with_token() {
    let state = make_state();
    state.queue.enqueue("salon", "c1", "hello").unwrap();
    let resp = create_router(state)
        .oneshot(authed_get("/queue/stats"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let stats: QueueStats = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(stats.conversations, 1);
    assert_eq!(stats.collecting, 1);
    assert_eq!(stats.pending_fragments, 1);
}

#[tokio::test]
async fn test_stream_opens_event_stream() {
    let resp = create_router(make_state())
        .oneshot(authed_get("/stream"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let content_type = resp
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    assert!(content_type.starts_with("text/event-stream"));

    let resp = create_router(make_state())
        .oneshot(Request::get("/stream").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

// =============================================================================
// Bookings
// =============================================================================

#[tokio::test]
async fn test_availability_full_day_grid() {
    let resp = create_router(make_state())
        .oneshot(authed_get(
            "/projects/salon/availability?date=2026-03-03&service=Haircut",
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: AvailabilityResponse = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(body.duration, 2);
    assert_eq!(body.specialists.len(), 2);
    // 09:00-18:00 in 30 minute slots: 17 starts fit a one hour service.
    assert_eq!(body.specialists[0].starts.len(), 17);
    assert_eq!(body.specialists[0].starts[0], "09:00");
    assert_eq!(body.specialists[0].starts[16], "17:00");
}

#[tokio::test]
async fn test_availability_invalid_date_is_400() {
    let resp = create_router(make_state())
        .oneshot(authed_get("/projects/salon/availability?date=tomorrowish"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_create_booking_then_conflict() {
    let state = make_state();
    let resp = create_booking(&state, HAIRCUT_AT_TEN).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let booking: Booking = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(booking.specialist_id.as_str(), "Anna");
    assert_eq!(booking.service_name, "Haircut");
    assert_eq!(booking.duration, 2);

    let overlapping = r#"{
        "specialist_id": "Anna",
        "date": "03.03.2026",
        "start_time": "10:30",
        "duration": 1,
        "client_id": "c2"
    }"#;
    let resp = create_booking(&state, overlapping).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let json: Value = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(json["error"], "conflict");

    // The slot range is gone from availability.
    let resp = create_router(state)
        .oneshot(authed_get(
            "/projects/salon/availability?date=2026-03-03&specialist=Anna",
        ))
        .await
        .unwrap();
    let body: AvailabilityResponse = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    let starts = &body.specialists[0].starts;
    assert!(!starts.contains(&"10:00".to_string()));
    assert!(!starts.contains(&"10:30".to_string()));
    assert!(starts.contains(&"11:00".to_string()));
}

#[tokio::test]
async fn test_create_booking_validation_errors() {
    let state = make_state();
    let unknown_service = r#"{"specialist_id": "Anna", "date": "2026-03-03",
        "start_time": "10:00", "service_name": "Massage", "client_id": "c1"}"#;
    let no_duration = r#"{"specialist_id": "Anna", "date": "2026-03-03",
        "start_time": "10:00", "client_id": "c1"}"#;
    let after_hours = r#"{"specialist_id": "Anna", "date": "2026-03-03",
        "start_time": "17:30", "service_name": "Haircut", "client_id": "c1"}"#;
    let unknown_specialist = r#"{"specialist_id": "Boris", "date": "2026-03-03",
        "start_time": "10:00", "duration": 1, "client_id": "c1"}"#;

    for body in [unknown_service, no_duration, after_hours, unknown_specialist] {
        let resp = create_booking(&state, body).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY, "{}", body);
    }

    let bad_time = r#"{"specialist_id": "Anna", "date": "2026-03-03",
        "start_time": "ten", "duration": 1, "client_id": "c1"}"#;
    assert_eq!(
        create_booking(&state, bad_time).await.status(),
        StatusCode::BAD_REQUEST
    );
}

#[tokio::test]
async fn test_list_bookings_by_date_and_client() {
    let state = make_state();
    create_booking(&state, HAIRCUT_AT_TEN).await;
    let olga = r#"{"specialist_id": "Olga", "date": "2026-03-03",
        "start_time": "09:00", "service_name": "Manicure", "client_id": "c2"}"#;
    create_booking(&state, olga).await;

    let resp = create_router(state.clone())
        .oneshot(authed_get("/projects/salon/bookings?date=2026-03-03"))
        .await
        .unwrap();
    let body: BookingsResponse = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    let order: Vec<&str> = body
        .bookings
        .iter()
        .map(|b| b.specialist_id.as_str())
        .collect();
    assert_eq!(order, vec!["Olga", "Anna"]);

    let resp = create_router(state.clone())
        .oneshot(authed_get("/projects/salon/bookings?client_id=c1"))
        .await
        .unwrap();
    let body: BookingsResponse = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(body.bookings.len(), 1);
    assert_eq!(body.bookings[0].client_name, "Maria");

    let resp = create_router(state)
        .oneshot(authed_get("/projects/salon/bookings"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_modify_booking_keeps_duration() {
    let state = make_state();
    let resp = create_booking(&state, HAIRCUT_AT_TEN).await;
    let booking: Booking = serde_json::from_slice(&body_bytes(resp).await).unwrap();

    let resp = create_router(state.clone())
        .oneshot(authed(
            "PUT",
            &format!("/projects/salon/bookings/{}", booking.booking_id),
            Some(r#"{"date": "2026-03-04", "start_time": "14:00", "specialist_id": "olga"}"#),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let moved: Booking = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(moved.booking_id, booking.booking_id);
    assert_eq!(moved.specialist_id.as_str(), "Olga");
    assert_eq!(moved.duration, 2);
    assert_eq!(moved.version, booking.version + 1);

    let resp = create_router(state)
        .oneshot(authed(
            "PUT",
            &format!("/projects/salon/bookings/{}", uuid::Uuid::new_v4()),
            Some(r#"{"date": "2026-03-04", "start_time": "14:00", "duration": 1}"#),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_twice_acks_both_times() {
    let state = make_state();
    let resp = create_booking(&state, HAIRCUT_AT_TEN).await;
    let booking: Booking = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    let uri = format!("/projects/salon/bookings/{}", booking.booking_id);

    let resp = create_router(state.clone())
        .oneshot(authed("DELETE", &uri, None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let first: CancelResponse = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(first.status, "cancelled");

    let resp = create_router(state.clone())
        .oneshot(authed("DELETE", &uri, None))
        .await
        .unwrap();
    let second: CancelResponse = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(second.status, "already_cancelled");

    let resp = create_router(state)
        .oneshot(authed_get("/projects/salon/stats"))
        .await
        .unwrap();
    let stats: ProjectStatsResponse = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(stats.bookings.total, 1);
    assert_eq!(stats.bookings.active, 0);
    assert_eq!(stats.bookings.cancelled, 1);
    assert_eq!(stats.name, "Salon Aurora");
}

// =============================================================================
// History and mirror
// =============================================================================

#[tokio::test]
async fn test_client_history() {
    let state = make_state();
    let key = ConversationKey::new("salon", "c1");
    state
        .dialogues
        .append_turn(
            &key,
            &["hi".to_string(), "free tomorrow?".to_string()],
            "Yes, from 09:00.",
            Timestamp(1_772_438_400),
        )
        .unwrap();

    let resp = create_router(state)
        .oneshot(authed_get("/projects/salon/clients/c1/history?limit=10"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: HistoryResponse = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(body.entries.len(), 3);
    assert_eq!(body.entries[2].message, "Yes, from 09:00.");
    assert!(body.zip_history.is_none());
}

#[tokio::test]
async fn test_mirror_divergences_disabled() {
    let resp = create_router(make_state())
        .oneshot(authed_get("/mirror/divergences"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json: Value = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(json["enabled"], false);
    assert!(json["report"].is_null());
}

#[tokio::test]
async fn test_mirror_divergences_report() {
    let state = make_state();
    let resp = create_booking(&state, HAIRCUT_AT_TEN).await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let allocators = state
        .projects
        .iter()
        .map(|(_, entry)| Arc::clone(&entry.allocator))
        .collect();
    let reconciler = Arc::new(Reconciler::new(
        allocators,
        Arc::new(InMemorySheet::new()) as Arc<dyn SheetClient>,
        Arc::clone(&state.clock),
        &MirrorConfig {
            enabled: true,
            reconcile_days: 7,
            ..MirrorConfig::default()
        },
        0,
    ));
    reconciler.run_once().await;
    let state = state.with_reconciler(reconciler);

    let resp = create_router(state)
        .oneshot(authed_get("/mirror/divergences?project_id=salon"))
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(json["enabled"], true);
    let divergences = json["report"]["divergences"].as_array().unwrap();
    assert_eq!(divergences.len(), 1);
    assert_eq!(divergences[0]["kind"], "missing_in_mirror");
}
