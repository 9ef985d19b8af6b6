//! Router setup with all API routes and middleware.
//!
//! Configures the axum Router with CORS, tracing, compression,
//! and all endpoint handlers.

use std::future::Future;

use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderValue, Method};
use axum::routing::{get, post, put};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use atrium_core::error::AtriumError;

use crate::handlers;
use crate::rate_limit::RateLimiter;
use crate::state::AppState;

/// Create the axum Router with all routes and middleware.
///
/// `/health` is public. `/webhook/{project_id}` is unauthenticated for the
/// messaging platforms but rate limited. Everything else needs the bearer
/// token.
pub fn create_router(state: AppState) -> Router {
    let port = state.config.general.port;
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(
            [
                format!("http://127.0.0.1:{}", port),
                format!("http://localhost:{}", port),
            ]
            .into_iter()
            .filter_map(|origin| origin.parse::<HeaderValue>().ok()),
        ))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT]);

    let limiter = RateLimiter::new(state.config.api.rate_limit_per_sec);

    let public_routes = Router::new().route("/health", get(handlers::health));

    let webhook_routes = Router::new()
        .route(
            "/webhook/{project_id}",
            post(handlers::webhook).layer(DefaultBodyLimit::max(64 * 1024)),
        )
        .layer(axum::middleware::from_fn(
            crate::rate_limit::rate_limit_middleware,
        ))
        .layer(axum::Extension(limiter.clone()));

    let rate_limited_routes = Router::new()
        .route(
            "/projects/{project_id}/availability",
            get(handlers::availability),
        )
        .route(
            "/projects/{project_id}/bookings",
            get(handlers::list_bookings).post(handlers::create_booking),
        )
        .route(
            "/projects/{project_id}/bookings/{booking_id}",
            put(handlers::modify_booking).delete(handlers::cancel_booking),
        )
        .route("/projects/{project_id}/stats", get(handlers::project_stats))
        .route(
            "/projects/{project_id}/clients/{client_id}/history",
            get(handlers::client_history),
        )
        .route("/mirror/divergences", get(handlers::mirror_divergences))
        .route("/queue/stats", get(handlers::queue_stats))
        .layer(axum::middleware::from_fn(
            crate::rate_limit::rate_limit_middleware,
        ))
        .layer(axum::Extension(limiter));

    // SSE stream exempt from rate limiting.
    let stream_routes = Router::new().route("/stream", get(handlers::stream));

    let protected_routes =
        rate_limited_routes
            .merge(stream_routes)
            .route_layer(axum::middleware::from_fn_with_state(
                state.clone(),
                crate::auth::require_auth,
            ));

    public_routes
        .merge(webhook_routes)
        .merge(protected_routes)
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the API on `127.0.0.1:{port}` until `shutdown` resolves.
pub async fn start_server(
    port: u16,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), AtriumError> {
    let addr = format!("127.0.0.1:{}", port);
    let router = create_router(state);

    tracing::info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| AtriumError::Api(format!("Failed to bind: {}", e)))?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| AtriumError::Api(format!("Server error: {}", e)))?;

    Ok(())
}
