//! Atrium API crate - axum HTTP server, route handlers, SSE streaming.
//!
//! Provides the inbound message webhook with queue backpressure, booking
//! administration per project, dialogue history, mirror divergence reports,
//! the live operator stream and health checks.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod rate_limit;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::{create_router, start_server};
pub use state::AppState;
