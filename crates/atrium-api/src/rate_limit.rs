//! Request rate limiting.
//!
//! `RateLimiter` caps total requests per second with an atomic counter that
//! resets each second. `ClientRateLimiter` caps inbound messages per client
//! per minute so a single chat cannot flood the queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;

use atrium_core::clock::Clock;
use atrium_core::types::ConversationKey;

/// Client windows kept before stale ones are dropped.
const MAX_TRACKED_CLIENTS: usize = 10_000;

/// Shared state for the global rate limiter.
#[derive(Clone)]
pub struct RateLimiter {
    /// Maximum requests allowed per second.
    max_per_sec: u64,
    /// Current count of requests in the active window.
    count: Arc<AtomicU64>,
    /// The epoch second of the current window.
    window: Arc<AtomicU64>,
}

impl RateLimiter {
    pub fn new(max_per_sec: u64) -> Self {
        Self {
            max_per_sec,
            count: Arc::new(AtomicU64::new(0)),
            window: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Try to acquire a permit. Returns true if the request is allowed.
    fn try_acquire(&self) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let current_window = self.window.load(Ordering::Relaxed);

        if now != current_window {
            self.window.store(now, Ordering::Relaxed);
            self.count.store(1, Ordering::Relaxed);
            return true;
        }

        let prev = self.count.fetch_add(1, Ordering::Relaxed);
        prev < self.max_per_sec
    }
}

/// Axum middleware that enforces the global rate limit.
pub async fn rate_limit_middleware(
    axum::extract::Extension(limiter): axum::extract::Extension<RateLimiter>,
    req: Request,
    next: Next,
) -> Response {
    if limiter.try_acquire() {
        next.run(req).await
    } else {
        (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({
                "error": "too_many_requests",
                "message": "Rate limit exceeded"
            })),
        )
            .into_response()
    }
}

/// Fixed one-minute window per conversation.
#[derive(Clone)]
pub struct ClientRateLimiter {
    max_per_minute: u32,
    clock: Arc<dyn Clock>,
    windows: Arc<Mutex<HashMap<ConversationKey, (i64, u32)>>>,
}

impl ClientRateLimiter {
    /// `max_per_minute == 0` disables the limit.
    pub fn new(max_per_minute: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_per_minute,
            clock,
            windows: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Count one message for `key`. Returns false once the client has used
    /// up this minute's allowance.
    pub fn try_acquire(&self, key: &ConversationKey) -> bool {
        if self.max_per_minute == 0 {
            return true;
        }
        let minute = self.clock.now().timestamp().div_euclid(60);
        let mut windows = match self.windows.lock() {
            Ok(windows) => windows,
            Err(poisoned) => poisoned.into_inner(),
        };
        if windows.len() >= MAX_TRACKED_CLIENTS {
            windows.retain(|_, (window, _)| *window == minute);
        }
        let entry = windows.entry(key.clone()).or_insert((minute, 0));
        if entry.0 != minute {
            *entry = (minute, 0);
        }
        if entry.1 >= self.max_per_minute {
            return false;
        }
        entry.1 += 1;
        true
    }

    /// Seconds until the current window ends.
    pub fn retry_after_secs(&self) -> u64 {
        let second = self.clock.now().timestamp().rem_euclid(60);
        (60 - second) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atrium_core::clock::ManualClock;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_global_limiter_caps_per_second() {
        let limiter = RateLimiter::new(2);
        let allowed = (0..5).filter(|_| limiter.try_acquire()).count();
        // The window may roll over mid-loop, granting at most one extra.
        assert!((2..=3).contains(&allowed));
    }

    #[test]
    fn test_client_limiter_resets_each_minute() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 10).unwrap(),
        ));
        let limiter = ClientRateLimiter::new(2, Arc::clone(&clock) as Arc<dyn Clock>);
        let key = ConversationKey::new("salon", "c1");
        let other = ConversationKey::new("salon", "c2");

        assert!(limiter.try_acquire(&key));
        assert!(limiter.try_acquire(&key));
        assert!(!limiter.try_acquire(&key));
        assert!(limiter.try_acquire(&other));
        assert_eq!(limiter.retry_after_secs(), 50);

        clock.advance_ms(60_000);
        assert!(limiter.try_acquire(&key));
    }

    #[test]
    fn test_client_limiter_disabled_at_zero() {
        let limiter = ClientRateLimiter::new(0, Arc::new(ManualClock::at_epoch()));
        let key = ConversationKey::new("salon", "c1");
        assert!((0..100).all(|_| limiter.try_acquire(&key)));
    }
}
