//! One-way projection of committed booking events onto the sheet.
//!
//! The projector reads its project's event feed from an offset cursor.
//! Every event is applied at least once; the last applied version per
//! booking makes redelivery harmless. A write that keeps failing is retried
//! with exponential backoff and then reported as `MirrorWriteFailed`, after
//! which the cursor moves on. The allocator never waits on any of this.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use atrium_booking::EventFeed;
use atrium_core::config::MirrorConfig;
use atrium_core::events::{BookingEvent, BookingEventKind};
use atrium_core::types::{BookingId, ProjectId};

use crate::error::MirrorError;
use crate::sheet::SheetClient;

/// Events read from the feed per pass.
const BATCH_SIZE: usize = 100;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ProjectorStats {
    /// Next feed offset to read.
    pub offset: u64,
    pub applied: u64,
    /// Duplicate, stale or superseded events.
    pub skipped: u64,
    /// Events given up on after `max_attempts`.
    pub failed: u64,
}

enum Delivery {
    Applied,
    Failed,
    Interrupted,
}

pub struct MirrorProjector {
    project_id: ProjectId,
    feed: Arc<EventFeed>,
    sheet: Arc<dyn SheetClient>,
    retry_base_ms: u64,
    retry_max_ms: u64,
    max_attempts: u32,
    offset: AtomicU64,
    applied_versions: Mutex<HashMap<BookingId, u64>>,
    stats: Mutex<ProjectorStats>,
    stopping: AtomicBool,
    shutdown: Notify,
}

impl MirrorProjector {
    pub fn new(
        project_id: ProjectId,
        feed: Arc<EventFeed>,
        sheet: Arc<dyn SheetClient>,
        config: &MirrorConfig,
    ) -> Self {
        Self {
            project_id,
            feed,
            sheet,
            retry_base_ms: config.retry_base_ms,
            retry_max_ms: config.retry_max_ms,
            max_attempts: config.max_attempts.max(1),
            offset: AtomicU64::new(0),
            applied_versions: Mutex::new(HashMap::new()),
            stats: Mutex::new(ProjectorStats::default()),
            stopping: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    pub fn stats(&self) -> ProjectorStats {
        let mut stats = match self.stats.lock() {
            Ok(stats) => stats.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        stats.offset = self.offset.load(Ordering::Acquire);
        stats
    }

    /// Project everything currently in the feed. Returns the number of
    /// events consumed.
    pub async fn run_once(&self) -> usize {
        let mut consumed = 0;
        loop {
            let offset = self.offset.load(Ordering::Acquire);
            let batch = self.feed.read_from(offset, BATCH_SIZE);
            if batch.is_empty() {
                return consumed;
            }

            // Within a batch only the newest version of a booking matters.
            let mut newest: HashMap<BookingId, u64> = HashMap::new();
            for (_, event) in &batch {
                let version = newest.entry(event.booking_id()).or_insert(0);
                *version = (*version).max(event.version());
            }

            for (event_offset, event) in &batch {
                let superseded = newest
                    .get(&event.booking_id())
                    .is_some_and(|&v| v > event.version());
                if superseded || self.already_applied(event) {
                    self.count(|s| s.skipped += 1);
                    debug!(
                        project_id = %self.project_id,
                        booking_id = %event.booking_id(),
                        version = event.version(),
                        "Mirror skipped stale event"
                    );
                } else {
                    match self.deliver(event).await {
                        Delivery::Applied => {
                            self.record_applied(event);
                            self.count(|s| s.applied += 1);
                        }
                        Delivery::Failed => self.count(|s| s.failed += 1),
                        Delivery::Interrupted => return consumed,
                    }
                }
                self.offset.store(event_offset + 1, Ordering::Release);
                consumed += 1;
            }
        }
    }

    /// Project until shutdown, waking whenever the feed grows.
    pub async fn run(&self) {
        info!(
            project_id = %self.project_id,
            max_attempts = self.max_attempts,
            "Mirror projector started"
        );
        loop {
            let handled = self.run_once().await;
            if self.stopping.load(Ordering::Acquire) {
                info!(project_id = %self.project_id, "Mirror projector shutting down");
                return;
            }
            if handled > 0 {
                let stats = self.stats();
                debug!(
                    project_id = %self.project_id,
                    handled,
                    offset = stats.offset,
                    failed = stats.failed,
                    "Mirror pass completed"
                );
            }
            let offset = self.offset.load(Ordering::Acquire);
            tokio::select! {
                biased;
                _ = self.stopped() => {
                    info!(project_id = %self.project_id, "Mirror projector shutting down");
                    return;
                }
                _ = self.feed.wait_beyond(offset) => {}
            }
        }
    }

    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::Release);
        self.shutdown.notify_waiters();
    }

    async fn stopped(&self) {
        loop {
            let notified = self.shutdown.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.stopping.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }

    async fn deliver(&self, event: &BookingEvent) -> Delivery {
        let mut attempt = 1;
        loop {
            match self.apply(event).await {
                Ok(()) => {
                    debug!(
                        project_id = %self.project_id,
                        booking_id = %event.booking_id(),
                        version = event.version(),
                        kind = %event.kind,
                        attempt,
                        "Mirror applied event"
                    );
                    return Delivery::Applied;
                }
                Err(e) if attempt >= self.max_attempts => {
                    error!(
                        event = "MirrorWriteFailed",
                        project_id = %self.project_id,
                        booking_id = %event.booking_id(),
                        version = event.version(),
                        attempts = attempt,
                        error = %e,
                        "Mirror write failed permanently, moving on"
                    );
                    return Delivery::Failed;
                }
                Err(e) => {
                    let delay_ms = retry_delay_ms(self.retry_base_ms, self.retry_max_ms, attempt);
                    warn!(
                        project_id = %self.project_id,
                        booking_id = %event.booking_id(),
                        attempt,
                        retry_backoff_ms = delay_ms,
                        error = %e,
                        "Mirror write failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                        _ = self.stopped() => return Delivery::Interrupted,
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn apply(&self, event: &BookingEvent) -> Result<(), MirrorError> {
        match event.kind {
            BookingEventKind::Allocated | BookingEventKind::Modified
                if event.booking.is_active() =>
            {
                self.sheet.upsert_booking(&event.booking).await
            }
            _ => self.sheet.remove_booking(&event.booking).await,
        }
    }

    fn already_applied(&self, event: &BookingEvent) -> bool {
        let versions = match self.applied_versions.lock() {
            Ok(versions) => versions,
            Err(poisoned) => poisoned.into_inner(),
        };
        versions
            .get(&event.booking_id())
            .is_some_and(|&applied| applied >= event.version())
    }

    fn record_applied(&self, event: &BookingEvent) {
        let mut versions = match self.applied_versions.lock() {
            Ok(versions) => versions,
            Err(poisoned) => poisoned.into_inner(),
        };
        versions.insert(event.booking_id(), event.version());
    }

    fn count(&self, update: impl FnOnce(&mut ProjectorStats)) {
        let mut stats = match self.stats.lock() {
            Ok(stats) => stats,
            Err(poisoned) => poisoned.into_inner(),
        };
        update(&mut *stats);
    }
}

/// Delay before retry number `attempt` (1-based): the base doubled per
/// failed attempt, capped at `max_ms`.
fn retry_delay_ms(base_ms: u64, max_ms: u64, attempt: u32) -> u64 {
    let shift = attempt.saturating_sub(1).min(16);
    base_ms.max(1).saturating_mul(1u64 << shift).min(max_ms)
}
