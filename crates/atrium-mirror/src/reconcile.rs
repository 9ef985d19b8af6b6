//! Periodic comparison of the sheet against the schedule-of-record.
//!
//! The reconciler only reports. A sheet entry that disagrees with an active
//! booking is surfaced as a divergence and never written back into the
//! allocator.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use atrium_booking::BookingAllocator;
use atrium_core::clock::Clock;
use atrium_core::config::MirrorConfig;
use atrium_core::types::{Booking, BookingId, ProjectId, SlotRange, SpecialistId};

use crate::sheet::{SheetClient, SheetEntry};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Divergence {
    /// Active booking with no entry in the sheet.
    MissingInMirror { booking: Booking },
    /// Sheet entry matching no active booking, typically typed in by hand.
    /// `overlaps` lists the active bookings it collides with.
    ExternalOnly {
        project_id: ProjectId,
        entry: SheetEntry,
        overlaps: Vec<BookingId>,
    },
    /// The sheet shows the booking differently than the allocator.
    Mismatch { booking: Booking, entry: SheetEntry },
}

impl Divergence {
    pub fn project_id(&self) -> &ProjectId {
        match self {
            Divergence::MissingInMirror { booking } | Divergence::Mismatch { booking, .. } => {
                &booking.project_id
            }
            Divergence::ExternalOnly { project_id, .. } => project_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Divergence::MissingInMirror { .. } => "missing_in_mirror",
            Divergence::ExternalOnly { .. } => "external_only",
            Divergence::Mismatch { .. } => "mismatch",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub checked_at: DateTime<Utc>,
    /// (specialist, date) pairs compared.
    pub scopes_checked: usize,
    /// Pairs that could not be read from either side.
    pub errors: usize,
    pub divergences: Vec<Divergence>,
}

pub struct Reconciler {
    allocators: Vec<Arc<BookingAllocator>>,
    sheet: Arc<dyn SheetClient>,
    clock: Arc<dyn Clock>,
    reconcile_days: u32,
    interval: Duration,
    utc_offset_minutes: i32,
    latest: RwLock<Option<ReconcileReport>>,
    shutdown: Arc<Notify>,
}

impl Reconciler {
    pub fn new(
        allocators: Vec<Arc<BookingAllocator>>,
        sheet: Arc<dyn SheetClient>,
        clock: Arc<dyn Clock>,
        config: &MirrorConfig,
        utc_offset_minutes: i32,
    ) -> Self {
        Self {
            allocators,
            sheet,
            clock,
            reconcile_days: config.reconcile_days,
            interval: Duration::from_secs(config.sync_interval_secs),
            utc_offset_minutes,
            latest: RwLock::new(None),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Report of the most recent pass.
    pub fn latest(&self) -> Option<ReconcileReport> {
        match self.latest.read() {
            Ok(latest) => latest.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Compare every specialist's next `reconcile_days` days.
    pub async fn run_once(&self) -> ReconcileReport {
        let today = self.clock.local_now(self.utc_offset_minutes).date();
        let mut report = ReconcileReport {
            checked_at: self.clock.now(),
            scopes_checked: 0,
            errors: 0,
            divergences: Vec::new(),
        };

        for allocator in &self.allocators {
            for specialist in allocator.specialists() {
                for date in today.iter_days().take(self.reconcile_days as usize) {
                    match self.compare_scope(allocator, specialist, date).await {
                        Ok(mut found) => {
                            report.scopes_checked += 1;
                            report.divergences.append(&mut found);
                        }
                        Err(e) => {
                            report.errors += 1;
                            warn!(
                                project_id = %allocator.project_id(),
                                specialist_id = %specialist,
                                date = %date,
                                error = %e,
                                "Reconciliation read failed"
                            );
                        }
                    }
                }
            }
        }

        for divergence in &report.divergences {
            warn!(
                event = "MirrorDivergence",
                project_id = %divergence.project_id(),
                kind = divergence.kind(),
                "Sheet diverges from schedule"
            );
        }
        info!(
            scopes_checked = report.scopes_checked,
            divergences = report.divergences.len(),
            errors = report.errors,
            "Reconciliation pass completed"
        );

        match self.latest.write() {
            Ok(mut latest) => *latest = Some(report.clone()),
            Err(poisoned) => *poisoned.into_inner() = Some(report.clone()),
        }
        report
    }

    /// Run passes every `sync_interval_secs` until shutdown.
    pub async fn run(&self) {
        info!(
            interval_secs = self.interval.as_secs(),
            reconcile_days = self.reconcile_days,
            "Mirror reconciler started"
        );
        loop {
            self.run_once().await;
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.shutdown.notified() => {
                    info!("Mirror reconciler shutting down");
                    return;
                }
            }
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    async fn compare_scope(
        &self,
        allocator: &BookingAllocator,
        specialist: &SpecialistId,
        date: NaiveDate,
    ) -> Result<Vec<Divergence>, String> {
        let bookings = allocator
            .bookings_on(specialist, date)
            .map_err(|e| e.to_string())?;
        let entries = self
            .sheet
            .read_slots(allocator.project_id(), specialist, date)
            .await
            .map_err(|e| e.to_string())?;
        let found = diff(
            allocator.project_id(),
            &bookings,
            &entries,
            allocator.slot_minutes(),
        );
        if !found.is_empty() {
            debug!(
                project_id = %allocator.project_id(),
                specialist_id = %specialist,
                date = %date,
                divergences = found.len(),
                "Scope diverges"
            );
        }
        Ok(found)
    }
}

/// Divergences between the active bookings of one scope and its sheet entries.
fn diff(
    project_id: &ProjectId,
    bookings: &[Booking],
    entries: &[SheetEntry],
    slot_minutes: u32,
) -> Vec<Divergence> {
    let mut found = Vec::new();

    for booking in bookings {
        match entries.iter().find(|e| e.booking_id == Some(booking.booking_id)) {
            None => found.push(Divergence::MissingInMirror {
                booking: booking.clone(),
            }),
            Some(entry) if !entry.agrees_with(booking) => found.push(Divergence::Mismatch {
                booking: booking.clone(),
                entry: entry.clone(),
            }),
            Some(_) => {}
        }
    }

    for entry in entries {
        let known = entry
            .booking_id
            .is_some_and(|id| bookings.iter().any(|b| b.booking_id == id));
        if known {
            continue;
        }
        let overlaps = match SlotRange::from_slots(entry.start_time, entry.duration, slot_minutes) {
            Some(range) => bookings
                .iter()
                .filter(|b| b.range(slot_minutes).is_some_and(|r| r.overlaps(&range)))
                .map(|b| b.booking_id)
                .collect(),
            None => Vec::new(),
        };
        found.push(Divergence::ExternalOnly {
            project_id: project_id.clone(),
            entry: entry.clone(),
            overlaps,
        });
    }

    found
}
