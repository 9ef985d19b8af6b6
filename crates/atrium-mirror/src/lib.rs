//! Spreadsheet mirror for atrium.
//!
//! The sheet is a non-authoritative projection of the allocator. Committed
//! booking events are projected asynchronously (at least once, idempotent
//! on booking id + version) and a periodic reconciliation pass reports
//! where the sheet and the schedule disagree. Divergences are surfaced to
//! operators; nothing is written back into the allocator.

pub mod error;
pub mod projector;
pub mod reconcile;
pub mod sheet;

pub use error::MirrorError;
pub use projector::{MirrorProjector, ProjectorStats};
pub use reconcile::{Divergence, ReconcileReport, Reconciler};
pub use sheet::{HttpSheetClient, InMemorySheet, SheetClient, SheetEntry};

#[cfg(test)]
pub(crate) mod test_support;
