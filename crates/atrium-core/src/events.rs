use serde::{Deserialize, Serialize};

use crate::types::{Booking, BookingId, Timestamp};

/// Kind of committed booking mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingEventKind {
    Allocated,
    Modified,
    Cancelled,
}

impl std::fmt::Display for BookingEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BookingEventKind::Allocated => write!(f, "allocated"),
            BookingEventKind::Modified => write!(f, "modified"),
            BookingEventKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for BookingEventKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allocated" => Ok(BookingEventKind::Allocated),
            "modified" => Ok(BookingEventKind::Modified),
            "cancelled" => Ok(BookingEventKind::Cancelled),
            _ => Err(format!("Unknown booking event kind: {}", s)),
        }
    }
}

/// A committed change to the schedule-of-record.
///
/// Emitted by the allocator after the change is durable and consumed by:
/// - The booking journal (persistence)
/// - The mirror projector (spreadsheet)
/// - The SSE broadcast channel
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingEvent {
    pub kind: BookingEventKind,
    /// Booking state after the change.
    pub booking: Booking,
    /// Placement before a modification, so projections can clear it.
    pub previous: Option<Booking>,
    pub timestamp: Timestamp,
}

impl BookingEvent {
    pub fn booking_id(&self) -> BookingId {
        self.booking.booking_id
    }

    pub fn version(&self) -> u64 {
        self.booking.version
    }

    pub fn event_name(&self) -> &'static str {
        match self.kind {
            BookingEventKind::Allocated => "booking_allocated",
            BookingEventKind::Modified => "booking_modified",
            BookingEventKind::Cancelled => "booking_cancelled",
        }
    }
}
