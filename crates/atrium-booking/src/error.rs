//! Error types for the booking allocator.

use atrium_core::error::AtriumError;
use atrium_core::types::{BookingId, SlotRange, SpecialistId};
use chrono::{NaiveDate, NaiveTime};

/// Errors from allocator operations.
///
/// `Conflict` is an expected outcome under contention; callers re-query and
/// offer alternatives instead of retrying the same range.
#[derive(Debug, thiserror::Error)]
pub enum AllocationError {
    #[error("Slot conflict: {specialist_id} on {date} at {requested} is taken")]
    Conflict {
        specialist_id: SpecialistId,
        date: NaiveDate,
        requested: SlotRange,
    },
    #[error("Booking not found: {0}")]
    NotFound(BookingId),
    #[error("Unknown specialist: {0}")]
    UnknownSpecialist(SpecialistId),
    #[error("Requested range {requested} is outside working hours {window}")]
    OutsideWorkingHours {
        requested: SlotRange,
        window: SlotRange,
    },
    #[error("Start time {} is not on the slot grid", .0.format("%H:%M"))]
    OffGrid(NaiveTime),
    #[error("Invalid duration: {0} slots")]
    InvalidDuration(u32),
    #[error("Storage error: {0}")]
    Storage(#[from] AtriumError),
}

impl AllocationError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, AllocationError::Conflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_conflict_display() {
        let err = AllocationError::Conflict {
            specialist_id: SpecialistId::from("Anna"),
            date: NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            requested: SlotRange::new(t(10, 0), t(11, 0)),
        };
        assert_eq!(
            err.to_string(),
            "Slot conflict: Anna on 2026-03-02 at 10:00-11:00 is taken"
        );
        assert!(err.is_conflict());
    }

    #[test]
    fn test_not_found_preserves_id() {
        let id = BookingId(Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap());
        let err = AllocationError::NotFound(id);
        assert_eq!(
            err.to_string(),
            "Booking not found: 550e8400-e29b-41d4-a716-446655440000"
        );
        assert!(!err.is_conflict());
    }

    #[test]
    fn test_outside_hours_and_grid_display() {
        let err = AllocationError::OutsideWorkingHours {
            requested: SlotRange::new(t(17, 30), t(18, 30)),
            window: SlotRange::new(t(9, 0), t(18, 0)),
        };
        assert_eq!(
            err.to_string(),
            "Requested range 17:30-18:30 is outside working hours 09:00-18:00"
        );

        let err = AllocationError::OffGrid(t(10, 15));
        assert_eq!(err.to_string(), "Start time 10:15 is not on the slot grid");

        let err = AllocationError::InvalidDuration(0);
        assert_eq!(err.to_string(), "Invalid duration: 0 slots");
    }

    #[test]
    fn test_from_atrium_error() {
        let err: AllocationError = AtriumError::Storage("disk full".to_string()).into();
        assert!(matches!(err, AllocationError::Storage(_)));
        assert!(err.to_string().contains("disk full"));
    }
}
