//! Slot grid arithmetic.
//!
//! A day is divided into fixed-length slots starting at the opening time.
//! A service of N slots fits at a start slot only when the N contiguous
//! slots from there are inside working hours and free.

use atrium_core::types::SlotRange;
use chrono::{Duration, NaiveTime};

/// Whether `start` lies on the slot grid anchored at `window.start`.
pub fn is_on_grid(window: &SlotRange, start: NaiveTime, slot_minutes: u32) -> bool {
    let offset = (start - window.start).num_minutes();
    offset >= 0 && slot_minutes > 0 && offset % i64::from(slot_minutes) == 0
}

/// Every grid start time at which `duration` slots fit inside `window`.
pub fn grid_starts(window: &SlotRange, slot_minutes: u32, duration: u32) -> Vec<NaiveTime> {
    let mut starts = Vec::new();
    if slot_minutes == 0 || duration == 0 {
        return starts;
    }
    let step = Duration::minutes(i64::from(slot_minutes));
    let mut cursor = window.start;
    while cursor < window.end {
        match SlotRange::from_slots(cursor, duration, slot_minutes) {
            Some(range) if range.end <= window.end => starts.push(cursor),
            _ => break,
        }
        let (next, wrapped) = cursor.overflowing_add_signed(step);
        if wrapped != 0 {
            break;
        }
        cursor = next;
    }
    starts
}

/// Grid start times where `duration` contiguous slots avoid every occupied range.
///
/// Output is ascending and deterministic for a given input.
pub fn free_starts(
    window: &SlotRange,
    slot_minutes: u32,
    duration: u32,
    occupied: &[SlotRange],
) -> Vec<NaiveTime> {
    grid_starts(window, slot_minutes, duration)
        .into_iter()
        .filter(|start| {
            SlotRange::from_slots(*start, duration, slot_minutes)
                .map(|candidate| !occupied.iter().any(|o| o.overlaps(&candidate)))
                .unwrap_or(false)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn day() -> SlotRange {
        SlotRange::new(t(9, 0), t(18, 0))
    }

    #[test]
    fn test_grid_starts_single_slot() {
        let starts = grid_starts(&day(), 30, 1);
        assert_eq!(starts.len(), 18);
        assert_eq!(starts.first(), Some(&t(9, 0)));
        assert_eq!(starts.last(), Some(&t(17, 30)));
    }

    #[test]
    fn test_grid_starts_multi_slot_stops_before_close() {
        let starts = grid_starts(&day(), 30, 3);
        assert_eq!(starts.last(), Some(&t(16, 30)));
        assert_eq!(starts.len(), 16);
    }

    #[test]
    fn test_grid_starts_longer_than_day() {
        assert!(grid_starts(&day(), 30, 19).is_empty());
        assert!(grid_starts(&day(), 30, 0).is_empty());
    }

    #[test]
    fn test_free_starts_requires_contiguous_slots() {
        // 10:00-10:30 and 11:30-12:00 are taken.
        let occupied = vec![
            SlotRange::new(t(10, 0), t(10, 30)),
            SlotRange::new(t(11, 30), t(12, 0)),
        ];
        let window = SlotRange::new(t(9, 0), t(12, 0));
        let free = free_starts(&window, 30, 2, &occupied);
        // 9:00 fits (9:00-10:00); 9:30 would hit 10:00; 10:30 fits (10:30-11:30).
        assert_eq!(free, vec![t(9, 0), t(10, 30)]);
    }

    #[test]
    fn test_free_starts_adjacent_booking_does_not_block() {
        let occupied = vec![SlotRange::new(t(9, 0), t(9, 30))];
        let window = SlotRange::new(t(9, 0), t(10, 30));
        assert_eq!(free_starts(&window, 30, 1, &occupied), vec![t(9, 30), t(10, 0)]);
    }

    #[test]
    fn test_is_on_grid() {
        assert!(is_on_grid(&day(), t(9, 0), 30));
        assert!(is_on_grid(&day(), t(13, 30), 30));
        assert!(!is_on_grid(&day(), t(13, 15), 30));
        assert!(!is_on_grid(&day(), t(8, 30), 30));
    }
}
