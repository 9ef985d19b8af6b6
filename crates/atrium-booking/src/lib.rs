//! Booking allocator for atrium.
//!
//! Holds the schedule-of-record: which (specialist, date, slot range)
//! triples are occupied. Mutations are serialized per (specialist, date)
//! scope and published to an append-only event feed after they are durable.

pub mod allocator;
pub mod error;
pub mod feed;
pub mod slots;

pub use allocator::{
    AllocationRequest, BookingAllocator, BookingStats, CancelAck, Reschedule, ScopeKey,
};
pub use error::AllocationError;
pub use feed::EventFeed;
