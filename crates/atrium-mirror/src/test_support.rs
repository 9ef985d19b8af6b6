//! Fixtures shared by the unit tests of this crate.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};

use atrium_core::events::{BookingEvent, BookingEventKind};
use atrium_core::types::{
    Booking, BookingId, BookingStatus, ClientId, ProjectId, SpecialistId, Timestamp,
};

use crate::error::MirrorError;
use crate::sheet::{InMemorySheet, SheetClient, SheetEntry};

pub(crate) fn monday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
}

pub(crate) fn booking(specialist: &str, hour: u32, minute: u32) -> Booking {
    Booking {
        booking_id: BookingId::new(),
        project_id: ProjectId::from("salon"),
        specialist_id: SpecialistId::from(specialist),
        date: monday(),
        start_time: NaiveTime::from_hms_opt(hour, minute, 0).unwrap(),
        duration: 2,
        client_id: ClientId::from("c1"),
        client_name: "Maria".to_string(),
        service_name: "Haircut".to_string(),
        status: BookingStatus::Active,
        version: 1,
        created_at: Timestamp(1_772_438_400),
        updated_at: Timestamp(1_772_438_400),
    }
}

pub(crate) fn event(kind: BookingEventKind, booking: &Booking) -> BookingEvent {
    BookingEvent {
        kind,
        booking: booking.clone(),
        previous: None,
        timestamp: booking.updated_at,
    }
}

/// In-memory sheet whose first `failures` writes fail.
pub(crate) struct FlakySheet {
    inner: InMemorySheet,
    failures: u32,
    attempts: AtomicU32,
    writes: AtomicU32,
}

impl FlakySheet {
    pub(crate) fn new(failures: u32) -> Self {
        Self {
            inner: InMemorySheet::new(),
            failures,
            attempts: AtomicU32::new(0),
            writes: AtomicU32::new(0),
        }
    }

    pub(crate) fn inner(&self) -> &InMemorySheet {
        &self.inner
    }

    /// Write calls, failed ones included.
    pub(crate) fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Successful writes.
    pub(crate) fn writes(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }

    fn gate(&self) -> Result<(), MirrorError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(MirrorError::WriteFailed("bridge unavailable".to_string()));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl SheetClient for FlakySheet {
    async fn upsert_booking(&self, booking: &Booking) -> Result<(), MirrorError> {
        self.gate()?;
        self.inner.upsert_booking(booking).await
    }

    async fn remove_booking(&self, booking: &Booking) -> Result<(), MirrorError> {
        self.gate()?;
        self.inner.remove_booking(booking).await
    }

    async fn read_slots(
        &self,
        project_id: &ProjectId,
        specialist_id: &SpecialistId,
        date: NaiveDate,
    ) -> Result<Vec<SheetEntry>, MirrorError> {
        self.inner.read_slots(project_id, specialist_id, date).await
    }
}
