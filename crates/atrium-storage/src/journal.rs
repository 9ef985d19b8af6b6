//! SQLite-backed booking journal.
//!
//! Every committed allocator mutation lands here in one transaction: the
//! `bookings` row is upserted and the event appended to `booking_events`.
//! On startup the allocator is restored from `bookings` and the event feed
//! is seeded from `booking_events`.

use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use tracing::debug;
use uuid::Uuid;

use atrium_core::error::{AtriumError, Result};
use atrium_core::events::BookingEvent;
use atrium_core::journal::BookingJournal;
use atrium_core::types::{Booking, BookingId, ClientId, ProjectId, SpecialistId, Timestamp};

use crate::db::Database;

pub struct SqliteJournal {
    db: Arc<Database>,
}

impl SqliteJournal {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Latest state of every booking of a project.
    pub fn load_bookings(&self, project_id: &ProjectId) -> Result<Vec<Booking>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT booking_id, project_id, specialist_id, date, start_time, duration,
                            client_id, client_name, service_name, status, version,
                            created_at, updated_at
                     FROM bookings
                     WHERE project_id = ?1
                     ORDER BY date, start_time",
                )
                .map_err(|e| AtriumError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map(rusqlite::params![project_id.as_str()], |row| {
                    Ok(row_to_booking(row))
                })
                .map_err(|e| AtriumError::Storage(e.to_string()))?;
            let mut bookings = Vec::new();
            for row in rows {
                bookings.push(row.map_err(|e| AtriumError::Storage(e.to_string()))??);
            }
            Ok(bookings)
        })
    }

    /// Events of a project in commit order.
    pub fn load_events(&self, project_id: &ProjectId) -> Result<Vec<BookingEvent>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT payload FROM booking_events
                     WHERE project_id = ?1
                     ORDER BY seq ASC",
                )
                .map_err(|e| AtriumError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map(rusqlite::params![project_id.as_str()], |row| {
                    row.get::<_, String>(0)
                })
                .map_err(|e| AtriumError::Storage(e.to_string()))?;
            let mut events = Vec::new();
            for row in rows {
                let payload = row.map_err(|e| AtriumError::Storage(e.to_string()))?;
                events.push(serde_json::from_str(&payload)?);
            }
            Ok(events)
        })
    }
}

impl BookingJournal for SqliteJournal {
    fn record(&self, event: &BookingEvent) -> Result<()> {
        let booking = &event.booking;
        let payload = serde_json::to_string(event)?;
        self.db.with_conn(|conn| {
            let tx = conn
                .unchecked_transaction()
                .map_err(|e| AtriumError::Storage(format!("Failed to begin transaction: {}", e)))?;
            tx.execute(
                "INSERT INTO bookings (booking_id, project_id, specialist_id, date, start_time,
                    duration, client_id, client_name, service_name, status, version,
                    created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT (booking_id) DO UPDATE SET
                    specialist_id = excluded.specialist_id,
                    date = excluded.date,
                    start_time = excluded.start_time,
                    duration = excluded.duration,
                    status = excluded.status,
                    version = excluded.version,
                    updated_at = excluded.updated_at",
                rusqlite::params![
                    booking.booking_id.to_string(),
                    booking.project_id.as_str(),
                    booking.specialist_id.as_str(),
                    booking.date.format("%Y-%m-%d").to_string(),
                    booking.start_time.format("%H:%M").to_string(),
                    booking.duration,
                    booking.client_id.as_str(),
                    booking.client_name,
                    booking.service_name,
                    booking.status.to_string(),
                    booking.version as i64,
                    booking.created_at.0,
                    booking.updated_at.0,
                ],
            )
            .map_err(|e| AtriumError::Storage(format!("Failed to save booking: {}", e)))?;
            tx.execute(
                "INSERT INTO booking_events (booking_id, project_id, kind, version, payload, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    booking.booking_id.to_string(),
                    booking.project_id.as_str(),
                    event.kind.to_string(),
                    booking.version as i64,
                    payload,
                    event.timestamp.0,
                ],
            )
            .map_err(|e| AtriumError::Storage(format!("Failed to append booking event: {}", e)))?;
            tx.commit()
                .map_err(|e| AtriumError::Storage(format!("Failed to commit booking: {}", e)))?;
            Ok(())
        })?;
        debug!(
            booking_id = %booking.booking_id,
            version = booking.version,
            kind = %event.kind,
            "Booking event journaled"
        );
        Ok(())
    }
}

fn row_to_booking(row: &rusqlite::Row<'_>) -> Result<Booking> {
    let get_err = |e: rusqlite::Error| AtriumError::Storage(e.to_string());
    let id: String = row.get(0).map_err(get_err)?;
    let date: String = row.get(3).map_err(get_err)?;
    let start: String = row.get(4).map_err(get_err)?;
    let status: String = row.get(9).map_err(get_err)?;
    let version: i64 = row.get(10).map_err(get_err)?;

    Ok(Booking {
        booking_id: BookingId(
            Uuid::parse_str(&id)
                .map_err(|e| AtriumError::Storage(format!("Invalid booking id {}: {}", id, e)))?,
        ),
        project_id: ProjectId(row.get(1).map_err(get_err)?),
        specialist_id: SpecialistId(row.get(2).map_err(get_err)?),
        date: NaiveDate::parse_from_str(&date, "%Y-%m-%d")
            .map_err(|e| AtriumError::Storage(format!("Invalid booking date {}: {}", date, e)))?,
        start_time: NaiveTime::parse_from_str(&start, "%H:%M")
            .map_err(|e| AtriumError::Storage(format!("Invalid start time {}: {}", start, e)))?,
        duration: row.get(5).map_err(get_err)?,
        client_id: ClientId(row.get(6).map_err(get_err)?),
        client_name: row.get(7).map_err(get_err)?,
        service_name: row.get(8).map_err(get_err)?,
        status: status.parse().map_err(AtriumError::Storage)?,
        version: version as u64,
        created_at: Timestamp(row.get(11).map_err(get_err)?),
        updated_at: Timestamp(row.get(12).map_err(get_err)?),
    })
}
