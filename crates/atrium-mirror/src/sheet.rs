//! Sheet clients.
//!
//! A sheet holds one entry per booking placement. Entries written by the
//! projector carry the booking id and version; entries typed in by a human
//! have no booking id.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use tracing::debug;

use atrium_core::config::ProjectConfig;
use atrium_core::error::AtriumError;
use atrium_core::types::{Booking, BookingId, ClientId, ProjectId, SpecialistId};

use crate::error::MirrorError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetEntry {
    pub booking_id: Option<BookingId>,
    pub specialist_id: SpecialistId,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    /// Duration in slot units.
    pub duration: u32,
    pub client_id: Option<ClientId>,
    pub client_name: String,
    pub service_name: String,
    /// Booking version the entry was written from; 0 for external entries.
    #[serde(default)]
    pub version: u64,
}

impl SheetEntry {
    pub fn from_booking(booking: &Booking) -> Self {
        Self {
            booking_id: Some(booking.booking_id),
            specialist_id: booking.specialist_id.clone(),
            date: booking.date,
            start_time: booking.start_time,
            duration: booking.duration,
            client_id: Some(booking.client_id.clone()),
            client_name: booking.client_name.clone(),
            service_name: booking.service_name.clone(),
            version: booking.version,
        }
    }

    /// Whether the entry shows the booking as it is now.
    pub fn agrees_with(&self, booking: &Booking) -> bool {
        self.specialist_id == booking.specialist_id
            && self.date == booking.date
            && self.start_time == booking.start_time
            && self.duration == booking.duration
            && self.client_name == booking.client_name
            && self.service_name == booking.service_name
    }
}

#[async_trait]
pub trait SheetClient: Send + Sync {
    /// Write the booking's current placement, replacing any earlier entry
    /// for the same booking.
    async fn upsert_booking(&self, booking: &Booking) -> Result<(), MirrorError>;

    /// Clear the booking's entry. Removing an absent entry succeeds.
    async fn remove_booking(&self, booking: &Booking) -> Result<(), MirrorError>;

    async fn read_slots(
        &self,
        project_id: &ProjectId,
        specialist_id: &SpecialistId,
        date: NaiveDate,
    ) -> Result<Vec<SheetEntry>, MirrorError>;
}

// =============================================================================
// HTTP bridge
// =============================================================================

/// JSON client for the sheet bridge service.
///
/// Each project maps to the sheet named by its `sheet_id`, or to its
/// project id when none is configured.
pub struct HttpSheetClient {
    http_client: reqwest::Client,
    endpoint: String,
    sheets: HashMap<ProjectId, String>,
}

impl HttpSheetClient {
    pub fn new(
        endpoint: &str,
        projects: &[ProjectConfig],
        timeout: Duration,
    ) -> Result<Self, AtriumError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AtriumError::Config(format!("Failed to build HTTP client: {}", e)))?;
        let sheets = projects
            .iter()
            .map(|p| {
                let sheet = p.sheet_id.clone().unwrap_or_else(|| p.project_id.clone());
                (ProjectId::from(p.project_id.as_str()), sheet)
            })
            .collect();
        Ok(Self {
            http_client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            sheets,
        })
    }

    fn sheet_url(&self, project_id: &ProjectId) -> String {
        let sheet = self
            .sheets
            .get(project_id)
            .map(String::as_str)
            .unwrap_or_else(|| project_id.as_str());
        format!("{}/sheets/{}", self.endpoint, sheet)
    }
}

#[async_trait]
impl SheetClient for HttpSheetClient {
    async fn upsert_booking(&self, booking: &Booking) -> Result<(), MirrorError> {
        let url = format!(
            "{}/bookings/{}",
            self.sheet_url(&booking.project_id),
            booking.booking_id
        );
        let response = self
            .http_client
            .put(&url)
            .json(&SheetEntry::from_booking(booking))
            .send()
            .await
            .map_err(|e| MirrorError::WriteFailed(format!("request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(MirrorError::WriteFailed(format!(
                "sheet bridge returned {}",
                response.status()
            )));
        }
        debug!(booking_id = %booking.booking_id, version = booking.version, "Sheet entry written");
        Ok(())
    }

    async fn remove_booking(&self, booking: &Booking) -> Result<(), MirrorError> {
        let url = format!(
            "{}/bookings/{}",
            self.sheet_url(&booking.project_id),
            booking.booking_id
        );
        let response = self
            .http_client
            .delete(&url)
            .send()
            .await
            .map_err(|e| MirrorError::WriteFailed(format!("request failed: {}", e)))?;
        let status = response.status();
        if !status.is_success() && status != reqwest::StatusCode::NOT_FOUND {
            return Err(MirrorError::WriteFailed(format!(
                "sheet bridge returned {}",
                status
            )));
        }
        Ok(())
    }

    async fn read_slots(
        &self,
        project_id: &ProjectId,
        specialist_id: &SpecialistId,
        date: NaiveDate,
    ) -> Result<Vec<SheetEntry>, MirrorError> {
        let url = format!("{}/slots", self.sheet_url(project_id));
        let response = self
            .http_client
            .get(&url)
            .query(&[
                ("specialist", specialist_id.as_str().to_string()),
                ("date", date.format("%Y-%m-%d").to_string()),
            ])
            .send()
            .await
            .map_err(|e| MirrorError::ReadFailed(format!("request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(MirrorError::ReadFailed(format!(
                "sheet bridge returned {}",
                response.status()
            )));
        }
        response
            .json::<Vec<SheetEntry>>()
            .await
            .map_err(|e| MirrorError::ReadFailed(format!("invalid slot payload: {}", e)))
    }
}

// =============================================================================
// In-memory sheet
// =============================================================================

/// Sheet kept in process memory. Used when no bridge is configured.
#[derive(Default)]
pub struct InMemorySheet {
    entries: Mutex<HashMap<ProjectId, Vec<SheetEntry>>>,
}

impl InMemorySheet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry as if a person had typed it into the sheet.
    pub fn insert_external(&self, project_id: &ProjectId, entry: SheetEntry) -> Result<(), MirrorError> {
        self.lock_for_write()?
            .entry(project_id.clone())
            .or_default()
            .push(entry);
        Ok(())
    }

    /// All entries of a project.
    pub fn entries(&self, project_id: &ProjectId) -> Vec<SheetEntry> {
        match self.entries.lock() {
            Ok(map) => map.get(project_id).cloned().unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    fn lock_for_write(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<ProjectId, Vec<SheetEntry>>>, MirrorError> {
        self.entries
            .lock()
            .map_err(|_| MirrorError::WriteFailed("sheet lock poisoned".to_string()))
    }
}

#[async_trait]
impl SheetClient for InMemorySheet {
    async fn upsert_booking(&self, booking: &Booking) -> Result<(), MirrorError> {
        let mut map = self.lock_for_write()?;
        let rows = map.entry(booking.project_id.clone()).or_default();
        rows.retain(|e| e.booking_id != Some(booking.booking_id));
        rows.push(SheetEntry::from_booking(booking));
        Ok(())
    }

    async fn remove_booking(&self, booking: &Booking) -> Result<(), MirrorError> {
        let mut map = self.lock_for_write()?;
        if let Some(rows) = map.get_mut(&booking.project_id) {
            rows.retain(|e| e.booking_id != Some(booking.booking_id));
        }
        Ok(())
    }

    async fn read_slots(
        &self,
        project_id: &ProjectId,
        specialist_id: &SpecialistId,
        date: NaiveDate,
    ) -> Result<Vec<SheetEntry>, MirrorError> {
        let map = self
            .entries
            .lock()
            .map_err(|_| MirrorError::ReadFailed("sheet lock poisoned".to_string()))?;
        let mut rows: Vec<SheetEntry> = map
            .get(project_id)
            .map(|rows| {
                rows.iter()
                    .filter(|e| &e.specialist_id == specialist_id && e.date == date)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by_key(|e| e.start_time);
        Ok(rows)
    }
}
