//! The schedule-of-record.
//!
//! Bookings are partitioned into scopes keyed by (specialist, date). Each
//! scope sits behind its own `RwLock`: mutations take the write lock, reads
//! take the read lock and therefore never see a half-applied change.
//! Unrelated scopes never contend. A modification that moves a booking to
//! another scope locks both scopes in `ScopeKey` order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, RwLockWriteGuard};

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use atrium_core::config::ProjectConfig;
use atrium_core::error::{AtriumError, Result as CoreResult};
use atrium_core::events::{BookingEvent, BookingEventKind};
use atrium_core::journal::BookingJournal;
use atrium_core::types::{
    Booking, BookingId, BookingStatus, ClientId, ProjectId, SlotRange, SpecialistId, Timestamp,
};

use crate::error::AllocationError;
use crate::feed::EventFeed;
use crate::slots;

/// Lock scope of the allocator.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScopeKey {
    pub specialist_id: SpecialistId,
    pub date: NaiveDate,
}

impl ScopeKey {
    pub fn new(specialist_id: SpecialistId, date: NaiveDate) -> Self {
        Self {
            specialist_id,
            date,
        }
    }
}

/// Bookings of one scope, cancelled ones included.
#[derive(Debug, Default)]
struct ScopeState {
    bookings: Vec<Booking>,
}

impl ScopeState {
    fn position(&self, id: BookingId) -> Option<usize> {
        self.bookings.iter().position(|b| b.booking_id == id)
    }

    fn occupied(&self, slot_minutes: u32, except: Option<BookingId>) -> Vec<SlotRange> {
        self.bookings
            .iter()
            .filter(|b| b.is_active() && Some(b.booking_id) != except)
            .filter_map(|b| b.range(slot_minutes))
            .collect()
    }
}

/// Parameters of `allocate`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub specialist_id: SpecialistId,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    /// Duration in slot units.
    pub duration: u32,
    pub client_id: ClientId,
    pub client_name: String,
    pub service_name: String,
}

/// Target placement of `modify`. The specialist stays the same unless given.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reschedule {
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub duration: u32,
    #[serde(default)]
    pub specialist_id: Option<SpecialistId>,
}

/// Acknowledgement of `cancel`. Both variants are success.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CancelAck {
    Cancelled(Booking),
    AlreadyCancelled(Booking),
}

impl CancelAck {
    pub fn booking(&self) -> &Booking {
        match self {
            CancelAck::Cancelled(b) | CancelAck::AlreadyCancelled(b) => b,
        }
    }
}

/// Booking counts for one project.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingStats {
    pub total: usize,
    pub active: usize,
    pub cancelled: usize,
}

/// Authoritative booking state for one project.
pub struct BookingAllocator {
    project_id: ProjectId,
    specialists: Vec<SpecialistId>,
    window: SlotRange,
    slot_minutes: u32,
    scopes: Mutex<HashMap<ScopeKey, Arc<RwLock<ScopeState>>>>,
    index: RwLock<HashMap<BookingId, ScopeKey>>,
    journal: Arc<dyn BookingJournal>,
    feed: Arc<EventFeed>,
}

impl BookingAllocator {
    /// Create an empty allocator for `project`.
    pub fn new(
        project: &ProjectConfig,
        slot_minutes: u32,
        journal: Arc<dyn BookingJournal>,
        feed: Arc<EventFeed>,
    ) -> CoreResult<Self> {
        let (start, end) = project.work_hours.bounds()?;
        if slot_minutes == 0 {
            return Err(AtriumError::Config("slot_minutes must be positive".to_string()));
        }
        Ok(Self {
            project_id: ProjectId::from(project.project_id.as_str()),
            specialists: project
                .specialists
                .iter()
                .map(|s| SpecialistId::from(s.as_str()))
                .collect(),
            window: SlotRange::new(start, end),
            slot_minutes,
            scopes: Mutex::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
            journal,
            feed,
        })
    }

    pub fn project_id(&self) -> &ProjectId {
        &self.project_id
    }

    pub fn specialists(&self) -> &[SpecialistId] {
        &self.specialists
    }

    pub fn working_hours(&self) -> SlotRange {
        self.window
    }

    pub fn slot_minutes(&self) -> u32 {
        self.slot_minutes
    }

    pub fn feed(&self) -> &Arc<EventFeed> {
        &self.feed
    }

    /// Load bookings recovered from the journal. No events are emitted.
    pub fn restore(&self, bookings: Vec<Booking>) -> Result<usize, AllocationError> {
        let mut restored = 0;
        for booking in bookings {
            if booking.project_id != self.project_id {
                continue;
            }
            let key = ScopeKey::new(booking.specialist_id.clone(), booking.date);
            let scope = self.scope(&key)?;
            let mut state = write_scope(&scope)?;
            if booking.is_active() {
                let clash = booking.range(self.slot_minutes).map(|r| {
                    state
                        .occupied(self.slot_minutes, Some(booking.booking_id))
                        .iter()
                        .any(|o| o.overlaps(&r))
                });
                if clash.unwrap_or(false) {
                    warn!(
                        booking_id = %booking.booking_id,
                        specialist = %booking.specialist_id,
                        date = %booking.date,
                        "Restored booking overlaps another active booking"
                    );
                }
            }
            match state.position(booking.booking_id) {
                Some(pos) => state.bookings[pos] = booking.clone(),
                None => state.bookings.push(booking.clone()),
            }
            self.index_write()?.insert(booking.booking_id, key);
            restored += 1;
        }
        info!(project_id = %self.project_id, restored, "Bookings restored");
        Ok(restored)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Start times where `duration` contiguous slots are free, ascending.
    pub fn query_available(
        &self,
        specialist_id: &SpecialistId,
        date: NaiveDate,
        duration: u32,
    ) -> Result<Vec<NaiveTime>, AllocationError> {
        self.check_specialist(specialist_id)?;
        if duration == 0 {
            return Err(AllocationError::InvalidDuration(duration));
        }
        let key = ScopeKey::new(specialist_id.clone(), date);
        let occupied = match self.existing_scope(&key)? {
            Some(scope) => read_scope(&scope)?.occupied(self.slot_minutes, None),
            None => Vec::new(),
        };
        Ok(slots::free_starts(
            &self.window,
            self.slot_minutes,
            duration,
            &occupied,
        ))
    }

    /// Active bookings of one scope ordered by start time.
    pub fn bookings_on(
        &self,
        specialist_id: &SpecialistId,
        date: NaiveDate,
    ) -> Result<Vec<Booking>, AllocationError> {
        let key = ScopeKey::new(specialist_id.clone(), date);
        let mut bookings: Vec<Booking> = match self.existing_scope(&key)? {
            Some(scope) => read_scope(&scope)?
                .bookings
                .iter()
                .filter(|b| b.is_active())
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        bookings.sort_by_key(|b| b.start_time);
        Ok(bookings)
    }

    pub fn get(&self, booking_id: BookingId) -> Result<Booking, AllocationError> {
        let key = self
            .index_read()?
            .get(&booking_id)
            .cloned()
            .ok_or(AllocationError::NotFound(booking_id))?;
        let scope = self
            .existing_scope(&key)?
            .ok_or(AllocationError::NotFound(booking_id))?;
        let state = read_scope(&scope)?;
        state
            .position(booking_id)
            .map(|pos| state.bookings[pos].clone())
            .ok_or(AllocationError::NotFound(booking_id))
    }

    /// Active bookings of a client ordered by date and time.
    pub fn client_bookings(&self, client_id: &ClientId) -> Result<Vec<Booking>, AllocationError> {
        let mut bookings = Vec::new();
        for scope in self.all_scopes()? {
            let state = read_scope(&scope)?;
            bookings.extend(
                state
                    .bookings
                    .iter()
                    .filter(|b| b.is_active() && &b.client_id == client_id)
                    .cloned(),
            );
        }
        bookings.sort_by_key(|b| (b.date, b.start_time));
        Ok(bookings)
    }

    /// Every booking of a client, cancelled ones included, by date and start.
    pub fn client_history(&self, client_id: &ClientId) -> Result<Vec<Booking>, AllocationError> {
        let mut bookings = Vec::new();
        for scope in self.all_scopes()? {
            let state = read_scope(&scope)?;
            bookings.extend(
                state
                    .bookings
                    .iter()
                    .filter(|b| &b.client_id == client_id)
                    .cloned(),
            );
        }
        bookings.sort_by_key(|b| (b.date, b.start_time));
        Ok(bookings)
    }

    pub fn stats(&self) -> Result<BookingStats, AllocationError> {
        let mut stats = BookingStats::default();
        for scope in self.all_scopes()? {
            let state = read_scope(&scope)?;
            for booking in &state.bookings {
                stats.total += 1;
                match booking.status {
                    BookingStatus::Active => stats.active += 1,
                    BookingStatus::Cancelled => stats.cancelled += 1,
                }
            }
        }
        Ok(stats)
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Reserve a range. Fails with `Conflict` if any active booking overlaps.
    ///
    /// Repeating a request that already produced an identical active booking
    /// for the same client returns that booking.
    pub fn allocate(&self, request: AllocationRequest) -> Result<Booking, AllocationError> {
        let range = self.validate_range(&request.specialist_id, request.start_time, request.duration)?;
        let key = ScopeKey::new(request.specialist_id.clone(), request.date);
        let scope = self.scope(&key)?;
        let mut state = write_scope(&scope)?;

        if let Some(existing) = state.bookings.iter().find(|b| {
            b.is_active()
                && b.client_id == request.client_id
                && b.start_time == request.start_time
                && b.duration == request.duration
                && b.service_name == request.service_name
        }) {
            debug!(booking_id = %existing.booking_id, "Duplicate allocate absorbed");
            return Ok(existing.clone());
        }

        if state
            .occupied(self.slot_minutes, None)
            .iter()
            .any(|o| o.overlaps(&range))
        {
            debug!(
                specialist = %request.specialist_id,
                date = %request.date,
                range = %range,
                "Allocation conflict"
            );
            return Err(AllocationError::Conflict {
                specialist_id: request.specialist_id,
                date: request.date,
                requested: range,
            });
        }

        let now = Timestamp::now();
        let booking = Booking {
            booking_id: BookingId::new(),
            project_id: self.project_id.clone(),
            specialist_id: request.specialist_id,
            date: request.date,
            start_time: request.start_time,
            duration: request.duration,
            client_id: request.client_id,
            client_name: request.client_name,
            service_name: request.service_name,
            status: BookingStatus::Active,
            version: 1,
            created_at: now,
            updated_at: now,
        };

        state.bookings.push(booking.clone());
        let event = BookingEvent {
            kind: BookingEventKind::Allocated,
            booking: booking.clone(),
            previous: None,
            timestamp: now,
        };
        if let Err(e) = self.journal.record(&event) {
            state.bookings.pop();
            return Err(e.into());
        }
        self.index_write()?.insert(booking.booking_id, key);
        self.feed.publish(event);

        info!(
            booking_id = %booking.booking_id,
            project_id = %self.project_id,
            specialist = %booking.specialist_id,
            date = %booking.date,
            range = %range,
            client_id = %booking.client_id,
            "Booking allocated"
        );
        Ok(booking)
    }

    /// Cancel a booking. Cancelling an already-cancelled booking is acknowledged
    /// without a new event.
    pub fn cancel(&self, booking_id: BookingId) -> Result<CancelAck, AllocationError> {
        loop {
            let key = self.locate(booking_id)?;
            let scope = self.scope(&key)?;
            let mut state = write_scope(&scope)?;
            // Moved by a concurrent modify between lookup and lock.
            let Some(pos) = state.position(booking_id) else {
                continue;
            };

            let current = state.bookings[pos].clone();
            if !current.is_active() {
                return Ok(CancelAck::AlreadyCancelled(current));
            }

            let now = Timestamp::now();
            let mut cancelled = current.clone();
            cancelled.status = BookingStatus::Cancelled;
            cancelled.version += 1;
            cancelled.updated_at = now;

            state.bookings[pos] = cancelled.clone();
            let event = BookingEvent {
                kind: BookingEventKind::Cancelled,
                booking: cancelled.clone(),
                previous: Some(current.clone()),
                timestamp: now,
            };
            if let Err(e) = self.journal.record(&event) {
                state.bookings[pos] = current;
                return Err(e.into());
            }
            self.feed.publish(event);

            info!(
                booking_id = %booking_id,
                project_id = %self.project_id,
                specialist = %cancelled.specialist_id,
                date = %cancelled.date,
                "Booking cancelled"
            );
            return Ok(CancelAck::Cancelled(cancelled));
        }
    }

    /// Move a booking to a new placement atomically.
    ///
    /// The old range is released and the new one claimed under the same
    /// lock(s). On `Conflict` the original booking is left untouched.
    /// Cancelled bookings are reported as `NotFound`.
    pub fn modify(
        &self,
        booking_id: BookingId,
        target: Reschedule,
    ) -> Result<Booking, AllocationError> {
        loop {
            let old_key = self.locate(booking_id)?;
            let specialist_id = target
                .specialist_id
                .clone()
                .unwrap_or_else(|| old_key.specialist_id.clone());
            let new_range = self.validate_range(&specialist_id, target.start_time, target.duration)?;
            let new_key = ScopeKey::new(specialist_id, target.date);

            let old_scope = self.scope(&old_key)?;
            if old_key == new_key {
                let mut state = write_scope(&old_scope)?;
                if state.position(booking_id).is_none() {
                    continue;
                }
                return self.apply_modify(&mut state, None, booking_id, &target, &new_key, new_range);
            }

            let new_scope = self.scope(&new_key)?;
            let (mut first, mut second) = if old_key < new_key {
                (write_scope(&old_scope)?, write_scope(&new_scope)?)
            } else {
                let second = write_scope(&new_scope)?;
                (write_scope(&old_scope)?, second)
            };
            if first.position(booking_id).is_none() {
                continue;
            }
            return self.apply_modify(
                &mut first,
                Some(&mut *second),
                booking_id,
                &target,
                &new_key,
                new_range,
            );
        }
    }

    /// Body of `modify` with the required scopes already write-locked.
    /// `dest` is `None` when the booking stays in `source`.
    fn apply_modify(
        &self,
        source: &mut ScopeState,
        dest: Option<&mut ScopeState>,
        booking_id: BookingId,
        target: &Reschedule,
        new_key: &ScopeKey,
        new_range: SlotRange,
    ) -> Result<Booking, AllocationError> {
        let pos = source
            .position(booking_id)
            .ok_or(AllocationError::NotFound(booking_id))?;
        let current = source.bookings[pos].clone();
        if !current.is_active() {
            return Err(AllocationError::NotFound(booking_id));
        }

        let occupied = match &dest {
            Some(dest) => dest.occupied(self.slot_minutes, None),
            None => source.occupied(self.slot_minutes, Some(booking_id)),
        };
        if occupied.iter().any(|o| o.overlaps(&new_range)) {
            return Err(AllocationError::Conflict {
                specialist_id: new_key.specialist_id.clone(),
                date: new_key.date,
                requested: new_range,
            });
        }

        let now = Timestamp::now();
        let mut updated = current.clone();
        updated.specialist_id = new_key.specialist_id.clone();
        updated.date = target.date;
        updated.start_time = target.start_time;
        updated.duration = target.duration;
        updated.version += 1;
        updated.updated_at = now;

        let event = BookingEvent {
            kind: BookingEventKind::Modified,
            booking: updated.clone(),
            previous: Some(current.clone()),
            timestamp: now,
        };

        match dest {
            None => {
                source.bookings[pos] = updated.clone();
                if let Err(e) = self.journal.record(&event) {
                    source.bookings[pos] = current;
                    return Err(e.into());
                }
            }
            Some(dest) => {
                source.bookings.remove(pos);
                dest.bookings.push(updated.clone());
                if let Err(e) = self.journal.record(&event) {
                    dest.bookings.pop();
                    source.bookings.insert(pos, current);
                    return Err(e.into());
                }
                self.index_write()?.insert(booking_id, new_key.clone());
            }
        }
        self.feed.publish(event);

        info!(
            booking_id = %booking_id,
            project_id = %self.project_id,
            from = %format!("{} {} {}", current.specialist_id, current.date, current.start_time.format("%H:%M")),
            to = %format!("{} {} {}", updated.specialist_id, updated.date, new_range),
            "Booking modified"
        );
        Ok(updated)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn check_specialist(&self, specialist_id: &SpecialistId) -> Result<(), AllocationError> {
        if self.specialists.contains(specialist_id) {
            Ok(())
        } else {
            Err(AllocationError::UnknownSpecialist(specialist_id.clone()))
        }
    }

    fn validate_range(
        &self,
        specialist_id: &SpecialistId,
        start: NaiveTime,
        duration: u32,
    ) -> Result<SlotRange, AllocationError> {
        self.check_specialist(specialist_id)?;
        if duration == 0 {
            return Err(AllocationError::InvalidDuration(duration));
        }
        if !slots::is_on_grid(&self.window, start, self.slot_minutes) {
            if start < self.window.start {
                let requested = SlotRange::from_slots(start, duration, self.slot_minutes)
                    .unwrap_or(SlotRange::new(start, start));
                return Err(AllocationError::OutsideWorkingHours {
                    requested,
                    window: self.window,
                });
            }
            return Err(AllocationError::OffGrid(start));
        }
        let range = SlotRange::from_slots(start, duration, self.slot_minutes).ok_or(
            AllocationError::OutsideWorkingHours {
                requested: SlotRange::new(start, self.window.end),
                window: self.window,
            },
        )?;
        if !self.window.contains(&range) {
            return Err(AllocationError::OutsideWorkingHours {
                requested: range,
                window: self.window,
            });
        }
        Ok(range)
    }

    fn locate(&self, booking_id: BookingId) -> Result<ScopeKey, AllocationError> {
        self.index_read()?
            .get(&booking_id)
            .cloned()
            .ok_or(AllocationError::NotFound(booking_id))
    }

    fn scope(&self, key: &ScopeKey) -> Result<Arc<RwLock<ScopeState>>, AllocationError> {
        let mut scopes = self
            .scopes
            .lock()
            .map_err(|e| AtriumError::Storage(format!("Scope map lock poisoned: {}", e)))?;
        Ok(Arc::clone(scopes.entry(key.clone()).or_default()))
    }

    fn existing_scope(
        &self,
        key: &ScopeKey,
    ) -> Result<Option<Arc<RwLock<ScopeState>>>, AllocationError> {
        let scopes = self
            .scopes
            .lock()
            .map_err(|e| AtriumError::Storage(format!("Scope map lock poisoned: {}", e)))?;
        Ok(scopes.get(key).cloned())
    }

    fn all_scopes(&self) -> Result<Vec<Arc<RwLock<ScopeState>>>, AllocationError> {
        let scopes = self
            .scopes
            .lock()
            .map_err(|e| AtriumError::Storage(format!("Scope map lock poisoned: {}", e)))?;
        Ok(scopes.values().cloned().collect())
    }

    fn index_read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<BookingId, ScopeKey>>, AllocationError> {
        self.index
            .read()
            .map_err(|e| AtriumError::Storage(format!("Booking index lock poisoned: {}", e)).into())
    }

    fn index_write(
        &self,
    ) -> Result<RwLockWriteGuard<'_, HashMap<BookingId, ScopeKey>>, AllocationError> {
        self.index
            .write()
            .map_err(|e| AtriumError::Storage(format!("Booking index lock poisoned: {}", e)).into())
    }
}

fn read_scope(
    scope: &RwLock<ScopeState>,
) -> Result<std::sync::RwLockReadGuard<'_, ScopeState>, AllocationError> {
    scope
        .read()
        .map_err(|e| AtriumError::Storage(format!("Scope lock poisoned: {}", e)).into())
}

fn write_scope(
    scope: &RwLock<ScopeState>,
) -> Result<RwLockWriteGuard<'_, ScopeState>, AllocationError> {
    scope
        .write()
        .map_err(|e| AtriumError::Storage(format!("Scope lock poisoned: {}", e)).into())
}
