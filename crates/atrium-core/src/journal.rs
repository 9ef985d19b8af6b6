//! Durable record of committed booking mutations.

use std::sync::Mutex;

use crate::error::{AtriumError, Result};
use crate::events::BookingEvent;

/// Sink the allocator writes every committed mutation to while it still holds
/// the scope lock. An `Err` aborts the mutation.
pub trait BookingJournal: Send + Sync {
    fn record(&self, event: &BookingEvent) -> Result<()>;
}

/// Journal that keeps events in memory. Used when no database is configured
/// and in tests.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    events: Mutex<Vec<BookingEvent>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<BookingEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BookingJournal for MemoryJournal {
    fn record(&self, event: &BookingEvent) -> Result<()> {
        let mut events = self
            .events
            .lock()
            .map_err(|e| AtriumError::Storage(format!("Journal lock poisoned: {}", e)))?;
        events.push(event.clone());
        Ok(())
    }
}
