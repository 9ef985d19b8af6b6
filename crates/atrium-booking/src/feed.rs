//! Append-only feed of committed booking events.
//!
//! The allocator publishes here after the journal has accepted a change.
//! Consumers track their own offset and read forward; publishing never
//! waits on a consumer.

use std::sync::Mutex;

use tokio::sync::{broadcast, Notify};

use atrium_core::events::BookingEvent;

/// Ordered in-memory event log with offset-based reads.
pub struct EventFeed {
    events: Mutex<Vec<BookingEvent>>,
    notify: Notify,
    live: broadcast::Sender<BookingEvent>,
}

impl EventFeed {
    /// Create an empty feed.
    pub fn new() -> Self {
        Self::with_history(Vec::new())
    }

    /// Create a feed seeded with events replayed from the journal.
    pub fn with_history(events: Vec<BookingEvent>) -> Self {
        let (live, _) = broadcast::channel(256);
        Self {
            events: Mutex::new(events),
            notify: Notify::new(),
            live,
        }
    }

    /// Append an event and wake waiting readers. Returns its offset.
    pub fn publish(&self, event: BookingEvent) -> u64 {
        let offset = match self.events.lock() {
            Ok(mut events) => {
                events.push(event.clone());
                events.len() as u64 - 1
            }
            Err(poisoned) => {
                let mut events = poisoned.into_inner();
                events.push(event.clone());
                events.len() as u64 - 1
            }
        };
        // No live subscribers is fine.
        let _ = self.live.send(event);
        self.notify.notify_waiters();
        offset
    }

    /// Up to `limit` events starting at `offset`, paired with their offsets.
    pub fn read_from(&self, offset: u64, limit: usize) -> Vec<(u64, BookingEvent)> {
        let events = match self.events.lock() {
            Ok(events) => events,
            Err(poisoned) => poisoned.into_inner(),
        };
        events
            .iter()
            .enumerate()
            .skip(offset as usize)
            .take(limit)
            .map(|(i, e)| (i as u64, e.clone()))
            .collect()
    }

    /// Number of events published so far.
    pub fn len(&self) -> u64 {
        match self.events.lock() {
            Ok(events) => events.len() as u64,
            Err(poisoned) => poisoned.into_inner().len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until the feed holds more than `offset` events.
    pub async fn wait_beyond(&self, offset: u64) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.len() > offset {
                return;
            }
            notified.await;
        }
    }

    /// Live stream of events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<BookingEvent> {
        self.live.subscribe()
    }
}

impl Default for EventFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atrium_core::events::BookingEventKind;
    use atrium_core::types::{
        Booking, BookingId, BookingStatus, ClientId, ProjectId, SpecialistId, Timestamp,
    };
    use chrono::{NaiveDate, NaiveTime};
    use std::sync::Arc;

    fn event(version: u64) -> BookingEvent {
        BookingEvent {
            kind: BookingEventKind::Allocated,
            booking: Booking {
                booking_id: BookingId::new(),
                project_id: ProjectId::from("salon"),
                specialist_id: SpecialistId::from("Anna"),
                date: NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
                start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                duration: 1,
                client_id: ClientId::from("c1"),
                client_name: "Maria".to_string(),
                service_name: "Haircut".to_string(),
                status: BookingStatus::Active,
                version,
                created_at: Timestamp(0),
                updated_at: Timestamp(0),
            },
            previous: None,
            timestamp: Timestamp(0),
        }
    }

    #[test]
    fn test_publish_assigns_sequential_offsets() {
        let feed = EventFeed::new();
        assert!(feed.is_empty());
        assert_eq!(feed.publish(event(1)), 0);
        assert_eq!(feed.publish(event(1)), 1);
        assert_eq!(feed.len(), 2);
    }

    #[test]
    fn test_read_from_offset_and_limit() {
        let feed = EventFeed::with_history(vec![event(1), event(2)]);
        feed.publish(event(3));
        let tail = feed.read_from(1, 10);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].0, 1);
        assert_eq!(tail[1].1.version(), 3);
        assert_eq!(feed.read_from(0, 1).len(), 1);
        assert!(feed.read_from(5, 10).is_empty());
    }

    #[tokio::test]
    async fn test_wait_beyond_wakes_on_publish() {
        let feed = Arc::new(EventFeed::new());
        let waiter = {
            let feed = Arc::clone(&feed);
            tokio::spawn(async move { feed.wait_beyond(0).await })
        };
        tokio::task::yield_now().await;
        feed.publish(event(1));
        tokio::time::timeout(std::time::Duration::from_secs(2), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_beyond_returns_immediately_when_behind() {
        let feed = EventFeed::with_history(vec![event(1)]);
        tokio::time::timeout(std::time::Duration::from_millis(100), feed.wait_beyond(0))
            .await
            .expect("should not block");
    }

    #[tokio::test]
    async fn test_subscribe_receives_live_events() {
        let feed = EventFeed::new();
        let mut rx = feed.subscribe();
        feed.publish(event(7));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.version(), 7);
    }
}
