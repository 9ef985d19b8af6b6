use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Enums
// =============================================================================

/// Lifecycle state of a booking. Cancelled bookings are retained, never deleted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Active,
    Cancelled,
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BookingStatus::Active => write!(f, "active"),
            BookingStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for BookingStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(BookingStatus::Active),
            "cancelled" => Ok(BookingStatus::Cancelled),
            _ => Err(format!("Unknown booking status: {}", s)),
        }
    }
}

/// Author of a dialogue line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialogueRole {
    Client,
    Assistant,
}

impl fmt::Display for DialogueRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialogueRole::Client => write!(f, "client"),
            DialogueRole::Assistant => write!(f, "assistant"),
        }
    }
}

impl std::str::FromStr for DialogueRole {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" => Ok(DialogueRole::Client),
            "assistant" => Ok(DialogueRole::Assistant),
            _ => Err(format!("Unknown dialogue role: {}", s)),
        }
    }
}

// =============================================================================
// Newtype Wrappers - Identity
// =============================================================================

/// Tenant identifier. One deployment serves many projects.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProjectId(pub String);

/// Messaging-platform client identifier, unique within a project.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(pub String);

/// Specialist name as configured for a project.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SpecialistId(pub String);

macro_rules! string_id {
    ($name:ident) => {
        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(ProjectId);
string_id!(ClientId);
string_id!(SpecialistId);

/// Unique identifier for a booking.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BookingId(pub Uuid);

impl BookingId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BookingId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BookingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A conversation is identified by the pair (project, client).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    pub project_id: ProjectId,
    pub client_id: ClientId,
}

impl ConversationKey {
    pub fn new(project_id: impl Into<ProjectId>, client_id: impl Into<ClientId>) -> Self {
        Self {
            project_id: project_id.into(),
            client_id: client_id.into(),
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project_id, self.client_id)
    }
}

// =============================================================================
// Newtype Wrappers - Temporal
// =============================================================================

/// Unix timestamp in seconds since epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now().timestamp())
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp())
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.0, 0).unwrap_or_default()
    }
}

/// Half-open time interval `[start, end)` within one day.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl SlotRange {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Range covering `slots` consecutive slots of `slot_minutes` each.
    ///
    /// Returns `None` when the range would run past midnight.
    pub fn from_slots(start: NaiveTime, slots: u32, slot_minutes: u32) -> Option<Self> {
        let minutes = i64::from(slots) * i64::from(slot_minutes);
        let (end, wrapped) = start.overflowing_add_signed(Duration::minutes(minutes));
        if wrapped != 0 || (end <= start && minutes > 0) {
            return None;
        }
        Some(Self { start, end })
    }

    pub fn overlaps(&self, other: &SlotRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains(&self, other: &SlotRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }
}

impl fmt::Display for SlotRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

// =============================================================================
// Aggregates
// =============================================================================

/// A reservation of contiguous slots for one specialist on one date.
///
/// Mutated only by the allocator. `version` increases by one on every
/// committed change and is what the mirror projection keys idempotency on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub booking_id: BookingId,
    pub project_id: ProjectId,
    pub specialist_id: SpecialistId,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    /// Duration in slot units.
    pub duration: u32,
    pub client_id: ClientId,
    pub client_name: String,
    pub service_name: String,
    pub status: BookingStatus,
    pub version: u64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Booking {
    pub fn is_active(&self) -> bool {
        self.status == BookingStatus::Active
    }

    /// Occupied range given the slot length of the schedule.
    pub fn range(&self, slot_minutes: u32) -> Option<SlotRange> {
        SlotRange::from_slots(self.start_time, self.duration, slot_minutes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_booking_status_serialization() {
        let json = serde_json::to_string(&BookingStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
        let back: BookingStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, BookingStatus::Cancelled);
    }

    #[test]
    fn test_booking_status_from_str() {
        assert_eq!("active".parse::<BookingStatus>(), Ok(BookingStatus::Active));
        assert!("deleted".parse::<BookingStatus>().is_err());
    }

    #[test]
    fn test_dialogue_role_display_and_parse() {
        assert_eq!(DialogueRole::Assistant.to_string(), "assistant");
        assert_eq!("client".parse::<DialogueRole>(), Ok(DialogueRole::Client));
    }

    #[test]
    fn test_slot_range_from_slots() {
        let range = SlotRange::from_slots(t(9, 0), 3, 30).unwrap();
        assert_eq!(range.end, t(10, 30));
        assert_eq!(range.minutes(), 90);
        assert_eq!(range.to_string(), "09:00-10:30");
    }

    #[test]
    fn test_slot_range_past_midnight_rejected() {
        assert!(SlotRange::from_slots(t(23, 30), 2, 30).is_none());
        assert!(SlotRange::from_slots(t(23, 30), 1, 30).is_none());
    }

    #[test]
    fn test_slot_range_overlap_is_half_open() {
        let a = SlotRange::new(t(9, 0), t(10, 0));
        let b = SlotRange::new(t(10, 0), t(11, 0));
        let c = SlotRange::new(t(9, 30), t(10, 30));
        assert!(!a.overlaps(&b));
        assert!(!b.overlaps(&a));
        assert!(a.overlaps(&c));
        assert!(c.overlaps(&b));
    }

    #[test]
    fn test_slot_range_contains() {
        let day = SlotRange::new(t(9, 0), t(18, 0));
        assert!(day.contains(&SlotRange::new(t(9, 0), t(9, 30))));
        assert!(day.contains(&SlotRange::new(t(17, 30), t(18, 0))));
        assert!(!day.contains(&SlotRange::new(t(17, 30), t(18, 30))));
    }

    #[test]
    fn test_conversation_key_display() {
        let key = ConversationKey::new("salon", "client-7");
        assert_eq!(key.to_string(), "salon/client-7");
    }

    #[test]
    fn test_booking_id_unique() {
        assert_ne!(BookingId::new(), BookingId::new());
    }

    #[test]
    fn test_timestamp_to_datetime_roundtrip() {
        let now = Utc::now();
        let ts = Timestamp::from_datetime(now);
        assert_eq!(ts.to_datetime().timestamp(), now.timestamp());
    }
}
