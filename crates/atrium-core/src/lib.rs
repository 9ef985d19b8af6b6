pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod journal;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AtriumConfig, ProjectConfig};
pub use error::{AtriumError, Result};
pub use events::{BookingEvent, BookingEventKind};
pub use journal::{BookingJournal, MemoryJournal};
pub use types::*;
