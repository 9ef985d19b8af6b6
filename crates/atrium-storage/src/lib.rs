//! Atrium storage crate - SQLite persistence for dialogues and bookings.
//!
//! Provides a WAL-mode SQLite database with migrations, the dialogue store
//! with its archival job, client feedback, and the durable booking journal
//! the allocator writes through.

pub mod archive;
pub mod db;
pub mod dialogue;
pub mod feedback;
pub mod journal;
pub mod migrations;

pub use archive::{ArchiveReport, DialogueArchiver, HistoryCompressor};
pub use db::Database;
pub use dialogue::{DialogueEntry, DialogueRepository, DialogueStats};
pub use feedback::{FeedbackEntry, FeedbackRepository};
pub use journal::SqliteJournal;
