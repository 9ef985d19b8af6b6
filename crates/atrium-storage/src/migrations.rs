//! Database schema migrations.
//!
//! v1 is the initial schema: dialogues, client_activity, bookings,
//! booking_events and the schema_migrations tracking table. v2 adds the
//! feedback table.

use rusqlite::Connection;
use tracing::info;

use atrium_core::error::AtriumError;

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<(), AtriumError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| AtriumError::Storage(format!("Failed to create migrations table: {}", e)))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| AtriumError::Storage(format!("Failed to query migration version: {}", e)))?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: initial_schema");
    }

    if current_version < 2 {
        apply_v2(conn)?;
        info!("Applied migration v2: client_feedback");
    }

    Ok(())
}

/// Version 1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<(), AtriumError> {
    conn.execute_batch(
        "
        -- Per-client conversation log.
        CREATE TABLE IF NOT EXISTS dialogues (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id  TEXT NOT NULL,
            client_id   TEXT NOT NULL,
            role        TEXT NOT NULL CHECK (role IN ('client', 'assistant')),
            message     TEXT NOT NULL,
            timestamp   INTEGER NOT NULL,
            archived    INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_dialogues_client
            ON dialogues (project_id, client_id, id DESC);

        CREATE INDEX IF NOT EXISTS idx_dialogues_unarchived
            ON dialogues (archived, project_id, client_id);

        -- Last activity and compressed history per client.
        CREATE TABLE IF NOT EXISTS client_activity (
            project_id          TEXT NOT NULL,
            client_id           TEXT NOT NULL,
            last_message_at     INTEGER NOT NULL,
            zip_history         TEXT,
            last_compression_at INTEGER,
            PRIMARY KEY (project_id, client_id)
        );

        CREATE INDEX IF NOT EXISTS idx_client_activity_last
            ON client_activity (last_message_at);

        -- Latest committed state of every booking.
        CREATE TABLE IF NOT EXISTS bookings (
            booking_id      TEXT PRIMARY KEY NOT NULL,
            project_id      TEXT NOT NULL,
            specialist_id   TEXT NOT NULL,
            date            TEXT NOT NULL,
            start_time      TEXT NOT NULL,
            duration        INTEGER NOT NULL CHECK (duration > 0),
            client_id       TEXT NOT NULL,
            client_name     TEXT NOT NULL DEFAULT '',
            service_name    TEXT NOT NULL DEFAULT '',
            status          TEXT NOT NULL CHECK (status IN ('active', 'cancelled')),
            version         INTEGER NOT NULL,
            created_at      INTEGER NOT NULL,
            updated_at      INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_bookings_scope
            ON bookings (project_id, specialist_id, date);

        CREATE INDEX IF NOT EXISTS idx_bookings_client
            ON bookings (project_id, client_id);

        -- Append-only log of committed mutations, in commit order.
        CREATE TABLE IF NOT EXISTS booking_events (
            seq         INTEGER PRIMARY KEY AUTOINCREMENT,
            booking_id  TEXT NOT NULL,
            project_id  TEXT NOT NULL,
            kind        TEXT NOT NULL CHECK (kind IN ('allocated', 'modified', 'cancelled')),
            version     INTEGER NOT NULL,
            payload     TEXT NOT NULL,
            timestamp   INTEGER NOT NULL,
            UNIQUE (booking_id, version)
        );

        INSERT OR IGNORE INTO schema_migrations (version, name) VALUES (1, 'initial_schema');
        ",
    )
    .map_err(|e| AtriumError::Storage(format!("Migration v1 failed: {}", e)))?;

    Ok(())
}

/// Version 2: Client feedback captured during turns.
fn apply_v2(conn: &Connection) -> Result<(), AtriumError> {
    conn.execute_batch(
        "
        -- One row per turn that carried a comment about the business.
        CREATE TABLE IF NOT EXISTS feedback (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id  TEXT NOT NULL,
            client_id   TEXT NOT NULL,
            turn_seq    INTEGER NOT NULL,
            comment     TEXT NOT NULL,
            created_at  INTEGER NOT NULL,
            UNIQUE (project_id, client_id, turn_seq)
        );

        CREATE INDEX IF NOT EXISTS idx_feedback_project
            ON feedback (project_id, created_at DESC);

        INSERT OR IGNORE INTO schema_migrations (version, name) VALUES (2, 'client_feedback');
        ",
    )
    .map_err(|e| AtriumError::Storage(format!("Migration v2 failed: {}", e)))?;

    Ok(())
}
