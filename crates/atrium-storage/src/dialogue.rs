//! Dialogue store.
//!
//! Append-only per-client message log plus a `client_activity` row holding
//! the last message time and the compressed history produced by archival.

use std::sync::Arc;

use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};

use atrium_core::error::AtriumError;
use atrium_core::types::{ClientId, ConversationKey, DialogueRole, ProjectId, Timestamp};

use crate::db::Database;

/// One stored message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogueEntry {
    pub id: i64,
    pub project_id: ProjectId,
    pub client_id: ClientId,
    pub role: DialogueRole,
    pub message: String,
    pub timestamp: Timestamp,
    pub archived: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogueStats {
    pub total: u64,
    pub archived: u64,
    pub active: u64,
    pub clients_with_archives: u64,
}

/// Repository for dialogue history.
pub struct DialogueRepository {
    db: Arc<Database>,
}

impl DialogueRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Store one message and bump the client's last activity.
    pub fn append(
        &self,
        key: &ConversationKey,
        role: DialogueRole,
        message: &str,
        at: Timestamp,
    ) -> Result<i64, AtriumError> {
        self.db.with_conn(|conn| {
            let tx = conn
                .unchecked_transaction()
                .map_err(|e| AtriumError::Storage(format!("Failed to begin transaction: {}", e)))?;
            let id = insert_message(&tx, key, role, message, at)?;
            touch_activity(&tx, key, at)?;
            tx.commit()
                .map_err(|e| AtriumError::Storage(format!("Failed to commit dialogue: {}", e)))?;
            Ok(id)
        })
    }

    /// Store a processed turn: the client's fragments followed by the reply,
    /// in one transaction.
    pub fn append_turn(
        &self,
        key: &ConversationKey,
        fragments: &[String],
        reply: &str,
        at: Timestamp,
    ) -> Result<(), AtriumError> {
        self.db.with_conn(|conn| {
            let tx = conn
                .unchecked_transaction()
                .map_err(|e| AtriumError::Storage(format!("Failed to begin transaction: {}", e)))?;
            for fragment in fragments {
                insert_message(&tx, key, DialogueRole::Client, fragment, at)?;
            }
            insert_message(&tx, key, DialogueRole::Assistant, reply, at)?;
            touch_activity(&tx, key, at)?;
            tx.commit()
                .map_err(|e| AtriumError::Storage(format!("Failed to commit turn: {}", e)))?;
            Ok(())
        })
    }

    /// Most recent unarchived messages, oldest first.
    ///
    /// A turn is a client message plus a reply, so up to `2 * max_turns`
    /// rows are returned.
    pub fn get_recent_history(
        &self,
        key: &ConversationKey,
        max_turns: usize,
    ) -> Result<Vec<DialogueEntry>, AtriumError> {
        let limit = (max_turns * 2) as i64;
        let mut entries = self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, project_id, client_id, role, message, timestamp, archived
                     FROM dialogues
                     WHERE project_id = ?1 AND client_id = ?2 AND archived = 0
                     ORDER BY id DESC
                     LIMIT ?3",
                )
                .map_err(|e| AtriumError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map(
                    rusqlite::params![key.project_id.as_str(), key.client_id.as_str(), limit],
                    |row| Ok(row_to_entry(row)),
                )
                .map_err(|e| AtriumError::Storage(e.to_string()))?;
            let mut entries = Vec::new();
            for row in rows {
                entries.push(row.map_err(|e| AtriumError::Storage(e.to_string()))??);
            }
            Ok(entries)
        })?;
        entries.reverse();
        Ok(entries)
    }

    /// Full message log for a client including archived rows, oldest first.
    pub fn transcript(
        &self,
        key: &ConversationKey,
        limit: usize,
    ) -> Result<Vec<DialogueEntry>, AtriumError> {
        let mut entries = self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, project_id, client_id, role, message, timestamp, archived
                     FROM dialogues
                     WHERE project_id = ?1 AND client_id = ?2
                     ORDER BY id DESC
                     LIMIT ?3",
                )
                .map_err(|e| AtriumError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map(
                    rusqlite::params![key.project_id.as_str(), key.client_id.as_str(), limit as i64],
                    |row| Ok(row_to_entry(row)),
                )
                .map_err(|e| AtriumError::Storage(e.to_string()))?;
            let mut entries = Vec::new();
            for row in rows {
                entries.push(row.map_err(|e| AtriumError::Storage(e.to_string()))??);
            }
            Ok(entries)
        })?;
        entries.reverse();
        Ok(entries)
    }

    /// Every unarchived message of a client, oldest first.
    pub fn unarchived(&self, key: &ConversationKey) -> Result<Vec<DialogueEntry>, AtriumError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, project_id, client_id, role, message, timestamp, archived
                     FROM dialogues
                     WHERE project_id = ?1 AND client_id = ?2 AND archived = 0
                     ORDER BY id ASC",
                )
                .map_err(|e| AtriumError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map(
                    rusqlite::params![key.project_id.as_str(), key.client_id.as_str()],
                    |row| Ok(row_to_entry(row)),
                )
                .map_err(|e| AtriumError::Storage(e.to_string()))?;
            let mut entries = Vec::new();
            for row in rows {
                entries.push(row.map_err(|e| AtriumError::Storage(e.to_string()))??);
            }
            Ok(entries)
        })
    }

    /// Compressed history produced by the last archival pass.
    pub fn zip_history(&self, key: &ConversationKey) -> Result<Option<String>, AtriumError> {
        self.db.with_conn(|conn| {
            let zip: Option<Option<String>> = conn
                .query_row(
                    "SELECT zip_history FROM client_activity WHERE project_id = ?1 AND client_id = ?2",
                    rusqlite::params![key.project_id.as_str(), key.client_id.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| AtriumError::Storage(e.to_string()))?;
            Ok(zip.flatten())
        })
    }

    /// Clients whose last message is older than `cutoff` and who still have
    /// unarchived messages.
    pub fn inactive_clients(&self, cutoff: Timestamp) -> Result<Vec<ConversationKey>, AtriumError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT a.project_id, a.client_id
                     FROM client_activity a
                     WHERE a.last_message_at < ?1
                       AND EXISTS (
                           SELECT 1 FROM dialogues d
                           WHERE d.project_id = a.project_id
                             AND d.client_id = a.client_id
                             AND d.archived = 0
                       )
                     ORDER BY a.last_message_at ASC",
                )
                .map_err(|e| AtriumError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map(rusqlite::params![cutoff.0], |row| {
                    let project: String = row.get(0)?;
                    let client: String = row.get(1)?;
                    Ok(ConversationKey::new(project, client))
                })
                .map_err(|e| AtriumError::Storage(e.to_string()))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| AtriumError::Storage(e.to_string()))
        })
    }

    /// Replace the compressed history and mark messages up to `up_to_id` as
    /// archived, atomically. Returns the number of rows archived.
    pub fn archive(
        &self,
        key: &ConversationKey,
        zip_history: &str,
        up_to_id: i64,
        at: Timestamp,
    ) -> Result<usize, AtriumError> {
        self.db.with_conn(|conn| {
            let tx = conn
                .unchecked_transaction()
                .map_err(|e| AtriumError::Storage(format!("Failed to begin transaction: {}", e)))?;
            tx.execute(
                "UPDATE client_activity
                 SET zip_history = ?3, last_compression_at = ?4
                 WHERE project_id = ?1 AND client_id = ?2",
                rusqlite::params![
                    key.project_id.as_str(),
                    key.client_id.as_str(),
                    zip_history,
                    at.0
                ],
            )
            .map_err(|e| AtriumError::Storage(format!("Failed to store zip history: {}", e)))?;
            let archived = tx
                .execute(
                    "UPDATE dialogues SET archived = 1
                     WHERE project_id = ?1 AND client_id = ?2 AND archived = 0 AND id <= ?3",
                    rusqlite::params![key.project_id.as_str(), key.client_id.as_str(), up_to_id],
                )
                .map_err(|e| AtriumError::Storage(format!("Failed to archive dialogues: {}", e)))?;
            tx.commit()
                .map_err(|e| AtriumError::Storage(format!("Failed to commit archive: {}", e)))?;
            Ok(archived)
        })
    }

    pub fn stats(&self) -> Result<DialogueStats, AtriumError> {
        self.db.with_conn(|conn| {
            let (total, archived): (i64, i64) = conn
                .query_row(
                    "SELECT COUNT(*), COALESCE(SUM(archived), 0) FROM dialogues",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(|e| AtriumError::Storage(e.to_string()))?;
            let with_archives: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM client_activity WHERE zip_history IS NOT NULL",
                    [],
                    |row| row.get(0),
                )
                .map_err(|e| AtriumError::Storage(e.to_string()))?;
            Ok(DialogueStats {
                total: total as u64,
                archived: archived as u64,
                active: (total - archived) as u64,
                clients_with_archives: with_archives as u64,
            })
        })
    }
}

fn insert_message(
    conn: &rusqlite::Connection,
    key: &ConversationKey,
    role: DialogueRole,
    message: &str,
    at: Timestamp,
) -> Result<i64, AtriumError> {
    conn.execute(
        "INSERT INTO dialogues (project_id, client_id, role, message, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            key.project_id.as_str(),
            key.client_id.as_str(),
            role.to_string(),
            message,
            at.0
        ],
    )
    .map_err(|e| AtriumError::Storage(format!("Failed to save dialogue: {}", e)))?;
    Ok(conn.last_insert_rowid())
}

fn touch_activity(
    conn: &rusqlite::Connection,
    key: &ConversationKey,
    at: Timestamp,
) -> Result<(), AtriumError> {
    conn.execute(
        "INSERT INTO client_activity (project_id, client_id, last_message_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT (project_id, client_id)
         DO UPDATE SET last_message_at = MAX(last_message_at, excluded.last_message_at)",
        rusqlite::params![key.project_id.as_str(), key.client_id.as_str(), at.0],
    )
    .map_err(|e| AtriumError::Storage(format!("Failed to update client activity: {}", e)))?;
    Ok(())
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> Result<DialogueEntry, AtriumError> {
    let get_err = |e: rusqlite::Error| AtriumError::Storage(e.to_string());
    let role: String = row.get(3).map_err(get_err)?;
    let archived: i64 = row.get(6).map_err(get_err)?;
    Ok(DialogueEntry {
        id: row.get(0).map_err(get_err)?,
        project_id: ProjectId(row.get(1).map_err(get_err)?),
        client_id: ClientId(row.get(2).map_err(get_err)?),
        role: role
            .parse()
            .map_err(|e: String| AtriumError::Storage(e))?,
        message: row.get(4).map_err(get_err)?,
        timestamp: Timestamp(row.get(5).map_err(get_err)?),
        archived: archived != 0,
    })
}
