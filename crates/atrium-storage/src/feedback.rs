//! Client feedback captured while processing turns.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use atrium_core::error::AtriumError;
use atrium_core::types::{ClientId, ConversationKey, ProjectId, Timestamp};

use crate::db::Database;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackEntry {
    pub id: i64,
    pub project_id: ProjectId,
    pub client_id: ClientId,
    pub turn_seq: u64,
    pub comment: String,
    pub created_at: Timestamp,
}

pub struct FeedbackRepository {
    db: Arc<Database>,
}

impl FeedbackRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Store the comment left in one turn. A retried turn records nothing
    /// new; returns whether a row was written.
    pub fn record(
        &self,
        key: &ConversationKey,
        turn_seq: u64,
        comment: &str,
        at: Timestamp,
    ) -> Result<bool, AtriumError> {
        let inserted = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO feedback (project_id, client_id, turn_seq, comment, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    key.project_id.as_str(),
                    key.client_id.as_str(),
                    turn_seq as i64,
                    comment,
                    at.0
                ],
            )
            .map_err(|e| AtriumError::Storage(format!("Failed to save feedback: {}", e)))
        })?;
        debug!(
            project_id = %key.project_id,
            client_id = %key.client_id,
            turn_seq,
            inserted = inserted > 0,
            "Feedback recorded"
        );
        Ok(inserted > 0)
    }

    /// Most recent feedback of a project, newest first.
    pub fn for_project(
        &self,
        project_id: &ProjectId,
        limit: usize,
    ) -> Result<Vec<FeedbackEntry>, AtriumError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, project_id, client_id, turn_seq, comment, created_at
                     FROM feedback
                     WHERE project_id = ?1
                     ORDER BY created_at DESC, id DESC
                     LIMIT ?2",
                )
                .map_err(|e| AtriumError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map(rusqlite::params![project_id.as_str(), limit as i64], |row| {
                    let turn_seq: i64 = row.get(3)?;
                    Ok(FeedbackEntry {
                        id: row.get(0)?,
                        project_id: ProjectId(row.get(1)?),
                        client_id: ClientId(row.get(2)?),
                        turn_seq: turn_seq as u64,
                        comment: row.get(4)?,
                        created_at: Timestamp(row.get(5)?),
                    })
                })
                .map_err(|e| AtriumError::Storage(e.to_string()))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| AtriumError::Storage(e.to_string()))
        })
    }
}
