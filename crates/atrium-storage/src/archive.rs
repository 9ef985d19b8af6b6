//! Background compression of inactive conversations.
//!
//! Clients quiet for longer than `archive_after_hours` have their unarchived
//! messages folded (together with the previous summary) into a new
//! `zip_history`, and the rows are marked archived. The summary keeps the
//! model's context bounded for returning clients.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{FixedOffset, Offset, Utc};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use atrium_core::clock::Clock;
use atrium_core::config::DialogueConfig;
use atrium_core::error::AtriumError;
use atrium_core::types::{ConversationKey, DialogueRole, Timestamp};

use crate::dialogue::{DialogueEntry, DialogueRepository};

/// Produces the compressed summary of a conversation.
#[async_trait]
pub trait HistoryCompressor: Send + Sync {
    async fn compress(
        &self,
        key: &ConversationKey,
        previous: Option<&str>,
        transcript: &str,
    ) -> Result<String, AtriumError>;
}

/// Outcome of one archival pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveReport {
    pub clients_archived: usize,
    pub rows_archived: usize,
    pub errors: usize,
}

pub struct DialogueArchiver {
    repo: Arc<DialogueRepository>,
    compressor: Arc<dyn HistoryCompressor>,
    clock: Arc<dyn Clock>,
    config: DialogueConfig,
    utc_offset_minutes: i32,
    shutdown: Arc<Notify>,
}

impl DialogueArchiver {
    pub fn new(
        repo: Arc<DialogueRepository>,
        compressor: Arc<dyn HistoryCompressor>,
        clock: Arc<dyn Clock>,
        config: DialogueConfig,
        utc_offset_minutes: i32,
    ) -> Self {
        Self {
            repo,
            compressor,
            clock,
            config,
            utc_offset_minutes,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Archive every client inactive past the threshold.
    ///
    /// A failure for one client is counted and skipped; only a failure to
    /// list candidates fails the pass.
    pub async fn run_once(&self) -> Result<ArchiveReport, AtriumError> {
        let now = self.clock.now();
        let cutoff = Timestamp::from_datetime(
            now - chrono::Duration::hours(i64::from(self.config.archive_after_hours)),
        );
        let candidates = self.repo.inactive_clients(cutoff)?;
        let mut report = ArchiveReport::default();

        if candidates.is_empty() {
            debug!("No dialogues to archive");
            return Ok(report);
        }
        info!(clients = candidates.len(), "Archiving inactive dialogues");

        for key in candidates {
            match self.archive_client(&key).await {
                Ok(rows) => {
                    report.clients_archived += 1;
                    report.rows_archived += rows;
                }
                Err(e) => {
                    report.errors += 1;
                    warn!(
                        project_id = %key.project_id,
                        client_id = %key.client_id,
                        error = %e,
                        "Failed to archive dialogue"
                    );
                }
            }
        }

        info!(
            clients_archived = report.clients_archived,
            rows_archived = report.rows_archived,
            errors = report.errors,
            "Archival pass completed"
        );
        Ok(report)
    }

    async fn archive_client(&self, key: &ConversationKey) -> Result<usize, AtriumError> {
        let entries = self.repo.unarchived(key)?;
        let Some(last) = entries.last().map(|e| e.id) else {
            return Ok(0);
        };
        let previous = self.repo.zip_history(key)?;
        let transcript = render_transcript(&entries, self.utc_offset_minutes);
        let summary = self
            .compressor
            .compress(key, previous.as_deref(), &transcript)
            .await?;
        let rows = self.repo.archive(
            key,
            &summary,
            last,
            Timestamp::from_datetime(self.clock.now()),
        )?;
        debug!(
            project_id = %key.project_id,
            client_id = %key.client_id,
            rows,
            transcript_chars = transcript.len(),
            summary_chars = summary.len(),
            "Dialogue archived"
        );
        Ok(rows)
    }

    /// Run passes every `archive_interval_secs`, waiting
    /// `error_backoff_secs` after a failed pass. Returns on shutdown.
    pub async fn run(&self) {
        info!(
            interval_secs = self.config.archive_interval_secs,
            after_hours = self.config.archive_after_hours,
            "Dialogue archiver started"
        );
        loop {
            let delay = match self.run_once().await {
                Ok(_) => Duration::from_secs(self.config.archive_interval_secs),
                Err(e) => {
                    error!(error = %e, "Archival pass failed");
                    Duration::from_secs(self.config.error_backoff_secs)
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.notified() => {
                    info!("Dialogue archiver shutting down");
                    return;
                }
            }
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

/// Chronological "[dd.mm HH:MM] Role: message" lines.
pub fn render_transcript(entries: &[DialogueEntry], utc_offset_minutes: i32) -> String {
    let offset = FixedOffset::east_opt(utc_offset_minutes * 60)
        .unwrap_or_else(|| Utc.fix());
    entries
        .iter()
        .map(|e| {
            let at = e.timestamp.to_datetime().with_timezone(&offset);
            let role = match e.role {
                DialogueRole::Client => "Client",
                DialogueRole::Assistant => "Assistant",
            };
            format!("[{}] {}: {}", at.format("%d.%m %H:%M"), role, e.message)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use atrium_core::clock::ManualClock;
    use std::sync::Mutex;

    struct RecordingCompressor {
        calls: Mutex<Vec<(Option<String>, String)>>,
        fail_for: Option<String>,
    }

    impl RecordingCompressor {
        fn new(fail_for: Option<&str>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_for: fail_for.map(str::to_string),
            }
        }
    }

    #[async_trait]
    impl HistoryCompressor for RecordingCompressor {
        async fn compress(
            &self,
            key: &ConversationKey,
            previous: Option<&str>,
            transcript: &str,
        ) -> Result<String, AtriumError> {
            if self.fail_for.as_deref() == Some(key.client_id.as_str()) {
                return Err(AtriumError::Api("model unavailable".to_string()));
            }
            self.calls
                .lock()
                .unwrap()
                .push((previous.map(str::to_string), transcript.to_string()));
            Ok(format!("summary of {} lines", transcript.lines().count()))
        }
    }

    fn setup(
        fail_for: Option<&str>,
    ) -> (
        DialogueArchiver,
        Arc<DialogueRepository>,
        Arc<ManualClock>,
        Arc<RecordingCompressor>,
    ) {
        let repo = Arc::new(DialogueRepository::new(Arc::new(
            Database::in_memory().unwrap(),
        )));
        let clock = Arc::new(ManualClock::at_epoch());
        let compressor = Arc::new(RecordingCompressor::new(fail_for));
        let archiver = DialogueArchiver::new(
            Arc::clone(&repo),
            Arc::clone(&compressor) as Arc<dyn HistoryCompressor>,
            Arc::clone(&clock) as Arc<dyn Clock>,
            DialogueConfig::default(),
            0,
        );
        (archiver, repo, clock, compressor)
    }

    fn key(client: &str) -> ConversationKey {
        ConversationKey::new("salon", client)
    }

    #[tokio::test]
    async fn test_recent_clients_are_left_alone() {
        let (archiver, repo, clock, _) = setup(None);
        let now = Timestamp::from_datetime(clock.now());
        repo.append_turn(&key("c1"), &["hi".to_string()], "hello", now)
            .unwrap();
        clock.advance(chrono::Duration::hours(23));
        let report = archiver.run_once().await.unwrap();
        assert_eq!(report, ArchiveReport::default());
    }

    #[tokio::test]
    async fn test_inactive_client_is_compressed() {
        let (archiver, repo, clock, compressor) = setup(None);
        let now = Timestamp::from_datetime(clock.now());
        repo.append_turn(&key("c1"), &["hi".to_string()], "hello", now)
            .unwrap();
        clock.advance(chrono::Duration::hours(25));

        let report = archiver.run_once().await.unwrap();
        assert_eq!(report.clients_archived, 1);
        assert_eq!(report.rows_archived, 2);
        assert_eq!(
            repo.zip_history(&key("c1")).unwrap().as_deref(),
            Some("summary of 2 lines")
        );
        assert!(repo.get_recent_history(&key("c1"), 10).unwrap().is_empty());

        let calls = compressor.calls.lock().unwrap();
        assert_eq!(calls[0].0, None);
        assert!(calls[0].1.contains("Client: hi"));
        assert!(calls[0].1.contains("Assistant: hello"));
    }

    #[tokio::test]
    async fn test_second_pass_folds_previous_summary() {
        let (archiver, repo, clock, compressor) = setup(None);
        repo.append_turn(
            &key("c1"),
            &["first".to_string()],
            "reply",
            Timestamp::from_datetime(clock.now()),
        )
        .unwrap();
        clock.advance(chrono::Duration::hours(25));
        archiver.run_once().await.unwrap();

        repo.append_turn(
            &key("c1"),
            &["again".to_string()],
            "reply",
            Timestamp::from_datetime(clock.now()),
        )
        .unwrap();
        clock.advance(chrono::Duration::hours(25));
        archiver.run_once().await.unwrap();

        let calls = compressor.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].0.as_deref(), Some("summary of 2 lines"));
        assert!(calls[1].1.contains("again"));
        assert!(!calls[1].1.contains("first"));
    }

    #[tokio::test]
    async fn test_failure_for_one_client_does_not_stop_pass() {
        let (archiver, repo, clock, _) = setup(Some("broken"));
        let now = Timestamp::from_datetime(clock.now());
        repo.append_turn(&key("broken"), &["x".to_string()], "y", now)
            .unwrap();
        repo.append_turn(&key("fine"), &["x".to_string()], "y", now)
            .unwrap();
        clock.advance(chrono::Duration::hours(25));

        let report = archiver.run_once().await.unwrap();
        assert_eq!(report.clients_archived, 1);
        assert_eq!(report.errors, 1);
        assert_eq!(repo.unarchived(&key("broken")).unwrap().len(), 2);
        assert!(repo.unarchived(&key("fine")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_archiver_shutdown() {
        let (archiver, _, _, _) = setup(None);
        archiver.shutdown();
        tokio::time::timeout(Duration::from_secs(2), archiver.run())
            .await
            .expect("Archiver should shut down within timeout");
    }

    #[test]
    fn test_render_transcript_uses_local_offset() {
        let entries = vec![DialogueEntry {
            id: 1,
            project_id: "salon".into(),
            client_id: "c1".into(),
            role: DialogueRole::Client,
            message: "hi".to_string(),
            timestamp: Timestamp(0),
            archived: false,
        }];
        assert_eq!(render_transcript(&entries, 180), "[01.01 03:00] Client: hi");
    }
}
