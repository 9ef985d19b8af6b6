//! Consumes queue dispatches and runs each turn as its own task.
//!
//! Conversations run in parallel; the queue guarantees at most one turn per
//! conversation is dispatched at a time. Every attempt is bounded by the
//! processing timeout and always reported back to the queue, whose answer
//! (retry, fallback, next turn) is fed back into the dispatch channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use atrium_queue::{ConversationQueue, Dispatch, Turn, TurnOutcome};

use crate::error::AgentError;
use crate::processor::TurnProcessor;

pub struct TurnWorker {
    queue: Arc<ConversationQueue>,
    processor: Arc<TurnProcessor>,
    dispatch_tx: mpsc::Sender<Dispatch>,
    processing_timeout: Duration,
    shutdown: Arc<Notify>,
}

impl TurnWorker {
    /// `dispatch_tx` must feed the receiver later passed to [`run`](Self::run).
    pub fn new(
        queue: Arc<ConversationQueue>,
        processor: Arc<TurnProcessor>,
        dispatch_tx: mpsc::Sender<Dispatch>,
        processing_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            processor,
            dispatch_tx,
            processing_timeout,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Run until shutdown or until the dispatch channel closes, then wait
    /// for in-flight turns.
    pub async fn run(&self, mut rx: mpsc::Receiver<Dispatch>) {
        info!(
            timeout_secs = self.processing_timeout.as_secs(),
            "Turn worker started"
        );
        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(dispatch) => self.spawn(&mut tasks, dispatch),
                    None => {
                        info!("Dispatch channel closed, turn worker stopping");
                        break;
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Turn task panicked");
                    }
                }
                _ = self.shutdown.notified() => {
                    info!("Turn worker shutting down");
                    break;
                }
            }
        }

        // Follow-ups from draining tasks fail fast instead of filling the channel.
        drop(rx);
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Turn task panicked");
            }
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    fn spawn(&self, tasks: &mut JoinSet<()>, dispatch: Dispatch) {
        let queue = Arc::clone(&self.queue);
        let processor = Arc::clone(&self.processor);
        let tx = self.dispatch_tx.clone();
        let timeout = self.processing_timeout;

        tasks.spawn(async move {
            match dispatch {
                Dispatch::Turn(turn) => {
                    let outcome = attempt(&processor, &turn, timeout).await;
                    match queue.complete(turn.id, outcome) {
                        Ok(follow_ups) => {
                            for next in follow_ups {
                                if tx.send(next).await.is_err() {
                                    warn!(
                                        client_id = %turn.key.client_id,
                                        "Dispatch channel closed, follow-up dropped"
                                    );
                                    break;
                                }
                            }
                        }
                        // The queue already recycled this attempt as stalled.
                        Err(e) => warn!(
                            project_id = %turn.key.project_id,
                            client_id = %turn.key.client_id,
                            turn_id = %turn.id,
                            error = %e,
                            "Turn completion rejected"
                        ),
                    }
                }
                Dispatch::Fallback { turn, reason } => {
                    processor.deliver_fallback(&turn, &reason).await;
                }
            }
        });
    }
}

/// Process one attempt and turn the result into a queue outcome.
async fn attempt(processor: &TurnProcessor, turn: &Turn, timeout: Duration) -> TurnOutcome {
    let result = match tokio::time::timeout(timeout, processor.process(turn)).await {
        Ok(result) => result,
        Err(_) => Err(AgentError::ProcessingTimeout(timeout)),
    };
    match result {
        Ok(report) => {
            debug!(
                client_id = %turn.key.client_id,
                turn_seq = turn.seq,
                templated = report.templated,
                "Turn processed"
            );
            TurnOutcome::Success
        }
        Err(e) => {
            warn!(
                project_id = %turn.key.project_id,
                client_id = %turn.key.client_id,
                turn_seq = turn.seq,
                turn_id = %turn.id,
                attempt = turn.attempt,
                error = %e,
                "Turn attempt failed"
            );
            TurnOutcome::Failure(e.to_string())
        }
    }
}
