//! Background loop that turns queue deadlines into dispatched work.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info};

use crate::queue::ConversationQueue;
use crate::types::Dispatch;

/// Upper bound on one idle sleep.
const IDLE_TICK: Duration = Duration::from_secs(60);
/// Lower bound on one sleep so a deadline sitting exactly at `now` cannot spin.
const MIN_TICK: Duration = Duration::from_millis(5);

/// Flushes due conversations and recycles stalled turns, sending the
/// resulting `Dispatch` items to the worker.
pub struct QueueDriver {
    queue: Arc<ConversationQueue>,
    tx: mpsc::Sender<Dispatch>,
    shutdown: Arc<Notify>,
}

impl QueueDriver {
    pub fn new(queue: Arc<ConversationQueue>, tx: mpsc::Sender<Dispatch>) -> Self {
        Self {
            queue,
            tx,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Run until shutdown or until the dispatch channel closes.
    ///
    /// Sleeps until the earliest queue deadline; woken early by enqueue and
    /// by completions that produced work.
    pub async fn run(&self) {
        info!("Queue driver started");
        loop {
            match self.queue.poll_due() {
                Ok(dispatches) => {
                    for dispatch in dispatches {
                        if self.tx.send(dispatch).await.is_err() {
                            info!("Dispatch channel closed, queue driver stopping");
                            return;
                        }
                    }
                }
                Err(e) => error!(error = %e, "Queue poll failed"),
            }

            let delay = self.next_delay();
            debug!(delay_ms = delay.as_millis() as u64, "Queue driver sleeping");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.queue.wake().notified() => {}
                _ = self.shutdown.notified() => {
                    info!("Queue driver shutting down");
                    return;
                }
            }
        }
    }

    /// Signal the driver to shut down gracefully.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    fn next_delay(&self) -> Duration {
        match self.queue.next_deadline() {
            Some(deadline) => (deadline - self.queue.clock().now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .clamp(MIN_TICK, IDLE_TICK),
            None => IDLE_TICK,
        }
    }
}
