//! Per-conversation buffering, flushing and retry.
//!
//! The queue itself is a synchronous state machine driven by the injected
//! clock: `enqueue` buffers, `poll_due` flushes conversations whose window
//! has closed and recycles stalled turns, `complete` resolves an attempt.
//! `QueueDriver` runs `poll_due` on a timer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use atrium_core::clock::Clock;
use atrium_core::config::QueueConfig;
use atrium_core::error::AtriumError;
use atrium_core::types::{ClientId, ConversationKey, ProjectId};

use crate::error::QueueError;
use crate::state_machine::validate_transition;
use crate::types::{
    ConversationSnapshot, ConversationState, Dispatch, EnqueueResult, Fragment, QueueStats, Turn,
    TurnId, TurnOutcome,
};

struct InFlight {
    turn: Turn,
    started_at: DateTime<Utc>,
}

struct Conversation {
    state: ConversationState,
    pending: Vec<Fragment>,
    in_flight: Option<InFlight>,
    next_seq: u64,
}

impl Conversation {
    fn new() -> Self {
        Self {
            state: ConversationState::Idle,
            pending: Vec::new(),
            in_flight: None,
            next_seq: 1,
        }
    }

    fn transition(&mut self, to: ConversationState) -> Result<(), QueueError> {
        validate_transition(self.state, to)?;
        self.state = to;
        Ok(())
    }

    /// When the collected buffer must be flushed.
    fn flush_deadline(&self, config: &QueueConfig) -> Option<DateTime<Utc>> {
        if self.state != ConversationState::Collecting {
            return None;
        }
        let first = self.pending.first()?.received_at;
        let last = self.pending.last()?.received_at;
        if self.pending.len() >= config.flood_fragment_threshold {
            return Some(last);
        }
        let debounced = last + Duration::milliseconds(config.debounce_ms as i64);
        let capped = first + Duration::milliseconds(config.max_wait_ms as i64);
        Some(debounced.min(capped))
    }

    fn timeout_deadline(&self, config: &QueueConfig) -> Option<DateTime<Utc>> {
        self.in_flight
            .as_ref()
            .map(|f| f.started_at + Duration::seconds(config.processing_timeout_secs as i64))
    }
}

/// Message buffer and turn scheduler for all conversations.
pub struct ConversationQueue {
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    conversations: Mutex<HashMap<ConversationKey, Arc<Mutex<Conversation>>>>,
    /// Conversations that are collecting or in flight. Only these have a
    /// deadline, so only these are scanned on a wake.
    active: Mutex<HashMap<ConversationKey, Arc<Mutex<Conversation>>>>,
    attempts: Mutex<HashMap<TurnId, ConversationKey>>,
    wake: Notify,
    closed: AtomicBool,
}

impl ConversationQueue {
    pub fn new(config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            conversations: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Buffer one fragment and push the conversation's flush deadline out.
    ///
    /// Never blocks on processing. Fails with `QueueFull` when the
    /// conversation already holds `max_queue_size` pending fragments.
    pub fn enqueue(
        &self,
        project_id: impl Into<ProjectId>,
        client_id: impl Into<ClientId>,
        fragment: impl Into<String>,
    ) -> Result<EnqueueResult, QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        let key = ConversationKey {
            project_id: project_id.into(),
            client_id: client_id.into(),
        };
        let conversation = self.conversation(&key)?;
        let mut conv = lock(&conversation)?;

        if conv.pending.len() >= self.config.max_queue_size {
            warn!(
                project_id = %key.project_id,
                client_id = %key.client_id,
                limit = self.config.max_queue_size,
                "Conversation queue full, rejecting fragment"
            );
            return Err(QueueError::QueueFull {
                key,
                limit: self.config.max_queue_size,
            });
        }

        conv.pending.push(Fragment {
            text: fragment.into(),
            received_at: self.clock.now(),
        });
        let pending = conv.pending.len();

        let result = match conv.state {
            ConversationState::Idle => {
                conv.transition(ConversationState::Collecting)?;
                EnqueueResult::Accepted { pending }
            }
            ConversationState::Collecting => EnqueueResult::Accepted { pending },
            ConversationState::InFlight => EnqueueResult::Held { pending },
        };
        self.track_activity(&key, &conversation, &conv)?;
        drop(conv);

        debug!(
            project_id = %key.project_id,
            client_id = %key.client_id,
            pending,
            "Fragment enqueued"
        );
        self.wake.notify_one();
        Ok(result)
    }

    /// Flush every conversation whose window has closed and recycle every
    /// in-flight turn that has exceeded the processing timeout.
    pub fn poll_due(&self) -> Result<Vec<Dispatch>, QueueError> {
        let now = self.clock.now();
        let mut dispatches = Vec::new();

        for (key, conversation) in self.active_conversations()? {
            let mut conv = lock(&conversation)?;

            if let Some(deadline) = conv.flush_deadline(&self.config) {
                if deadline <= now {
                    let turn = self.flush(&key, &mut conv, now)?;
                    dispatches.push(Dispatch::Turn(turn));
                    continue;
                }
            }

            let timed_out = conv
                .timeout_deadline(&self.config)
                .is_some_and(|deadline| deadline <= now);
            if timed_out {
                if let Some(stalled) = conv.in_flight.as_ref().map(|f| f.turn.id) {
                    self.forget_attempt(stalled)?;
                    warn!(
                        project_id = %key.project_id,
                        client_id = %key.client_id,
                        turn_id = %stalled,
                        timeout_secs = self.config.processing_timeout_secs,
                        "Turn exceeded processing timeout"
                    );
                    dispatches.extend(self.fail(&key, &mut conv, "processing timeout", now)?);
                    self.track_activity(&key, &conversation, &conv)?;
                }
            }
        }

        Ok(dispatches)
    }

    /// Resolve an in-flight attempt.
    ///
    /// Returns the follow-up work: a retry, a fallback for an exhausted turn,
    /// and/or the next turn if fragments arrived while this one was in flight.
    pub fn complete(
        &self,
        turn_id: TurnId,
        outcome: TurnOutcome,
    ) -> Result<Vec<Dispatch>, QueueError> {
        let key = {
            let mut attempts = self.attempts()?;
            attempts
                .remove(&turn_id)
                .ok_or(QueueError::UnknownTurn(turn_id))?
        };
        let conversation = self.conversation(&key)?;
        let mut conv = lock(&conversation)?;

        let current = conv.in_flight.as_ref().map(|f| f.turn.id);
        if current != Some(turn_id) {
            return Err(QueueError::UnknownTurn(turn_id));
        }

        let now = self.clock.now();
        let dispatches = match outcome {
            TurnOutcome::Success => {
                if let Some(done) = conv.in_flight.as_ref() {
                    debug!(
                        project_id = %key.project_id,
                        client_id = %key.client_id,
                        turn_seq = done.turn.seq,
                        turn_id = %turn_id,
                        "Turn completed"
                    );
                }
                self.resolve(&key, &mut conv, now)?
                    .into_iter()
                    .map(Dispatch::Turn)
                    .collect()
            }
            TurnOutcome::Failure(reason) => self.fail(&key, &mut conv, &reason, now)?,
        };
        self.track_activity(&key, &conversation, &conv)?;
        drop(conv);

        if !dispatches.is_empty() {
            self.wake.notify_one();
        }
        Ok(dispatches)
    }

    /// Earliest instant at which `poll_due` has work.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        let conversations = self.active_conversations().ok()?;
        conversations
            .iter()
            .filter_map(|(_, conversation)| {
                let conv = conversation.lock().ok()?;
                match conv.state {
                    ConversationState::Collecting => conv.flush_deadline(&self.config),
                    ConversationState::InFlight => conv.timeout_deadline(&self.config),
                    ConversationState::Idle => None,
                }
            })
            .min()
    }

    pub fn snapshot(&self, key: &ConversationKey) -> Option<ConversationSnapshot> {
        let conversation = self.conversations.lock().ok()?.get(key).cloned()?;
        let conv = conversation.lock().ok()?;
        Some(ConversationSnapshot {
            key: key.clone(),
            state: conv.state,
            pending: conv.pending.len(),
            next_seq: conv.next_seq,
            in_flight_attempt: conv.in_flight.as_ref().map(|f| f.turn.attempt),
        })
    }

    pub fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut stats = QueueStats::default();
        for (_, conversation) in self.all_conversations()? {
            let conv = lock(&conversation)?;
            stats.conversations += 1;
            stats.pending_fragments += conv.pending.len();
            match conv.state {
                ConversationState::Idle => stats.idle += 1,
                ConversationState::Collecting => stats.collecting += 1,
                ConversationState::InFlight => stats.in_flight += 1,
            }
        }
        Ok(stats)
    }

    /// Reject further input. Buffered fragments and in-flight turns are kept.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Signalled on every enqueue and on every completion that produced work.
    pub(crate) fn wake(&self) -> &Notify {
        &self.wake
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    fn flush(
        &self,
        key: &ConversationKey,
        conv: &mut Conversation,
        now: DateTime<Utc>,
    ) -> Result<Turn, QueueError> {
        conv.transition(ConversationState::InFlight)?;
        let turn = Turn {
            id: TurnId::new(),
            key: key.clone(),
            seq: conv.next_seq,
            fragments: std::mem::take(&mut conv.pending),
            attempt: 1,
            created_at: now,
        };
        conv.next_seq += 1;
        self.track(&turn)?;
        conv.in_flight = Some(InFlight {
            turn: turn.clone(),
            started_at: now,
        });

        info!(
            project_id = %key.project_id,
            client_id = %key.client_id,
            turn_seq = turn.seq,
            turn_id = %turn.id,
            fragments = turn.fragments.len(),
            "Turn flushed"
        );
        Ok(turn)
    }

    /// Close out the in-flight turn. Fragments that arrived meanwhile become
    /// the next turn immediately.
    fn resolve(
        &self,
        key: &ConversationKey,
        conv: &mut Conversation,
        now: DateTime<Utc>,
    ) -> Result<Option<Turn>, QueueError> {
        conv.in_flight = None;
        if conv.pending.is_empty() {
            conv.transition(ConversationState::Idle)?;
            return Ok(None);
        }
        conv.transition(ConversationState::Collecting)?;
        self.flush(key, conv, now).map(Some)
    }

    fn fail(
        &self,
        key: &ConversationKey,
        conv: &mut Conversation,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Dispatch>, QueueError> {
        let failed = match conv.in_flight.take() {
            Some(f) => f.turn,
            None => return Ok(Vec::new()),
        };

        if failed.attempt < self.config.retry_attempts {
            let retry = failed.retry(now);
            conv.transition(ConversationState::InFlight)?;
            self.track(&retry)?;
            conv.in_flight = Some(InFlight {
                turn: retry.clone(),
                started_at: now,
            });
            warn!(
                project_id = %key.project_id,
                client_id = %key.client_id,
                turn_seq = retry.seq,
                turn_id = %retry.id,
                attempt = retry.attempt,
                reason,
                "Turn failed, retrying"
            );
            return Ok(vec![Dispatch::Turn(retry)]);
        }

        error!(
            project_id = %key.project_id,
            client_id = %key.client_id,
            turn_seq = failed.seq,
            turn_id = %failed.id,
            attempts = failed.attempt,
            reason,
            "Turn retries exhausted, sending fallback reply"
        );
        let mut dispatches = vec![Dispatch::Fallback {
            turn: failed,
            reason: reason.to_string(),
        }];
        if let Some(next) = self.resolve(key, conv, now)? {
            dispatches.push(Dispatch::Turn(next));
        }
        Ok(dispatches)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn conversation(&self, key: &ConversationKey) -> Result<Arc<Mutex<Conversation>>, QueueError> {
        let mut conversations = self.conversations.lock().map_err(|e| {
            QueueError::Storage(AtriumError::Storage(format!("Lock poisoned: {}", e)))
        })?;
        Ok(Arc::clone(
            conversations
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(Conversation::new()))),
        ))
    }

    fn all_conversations(
        &self,
    ) -> Result<Vec<(ConversationKey, Arc<Mutex<Conversation>>)>, QueueError> {
        let conversations = self.conversations.lock().map_err(|e| {
            QueueError::Storage(AtriumError::Storage(format!("Lock poisoned: {}", e)))
        })?;
        Ok(conversations
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect())
    }

    fn active_conversations(
        &self,
    ) -> Result<Vec<(ConversationKey, Arc<Mutex<Conversation>>)>, QueueError> {
        let active = self.active.lock().map_err(|e| {
            QueueError::Storage(AtriumError::Storage(format!("Lock poisoned: {}", e)))
        })?;
        Ok(active
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect())
    }

    /// Keep the active index in step with the conversation's state. Must be
    /// called with the conversation lock held.
    fn track_activity(
        &self,
        key: &ConversationKey,
        conversation: &Arc<Mutex<Conversation>>,
        conv: &Conversation,
    ) -> Result<(), QueueError> {
        let mut active = self.active.lock().map_err(|e| {
            QueueError::Storage(AtriumError::Storage(format!("Lock poisoned: {}", e)))
        })?;
        if conv.state == ConversationState::Idle {
            active.remove(key);
        } else if !active.contains_key(key) {
            active.insert(key.clone(), Arc::clone(conversation));
        }
        Ok(())
    }

    fn attempts(&self) -> Result<MutexGuard<'_, HashMap<TurnId, ConversationKey>>, QueueError> {
        self.attempts.lock().map_err(|e| {
            QueueError::Storage(AtriumError::Storage(format!("Lock poisoned: {}", e)))
        })
    }

    fn track(&self, turn: &Turn) -> Result<(), QueueError> {
        self.attempts()?.insert(turn.id, turn.key.clone());
        Ok(())
    }

    fn forget_attempt(&self, id: TurnId) -> Result<(), QueueError> {
        self.attempts()?.remove(&id);
        Ok(())
    }
}

fn lock(conversation: &Mutex<Conversation>) -> Result<MutexGuard<'_, Conversation>, QueueError> {
    conversation
        .lock()
        .map_err(|e| QueueError::Storage(AtriumError::Storage(format!("Lock poisoned: {}", e))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use atrium_core::clock::ManualClock;

    fn make_queue(config: QueueConfig) -> (ConversationQueue, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_epoch());
        let queue = ConversationQueue::new(config, Arc::clone(&clock) as Arc<dyn Clock>);
        (queue, clock)
    }

    fn turns(dispatches: &[Dispatch]) -> Vec<&Turn> {
        dispatches
            .iter()
            .filter_map(|d| match d {
                Dispatch::Turn(t) => Some(t),
                Dispatch::Fallback { .. } => None,
            })
            .collect()
    }

    fn key() -> ConversationKey {
        ConversationKey::new("salon", "c1")
    }

    // =====================================================================
    // Coalescing
    // =====================================================================

    #[test]
    fn test_burst_within_window_is_one_turn() {
        let (queue, clock) = make_queue(QueueConfig::default());
        for i in 0..10 {
            queue.enqueue("salon", "c1", format!("part {}", i)).unwrap();
            clock.advance_ms(200);
        }
        // 2s of fragments, then just under the 3s quiet period.
        clock.advance_ms(2_700);
        assert!(queue.poll_due().unwrap().is_empty());

        clock.advance_ms(200);
        let due = queue.poll_due().unwrap();
        assert_eq!(due.len(), 1);
        let turn = due[0].turn();
        assert_eq!(turn.fragments.len(), 10);
        let texts: Vec<&str> = turn.fragments.iter().map(|f| f.text.as_str()).collect();
        let expected: Vec<String> = (0..10).map(|i| format!("part {}", i)).collect();
        assert_eq!(texts, expected.iter().map(|s| s.as_str()).collect::<Vec<_>>());
        assert_eq!(turn.seq, 1);
        assert_eq!(turn.attempt, 1);

        // Nothing further until the turn resolves.
        clock.advance_ms(5_000);
        assert!(queue.poll_due().unwrap().is_empty());
    }

    #[test]
    fn test_max_wait_caps_debounce_resets() {
        let config = QueueConfig {
            debounce_ms: 3_000,
            max_wait_ms: 5_000,
            ..QueueConfig::default()
        };
        let (queue, clock) = make_queue(config);
        queue.enqueue("salon", "c1", "a").unwrap();
        for _ in 0..4 {
            clock.advance_ms(1_000);
            queue.enqueue("salon", "c1", "more").unwrap();
        }
        // 4s elapsed, last fragment just now: debounce alone would wait to 7s.
        assert!(queue.poll_due().unwrap().is_empty());
        clock.advance_ms(1_000);
        let due = queue.poll_due().unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].turn().fragments.len(), 5);
    }

    #[test]
    fn test_fragment_threshold_forces_flush() {
        let config = QueueConfig {
            flood_fragment_threshold: 3,
            ..QueueConfig::default()
        };
        let (queue, clock) = make_queue(config);
        for _ in 0..2 {
            queue.enqueue("salon", "c1", "x").unwrap();
            clock.advance_ms(10);
        }
        assert!(queue.poll_due().unwrap().is_empty());

        // The third fragment reaches the cap: due now, not after the debounce.
        queue.enqueue("salon", "c1", "x").unwrap();
        assert_eq!(queue.next_deadline(), Some(clock.now()));
        let due = queue.poll_due().unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].turn().fragments.len(), 3);

        // A fourth fragment is held for the next turn.
        queue.enqueue("salon", "c1", "x").unwrap();
        let next = queue
            .complete(due[0].turn().id, TurnOutcome::Success)
            .unwrap();
        assert_eq!(next[0].turn().fragments.len(), 1);
    }

    #[test]
    fn test_conversations_are_independent() {
        let (queue, clock) = make_queue(QueueConfig::default());
        queue.enqueue("salon", "c1", "hi").unwrap();
        clock.advance_ms(2_000);
        queue.enqueue("salon", "c2", "hello").unwrap();
        clock.advance_ms(1_000);

        let due = queue.poll_due().unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].turn().key, key());

        clock.advance_ms(2_000);
        let due = queue.poll_due().unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].turn().key, ConversationKey::new("salon", "c2"));
    }

    // =====================================================================
    // Ordering
    // =====================================================================

    #[test]
    fn test_fragments_during_flight_become_next_turn() {
        let (queue, clock) = make_queue(QueueConfig::default());
        queue.enqueue("salon", "c1", "first").unwrap();
        clock.advance_ms(3_000);
        let first = queue.poll_due().unwrap().remove(0);

        let held = queue.enqueue("salon", "c1", "second").unwrap();
        assert_eq!(held, EnqueueResult::Held { pending: 1 });
        clock.advance_ms(10_000);
        // In flight: no second turn yet even though the window elapsed.
        assert!(turns(&queue.poll_due().unwrap()).is_empty());

        let next = queue
            .complete(first.turn().id, TurnOutcome::Success)
            .unwrap();
        assert_eq!(next.len(), 1);
        let second = next[0].turn();
        assert_eq!(second.seq, 2);
        assert_eq!(second.text(), "second");
        assert_eq!(
            queue.snapshot(&key()).unwrap().state,
            ConversationState::InFlight
        );
    }

    #[test]
    fn test_success_returns_to_idle() {
        let (queue, clock) = make_queue(QueueConfig::default());
        queue.enqueue("salon", "c1", "hi").unwrap();
        clock.advance_ms(3_000);
        let turn = queue.poll_due().unwrap().remove(0);
        assert!(queue
            .complete(turn.turn().id, TurnOutcome::Success)
            .unwrap()
            .is_empty());
        let snap = queue.snapshot(&key()).unwrap();
        assert_eq!(snap.state, ConversationState::Idle);
        assert_eq!(snap.next_seq, 2);
    }

    #[test]
    fn test_sequence_is_gapless_across_retries() {
        let (queue, clock) = make_queue(QueueConfig::default());
        let mut seqs = Vec::new();
        for round in 0..3 {
            queue.enqueue("salon", "c1", format!("msg {}", round)).unwrap();
            clock.advance_ms(3_000);
            let mut current = queue.poll_due().unwrap().remove(0);
            seqs.push(current.turn().seq);
            if round == 1 {
                current = queue
                    .complete(current.turn().id, TurnOutcome::Failure("boom".into()))
                    .unwrap()
                    .remove(0);
                seqs.push(current.turn().seq);
            }
            queue
                .complete(current.turn().id, TurnOutcome::Success)
                .unwrap();
        }
        assert_eq!(seqs, vec![1, 2, 2, 3]);
    }

    // =====================================================================
    // Retry and fallback
    // =====================================================================

    #[test]
    fn test_retry_then_fallback_returns_to_idle() {
        let (queue, clock) = make_queue(QueueConfig::default());
        queue.enqueue("salon", "c1", "book me").unwrap();
        clock.advance_ms(3_000);
        let mut dispatch = queue.poll_due().unwrap().remove(0);

        for attempt in 1..=2 {
            assert_eq!(dispatch.turn().attempt, attempt);
            let out = queue
                .complete(dispatch.turn().id, TurnOutcome::Failure("ai unavailable".into()))
                .unwrap();
            assert_eq!(out.len(), 1);
            dispatch = out.into_iter().next().unwrap();
            assert!(matches!(dispatch, Dispatch::Turn(_)));
            assert_eq!(dispatch.turn().text(), "book me");
        }

        let out = queue
            .complete(dispatch.turn().id, TurnOutcome::Failure("ai unavailable".into()))
            .unwrap();
        assert_eq!(out.len(), 1);
        match &out[0] {
            Dispatch::Fallback { turn, reason } => {
                assert_eq!(turn.attempt, 3);
                assert_eq!(reason, "ai unavailable");
            }
            other => panic!("expected fallback, got {:?}", other),
        }
        assert_eq!(
            queue.snapshot(&key()).unwrap().state,
            ConversationState::Idle
        );

        // Accepts new input immediately.
        let result = queue.enqueue("salon", "c1", "hello again").unwrap();
        assert_eq!(result, EnqueueResult::Accepted { pending: 1 });
    }

    #[test]
    fn test_fallback_flushes_held_fragments() {
        let config = QueueConfig {
            retry_attempts: 1,
            ..QueueConfig::default()
        };
        let (queue, clock) = make_queue(config);
        queue.enqueue("salon", "c1", "one").unwrap();
        clock.advance_ms(3_000);
        let turn = queue.poll_due().unwrap().remove(0);
        queue.enqueue("salon", "c1", "two").unwrap();

        let out = queue
            .complete(turn.turn().id, TurnOutcome::Failure("x".into()))
            .unwrap();
        assert_eq!(out.len(), 2);
        assert!(matches!(out[0], Dispatch::Fallback { .. }));
        assert_eq!(out[1].turn().text(), "two");
        assert_eq!(out[1].turn().seq, 2);
    }

    #[test]
    fn test_stale_attempt_completion_is_rejected() {
        let (queue, clock) = make_queue(QueueConfig::default());
        queue.enqueue("salon", "c1", "hi").unwrap();
        clock.advance_ms(3_000);
        let first = queue.poll_due().unwrap().remove(0);
        let retry = queue
            .complete(first.turn().id, TurnOutcome::Failure("x".into()))
            .unwrap()
            .remove(0);

        let err = queue
            .complete(first.turn().id, TurnOutcome::Success)
            .unwrap_err();
        assert!(matches!(err, QueueError::UnknownTurn(_)));
        assert!(queue
            .complete(retry.turn().id, TurnOutcome::Success)
            .is_ok());
    }

    // =====================================================================
    // Timeout
    // =====================================================================

    #[test]
    fn test_processing_timeout_recycles_turn() {
        let (queue, clock) = make_queue(QueueConfig::default());
        queue.enqueue("salon", "c1", "hi").unwrap();
        clock.advance_ms(3_000);
        let stuck = queue.poll_due().unwrap().remove(0);

        clock.advance_ms(29_000);
        assert!(queue.poll_due().unwrap().is_empty());
        clock.advance_ms(1_000);
        let recycled = queue.poll_due().unwrap();
        assert_eq!(recycled.len(), 1);
        assert_eq!(recycled[0].turn().attempt, 2);
        assert_eq!(recycled[0].turn().seq, stuck.turn().seq);

        // The crashed attempt reporting late is ignored.
        assert!(queue
            .complete(stuck.turn().id, TurnOutcome::Success)
            .is_err());
    }

    #[test]
    fn test_next_deadline_tracks_window_and_timeout() {
        let (queue, clock) = make_queue(QueueConfig::default());
        assert!(queue.next_deadline().is_none());
        let start = clock.now();
        queue.enqueue("salon", "c1", "hi").unwrap();
        assert_eq!(
            queue.next_deadline(),
            Some(start + Duration::milliseconds(3_000))
        );
        clock.advance_ms(3_000);
        queue.poll_due().unwrap();
        assert_eq!(
            queue.next_deadline(),
            Some(start + Duration::milliseconds(3_000) + Duration::seconds(30))
        );
    }

    // =====================================================================
    // Capacity
    // =====================================================================

    #[test]
    fn test_queue_full_rejects_without_dropping() {
        let config = QueueConfig {
            max_queue_size: 3,
            flood_fragment_threshold: 100,
            ..QueueConfig::default()
        };
        let (queue, clock) = make_queue(config);
        for i in 0..3 {
            queue.enqueue("salon", "c1", format!("m{}", i)).unwrap();
        }
        let err = queue.enqueue("salon", "c1", "m3").unwrap_err();
        assert!(matches!(err, QueueError::QueueFull { limit: 3, .. }));

        // Other conversations are unaffected.
        assert!(queue.enqueue("salon", "c2", "ok").is_ok());

        clock.advance_ms(3_000);
        let due = queue.poll_due().unwrap();
        let mine = due.iter().find(|d| d.turn().key == key()).unwrap();
        assert_eq!(mine.turn().fragments.len(), 3);
    }

    #[test]
    fn test_idle_conversations_leave_active_index() {
        let (queue, clock) = make_queue(QueueConfig::default());
        for i in 0..500 {
            queue.enqueue("salon", format!("c{}", i), "hi").unwrap();
        }
        assert_eq!(queue.active.lock().unwrap().len(), 500);

        clock.advance_ms(3_000);
        let due = queue.poll_due().unwrap();
        assert_eq!(due.len(), 500);
        for d in &due {
            assert!(queue
                .complete(d.turn().id, TurnOutcome::Success)
                .unwrap()
                .is_empty());
        }
        assert!(queue.active.lock().unwrap().is_empty());
        assert_eq!(queue.stats().unwrap().idle, 500);
        assert!(queue.next_deadline().is_none());

        // One idle conversation wakes up; only it is due.
        queue.enqueue("salon", "c7", "again").unwrap();
        assert_eq!(queue.active.lock().unwrap().len(), 1);
        clock.advance_ms(3_000);
        let due = queue.poll_due().unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].turn().key, ConversationKey::new("salon", "c7"));
        assert_eq!(due[0].turn().seq, 2);
    }

    #[test]
    fn test_exhausted_turn_leaves_active_index() {
        let config = QueueConfig {
            retry_attempts: 1,
            ..QueueConfig::default()
        };
        let (queue, clock) = make_queue(config);
        queue.enqueue("salon", "c1", "hi").unwrap();
        clock.advance_ms(3_000);
        queue.poll_due().unwrap();

        // Timeout with no retries left: fallback, then idle.
        clock.advance_ms(30_000);
        let due = queue.poll_due().unwrap();
        assert!(matches!(due[0], Dispatch::Fallback { .. }));
        assert!(queue.active.lock().unwrap().is_empty());
        assert!(queue.next_deadline().is_none());
    }

    #[test]
    fn test_closed_queue_rejects_enqueue() {
        let (queue, _) = make_queue(QueueConfig::default());
        queue.close();
        assert!(matches!(
            queue.enqueue("salon", "c1", "hi"),
            Err(QueueError::Closed)
        ));
    }

    #[test]
    fn test_stats() {
        let (queue, clock) = make_queue(QueueConfig::default());
        queue.enqueue("salon", "c1", "a").unwrap();
        clock.advance_ms(3_000);
        queue.poll_due().unwrap();
        queue.enqueue("salon", "c1", "b").unwrap();
        queue.enqueue("salon", "c2", "c").unwrap();
        queue.enqueue("salon", "c2", "d").unwrap();

        let stats = queue.stats().unwrap();
        assert_eq!(
            stats,
            QueueStats {
                conversations: 2,
                idle: 0,
                collecting: 1,
                in_flight: 1,
                pending_fragments: 3,
            }
        );
    }

    #[test]
    fn test_concurrent_enqueue_loses_nothing() {
        let config = QueueConfig {
            flood_fragment_threshold: 10_000,
            max_queue_size: 10_000,
            ..QueueConfig::default()
        };
        let (queue, clock) = make_queue(config);
        let queue = Arc::new(queue);
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        queue
                            .enqueue("salon", "c1", format!("{}-{}", t, i))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        clock.advance_ms(3_000);
        let due = queue.poll_due().unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].turn().fragments.len(), 800);
    }
}
