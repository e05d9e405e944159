//! Per-session outbound queue.
//!
//! Every session owns exactly one bounded outbox; a single writer task
//! drains it, so frames reach the peer in enqueue order.
//!
//! When the queue is full:
//! - a non-critical envelope evicts the oldest non-critical entry, or is
//!   itself dropped if every queued entry is critical;
//! - a critical envelope (trade command or trade outcome) evicts the oldest
//!   non-critical entry, otherwise waits a bounded time for room and then
//!   fails with [`OutboxError::Full`]. The caller closes the session.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;

use crate::domain::envelope::Envelope;
use crate::domain::session::CloseReason;

/// Outbox errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OutboxError {
    /// The session is closed.
    #[error("outbox closed")]
    Closed,

    /// No room for a critical envelope within the wait bound.
    #[error("outbox full")]
    Full,
}

/// What happened to a pushed envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Queued without loss.
    Queued,
    /// Queued after evicting an older non-critical envelope.
    EvictedOldest,
    /// Not queued; the queue held only critical envelopes.
    Dropped,
}

#[derive(Debug)]
struct State {
    queue: VecDeque<Envelope>,
    closed: Option<CloseReason>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    readable: Notify,
    writable: Notify,
    capacity: usize,
}

/// Sending side of a session's queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Outbox {
    shared: Arc<Shared>,
}

/// Receiving side, owned by the session's writer task.
#[derive(Debug)]
pub struct OutboxReceiver {
    shared: Arc<Shared>,
}

impl Outbox {
    /// Create a queue holding at most `capacity` envelopes.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, OutboxReceiver) {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: VecDeque::with_capacity(capacity.min(1024)),
                closed: None,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
            capacity: capacity.max(1),
        });
        (
            Self {
                shared: Arc::clone(&shared),
            },
            OutboxReceiver { shared },
        )
    }

    /// Push without waiting.
    ///
    /// Critical envelopes that find no evictable entry fail with
    /// [`OutboxError::Full`].
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Closed`] after [`Outbox::close`].
    pub fn push(&self, envelope: Envelope) -> Result<PushOutcome, OutboxError> {
        match self.try_push(envelope) {
            Ok(outcome) => Ok(outcome),
            Err((OutboxError::Full, envelope)) if !envelope.is_critical() => Ok(PushOutcome::Dropped),
            Err((err, _)) => Err(err),
        }
    }

    /// Push a critical envelope, waiting up to `wait` for room.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Full`] if no room appeared in time, or
    /// [`OutboxError::Closed`] if the session closed.
    pub async fn push_critical(&self, envelope: Envelope, wait: Duration) -> Result<PushOutcome, OutboxError> {
        let deadline = tokio::time::Instant::now() + wait;
        let mut pending = envelope;
        loop {
            let notified = self.shared.writable.notified();
            match self.try_push(pending) {
                Ok(outcome) => return Ok(outcome),
                Err((OutboxError::Full, back)) => pending = back,
                Err((err, _)) => return Err(err),
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(OutboxError::Full);
            }
        }
    }

    fn try_push(&self, envelope: Envelope) -> Result<PushOutcome, (OutboxError, Envelope)> {
        let mut state = self.shared.state.lock();
        if state.closed.is_some() {
            return Err((OutboxError::Closed, envelope));
        }

        let outcome = if state.queue.len() < self.shared.capacity {
            PushOutcome::Queued
        } else if let Some(at) = state.queue.iter().position(|e| !e.is_critical()) {
            state.queue.remove(at);
            PushOutcome::EvictedOldest
        } else {
            return Err((OutboxError::Full, envelope));
        };

        state.queue.push_back(envelope);
        drop(state);
        self.shared.readable.notify_one();
        Ok(outcome)
    }

    /// Close the queue. The writer stops and sends a close frame for
    /// `reason`; later pushes fail. Only the first reason is kept.
    pub fn close(&self, reason: CloseReason) {
        {
            let mut state = self.shared.state.lock();
            if state.closed.is_none() {
                state.closed = Some(reason);
            }
        }
        self.shared.readable.notify_one();
        self.shared.writable.notify_waiters();
    }

    /// Whether the queue is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed.is_some()
    }

    /// Queued envelopes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl OutboxReceiver {
    /// Wait for the next envelope. Returns `None` once the queue is closed.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            let notified = self.shared.readable.notified();
            if let Some(next) = self.pop()? {
                return Some(next);
            }
            notified.await;
        }
    }

    /// Take up to `max` envelopes without waiting.
    ///
    /// Used by polling sessions. Returns an empty batch when closed.
    pub fn drain(&mut self, max: usize) -> Vec<Envelope> {
        let mut state = self.shared.state.lock();
        if state.closed.is_some() {
            return Vec::new();
        }
        let take = max.min(state.queue.len());
        let batch: Vec<Envelope> = state.queue.drain(..take).collect();
        drop(state);
        if !batch.is_empty() {
            self.shared.writable.notify_waiters();
        }
        batch
    }

    /// Why the queue was closed.
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.state.lock().closed.clone()
    }

    /// `None` when closed, `Some(None)` when empty.
    fn pop(&self) -> Option<Option<Envelope>> {
        let mut state = self.shared.state.lock();
        if state.closed.is_some() {
            return None;
        }
        let next = state.queue.pop_front();
        drop(state);
        if next.is_some() {
            self.shared.writable.notify_waiters();
        }
        Some(next)
    }
}
