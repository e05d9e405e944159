//! Polling fallback.
//!
//! A polling session is an ordinary client session with
//! [`Capability::Polling`]: fan-out fills its outbox exactly like a
//! streaming client's, and each poll drains a batch instead of a writer task
//! pushing frames. Every poll refreshes liveness, so a caller that stops
//! polling is expired by the sweeper.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::application::services::{OutboxReceiver, SharedRegistry};
use crate::domain::envelope::Envelope;
use crate::domain::identity::UserId;
use crate::domain::session::{CloseReason, SessionHandle};

struct PollEntry {
    handle: SessionHandle,
    user_id: UserId,
    receiver: Arc<Mutex<OutboxReceiver>>,
}

/// Why a poll was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollError {
    /// No such poll session (never existed or already removed).
    #[error("poll session not found")]
    NotFound,

    /// The session belongs to another user.
    #[error("poll session belongs to another user")]
    NotOwner,

    /// The registry closed the session.
    #[error("poll session closed: {0}")]
    Closed(String),
}

/// Polling sessions keyed by an opaque id.
#[derive(Default)]
pub struct PollSessions {
    sessions: DashMap<String, PollEntry>,
}

impl std::fmt::Debug for PollSessions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollSessions")
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

impl PollSessions {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep a registered session's receiver and return its poll id.
    pub fn insert(&self, handle: SessionHandle, user_id: UserId, receiver: OutboxReceiver) -> String {
        let id = Uuid::new_v4().to_string();
        self.sessions.insert(
            id.clone(),
            PollEntry {
                handle,
                user_id,
                receiver: Arc::new(Mutex::new(receiver)),
            },
        );
        id
    }

    /// Drain up to `max` envelopes for `user`.
    ///
    /// # Errors
    ///
    /// Returns [`PollError`] when the id is unknown, owned by someone else,
    /// or the registry already closed the session (the entry is dropped).
    pub fn poll(
        &self,
        registry: &SharedRegistry,
        id: &str,
        user: &UserId,
        max: usize,
    ) -> Result<Vec<Envelope>, PollError> {
        let (handle, receiver) = {
            let entry = self.sessions.get(id).ok_or(PollError::NotFound)?;
            if &entry.user_id != user {
                return Err(PollError::NotOwner);
            }
            (entry.handle.clone(), Arc::clone(&entry.receiver))
        };

        let mut receiver = receiver.lock();
        if let Some(reason) = receiver.close_reason() {
            drop(receiver);
            self.sessions.remove(id);
            return Err(PollError::Closed(reason.as_str().to_string()));
        }
        if !registry.touch(&handle) {
            drop(receiver);
            self.sessions.remove(id);
            return Err(PollError::Closed(CloseReason::Expired.as_str().to_string()));
        }
        Ok(receiver.drain(max))
    }

    /// End a poll session.
    ///
    /// # Errors
    ///
    /// Returns [`PollError::NotFound`] or [`PollError::NotOwner`].
    pub fn remove(&self, registry: &SharedRegistry, id: &str, user: &UserId) -> Result<(), PollError> {
        let removed = self
            .sessions
            .remove_if(id, |_, entry| &entry.user_id == user);
        match removed {
            Some((_, entry)) => {
                registry.remove(&entry.handle, CloseReason::Normal);
                Ok(())
            }
            None if self.sessions.contains_key(id) => Err(PollError::NotOwner),
            None => Err(PollError::NotFound),
        }
    }

    /// Drop entries whose session the registry no longer knows.
    pub fn prune(&self, registry: &SharedRegistry) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, entry| registry.client_status(&entry.handle).is_some());
        before.saturating_sub(self.sessions.len())
    }

    /// Live poll sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no poll session is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::application::services::{ClientRegistration, SessionRegistry};
    use crate::domain::identity::AccountId;
    use crate::domain::session::Capability;

    fn register(registry: &SharedRegistry, polls: &PollSessions, user: &str) -> (String, SessionHandle) {
        let (handle, receiver) = registry
            .register_client(ClientRegistration {
                user_id: UserId::new(user),
                accounts: HashSet::from([AccountId::new("ACC-1")]),
                claimed_connections: Vec::new(),
                capability: Capability::Polling,
            })
            .unwrap();
        (polls.insert(handle.clone(), UserId::new(user), receiver), handle)
    }

    #[test]
    fn drains_queued_envelopes_in_batches() {
        let registry: SharedRegistry = Arc::new(SessionRegistry::new(16));
        let polls = PollSessions::new();
        let (id, handle) = register(&registry, &polls, "alice");

        let outbox = registry.outbox(&handle).unwrap();
        for _ in 0..3 {
            outbox.push(Envelope::ping()).unwrap();
        }

        let alice = UserId::new("alice");
        assert_eq!(polls.poll(&registry, &id, &alice, 2).unwrap().len(), 2);
        assert_eq!(polls.poll(&registry, &id, &alice, 2).unwrap().len(), 1);
        assert!(polls.poll(&registry, &id, &alice, 2).unwrap().is_empty());
    }

    #[test]
    fn refuses_other_users() {
        let registry: SharedRegistry = Arc::new(SessionRegistry::new(16));
        let polls = PollSessions::new();
        let (id, _) = register(&registry, &polls, "alice");

        let bob = UserId::new("bob");
        assert_eq!(polls.poll(&registry, &id, &bob, 10), Err(PollError::NotOwner));
        assert_eq!(polls.remove(&registry, &id, &bob), Err(PollError::NotOwner));
        assert_eq!(polls.poll(&registry, "missing", &bob, 10), Err(PollError::NotFound));
    }

    #[test]
    fn closed_sessions_are_dropped() {
        let registry: SharedRegistry = Arc::new(SessionRegistry::new(16));
        let polls = PollSessions::new();
        let (id, handle) = register(&registry, &polls, "alice");

        registry.remove(&handle, CloseReason::QueueFull);
        let alice = UserId::new("alice");
        assert_eq!(
            polls.poll(&registry, &id, &alice, 10),
            Err(PollError::Closed("queue_full".into()))
        );
        assert!(polls.is_empty());
    }

    #[test]
    fn delete_unregisters_session() {
        let registry: SharedRegistry = Arc::new(SessionRegistry::new(16));
        let polls = PollSessions::new();
        let (id, _) = register(&registry, &polls, "alice");

        polls.remove(&registry, &id, &UserId::new("alice")).unwrap();
        assert_eq!(registry.client_count(), 0);
        assert!(polls.is_empty());
    }

    #[test]
    fn prune_forgets_expired_sessions() {
        let registry: SharedRegistry = Arc::new(SessionRegistry::new(16));
        let polls = PollSessions::new();
        let (_, handle) = register(&registry, &polls, "alice");

        registry.remove(&handle, CloseReason::Expired);
        assert_eq!(polls.prune(&registry), 1);
    }
}
