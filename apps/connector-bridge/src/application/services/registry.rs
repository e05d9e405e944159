//! Session Registry
//!
//! Authoritative table of live sessions:
//! - connectors keyed by connection id, each bound to exactly one account;
//! - an account index pointing at the connector serving each account;
//! - clients keyed by registration generation.
//!
//! Every operation is safe to call concurrently. Registration of a key
//! replaces the previous session for that key (its outbox is closed with
//! [`CloseReason::Replaced`]); removal through a stale handle is a no-op.
//!
//! Lock order is accounts -> connectors. No operation holds a map guard
//! across an `.await`.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::outbox::{Outbox, OutboxReceiver};
use crate::domain::identity::{AccountId, ConnectionId, UserId};
use crate::domain::session::{
    Capability, ClientStatus, CloseReason, ConnectionStatus, SessionHandle, SessionKind,
    TerminalStatus,
};
use crate::domain::trade::AccountSnapshot;
use crate::infrastructure::metrics;

const EVENT_CAPACITY: usize = 1024;

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The key is bound to a different account.
    #[error("connection {connection_id} is bound to account {bound}")]
    OwnershipConflict {
        /// Contested connection.
        connection_id: ConnectionId,
        /// Account it is bound to.
        bound: AccountId,
    },

    /// A client claimed a connection outside its authorized accounts.
    #[error("connection {0} belongs to an account outside the authorized set")]
    UnauthorizedClaim(ConnectionId),

    /// Registration input is invalid.
    #[error("invalid registration: {0}")]
    Invalid(String),
}

/// Lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A connector registered (fresh or replacing).
    ConnectorRegistered {
        /// Connection id.
        connection_id: ConnectionId,
        /// Bound account.
        account_id: AccountId,
    },
    /// A connector left the registry for any reason other than expiry.
    ConnectorRemoved {
        /// Connection id.
        connection_id: ConnectionId,
        /// Bound account.
        account_id: AccountId,
        /// Why it left.
        reason: CloseReason,
    },
    /// A session missed the liveness threshold and was removed.
    SessionExpired {
        /// Expired handle.
        handle: SessionHandle,
        /// Bound account (connectors only).
        account_id: Option<AccountId>,
    },
}

/// Connector registration request.
#[derive(Debug, Clone)]
pub struct ConnectorRegistration {
    /// Connection id presented by the connector.
    pub connection_id: ConnectionId,
    /// Account resolved from its credentials.
    pub account_id: AccountId,
    /// Broker label.
    pub broker: Option<String>,
    /// Delivery capability.
    pub capability: Capability,
}

/// Client registration request.
#[derive(Debug, Clone)]
pub struct ClientRegistration {
    /// Authenticated user.
    pub user_id: UserId,
    /// Accounts the user may observe.
    pub accounts: HashSet<AccountId>,
    /// Connection ids the client asked to follow.
    pub claimed_connections: Vec<ConnectionId>,
    /// Delivery capability.
    pub capability: Capability,
}

/// A live connector as seen by the router.
#[derive(Debug, Clone)]
pub struct ConnectorRoute {
    /// Session handle.
    pub handle: SessionHandle,
    /// Connection id.
    pub connection_id: ConnectionId,
    /// Bound account.
    pub account_id: AccountId,
    /// Outbound queue.
    pub outbox: Outbox,
}

/// A live client as seen by the router.
#[derive(Debug, Clone)]
pub struct ClientRoute {
    /// Session handle.
    pub handle: SessionHandle,
    /// Outbound queue.
    pub outbox: Outbox,
}

#[derive(Debug)]
struct ConnectorEntry {
    generation: u64,
    account_id: AccountId,
    broker: Option<String>,
    capability: Capability,
    terminal_status: TerminalStatus,
    last_seen: Instant,
    last_seen_at: DateTime<Utc>,
    connected_at: DateTime<Utc>,
    account: Option<AccountSnapshot>,
    outbox: Outbox,
}

#[derive(Debug)]
struct ClientEntry {
    user_id: UserId,
    accounts: HashSet<AccountId>,
    capability: Capability,
    last_seen: Instant,
    outbox: Outbox,
}

// =============================================================================
// Registry
// =============================================================================

/// Table of live sessions.
#[derive(Debug)]
pub struct SessionRegistry {
    connectors: DashMap<ConnectionId, ConnectorEntry>,
    accounts: DashMap<AccountId, (ConnectionId, u64)>,
    clients: DashMap<u64, ClientEntry>,
    next_generation: AtomicU64,
    outbox_capacity: usize,
    events: broadcast::Sender<RegistryEvent>,
}

/// Thread-safe shared registry.
pub type SharedRegistry = Arc<SessionRegistry>;

impl SessionRegistry {
    /// Create a registry whose sessions get outboxes of `outbox_capacity`.
    #[must_use]
    pub fn new(outbox_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            connectors: DashMap::new(),
            accounts: DashMap::new(),
            clients: DashMap::new(),
            next_generation: AtomicU64::new(1),
            outbox_capacity,
            events,
        }
    }

    /// Subscribe to lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: RegistryEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    // -------------------------------------------------------------------------
    // Connectors
    // -------------------------------------------------------------------------

    /// Register a connector.
    ///
    /// A live session with the same connection id and account is replaced.
    /// A live session for the same account under another connection id is
    /// replaced as well, so each account has at most one connector.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::OwnershipConflict`] if the connection id is
    /// bound to a different account.
    pub fn register_connector(
        &self,
        registration: ConnectorRegistration,
    ) -> Result<(SessionHandle, OutboxReceiver), RegistryError> {
        if registration.connection_id.is_blank() {
            return Err(RegistryError::Invalid("connection id is empty".into()));
        }

        let generation = self.next_generation();
        let connection_id = registration.connection_id.clone();
        let account_id = registration.account_id.clone();
        let (outbox, receiver) = Outbox::channel(self.outbox_capacity);
        let now = Utc::now();
        let entry = ConnectorEntry {
            generation,
            account_id: account_id.clone(),
            broker: registration.broker,
            capability: registration.capability,
            terminal_status: TerminalStatus::Unknown,
            last_seen: Instant::now(),
            last_seen_at: now,
            connected_at: now,
            account: None,
            outbox,
        };

        let mut slot = self.accounts.entry(account_id.clone()).or_insert_with(|| (connection_id.clone(), 0));

        let replaced = match self.connectors.entry(connection_id.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().account_id != account_id {
                    let bound = occupied.get().account_id.clone();
                    drop(occupied);
                    // Undo the placeholder if this call created it.
                    let placeholder = slot.1 == 0;
                    drop(slot);
                    if placeholder {
                        self.accounts.remove_if(&account_id, |_, (_, g)| *g == 0);
                    }
                    return Err(RegistryError::OwnershipConflict {
                        connection_id,
                        bound,
                    });
                }
                let old = occupied.insert(entry);
                old.outbox.close(CloseReason::Replaced);
                true
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                false
            }
        };

        let previous = (slot.0 != connection_id && slot.1 != 0).then(|| slot.clone());
        *slot = (connection_id.clone(), generation);
        drop(slot);

        let evicted = previous.and_then(|(prev_conn, prev_generation)| {
            self.connectors
                .remove_if(&prev_conn, |_, e| e.generation == prev_generation)
        });
        if let Some((prev_conn, old)) = evicted {
            old.outbox.close(CloseReason::Replaced);
            metrics::record_session_closed(SessionKind::Connector, &CloseReason::Replaced);
            self.emit(RegistryEvent::ConnectorRemoved {
                connection_id: prev_conn,
                account_id: old.account_id,
                reason: CloseReason::Replaced,
            });
        }

        if replaced {
            metrics::record_session_closed(SessionKind::Connector, &CloseReason::Replaced);
        }
        metrics::record_session_registered(SessionKind::Connector);
        metrics::set_active_sessions(SessionKind::Connector, self.connectors.len());

        tracing::info!(
            connection_id = %connection_id,
            account_id = %account_id,
            generation,
            replaced,
            "Connector registered"
        );
        self.emit(RegistryEvent::ConnectorRegistered {
            connection_id: connection_id.clone(),
            account_id,
        });

        Ok((
            SessionHandle::Connector {
                generation,
                connection_id,
            },
            receiver,
        ))
    }

    /// Live connector serving `account`.
    #[must_use]
    pub fn connector_for_account(&self, account: &AccountId) -> Option<ConnectorRoute> {
        let (connection_id, generation) = self.accounts.get(account).map(|e| e.value().clone())?;
        let entry = self.connectors.get(&connection_id)?;
        (entry.generation == generation && !entry.outbox.is_closed()).then(|| ConnectorRoute {
            handle: SessionHandle::Connector {
                generation,
                connection_id: connection_id.clone(),
            },
            connection_id: connection_id.clone(),
            account_id: entry.account_id.clone(),
            outbox: entry.outbox.clone(),
        })
    }

    /// Resolve a connector handle to its route, if still live.
    #[must_use]
    pub fn connector(&self, handle: &SessionHandle) -> Option<ConnectorRoute> {
        let SessionHandle::Connector {
            generation,
            connection_id,
        } = handle
        else {
            return None;
        };
        let entry = self.connectors.get(connection_id)?;
        (entry.generation == *generation).then(|| ConnectorRoute {
            handle: handle.clone(),
            connection_id: connection_id.clone(),
            account_id: entry.account_id.clone(),
            outbox: entry.outbox.clone(),
        })
    }

    /// Record terminal status reported by a connector.
    pub fn update_terminal(&self, handle: &SessionHandle, status: TerminalStatus, broker: Option<String>) {
        let SessionHandle::Connector {
            generation,
            connection_id,
        } = handle
        else {
            return;
        };
        if let Some(mut entry) = self.connectors.get_mut(connection_id) {
            if entry.generation != *generation {
                return;
            }
            entry.terminal_status = status;
            if broker.is_some() {
                entry.broker = broker;
            }
        }
    }

    /// Cache the latest balances reported by a connector.
    pub fn update_account(&self, handle: &SessionHandle, account: AccountSnapshot) {
        let SessionHandle::Connector {
            generation,
            connection_id,
        } = handle
        else {
            return;
        };
        if let Some(mut entry) = self.connectors.get_mut(connection_id) {
            if entry.generation == *generation {
                entry.account = Some(account);
            }
        }
    }

    /// Latest balances for an account, if its connector reported any.
    #[must_use]
    pub fn account_snapshot(&self, account: &AccountId) -> Option<AccountSnapshot> {
        let (connection_id, _) = self.accounts.get(account).map(|e| e.value().clone())?;
        self.connectors.get(&connection_id).and_then(|e| e.account.clone())
    }

    /// Status of connectors for the given accounts (all when `None`).
    #[must_use]
    pub fn connection_statuses(&self, accounts: Option<&HashSet<AccountId>>) -> Vec<ConnectionStatus> {
        let mut statuses: Vec<ConnectionStatus> = self
            .connectors
            .iter()
            .filter(|e| accounts.is_none_or(|set| set.contains(&e.account_id)))
            .map(|e| ConnectionStatus {
                connection_id: e.key().clone(),
                account_id: e.account_id.clone(),
                broker: e.broker.clone(),
                terminal_status: e.terminal_status,
                last_seen: e.last_seen_at,
                connected_at: e.connected_at,
            })
            .collect();
        statuses.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));
        statuses
    }

    /// Number of live connectors.
    #[must_use]
    pub fn connector_count(&self) -> usize {
        self.connectors.len()
    }

    /// Delivery capability of a connector.
    #[must_use]
    pub fn connector_capability(&self, handle: &SessionHandle) -> Option<Capability> {
        let SessionHandle::Connector {
            generation,
            connection_id,
        } = handle
        else {
            return None;
        };
        self.connectors
            .get(connection_id)
            .filter(|e| e.generation == *generation)
            .map(|e| e.capability)
    }

    // -------------------------------------------------------------------------
    // Clients
    // -------------------------------------------------------------------------

    /// Register a client.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnauthorizedClaim`] if a claimed connection
    /// is live and bound to an account outside `accounts`.
    pub fn register_client(
        &self,
        registration: ClientRegistration,
    ) -> Result<(SessionHandle, OutboxReceiver), RegistryError> {
        for claimed in &registration.claimed_connections {
            let bound = self.connectors.get(claimed).map(|e| e.account_id.clone());
            if bound.is_some_and(|account| !registration.accounts.contains(&account)) {
                return Err(RegistryError::UnauthorizedClaim(claimed.clone()));
            }
        }

        let generation = self.next_generation();
        let (outbox, receiver) = Outbox::channel(self.outbox_capacity);
        self.clients.insert(
            generation,
            ClientEntry {
                user_id: registration.user_id.clone(),
                accounts: registration.accounts,
                capability: registration.capability,
                last_seen: Instant::now(),
                outbox,
            },
        );

        metrics::record_session_registered(SessionKind::Client);
        metrics::set_active_sessions(SessionKind::Client, self.clients.len());
        tracing::info!(user_id = %registration.user_id, generation, "Client registered");

        Ok((SessionHandle::Client { generation }, receiver))
    }

    /// Clients observing `account`.
    #[must_use]
    pub fn observers(&self, account: &AccountId) -> Vec<ClientRoute> {
        self.clients
            .iter()
            .filter(|e| e.accounts.contains(account))
            .map(|e| ClientRoute {
                handle: SessionHandle::Client {
                    generation: *e.key(),
                },
                outbox: e.outbox.clone(),
            })
            .collect()
    }

    /// Accounts a client may observe.
    #[must_use]
    pub fn client_accounts(&self, handle: &SessionHandle) -> Option<HashSet<AccountId>> {
        let SessionHandle::Client { generation } = handle else {
            return None;
        };
        self.clients.get(generation).map(|e| e.accounts.clone())
    }

    /// Status of a client session.
    #[must_use]
    pub fn client_status(&self, handle: &SessionHandle) -> Option<ClientStatus> {
        let SessionHandle::Client { generation } = handle else {
            return None;
        };
        self.clients.get(generation).map(|e| {
            let mut accounts: Vec<AccountId> = e.accounts.iter().cloned().collect();
            accounts.sort();
            ClientStatus {
                generation: *generation,
                user_id: e.user_id.clone(),
                accounts,
                capability: e.capability,
            }
        })
    }

    /// Number of live clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    // -------------------------------------------------------------------------
    // Shared
    // -------------------------------------------------------------------------

    /// Outbox of any live session.
    #[must_use]
    pub fn outbox(&self, handle: &SessionHandle) -> Option<Outbox> {
        match handle {
            SessionHandle::Connector { .. } => self.connector(handle).map(|r| r.outbox),
            SessionHandle::Client { generation } => self.clients.get(generation).map(|e| e.outbox.clone()),
        }
    }

    /// Refresh liveness. Returns `false` for stale handles.
    pub fn touch(&self, handle: &SessionHandle) -> bool {
        match handle {
            SessionHandle::Connector {
                generation,
                connection_id,
            } => match self.connectors.get_mut(connection_id) {
                Some(mut entry) if entry.generation == *generation => {
                    entry.last_seen = Instant::now();
                    entry.last_seen_at = Utc::now();
                    true
                }
                _ => false,
            },
            SessionHandle::Client { generation } => match self.clients.get_mut(generation) {
                Some(mut entry) => {
                    entry.last_seen = Instant::now();
                    true
                }
                None => false,
            },
        }
    }

    /// Remove a session and close its outbox with `reason`.
    ///
    /// Returns `false` if the handle no longer refers to a live session.
    pub fn remove(&self, handle: &SessionHandle, reason: CloseReason) -> bool {
        match handle {
            SessionHandle::Connector {
                generation,
                connection_id,
            } => {
                let Some((_, entry)) = self
                    .connectors
                    .remove_if(connection_id, |_, e| e.generation == *generation)
                else {
                    return false;
                };
                self.accounts
                    .remove_if(&entry.account_id, |_, (c, g)| c == connection_id && *g == *generation);
                entry.outbox.close(reason.clone());

                metrics::record_session_closed(SessionKind::Connector, &reason);
                metrics::set_active_sessions(SessionKind::Connector, self.connectors.len());
                tracing::info!(
                    connection_id = %connection_id,
                    account_id = %entry.account_id,
                    reason = %reason,
                    "Connector removed"
                );

                let event = if reason == CloseReason::Expired {
                    RegistryEvent::SessionExpired {
                        handle: handle.clone(),
                        account_id: Some(entry.account_id),
                    }
                } else {
                    RegistryEvent::ConnectorRemoved {
                        connection_id: connection_id.clone(),
                        account_id: entry.account_id,
                        reason,
                    }
                };
                self.emit(event);
                true
            }
            SessionHandle::Client { generation } => {
                let Some((_, entry)) = self.clients.remove(generation) else {
                    return false;
                };
                entry.outbox.close(reason.clone());

                metrics::record_session_closed(SessionKind::Client, &reason);
                metrics::set_active_sessions(SessionKind::Client, self.clients.len());
                tracing::debug!(user_id = %entry.user_id, generation, reason = %reason, "Client removed");

                if reason == CloseReason::Expired {
                    self.emit(RegistryEvent::SessionExpired {
                        handle: handle.clone(),
                        account_id: None,
                    });
                }
                true
            }
        }
    }

    /// Remove every session silent for longer than `threshold` as of `now`.
    ///
    /// Returns the handles that were removed.
    pub fn sweep_expired_at(&self, now: Instant, threshold: Duration) -> Vec<SessionHandle> {
        let is_stale = |last_seen: Instant| now.saturating_duration_since(last_seen) > threshold;

        let mut expired: Vec<SessionHandle> = self
            .connectors
            .iter()
            .filter(|e| is_stale(e.last_seen))
            .map(|e| SessionHandle::Connector {
                generation: e.generation,
                connection_id: e.key().clone(),
            })
            .collect();
        expired.extend(
            self.clients
                .iter()
                .filter(|e| is_stale(e.last_seen))
                .map(|e| SessionHandle::Client {
                    generation: *e.key(),
                }),
        );

        expired.retain(|handle| self.remove(handle, CloseReason::Expired));
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "Expired idle sessions");
        }
        expired
    }

    /// Close every session.
    pub fn close_all(&self, reason: &CloseReason) {
        let handles: Vec<SessionHandle> = self
            .connectors
            .iter()
            .map(|e| SessionHandle::Connector {
                generation: e.generation,
                connection_id: e.key().clone(),
            })
            .chain(self.clients.iter().map(|e| SessionHandle::Client {
                generation: *e.key(),
            }))
            .collect();
        for handle in handles {
            self.remove(&handle, reason.clone());
        }
    }
}

/// Periodically expire idle sessions until cancelled.
pub async fn run_sweeper(
    registry: SharedRegistry,
    interval: Duration,
    threshold: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                tracing::debug!("Session sweeper cancelled");
                break;
            }
            _ = ticker.tick() => {
                registry.sweep_expired_at(Instant::now(), threshold);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connector(conn: &str, account: &str) -> ConnectorRegistration {
        ConnectorRegistration {
            connection_id: ConnectionId::new(conn),
            account_id: AccountId::new(account),
            broker: Some("Demo".into()),
            capability: Capability::Streaming,
        }
    }

    fn client(accounts: &[&str], claims: &[&str]) -> ClientRegistration {
        ClientRegistration {
            user_id: UserId::new("u-1"),
            accounts: accounts.iter().map(|a| AccountId::new(*a)).collect(),
            claimed_connections: claims.iter().map(|c| ConnectionId::new(*c)).collect(),
            capability: Capability::Streaming,
        }
    }

    #[test]
    fn registers_and_routes_by_account() {
        let registry = SessionRegistry::new(8);
        let (handle, _rx) = registry.register_connector(connector("c1", "A")).unwrap();

        let route = registry.connector_for_account(&AccountId::new("A")).unwrap();
        assert_eq!(route.handle, handle);
        assert_eq!(route.connection_id, ConnectionId::new("c1"));
        assert!(registry.connector_for_account(&AccountId::new("B")).is_none());
    }

    #[test]
    fn same_key_replaces_previous_session() {
        let registry = SessionRegistry::new(8);
        let (first, first_rx) = registry.register_connector(connector("c1", "A")).unwrap();
        let (second, _rx) = registry.register_connector(connector("c1", "A")).unwrap();

        assert_ne!(first, second);
        assert_eq!(first_rx.close_reason(), Some(CloseReason::Replaced));
        assert_eq!(registry.connector_count(), 1);
        assert_eq!(
            registry.connector_for_account(&AccountId::new("A")).unwrap().handle,
            second
        );
    }

    #[test]
    fn stale_handle_removal_is_noop() {
        let registry = SessionRegistry::new(8);
        let (first, _rx1) = registry.register_connector(connector("c1", "A")).unwrap();
        let (second, _rx2) = registry.register_connector(connector("c1", "A")).unwrap();

        assert!(!registry.remove(&first, CloseReason::Normal));
        assert!(registry.connector(&second).is_some());
        assert!(registry.connector_for_account(&AccountId::new("A")).is_some());
    }

    #[test]
    fn connection_bound_to_other_account_conflicts() {
        let registry = SessionRegistry::new(8);
        let (_handle, _rx) = registry.register_connector(connector("c1", "A")).unwrap();

        let err = registry.register_connector(connector("c1", "B")).unwrap_err();
        assert!(matches!(err, RegistryError::OwnershipConflict { .. }));
        assert!(registry.connector_for_account(&AccountId::new("B")).is_none());
        assert_eq!(
            registry.connector_for_account(&AccountId::new("A")).unwrap().connection_id,
            ConnectionId::new("c1")
        );
    }

    #[test]
    fn new_connection_for_same_account_evicts_old_one() {
        let registry = SessionRegistry::new(8);
        let (old, old_rx) = registry.register_connector(connector("c1", "A")).unwrap();
        let (new, _rx) = registry.register_connector(connector("c2", "A")).unwrap();

        assert_eq!(old_rx.close_reason(), Some(CloseReason::Replaced));
        assert!(registry.connector(&old).is_none());
        assert_eq!(registry.connector_for_account(&AccountId::new("A")).unwrap().handle, new);
        assert_eq!(registry.connector_count(), 1);
    }

    #[test]
    fn removal_unbinds_account_and_emits_event() {
        let registry = SessionRegistry::new(8);
        let mut events = registry.subscribe();
        let (handle, rx) = registry.register_connector(connector("c1", "A")).unwrap();

        assert!(registry.remove(&handle, CloseReason::Normal));
        assert!(registry.connector_for_account(&AccountId::new("A")).is_none());
        assert_eq!(rx.close_reason(), Some(CloseReason::Normal));

        assert!(matches!(events.try_recv().unwrap(), RegistryEvent::ConnectorRegistered { .. }));
        assert_eq!(
            events.try_recv().unwrap(),
            RegistryEvent::ConnectorRemoved {
                connection_id: ConnectionId::new("c1"),
                account_id: AccountId::new("A"),
                reason: CloseReason::Normal,
            }
        );
    }

    #[test]
    fn observers_follow_authorized_accounts() {
        let registry = SessionRegistry::new(8);
        let (h1, _r1) = registry.register_client(client(&["A", "B"], &[])).unwrap();
        let (_h2, _r2) = registry.register_client(client(&["B"], &[])).unwrap();

        let observers: Vec<SessionHandle> = registry
            .observers(&AccountId::new("A"))
            .into_iter()
            .map(|r| r.handle)
            .collect();
        assert_eq!(observers, vec![h1]);
        assert_eq!(registry.observers(&AccountId::new("B")).len(), 2);
    }

    #[test]
    fn client_cannot_claim_foreign_connection() {
        let registry = SessionRegistry::new(8);
        registry.register_connector(connector("c1", "A")).unwrap();

        let err = registry.register_client(client(&["B"], &["c1"])).unwrap_err();
        assert_eq!(err, RegistryError::UnauthorizedClaim(ConnectionId::new("c1")));
        assert!(registry.register_client(client(&["A"], &["c1"])).is_ok());
    }

    #[test]
    fn sweep_removes_only_idle_sessions() {
        let registry = SessionRegistry::new(8);
        let mut events = registry.subscribe();
        let (conn, _r1) = registry.register_connector(connector("c1", "A")).unwrap();
        let (cli, _r2) = registry.register_client(client(&["A"], &[])).unwrap();

        let threshold = Duration::from_secs(90);
        assert!(registry.sweep_expired_at(Instant::now(), threshold).is_empty());

        let later = Instant::now() + Duration::from_secs(91);
        let expired = registry.sweep_expired_at(later, threshold);
        assert_eq!(expired.len(), 2);
        assert!(expired.contains(&conn));
        assert!(expired.contains(&cli));
        assert_eq!(registry.connector_count(), 0);
        assert_eq!(registry.client_count(), 0);

        let _registered = events.try_recv().unwrap();
        assert!(matches!(
            events.try_recv().unwrap(),
            RegistryEvent::SessionExpired { account_id: Some(_), .. }
        ));
    }

    #[test]
    fn touch_rejects_stale_handle() {
        let registry = SessionRegistry::new(8);
        let (first, _r1) = registry.register_connector(connector("c1", "A")).unwrap();
        let (second, _r2) = registry.register_connector(connector("c1", "A")).unwrap();
        assert!(!registry.touch(&first));
        assert!(registry.touch(&second));
    }

    #[test]
    fn statuses_filter_by_accounts() {
        let registry = SessionRegistry::new(8);
        registry.register_connector(connector("c1", "A")).unwrap();
        registry.register_connector(connector("c2", "B")).unwrap();

        let only_a: HashSet<AccountId> = [AccountId::new("A")].into_iter().collect();
        let statuses = registry.connection_statuses(Some(&only_a));
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].account_id, AccountId::new("A"));
        assert_eq!(registry.connection_statuses(None).len(), 2);
    }

    #[test]
    fn concurrent_registrations_keep_one_connector_per_account() {
        let registry = Arc::new(SessionRegistry::new(8));
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let conn = format!("c{}", i % 4);
                    registry.register_connector(connector(&conn, "A")).map(|(h, _)| h)
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        let route = registry.connector_for_account(&AccountId::new("A")).unwrap();
        assert!(registry.connector(&route.handle).is_some());
        assert_eq!(registry.connector_count(), 1);
    }
}
