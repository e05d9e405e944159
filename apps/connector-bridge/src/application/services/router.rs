//! Message Router
//!
//! Validates inbound frames from both session kinds and dispatches them
//! through one exhaustive `match` per direction, and delivers outbound
//! envelopes to "the connector owning account X" or "every client observing
//! account X".
//!
//! Inbound failures:
//! - unknown `type`: answered with an `ERROR` envelope, channel stays open;
//! - malformed JSON, a kind not allowed in that direction, or a claimed
//!   account other than the session's: protocol violation, the session is
//!   removed and its channel closed with code 4008.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use super::correlation::{CompletionError, PendingResults};
use super::outbox::{OutboxError, PushOutcome};
use super::reconciliation::ReconciliationTracker;
use super::registry::{ConnectorRoute, RegistryEvent, SharedRegistry};
use crate::domain::envelope::{
    AccountUpdatePayload, CodecError, ConnectionsStatusPayload, ConnectorDisconnectedPayload,
    Envelope, EnvelopeCodec, PongPayload, PositionsUpdatePayload, RequestPayload,
    SendTradeCommandPayload, SyncResponsePayload, TradeResultPayload,
};
use crate::domain::identity::{AccountId, ConnectionId, CorrelationId};
use crate::domain::session::{CloseReason, SessionHandle, SessionKind, TerminalStatus};
use crate::error::ErrorCode;
use crate::infrastructure::metrics;

// =============================================================================
// Types
// =============================================================================

/// Outbound routing errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouterError {
    /// No live connector serves the account.
    #[error("no live connector for account {0}")]
    ConnectorOffline(AccountId),

    /// The session handle no longer resolves.
    #[error("session is gone")]
    SessionGone,

    /// The connector's queue holds only critical envelopes.
    #[error("connector queue is full")]
    QueueFull,
}

/// Why an inbound frame ended the session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InboundError {
    /// The frame violated the protocol; the session was closed.
    #[error("protocol violation: {0}")]
    Violation(String),

    /// The session was already removed.
    #[error("session is gone")]
    SessionGone,
}

/// Work a client frame hands back to its channel task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    /// Submit a trade intent on behalf of the client.
    Trade(SendTradeCommandPayload),
}

/// Result of a fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOutReport {
    /// Sessions that accepted the envelope.
    pub delivered: usize,
    /// Non-critical envelopes lost to backpressure (evicted or dropped).
    pub dropped: usize,
    /// Clients disconnected because a critical envelope did not fit.
    pub disconnected: usize,
}

/// Router tuning.
#[derive(Debug, Clone, Copy)]
pub struct RouterConfig {
    /// How long a critical fan-out waits for room in a client's queue.
    pub critical_wait: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            critical_wait: Duration::from_millis(250),
        }
    }
}

// =============================================================================
// Router
// =============================================================================

/// Dispatches frames between sessions.
#[derive(Debug)]
pub struct MessageRouter {
    registry: SharedRegistry,
    pending: Arc<PendingResults>,
    reconciliation: Arc<ReconciliationTracker>,
    codec: EnvelopeCodec,
    config: RouterConfig,
}

impl MessageRouter {
    /// Create a router.
    #[must_use]
    pub const fn new(
        registry: SharedRegistry,
        pending: Arc<PendingResults>,
        reconciliation: Arc<ReconciliationTracker>,
        config: RouterConfig,
    ) -> Self {
        Self {
            registry,
            pending,
            reconciliation,
            codec: EnvelopeCodec::new(),
            config,
        }
    }

    /// Registry the router delivers through.
    #[must_use]
    pub const fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    // -------------------------------------------------------------------------
    // Outbound
    // -------------------------------------------------------------------------

    /// Queue an envelope for the connector owning `account`.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::ConnectorOffline`] if no live connector serves
    /// the account, or [`RouterError::QueueFull`] if its queue cannot take
    /// the envelope. The connector is never disconnected for backpressure.
    pub fn send_to_connector(
        &self,
        account: &AccountId,
        envelope: Envelope,
    ) -> Result<ConnectionId, RouterError> {
        let ConnectorRoute {
            connection_id,
            outbox,
            ..
        } = self
            .registry
            .connector_for_account(account)
            .ok_or_else(|| RouterError::ConnectorOffline(account.clone()))?;

        let kind = envelope.kind();
        match outbox.push(envelope) {
            Ok(PushOutcome::Queued | PushOutcome::EvictedOldest) => {
                metrics::record_envelope_sent(SessionKind::Connector, kind);
                Ok(connection_id)
            }
            Ok(PushOutcome::Dropped) | Err(OutboxError::Full) => {
                metrics::record_envelope_dropped(SessionKind::Connector, kind);
                Err(RouterError::QueueFull)
            }
            Err(OutboxError::Closed) => Err(RouterError::ConnectorOffline(account.clone())),
        }
    }

    /// Queue an envelope for one session.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::SessionGone`] if the handle is stale.
    pub fn send_to_session(&self, handle: &SessionHandle, envelope: Envelope) -> Result<(), RouterError> {
        let outbox = self.registry.outbox(handle).ok_or(RouterError::SessionGone)?;
        let kind = envelope.kind();
        match outbox.push(envelope) {
            Ok(PushOutcome::Dropped) => {
                metrics::record_envelope_dropped(handle.kind(), kind);
                Ok(())
            }
            Ok(_) => {
                metrics::record_envelope_sent(handle.kind(), kind);
                Ok(())
            }
            Err(OutboxError::Full) => Err(RouterError::QueueFull),
            Err(OutboxError::Closed) => Err(RouterError::SessionGone),
        }
    }

    /// Deliver to every client observing `account`.
    ///
    /// Critical envelopes are never dropped: a client whose queue stays full
    /// past the wait bound is disconnected with [`CloseReason::QueueFull`].
    pub async fn fan_out(&self, account: &AccountId, envelope: &Envelope) -> FanOutReport {
        let observers = self.registry.observers(account);
        let kind = envelope.kind();
        let mut report = FanOutReport::default();

        if envelope.is_critical() {
            let pushes = observers
                .iter()
                .map(|o| o.outbox.push_critical(envelope.clone(), self.config.critical_wait));
            let results = futures::future::join_all(pushes).await;

            for (observer, result) in observers.iter().zip(results) {
                match result {
                    Ok(_) => report.delivered += 1,
                    Err(OutboxError::Full) => {
                        tracing::warn!(
                            session = %observer.handle,
                            kind = %kind,
                            "Client queue full for critical envelope, disconnecting"
                        );
                        self.registry.remove(&observer.handle, CloseReason::QueueFull);
                        report.disconnected += 1;
                    }
                    Err(OutboxError::Closed) => {}
                }
            }
        } else {
            for observer in &observers {
                match observer.outbox.push(envelope.clone()) {
                    Ok(PushOutcome::Queued) => report.delivered += 1,
                    Ok(PushOutcome::EvictedOldest) => {
                        report.delivered += 1;
                        report.dropped += 1;
                    }
                    Ok(PushOutcome::Dropped) => report.dropped += 1,
                    Err(_) => {}
                }
            }
        }

        for _ in 0..report.delivered {
            metrics::record_envelope_sent(SessionKind::Client, kind);
        }
        for _ in 0..report.dropped {
            metrics::record_envelope_dropped(SessionKind::Client, kind);
        }
        report
    }

    /// Ask the connector owning `account` for a full state dump.
    pub fn request_sync(&self, account: &AccountId) -> bool {
        let request = Envelope::SyncRequest(RequestPayload {
            correlation_id: Some(CorrelationId::generate()),
        });
        match self.send_to_connector(account, request) {
            Ok(connection_id) => {
                tracing::debug!(account_id = %account, connection_id = %connection_id, "Sync requested");
                true
            }
            Err(err) => {
                tracing::debug!(account_id = %account, error = %err, "Sync request not delivered");
                false
            }
        }
    }

    fn reply_error(&self, handle: &SessionHandle, code: ErrorCode, message: String) {
        let _ = self.send_to_session(handle, Envelope::error(code, message, None));
    }

    fn violation(&self, handle: &SessionHandle, detail: String) -> InboundError {
        tracing::warn!(session = %handle, detail = %detail, "Protocol violation, closing session");
        metrics::record_protocol_violation(handle.kind());
        self.registry
            .remove(handle, CloseReason::ProtocolViolation(detail.clone()));
        InboundError::Violation(detail)
    }

    /// Decode a frame, answering unknown kinds in place.
    fn decode(&self, handle: &SessionHandle, text: &str) -> Result<Option<Envelope>, InboundError> {
        match self.codec.decode(text) {
            Ok(envelope) => Ok(Some(envelope)),
            Err(CodecError::UnknownType(kind)) => {
                tracing::debug!(session = %handle, kind = %kind, "Unknown envelope type");
                self.registry.touch(handle);
                self.reply_error(handle, ErrorCode::UnknownType, format!("unknown type {kind}"));
                Ok(None)
            }
            Err(err) => Err(self.violation(handle, err.to_string())),
        }
    }

    // -------------------------------------------------------------------------
    // Connector inbound
    // -------------------------------------------------------------------------

    /// Handle one text frame from a connector.
    ///
    /// # Errors
    ///
    /// Returns [`InboundError`] when the session was closed; the caller
    /// stops reading.
    pub async fn handle_connector_frame(&self, handle: &SessionHandle, text: &str) -> Result<(), InboundError> {
        let route = self.registry.connector(handle).ok_or(InboundError::SessionGone)?;
        let Some(envelope) = self.decode(handle, text)? else {
            return Ok(());
        };

        if let Some(claimed) = envelope.claimed_account() {
            if claimed != &route.account_id {
                return Err(self.violation(
                    handle,
                    format!("claimed account {claimed} but session is bound to {}", route.account_id),
                ));
            }
        }

        metrics::record_envelope_received(SessionKind::Connector, envelope.kind());
        self.registry.touch(handle);

        match envelope {
            Envelope::TradeResult(result) => self.on_trade_result(&route, result),
            Envelope::SyncResponse(sync) => {
                self.on_sync_response(&route, sync).await;
                Ok(())
            }
            Envelope::Positions(update) => {
                let positions = Envelope::PositionsUpdate(PositionsUpdatePayload {
                    account_id: route.account_id.clone(),
                    positions: update.positions,
                });
                self.fan_out(&route.account_id, &positions).await;
                Ok(())
            }
            Envelope::AccountInfo(info) => {
                let snapshot = info.snapshot();
                self.registry.update_account(handle, snapshot.clone());
                let update = Envelope::AccountUpdate(AccountUpdatePayload {
                    account_id: route.account_id.clone(),
                    account: snapshot,
                });
                self.fan_out(&route.account_id, &update).await;
                Ok(())
            }
            Envelope::Error(error) => {
                tracing::warn!(
                    session = %handle,
                    code = %error.code,
                    message = %error.message,
                    "Connector reported an error"
                );
                Ok(())
            }
            Envelope::Pong(pong) => {
                if pong.terminal_connected.is_some() || pong.broker.is_some() {
                    self.registry.update_terminal(
                        handle,
                        TerminalStatus::from_flag(pong.terminal_connected),
                        pong.broker,
                    );
                }
                Ok(())
            }
            other @ (Envelope::TradeOpen(_)
            | Envelope::TradeClose(_)
            | Envelope::TradeModify(_)
            | Envelope::SyncRequest(_)
            | Envelope::GetPositions(_)
            | Envelope::GetAccount(_)
            | Envelope::SendTradeCommand(_)
            | Envelope::GetConnections(_)
            | Envelope::ConnectionsStatus(_)
            | Envelope::AccountUpdate(_)
            | Envelope::PositionsUpdate(_)
            | Envelope::TradeUpdate(_)
            | Envelope::ConnectorDisconnected(_)
            | Envelope::Ping(_)) => Err(self.violation(
                handle,
                format!("{} is not accepted from a connector", other.kind()),
            )),
        }
    }

    fn on_trade_result(&self, route: &ConnectorRoute, result: TradeResultPayload) -> Result<(), InboundError> {
        let success = result.success;
        let ticket = result.ticket.clone();
        let correlation_id = result.correlation_id.clone();

        match self.pending.complete(&route.account_id, result) {
            Ok(_) => Ok(()),
            Err(CompletionError::Unknown(_)) => {
                tracing::warn!(
                    account_id = %route.account_id,
                    correlation_id = %correlation_id,
                    success,
                    "Trade result with no pending command"
                );
                if success {
                    self.reconciliation.record_late_result(
                        &route.account_id,
                        ticket,
                        correlation_id.as_str(),
                    );
                }
                Ok(())
            }
            Err(err @ CompletionError::AccountMismatch { .. }) => {
                Err(self.violation(&route.handle, err.to_string()))
            }
        }
    }

    async fn on_sync_response(&self, route: &ConnectorRoute, sync: SyncResponsePayload) {
        let account = &route.account_id;

        if let Some(snapshot) = sync.account {
            self.registry.update_account(&route.handle, snapshot.clone());
            let update = Envelope::AccountUpdate(AccountUpdatePayload {
                account_id: account.clone(),
                account: snapshot,
            });
            self.fan_out(account, &update).await;
        }

        if let Err(err) = self.reconciliation.reconcile(account, &sync.positions).await {
            tracing::error!(account_id = %account, error = %err, "Reconciliation failed");
        }

        let positions = Envelope::PositionsUpdate(PositionsUpdatePayload {
            account_id: account.clone(),
            positions: sync.positions,
        });
        self.fan_out(account, &positions).await;
    }

    // -------------------------------------------------------------------------
    // Client inbound
    // -------------------------------------------------------------------------

    /// Handle one text frame from a client.
    ///
    /// Returns a [`ClientRequest`] when the frame asks for work the router
    /// does not do itself.
    ///
    /// # Errors
    ///
    /// Returns [`InboundError`] when the session was closed.
    pub fn handle_client_frame(
        &self,
        handle: &SessionHandle,
        text: &str,
    ) -> Result<Option<ClientRequest>, InboundError> {
        let accounts = self
            .registry
            .client_accounts(handle)
            .ok_or(InboundError::SessionGone)?;
        let Some(envelope) = self.decode(handle, text)? else {
            return Ok(None);
        };

        metrics::record_envelope_received(SessionKind::Client, envelope.kind());
        self.registry.touch(handle);

        match envelope {
            Envelope::SendTradeCommand(command) => {
                if accounts.contains(&command.account_id) {
                    Ok(Some(ClientRequest::Trade(command)))
                } else {
                    tracing::warn!(
                        session = %handle,
                        account_id = %command.account_id,
                        "Trade command for unauthorized account"
                    );
                    self.reply_error(
                        handle,
                        ErrorCode::Unauthorized,
                        format!("not authorized for account {}", command.account_id),
                    );
                    Ok(None)
                }
            }
            Envelope::Ping(ping) => {
                let pong = Envelope::Pong(PongPayload {
                    timestamp: ping.timestamp,
                    ..PongPayload::default()
                });
                let _ = self.send_to_session(handle, pong);
                Ok(None)
            }
            Envelope::Pong(_) => Ok(None),
            Envelope::GetConnections(request) => {
                self.send_status(handle, &accounts, request.correlation_id);
                Ok(None)
            }
            other @ (Envelope::TradeResult(_)
            | Envelope::SyncResponse(_)
            | Envelope::Positions(_)
            | Envelope::AccountInfo(_)
            | Envelope::TradeOpen(_)
            | Envelope::TradeClose(_)
            | Envelope::TradeModify(_)
            | Envelope::SyncRequest(_)
            | Envelope::GetPositions(_)
            | Envelope::GetAccount(_)
            | Envelope::ConnectionsStatus(_)
            | Envelope::AccountUpdate(_)
            | Envelope::PositionsUpdate(_)
            | Envelope::TradeUpdate(_)
            | Envelope::ConnectorDisconnected(_)
            | Envelope::Error(_)) => Err(self.violation(
                handle,
                format!("{} is not accepted from a client", other.kind()),
            )),
        }
    }

    fn send_status(
        &self,
        handle: &SessionHandle,
        accounts: &HashSet<AccountId>,
        correlation_id: Option<CorrelationId>,
    ) {
        let status = Envelope::ConnectionsStatus(ConnectionsStatusPayload {
            correlation_id,
            connections: self.registry.connection_statuses(Some(accounts)),
        });
        let _ = self.send_to_session(handle, status);
    }

    // -------------------------------------------------------------------------
    // Registry events
    // -------------------------------------------------------------------------

    /// Consume registry lifecycle events until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut events = self.registry.subscribe();
        tracing::info!("Router event loop started");

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!("Router event loop cancelled");
                    break;
                }
                event = events.recv() => match event {
                    Ok(event) => self.on_registry_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Router lagged behind registry events");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }

    /// React to one registry event.
    pub async fn on_registry_event(&self, event: RegistryEvent) {
        match event {
            RegistryEvent::ConnectorRegistered { account_id, .. } => {
                for observer in self.registry.observers(&account_id) {
                    if let Some(accounts) = self.registry.client_accounts(&observer.handle) {
                        self.send_status(&observer.handle, &accounts, None);
                    }
                }
                if self.reconciliation.has_pending(&account_id) {
                    self.request_sync(&account_id);
                }
            }
            RegistryEvent::ConnectorRemoved {
                connection_id,
                account_id,
                reason,
            } => {
                // A replacement connector takes over the account.
                if reason != CloseReason::Replaced {
                    self.notify_disconnected(account_id, connection_id, &reason).await;
                }
            }
            RegistryEvent::SessionExpired {
                handle: SessionHandle::Connector { connection_id, .. },
                account_id: Some(account_id),
            } => {
                self.notify_disconnected(account_id, connection_id, &CloseReason::Expired)
                    .await;
            }
            RegistryEvent::SessionExpired { .. } => {}
        }
    }

    async fn notify_disconnected(&self, account_id: AccountId, connection_id: ConnectionId, reason: &CloseReason) {
        let envelope = Envelope::ConnectorDisconnected(ConnectorDisconnectedPayload {
            account_id: account_id.clone(),
            connection_id,
            reason: reason.as_str().to_string(),
        });
        self.fan_out(&account_id, &envelope).await;
    }
}
