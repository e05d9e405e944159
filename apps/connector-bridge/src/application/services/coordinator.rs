//! Trade Execution Coordinator
//!
//! Two-phase execution across the local trade store and the connector's
//! terminal. An intent is staged locally, sent to the connector owning its
//! account, and only becomes an authoritative trade once the terminal
//! confirms it:
//!
//! ```text
//! STAGED ──► SENT ──► CONFIRMED ──► COMMITTED
//!              │
//!              └────► REJECTED ───► ROLLED_BACK
//! ```
//!
//! Failures before anything reaches the connector discard the staged intent.
//! Failures after the command went out always roll it back, so no code path
//! leaves a staged-only intent behind.
//!
//! Each intent executes on its own task. Callers awaiting the same intent of
//! the same account share that task's outcome, and a caller that goes away
//! does not stop the commit or rollback.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;

use super::correlation::PendingResults;
use super::rate_limiter::{RateLimiter, trade_key};
use super::reconciliation::ReconciliationTracker;
use super::router::{MessageRouter, RouterError};
use crate::application::ports::{StoreError, TradeStore};
use crate::domain::envelope::{
    Envelope, SendTradeCommandPayload, TradeCommandPayload, TradeUpdatePayload,
};
use crate::domain::identity::{AccountId, CorrelationId, IntentId, RemoteRef, TradeId};
use crate::domain::rate_limit::{RateDecision, RateLimit};
use crate::domain::trade::{
    IntentLifecycle, IntentState, TradeAction, TradeError, TradeIntent, TradeOutcome,
};
use crate::error::{BridgeError, ErrorCode};
use crate::infrastructure::metrics;

// =============================================================================
// Errors
// =============================================================================

/// Why a trade request did not commit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// The request is incomplete or invalid.
    #[error("invalid trade request: {0}")]
    Invalid(String),

    /// Close/modify referenced no open trade of the account.
    #[error("trade {0} not found")]
    TradeNotFound(TradeId),

    /// The account exceeded its trade rate.
    #[error("rate limited, retry after {}ms", .retry_after.as_millis())]
    RateLimited {
        /// Wait before the next request can be admitted.
        retry_after: Duration,
    },

    /// No live connector serves the account.
    #[error("{0}")]
    ConnectorOffline(String),

    /// The terminal refused the command.
    #[error("execution rejected: {0}")]
    Rejected(String),

    /// No result arrived before the deadline.
    #[error("no execution result within {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Storage or task failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SubmitError {
    /// Error code for the wire and HTTP.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Invalid(_) => ErrorCode::InvalidRequest,
            Self::TradeNotFound(_) => ErrorCode::TradeNotFound,
            Self::RateLimited { .. } => ErrorCode::RateLimited,
            Self::ConnectorOffline(_) => ErrorCode::ConnectorOffline,
            Self::Rejected(_) => ErrorCode::ExecutionRejected,
            Self::Timeout(_) => ErrorCode::ExecutionTimeout,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    const fn outcome_label(&self) -> &'static str {
        match self {
            Self::Invalid(_) => "invalid",
            Self::TradeNotFound(_) => "trade_not_found",
            Self::RateLimited { .. } => "rate_limited",
            Self::ConnectorOffline(_) => "connector_offline",
            Self::Rejected(_) => "rejected",
            Self::Timeout(_) => "timeout",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<SubmitError> for BridgeError {
    fn from(err: SubmitError) -> Self {
        let retry_after = match &err {
            SubmitError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        };
        let bridge = Self::new(err.code(), err.to_string());
        match retry_after {
            Some(wait) => bridge.with_retry_after(wait),
            None => bridge,
        }
    }
}

impl From<StoreError> for SubmitError {
    fn from(err: StoreError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<TradeError> for SubmitError {
    fn from(err: TradeError) -> Self {
        match err {
            TradeError::Invalid(message) => Self::Invalid(message),
            TradeError::InvalidTransition { .. } => Self::Internal(err.to_string()),
        }
    }
}

type Shared = Option<Result<TradeOutcome, SubmitError>>;

/// Intent ids come from callers, so executions are keyed per account.
type InflightKey = (AccountId, IntentId);

/// Attempts to record a rollback before giving up.
const ROLLBACK_ATTEMPTS: u32 = 3;

/// Pause between rollback attempts, multiplied by the attempt number.
const ROLLBACK_BACKOFF: Duration = Duration::from_millis(50);

// =============================================================================
// Configuration
// =============================================================================

/// Coordinator tuning.
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    /// How long to wait for the connector's `TRADE_RESULT`.
    pub deadline: Duration,
    /// Trade submissions admitted per account.
    pub trade_limit: RateLimit,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(15),
            trade_limit: RateLimit::new(10, Duration::from_secs(1)),
        }
    }
}

// =============================================================================
// Request mapping
// =============================================================================

/// Build an intent from a client or API trade command.
///
/// # Errors
///
/// Returns [`SubmitError::Invalid`] when required fields for the action are
/// missing.
pub fn intent_from_command(command: SendTradeCommandPayload) -> Result<TradeIntent, SubmitError> {
    let SendTradeCommandPayload {
        account_id,
        action,
        intent_id,
        trade_id,
        instrument,
        side,
        size,
        stop_loss,
        take_profit,
    } = command;

    let intent = match action {
        TradeAction::Open => {
            let (Some(instrument), Some(side), Some(size)) = (instrument, side, size) else {
                return Err(SubmitError::Invalid(
                    "open requires instrument, side and size".into(),
                ));
            };
            TradeIntent::open(account_id, instrument, side, size).with_protection(stop_loss, take_profit)
        }
        TradeAction::Close => {
            let trade_id = trade_id.ok_or_else(|| SubmitError::Invalid("close requires trade_id".into()))?;
            TradeIntent::close(account_id, trade_id)
        }
        TradeAction::Modify => {
            let trade_id = trade_id.ok_or_else(|| SubmitError::Invalid("modify requires trade_id".into()))?;
            TradeIntent::modify(account_id, trade_id, stop_loss, take_profit)
        }
    };

    let intent = match intent_id {
        Some(id) => intent.with_id(id),
        None => intent,
    };
    intent.validate()?;
    Ok(intent)
}

// =============================================================================
// Coordinator
// =============================================================================

/// Runs the two-phase protocol for every trade intent.
pub struct TradeExecutionCoordinator<S: TradeStore + ?Sized> {
    store: Arc<S>,
    router: Arc<MessageRouter>,
    pending: Arc<PendingResults>,
    limiter: RateLimiter,
    reconciliation: Arc<ReconciliationTracker>,
    inflight: Mutex<HashMap<InflightKey, watch::Receiver<Shared>>>,
    config: CoordinatorConfig,
}

impl<S: TradeStore + ?Sized> std::fmt::Debug for TradeExecutionCoordinator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradeExecutionCoordinator")
            .field("inflight", &self.inflight.lock().len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S: TradeStore + ?Sized + 'static> TradeExecutionCoordinator<S> {
    /// Create a coordinator.
    #[must_use]
    pub fn new(
        store: Arc<S>,
        router: Arc<MessageRouter>,
        pending: Arc<PendingResults>,
        limiter: RateLimiter,
        reconciliation: Arc<ReconciliationTracker>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            router,
            pending,
            limiter,
            reconciliation,
            inflight: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Trade store backing the coordinator.
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Intents currently executing.
    #[must_use]
    pub fn inflight(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Execute an intent and wait for its definitive outcome.
    ///
    /// A second submit of an intent that is still executing for the same
    /// account coalesces onto the first; a submit of a finalized intent
    /// returns the recorded outcome without contacting the connector again.
    /// An intent id already used by another account is refused.
    ///
    /// # Errors
    ///
    /// Returns [`SubmitError`] describing why the intent did not commit.
    pub async fn submit(self: &Arc<Self>, intent: TradeIntent) -> Result<TradeOutcome, SubmitError> {
        intent.validate()?;

        let key = (intent.account_id.clone(), intent.id.clone());
        let mut outcome = {
            let mut inflight = self.inflight.lock();
            if let Some(existing) = inflight.get(&key) {
                tracing::info!(intent_id = %intent.id, "Coalescing onto in-flight intent");
                metrics::record_trade_coalesced();
                existing.clone()
            } else {
                let (tx, rx) = watch::channel(None);
                inflight.insert(key.clone(), rx.clone());
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    let result = AssertUnwindSafe(this.execute(intent))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| {
                            tracing::error!(intent_id = %key.1, "Trade execution panicked");
                            Err(SubmitError::Internal("trade execution panicked".into()))
                        });
                    this.inflight.lock().remove(&key);
                    let _ = tx.send(Some(result));
                });
                rx
            }
        };

        let shared = outcome
            .wait_for(Option::is_some)
            .await
            .map_err(|_| SubmitError::Internal("execution task ended without an outcome".into()))?
            .clone();
        shared.unwrap_or_else(|| Err(SubmitError::Internal("missing execution outcome".into())))
    }

    #[tracing::instrument(
        skip(self, intent),
        fields(intent_id = %intent.id, account_id = %intent.account_id, action = %intent.action)
    )]
    async fn execute(&self, intent: TradeIntent) -> Result<TradeOutcome, SubmitError> {
        let started = Instant::now();
        let action = intent.action;
        let result = self.run_protocol(intent).await;

        let label = match &result {
            Ok(_) => "committed",
            Err(err) => err.outcome_label(),
        };
        metrics::record_trade_outcome(action, label, started.elapsed());
        match &result {
            Ok(outcome) => tracing::info!(trade_id = %outcome.trade_id, "Trade committed"),
            Err(err) => tracing::warn!(error = %err, "Trade not committed"),
        }
        result
    }

    async fn run_protocol(&self, mut intent: TradeIntent) -> Result<TradeOutcome, SubmitError> {
        if let Some(recorded) = self.store.find_intent(&intent.id).await? {
            if recorded.account_id != intent.account_id {
                return Err(id_in_use(&intent.id));
            }
            return self.recorded_outcome(&recorded);
        }

        if intent.action != TradeAction::Open {
            let trade = self
                .store
                .find_trade(&intent.trade_id)
                .await?
                .filter(|t| t.account_id == intent.account_id && t.is_open())
                .ok_or_else(|| SubmitError::TradeNotFound(intent.trade_id.clone()))?;
            intent.remote_ref = trade.remote_ref;
            intent.instrument = Some(trade.instrument);
            intent.side = Some(trade.side);
            if intent.action == TradeAction::Close {
                intent.size = Some(trade.size);
            }
        }

        self.store.stage(&intent).await.map_err(|err| match err {
            // Lost a race with another account staging the same id.
            StoreError::Duplicate(id) => id_in_use(&id),
            other => other.into(),
        })?;

        let key = trade_key(&intent.account_id);
        if let RateDecision::Denied { retry_after } = self.limiter.allow(&key, self.config.trade_limit).await {
            self.discard(&intent).await;
            return Err(SubmitError::RateLimited { retry_after });
        }

        if self
            .router
            .registry()
            .connector_for_account(&intent.account_id)
            .is_none()
        {
            self.discard(&intent).await;
            return Err(offline(&intent.account_id));
        }

        if let Err(err) = self.mark_sent(&mut intent).await {
            self.discard(&intent).await;
            return Err(err);
        }

        let correlation_id = CorrelationId::generate();
        let waiter = self.pending.register(
            correlation_id.clone(),
            intent.account_id.clone(),
            intent.id.clone(),
        );

        let command = command_envelope(&intent, correlation_id.clone());
        if let Err(err) = self.router.send_to_connector(&intent.account_id, command) {
            self.pending.cancel(&correlation_id);
            self.discard(&intent).await;
            return Err(match err {
                RouterError::QueueFull => {
                    SubmitError::ConnectorOffline(format!("connector for account {} is not accepting commands", intent.account_id))
                }
                RouterError::ConnectorOffline(_) | RouterError::SessionGone => offline(&intent.account_id),
            });
        }
        tracing::debug!(correlation_id = %correlation_id, "Command sent to connector");

        match tokio::time::timeout(self.config.deadline, waiter).await {
            Ok(Ok(result)) if result.success => self.finish_success(intent, result.ticket).await,
            Ok(Ok(result)) => {
                let message = result
                    .error
                    .unwrap_or_else(|| "rejected by terminal".to_string());
                self.finish_failure(intent, SubmitError::Rejected(message)).await
            }
            Ok(Err(_)) | Err(_) => {
                self.pending.cancel(&correlation_id);
                self.finish_failure(intent, SubmitError::Timeout(self.config.deadline))
                    .await
            }
        }
    }

    async fn mark_sent(&self, intent: &mut TradeIntent) -> Result<(), SubmitError> {
        intent.mark_sent()?;
        self.store.update_intent(intent).await?;
        Ok(())
    }

    async fn finish_success(
        &self,
        mut intent: TradeIntent,
        ticket: Option<RemoteRef>,
    ) -> Result<TradeOutcome, SubmitError> {
        intent.confirm(ticket)?;
        let mut committed = intent.clone();
        committed.commit()?;
        match self.store.commit(&committed).await {
            Ok(_) => {
                self.publish(&committed).await;
                Ok(TradeOutcome::from_intent(&committed))
            }
            Err(err) => {
                // The terminal executed but the books did not take it: keep
                // the intent for audit and let the next sync surface the gap.
                tracing::error!(error = %err, "Commit failed after terminal confirmation");
                let detail = format!("commit failed after execution: {err}");
                intent.abandon(ErrorCode::Internal, detail.clone())?;
                self.reconciliation.register_timeout(&intent);
                self.router.request_sync(&intent.account_id);
                self.persist_rollback(&intent).await?;
                self.publish(&intent).await;
                Err(SubmitError::Internal(detail))
            }
        }
    }

    async fn finish_failure(
        &self,
        mut intent: TradeIntent,
        error: SubmitError,
    ) -> Result<TradeOutcome, SubmitError> {
        let message = match &error {
            SubmitError::Rejected(message) => message.clone(),
            other => other.to_string(),
        };
        intent.reject(error.code(), message)?;
        intent.roll_back()?;
        let recorded = self.persist_rollback(&intent).await;

        // An unrecorded rollback leaves the books unsure, same as a timeout.
        if matches!(error, SubmitError::Timeout(_)) || recorded.is_err() {
            self.reconciliation.register_timeout(&intent);
            self.router.request_sync(&intent.account_id);
        }
        recorded?;

        self.publish(&intent).await;
        Err(error)
    }

    /// Record a rolled-back intent, retrying transient store failures.
    async fn persist_rollback(&self, intent: &TradeIntent) -> Result<(), SubmitError> {
        let mut attempt = 1;
        loop {
            match self.store.roll_back(intent).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < ROLLBACK_ATTEMPTS => {
                    tracing::warn!(attempt, error = %err, "Rollback not recorded, retrying");
                    tokio::time::sleep(ROLLBACK_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(err) => {
                    tracing::error!(attempts = attempt, error = %err, "Failed to record rollback");
                    return Err(SubmitError::Internal(format!("rollback not recorded: {err}")));
                }
            }
        }
    }

    async fn discard(&self, intent: &TradeIntent) {
        debug_assert!(IntentLifecycle::is_discardable(intent.state));
        if let Err(err) = self.store.discard(&intent.id).await {
            tracing::error!(intent_id = %intent.id, error = %err, "Failed to discard staged intent");
        }
    }

    async fn publish(&self, intent: &TradeIntent) {
        let update = Envelope::TradeUpdate(TradeUpdatePayload {
            account_id: intent.account_id.clone(),
            intent_id: intent.id.clone(),
            trade_id: intent.trade_id.clone(),
            action: intent.action,
            state: intent.state,
            ticket: intent.remote_ref.clone(),
            instrument: intent.instrument.clone(),
            error_code: intent.failure.as_ref().map(|f| f.code),
            error: intent.failure.as_ref().map(|f| f.message.clone()),
        });
        let report = self.router.fan_out(&intent.account_id, &update).await;
        tracing::debug!(
            delivered = report.delivered,
            disconnected = report.disconnected,
            state = %intent.state,
            "Trade update published"
        );
    }

    fn recorded_outcome(&self, recorded: &TradeIntent) -> Result<TradeOutcome, SubmitError> {
        tracing::info!(intent_id = %recorded.id, state = %recorded.state, "Returning recorded outcome");
        match recorded.state {
            IntentState::Committed => Ok(TradeOutcome::from_intent(recorded)),
            IntentState::RolledBack => {
                let failure = recorded.failure.as_ref();
                match failure.map(|f| f.code) {
                    Some(ErrorCode::ExecutionTimeout) => Err(SubmitError::Timeout(self.config.deadline)),
                    Some(ErrorCode::Internal) => Err(SubmitError::Internal(
                        failure.map_or_else(String::new, |f| f.message.clone()),
                    )),
                    _ => Err(SubmitError::Rejected(
                        failure.map_or_else(|| "rejected by terminal".to_string(), |f| f.message.clone()),
                    )),
                }
            }
            state => Err(SubmitError::Internal(format!(
                "intent {} is {state} with no execution in flight",
                recorded.id
            ))),
        }
    }
}

fn id_in_use(id: &IntentId) -> SubmitError {
    SubmitError::Invalid(format!("intent id {id} is already in use"))
}

fn offline(account: &AccountId) -> SubmitError {
    SubmitError::ConnectorOffline(format!("no live connector for account {account}"))
}

fn command_envelope(intent: &TradeIntent, correlation_id: CorrelationId) -> Envelope {
    let payload = TradeCommandPayload {
        correlation_id,
        intent_id: intent.id.clone(),
        instrument: intent.instrument.clone(),
        side: intent.side,
        size: intent.size,
        stop_loss: intent.stop_loss,
        take_profit: intent.take_profit,
        ticket: intent.remote_ref.clone(),
    };
    match intent.action {
        TradeAction::Open => Envelope::TradeOpen(payload),
        TradeAction::Close => Envelope::TradeClose(payload),
        TradeAction::Modify => Envelope::TradeModify(payload),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::application::ports::MockTradeStore;
    use crate::application::services::outbox::OutboxReceiver;
    use crate::application::services::registry::{
        ClientRegistration, ConnectorRegistration, SessionRegistry, SharedRegistry,
    };
    use crate::application::services::router::RouterConfig;
    use crate::domain::envelope::TradeResultPayload;
    use crate::domain::identity::{ConnectionId, RemoteRef, UserId};
    use crate::domain::session::{Capability, SessionHandle};
    use crate::domain::trade::{Side, TradeRecord};
    use crate::infrastructure::persistence::InMemoryTradeStore;
    use crate::infrastructure::rate_limit::LocalWindowStore;

    struct Fixture<S: TradeStore + 'static = InMemoryTradeStore> {
        coordinator: Arc<TradeExecutionCoordinator<S>>,
        registry: SharedRegistry,
        pending: Arc<PendingResults>,
        store: Arc<S>,
        reconciliation: Arc<ReconciliationTracker>,
    }

    fn fixture(config: CoordinatorConfig) -> Fixture {
        fixture_with(Arc::new(InMemoryTradeStore::new()), config)
    }

    fn fixture_with<S: TradeStore + 'static>(store: Arc<S>, config: CoordinatorConfig) -> Fixture<S> {
        let registry = Arc::new(SessionRegistry::new(16));
        let pending = Arc::new(PendingResults::new());
        let reconciliation = Arc::new(ReconciliationTracker::new(store.clone()));
        let router = Arc::new(MessageRouter::new(
            Arc::clone(&registry),
            Arc::clone(&pending),
            Arc::clone(&reconciliation),
            RouterConfig::default(),
        ));
        let limiter = RateLimiter::new(Arc::new(LocalWindowStore::new()));
        let coordinator = Arc::new(TradeExecutionCoordinator::new(
            Arc::clone(&store),
            router,
            Arc::clone(&pending),
            limiter,
            Arc::clone(&reconciliation),
            config,
        ));
        Fixture {
            coordinator,
            registry,
            pending,
            store,
            reconciliation,
        }
    }

    fn connect(registry: &SessionRegistry, account: &str) -> (SessionHandle, OutboxReceiver) {
        registry
            .register_connector(ConnectorRegistration {
                connection_id: ConnectionId::new(format!("conn-{account}")),
                account_id: AccountId::new(account),
                broker: None,
                capability: Capability::Streaming,
            })
            .unwrap()
    }

    fn observe(registry: &SessionRegistry, account: &str) -> (SessionHandle, OutboxReceiver) {
        registry
            .register_client(ClientRegistration {
                user_id: UserId::new("u"),
                accounts: [AccountId::new(account)].into_iter().collect(),
                claimed_connections: Vec::new(),
                capability: Capability::Streaming,
            })
            .unwrap()
    }

    fn open_intent(account: &str) -> TradeIntent {
        TradeIntent::open(AccountId::new(account), "EURUSD", Side::Buy, dec!(0.1))
    }

    /// Answers every trade command on the connector outbox with `reply`.
    fn spawn_terminal(
        mut rx: OutboxReceiver,
        account: &str,
        pending: Arc<PendingResults>,
        reply: impl Fn(&TradeCommandPayload) -> TradeResultPayload + Send + 'static,
    ) -> Arc<AtomicUsize> {
        let commands = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&commands);
        let account = AccountId::new(account);
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let command = match envelope {
                    Envelope::TradeOpen(c) | Envelope::TradeClose(c) | Envelope::TradeModify(c) => c,
                    _ => continue,
                };
                seen.fetch_add(1, Ordering::SeqCst);
                let _ = pending.complete(&account, reply(&command));
            }
        });
        commands
    }

    fn filled(ticket: &'static str) -> impl Fn(&TradeCommandPayload) -> TradeResultPayload {
        move |command| TradeResultPayload {
            correlation_id: command.correlation_id.clone(),
            success: true,
            ticket: Some(RemoteRef::new(ticket)),
            error: None,
            account_id: None,
        }
    }

    #[tokio::test]
    async fn success_commits_and_notifies_observers() {
        let fx = fixture(CoordinatorConfig::default());
        let (_conn, conn_rx) = connect(&fx.registry, "A");
        let (_client, mut client_rx) = observe(&fx.registry, "A");
        spawn_terminal(conn_rx, "A", Arc::clone(&fx.pending), filled("555"));

        let outcome = fx.coordinator.submit(open_intent("A")).await.unwrap();
        assert_eq!(outcome.state, IntentState::Committed);
        assert_eq!(outcome.remote_ref, Some(RemoteRef::new("555")));

        let trade = fx.store.find_trade(&outcome.trade_id).await.unwrap().unwrap();
        assert!(trade.is_open());
        assert_eq!(trade.remote_ref, Some(RemoteRef::new("555")));

        let Some(Envelope::TradeUpdate(update)) = client_rx.recv().await else {
            panic!("expected TRADE_UPDATE");
        };
        assert_eq!(update.state, IntentState::Committed);
        assert_eq!(update.intent_id, outcome.intent_id);
    }

    #[tokio::test]
    async fn offline_connector_leaves_nothing_behind() {
        let fx = fixture(CoordinatorConfig::default());
        let intent = open_intent("A");
        let id = intent.id.clone();

        let err = fx.coordinator.submit(intent).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConnectorOffline);
        assert!(fx.store.find_intent(&id).await.unwrap().is_none());
        assert!(fx.store.trades(&AccountId::new("A")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejection_rolls_back() {
        let fx = fixture(CoordinatorConfig::default());
        let (_conn, conn_rx) = connect(&fx.registry, "A");
        let (_client, mut client_rx) = observe(&fx.registry, "A");
        spawn_terminal(conn_rx, "A", Arc::clone(&fx.pending), |command| TradeResultPayload {
            correlation_id: command.correlation_id.clone(),
            success: false,
            ticket: None,
            error: Some("insufficient margin".into()),
            account_id: None,
        });

        let intent = open_intent("A");
        let id = intent.id.clone();
        let err = fx.coordinator.submit(intent).await.unwrap_err();
        assert_eq!(err, SubmitError::Rejected("insufficient margin".into()));

        let recorded = fx.store.find_intent(&id).await.unwrap().unwrap();
        assert_eq!(recorded.state, IntentState::RolledBack);
        assert!(fx.store.trades(&AccountId::new("A")).await.unwrap().is_empty());

        let Some(Envelope::TradeUpdate(update)) = client_rx.recv().await else {
            panic!("expected TRADE_UPDATE");
        };
        assert_eq!(update.state, IntentState::RolledBack);
        assert_eq!(update.error_code, Some(ErrorCode::ExecutionRejected));
        assert_eq!(update.error.as_deref(), Some("insufficient margin"));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_rolls_back_and_registers_reconciliation() {
        let fx = fixture(CoordinatorConfig {
            deadline: Duration::from_secs(5),
            ..CoordinatorConfig::default()
        });
        let (_conn, mut conn_rx) = connect(&fx.registry, "A");

        let intent = open_intent("A");
        let id = intent.id.clone();
        let err = fx.coordinator.submit(intent).await.unwrap_err();
        assert_eq!(err, SubmitError::Timeout(Duration::from_secs(5)));

        let recorded = fx.store.find_intent(&id).await.unwrap().unwrap();
        assert_eq!(recorded.state, IntentState::RolledBack);
        assert!(fx.reconciliation.has_pending(&AccountId::new("A")));
        assert!(fx.pending.is_empty());

        assert!(matches!(conn_rx.recv().await, Some(Envelope::TradeOpen(_))));
        assert!(matches!(conn_rx.recv().await, Some(Envelope::SyncRequest(_))));
    }

    #[tokio::test]
    async fn duplicate_in_flight_submit_coalesces() {
        let fx = fixture(CoordinatorConfig::default());
        let (_conn, mut conn_rx) = connect(&fx.registry, "A");
        let pending = Arc::clone(&fx.pending);
        let commands = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&commands);
        tokio::spawn(async move {
            while let Some(envelope) = conn_rx.recv().await {
                if let Envelope::TradeOpen(command) = envelope {
                    seen.fetch_add(1, Ordering::SeqCst);
                    // Give the second caller time to arrive while SENT.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    let _ = pending.complete(&AccountId::new("A"), filled("777")(&command));
                }
            }
        });

        let intent = open_intent("A");
        let (first, second) = tokio::join!(
            fx.coordinator.submit(intent.clone()),
            fx.coordinator.submit(intent)
        );

        assert_eq!(first.unwrap(), second.unwrap());
        assert_eq!(commands.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn finalized_intent_returns_recorded_outcome() {
        let fx = fixture(CoordinatorConfig::default());
        let (_conn, conn_rx) = connect(&fx.registry, "A");
        let commands = spawn_terminal(conn_rx, "A", Arc::clone(&fx.pending), filled("1"));

        let intent = open_intent("A");
        let first = fx.coordinator.submit(intent.clone()).await.unwrap();
        let again = fx.coordinator.submit(intent).await.unwrap();

        assert_eq!(first, again);
        assert_eq!(commands.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_requires_open_trade_of_same_account() {
        let fx = fixture(CoordinatorConfig::default());
        let (_conn, conn_rx) = connect(&fx.registry, "A");
        spawn_terminal(conn_rx, "A", Arc::clone(&fx.pending), filled("9"));

        let missing = TradeIntent::close(AccountId::new("A"), TradeId::new("nope"));
        let err = fx.coordinator.submit(missing).await.unwrap_err();
        assert_eq!(err, SubmitError::TradeNotFound(TradeId::new("nope")));

        let opened = fx.coordinator.submit(open_intent("A")).await.unwrap();
        let foreign = TradeIntent::close(AccountId::new("B"), opened.trade_id.clone());
        assert!(matches!(
            fx.coordinator.submit(foreign).await,
            Err(SubmitError::TradeNotFound(_))
        ));

        let close = TradeIntent::close(AccountId::new("A"), opened.trade_id.clone());
        fx.coordinator.submit(close).await.unwrap();
        let trade = fx.store.find_trade(&opened.trade_id).await.unwrap().unwrap();
        assert!(!trade.is_open());
    }

    #[tokio::test]
    async fn rate_limit_discards_staged_intent() {
        let fx = fixture(CoordinatorConfig {
            trade_limit: RateLimit::new(1, Duration::from_secs(60)),
            ..CoordinatorConfig::default()
        });
        let (_conn, conn_rx) = connect(&fx.registry, "A");
        spawn_terminal(conn_rx, "A", Arc::clone(&fx.pending), filled("2"));

        fx.coordinator.submit(open_intent("A")).await.unwrap();

        let intent = open_intent("A");
        let id = intent.id.clone();
        let err = fx.coordinator.submit(intent).await.unwrap_err();
        assert!(matches!(err, SubmitError::RateLimited { .. }));
        assert!(fx.store.find_intent(&id).await.unwrap().is_none());

        let bridge = BridgeError::from(err);
        assert_eq!(bridge.code(), ErrorCode::RateLimited);
        assert!(bridge.retry_after().is_some());
    }

    #[tokio::test]
    async fn intent_id_is_scoped_to_its_account() {
        let fx = fixture(CoordinatorConfig::default());
        let (_a, a_rx) = connect(&fx.registry, "A");
        let (_b, b_rx) = connect(&fx.registry, "B");
        let a_cmds = spawn_terminal(a_rx, "A", Arc::clone(&fx.pending), filled("555"));
        let b_cmds = spawn_terminal(b_rx, "B", Arc::clone(&fx.pending), filled("556"));
        let shared = IntentId::new("shared-id");

        let a = fx
            .coordinator
            .submit(open_intent("A").with_id(shared.clone()))
            .await
            .unwrap();
        assert_eq!(a.account_id, AccountId::new("A"));

        let err = fx
            .coordinator
            .submit(open_intent("B").with_id(shared))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidRequest);
        assert!(fx.store.trades(&AccountId::new("B")).await.unwrap().is_empty());
        assert_eq!(a_cmds.load(Ordering::SeqCst), 1);
        assert_eq!(b_cmds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn foreign_submit_does_not_join_in_flight_intent() {
        let fx = fixture(CoordinatorConfig::default());
        let (_a, mut a_rx) = connect(&fx.registry, "A");
        let (_b, b_rx) = connect(&fx.registry, "B");
        let b_cmds = spawn_terminal(b_rx, "B", Arc::clone(&fx.pending), filled("2"));
        let pending = Arc::clone(&fx.pending);
        tokio::spawn(async move {
            while let Some(envelope) = a_rx.recv().await {
                if let Envelope::TradeOpen(command) = envelope {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    let _ = pending.complete(&AccountId::new("A"), filled("1")(&command));
                }
            }
        });
        let shared = IntentId::new("shared-id");

        let (a, b) = tokio::join!(
            fx.coordinator.submit(open_intent("A").with_id(shared.clone())),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                fx.coordinator.submit(open_intent("B").with_id(shared.clone())).await
            }
        );

        assert_eq!(a.unwrap().account_id, AccountId::new("A"));
        assert!(matches!(b, Err(SubmitError::Invalid(_))));
        assert_eq!(b_cmds.load(Ordering::SeqCst), 0);
    }

    /// Store accepting everything up to the commit, which always fails.
    fn store_failing_commit() -> MockTradeStore {
        let mut store = MockTradeStore::new();
        store.expect_find_intent().returning(|_| Ok(None));
        store.expect_stage().returning(|_| Ok(()));
        store.expect_update_intent().returning(|_| Ok(()));
        store
            .expect_commit()
            .returning(|_| Err(StoreError::Unavailable("disk full".into())));
        store
    }

    #[tokio::test]
    async fn commit_failure_records_final_rollback() {
        let mut store = store_failing_commit();
        let recorded = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&recorded);
        store.expect_roll_back().times(1).returning(move |intent| {
            *sink.lock() = Some(intent.clone());
            Ok(())
        });
        let fx = fixture_with(Arc::new(store), CoordinatorConfig::default());
        let (_conn, conn_rx) = connect(&fx.registry, "A");
        let (_client, mut client_rx) = observe(&fx.registry, "A");
        spawn_terminal(conn_rx, "A", Arc::clone(&fx.pending), filled("555"));

        let err = fx.coordinator.submit(open_intent("A")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Internal);

        let stored = recorded.lock().clone().unwrap();
        assert_eq!(stored.state, IntentState::RolledBack);
        assert_eq!(stored.remote_ref, Some(RemoteRef::new("555")));
        assert_eq!(stored.failure.map(|f| f.code), Some(ErrorCode::Internal));
        assert!(fx.reconciliation.has_pending(&AccountId::new("A")));

        let Some(Envelope::TradeUpdate(update)) = client_rx.recv().await else {
            panic!("expected TRADE_UPDATE");
        };
        assert_eq!(update.state, IntentState::RolledBack);
    }

    #[tokio::test(start_paused = true)]
    async fn rollback_write_is_retried() {
        let mut store = store_failing_commit();
        let mut seq = mockall::Sequence::new();
        store
            .expect_roll_back()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(StoreError::Unavailable("busy".into())));
        store
            .expect_roll_back()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|intent| intent.state == IntentState::RolledBack)
            .returning(|_| Ok(()));
        let fx = fixture_with(Arc::new(store), CoordinatorConfig::default());
        let (_conn, conn_rx) = connect(&fx.registry, "A");
        spawn_terminal(conn_rx, "A", Arc::clone(&fx.pending), |command| TradeResultPayload {
            correlation_id: command.correlation_id.clone(),
            success: false,
            ticket: None,
            error: Some("market closed".into()),
            account_id: None,
        });

        let err = fx.coordinator.submit(open_intent("A")).await.unwrap_err();
        assert_eq!(err, SubmitError::Rejected("market closed".into()));
        assert!(!fx.reconciliation.has_pending(&AccountId::new("A")));
    }

    #[tokio::test(start_paused = true)]
    async fn unrecorded_rollback_is_surfaced() {
        let mut store = store_failing_commit();
        store
            .expect_roll_back()
            .times(ROLLBACK_ATTEMPTS as usize)
            .returning(|_| Err(StoreError::Unavailable("gone".into())));
        let fx = fixture_with(Arc::new(store), CoordinatorConfig::default());
        let (_conn, conn_rx) = connect(&fx.registry, "A");
        spawn_terminal(conn_rx, "A", Arc::clone(&fx.pending), |command| TradeResultPayload {
            correlation_id: command.correlation_id.clone(),
            success: false,
            ticket: None,
            error: Some("market closed".into()),
            account_id: None,
        });

        let err = fx.coordinator.submit(open_intent("A")).await.unwrap_err();
        assert!(matches!(err, SubmitError::Internal(ref m) if m.contains("rollback not recorded")));
        assert!(fx.reconciliation.has_pending(&AccountId::new("A")));
    }

    /// In-memory store whose first intent lookup panics.
    #[derive(Default)]
    struct PanickyStore {
        inner: InMemoryTradeStore,
        exploded: AtomicBool,
    }

    #[async_trait]
    impl TradeStore for PanickyStore {
        async fn stage(&self, intent: &TradeIntent) -> Result<(), StoreError> {
            self.inner.stage(intent).await
        }
        async fn update_intent(&self, intent: &TradeIntent) -> Result<(), StoreError> {
            self.inner.update_intent(intent).await
        }
        async fn commit(&self, intent: &TradeIntent) -> Result<TradeRecord, StoreError> {
            self.inner.commit(intent).await
        }
        async fn roll_back(&self, intent: &TradeIntent) -> Result<(), StoreError> {
            self.inner.roll_back(intent).await
        }
        async fn discard(&self, id: &IntentId) -> Result<(), StoreError> {
            self.inner.discard(id).await
        }
        async fn find_intent(&self, id: &IntentId) -> Result<Option<TradeIntent>, StoreError> {
            if !self.exploded.swap(true, Ordering::SeqCst) {
                panic!("lookup exploded");
            }
            self.inner.find_intent(id).await
        }
        async fn find_trade(&self, id: &TradeId) -> Result<Option<TradeRecord>, StoreError> {
            self.inner.find_trade(id).await
        }
        async fn trades(&self, account: &AccountId) -> Result<Vec<TradeRecord>, StoreError> {
            self.inner.trades(account).await
        }
        async fn intents(&self, account: &AccountId) -> Result<Vec<TradeIntent>, StoreError> {
            self.inner.intents(account).await
        }
    }

    #[tokio::test]
    async fn panicking_execution_frees_the_intent() {
        let fx = fixture_with(Arc::new(PanickyStore::default()), CoordinatorConfig::default());
        let (_conn, conn_rx) = connect(&fx.registry, "A");
        let commands = spawn_terminal(conn_rx, "A", Arc::clone(&fx.pending), filled("8"));
        let intent = open_intent("A");

        let err = fx.coordinator.submit(intent.clone()).await.unwrap_err();
        assert_eq!(err, SubmitError::Internal("trade execution panicked".into()));
        assert_eq!(fx.coordinator.inflight(), 0);

        let outcome = fx.coordinator.submit(intent).await.unwrap();
        assert_eq!(outcome.state, IntentState::Committed);
        assert_eq!(commands.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn command_maps_to_intent() {
        let command = SendTradeCommandPayload {
            account_id: AccountId::new("A"),
            action: TradeAction::Open,
            intent_id: Some(IntentId::new("fixed")),
            trade_id: None,
            instrument: Some("EURUSD".into()),
            side: Some(Side::Sell),
            size: Some(dec!(1)),
            stop_loss: Some(dec!(1.2)),
            take_profit: None,
        };
        let intent = intent_from_command(command).unwrap();
        assert_eq!(intent.id, IntentId::new("fixed"));
        assert_eq!(intent.side, Some(Side::Sell));
        assert_eq!(intent.stop_loss, Some(dec!(1.2)));
    }

    #[test]
    fn incomplete_command_is_invalid() {
        let command = SendTradeCommandPayload {
            account_id: AccountId::new("A"),
            action: TradeAction::Close,
            intent_id: None,
            trade_id: None,
            instrument: None,
            side: None,
            size: None,
            stop_loss: None,
            take_profit: None,
        };
        assert!(matches!(intent_from_command(command), Err(SubmitError::Invalid(_))));
    }
}
