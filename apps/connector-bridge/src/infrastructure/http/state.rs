//! Shared state for the HTTP and WebSocket surface.

use std::collections::HashSet;
use std::sync::Arc;

use axum::http::HeaderMap;

use super::error::ApiError;
use super::poll::PollSessions;
use crate::application::ports::{Authenticator, TradeStore, WindowStore};
use crate::application::services::{
    CoordinatorConfig, MessageRouter, PendingResults, RateLimiter, ReconciliationTracker,
    RouterConfig, SessionRegistry, SharedRegistry, TradeExecutionCoordinator, api_key,
};
use crate::domain::identity::{AccountId, UserId};
use crate::domain::rate_limit::{RateDecision, RateLimit};
use crate::infrastructure::auth::bearer_token;
use crate::infrastructure::config::{BridgeConfig, SessionSettings};

/// Coordinator over a type-erased trade store.
pub type SharedCoordinator = Arc<TradeExecutionCoordinator<dyn TradeStore>>;

/// Everything a request handler can reach.
#[derive(Clone)]
pub struct AppState {
    /// Live sessions.
    pub registry: SharedRegistry,
    /// Frame dispatch and delivery.
    pub router: Arc<MessageRouter>,
    /// Two-phase trade execution.
    pub coordinator: SharedCoordinator,
    /// Conflicts awaiting resolution.
    pub reconciliation: Arc<ReconciliationTracker>,
    /// Trade commands awaiting a connector result.
    pub pending: Arc<PendingResults>,
    /// Token resolution.
    pub auth: Arc<dyn Authenticator>,
    /// Limiter for REST callers.
    pub api_limiter: RateLimiter,
    /// Admission budget per REST caller.
    pub api_limit: RateLimit,
    /// Polling sessions and their queues.
    pub polls: Arc<PollSessions>,
    /// Keepalive and polling settings.
    pub session: SessionSettings,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("api_limit", &self.api_limit)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

/// An authenticated REST caller.
#[derive(Debug, Clone)]
pub struct Caller {
    /// User id.
    pub user_id: UserId,
    /// Accounts the user may observe and trade.
    pub accounts: HashSet<AccountId>,
}

impl Caller {
    /// Fail unless the caller may act on `account`.
    ///
    /// # Errors
    ///
    /// Returns a 403 [`ApiError`] for foreign accounts.
    pub fn authorize(&self, account: &AccountId) -> Result<(), ApiError> {
        if self.accounts.contains(account) {
            Ok(())
        } else {
            Err(ApiError::forbidden(format!("not authorized for account {account}")))
        }
    }
}

impl AppState {
    /// Wire the registry, router and coordinator over the given stores.
    #[must_use]
    pub fn assemble(
        config: &BridgeConfig,
        auth: Arc<dyn Authenticator>,
        windows: Arc<dyn WindowStore>,
        trades: Arc<dyn TradeStore>,
    ) -> Self {
        let registry: SharedRegistry = Arc::new(SessionRegistry::new(config.session.outbox_capacity));
        let pending = Arc::new(PendingResults::new());
        let reconciliation = Arc::new(ReconciliationTracker::new(Arc::clone(&trades)));
        let router = Arc::new(MessageRouter::new(
            Arc::clone(&registry),
            Arc::clone(&pending),
            Arc::clone(&reconciliation),
            RouterConfig {
                critical_wait: config.session.critical_wait,
            },
        ));
        let limiter = RateLimiter::new(windows);
        let coordinator: SharedCoordinator = Arc::new(TradeExecutionCoordinator::new(
            trades,
            Arc::clone(&router),
            Arc::clone(&pending),
            limiter.clone(),
            Arc::clone(&reconciliation),
            CoordinatorConfig {
                deadline: config.execution.deadline,
                trade_limit: config.execution.trade_limit,
            },
        ));

        Self {
            registry,
            router,
            coordinator,
            reconciliation,
            pending,
            auth,
            api_limiter: limiter,
            api_limit: config.rate_limit.api_limit,
            polls: Arc::new(PollSessions::new()),
            session: config.session.clone(),
        }
    }

    /// Resolve the bearer token of a REST request to a user.
    ///
    /// # Errors
    ///
    /// Returns a 401 [`ApiError`] if the token is missing, unknown or
    /// belongs to a connector.
    pub fn caller(&self, headers: &HeaderMap) -> Result<Caller, ApiError> {
        let token = bearer_token(headers, None).map_err(ApiError::from)?;
        let (user_id, accounts) = self.auth.user(token).map_err(ApiError::from)?;
        Ok(Caller { user_id, accounts })
    }

    /// Resolve the caller and charge one request to its budget.
    ///
    /// # Errors
    ///
    /// Returns a 401 [`ApiError`] for bad credentials, or a 429 carrying
    /// `Retry-After` when the caller exhausted its window.
    pub async fn admit(&self, headers: &HeaderMap) -> Result<Caller, ApiError> {
        let caller = self.caller(headers)?;
        match self
            .api_limiter
            .allow(&api_key(caller.user_id.as_str()), self.api_limit)
            .await
        {
            RateDecision::Allowed { .. } => Ok(caller),
            RateDecision::Denied { retry_after } => Err(ApiError::rate_limited(retry_after)),
        }
    }
}
