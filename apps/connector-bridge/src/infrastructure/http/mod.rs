//! Public HTTP Surface
//!
//! One listener serves the WebSocket channels and the REST API.
//!
//! # Endpoints
//!
//! - `GET /ws/connector` - Connector channel
//! - `GET /ws/client` - Client channel
//! - `POST /v1/trades` - Submit a trade and wait for its outcome
//! - `GET /v1/accounts/{account}/trades` - Committed trades
//! - `GET /v1/accounts/{account}/intents` - Intent audit trail
//! - `GET /v1/connections` - Connector status
//! - `GET /v1/reconciliation/conflicts` - Unresolved conflicts
//! - `POST /v1/reconciliation/conflicts/{id}/resolve` - Manual resolution
//! - `POST /v1/poll-sessions` - Register a polling client
//! - `GET /v1/poll-sessions/{id}/events` - Drain queued envelopes
//! - `DELETE /v1/poll-sessions/{id}` - End a polling client

mod error;
mod poll;
mod rest;
mod state;

use axum::Router;
use axum::routing::{delete, get, post};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub use error::ApiError;
pub use poll::{PollError, PollSessions};
pub use rest::{CreatePollSession, PollBatch, PollSessionCreated};
pub use state::{AppState, Caller, SharedCoordinator};

use crate::infrastructure::websocket;

/// WebSocket and REST routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws/connector", get(websocket::connector_ws))
        .route("/ws/client", get(websocket::client_ws))
        .route("/v1/trades", post(rest::submit_trade))
        .route("/v1/accounts/{account}/trades", get(rest::list_trades))
        .route("/v1/accounts/{account}/intents", get(rest::list_intents))
        .route("/v1/connections", get(rest::list_connections))
        .route("/v1/reconciliation/conflicts", get(rest::list_conflicts))
        .route(
            "/v1/reconciliation/conflicts/{id}/resolve",
            post(rest::resolve_conflict),
        )
        .route("/v1/poll-sessions", post(rest::create_poll_session))
        .route("/v1/poll-sessions/{id}/events", get(rest::poll_events))
        .route("/v1/poll-sessions/{id}", delete(rest::delete_poll_session))
        .with_state(state)
}

/// Serves [`router`] until cancelled.
pub struct HttpServer {
    addr: String,
    state: AppState,
    cancel: CancellationToken,
}

impl HttpServer {
    /// Create a server bound to `addr` (`host:port`).
    #[must_use]
    pub fn new(addr: impl Into<String>, state: AppState, cancel: CancellationToken) -> Self {
        Self {
            addr: addr.into(),
            state,
            cancel,
        }
    }

    /// Run until cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`HttpServerError`] if binding fails or the server stops
    /// with an I/O error.
    pub async fn run(self) -> Result<(), HttpServerError> {
        let listener = TcpListener::bind(&self.addr)
            .await
            .map_err(|e| HttpServerError::BindFailed(self.addr.clone(), e.to_string()))?;
        self.serve(listener).await
    }

    /// Run on an already bound listener.
    ///
    /// # Errors
    ///
    /// Returns [`HttpServerError::ServerFailed`] on a fatal I/O error.
    pub async fn serve(self, listener: TcpListener) -> Result<(), HttpServerError> {
        let local = listener.local_addr().map_or_else(|_| self.addr.clone(), |a| a.to_string());
        tracing::info!(addr = %local, "Bridge server listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HttpServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Bridge server stopped");
        Ok(())
    }
}

/// Bridge server error.
#[derive(Debug, thiserror::Error)]
pub enum HttpServerError {
    /// Failed to bind to address.
    #[error("failed to bind bridge server to {0}: {1}")]
    BindFailed(String, String),

    /// Server failed during operation.
    #[error("bridge server failed: {0}")]
    ServerFailed(String),
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::header::{AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
    use axum::http::{Request, StatusCode};
    use axum::response::Response;
    use tower::ServiceExt;

    use super::*;
    use crate::application::services::ConnectorRegistration;
    use crate::domain::identity::{AccountId, ConnectionId, UserId};
    use crate::domain::rate_limit::RateLimit;
    use crate::domain::session::{Capability, ConnectionStatus};
    use crate::infrastructure::auth::StaticTokenAuthenticator;
    use crate::infrastructure::config::BridgeConfig;
    use crate::infrastructure::persistence::InMemoryTradeStore;
    use crate::infrastructure::rate_limit::LocalWindowStore;

    fn state_with(config: &BridgeConfig) -> AppState {
        let auth = StaticTokenAuthenticator::default()
            .with_connector("conn-token", AccountId::new("ACC-1"))
            .with_user("alice-token", UserId::new("alice"), [AccountId::new("ACC-1")]);
        AppState::assemble(
            config,
            Arc::new(auth),
            Arc::new(LocalWindowStore::new()),
            Arc::new(InMemoryTradeStore::new()),
        )
    }

    fn state() -> AppState {
        state_with(&BridgeConfig::default())
    }

    fn get(uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    fn send(method: &str, uri: &str, token: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn rejects_missing_token() {
        let response = router(state())
            .oneshot(get("/v1/connections", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn rejects_connector_token_on_rest() {
        let response = router(state())
            .oneshot(get("/v1/connections", Some("conn-token")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn forbids_foreign_accounts() {
        let response = router(state())
            .oneshot(get("/v1/accounts/ACC-2/trades", Some("alice-token")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn trade_without_connector_is_unavailable() {
        let body = r#"{"account_id":"ACC-1","action":"open","instrument":"EURUSD","side":"BUY","size":"0.1"}"#;
        let response = router(state())
            .oneshot(send("POST", "/v1/trades", "alice-token", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn exhausted_window_returns_retry_after() {
        let mut config = BridgeConfig::default();
        config.rate_limit.api_limit = RateLimit::new(1, Duration::from_secs(60));
        let app = router(state_with(&config));

        let first = app
            .clone()
            .oneshot(get("/v1/connections", Some("alice-token")))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app
            .oneshot(get("/v1/connections", Some("alice-token")))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(second.headers().contains_key(RETRY_AFTER));
    }

    #[tokio::test]
    async fn lists_live_connectors() {
        let state = state();
        state
            .registry
            .register_connector(ConnectorRegistration {
                connection_id: ConnectionId::new("mt5-1"),
                account_id: AccountId::new("ACC-1"),
                broker: Some("demo".into()),
                capability: Capability::Streaming,
            })
            .unwrap();

        let response = router(state)
            .oneshot(get("/v1/connections", Some("alice-token")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let statuses: Vec<ConnectionStatus> = json(response).await;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].connection_id, ConnectionId::new("mt5-1"));
    }

    #[tokio::test]
    async fn poll_session_lifecycle() {
        let state = state();
        let app = router(state.clone());

        let created = app
            .clone()
            .oneshot(send("POST", "/v1/poll-sessions", "alice-token", "{}"))
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);
        let created: PollSessionCreated = json(created).await;
        assert_eq!(state.registry.client_count(), 1);

        let uri = format!("/v1/poll-sessions/{}/events", created.session_id);
        let events = app
            .clone()
            .oneshot(get(&uri, Some("alice-token")))
            .await
            .unwrap();
        assert_eq!(events.status(), StatusCode::OK);
        let batch: PollBatch = json(events).await;
        assert!(batch.events.is_empty());

        let deleted = app
            .clone()
            .oneshot(send(
                "DELETE",
                &format!("/v1/poll-sessions/{}", created.session_id),
                "alice-token",
                "",
            ))
            .await
            .unwrap();
        assert_eq!(deleted.status(), StatusCode::NO_CONTENT);
        assert_eq!(state.registry.client_count(), 0);

        let gone = app.oneshot(get(&uri, Some("alice-token"))).await.unwrap();
        assert_eq!(gone.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn poll_session_refuses_foreign_claims() {
        let state = state();
        state
            .registry
            .register_connector(ConnectorRegistration {
                connection_id: ConnectionId::new("other"),
                account_id: AccountId::new("ACC-2"),
                broker: None,
                capability: Capability::Streaming,
            })
            .unwrap();

        let response = router(state)
            .oneshot(send(
                "POST",
                "/v1/poll-sessions",
                "alice-token",
                r#"{"connections":["other"]}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn resolving_unknown_conflict_is_not_found() {
        let response = router(state())
            .oneshot(send(
                "POST",
                "/v1/reconciliation/conflicts/42/resolve",
                "alice-token",
                "",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
