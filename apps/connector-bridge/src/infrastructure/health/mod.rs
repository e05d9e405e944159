//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, session status reporting, and Prometheus metrics.
//! Used by container orchestrators, load balancers, and monitoring systems.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status
//! - `GET /healthz` - Kubernetes liveness check (simple OK)
//! - `GET /readyz` - Kubernetes readiness check (not shutting down)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{PendingResults, ReconciliationTracker, SharedRegistry};
use crate::domain::session::TerminalStatus;
use crate::infrastructure::metrics::get_metrics_handle;
use crate::infrastructure::rate_limit::FallbackWindowStore;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Bridge version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Live sessions.
    pub sessions: SessionCounts,
    /// Terminal status reported by live connectors.
    pub terminals: TerminalCounts,
    /// Trade commands awaiting a connector result.
    pub pending_results: usize,
    /// Reconciliation conflicts awaiting manual resolution.
    pub unresolved_conflicts: usize,
    /// Rate limiter store state.
    pub rate_limit: RateLimitStatus,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational.
    Healthy,
    /// Functional, but something needs attention.
    Degraded,
    /// Shutting down.
    Unhealthy,
}

/// Live session counts.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SessionCounts {
    /// Connector sessions.
    pub connectors: usize,
    /// Client sessions (streaming and polling).
    pub clients: usize,
}

/// Connector terminal states.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TerminalCounts {
    /// Terminal logged in to its broker.
    pub connected: usize,
    /// Terminal reported a lost broker connection.
    pub disconnected: usize,
    /// No status reported yet.
    pub unknown: usize,
}

/// Rate limiter store state.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStatus {
    /// Configured backend.
    pub backend: &'static str,
    /// Shared store unreachable; local windows in use.
    pub degraded: bool,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    registry: SharedRegistry,
    pending: Arc<PendingResults>,
    reconciliation: Arc<ReconciliationTracker>,
    backend: &'static str,
    fallback: Option<Arc<FallbackWindowStore>>,
    shutdown: CancellationToken,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(
        version: String,
        registry: SharedRegistry,
        pending: Arc<PendingResults>,
        reconciliation: Arc<ReconciliationTracker>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            registry,
            pending,
            reconciliation,
            backend: "local",
            fallback: None,
            shutdown,
        }
    }

    /// Report the shared rate-limit store's state.
    #[must_use]
    pub fn with_shared_store(mut self, fallback: Arc<FallbackWindowStore>) -> Self {
        self.backend = "shared";
        self.fallback = Some(fallback);
        self
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

/// Health routes.
pub fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    if state.shutdown.is_cancelled() {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    } else {
        (StatusCode::OK, "READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let statuses = state.registry.connection_statuses(None);
    let mut terminals = TerminalCounts::default();
    for status in &statuses {
        match status.terminal_status {
            TerminalStatus::Connected => terminals.connected += 1,
            TerminalStatus::Disconnected => terminals.disconnected += 1,
            TerminalStatus::Unknown => terminals.unknown += 1,
        }
    }

    let degraded = state
        .fallback
        .as_ref()
        .is_some_and(|store| store.is_degraded());
    let unresolved_conflicts = state.reconciliation.conflicts(None).len();

    HealthResponse {
        status: determine_health_status(state.shutdown.is_cancelled(), degraded, unresolved_conflicts),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        sessions: SessionCounts {
            connectors: statuses.len(),
            clients: state.registry.client_count(),
        },
        terminals,
        pending_results: state.pending.len(),
        unresolved_conflicts,
        rate_limit: RateLimitStatus {
            backend: state.backend,
            degraded,
        },
    }
}

const fn determine_health_status(
    shutting_down: bool,
    store_degraded: bool,
    unresolved_conflicts: usize,
) -> HealthStatus {
    if shutting_down {
        HealthStatus::Unhealthy
    } else if store_degraded || unresolved_conflicts > 0 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use test_case::test_case;
    use tower::ServiceExt;

    use super::*;
    use crate::application::services::SessionRegistry;
    use crate::infrastructure::persistence::InMemoryTradeStore;

    fn state(shutdown: CancellationToken) -> Arc<HealthServerState> {
        Arc::new(HealthServerState::new(
            "test".to_string(),
            Arc::new(SessionRegistry::new(8)),
            Arc::new(PendingResults::new()),
            Arc::new(ReconciliationTracker::new(Arc::new(InMemoryTradeStore::new()))),
            shutdown,
        ))
    }

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Degraded).unwrap(),
            "\"degraded\""
        );
    }

    #[test_case(false, false, 0 => HealthStatus::Healthy ; "all clear")]
    #[test_case(false, true, 0 => HealthStatus::Degraded ; "store degraded")]
    #[test_case(false, false, 2 => HealthStatus::Degraded ; "open conflicts")]
    #[test_case(true, false, 0 => HealthStatus::Unhealthy ; "shutting down")]
    fn determine_status(shutting_down: bool, degraded: bool, conflicts: usize) -> HealthStatus {
        determine_health_status(shutting_down, degraded, conflicts)
    }

    #[tokio::test]
    async fn health_reports_sessions() {
        let response = router(state(CancellationToken::new()))
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["sessions"]["connectors"], 0);
        assert_eq!(json["rate_limit"]["backend"], "local");
    }

    #[tokio::test]
    async fn readiness_follows_shutdown() {
        let shutdown = CancellationToken::new();
        let app = router(state(shutdown.clone()));

        let ready = app
            .clone()
            .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(ready.status(), StatusCode::OK);

        shutdown.cancel();
        let not_ready = app
            .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(not_ready.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
