#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Connector Bridge - Terminal Connector Multiplexer
//!
//! Keeps persistent WebSocket channels to remote trading-terminal connectors
//! and to dashboard clients, routes protocol envelopes between them, and
//! runs every trade through a two-phase protocol so local books only change
//! once the terminal has confirmed the fill.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Identifiers, envelopes, sessions, trades, rate windows
//!   - `envelope`: Wire protocol and JSON codec
//!   - `session`: Session handles, capabilities, close reasons
//!   - `trade`: Intents, committed trades, lifecycle, terminal snapshots
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Authenticator, terminal, trade store, window store
//!   - `services`: Registry, router, coordinator, limiter, reconciliation
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `http` / `websocket`: axum server for channels, REST and polling
//!   - `connector_client`: Connector-side client and paper terminal
//!   - `rate_limit`: Local, SQLite and fallback window stores
//!   - `config`, `health`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//!  Dashboard ──SEND_TRADE_COMMAND──┐
//!  REST caller ──POST /v1/trades───┤
//!                                  ▼
//!                       ┌─────────────────────┐  TRADE_OPEN   ┌───────────┐
//!                       │ TradeExecution      │──────────────►│ Connector │──► Terminal
//!                       │ Coordinator         │◄──────────────│ session   │
//!                       └─────────────────────┘  TRADE_RESULT └───────────┘
//!                                  │
//!                         commit / rollback
//!                                  ▼
//!                       TRADE_UPDATE fan-out ──► observing dashboards
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Protocol and trade types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

/// Error codes and the shared bridge error.
pub mod error;

// =============================================================================
// Re-exports
// =============================================================================

// Errors
pub use error::{BridgeError, ErrorBody, ErrorCode};

// Domain types
pub use domain::envelope::{Envelope, EnvelopeCodec, MessageKind};
pub use domain::identity::{AccountId, ConnectionId, CorrelationId, IntentId, RemoteRef, TradeId, UserId};
pub use domain::session::{Capability, CloseReason, SessionHandle, SessionKind};

// Application services
pub use application::services::{
    MessageRouter, PendingResults, RateLimiter, ReconciliationTracker, SessionRegistry,
    SharedRegistry, SubmitError, TradeExecutionCoordinator,
};

// Infrastructure config
pub use infrastructure::config::{BridgeConfig, ConfigError};

// Servers
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};
pub use infrastructure::http::{AppState, HttpServer, HttpServerError};

// Connector side
pub use infrastructure::connector_client::{
    ConnectorClient, ConnectorClientConfig, ConnectorClientError, ConnectorEvent, PaperTerminal,
};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
