//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Static bearer-token authentication.
pub mod auth;

/// Configuration and dependency injection.
pub mod config;

/// Reconnection and heartbeat policy for long-lived channels.
pub mod connection;

/// Connector-side WebSocket client and paper terminal.
pub mod connector_client;

/// Health check HTTP endpoint.
pub mod health;

/// WebSocket and REST server.
pub mod http;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Trade store adapters.
pub mod persistence;

/// Sliding-window store adapters.
pub mod rate_limit;

/// OpenTelemetry tracing integration.
pub mod telemetry;

/// WebSocket channel handlers.
pub mod websocket;
