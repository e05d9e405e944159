//! Connector Bridge Binary
//!
//! Starts the connector bridge.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin connector-bridge
//! ```
//!
//! # Environment Variables
//!
//! ## Auth
//! - `BRIDGE_CONNECTOR_TOKENS`: `token=ACCOUNT;...`
//! - `BRIDGE_USER_TOKENS`: `token=user:ACC1,ACC2;...`
//!
//! ## Optional
//! - `BRIDGE_HOST`: Bind address (default: 0.0.0.0)
//! - `BRIDGE_HTTP_PORT`: WebSocket and REST port (default: 8090)
//! - `BRIDGE_HEALTH_PORT`: Health and metrics port (default: 8091)
//! - `BRIDGE_RATE_LIMIT_BACKEND`: local | shared (default: local)
//! - `BRIDGE_RATE_LIMIT_PATH`: SQLite file for the shared backend
//! - `BRIDGE_EXECUTION_DEADLINE_MS`: Trade result deadline (default: 15000)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use connector_bridge::application::ports::WindowStore;
use connector_bridge::application::services::run_sweeper;
use connector_bridge::infrastructure::auth::StaticTokenAuthenticator;
use connector_bridge::infrastructure::config::RateLimitBackend;
use connector_bridge::infrastructure::persistence::InMemoryTradeStore;
use connector_bridge::infrastructure::rate_limit::{
    FallbackWindowStore, LocalWindowStore, SqliteWindowStore, run_purger,
};
use connector_bridge::infrastructure::telemetry;
use connector_bridge::{
    AppState, BridgeConfig, CloseReason, HealthServer, HealthServerState, HttpServer, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Another crate may already have installed a provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Connector Bridge");

    // Initialize Prometheus metrics
    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Prometheus recorder not installed");
    }

    let config = BridgeConfig::from_env().context("invalid bridge configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let auth = StaticTokenAuthenticator::from_settings(&config.auth);
    if auth.is_empty() {
        tracing::warn!("No tokens configured; every channel will be refused");
    }

    // Rate-limit windows
    let local_windows = Arc::new(LocalWindowStore::new());
    let mut shared_windows = None;
    let windows: Arc<dyn WindowStore> = match config.rate_limit.backend {
        RateLimitBackend::Local => Arc::clone(&local_windows) as Arc<dyn WindowStore>,
        RateLimitBackend::Shared => {
            let sqlite = SqliteWindowStore::open(
                &config.rate_limit.shared_path,
                config.rate_limit.busy_timeout,
            )
            .with_context(|| {
                format!(
                    "failed to open rate-limit store at {}",
                    config.rate_limit.shared_path.display()
                )
            })?;
            let fallback = Arc::new(FallbackWindowStore::new(
                Arc::new(sqlite),
                Arc::clone(&local_windows),
            ));
            shared_windows = Some(Arc::clone(&fallback));
            fallback
        }
    };

    let state = AppState::assemble(
        &config,
        Arc::new(auth),
        Arc::clone(&windows),
        Arc::new(InMemoryTradeStore::new()),
    );

    // Health server
    let mut health_state = HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&state.registry),
        Arc::clone(&state.pending),
        Arc::clone(&state.reconciliation),
        shutdown_token.clone(),
    );
    if let Some(fallback) = shared_windows {
        health_state = health_state.with_shared_store(fallback);
    }
    let health_server = HealthServer::new(
        config.server.health_port,
        Arc::new(health_state),
        shutdown_token.clone(),
    );

    // Background tasks
    tokio::spawn(run_sweeper(
        Arc::clone(&state.registry),
        config.session.sweep_interval,
        config.session.liveness_timeout,
        shutdown_token.clone(),
    ));
    tokio::spawn(Arc::clone(&state.router).run(shutdown_token.clone()));

    let max_window = config
        .rate_limit
        .api_limit
        .window
        .max(config.execution.trade_limit.window);
    tokio::spawn(run_purger(
        Arc::clone(&windows),
        config.rate_limit.purge_interval,
        max_window,
        shutdown_token.clone(),
    ));

    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    let registry = Arc::clone(&state.registry);
    let http_server = HttpServer::new(config.http_addr(), state, shutdown_token.clone());
    let http_handle = tokio::spawn(async move {
        if let Err(e) = http_server.run().await {
            tracing::error!(error = %e, "Bridge server error");
        }
    });

    tracing::info!("Connector bridge ready");

    await_shutdown().await;

    // Closing every outbox sends each peer a 1001 close frame.
    registry.close_all(&CloseReason::Shutdown);
    shutdown_token.cancel();
    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, http_handle).await.is_err() {
        tracing::warn!("Bridge server did not stop within the shutdown timeout");
    }

    tracing::info!("Connector bridge stopped");
    Ok(())
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_err() {
        load_dotenv_from_ancestors();
    }
}

/// Log the parsed configuration.
fn log_config(config: &BridgeConfig) {
    tracing::info!(
        http_addr = %config.http_addr(),
        health_port = config.server.health_port,
        rate_limit_backend = config.rate_limit.backend.as_str(),
        "Configuration loaded"
    );
    tracing::debug!(
        outbox_capacity = config.session.outbox_capacity,
        liveness_timeout_secs = config.session.liveness_timeout.as_secs(),
        execution_deadline_ms = config.execution.deadline.as_millis(),
        trade_limit = config.execution.trade_limit.limit,
        "Session and execution settings"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv_from_ancestors() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
