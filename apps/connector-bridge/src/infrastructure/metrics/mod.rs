//! Prometheus Metrics Module
//!
//! Exposes bridge metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Sessions**: live connector/client sessions, registrations and closes
//! - **Envelopes**: frames received, sent and dropped by kind
//! - **Trades**: outcomes, coalesced submits and round-trip latency
//! - **Rate limiting**: decisions, store errors and shared-store fallbacks
//! - **Reconnects**: connector client reconnect attempts
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::application::services::ConflictKind;
use crate::domain::envelope::MessageKind;
use crate::domain::session::{CloseReason, SessionKind};
use crate::domain::trade::TradeAction;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Calling it again returns the handle installed by the first call.
///
/// # Errors
///
/// Returns an error if the recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Sessions
    describe_gauge!(
        "connector_bridge_sessions",
        "Number of live sessions by kind"
    );
    describe_counter!(
        "connector_bridge_sessions_registered_total",
        "Total sessions registered by kind"
    );
    describe_counter!(
        "connector_bridge_sessions_closed_total",
        "Total sessions closed by kind and reason"
    );
    describe_counter!(
        "connector_bridge_protocol_violations_total",
        "Total protocol violations by session kind"
    );

    // Envelopes
    describe_counter!(
        "connector_bridge_envelopes_received_total",
        "Total envelopes received by session kind and type"
    );
    describe_counter!(
        "connector_bridge_envelopes_sent_total",
        "Total envelopes queued for delivery"
    );
    describe_counter!(
        "connector_bridge_envelopes_dropped_total",
        "Total non-critical envelopes lost to backpressure"
    );

    // Trades
    describe_counter!(
        "connector_bridge_trades_total",
        "Total trade submissions by action and outcome"
    );
    describe_counter!(
        "connector_bridge_trades_coalesced_total",
        "Total submits that joined an in-flight intent"
    );
    describe_histogram!(
        "connector_bridge_trade_duration_seconds",
        "Time from submit to definitive trade outcome"
    );
    describe_counter!(
        "connector_bridge_reconciliation_conflicts_total",
        "Total reconciliation conflicts by kind"
    );

    // Rate limiting
    describe_counter!(
        "connector_bridge_rate_limit_decisions_total",
        "Total rate limit decisions by scope and result"
    );
    describe_counter!(
        "connector_bridge_rate_limit_store_errors_total",
        "Total window store failures that admitted the request"
    );
    describe_counter!(
        "connector_bridge_rate_limit_fallbacks_total",
        "Total hits served by the local store while the shared store was unreachable"
    );

    // Connector client
    describe_counter!(
        "connector_bridge_reconnects_total",
        "Total connector client reconnection attempts"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Update the live session count for a kind.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_sessions(kind: SessionKind, count: usize) {
    gauge!("connector_bridge_sessions", "kind" => kind.as_str()).set(count as f64);
}

/// Record a session registration.
pub fn record_session_registered(kind: SessionKind) {
    counter!("connector_bridge_sessions_registered_total", "kind" => kind.as_str()).increment(1);
}

/// Record a session close.
pub fn record_session_closed(kind: SessionKind, reason: &CloseReason) {
    counter!(
        "connector_bridge_sessions_closed_total",
        "kind" => kind.as_str(),
        "reason" => reason.as_str()
    )
    .increment(1);
}

/// Record a protocol violation.
pub fn record_protocol_violation(kind: SessionKind) {
    counter!("connector_bridge_protocol_violations_total", "kind" => kind.as_str()).increment(1);
}

/// Record an inbound envelope.
pub fn record_envelope_received(kind: SessionKind, message: MessageKind) {
    counter!(
        "connector_bridge_envelopes_received_total",
        "session" => kind.as_str(),
        "type" => message.as_str()
    )
    .increment(1);
}

/// Record an envelope queued for a session.
pub fn record_envelope_sent(kind: SessionKind, message: MessageKind) {
    counter!(
        "connector_bridge_envelopes_sent_total",
        "session" => kind.as_str(),
        "type" => message.as_str()
    )
    .increment(1);
}

/// Record an envelope lost to backpressure.
pub fn record_envelope_dropped(kind: SessionKind, message: MessageKind) {
    counter!(
        "connector_bridge_envelopes_dropped_total",
        "session" => kind.as_str(),
        "type" => message.as_str()
    )
    .increment(1);
}

/// Record a trade outcome and its latency.
pub fn record_trade_outcome(action: TradeAction, outcome: &'static str, duration: Duration) {
    counter!(
        "connector_bridge_trades_total",
        "action" => action.as_str(),
        "outcome" => outcome
    )
    .increment(1);
    histogram!("connector_bridge_trade_duration_seconds", "action" => action.as_str())
        .record(duration.as_secs_f64());
}

/// Record a submit that joined an in-flight intent.
pub fn record_trade_coalesced() {
    counter!("connector_bridge_trades_coalesced_total").increment(1);
}

/// Record a reconciliation conflict.
pub fn record_reconciliation_conflict(kind: ConflictKind) {
    counter!(
        "connector_bridge_reconciliation_conflicts_total",
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Record a rate limit decision.
pub fn record_rate_limit_decision(scope: &str, allowed: bool) {
    counter!(
        "connector_bridge_rate_limit_decisions_total",
        "scope" => scope.to_string(),
        "result" => if allowed { "allowed" } else { "denied" }
    )
    .increment(1);
}

/// Record a window store failure.
pub fn record_rate_limit_store_error(store: &'static str) {
    counter!("connector_bridge_rate_limit_store_errors_total", "store" => store).increment(1);
}

/// Record a hit served by the local fallback store.
pub fn record_rate_limit_fallback() {
    counter!("connector_bridge_rate_limit_fallbacks_total").increment(1);
}

/// Record a connector client reconnection attempt.
pub fn record_reconnect(attempt: u32) {
    counter!("connector_bridge_reconnects_total").increment(1);
    tracing::trace!(attempt, "Reconnect attempt recorded");
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let first = init_metrics();
        let second = init_metrics();
        assert!(first.is_ok());
        assert!(second.is_ok());
        assert!(get_metrics_handle().is_some());
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        record_session_registered(SessionKind::Client);
        record_envelope_dropped(SessionKind::Client, MessageKind::PositionsUpdate);
        record_trade_outcome(TradeAction::Open, "committed", Duration::from_millis(5));
        record_rate_limit_decision("trade", false);
    }
}
