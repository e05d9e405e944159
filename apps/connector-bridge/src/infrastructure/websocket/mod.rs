//! WebSocket Session Endpoints
//!
//! `GET /ws/connector` and `GET /ws/client`. Both upgrade unconditionally
//! and then authenticate, so a refused peer learns why from the close code
//! (4001 unauthorized, 4003 ownership conflict) instead of a bare HTTP error.
//!
//! # Session Task
//!
//! ```text
//!            ┌────────────┐  frames   ┌────────────────┐
//!  peer ────►│ read loop  │──────────►│ MessageRouter  │
//!            └────────────┘           └────────────────┘
//!            ┌────────────┐  drains   ┌────────────────┐
//!  peer ◄────│   writer   │◄──────────│ session outbox │◄── keepalive PING
//!            └────────────┘           └────────────────┘
//! ```
//!
//! The writer is the only task that writes to the socket. When the outbox is
//! closed (replaced, expired, protocol violation, shutdown) it sends a close
//! frame carrying the reason's code and the read loop stops.

use std::collections::HashSet;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::task::JoinHandle;

use crate::application::services::{
    ClientRegistration, ClientRequest, ConnectorRegistration, OutboxReceiver, RegistryError,
    SubmitError, intent_from_command,
};
use crate::domain::envelope::{Envelope, EnvelopeCodec, SendTradeCommandPayload};
use crate::domain::identity::ConnectionId;
use crate::domain::session::{Capability, CloseReason, SessionHandle, SessionKind};
use crate::infrastructure::auth::bearer_token;
use crate::infrastructure::http::AppState;
use crate::infrastructure::metrics;

/// Longest close reason a control frame can carry.
const MAX_CLOSE_REASON: usize = 123;

/// How long the read loop waits for the writer to flush its close frame.
const WRITER_DRAIN: Duration = Duration::from_secs(2);

/// Query string of `/ws/connector`.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectorParams {
    /// Connection id the connector registers under.
    pub connection_id: Option<String>,
    /// Broker label.
    pub broker: Option<String>,
    /// Token for peers that cannot set headers.
    pub token: Option<String>,
}

/// Query string of `/ws/client`.
#[derive(Debug, Default, Deserialize)]
pub struct ClientParams {
    /// Comma-separated connection ids to follow.
    pub connections: Option<String>,
    /// Token for browsers that cannot set headers on an upgrade.
    pub token: Option<String>,
}

// =============================================================================
// Handlers
// =============================================================================

/// Upgrade a connector channel.
pub async fn connector_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ConnectorParams>,
) -> Response {
    let registration = authenticate_connector(&state, &headers, params);
    ws.on_upgrade(move |socket| async move {
        match registration {
            Ok(registration) => match state.registry.register_connector(registration) {
                Ok((handle, outbox)) => run_session(socket, state, handle, outbox).await,
                Err(err) => {
                    tracing::warn!(error = %err, "Connector registration refused");
                    reject(socket, &registry_close_reason(&err)).await;
                }
            },
            Err(reason) => reject(socket, &reason).await,
        }
    })
}

/// Upgrade a client channel.
pub async fn client_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ClientParams>,
) -> Response {
    let registration = authenticate_client(&state, &headers, params);
    ws.on_upgrade(move |socket| async move {
        match registration {
            Ok(registration) => match state.registry.register_client(registration) {
                Ok((handle, outbox)) => run_session(socket, state, handle, outbox).await,
                Err(err) => {
                    tracing::warn!(error = %err, "Client registration refused");
                    reject(socket, &registry_close_reason(&err)).await;
                }
            },
            Err(reason) => reject(socket, &reason).await,
        }
    })
}

fn authenticate_connector(
    state: &AppState,
    headers: &HeaderMap,
    params: ConnectorParams,
) -> Result<ConnectorRegistration, CloseReason> {
    let token = bearer_token(headers, params.token.as_deref()).map_err(|_| CloseReason::Unauthorized)?;
    let account_id = state.auth.connector(token).map_err(|err| {
        tracing::warn!(error = %err, "Connector authentication failed");
        CloseReason::Unauthorized
    })?;

    let connection_id = params
        .connection_id
        .map(ConnectionId::new)
        .filter(|id| !id.is_blank())
        .ok_or_else(|| CloseReason::ProtocolViolation("connection_id is required".into()))?;

    Ok(ConnectorRegistration {
        connection_id,
        account_id,
        broker: params.broker.filter(|b| !b.trim().is_empty()),
        capability: Capability::Streaming,
    })
}

fn authenticate_client(
    state: &AppState,
    headers: &HeaderMap,
    params: ClientParams,
) -> Result<ClientRegistration, CloseReason> {
    let token = bearer_token(headers, params.token.as_deref()).map_err(|_| CloseReason::Unauthorized)?;
    let (user_id, accounts) = state.auth.user(token).map_err(|err| {
        tracing::warn!(error = %err, "Client authentication failed");
        CloseReason::Unauthorized
    })?;

    Ok(ClientRegistration {
        user_id,
        accounts,
        claimed_connections: parse_connections(params.connections.as_deref()),
        capability: Capability::Streaming,
    })
}

/// Split a `connections` query value into ids, ignoring blanks and repeats.
#[must_use]
pub fn parse_connections(raw: Option<&str>) -> Vec<ConnectionId> {
    let mut seen = HashSet::new();
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .filter(|id| seen.insert((*id).to_string()))
        .map(ConnectionId::new)
        .collect()
}

const fn registry_close_reason(err: &RegistryError) -> CloseReason {
    match err {
        RegistryError::OwnershipConflict { .. } | RegistryError::UnauthorizedClaim(_) => {
            CloseReason::OwnershipConflict
        }
        RegistryError::Invalid(_) => CloseReason::Unauthorized,
    }
}

// =============================================================================
// Session Task
// =============================================================================

async fn run_session(socket: WebSocket, state: AppState, handle: SessionHandle, outbox: OutboxReceiver) {
    let kind = handle.kind();
    let (sink, mut stream) = socket.split();
    let mut writer = tokio::spawn(write_loop(sink, outbox, kind));
    let keepalive = spawn_keepalive(&state, &handle);

    tracing::debug!(session = %handle, "Session started");

    loop {
        tokio::select! {
            _ = &mut writer => {
                // Either the bridge closed the outbox or the peer stopped
                // accepting writes; the latter still holds a registration.
                keepalive.abort();
                state.registry.remove(&handle, CloseReason::Normal);
                tracing::debug!(session = %handle, "Session writer finished");
                return;
            }
            frame = stream.next() => {
                let keep_reading = match frame {
                    Some(Ok(Message::Text(text))) => on_text(&state, &handle, text.as_str()).await,
                    Some(Ok(Message::Binary(_))) => {
                        state.registry.remove(
                            &handle,
                            CloseReason::ProtocolViolation("binary frames are not supported".into()),
                        );
                        metrics::record_protocol_violation(kind);
                        false
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        state.registry.touch(&handle);
                        true
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::debug!(session = %handle, frame = ?frame, "Peer closed");
                        state.registry.remove(&handle, CloseReason::Normal);
                        false
                    }
                    Some(Err(err)) => {
                        tracing::debug!(session = %handle, error = %err, "Socket error");
                        state.registry.remove(&handle, CloseReason::Normal);
                        false
                    }
                    None => {
                        state.registry.remove(&handle, CloseReason::Normal);
                        false
                    }
                };
                if !keep_reading {
                    break;
                }
            }
        }
    }

    keepalive.abort();
    // A stale handle is a no-op: the session may already be gone.
    state.registry.remove(&handle, CloseReason::Normal);
    if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        writer.abort();
    }
    tracing::debug!(session = %handle, "Session ended");
}

/// Returns `false` when the session was closed.
async fn on_text(state: &AppState, handle: &SessionHandle, text: &str) -> bool {
    match handle.kind() {
        SessionKind::Connector => state.router.handle_connector_frame(handle, text).await.is_ok(),
        SessionKind::Client => match state.router.handle_client_frame(handle, text) {
            Ok(Some(ClientRequest::Trade(command))) => {
                spawn_trade(state.clone(), handle.clone(), command);
                true
            }
            Ok(None) => true,
            Err(_) => false,
        },
    }
}

/// Run a client's trade command without blocking its read loop.
fn spawn_trade(state: AppState, handle: SessionHandle, command: SendTradeCommandPayload) {
    tokio::spawn(async move {
        let result = match intent_from_command(command) {
            Ok(intent) => state.coordinator.submit(intent).await.map(|_| ()),
            Err(err) => Err(err),
        };

        // Rejections and timeouts already reached every observer as TRADE_UPDATE.
        if let Err(err) = result {
            if !matches!(err, SubmitError::Rejected(_) | SubmitError::Timeout(_)) {
                let _ = state
                    .router
                    .send_to_session(&handle, Envelope::error(err.code(), err.to_string(), None));
            }
        }
    });
}

fn spawn_keepalive(state: &AppState, handle: &SessionHandle) -> JoinHandle<()> {
    let router = std::sync::Arc::clone(&state.router);
    let handle = handle.clone();
    let interval = state.session.keepalive_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if router.send_to_session(&handle, Envelope::ping()).is_err() {
                break;
            }
        }
    })
}

async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut outbox: OutboxReceiver, kind: SessionKind) {
    let codec = EnvelopeCodec::new();
    while let Some(envelope) = outbox.recv().await {
        let message_kind = envelope.kind();
        let text = match codec.encode(&envelope) {
            Ok(text) => text,
            Err(err) => {
                tracing::error!(error = %err, kind = %message_kind, "Failed to encode envelope");
                continue;
            }
        };
        if sink.send(Message::Text(text.into())).await.is_err() {
            return;
        }
        metrics::record_envelope_sent(kind, message_kind);
    }

    let reason = outbox.close_reason().unwrap_or(CloseReason::Normal);
    let _ = sink.send(Message::Close(Some(close_frame(&reason)))).await;
    let _ = sink.close().await;
}

async fn reject(mut socket: WebSocket, reason: &CloseReason) {
    tracing::info!(reason = %reason, code = reason.close_code(), "Rejecting channel");
    let _ = socket.send(Message::Close(Some(close_frame(reason)))).await;
}

/// Close frame for `reason`, with the text trimmed to fit a control frame.
#[must_use]
pub fn close_frame(reason: &CloseReason) -> CloseFrame {
    let mut text = reason.to_string();
    if text.len() > MAX_CLOSE_REASON {
        let mut cut = MAX_CLOSE_REASON;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    CloseFrame {
        code: reason.close_code(),
        reason: Utf8Bytes::from(text),
    }
}
