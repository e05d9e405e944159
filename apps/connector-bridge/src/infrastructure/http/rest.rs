//! REST handlers.
//!
//! Every route authenticates the caller with a user bearer token and charges
//! the caller's API window before doing any work.

use std::time::Instant;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};

use super::error::ApiError;
use super::poll::PollError;
use super::state::AppState;
use crate::application::services::{ClientRegistration, Conflict, RegistryError, intent_from_command};
use crate::domain::envelope::{Envelope, SendTradeCommandPayload};
use crate::domain::identity::{AccountId, ConnectionId};
use crate::domain::session::{Capability, ConnectionStatus};
use crate::domain::trade::{TradeIntent, TradeOutcome, TradeRecord};

// =============================================================================
// Trades
// =============================================================================

/// Submit a trade intent and wait for its definitive outcome.
pub async fn submit_trade(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(command): Json<SendTradeCommandPayload>,
) -> Result<Json<TradeOutcome>, ApiError> {
    let caller = state.admit(&headers).await?;
    caller.authorize(&command.account_id)?;

    let intent = intent_from_command(command)?;
    let started = Instant::now();
    tracing::info!(
        user_id = %caller.user_id,
        intent_id = %intent.id,
        account_id = %intent.account_id,
        action = ?intent.action,
        "Trade submitted over REST"
    );

    let outcome = state.coordinator.submit(intent).await?;
    tracing::debug!(
        intent_id = %outcome.intent_id,
        elapsed_ms = started.elapsed().as_millis(),
        "Trade committed"
    );
    Ok(Json(outcome))
}

/// Committed trades of an account.
pub async fn list_trades(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(account): Path<String>,
) -> Result<Json<Vec<TradeRecord>>, ApiError> {
    let caller = state.admit(&headers).await?;
    let account = AccountId::new(account);
    caller.authorize(&account)?;

    let trades = state.coordinator.store().trades(&account).await?;
    Ok(Json(trades))
}

/// Intent audit trail of an account.
pub async fn list_intents(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(account): Path<String>,
) -> Result<Json<Vec<TradeIntent>>, ApiError> {
    let caller = state.admit(&headers).await?;
    let account = AccountId::new(account);
    caller.authorize(&account)?;

    let intents = state.coordinator.store().intents(&account).await?;
    Ok(Json(intents))
}

// =============================================================================
// Connections and reconciliation
// =============================================================================

/// Connector status for the caller's accounts.
pub async fn list_connections(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ConnectionStatus>>, ApiError> {
    let caller = state.admit(&headers).await?;
    Ok(Json(state.registry.connection_statuses(Some(&caller.accounts))))
}

/// Unresolved conflicts for the caller's accounts.
pub async fn list_conflicts(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Conflict>>, ApiError> {
    let caller = state.admit(&headers).await?;
    Ok(Json(state.reconciliation.conflicts(Some(&caller.accounts))))
}

/// Mark a conflict resolved after manual review.
pub async fn resolve_conflict(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> Result<Json<Conflict>, ApiError> {
    let caller = state.admit(&headers).await?;

    let visible = state
        .reconciliation
        .conflicts(Some(&caller.accounts))
        .iter()
        .any(|c| c.id == id);
    if !visible {
        return Err(ApiError::not_found(format!("conflict {id} not found")));
    }

    let conflict = state
        .reconciliation
        .resolve(id)
        .ok_or_else(|| ApiError::not_found(format!("conflict {id} not found")))?;
    tracing::info!(user_id = %caller.user_id, conflict_id = id, "Conflict resolved over REST");
    Ok(Json(conflict))
}

// =============================================================================
// Polling fallback
// =============================================================================

/// Body of `POST /v1/poll-sessions`.
#[derive(Debug, Default, Deserialize)]
pub struct CreatePollSession {
    /// Connection ids to follow.
    #[serde(default)]
    pub connections: Vec<ConnectionId>,
}

/// A created poll session.
#[derive(Debug, Serialize, Deserialize)]
pub struct PollSessionCreated {
    /// Id to poll with.
    pub session_id: String,
    /// Maximum envelopes returned per poll.
    pub batch: usize,
    /// Poll at least this often to stay registered.
    pub liveness_timeout_ms: u64,
}

/// A batch of queued envelopes.
#[derive(Debug, Serialize, Deserialize)]
pub struct PollBatch {
    /// Envelopes in delivery order.
    pub events: Vec<Envelope>,
}

/// Register a polling client.
pub async fn create_poll_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<CreatePollSession>>,
) -> Result<(StatusCode, Json<PollSessionCreated>), ApiError> {
    let caller = state.admit(&headers).await?;
    let request = body.map(|Json(request)| request).unwrap_or_default();

    state.polls.prune(&state.registry);
    let (handle, receiver) = state
        .registry
        .register_client(ClientRegistration {
            user_id: caller.user_id.clone(),
            accounts: caller.accounts,
            claimed_connections: request.connections,
            capability: Capability::Polling,
        })
        .map_err(|err| match err {
            RegistryError::UnauthorizedClaim(_) => ApiError::forbidden(err.to_string()),
            RegistryError::OwnershipConflict { .. } | RegistryError::Invalid(_) => {
                ApiError::bad_request(err.to_string())
            }
        })?;

    let session_id = state.polls.insert(handle, caller.user_id.clone(), receiver);
    tracing::info!(user_id = %caller.user_id, session_id = %session_id, "Poll session created");

    Ok((
        StatusCode::CREATED,
        Json(PollSessionCreated {
            session_id,
            batch: state.session.poll_batch,
            liveness_timeout_ms: u64::try_from(state.session.liveness_timeout.as_millis())
                .unwrap_or(u64::MAX),
        }),
    ))
}

/// Drain queued envelopes.
pub async fn poll_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<PollBatch>, ApiError> {
    let caller = state.caller(&headers)?;
    let events = state
        .polls
        .poll(&state.registry, &id, &caller.user_id, state.session.poll_batch)
        .map_err(poll_error)?;
    Ok(Json(PollBatch { events }))
}

/// End a poll session.
pub async fn delete_poll_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let caller = state.caller(&headers)?;
    state
        .polls
        .remove(&state.registry, &id, &caller.user_id)
        .map_err(poll_error)?;
    Ok(StatusCode::NO_CONTENT)
}

fn poll_error(err: PollError) -> ApiError {
    match err {
        PollError::NotFound | PollError::Closed(_) => ApiError::not_found(err.to_string()),
        PollError::NotOwner => ApiError::forbidden(err.to_string()),
    }
}
