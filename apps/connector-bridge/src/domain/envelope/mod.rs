//! Protocol Envelopes
//!
//! Every message on every channel is a JSON object with a `type`
//! discriminator. The set of kinds is closed: [`Envelope`] is matched
//! exhaustively by the router, so adding a kind forces every dispatcher to
//! decide what to do with it.
//!
//! # Directions
//!
//! | Kind | Direction |
//! |------|-----------|
//! | `TRADE_RESULT`, `SYNC_RESPONSE`, `POSITIONS`, `ACCOUNT_INFO` | connector -> backend |
//! | `TRADE_OPEN`, `TRADE_CLOSE`, `TRADE_MODIFY`, `SYNC_REQUEST`, `GET_POSITIONS`, `GET_ACCOUNT` | backend -> connector |
//! | `SEND_TRADE_COMMAND`, `GET_CONNECTIONS` | client -> backend |
//! | `CONNECTIONS_STATUS`, `ACCOUNT_UPDATE`, `POSITIONS_UPDATE`, `TRADE_UPDATE`, `CONNECTOR_DISCONNECTED`, `ERROR` | backend -> client |
//! | `PING`, `PONG` | any |

mod codec;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub use codec::{CodecError, EnvelopeCodec};

use super::identity::{AccountId, ConnectionId, CorrelationId, IntentId, RemoteRef, TradeId};
use super::session::ConnectionStatus;
use super::trade::{AccountSnapshot, IntentState, PositionSnapshot, Side, TradeAction};
use crate::error::ErrorCode;

// =============================================================================
// Envelope
// =============================================================================

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Envelope {
    // connector -> backend
    /// Outcome of a trade command.
    TradeResult(TradeResultPayload),
    /// Full state dump answering `SYNC_REQUEST`.
    SyncResponse(SyncResponsePayload),
    /// Open positions answering `GET_POSITIONS` or pushed on change.
    Positions(PositionsPayload),
    /// Balances answering `GET_ACCOUNT` or pushed on change.
    AccountInfo(AccountInfoPayload),

    // backend -> connector
    /// Open a trade.
    TradeOpen(TradeCommandPayload),
    /// Close a trade.
    TradeClose(TradeCommandPayload),
    /// Modify a trade.
    TradeModify(TradeCommandPayload),
    /// Ask for a full state dump.
    SyncRequest(RequestPayload),
    /// Ask for open positions.
    GetPositions(RequestPayload),
    /// Ask for balances.
    GetAccount(RequestPayload),

    // client -> backend
    /// Submit a trade intent.
    SendTradeCommand(SendTradeCommandPayload),
    /// Ask for connector status.
    GetConnections(RequestPayload),

    // backend -> client
    /// Status of connectors the client observes.
    ConnectionsStatus(ConnectionsStatusPayload),
    /// Balances for an observed account.
    AccountUpdate(AccountUpdatePayload),
    /// Positions for an observed account.
    PositionsUpdate(PositionsUpdatePayload),
    /// Intent reached a final state.
    TradeUpdate(TradeUpdatePayload),
    /// A connector for an observed account went away.
    ConnectorDisconnected(ConnectorDisconnectedPayload),
    /// A request failed.
    Error(ErrorPayload),

    // any direction
    /// Keepalive request.
    Ping(PingPayload),
    /// Keepalive reply; connectors also report terminal status here.
    Pong(PongPayload),
}

impl Envelope {
    /// Kind of this envelope.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::TradeResult(_) => MessageKind::TradeResult,
            Self::SyncResponse(_) => MessageKind::SyncResponse,
            Self::Positions(_) => MessageKind::Positions,
            Self::AccountInfo(_) => MessageKind::AccountInfo,
            Self::TradeOpen(_) => MessageKind::TradeOpen,
            Self::TradeClose(_) => MessageKind::TradeClose,
            Self::TradeModify(_) => MessageKind::TradeModify,
            Self::SyncRequest(_) => MessageKind::SyncRequest,
            Self::GetPositions(_) => MessageKind::GetPositions,
            Self::GetAccount(_) => MessageKind::GetAccount,
            Self::SendTradeCommand(_) => MessageKind::SendTradeCommand,
            Self::GetConnections(_) => MessageKind::GetConnections,
            Self::ConnectionsStatus(_) => MessageKind::ConnectionsStatus,
            Self::AccountUpdate(_) => MessageKind::AccountUpdate,
            Self::PositionsUpdate(_) => MessageKind::PositionsUpdate,
            Self::TradeUpdate(_) => MessageKind::TradeUpdate,
            Self::ConnectorDisconnected(_) => MessageKind::ConnectorDisconnected,
            Self::Error(_) => MessageKind::Error,
            Self::Ping(_) => MessageKind::Ping,
            Self::Pong(_) => MessageKind::Pong,
        }
    }

    /// Account the sender claims this envelope concerns, if any.
    #[must_use]
    pub const fn claimed_account(&self) -> Option<&AccountId> {
        match self {
            Self::TradeResult(p) => p.account_id.as_ref(),
            Self::SyncResponse(p) => p.account_id.as_ref(),
            Self::Positions(p) => p.account_id.as_ref(),
            Self::AccountInfo(p) => p.account_id.as_ref(),
            Self::Pong(p) => p.account_id.as_ref(),
            Self::SendTradeCommand(p) => Some(&p.account_id),
            Self::AccountUpdate(p) => Some(&p.account_id),
            Self::PositionsUpdate(p) => Some(&p.account_id),
            Self::TradeUpdate(p) => Some(&p.account_id),
            Self::ConnectorDisconnected(p) => Some(&p.account_id),
            Self::TradeOpen(_)
            | Self::TradeClose(_)
            | Self::TradeModify(_)
            | Self::SyncRequest(_)
            | Self::GetPositions(_)
            | Self::GetAccount(_)
            | Self::GetConnections(_)
            | Self::ConnectionsStatus(_)
            | Self::Error(_)
            | Self::Ping(_) => None,
        }
    }

    /// Whether the envelope must never be dropped under backpressure.
    #[must_use]
    pub const fn is_critical(&self) -> bool {
        self.kind().is_critical()
    }

    /// `PING` stamped with the current time.
    #[must_use]
    pub fn ping() -> Self {
        Self::Ping(PingPayload {
            timestamp: Some(Utc::now().timestamp_millis()),
        })
    }

    /// `ERROR` envelope.
    #[must_use]
    pub fn error(
        code: ErrorCode,
        message: impl Into<String>,
        correlation_id: Option<CorrelationId>,
    ) -> Self {
        Self::Error(ErrorPayload {
            code,
            message: message.into(),
            correlation_id,
        })
    }
}

// =============================================================================
// Kinds
// =============================================================================

/// Discriminator of an [`Envelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// `TRADE_RESULT`
    TradeResult,
    /// `SYNC_RESPONSE`
    SyncResponse,
    /// `POSITIONS`
    Positions,
    /// `ACCOUNT_INFO`
    AccountInfo,
    /// `TRADE_OPEN`
    TradeOpen,
    /// `TRADE_CLOSE`
    TradeClose,
    /// `TRADE_MODIFY`
    TradeModify,
    /// `SYNC_REQUEST`
    SyncRequest,
    /// `GET_POSITIONS`
    GetPositions,
    /// `GET_ACCOUNT`
    GetAccount,
    /// `SEND_TRADE_COMMAND`
    SendTradeCommand,
    /// `GET_CONNECTIONS`
    GetConnections,
    /// `CONNECTIONS_STATUS`
    ConnectionsStatus,
    /// `ACCOUNT_UPDATE`
    AccountUpdate,
    /// `POSITIONS_UPDATE`
    PositionsUpdate,
    /// `TRADE_UPDATE`
    TradeUpdate,
    /// `CONNECTOR_DISCONNECTED`
    ConnectorDisconnected,
    /// `ERROR`
    Error,
    /// `PING`
    Ping,
    /// `PONG`
    Pong,
}

impl MessageKind {
    /// Every kind, in declaration order.
    pub const ALL: [Self; 20] = [
        Self::TradeResult,
        Self::SyncResponse,
        Self::Positions,
        Self::AccountInfo,
        Self::TradeOpen,
        Self::TradeClose,
        Self::TradeModify,
        Self::SyncRequest,
        Self::GetPositions,
        Self::GetAccount,
        Self::SendTradeCommand,
        Self::GetConnections,
        Self::ConnectionsStatus,
        Self::AccountUpdate,
        Self::PositionsUpdate,
        Self::TradeUpdate,
        Self::ConnectorDisconnected,
        Self::Error,
        Self::Ping,
        Self::Pong,
    ];

    /// Wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::TradeResult => "TRADE_RESULT",
            Self::SyncResponse => "SYNC_RESPONSE",
            Self::Positions => "POSITIONS",
            Self::AccountInfo => "ACCOUNT_INFO",
            Self::TradeOpen => "TRADE_OPEN",
            Self::TradeClose => "TRADE_CLOSE",
            Self::TradeModify => "TRADE_MODIFY",
            Self::SyncRequest => "SYNC_REQUEST",
            Self::GetPositions => "GET_POSITIONS",
            Self::GetAccount => "GET_ACCOUNT",
            Self::SendTradeCommand => "SEND_TRADE_COMMAND",
            Self::GetConnections => "GET_CONNECTIONS",
            Self::ConnectionsStatus => "CONNECTIONS_STATUS",
            Self::AccountUpdate => "ACCOUNT_UPDATE",
            Self::PositionsUpdate => "POSITIONS_UPDATE",
            Self::TradeUpdate => "TRADE_UPDATE",
            Self::ConnectorDisconnected => "CONNECTOR_DISCONNECTED",
            Self::Error => "ERROR",
            Self::Ping => "PING",
            Self::Pong => "PONG",
        }
    }

    /// Parse a wire name.
    #[must_use]
    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    /// Trade commands and trade outcomes are never dropped.
    #[must_use]
    pub const fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::TradeOpen
                | Self::TradeClose
                | Self::TradeModify
                | Self::TradeResult
                | Self::TradeUpdate
        )
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// `TRADE_RESULT` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeResultPayload {
    /// Correlation id of the command.
    pub correlation_id: CorrelationId,
    /// Whether the terminal executed the command.
    pub success: bool,
    /// Ticket of the affected trade.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket: Option<RemoteRef>,
    /// Failure detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Account the connector acted on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<AccountId>,
}

/// `SYNC_RESPONSE` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponsePayload {
    /// Reporting account.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<AccountId>,
    /// Request being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    /// Open positions.
    #[serde(default)]
    pub positions: Vec<PositionSnapshot>,
    /// Balances.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<AccountSnapshot>,
}

/// `POSITIONS` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionsPayload {
    /// Reporting account.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<AccountId>,
    /// Request being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    /// Open positions.
    #[serde(default)]
    pub positions: Vec<PositionSnapshot>,
}

/// `ACCOUNT_INFO` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfoPayload {
    /// Reporting account.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<AccountId>,
    /// Request being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    /// Balance.
    pub balance: Decimal,
    /// Equity.
    pub equity: Decimal,
    /// Used margin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub margin: Option<Decimal>,
    /// Free margin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free_margin: Option<Decimal>,
    /// Account currency.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
}

impl AccountInfoPayload {
    /// Balances as a snapshot.
    #[must_use]
    pub fn snapshot(&self) -> AccountSnapshot {
        AccountSnapshot {
            balance: self.balance,
            equity: self.equity,
            margin: self.margin,
            free_margin: self.free_margin,
            currency: self.currency.clone(),
        }
    }
}

/// Body of `TRADE_OPEN`, `TRADE_CLOSE` and `TRADE_MODIFY`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeCommandPayload {
    /// Echoed back in `TRADE_RESULT`.
    pub correlation_id: CorrelationId,
    /// Intent being executed.
    pub intent_id: IntentId,
    /// Instrument symbol.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instrument: Option<String>,
    /// Direction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side: Option<Side>,
    /// Volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Decimal>,
    /// Protective stop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<Decimal>,
    /// Profit target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<Decimal>,
    /// Terminal ticket of the trade to close or modify.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket: Option<RemoteRef>,
}

/// Body of bare requests (`SYNC_REQUEST`, `GET_POSITIONS`, `GET_ACCOUNT`,
/// `GET_CONNECTIONS`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPayload {
    /// Echoed back in the answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
}

/// `SEND_TRADE_COMMAND` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendTradeCommandPayload {
    /// Target account.
    pub account_id: AccountId,
    /// Requested action.
    pub action: TradeAction,
    /// Idempotency key; generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_id: Option<IntentId>,
    /// Target trade for close/modify.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trade_id: Option<TradeId>,
    /// Instrument symbol.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instrument: Option<String>,
    /// Direction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side: Option<Side>,
    /// Volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Decimal>,
    /// Protective stop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<Decimal>,
    /// Profit target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<Decimal>,
}

/// `CONNECTIONS_STATUS` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionsStatusPayload {
    /// Request being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    /// Live connectors.
    pub connections: Vec<ConnectionStatus>,
}

/// `ACCOUNT_UPDATE` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountUpdatePayload {
    /// Account.
    pub account_id: AccountId,
    /// Balances.
    pub account: AccountSnapshot,
}

/// `POSITIONS_UPDATE` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionsUpdatePayload {
    /// Account.
    pub account_id: AccountId,
    /// Open positions.
    pub positions: Vec<PositionSnapshot>,
}

/// `TRADE_UPDATE` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeUpdatePayload {
    /// Account.
    pub account_id: AccountId,
    /// Intent that finished.
    pub intent_id: IntentId,
    /// Affected trade.
    pub trade_id: TradeId,
    /// Action.
    pub action: TradeAction,
    /// Final state.
    pub state: IntentState,
    /// Terminal ticket.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket: Option<RemoteRef>,
    /// Instrument symbol.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instrument: Option<String>,
    /// Failure code for rolled-back intents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    /// Failure detail for rolled-back intents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `CONNECTOR_DISCONNECTED` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorDisconnectedPayload {
    /// Account that lost its connector.
    pub account_id: AccountId,
    /// Connection that went away.
    pub connection_id: ConnectionId,
    /// Close reason label.
    pub reason: String,
}

/// `ERROR` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Request that failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
}

/// `PING` body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingPayload {
    /// Sender clock, Unix millis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// `PONG` body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PongPayload {
    /// Echo of the ping timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    /// Whether the terminal is logged in to the broker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_connected: Option<bool>,
    /// Broker label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker: Option<String>,
    /// Reporting account.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<AccountId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_round_trip_through_from_wire() {
        for kind in MessageKind::ALL {
            assert_eq!(MessageKind::from_wire(kind.as_str()), Some(kind));
        }
        assert_eq!(MessageKind::from_wire("TRADE_CANCEL"), None);
    }

    #[test]
    fn serde_tag_matches_kind_name() {
        let envelope = Envelope::ping();
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], envelope.kind().as_str());

        let envelope = Envelope::error(ErrorCode::UnknownType, "nope", None);
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "ERROR");
        assert_eq!(value["code"], "UNKNOWN_TYPE");
    }

    #[test]
    fn trade_kinds_are_critical() {
        assert!(MessageKind::TradeUpdate.is_critical());
        assert!(MessageKind::TradeOpen.is_critical());
        assert!(!MessageKind::PositionsUpdate.is_critical());
        assert!(!MessageKind::Pong.is_critical());
    }

    #[test]
    fn claimed_account_reads_payload() {
        let envelope = Envelope::Pong(PongPayload {
            account_id: Some(AccountId::new("ACC-9")),
            ..PongPayload::default()
        });
        assert_eq!(envelope.claimed_account().map(AccountId::as_str), Some("ACC-9"));
        assert!(Envelope::ping().claimed_account().is_none());
    }
}
