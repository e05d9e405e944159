//! Trade Intents and Records
//!
//! A [`TradeIntent`] is a requested action (open, close or modify) keyed by
//! its idempotency id. It moves through [`IntentState`] under the control
//! of the execution coordinator. A [`TradeRecord`] is the authoritative
//! local view of a trade; it only changes when an intent commits.

mod lifecycle;
mod snapshot;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use lifecycle::IntentLifecycle;
pub use snapshot::{AccountSnapshot, PositionSnapshot};

use super::identity::{AccountId, IntentId, RemoteRef, TradeId};
use crate::error::ErrorCode;

// =============================================================================
// Value Types
// =============================================================================

/// Requested trade action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeAction {
    /// Open a new trade.
    Open,
    /// Close an open trade.
    Close,
    /// Change protective levels of an open trade.
    Modify,
}

impl TradeAction {
    /// Label for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Close => "close",
            Self::Modify => "modify",
        }
    }
}

impl std::fmt::Display for TradeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    /// Long.
    #[serde(alias = "buy")]
    Buy,
    /// Short.
    #[serde(alias = "sell")]
    Sell,
}

/// Lifecycle state of an intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentState {
    /// Recorded locally, not yet sent.
    Staged,
    /// Command sent to the connector, awaiting its result.
    Sent,
    /// Connector reported success.
    Confirmed,
    /// Connector reported failure or the deadline passed.
    Rejected,
    /// Effect applied to the local books.
    Committed,
    /// Abandoned; kept for audit.
    RolledBack,
}

impl IntentState {
    /// Whether the intent has reached a final state.
    #[must_use]
    pub const fn is_final(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }

    /// Wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Staged => "STAGED",
            Self::Sent => "SENT",
            Self::Confirmed => "CONFIRMED",
            Self::Rejected => "REJECTED",
            Self::Committed => "COMMITTED",
            Self::RolledBack => "ROLLED_BACK",
        }
    }
}

impl std::fmt::Display for IntentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure recorded on a rolled-back intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentFailure {
    /// Failure code.
    pub code: ErrorCode,
    /// Detail reported by the terminal or the coordinator.
    pub message: String,
}

/// Errors raised by intent validation and transitions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TradeError {
    /// The intent is missing required fields or has invalid values.
    #[error("invalid trade intent: {0}")]
    Invalid(String),

    /// The transition is not part of the lifecycle.
    #[error("invalid intent transition {from} -> {to}")]
    InvalidTransition {
        /// Current state.
        from: IntentState,
        /// Requested state.
        to: IntentState,
    },
}

// =============================================================================
// Trade Intent
// =============================================================================

/// A requested trade action keyed by its idempotency id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeIntent {
    /// Idempotency key.
    pub id: IntentId,
    /// Target account.
    pub account_id: AccountId,
    /// Requested action.
    pub action: TradeAction,
    /// Trade the intent creates (open) or targets (close/modify).
    pub trade_id: TradeId,
    /// Instrument symbol, required for opens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instrument: Option<String>,
    /// Direction, required for opens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side: Option<Side>,
    /// Volume, required for opens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Decimal>,
    /// Protective stop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<Decimal>,
    /// Profit target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<Decimal>,
    /// Current lifecycle state.
    pub state: IntentState,
    /// Ticket reported by the terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_ref: Option<RemoteRef>,
    /// Why the intent was rolled back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<IntentFailure>,
    /// When the intent was first staged.
    pub created_at: DateTime<Utc>,
    /// Last state change.
    pub updated_at: DateTime<Utc>,
}

impl TradeIntent {
    fn base(account_id: AccountId, action: TradeAction, trade_id: TradeId) -> Self {
        let now = Utc::now();
        Self {
            id: IntentId::generate(),
            account_id,
            action,
            trade_id,
            instrument: None,
            side: None,
            size: None,
            stop_loss: None,
            take_profit: None,
            state: IntentState::Staged,
            remote_ref: None,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Intent to open a new trade.
    #[must_use]
    pub fn open(
        account_id: AccountId,
        instrument: impl Into<String>,
        side: Side,
        size: Decimal,
    ) -> Self {
        let mut intent = Self::base(account_id, TradeAction::Open, TradeId::generate());
        intent.instrument = Some(instrument.into());
        intent.side = Some(side);
        intent.size = Some(size);
        intent
    }

    /// Intent to close an open trade.
    #[must_use]
    pub fn close(account_id: AccountId, trade_id: TradeId) -> Self {
        Self::base(account_id, TradeAction::Close, trade_id)
    }

    /// Intent to change protective levels of an open trade.
    #[must_use]
    pub fn modify(
        account_id: AccountId,
        trade_id: TradeId,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Self {
        let mut intent = Self::base(account_id, TradeAction::Modify, trade_id);
        intent.stop_loss = stop_loss;
        intent.take_profit = take_profit;
        intent
    }

    /// Use a caller-supplied idempotency key.
    #[must_use]
    pub fn with_id(mut self, id: IntentId) -> Self {
        self.id = id;
        self
    }

    /// Attach protective levels.
    #[must_use]
    pub const fn with_protection(
        mut self,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Self {
        self.stop_loss = stop_loss;
        self.take_profit = take_profit;
        self
    }

    /// Check required fields for the action.
    ///
    /// # Errors
    ///
    /// Returns [`TradeError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), TradeError> {
        if self.id.is_blank() {
            return Err(TradeError::Invalid("intent id is empty".into()));
        }
        if self.account_id.is_blank() {
            return Err(TradeError::Invalid("account id is empty".into()));
        }
        for (name, level) in [("stop_loss", self.stop_loss), ("take_profit", self.take_profit)] {
            if level.is_some_and(|v| v <= Decimal::ZERO) {
                return Err(TradeError::Invalid(format!("{name} must be positive")));
            }
        }

        match self.action {
            TradeAction::Open => {
                if self.instrument.as_deref().is_none_or(|s| s.trim().is_empty()) {
                    return Err(TradeError::Invalid("open requires an instrument".into()));
                }
                if self.side.is_none() {
                    return Err(TradeError::Invalid("open requires a side".into()));
                }
                match self.size {
                    Some(size) if size > Decimal::ZERO => Ok(()),
                    Some(_) => Err(TradeError::Invalid("size must be positive".into())),
                    None => Err(TradeError::Invalid("open requires a size".into())),
                }
            }
            TradeAction::Close => {
                if self.trade_id.is_blank() {
                    return Err(TradeError::Invalid("close requires a trade id".into()));
                }
                Ok(())
            }
            TradeAction::Modify => {
                if self.trade_id.is_blank() {
                    return Err(TradeError::Invalid("modify requires a trade id".into()));
                }
                if self.stop_loss.is_none() && self.take_profit.is_none() {
                    return Err(TradeError::Invalid(
                        "modify requires stop_loss or take_profit".into(),
                    ));
                }
                Ok(())
            }
        }
    }

    fn transition(&mut self, to: IntentState) -> Result<(), TradeError> {
        IntentLifecycle::validate_transition(self.state, to)?;
        self.state = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// STAGED -> SENT.
    ///
    /// # Errors
    ///
    /// Returns an error if the intent is not staged.
    pub fn mark_sent(&mut self) -> Result<(), TradeError> {
        self.transition(IntentState::Sent)
    }

    /// SENT -> CONFIRMED, recording the terminal's ticket.
    ///
    /// # Errors
    ///
    /// Returns an error if the intent is not in flight.
    pub fn confirm(&mut self, remote_ref: Option<RemoteRef>) -> Result<(), TradeError> {
        self.transition(IntentState::Confirmed)?;
        if remote_ref.is_some() {
            self.remote_ref = remote_ref;
        }
        Ok(())
    }

    /// SENT -> REJECTED.
    ///
    /// # Errors
    ///
    /// Returns an error if the intent is not in flight.
    pub fn reject(&mut self, code: ErrorCode, message: impl Into<String>) -> Result<(), TradeError> {
        self.transition(IntentState::Rejected)?;
        self.failure = Some(IntentFailure {
            code,
            message: message.into(),
        });
        Ok(())
    }

    /// CONFIRMED -> COMMITTED.
    ///
    /// # Errors
    ///
    /// Returns an error if the intent is not confirmed.
    pub fn commit(&mut self) -> Result<(), TradeError> {
        self.transition(IntentState::Committed)
    }

    /// REJECTED or CONFIRMED -> ROLLED_BACK.
    ///
    /// # Errors
    ///
    /// Returns an error from any other state.
    pub fn roll_back(&mut self) -> Result<(), TradeError> {
        self.transition(IntentState::RolledBack)
    }

    /// CONFIRMED -> ROLLED_BACK when the books could not take a confirmed
    /// execution.
    ///
    /// # Errors
    ///
    /// Returns an error if the intent is not confirmed.
    pub fn abandon(&mut self, code: ErrorCode, message: impl Into<String>) -> Result<(), TradeError> {
        if self.state != IntentState::Confirmed {
            return Err(TradeError::InvalidTransition {
                from: self.state,
                to: IntentState::RolledBack,
            });
        }
        self.transition(IntentState::RolledBack)?;
        self.failure = Some(IntentFailure {
            code,
            message: message.into(),
        });
        Ok(())
    }
}

// =============================================================================
// Trade Record
// =============================================================================

/// Whether a committed trade is still open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    /// Position is open.
    Open,
    /// Position was closed.
    Closed,
}

/// Authoritative local record of a committed trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeRecord {
    /// Local trade id.
    pub trade_id: TradeId,
    /// Owning account.
    pub account_id: AccountId,
    /// Instrument symbol.
    pub instrument: String,
    /// Direction.
    pub side: Side,
    /// Volume.
    pub size: Decimal,
    /// Protective stop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<Decimal>,
    /// Profit target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<Decimal>,
    /// Ticket on the terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_ref: Option<RemoteRef>,
    /// Open or closed.
    pub status: TradeStatus,
    /// Intent that opened the trade.
    pub opened_by: IntentId,
    /// When the open committed.
    pub opened_at: DateTime<Utc>,
    /// When the close committed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

impl TradeRecord {
    /// Build the record a confirmed open intent creates.
    ///
    /// # Errors
    ///
    /// Returns an error if the intent is not a complete open.
    pub fn from_open(intent: &TradeIntent) -> Result<Self, TradeError> {
        let (Some(instrument), Some(side), Some(size)) =
            (intent.instrument.clone(), intent.side, intent.size)
        else {
            return Err(TradeError::Invalid("open intent is incomplete".into()));
        };
        Ok(Self {
            trade_id: intent.trade_id.clone(),
            account_id: intent.account_id.clone(),
            instrument,
            side,
            size,
            stop_loss: intent.stop_loss,
            take_profit: intent.take_profit,
            remote_ref: intent.remote_ref.clone(),
            status: TradeStatus::Open,
            opened_by: intent.id.clone(),
            opened_at: Utc::now(),
            closed_at: None,
        })
    }

    /// Apply a committed close or modify to this record.
    pub fn apply(&mut self, intent: &TradeIntent) {
        match intent.action {
            TradeAction::Open => {}
            TradeAction::Close => {
                self.status = TradeStatus::Closed;
                self.closed_at = Some(Utc::now());
            }
            TradeAction::Modify => {
                if intent.stop_loss.is_some() {
                    self.stop_loss = intent.stop_loss;
                }
                if intent.take_profit.is_some() {
                    self.take_profit = intent.take_profit;
                }
            }
        }
    }

    /// Whether the trade is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.status == TradeStatus::Open
    }
}

/// Result of a committed intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeOutcome {
    /// Intent id.
    pub intent_id: IntentId,
    /// Account.
    pub account_id: AccountId,
    /// Action performed.
    pub action: TradeAction,
    /// Final state (always `COMMITTED`).
    pub state: IntentState,
    /// Affected trade.
    pub trade_id: TradeId,
    /// Terminal ticket.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_ref: Option<RemoteRef>,
}

impl TradeOutcome {
    /// Outcome of a committed intent.
    #[must_use]
    pub fn from_intent(intent: &TradeIntent) -> Self {
        Self {
            intent_id: intent.id.clone(),
            account_id: intent.account_id.clone(),
            action: intent.action,
            state: intent.state,
            trade_id: intent.trade_id.clone(),
            remote_ref: intent.remote_ref.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn account() -> AccountId {
        AccountId::new("ACC-1")
    }

    #[test]
    fn open_intent_validates() {
        let intent = TradeIntent::open(account(), "EURUSD", Side::Buy, dec!(0.1));
        assert_eq!(intent.state, IntentState::Staged);
        assert!(intent.validate().is_ok());
    }

    #[test]
    fn open_requires_positive_size() {
        let intent = TradeIntent::open(account(), "EURUSD", Side::Buy, dec!(0));
        assert!(matches!(intent.validate(), Err(TradeError::Invalid(_))));
    }

    #[test]
    fn modify_requires_a_level() {
        let intent = TradeIntent::modify(account(), TradeId::new("t-1"), None, None);
        assert!(intent.validate().is_err());

        let intent = TradeIntent::modify(account(), TradeId::new("t-1"), Some(dec!(1.05)), None);
        assert!(intent.validate().is_ok());
    }

    #[test]
    fn negative_stop_is_rejected() {
        let intent = TradeIntent::open(account(), "EURUSD", Side::Sell, dec!(1))
            .with_protection(Some(dec!(-1)), None);
        assert!(intent.validate().is_err());
    }

    #[test]
    fn full_success_lifecycle() {
        let mut intent = TradeIntent::open(account(), "EURUSD", Side::Buy, dec!(0.1));
        intent.mark_sent().unwrap();
        intent.confirm(Some(RemoteRef::new("555"))).unwrap();
        intent.commit().unwrap();

        assert_eq!(intent.state, IntentState::Committed);
        assert_eq!(intent.remote_ref, Some(RemoteRef::new("555")));
        assert!(intent.commit().is_err());
    }

    #[test]
    fn rejection_records_failure() {
        let mut intent = TradeIntent::close(account(), TradeId::new("t-1"));
        intent.mark_sent().unwrap();
        intent
            .reject(ErrorCode::ExecutionRejected, "market closed")
            .unwrap();
        intent.roll_back().unwrap();

        assert_eq!(intent.state, IntentState::RolledBack);
        let failure = intent.failure.unwrap();
        assert_eq!(failure.code, ErrorCode::ExecutionRejected);
        assert_eq!(failure.message, "market closed");
    }

    #[test]
    fn confirmed_intent_can_be_abandoned_for_audit() {
        let mut intent = TradeIntent::open(account(), "EURUSD", Side::Buy, dec!(0.1));
        assert!(intent.abandon(ErrorCode::Internal, "too early").is_err());

        intent.mark_sent().unwrap();
        intent.confirm(Some(RemoteRef::new("555"))).unwrap();
        intent.abandon(ErrorCode::Internal, "books unavailable").unwrap();

        assert_eq!(intent.state, IntentState::RolledBack);
        assert_eq!(intent.remote_ref, Some(RemoteRef::new("555")));
        assert_eq!(intent.failure.unwrap().code, ErrorCode::Internal);
    }

    #[test]
    fn cannot_confirm_staged_intent() {
        let mut intent = TradeIntent::open(account(), "EURUSD", Side::Buy, dec!(0.1));
        let err = intent.confirm(None).unwrap_err();
        assert_eq!(
            err,
            TradeError::InvalidTransition {
                from: IntentState::Staged,
                to: IntentState::Confirmed
            }
        );
    }

    #[test]
    fn record_applies_close_and_modify() {
        let mut open = TradeIntent::open(account(), "XAUUSD", Side::Sell, dec!(2));
        open.remote_ref = Some(RemoteRef::new("9"));
        let mut record = TradeRecord::from_open(&open).unwrap();
        assert!(record.is_open());

        let modify = TradeIntent::modify(account(), record.trade_id.clone(), None, Some(dec!(1900)));
        record.apply(&modify);
        assert_eq!(record.take_profit, Some(dec!(1900)));
        assert_eq!(record.stop_loss, None);

        record.apply(&TradeIntent::close(account(), record.trade_id.clone()));
        assert!(!record.is_open());
        assert!(record.closed_at.is_some());
    }

    #[test]
    fn side_accepts_lowercase() {
        let side: Side = serde_json::from_str("\"buy\"").unwrap();
        assert_eq!(side, Side::Buy);
        assert_eq!(serde_json::to_string(&Side::Sell).unwrap(), "\"SELL\"");
    }
}
