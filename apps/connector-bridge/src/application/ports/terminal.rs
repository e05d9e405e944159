//! Brokerage terminal behind a connector.
//!
//! The connector client drives a `TerminalPort`; the bridge never talks to
//! a terminal directly.

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::domain::identity::RemoteRef;
use crate::domain::trade::{AccountSnapshot, PositionSnapshot, Side};

/// Terminal errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TerminalError {
    /// Broker refused the request.
    #[error("rejected: {0}")]
    Rejected(String),

    /// Referenced ticket does not exist.
    #[error("unknown ticket {0}")]
    UnknownTicket(RemoteRef),

    /// Terminal is not logged in to the broker.
    #[error("terminal disconnected")]
    Disconnected,
}

/// A command for the terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalCommand {
    /// Open a position.
    Open {
        /// Instrument symbol.
        instrument: String,
        /// Direction.
        side: Side,
        /// Volume.
        size: Decimal,
        /// Protective stop.
        stop_loss: Option<Decimal>,
        /// Profit target.
        take_profit: Option<Decimal>,
    },
    /// Close a position.
    Close {
        /// Position ticket.
        ticket: RemoteRef,
    },
    /// Change protective levels.
    Modify {
        /// Position ticket.
        ticket: RemoteRef,
        /// New stop.
        stop_loss: Option<Decimal>,
        /// New target.
        take_profit: Option<Decimal>,
    },
}

/// Successful execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalFill {
    /// Ticket of the affected position.
    pub ticket: RemoteRef,
}

/// Trading terminal.
#[async_trait]
pub trait TerminalPort: Send + Sync {
    /// Execute a command.
    ///
    /// # Errors
    ///
    /// Returns a [`TerminalError`] if the terminal refuses or cannot run it.
    async fn execute(&self, command: TerminalCommand) -> Result<TerminalFill, TerminalError>;

    /// Open positions.
    ///
    /// # Errors
    ///
    /// Returns [`TerminalError::Disconnected`] if the terminal is offline.
    async fn positions(&self) -> Result<Vec<PositionSnapshot>, TerminalError>;

    /// Account balances.
    ///
    /// # Errors
    ///
    /// Returns [`TerminalError::Disconnected`] if the terminal is offline.
    async fn account(&self) -> Result<AccountSnapshot, TerminalError>;

    /// Whether the terminal is logged in to the broker.
    fn is_connected(&self) -> bool;

    /// Broker label.
    fn broker(&self) -> Option<String>;
}
