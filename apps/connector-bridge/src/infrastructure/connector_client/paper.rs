//! In-memory terminal.
//!
//! Fills every order instantly at no price, numbering tickets upward. A flat
//! margin per lot is reserved against the balance so oversized orders are
//! refused the way a real broker refuses them.

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::application::ports::{TerminalCommand, TerminalError, TerminalFill, TerminalPort};
use crate::domain::identity::RemoteRef;
use crate::domain::trade::{AccountSnapshot, PositionSnapshot};

#[derive(Debug)]
struct PaperBook {
    positions: Vec<PositionSnapshot>,
    next_ticket: u64,
    balance: Decimal,
    connected: bool,
    rejection: Option<String>,
}

/// Paper-trading terminal.
#[derive(Debug)]
pub struct PaperTerminal {
    book: Mutex<PaperBook>,
    margin_per_lot: Decimal,
    currency: String,
    broker: Option<String>,
}

impl PaperTerminal {
    /// Create a connected terminal holding `balance`.
    #[must_use]
    pub fn new(balance: Decimal) -> Self {
        Self {
            book: Mutex::new(PaperBook {
                positions: Vec::new(),
                next_ticket: 1,
                balance,
                connected: true,
                rejection: None,
            }),
            margin_per_lot: Decimal::ONE_THOUSAND,
            currency: "USD".to_string(),
            broker: Some("paper".to_string()),
        }
    }

    /// Start ticket numbering at `ticket`.
    #[must_use]
    pub fn with_next_ticket(self, ticket: u64) -> Self {
        self.book.lock().next_ticket = ticket;
        self
    }

    /// Margin reserved per lot.
    #[must_use]
    pub const fn with_margin_per_lot(mut self, margin: Decimal) -> Self {
        self.margin_per_lot = margin;
        self
    }

    /// Broker label reported to the bridge.
    #[must_use]
    pub fn with_broker(mut self, broker: impl Into<String>) -> Self {
        self.broker = Some(broker.into());
        self
    }

    /// Refuse every command with `reason` until cleared with `None`.
    pub fn set_rejection(&self, reason: Option<String>) {
        self.book.lock().rejection = reason;
    }

    /// Simulate the terminal logging in or out of the broker.
    pub fn set_connected(&self, connected: bool) {
        self.book.lock().connected = connected;
    }

    fn used_margin(&self, book: &PaperBook) -> Decimal {
        book.positions
            .iter()
            .map(|p| p.size * self.margin_per_lot)
            .sum()
    }
}

#[async_trait]
impl TerminalPort for PaperTerminal {
    async fn execute(&self, command: TerminalCommand) -> Result<TerminalFill, TerminalError> {
        let mut book = self.book.lock();
        if !book.connected {
            return Err(TerminalError::Disconnected);
        }
        if let Some(reason) = &book.rejection {
            return Err(TerminalError::Rejected(reason.clone()));
        }

        match command {
            TerminalCommand::Open {
                instrument,
                side,
                size,
                stop_loss,
                take_profit,
            } => {
                let free = book.balance - self.used_margin(&book);
                if size * self.margin_per_lot > free {
                    return Err(TerminalError::Rejected("insufficient margin".to_string()));
                }

                let ticket = RemoteRef::new(book.next_ticket.to_string());
                book.next_ticket += 1;
                book.positions.push(PositionSnapshot {
                    ticket: ticket.clone(),
                    instrument,
                    side,
                    size,
                    open_price: None,
                    stop_loss,
                    take_profit,
                    profit: Some(Decimal::ZERO),
                });
                Ok(TerminalFill { ticket })
            }
            TerminalCommand::Close { ticket } => {
                let index = book
                    .positions
                    .iter()
                    .position(|p| p.ticket == ticket)
                    .ok_or_else(|| TerminalError::UnknownTicket(ticket.clone()))?;
                book.positions.remove(index);
                Ok(TerminalFill { ticket })
            }
            TerminalCommand::Modify {
                ticket,
                stop_loss,
                take_profit,
            } => {
                let position = book
                    .positions
                    .iter_mut()
                    .find(|p| p.ticket == ticket)
                    .ok_or_else(|| TerminalError::UnknownTicket(ticket.clone()))?;
                position.stop_loss = stop_loss;
                position.take_profit = take_profit;
                Ok(TerminalFill { ticket })
            }
        }
    }

    async fn positions(&self) -> Result<Vec<PositionSnapshot>, TerminalError> {
        let book = self.book.lock();
        if !book.connected {
            return Err(TerminalError::Disconnected);
        }
        Ok(book.positions.clone())
    }

    async fn account(&self) -> Result<AccountSnapshot, TerminalError> {
        let book = self.book.lock();
        if !book.connected {
            return Err(TerminalError::Disconnected);
        }
        let margin = self.used_margin(&book);
        Ok(AccountSnapshot {
            balance: book.balance,
            equity: book.balance,
            margin: Some(margin),
            free_margin: Some(book.balance - margin),
            currency: Some(self.currency.clone()),
        })
    }

    fn is_connected(&self) -> bool {
        self.book.lock().connected
    }

    fn broker(&self) -> Option<String> {
        self.broker.clone()
    }
}
