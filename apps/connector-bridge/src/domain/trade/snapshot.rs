//! Terminal-reported state.
//!
//! Snapshots are what the connector says its terminal holds. They are
//! forwarded to observers and compared against the local books, but never
//! written into them.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Side;
use crate::domain::identity::RemoteRef;

/// One open position on the terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    /// Terminal ticket.
    pub ticket: RemoteRef,
    /// Instrument symbol.
    #[serde(alias = "symbol")]
    pub instrument: String,
    /// Direction.
    pub side: Side,
    /// Volume.
    #[serde(alias = "volume")]
    pub size: Decimal,
    /// Entry price.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_price: Option<Decimal>,
    /// Protective stop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<Decimal>,
    /// Profit target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<Decimal>,
    /// Floating profit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profit: Option<Decimal>,
}

/// Account balances reported by the terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSnapshot {
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

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn position_accepts_terminal_field_names() {
        let json = r#"{"ticket": 555, "symbol": "EURUSD", "side": "BUY", "volume": "0.10"}"#;
        let position: PositionSnapshot = serde_json::from_str(json).unwrap();

        assert_eq!(position.ticket, RemoteRef::new("555"));
        assert_eq!(position.instrument, "EURUSD");
        assert_eq!(position.size, dec!(0.10));
        assert!(position.stop_loss.is_none());
    }
}
