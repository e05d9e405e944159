//! Port Interfaces
//!
//! Contracts that infrastructure adapters implement, following the
//! hexagonal layout used across the workspace.
//!
//! ## Driven Ports (Outbound)
//!
//! - `TradeStore`: local books (intents and committed trades)
//! - `WindowStore`: backing store for rate-limit windows
//! - `TerminalPort`: brokerage terminal behind a connector
//!
//! ## Driver Ports (Inbound)
//!
//! - `Authenticator`: resolves bearer tokens to principals

mod auth;
mod terminal;
mod trade_store;
mod window_store;

pub use auth::{AuthError, Authenticator, Principal};
pub use terminal::{TerminalCommand, TerminalError, TerminalFill, TerminalPort};
pub use trade_store::{StoreError, TradeStore};
pub use window_store::{WindowStore, WindowStoreError};

#[cfg(test)]
pub use trade_store::MockTradeStore;
#[cfg(test)]
pub use window_store::MockWindowStore;
