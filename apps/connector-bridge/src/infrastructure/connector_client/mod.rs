//! Connector Client
//!
//! The connector side of the protocol: a WebSocket client that registers with
//! the bridge and executes commands against a [`TerminalPort`], plus an
//! in-memory terminal for demos and tests.
//!
//! [`TerminalPort`]: crate::application::ports::TerminalPort

mod client;
mod paper;

pub use client::{ConnectorClient, ConnectorClientConfig, ConnectorClientError, ConnectorEvent};
pub use paper::PaperTerminal;
