//! Domain Layer - Protocol, session and trade types.
//!
//! Pure types with serialization support and no I/O. Everything that talks
//! to sockets, clocks or storage lives in the application and
//! infrastructure layers.

/// Protocol envelopes and their JSON codec.
pub mod envelope;

/// Strongly-typed identifiers.
pub mod identity;

/// Sliding-window admission arithmetic.
pub mod rate_limit;

/// Session handles, capabilities and close reasons.
pub mod session;

/// Trade intents, lifecycle and committed records.
pub mod trade;
