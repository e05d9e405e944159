//! Application Layer - Use cases and port definitions.
//!
//! Services here own the bridge's shared state (session registry, pending
//! correlations, in-flight intents) and reach storage and the terminal
//! only through the ports.

/// Port interfaces for storage, rate-limit windows, terminals and auth.
pub mod ports;

/// Registry, router, coordinator, limiter and reconciliation services.
pub mod services;
