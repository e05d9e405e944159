//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `SessionRegistry`: live connector and client sessions, liveness sweep
//! - `MessageRouter`: inbound validation/dispatch and outbound delivery
//! - `TradeExecutionCoordinator`: two-phase trade execution
//! - `RateLimiter`: sliding-window admission over a `WindowStore`
//! - `ReconciliationTracker`: conflicts between local books and the terminal

mod coordinator;
mod correlation;
mod outbox;
mod rate_limiter;
mod reconciliation;
mod registry;
mod router;

pub use coordinator::{
    CoordinatorConfig, SubmitError, TradeExecutionCoordinator, intent_from_command,
};
pub use correlation::{CompletionError, PendingResults};
pub use outbox::{Outbox, OutboxError, OutboxReceiver, PushOutcome};
pub use rate_limiter::{RateLimiter, api_key, now_ms, trade_key};
pub use reconciliation::{Conflict, ConflictKind, ReconciliationTracker};
pub use registry::{
    ClientRegistration, ClientRoute, ConnectorRegistration, ConnectorRoute, RegistryError,
    RegistryEvent, SessionRegistry, SharedRegistry, run_sweeper,
};
pub use router::{
    ClientRequest, FanOutReport, InboundError, MessageRouter, RouterConfig, RouterError,
};
