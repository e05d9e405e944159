//! Persistence Adapters
//!
//! Implementations of the trade store port.

mod in_memory;

pub use in_memory::InMemoryTradeStore;
