//! Connection Lifecycle
//!
//! Reconnection and keepalive policy shared by every long-lived channel.

pub mod heartbeat;
pub mod reconnect;

pub use heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatMonitor, LivenessState};
pub use reconnect::ReconnectSupervisor;
