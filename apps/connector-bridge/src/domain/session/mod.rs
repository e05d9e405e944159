//! Session Types
//!
//! A session is one live channel: either a connector bound to exactly one
//! account, or a client observing a set of accounts. Sessions are owned by
//! the registry; everything else holds a [`SessionHandle`], which stays
//! valid as an identifier after the session is gone (lookups simply miss).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::identity::{AccountId, ConnectionId, UserId};

// =============================================================================
// Handles
// =============================================================================

/// Which side of the bridge a session belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    /// Trading-terminal connector.
    Connector,
    /// Dashboard client.
    Client,
}

impl SessionKind {
    /// Metric/log label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Connector => "connector",
            Self::Client => "client",
        }
    }
}

/// Opaque handle to a registered session.
///
/// The generation number changes on every registration, so a handle from a
/// replaced session never resolves to its successor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionHandle {
    /// Connector session keyed by its connection id.
    Connector {
        /// Registration generation.
        generation: u64,
        /// Connection id the session registered under.
        connection_id: ConnectionId,
    },
    /// Client session.
    Client {
        /// Registration generation.
        generation: u64,
    },
}

impl SessionHandle {
    /// Registration generation.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        match self {
            Self::Connector { generation, .. } | Self::Client { generation } => *generation,
        }
    }

    /// Session kind.
    #[must_use]
    pub const fn kind(&self) -> SessionKind {
        match self {
            Self::Connector { .. } => SessionKind::Connector,
            Self::Client { .. } => SessionKind::Client,
        }
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connector {
                generation,
                connection_id,
            } => write!(f, "connector:{connection_id}#{generation}"),
            Self::Client { generation } => write!(f, "client#{generation}"),
        }
    }
}

/// Delivery capability negotiated at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Push over a persistent channel.
    #[default]
    Streaming,
    /// Caller drains its queue by periodic requests.
    Polling,
}

// =============================================================================
// Connector State
// =============================================================================

/// Whether the connector reports its terminal as connected to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalStatus {
    /// Terminal is logged in to the broker.
    Connected,
    /// Terminal lost its broker link.
    Disconnected,
    /// No status reported yet.
    #[default]
    Unknown,
}

impl TerminalStatus {
    /// Build from an optional connected flag.
    #[must_use]
    pub const fn from_flag(flag: Option<bool>) -> Self {
        match flag {
            Some(true) => Self::Connected,
            Some(false) => Self::Disconnected,
            None => Self::Unknown,
        }
    }
}

/// Snapshot of a connector as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    /// Connection id.
    pub connection_id: ConnectionId,
    /// Bound account.
    pub account_id: AccountId,
    /// Broker label reported by the connector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker: Option<String>,
    /// Terminal link status.
    pub terminal_status: TerminalStatus,
    /// Last inbound traffic.
    pub last_seen: DateTime<Utc>,
    /// When the session registered.
    pub connected_at: DateTime<Utc>,
}

/// Snapshot of a client session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientStatus {
    /// Session generation.
    pub generation: u64,
    /// Authenticated user.
    pub user_id: UserId,
    /// Observed accounts.
    pub accounts: Vec<AccountId>,
    /// Delivery capability.
    pub capability: Capability,
}

// =============================================================================
// Close Reasons
// =============================================================================

/// Why a session was closed by the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed or the session ended normally.
    Normal,
    /// A newer session took the same key.
    Replaced,
    /// The outbound queue could not absorb a critical message.
    QueueFull,
    /// The peer sent a malformed or unauthorized envelope.
    ProtocolViolation(String),
    /// Registration conflicted with an existing account binding.
    OwnershipConflict,
    /// Credentials were missing or invalid.
    Unauthorized,
    /// No traffic within the liveness threshold.
    Expired,
    /// Process shutting down.
    Shutdown,
}

impl CloseReason {
    /// WebSocket close code sent to the peer.
    #[must_use]
    pub const fn close_code(&self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::Shutdown => 1001,
            Self::Unauthorized => 4001,
            Self::OwnershipConflict => 4003,
            Self::ProtocolViolation(_) => 4008,
            Self::QueueFull => 4009,
            Self::Replaced => 4010,
            Self::Expired => 4011,
        }
    }

    /// Short label for logs, metrics and close frames.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Replaced => "replaced",
            Self::QueueFull => "queue_full",
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::OwnershipConflict => "ownership_conflict",
            Self::Unauthorized => "unauthorized",
            Self::Expired => "expired",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProtocolViolation(detail) => write!(f, "protocol_violation: {detail}"),
            other => f.write_str(other.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_codes_are_distinct_for_protocol_failures() {
        let reasons = [
            CloseReason::Unauthorized,
            CloseReason::OwnershipConflict,
            CloseReason::ProtocolViolation("x".into()),
            CloseReason::QueueFull,
            CloseReason::Replaced,
            CloseReason::Expired,
        ];
        let mut codes: Vec<u16> = reasons.iter().map(CloseReason::close_code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), reasons.len());
    }

    #[test]
    fn handle_display_includes_generation() {
        let handle = SessionHandle::Connector {
            generation: 7,
            connection_id: ConnectionId::new("term-1"),
        };
        assert_eq!(handle.to_string(), "connector:term-1#7");
        assert_eq!(handle.kind(), SessionKind::Connector);
        assert_eq!(SessionHandle::Client { generation: 3 }.generation(), 3);
    }

    #[test]
    fn terminal_status_from_flag() {
        assert_eq!(TerminalStatus::from_flag(Some(true)), TerminalStatus::Connected);
        assert_eq!(TerminalStatus::from_flag(Some(false)), TerminalStatus::Disconnected);
        assert_eq!(TerminalStatus::from_flag(None), TerminalStatus::Unknown);
    }
}
