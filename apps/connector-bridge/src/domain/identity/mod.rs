//! Strongly-typed identifiers.
//!
//! Accounts, connections, users, intents and trades are all strings on the
//! wire; the newtypes keep them from being mixed up in signatures.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

macro_rules! define_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create an identifier from a string.
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Generate a fresh identifier (UUID v4).
            #[must_use]
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            /// Borrow the inner string.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Whether the identifier is empty or whitespace.
            #[must_use]
            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

define_id!(AccountId, "Brokerage account identifier.");
define_id!(
    ConnectionId,
    "Stable identifier a connector presents for its terminal link."
);
define_id!(UserId, "Authenticated dashboard user.");
define_id!(IntentId, "Idempotency key of a trade intent.");
define_id!(TradeId, "Local identifier of a committed trade.");
define_id!(
    CorrelationId,
    "Pairs a command sent to a connector with its result."
);

/// Reference the remote terminal assigned to an executed trade (its ticket).
///
/// Terminals report tickets as numbers or strings; both decode to the same
/// string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RemoteRef(String);

impl RemoteRef {
    /// Create a remote reference.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RemoteRef {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(u64),
            Text(String),
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Number(n) => Self(n.to_string()),
            Repr::Text(s) => Self(s),
        })
    }
}
