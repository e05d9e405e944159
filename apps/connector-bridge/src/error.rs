//! Shared error vocabulary for the connector bridge.
//!
//! Every failure that crosses a process boundary (REST response, WebSocket
//! `ERROR` envelope, close frame) is expressed as an [`ErrorCode`] plus a
//! message. Module-level error enums convert into [`BridgeError`] at the edge.
//!
//! # Code Mapping
//!
//! | Code | HTTP | Close code | Usage |
//! |------|------|------------|-------|
//! | `OWNERSHIP_CONFLICT` | 409 | 4003 | Session binding conflicts with the account |
//! | `CONNECTOR_OFFLINE` | 503 | - | No live connector for the account |
//! | `EXECUTION_REJECTED` | 422 | - | Terminal refused the command |
//! | `EXECUTION_TIMEOUT` | 504 | - | No result before the deadline |
//! | `RATE_LIMITED` | 429 | - | Admission window exhausted |
//! | `PROTOCOL_VIOLATION` | 400 | 4008 | Malformed or unauthorized envelope |
//! | `UNAUTHORIZED` | 401 | 4001 | Missing or invalid credentials |
//! | `INVALID_REQUEST` | 400 | - | Request failed validation |
//! | `TRADE_NOT_FOUND` | 404 | - | Close/modify target missing |
//! | `UNKNOWN_TYPE` | 400 | - | Envelope type is not recognized |
//! | `INTERNAL` | 500 | 1011 | Unexpected failure |

use std::collections::HashMap;
use std::time::Duration;

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error codes shared by every outward surface of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// A session tried to bind to an account it does not own.
    OwnershipConflict,
    /// No connector is live for the target account.
    ConnectorOffline,
    /// The remote terminal rejected the command.
    ExecutionRejected,
    /// No result arrived before the execution deadline.
    ExecutionTimeout,
    /// The request exceeded its admission window.
    RateLimited,
    /// Malformed or unauthorized envelope.
    ProtocolViolation,
    /// Missing or invalid credentials.
    Unauthorized,
    /// Request failed validation.
    InvalidRequest,
    /// Close/modify referenced a trade that is not open.
    TradeNotFound,
    /// Envelope type is not part of the protocol.
    UnknownType,
    /// Unexpected internal failure.
    Internal,
}

impl ErrorCode {
    /// Wire name of the code.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::OwnershipConflict => "OWNERSHIP_CONFLICT",
            Self::ConnectorOffline => "CONNECTOR_OFFLINE",
            Self::ExecutionRejected => "EXECUTION_REJECTED",
            Self::ExecutionTimeout => "EXECUTION_TIMEOUT",
            Self::RateLimited => "RATE_LIMITED",
            Self::ProtocolViolation => "PROTOCOL_VIOLATION",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::TradeNotFound => "TRADE_NOT_FOUND",
            Self::UnknownType => "UNKNOWN_TYPE",
            Self::Internal => "INTERNAL",
        }
    }

    /// HTTP status used when the error terminates a REST request.
    #[must_use]
    pub const fn http_status(&self) -> StatusCode {
        match self {
            Self::OwnershipConflict => StatusCode::CONFLICT,
            Self::ConnectorOffline => StatusCode::SERVICE_UNAVAILABLE,
            Self::ExecutionRejected => StatusCode::UNPROCESSABLE_ENTITY,
            Self::ExecutionTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::ProtocolViolation | Self::InvalidRequest | Self::UnknownType => {
                StatusCode::BAD_REQUEST
            }
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::TradeNotFound => StatusCode::NOT_FOUND,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether a caller may retry the same request later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectorOffline | Self::RateLimited | Self::ExecutionTimeout
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A coded error with optional key/value context.
#[derive(Debug, Clone, Error)]
pub struct BridgeError {
    code: ErrorCode,
    message: String,
    retry_after: Option<Duration>,
    context: Vec<(String, String)>,
}

impl BridgeError {
    /// Create a new error.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retry_after: None,
            context: Vec::new(),
        }
    }

    /// Attach a key/value pair.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.push((key.into(), value.into()));
        self
    }

    /// Attach a retry hint.
    #[must_use]
    pub const fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Error code.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        self.code
    }

    /// Human-readable message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Retry hint, when the failure is transient.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    /// Context pairs.
    #[must_use]
    pub fn context(&self) -> &[(String, String)] {
        &self.context
    }

    /// Body returned by the REST surface.
    #[must_use]
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code,
            message: self.message.clone(),
            retry_after_ms: self
                .retry_after
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            details: self.context.iter().cloned().collect(),
        }
    }

    /// Invalid request.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    /// Missing or invalid credentials.
    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    /// Internal failure.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// JSON error body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Retry hint in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    /// Additional details.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(ErrorCode::RateLimited, StatusCode::TOO_MANY_REQUESTS)]
    #[test_case(ErrorCode::ConnectorOffline, StatusCode::SERVICE_UNAVAILABLE)]
    #[test_case(ErrorCode::ExecutionTimeout, StatusCode::GATEWAY_TIMEOUT)]
    #[test_case(ErrorCode::TradeNotFound, StatusCode::NOT_FOUND)]
    #[test_case(ErrorCode::OwnershipConflict, StatusCode::CONFLICT)]
    fn http_mapping(code: ErrorCode, status: StatusCode) {
        assert_eq!(code.http_status(), status);
    }

    #[test]
    fn code_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::ExecutionRejected).unwrap();
        assert_eq!(json, "\"EXECUTION_REJECTED\"");
        assert_eq!(ErrorCode::ExecutionRejected.as_str(), "EXECUTION_REJECTED");
    }

    #[test]
    fn body_carries_retry_hint_and_context() {
        let error = BridgeError::new(ErrorCode::RateLimited, "slow down")
            .with_retry_after(Duration::from_millis(1500))
            .with_context("account_id", "ACC-1");
        let body = error.to_body();

        assert_eq!(body.retry_after_ms, Some(1500));
        assert_eq!(body.details.get("account_id").map(String::as_str), Some("ACC-1"));
        assert_eq!(error.to_string(), "[RATE_LIMITED] slow down");
    }

    #[test]
    fn only_transient_codes_are_retryable() {
        assert!(ErrorCode::RateLimited.is_retryable());
        assert!(!ErrorCode::ExecutionRejected.is_retryable());
        assert!(!ErrorCode::ProtocolViolation.is_retryable());
    }
}
