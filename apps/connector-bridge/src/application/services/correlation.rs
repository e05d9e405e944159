//! Pending trade results keyed by correlation id.
//!
//! The coordinator registers a correlation before sending a command and
//! awaits the returned receiver; the router completes it when the
//! connector's `TRADE_RESULT` arrives. A result is only accepted from the
//! account the command was sent to.

use std::time::Instant;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::domain::envelope::TradeResultPayload;
use crate::domain::identity::{AccountId, CorrelationId, IntentId};

/// Completion errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompletionError {
    /// No command is waiting on this correlation (late or unsolicited result).
    #[error("no pending command for correlation {0}")]
    Unknown(CorrelationId),

    /// Result came from an account other than the command's target.
    #[error("correlation {correlation_id} belongs to account {expected}")]
    AccountMismatch {
        /// Correlation id.
        correlation_id: CorrelationId,
        /// Account the command was sent to.
        expected: AccountId,
    },
}

#[derive(Debug)]
struct Pending {
    account_id: AccountId,
    intent_id: IntentId,
    registered_at: Instant,
    sender: oneshot::Sender<TradeResultPayload>,
}

/// Table of commands awaiting a result.
#[derive(Debug, Default)]
pub struct PendingResults {
    inner: DashMap<CorrelationId, Pending>,
}

impl PendingResults {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command and get the receiver for its result.
    pub fn register(
        &self,
        correlation_id: CorrelationId,
        account_id: AccountId,
        intent_id: IntentId,
    ) -> oneshot::Receiver<TradeResultPayload> {
        let (sender, receiver) = oneshot::channel();
        self.inner.insert(
            correlation_id,
            Pending {
                account_id,
                intent_id,
                registered_at: Instant::now(),
                sender,
            },
        );
        receiver
    }

    /// Deliver a result from a connector bound to `account`.
    ///
    /// Returns the intent the result belongs to.
    ///
    /// # Errors
    ///
    /// Returns [`CompletionError::Unknown`] if nothing waits on the
    /// correlation, or [`CompletionError::AccountMismatch`] if the result
    /// came from the wrong account (the entry stays pending).
    pub fn complete(
        &self,
        account: &AccountId,
        result: TradeResultPayload,
    ) -> Result<IntentId, CompletionError> {
        let correlation_id = result.correlation_id.clone();
        let removed = self
            .inner
            .remove_if(&correlation_id, |_, pending| &pending.account_id == account);

        let Some((_, pending)) = removed else {
            return match self.inner.get(&correlation_id) {
                Some(pending) => Err(CompletionError::AccountMismatch {
                    correlation_id,
                    expected: pending.account_id.clone(),
                }),
                None => Err(CompletionError::Unknown(correlation_id)),
            };
        };

        tracing::debug!(
            correlation_id = %correlation_id,
            intent_id = %pending.intent_id,
            elapsed_ms = pending.registered_at.elapsed().as_millis(),
            success = result.success,
            "Trade result received"
        );
        // Receiver dropped means the coordinator already gave up.
        let _ = pending.sender.send(result);
        Ok(pending.intent_id)
    }

    /// Drop a pending entry (deadline passed or send failed).
    pub fn cancel(&self, correlation_id: &CorrelationId) {
        self.inner.remove(correlation_id);
    }

    /// Commands awaiting a result.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
