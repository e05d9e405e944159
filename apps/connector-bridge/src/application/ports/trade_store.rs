//! Local trade books.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::identity::{AccountId, IntentId, TradeId};
use crate::domain::trade::{TradeIntent, TradeRecord};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// An intent with this id is already stored.
    #[error("intent {0} already exists")]
    Duplicate(IntentId),

    /// Referenced row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Row is not in a state that allows the operation.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Backend failure.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Intents and committed trades.
///
/// Staged and sent intents are not part of the books: only
/// [`TradeStore::commit`] changes a [`TradeRecord`]. Discarded intents leave
/// no row; rolled-back intents stay for audit.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TradeStore: Send + Sync {
    /// Record a new intent in `STAGED` state.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Duplicate`] if the id is already stored.
    async fn stage(&self, intent: &TradeIntent) -> Result<(), StoreError>;

    /// Persist a non-final state change (`SENT`, `CONFIRMED`, `REJECTED`).
    ///
    /// # Errors
    ///
    /// Returns an error if the intent is unknown or already final.
    async fn update_intent(&self, intent: &TradeIntent) -> Result<(), StoreError>;

    /// Apply a `COMMITTED` intent to the books atomically and return the
    /// affected trade.
    ///
    /// # Errors
    ///
    /// Returns an error if the intent is not committed or the target trade
    /// is missing.
    async fn commit(&self, intent: &TradeIntent) -> Result<TradeRecord, StoreError>;

    /// Record a `ROLLED_BACK` intent. The books are untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the intent is unknown or not rolled back.
    async fn roll_back(&self, intent: &TradeIntent) -> Result<(), StoreError>;

    /// Remove an intent that never produced a remote effect.
    ///
    /// # Errors
    ///
    /// Returns an error if the intent has progressed past `SENT`.
    async fn discard(&self, id: &IntentId) -> Result<(), StoreError>;

    /// Look up an intent.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    async fn find_intent(&self, id: &IntentId) -> Result<Option<TradeIntent>, StoreError>;

    /// Look up a committed trade.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    async fn find_trade(&self, id: &TradeId) -> Result<Option<TradeRecord>, StoreError>;

    /// Committed trades for an account, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    async fn trades(&self, account: &AccountId) -> Result<Vec<TradeRecord>, StoreError>;

    /// Intents (any state) for an account, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    async fn intents(&self, account: &AccountId) -> Result<Vec<TradeIntent>, StoreError>;
}
