//! In-memory trade store.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::application::ports::{StoreError, TradeStore};
use crate::domain::identity::{AccountId, IntentId, TradeId};
use crate::domain::trade::{
    IntentLifecycle, IntentState, TradeAction, TradeIntent, TradeRecord,
};

#[derive(Debug, Default)]
struct Books {
    intents: HashMap<IntentId, TradeIntent>,
    trades: HashMap<TradeId, TradeRecord>,
}

/// In-memory implementation of [`TradeStore`].
///
/// Intents and trades share one lock, so a commit updates both atomically.
#[derive(Debug, Default)]
pub struct InMemoryTradeStore {
    books: RwLock<Books>,
}

impl InMemoryTradeStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored intents, including rolled-back ones.
    #[must_use]
    pub fn intent_count(&self) -> usize {
        self.books.read().intents.len()
    }

    fn expect_state(intent: &TradeIntent, state: IntentState) -> Result<(), StoreError> {
        if intent.state == state {
            Ok(())
        } else {
            Err(StoreError::InvalidState(format!(
                "intent {} is {}, expected {state}",
                intent.id, intent.state
            )))
        }
    }

    fn ensure_open_row(books: &Books, id: &IntentId) -> Result<(), StoreError> {
        match books.intents.get(id) {
            None => Err(StoreError::NotFound(format!("intent {id}"))),
            Some(stored) if stored.state.is_final() => Err(StoreError::InvalidState(format!(
                "intent {id} is already {}",
                stored.state
            ))),
            Some(_) => Ok(()),
        }
    }
}

#[async_trait]
impl TradeStore for InMemoryTradeStore {
    async fn stage(&self, intent: &TradeIntent) -> Result<(), StoreError> {
        Self::expect_state(intent, IntentState::Staged)?;
        let mut books = self.books.write();
        if books.intents.contains_key(&intent.id) {
            return Err(StoreError::Duplicate(intent.id.clone()));
        }
        books.intents.insert(intent.id.clone(), intent.clone());
        Ok(())
    }

    async fn update_intent(&self, intent: &TradeIntent) -> Result<(), StoreError> {
        if intent.state.is_final() {
            return Err(StoreError::InvalidState(format!(
                "intent {} is {}; use commit or roll_back",
                intent.id, intent.state
            )));
        }
        let mut books = self.books.write();
        Self::ensure_open_row(&books, &intent.id)?;
        books.intents.insert(intent.id.clone(), intent.clone());
        Ok(())
    }

    async fn commit(&self, intent: &TradeIntent) -> Result<TradeRecord, StoreError> {
        Self::expect_state(intent, IntentState::Committed)?;
        let mut books = self.books.write();
        Self::ensure_open_row(&books, &intent.id)?;

        let record = match intent.action {
            TradeAction::Open => {
                let mut record = TradeRecord::from_open(intent)
                    .map_err(|e| StoreError::InvalidState(e.to_string()))?;
                if let Some(existing) = books.trades.get(&intent.trade_id) {
                    record.opened_at = existing.opened_at;
                }
                record
            }
            TradeAction::Close | TradeAction::Modify => {
                let mut record = books
                    .trades
                    .get(&intent.trade_id)
                    .cloned()
                    .ok_or_else(|| StoreError::NotFound(format!("trade {}", intent.trade_id)))?;
                record.apply(intent);
                record
            }
        };

        books.trades.insert(record.trade_id.clone(), record.clone());
        books.intents.insert(intent.id.clone(), intent.clone());
        Ok(record)
    }

    async fn roll_back(&self, intent: &TradeIntent) -> Result<(), StoreError> {
        Self::expect_state(intent, IntentState::RolledBack)?;
        let mut books = self.books.write();
        Self::ensure_open_row(&books, &intent.id)?;
        books.intents.insert(intent.id.clone(), intent.clone());
        Ok(())
    }

    async fn discard(&self, id: &IntentId) -> Result<(), StoreError> {
        let mut books = self.books.write();
        match books.intents.get(id) {
            None => Ok(()),
            Some(stored) if IntentLifecycle::is_discardable(stored.state) => {
                books.intents.remove(id);
                Ok(())
            }
            Some(stored) => Err(StoreError::InvalidState(format!(
                "intent {id} is {} and cannot be discarded",
                stored.state
            ))),
        }
    }

    async fn find_intent(&self, id: &IntentId) -> Result<Option<TradeIntent>, StoreError> {
        Ok(self.books.read().intents.get(id).cloned())
    }

    async fn find_trade(&self, id: &TradeId) -> Result<Option<TradeRecord>, StoreError> {
        Ok(self.books.read().trades.get(id).cloned())
    }

    async fn trades(&self, account: &AccountId) -> Result<Vec<TradeRecord>, StoreError> {
        let books = self.books.read();
        let mut trades: Vec<TradeRecord> = books
            .trades
            .values()
            .filter(|t| &t.account_id == account)
            .cloned()
            .collect();
        trades.sort_by(|a, b| a.opened_at.cmp(&b.opened_at).then_with(|| a.trade_id.cmp(&b.trade_id)));
        Ok(trades)
    }

    async fn intents(&self, account: &AccountId) -> Result<Vec<TradeIntent>, StoreError> {
        let books = self.books.read();
        let mut intents: Vec<TradeIntent> = books
            .intents
            .values()
            .filter(|i| &i.account_id == account)
            .cloned()
            .collect();
        intents.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(intents)
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::domain::identity::RemoteRef;
    use crate::domain::trade::Side;
    use crate::error::ErrorCode;

    fn account() -> AccountId {
        AccountId::new("ACC-1")
    }

    fn open() -> TradeIntent {
        TradeIntent::open(account(), "EURUSD", Side::Buy, dec!(0.5))
    }

    async fn committed(store: &InMemoryTradeStore, mut intent: TradeIntent) -> (TradeIntent, TradeRecord) {
        store.stage(&intent).await.unwrap();
        intent.mark_sent().unwrap();
        store.update_intent(&intent).await.unwrap();
        intent.confirm(Some(RemoteRef::new("42"))).unwrap();
        intent.commit().unwrap();
        let record = store.commit(&intent).await.unwrap();
        (intent, record)
    }

    #[tokio::test]
    async fn staged_intents_are_not_trades() {
        let store = InMemoryTradeStore::new();
        let intent = open();
        store.stage(&intent).await.unwrap();

        assert!(store.trades(&account()).await.unwrap().is_empty());
        assert!(store.find_trade(&intent.trade_id).await.unwrap().is_none());
        assert_eq!(store.intents(&account()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_stage_is_rejected() {
        let store = InMemoryTradeStore::new();
        let intent = open();
        store.stage(&intent).await.unwrap();
        assert_eq!(
            store.stage(&intent).await,
            Err(StoreError::Duplicate(intent.id.clone()))
        );
    }

    #[tokio::test]
    async fn commit_creates_record() {
        let store = InMemoryTradeStore::new();
        let (intent, record) = committed(&store, open()).await;

        assert!(record.is_open());
        assert_eq!(record.remote_ref, Some(RemoteRef::new("42")));
        assert_eq!(store.trades(&account()).await.unwrap(), vec![record]);
        let stored = store.find_intent(&intent.id).await.unwrap().unwrap();
        assert_eq!(stored.state, IntentState::Committed);
    }

    #[tokio::test]
    async fn close_commit_closes_record() {
        let store = InMemoryTradeStore::new();
        let (_, record) = committed(&store, open()).await;

        let (_, closed) = committed(&store, TradeIntent::close(account(), record.trade_id.clone())).await;
        assert!(!closed.is_open());
        assert!(closed.closed_at.is_some());
    }

    #[tokio::test]
    async fn rollback_is_kept_for_audit() {
        let store = InMemoryTradeStore::new();
        let mut intent = open();
        store.stage(&intent).await.unwrap();
        intent.mark_sent().unwrap();
        intent.reject(ErrorCode::ExecutionRejected, "no margin").unwrap();
        intent.roll_back().unwrap();
        store.roll_back(&intent).await.unwrap();

        assert!(store.trades(&account()).await.unwrap().is_empty());
        let stored = store.find_intent(&intent.id).await.unwrap().unwrap();
        assert_eq!(stored.state, IntentState::RolledBack);
        assert!(store.discard(&intent.id).await.is_err());
    }

    #[tokio::test]
    async fn discard_removes_in_flight_intent() {
        let store = InMemoryTradeStore::new();
        let intent = open();
        store.stage(&intent).await.unwrap();
        store.discard(&intent.id).await.unwrap();

        assert_eq!(store.intent_count(), 0);
        store.discard(&intent.id).await.unwrap();
    }

    #[tokio::test]
    async fn commit_requires_committed_state() {
        let store = InMemoryTradeStore::new();
        let intent = open();
        store.stage(&intent).await.unwrap();
        assert!(matches!(
            store.commit(&intent).await,
            Err(StoreError::InvalidState(_))
        ));
    }
}
