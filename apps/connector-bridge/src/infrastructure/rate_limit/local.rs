//! Process-local window store.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::application::ports::{WindowStore, WindowStoreError};
use crate::domain::rate_limit::{RateDecision, RateLimit, SlidingWindow};

/// Windows kept in this process. Each key is locked only for its own check.
#[derive(Debug, Default)]
pub struct LocalWindowStore {
    windows: DashMap<String, SlidingWindow>,
}

impl LocalWindowStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record and decide synchronously.
    pub fn hit_at(&self, key: &str, limit: RateLimit, now_ms: u64) -> RateDecision {
        let mut window = self.windows.entry(key.to_string()).or_default();
        window.hit(now_ms, &limit)
    }

    /// Prune every window and drop the ones left empty.
    ///
    /// `max_window` must be at least the longest window in use.
    pub fn purge_idle(&self, now_ms: u64, max_window: Duration) -> usize {
        let window_ms = u64::try_from(max_window.as_millis()).unwrap_or(u64::MAX);
        let before = self.windows.len();
        self.windows.retain(|_, window| {
            window.prune(now_ms, window_ms);
            !window.is_empty()
        });
        before.saturating_sub(self.windows.len())
    }

    /// Keys with a live window.
    #[must_use]
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    /// Whether no key has a live window.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[async_trait]
impl WindowStore for LocalWindowStore {
    async fn hit(
        &self,
        key: &str,
        limit: RateLimit,
        now_ms: u64,
    ) -> Result<RateDecision, WindowStoreError> {
        Ok(self.hit_at(key, limit, now_ms))
    }

    async fn purge(&self, now_ms: u64, max_window: Duration) -> Result<usize, WindowStoreError> {
        Ok(self.purge_idle(now_ms, max_window))
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    const LIMIT: RateLimit = RateLimit::new(3, Duration::from_secs(1));

    #[test]
    fn admits_limit_then_denies() {
        let store = LocalWindowStore::new();
        for n in 0..3 {
            assert!(store.hit_at("k", LIMIT, 1_000 + n).is_allowed());
        }
        let denied = store.hit_at("k", LIMIT, 1_010);
        assert_eq!(
            denied,
            RateDecision::Denied {
                retry_after: Duration::from_millis(990)
            }
        );
    }

    #[test]
    fn keys_are_independent() {
        let store = LocalWindowStore::new();
        for n in 0..3 {
            store.hit_at("a", LIMIT, n);
        }
        assert!(!store.hit_at("a", LIMIT, 5).is_allowed());
        assert!(store.hit_at("b", LIMIT, 5).is_allowed());
    }

    #[test]
    fn purge_drops_expired_windows() {
        let store = LocalWindowStore::new();
        store.hit_at("old", LIMIT, 0);
        store.hit_at("new", LIMIT, 5_000);

        assert_eq!(store.purge_idle(5_100, Duration::from_secs(1)), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_hits_respect_limit() {
        let store = Arc::new(LocalWindowStore::new());
        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.hit("k", LIMIT, 1_000).await.unwrap() })
            })
            .collect();

        let mut allowed = 0;
        for task in tasks {
            if task.await.unwrap().is_allowed() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 3);
    }
}
