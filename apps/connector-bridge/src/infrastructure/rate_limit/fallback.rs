//! Shared store with an explicit local fallback.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::local::LocalWindowStore;
use crate::application::ports::{WindowStore, WindowStoreError};
use crate::domain::rate_limit::{RateDecision, RateLimit};
use crate::infrastructure::metrics;

/// Uses `shared` while it answers and `local` while it does not.
///
/// Windows are not copied between the two, so a degraded period starts with
/// empty local windows.
pub struct FallbackWindowStore {
    shared: Arc<dyn WindowStore>,
    local: Arc<LocalWindowStore>,
    degraded: AtomicBool,
}

impl std::fmt::Debug for FallbackWindowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackWindowStore")
            .field("shared", &self.shared.name())
            .field("degraded", &self.is_degraded())
            .finish_non_exhaustive()
    }
}

impl FallbackWindowStore {
    /// Wrap `shared` with `local` as the fallback.
    #[must_use]
    pub fn new(shared: Arc<dyn WindowStore>, local: Arc<LocalWindowStore>) -> Self {
        Self {
            shared,
            local,
            degraded: AtomicBool::new(false),
        }
    }

    /// Whether the last hit was served locally.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl WindowStore for FallbackWindowStore {
    async fn hit(
        &self,
        key: &str,
        limit: RateLimit,
        now_ms: u64,
    ) -> Result<RateDecision, WindowStoreError> {
        match self.shared.hit(key, limit, now_ms).await {
            Ok(decision) => {
                if self.degraded.swap(false, Ordering::Relaxed) {
                    tracing::info!(store = self.shared.name(), "Shared rate window store recovered");
                }
                Ok(decision)
            }
            Err(err) => {
                if !self.degraded.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        store = self.shared.name(),
                        error = %err,
                        "Shared rate window store unreachable, using local windows"
                    );
                }
                metrics::record_rate_limit_fallback();
                Ok(self.local.hit_at(key, limit, now_ms))
            }
        }
    }

    async fn purge(&self, now_ms: u64, max_window: Duration) -> Result<usize, WindowStoreError> {
        let local = self.local.purge_idle(now_ms, max_window);
        match self.shared.purge(now_ms, max_window).await {
            Ok(shared) => Ok(local + shared),
            Err(err) => {
                tracing::debug!(store = self.shared.name(), error = %err, "Shared purge skipped");
                Ok(local)
            }
        }
    }

    fn name(&self) -> &'static str {
        "fallback"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::MockWindowStore;

    const LIMIT: RateLimit = RateLimit::new(1, Duration::from_secs(10));

    #[tokio::test]
    async fn uses_shared_store_when_healthy() {
        let mut shared = MockWindowStore::new();
        shared.expect_name().return_const("mock");
        shared
            .expect_hit()
            .times(1)
            .returning(|_, _, _| Ok(RateDecision::Allowed { remaining: 0 }));

        let local = Arc::new(LocalWindowStore::new());
        let store = FallbackWindowStore::new(Arc::new(shared), Arc::clone(&local));

        assert!(store.hit("k", LIMIT, 1).await.unwrap().is_allowed());
        assert!(!store.is_degraded());
        assert!(local.is_empty());
    }

    #[tokio::test]
    async fn degrades_to_local_windows() {
        let mut shared = MockWindowStore::new();
        shared.expect_name().return_const("mock");
        shared
            .expect_hit()
            .returning(|_, _, _| Err(WindowStoreError::Unavailable("gone".into())));

        let store = FallbackWindowStore::new(Arc::new(shared), Arc::new(LocalWindowStore::new()));

        assert!(store.hit("k", LIMIT, 1).await.unwrap().is_allowed());
        assert!(store.is_degraded());
        // Local windows still enforce the limit.
        assert!(!store.hit("k", LIMIT, 2).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn recovers_when_shared_store_answers_again() {
        let mut shared = MockWindowStore::new();
        let mut seq = mockall::Sequence::new();
        shared.expect_name().return_const("mock");
        shared
            .expect_hit()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Err(WindowStoreError::Unavailable("blip".into())));
        shared
            .expect_hit()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(RateDecision::Allowed { remaining: 0 }));

        let store = FallbackWindowStore::new(Arc::new(shared), Arc::new(LocalWindowStore::new()));
        store.hit("k", LIMIT, 1).await.unwrap();
        assert!(store.is_degraded());
        store.hit("k", LIMIT, 2).await.unwrap();
        assert!(!store.is_degraded());
    }

    #[tokio::test]
    async fn purge_sweeps_both_stores() {
        let mut shared = MockWindowStore::new();
        shared.expect_name().return_const("mock");
        shared.expect_purge().times(1).returning(|_, _| Ok(2));
        let local = Arc::new(LocalWindowStore::new());
        local.hit_at("k", LIMIT, 0);

        let store = FallbackWindowStore::new(Arc::new(shared), Arc::clone(&local));

        assert_eq!(store.purge(60_000, Duration::from_secs(10)).await.unwrap(), 3);
        assert!(local.is_empty());
    }

    #[tokio::test]
    async fn purge_tolerates_unreachable_shared_store() {
        let mut shared = MockWindowStore::new();
        shared.expect_name().return_const("mock");
        shared
            .expect_purge()
            .returning(|_, _| Err(WindowStoreError::Unavailable("gone".into())));

        let store = FallbackWindowStore::new(Arc::new(shared), Arc::new(LocalWindowStore::new()));

        assert_eq!(store.purge(60_000, Duration::from_secs(10)).await.unwrap(), 0);
    }
}
