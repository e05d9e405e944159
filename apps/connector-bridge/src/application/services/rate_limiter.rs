//! Sliding-window admission.
//!
//! Wraps a [`WindowStore`] and fails open: if the store errors, the request
//! is admitted and the failure is logged and counted.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::application::ports::WindowStore;
use crate::domain::identity::AccountId;
use crate::domain::rate_limit::{RateDecision, RateLimit};
use crate::infrastructure::metrics;

/// Rate limiter over a pluggable window store.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn WindowStore>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("store", &self.store.name())
            .finish()
    }
}

impl RateLimiter {
    /// Create a limiter.
    #[must_use]
    pub fn new(store: Arc<dyn WindowStore>) -> Self {
        Self { store }
    }

    /// Record a request for `key` now and decide whether it is admitted.
    pub async fn allow(&self, key: &str, limit: RateLimit) -> RateDecision {
        self.allow_at(key, limit, now_ms()).await
    }

    /// Same as [`RateLimiter::allow`] at an explicit clock reading.
    pub async fn allow_at(&self, key: &str, limit: RateLimit, now_ms: u64) -> RateDecision {
        match self.store.hit(key, limit, now_ms).await {
            Ok(decision) => {
                metrics::record_rate_limit_decision(key_scope(key), decision.is_allowed());
                decision
            }
            Err(err) => {
                tracing::warn!(
                    key = %key,
                    store = self.store.name(),
                    error = %err,
                    "Rate limit store failed, admitting request"
                );
                metrics::record_rate_limit_store_error(self.store.name());
                RateDecision::Allowed {
                    remaining: limit.limit,
                }
            }
        }
    }
}

/// Window key for trade submissions against an account.
#[must_use]
pub fn trade_key(account: &AccountId) -> String {
    format!("trade:{account}")
}

/// Window key for API calls by a caller.
#[must_use]
pub fn api_key(caller: &str) -> String {
    format!("api:{caller}")
}

fn key_scope(key: &str) -> &str {
    key.split_once(':').map_or(key, |(scope, _)| scope)
}

/// Wall clock in Unix millis.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::application::ports::{MockWindowStore, WindowStoreError};

    const LIMIT: RateLimit = RateLimit::new(2, Duration::from_secs(1));

    #[tokio::test]
    async fn passes_store_decision_through() {
        let mut store = MockWindowStore::new();
        store.expect_name().return_const("mock");
        store.expect_hit().returning(|_, _, _| {
            Ok(RateDecision::Denied {
                retry_after: Duration::from_millis(300),
            })
        });

        let limiter = RateLimiter::new(Arc::new(store));
        let decision = limiter.allow_at("trade:A", LIMIT, 1_000).await;
        assert_eq!(
            decision,
            RateDecision::Denied {
                retry_after: Duration::from_millis(300)
            }
        );
    }

    #[tokio::test]
    async fn fails_open_on_store_error() {
        let mut store = MockWindowStore::new();
        store.expect_name().return_const("mock");
        store
            .expect_hit()
            .returning(|_, _, _| Err(WindowStoreError::Unavailable("down".into())));

        let limiter = RateLimiter::new(Arc::new(store));
        assert!(limiter.allow_at("trade:A", LIMIT, 1_000).await.is_allowed());
    }

    #[test]
    fn keys_are_scoped() {
        assert_eq!(trade_key(&AccountId::new("ACC")), "trade:ACC");
        assert_eq!(api_key("user-1"), "api:user-1");
        assert_eq!(key_scope("trade:ACC"), "trade");
        assert_eq!(key_scope("bare"), "bare");
    }
}
