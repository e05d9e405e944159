//! Backing store for rate-limit windows.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::rate_limit::{RateDecision, RateLimit};

/// Window store errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WindowStoreError {
    /// Store cannot be reached.
    #[error("window store unavailable: {0}")]
    Unavailable(String),
}

/// Per-key sliding windows.
///
/// `hit` must record, prune, count and decide as one atomic step per key.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Record a request for `key` at `now_ms` and decide admission.
    ///
    /// # Errors
    ///
    /// Returns [`WindowStoreError::Unavailable`] if the store is unreachable.
    async fn hit(
        &self,
        key: &str,
        limit: RateLimit,
        now_ms: u64,
    ) -> Result<RateDecision, WindowStoreError>;

    /// Drop entries older than `max_window` across all keys and return how
    /// many were removed.
    ///
    /// `max_window` must be at least the longest window in use.
    ///
    /// # Errors
    ///
    /// Returns [`WindowStoreError::Unavailable`] if the store is unreachable.
    async fn purge(&self, now_ms: u64, max_window: Duration) -> Result<usize, WindowStoreError>;

    /// Store label for logs and metrics.
    fn name(&self) -> &'static str;
}
