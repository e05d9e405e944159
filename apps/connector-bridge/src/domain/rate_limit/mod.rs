//! Sliding-window admission.
//!
//! A window is the ordered list of admitted request timestamps for one key.
//! Each check records the new timestamp, prunes entries that have aged out,
//! and admits iff the remaining count (new entry included) is within the
//! limit. A denied request is removed again, so denials never extend the
//! caller's wait.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Admission limit for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Requests admitted per window.
    pub limit: u32,
    /// Window length.
    pub window: Duration,
}

impl RateLimit {
    /// Create a limit.
    #[must_use]
    pub const fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window }
    }

    /// Window length in milliseconds.
    #[must_use]
    pub fn window_ms(&self) -> u64 {
        u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// Admitted.
    Allowed {
        /// Requests left in the current window.
        remaining: u32,
    },
    /// Denied.
    Denied {
        /// Wait until the next request would be admitted.
        retry_after: Duration,
    },
}

impl RateDecision {
    /// Whether the request was admitted.
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// Timestamps admitted for one key, oldest first.
#[derive(Debug, Clone, Default)]
pub struct SlidingWindow {
    entries: VecDeque<u64>,
}

impl SlidingWindow {
    /// Create an empty window.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop entries at or before `now_ms - window_ms`.
    pub fn prune(&mut self, now_ms: u64, window_ms: u64) {
        let cutoff = now_ms.saturating_sub(window_ms);
        while self.entries.front().is_some_and(|&ts| ts <= cutoff) {
            self.entries.pop_front();
        }
    }

    /// Record a request at `now_ms` and decide admission.
    pub fn hit(&mut self, now_ms: u64, limit: &RateLimit) -> RateDecision {
        let window_ms = limit.window_ms();
        self.insert(now_ms);
        self.prune(now_ms, window_ms);

        let count = self.entries.len();
        let max = limit.limit as usize;
        if count <= max {
            return RateDecision::Allowed {
                remaining: u32::try_from(max - count).unwrap_or(0),
            };
        }

        self.remove(now_ms);
        RateDecision::Denied {
            retry_after: retry_after(&self.entries, now_ms, window_ms, max),
        }
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the window holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, ts: u64) {
        // Clock steps backwards can deliver out-of-order timestamps.
        let at = self.entries.partition_point(|&e| e <= ts);
        self.entries.insert(at, ts);
    }

    fn remove(&mut self, ts: u64) {
        if let Some(at) = self.entries.iter().rposition(|&e| e == ts) {
            self.entries.remove(at);
        }
    }
}

/// Time until `entries` (sorted oldest first, already pruned, excluding the
/// denied request) has room for one more admission.
#[must_use]
pub fn retry_after(entries: &VecDeque<u64>, now_ms: u64, window_ms: u64, limit: usize) -> Duration {
    // Admission needs len - expired + 1 <= limit.
    let must_expire = (entries.len() + 1).saturating_sub(limit);
    if must_expire == 0 {
        return Duration::ZERO;
    }
    entries.get(must_expire - 1).map_or(Duration::ZERO, |&ts| {
        Duration::from_millis((ts + window_ms).saturating_sub(now_ms).max(1))
    })
}
