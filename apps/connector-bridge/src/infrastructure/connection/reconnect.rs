//! Reconnection Supervisor
//!
//! Exponential backoff for dropped channels. `next_delay` is deterministic
//! so callers and tests can reason about it; jitter is applied only to the
//! sleep actually taken.

use std::time::Duration;

use rand::Rng;

use crate::infrastructure::config::ReconnectSettings;

/// Fraction of the delay used as the jitter range.
const JITTER_FACTOR: f64 = 0.25;

/// Backoff policy for one channel.
#[derive(Debug, Clone)]
pub struct ReconnectSupervisor {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
    jitter: bool,
}

impl Default for ReconnectSupervisor {
    fn default() -> Self {
        Self::from_settings(&ReconnectSettings::default())
    }
}

impl ReconnectSupervisor {
    /// Create a supervisor. `max_attempts == 0` retries forever.
    #[must_use]
    pub const fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32, jitter: bool) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
            jitter,
        }
    }

    /// Create from configuration.
    #[must_use]
    pub const fn from_settings(settings: &ReconnectSettings) -> Self {
        Self::new(
            settings.base_delay,
            settings.max_delay,
            settings.max_attempts,
            settings.jitter,
        )
    }

    /// Delay before retry number `attempt` (1-based).
    ///
    /// `base * 2^(attempt-1)`, capped at the maximum delay.
    #[must_use]
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Whether retry number `attempt` exceeds the budget.
    #[must_use]
    pub const fn should_give_up(&self, attempt: u32) -> bool {
        self.max_attempts != 0 && attempt > self.max_attempts
    }

    /// Attempts allowed (0 = unlimited).
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Duration to actually sleep before retry number `attempt`.
    #[must_use]
    pub fn sleep_duration(&self, attempt: u32) -> Duration {
        let delay = self.next_delay(attempt);
        if !self.jitter {
            return delay;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = delay.as_millis() as f64;
        let range = base_millis * JITTER_FACTOR;
        if range < 1.0 {
            return delay;
        }
        let offset: f64 = rand::rng().random_range(-range..=range);
        let adjusted = (base_millis + offset).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Duration::from_millis(adjusted as u64)
    }
}
