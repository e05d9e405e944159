//! Heartbeat Monitor
//!
//! Watches inbound traffic on a channel. Asks its owner to ping on every
//! interval tick and reports the channel silent once nothing has arrived for
//! longer than the timeout. Any inbound frame counts as traffic.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between pings.
    pub ping_interval: Duration,
    /// Silence after which the channel is considered dead.
    pub silence_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            silence_timeout: Duration::from_secs(90),
        }
    }
}

impl HeartbeatConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(ping_interval: Duration, silence_timeout: Duration) -> Self {
        Self {
            ping_interval,
            silence_timeout,
        }
    }
}

/// Events emitted by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Send a ping now.
    SendPing,
    /// Nothing arrived within the timeout.
    Silent {
        /// How long the channel has been quiet.
        elapsed: Duration,
    },
}

/// Last-traffic timestamp shared between a read loop and its monitor.
#[derive(Debug)]
pub struct LivenessState {
    last_traffic: RwLock<Instant>,
}

impl Default for LivenessState {
    fn default() -> Self {
        Self::new()
    }
}

impl LivenessState {
    /// Create state as if traffic just arrived.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_traffic: RwLock::new(Instant::now()),
        }
    }

    /// Record inbound traffic.
    pub fn record_traffic(&self) {
        *self.last_traffic.write() = Instant::now();
    }

    /// Time since the last inbound traffic.
    #[must_use]
    pub fn silence(&self) -> Duration {
        self.last_traffic.read().elapsed()
    }
}

/// Heartbeat monitor for one channel.
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    state: Arc<LivenessState>,
    event_tx: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl HeartbeatMonitor {
    /// Create a new monitor.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        state: Arc<LivenessState>,
        event_tx: mpsc::Sender<HeartbeatEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            event_tx,
            cancel,
        }
    }

    /// Run until cancelled, the owner goes away, or the channel goes silent.
    pub async fn run(self) {
        let mut interval = tokio::time::interval_at(
            Instant::now() + self.config.ping_interval,
            self.config.ping_interval,
        );
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Heartbeat monitor cancelled");
                    break;
                }
                _ = interval.tick() => {
                    if !self.tick().await {
                        break;
                    }
                }
            }
        }
    }

    /// Returns `false` when the loop should stop.
    async fn tick(&self) -> bool {
        let elapsed = self.state.silence();
        if elapsed > self.config.silence_timeout {
            tracing::warn!(
                elapsed_secs = elapsed.as_secs(),
                timeout_secs = self.config.silence_timeout.as_secs(),
                "Heartbeat timeout detected"
            );
            let _ = self.event_tx.send(HeartbeatEvent::Silent { elapsed }).await;
            return false;
        }

        if self.event_tx.send(HeartbeatEvent::SendPing).await.is_err() {
            tracing::debug!("Event channel closed, stopping heartbeat");
            return false;
        }
        true
    }
}
