//! Window Store Adapters
//!
//! - `local`: process-local windows in a sharded map
//! - `sqlite`: windows in a SQLite file shared by every instance on the host
//! - `fallback`: wraps a shared store and degrades to a local one while the
//!   shared store is unreachable

mod fallback;
mod local;
mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

pub use fallback::FallbackWindowStore;
pub use local::LocalWindowStore;
pub use sqlite::SqliteWindowStore;

use crate::application::ports::WindowStore;
use crate::application::services::now_ms;

/// Periodically drop expired window entries until cancelled.
pub async fn run_purger(
    store: Arc<dyn WindowStore>,
    interval: Duration,
    max_window: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match store.purge(now_ms(), max_window).await {
                    Ok(0) => {}
                    Ok(purged) => tracing::debug!(store = store.name(), purged, "Purged expired rate windows"),
                    Err(err) => tracing::warn!(store = store.name(), error = %err, "Rate window purge failed"),
                }
            }
        }
    }
}
