//! Periodic background sweep
//!
//! Rotated refresh tokens and consumed codes are kept until swept so that
//! replays can be identified, which means storage only shrinks when this
//! task runs. The task is independent of the request path.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::engine::OAuthEngine;

/// Spawn a task that sweeps every store each `interval`.
///
/// The first sweep happens one full interval after spawning, since
/// `initialize` already dropped expired entries on load.
pub fn spawn_sweep_task(engine: Arc<OAuthEngine>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let report = engine.sweep().await;
            debug!(removed = report.total(), "sweep cycle complete");
        }
    })
}
