//! Background loop that flushes the swipe queue and syncs on a fixed period.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::state::AppContext;
use crate::swipes::SwipeQueue;
use crate::sync::SyncEngine;

/// Handle to the running loop.  Dropping it stops the loop.
pub struct SyncScheduler {
    handle: JoinHandle<()>,
}

impl SyncScheduler {
    /// Start ticking every `config.sync_interval`.  The first tick fires
    /// immediately.
    pub fn start(ctx: Arc<AppContext>, engine: SyncEngine) -> Self {
        Self::start_with_interval(ctx.clone(), engine, ctx.config().sync_interval)
    }

    pub fn start_with_interval(ctx: Arc<AppContext>, engine: SyncEngine, period: Duration) -> Self {
        // `interval` panics on a zero period.
        let period = period.max(Duration::from_millis(1));
        let queue = SwipeQueue::new(ctx);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(period_secs = period.as_secs(), "sync scheduler started");
            loop {
                ticker.tick().await;
                if let Err(e) = queue.flush().await {
                    tracing::warn!(error = %e, "swipe flush failed");
                }
                // Failures are logged and reported by the engine itself.
                let _ = engine.sync().await;
            }
        });
        Self { handle }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        self.handle.abort();
        tracing::debug!("sync scheduler stopped");
    }
}
