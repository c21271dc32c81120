//! Periodic background eviction.
//!
//! Both the visitor registry and the CSRF token store keep in-memory maps that would grow
//! without bound. Each implements [`Sweepable`], and a [`Sweeper`] owns the tokio task
//! that calls `sweep` on a fixed period until it is stopped.

use std::time::Duration;

use async_trait::async_trait;
use tokio::{
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

/// A structure with entries that expire and must be reclaimed periodically.
#[async_trait]
pub trait Sweepable: Send + Sync + 'static {
    /// Short name used in log lines.
    fn name(&self) -> &'static str;

    /// Removes every stale entry and returns how many were removed.
    async fn sweep(&self) -> usize;
}

/// Handle to a running sweep task.
///
/// The task holds a child of the cancellation token passed to [`Sweeper::start`], so
/// cancelling the parent stops every sweeper derived from it while [`Sweeper::stop`]
/// stops only this one.
pub struct Sweeper {
    name: &'static str,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Sweeper {
    /// Spawns a task that sweeps `target` every `period`. The first sweep happens one
    /// full period after start.
    pub fn start<T: Sweepable>(target: T, period: Duration, parent: &CancellationToken) -> Self {
        let name = target.name();
        let cancel = parent.child_token();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval_at(time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = target.sweep().await;
                        if removed > 0 {
                            tracing::debug!(sweeper = name, removed, "evicted stale entries");
                        }
                    }
                }
            }
            tracing::debug!(sweeper = name, "sweeper stopped");
        });
        tracing::info!(sweeper = name, period_secs = period.as_secs(), "sweeper started");
        Self { name, cancel, handle }
    }

    /// Returns whether the sweep task is still running.
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Cancels the sweep task and waits for it to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!(sweeper = self.name, "sweeper task ended abnormally: {}", e);
        }
    }
}
