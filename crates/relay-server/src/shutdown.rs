use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Owns the shutdown lifecycle: a flag that refuses new work, a token that
/// cancels timers and writer loops, and a tracker that waits for connection
/// tasks up to the grace deadline.
pub struct ShutdownCoordinator {
    closing: AtomicBool,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            closing: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// True once shutdown has begun; upgrades and publishes are refused.
    pub fn is_shutting_down(&self) -> bool {
        self.closing.load(Ordering::Relaxed)
    }

    pub fn begin(&self) {
        self.closing.store(true, Ordering::Relaxed);
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Cancel everything and wait up to `grace` for tracked tasks. Returns
    /// false if stragglers were abandoned at the deadline.
    pub async fn finish(&self, grace: Duration) -> bool {
        self.cancel.cancel();
        self.tracker.close();
        match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(
                    grace_ms = grace.as_millis() as u64,
                    "shutdown grace elapsed with tasks still running"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn begin_flips_flag() {
        let s = ShutdownCoordinator::new();
        assert!(!s.is_shutting_down());
        s.begin();
        assert!(s.is_shutting_down());
    }

    #[tokio::test]
    async fn finish_waits_for_tracked_tasks() {
        let s = ShutdownCoordinator::new();
        let token = s.token();
        s.tracker().spawn(async move {
            token.cancelled().await;
        });
        s.begin();
        assert!(s.finish(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn finish_gives_up_at_deadline() {
        let s = ShutdownCoordinator::new();
        s.tracker().spawn(async {
            // Ignores cancellation.
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        s.begin();
        assert!(!s.finish(Duration::from_secs(10)).await);
    }

    #[tokio::test]
    async fn finish_with_no_tasks_is_immediate() {
        let s = ShutdownCoordinator::new();
        assert!(s.finish(Duration::from_millis(10)).await);
    }
}
