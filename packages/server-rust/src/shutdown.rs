//! Node lifecycle: phase tracking, the shutdown signal, and draining of
//! in-flight cluster protocol operations.
//!
//! Takeovers and handovers hold an [`OperationGuard`] for their whole run.
//! Once shutdown begins no new guard is handed out, and the node waits for
//! the running ones before closing links.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tracing::{debug, info};

/// Lifecycle phase of a cluster node.
///
/// Starting -> Operating -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodePhase {
    Starting,
    Operating,
    /// No new protocol operations; running ones finish.
    Draining,
    Stopped,
}

#[derive(Debug)]
pub struct NodeLifecycle {
    signal: watch::Sender<bool>,
    /// Set before `signal`; paired with `in_flight` under `SeqCst` so an
    /// operation either is counted by the drain or sees the shutdown.
    stopping: AtomicBool,
    in_flight: Arc<AtomicU64>,
    phase: ArcSwap<NodePhase>,
}

impl NodeLifecycle {
    #[must_use]
    pub fn new() -> Self {
        let (signal, _rx) = watch::channel(false);
        Self {
            signal,
            stopping: AtomicBool::new(false),
            in_flight: Arc::new(AtomicU64::new(0)),
            phase: ArcSwap::from_pointee(NodePhase::Starting),
        }
    }

    pub fn set_operating(&self) {
        self.phase.store(Arc::new(NodePhase::Operating));
    }

    #[must_use]
    pub fn phase(&self) -> NodePhase {
        **self.phase.load()
    }

    /// Receiver that flips to `true` when shutdown begins.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Moves to `Draining` and wakes every subscriber.
    pub fn begin_shutdown(&self) {
        info!("Node shutdown requested; draining cluster operations");
        self.stopping.store(true, Ordering::SeqCst);
        self.phase.store(Arc::new(NodePhase::Draining));
        let _ = self.signal.send(true);
    }

    /// Registers one protocol operation. `None` once shutdown has begun.
    #[must_use]
    pub fn begin_operation(&self, name: &'static str) -> Option<OperationGuard> {
        let guard = OperationGuard::enter(&self.in_flight);
        if self.is_shutting_down() {
            debug!("refusing {name}: node is shutting down");
            return None;
        }
        Some(guard)
    }

    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Waits until no operation is running, up to `timeout`.
    ///
    /// Moves to `Stopped` and returns `true` when drained; stays `Draining`
    /// and returns `false` on expiry.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.in_flight() == 0 {
                self.phase.store(Arc::new(NodePhase::Stopped));
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for NodeLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts one running protocol operation until dropped.
#[derive(Debug)]
pub struct OperationGuard {
    in_flight: Arc<AtomicU64>,
}

impl OperationGuard {
    fn enter(in_flight: &Arc<AtomicU64>) -> Self {
        in_flight.fetch_add(1, Ordering::SeqCst);
        Self {
            in_flight: Arc::clone(in_flight),
        }
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_advance_and_operations_are_refused_after_shutdown() {
        let lifecycle = NodeLifecycle::new();
        assert_eq!(lifecycle.phase(), NodePhase::Starting);
        lifecycle.set_operating();
        assert_eq!(lifecycle.phase(), NodePhase::Operating);

        let guard = lifecycle.begin_operation("takeover");
        assert!(guard.is_some());
        assert_eq!(lifecycle.in_flight(), 1);

        lifecycle.begin_shutdown();
        assert_eq!(lifecycle.phase(), NodePhase::Draining);
        assert!(lifecycle.begin_operation("handover").is_none());
        drop(guard);
        assert_eq!(lifecycle.in_flight(), 0);
    }

    #[tokio::test]
    async fn subscribers_see_the_signal() {
        let lifecycle = NodeLifecycle::new();
        let mut rx = lifecycle.subscribe();
        assert!(!*rx.borrow());
        lifecycle.begin_shutdown();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_running_operations() {
        let lifecycle = Arc::new(NodeLifecycle::new());
        let guard = lifecycle.begin_operation("takeover").unwrap();
        lifecycle.begin_shutdown();

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });
        assert!(lifecycle.wait_for_drain(Duration::from_secs(1)).await);
        assert_eq!(lifecycle.phase(), NodePhase::Stopped);
        release.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn no_operation_starts_after_the_drain_completes() {
        let lifecycle = Arc::new(NodeLifecycle::new());
        let drained = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::new();
        for _ in 0..4 {
            let lifecycle = Arc::clone(&lifecycle);
            let drained = Arc::clone(&drained);
            workers.push(std::thread::spawn(move || {
                let mut late = 0;
                while let Some(guard) = lifecycle.begin_operation("takeover") {
                    if drained.load(Ordering::SeqCst) {
                        late += 1;
                    }
                    drop(guard);
                }
                late
            }));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        lifecycle.begin_shutdown();
        assert!(lifecycle.wait_for_drain(Duration::from_secs(5)).await);
        drained.store(true, Ordering::SeqCst);

        for worker in workers {
            assert_eq!(worker.join().unwrap(), 0);
        }
        assert!(lifecycle.begin_operation("handover").is_none());
        assert_eq!(lifecycle.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_gives_up_at_the_deadline() {
        let lifecycle = NodeLifecycle::new();
        let _guard = lifecycle.begin_operation("handover").unwrap();
        lifecycle.begin_shutdown();
        assert!(!lifecycle.wait_for_drain(Duration::from_millis(50)).await);
        assert_eq!(lifecycle.phase(), NodePhase::Draining);
    }
}
