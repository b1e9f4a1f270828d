//! Sync barrier between log processing and readers
//!
//! The processor calls `begin()` for every log entry it dequeues and `end()`
//! once the entry is fully applied. Readers wait on the barrier so they never
//! observe a half-applied message. When the pending count returns to zero the
//! queued waiters fire once each, in registration order.
//!
//! One extra `begin()` is held for the backlog: it is released with
//! [`SyncBarrier::release_backlog`] when the log reports it has caught up, and
//! the `backlog_replayed` flag flips the first time the barrier drains after
//! that, so entries dequeued alongside the marker count as backlog too. Until
//! then event emission is suppressed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::error;

enum Waiter {
    Wake(oneshot::Sender<()>),
    Run(Box<dyn FnOnce() + Send>),
}

impl Waiter {
    fn fire(self) {
        match self {
            // Receiver may have been dropped by a cancelled reader
            Waiter::Wake(tx) => {
                let _ = tx.send(());
            }
            Waiter::Run(f) => f(),
        }
    }
}

#[derive(Default)]
struct BarrierState {
    pending: usize,
    waiters: Vec<Waiter>,
}

#[derive(Default)]
pub struct SyncBarrier {
    state: Mutex<BarrierState>,
    backlog_replayed: Arc<AtomicBool>,
}

impl SyncBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BarrierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn begin(&self) {
        self.state().pending += 1;
    }

    pub fn end(&self) {
        let ready = {
            let mut state = self.state();
            if state.pending == 0 {
                error!("SyncBarrier::end called with nothing pending");
                return;
            }
            state.pending -= 1;
            if state.pending > 0 {
                return;
            }
            std::mem::take(&mut state.waiters)
        };

        // Fire outside the lock so waiters may re-enter the barrier
        for waiter in ready {
            waiter.fire();
        }
    }

    pub fn pending(&self) -> usize {
        self.state().pending
    }

    /// Run `f` once nothing is pending: immediately if already idle,
    /// otherwise when the count next reaches zero.
    pub fn on_synced<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.state();
            if state.pending > 0 {
                state.waiters.push(Waiter::Run(Box::new(f)));
                return;
            }
        }
        f();
    }

    /// Wait until nothing is pending
    pub async fn synced(&self) {
        let rx = {
            let mut state = self.state();
            if state.pending == 0 {
                return;
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push(Waiter::Wake(tx));
            rx
        };
        let _ = rx.await;
    }

    /// Release the backlog hold taken at startup. The replayed flag flips once
    /// every entry dequeued so far has finished.
    pub fn release_backlog(&self) {
        let flag = self.backlog_replayed.clone();
        self.on_synced(move || flag.store(true, Ordering::SeqCst));
        self.end();
    }

    pub fn is_backlog_replayed(&self) -> bool {
        self.backlog_replayed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for SyncBarrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("SyncBarrier")
            .field("pending", &state.pending)
            .field("waiters", &state.waiters.len())
            .field("backlog_replayed", &self.is_backlog_replayed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_on_synced_runs_immediately_when_idle() {
        let barrier = SyncBarrier::new();
        let hit = Arc::new(AtomicBool::new(false));
        let flag = hit.clone();
        barrier.on_synced(move || flag.store(true, Ordering::SeqCst));
        assert!(hit.load(Ordering::SeqCst));
    }

    #[test]
    fn test_waiters_fire_in_order_when_drained() {
        let barrier = SyncBarrier::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        barrier.begin();
        barrier.begin();
        for i in 0..3 {
            let order = order.clone();
            barrier.on_synced(move || order.lock().unwrap().push(i));
        }

        barrier.end();
        assert!(order.lock().unwrap().is_empty());

        barrier.end();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);

        // Queue was cleared; another drain fires nothing new
        barrier.begin();
        barrier.end();
        assert_eq!(order.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_end_without_begin_is_ignored() {
        let barrier = SyncBarrier::new();
        barrier.end();
        assert_eq!(barrier.pending(), 0);
    }

    #[test]
    fn test_backlog_flag_waits_for_inflight_entries() {
        let barrier = SyncBarrier::new();
        barrier.begin(); // backlog hold
        barrier.begin(); // entry dequeued alongside the marker

        barrier.release_backlog();
        assert!(!barrier.is_backlog_replayed());

        barrier.end();
        assert!(barrier.is_backlog_replayed());
    }

    #[tokio::test]
    async fn test_synced_wakes_reader() {
        let barrier = Arc::new(SyncBarrier::new());
        barrier.begin();

        let reader = {
            let barrier = barrier.clone();
            tokio::spawn(async move { barrier.synced().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!reader.is_finished());

        barrier.end();
        tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
    }
}
