// In-flight work tracking for graceful drains.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;

struct Inner {
    active: AtomicUsize,
    notify: Notify,
}

/// Counts in-flight units of work (connections, sessions) so shutdown can
/// wait for the last one to finish. `add` before handing work to a task,
/// `done` when the task completes, `wait` to drain.
#[derive(Clone)]
pub struct Drain {
    inner: Arc<Inner>,
}

impl Drain {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                active: AtomicUsize::new(0),
                notify: Notify::new(),
            }),
        }
    }

    pub fn add(&self) {
        self.inner.active.fetch_add(1, Ordering::AcqRel);
    }

    pub fn done(&self) {
        if self.inner.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Waits until every unit of work has completed. Unbounded.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Bounded drain. Returns false when work was still in flight when
    /// the grace window elapsed.
    pub async fn wait_timeout(&self, grace: Duration) -> bool {
        timeout(grace, self.wait()).await.is_ok()
    }
}

impl Default for Drain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_returns_once_drained() {
        let drain = Drain::new();
        drain.add();
        drain.add();

        let d = drain.clone();
        tokio::task::spawn(async move {
            d.done();
            d.done();
        });

        drain.wait().await;
        assert_eq!(drain.active(), 0);
    }

    #[tokio::test]
    async fn test_wait_timeout_expires() {
        let drain = Drain::new();
        drain.add();
        assert!(!drain.wait_timeout(Duration::from_millis(20)).await);
        drain.done();
        assert!(drain.wait_timeout(Duration::from_millis(20)).await);
    }
}
