//! Reference counted gate over outstanding indexer requests
//!
//! Every request to the indexer holds a [`RequestGuard`] for its duration. The first guard of
//! an idle synchronizer starts a sync epoch and the last one to drop ends it, so readers can
//! wait for all known work to settle before answering.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::trace;

type Callback = Box<dyn Fn() + Send + Sync>;

/// Counts outstanding requests and signals sync epochs.
pub struct Synchronizer {
    count: Mutex<usize>,
    idle: watch::Sender<bool>,
    on_sync_started: Callback,
    on_sync_done: Callback,
}

impl std::fmt::Debug for Synchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synchronizer")
            .field("count", &*self.count.lock())
            .finish()
    }
}

impl Synchronizer {
    pub fn new(
        on_sync_started: impl Fn() + Send + Sync + 'static,
        on_sync_done: impl Fn() + Send + Sync + 'static,
    ) -> Arc<Self> {
        let (idle, _) = watch::channel(true);
        Arc::new(Self {
            count: Mutex::new(0),
            idle,
            on_sync_started: Box::new(on_sync_started),
            on_sync_done: Box::new(on_sync_done),
        })
    }

    /// A synchronizer without callbacks.
    pub fn detached() -> Arc<Self> {
        Self::new(|| {}, || {})
    }

    /// Registers an outstanding request. The request ends when the guard is dropped.
    pub fn inc_request_count(self: &Arc<Self>) -> RequestGuard {
        let mut count = self.count.lock();
        *count += 1;
        trace!(count = *count, "request started");
        if *count == 1 {
            self.idle.send_replace(false);
            (self.on_sync_started)();
        }
        RequestGuard {
            synchronizer: Arc::clone(self),
        }
    }

    fn dec_request_count(&self) {
        let mut count = self.count.lock();
        if *count == 0 {
            panic!("request counter went negative");
        }
        *count -= 1;
        trace!(count = *count, "request finished");
        if *count == 0 {
            // Waiters wake up after the callback has run.
            (self.on_sync_done)();
            self.idle.send_replace(true);
        }
    }

    pub fn request_count(&self) -> usize {
        *self.count.lock()
    }

    /// Resolves once no request is outstanding. Returns immediately if none is.
    pub async fn wait_synchronized(&self) {
        let mut idle = self.idle.subscribe();
        // The sender lives as long as `self`, so the channel cannot close while waiting.
        let _ = idle.wait_for(|idle| *idle).await;
    }
}

/// Marks one outstanding request.
#[must_use = "the request ends when the guard is dropped"]
pub struct RequestGuard {
    synchronizer: Arc<Synchronizer>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.synchronizer.dec_request_count();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting() -> (Arc<Synchronizer>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let started = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        let (s, d) = (started.clone(), done.clone());
        let sync = Synchronizer::new(
            move || {
                s.fetch_add(1, Ordering::SeqCst);
            },
            move || {
                d.fetch_add(1, Ordering::SeqCst);
            },
        );
        (sync, started, done)
    }

    #[test]
    fn test_epochs_fire_on_transitions_only() {
        let (sync, started, done) = counting();
        let a = sync.inc_request_count();
        let b = sync.inc_request_count();
        assert_eq!(sync.request_count(), 2);
        assert_eq!(started.load(Ordering::SeqCst), 1);
        drop(a);
        assert_eq!(done.load(Ordering::SeqCst), 0);
        drop(b);
        assert_eq!(done.load(Ordering::SeqCst), 1);

        let c = sync.inc_request_count();
        drop(c);
        assert_eq!(started.load(Ordering::SeqCst), 2);
        assert_eq!(done.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_idle() {
        let sync = Synchronizer::detached();
        tokio::time::timeout(Duration::from_secs(1), sync.wait_synchronized())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_blocks_until_last_request_ends() {
        let sync = Synchronizer::detached();
        let guard = sync.inc_request_count();

        let waiter = {
            let sync = sync.clone();
            tokio::spawn(async move { sync.wait_synchronized().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
