//! Cooperative shutdown signal shared across the runtime.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// Latched shutdown flag with wakeups for waiting tasks.
///
/// Set by the signal handlers and by `refresh_worker` jobs; observed by the
/// orchestrator and the acquisition loop. Once requested it never resets.
#[derive(Debug, Default)]
pub struct Shutdown {
    requested: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    /// Fresh, un-triggered signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch the signal and wake all waiters. Idempotent.
    pub fn request(&self) {
        if !self.requested.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    /// Whether shutdown has been requested.
    pub fn requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Wait until the signal latches.
    pub async fn wait(&self) {
        while !self.requested() {
            let notified = self.notify.notified();
            if self.requested() {
                return;
            }
            notified.await;
        }
    }
}
