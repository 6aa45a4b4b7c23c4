//! Cancel-and-reschedule timer for coalescing bursts of work.
//!
//! Each call arms a fresh timer after aborting the previous one, so the
//! action runs once per quiet period.  Used to batch schedule edits into a
//! single device sync, but carries no schedule-specific logic.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct Debouncer {
    delay: Duration,
    pending: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Arc::new(Mutex::new(None)),
        }
    }

    /// Schedule `action` to run after the quiet period.  A pending timer is
    /// always cancelled before the new one is armed.
    pub async fn call<F, Fut>(&self, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let delay = self.delay;
        let mut pending = self.pending.lock().await;
        if let Some(prev) = pending.take() {
            prev.abort();
        }
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            action().await;
        }));
    }

    /// Cancel any pending action.  Must be called on teardown so nothing
    /// fires against a dismantled controller.
    pub async fn cancel(&self) {
        if let Some(prev) = self.pending.lock().await.take() {
            prev.abort();
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
