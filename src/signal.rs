//! Cancellation signalling between brokers and their in-flight work.

use std::sync::Arc;

use tokio::sync::watch;

/// A clonable, sticky cancellation latch.
///
/// Once [`abort`][AbortSignal::abort] has been called, every current
/// and future [`aborted`][AbortSignal::aborted] wait completes
/// immediately.
#[derive(Debug, Clone)]
pub(crate) struct AbortSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortSignal {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Latch the signal and wake every waiter.
    pub(crate) fn abort(&self) {
        self.tx.send_replace(true);
    }

    pub(crate) fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the signal is aborted.
    pub(crate) async fn aborted(&self) {
        let mut rx = self.tx.subscribe();
        // wait_for resolves immediately when the latch is already set;
        // the sender cannot drop while `self` borrows it
        let _ = rx.wait_for(|aborted| *aborted).await;
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn abort_is_sticky() {
        let signal = AbortSignal::new();
        assert!(!signal.is_aborted());
        signal.abort();
        assert!(signal.is_aborted());
        // resolves immediately even for waits registered after the fact
        signal.aborted().await;
    }

    #[tokio::test]
    async fn abort_wakes_waiters() {
        let signal = AbortSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.aborted().await })
        };
        tokio::task::yield_now().await;
        signal.abort();
        waiter.await.unwrap();
    }
}
