//! Shared shutdown signal.
//!
//! A `ShutdownSignal` can be cloned freely; triggering any clone is observed
//! by all of them, both by polling [`ShutdownSignal::is_triggered`] and by
//! awaiting [`ShutdownSignal::wait`].

use crate::error::{BridgeError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct SignalState {
    triggered: AtomicBool,
    notify: Notify,
}

/// A one-way latch used for runtime and connection shutdown.
///
/// # Example
///
/// ```
/// use tandem::ShutdownSignal;
///
/// let signal = ShutdownSignal::new();
/// let observer = signal.clone();
///
/// signal.trigger();
/// assert!(observer.is_triggered());
/// ```
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    state: Arc<SignalState>,
}

impl ShutdownSignal {
    /// Create a new, untriggered signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger the signal and wake every waiter.
    pub fn trigger(&self) {
        self.state.triggered.store(true, Ordering::SeqCst);
        self.state.notify.notify_waiters();
    }

    /// Check if the signal has been triggered.
    pub fn is_triggered(&self) -> bool {
        self.state.triggered.load(Ordering::SeqCst)
    }

    /// Wait until the signal is triggered.
    ///
    /// Returns immediately if it already was.
    pub async fn wait(&self) {
        loop {
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent trigger is not lost.
            notified.as_mut().enable();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }

    /// Return `Err(Shutdown)` once triggered.
    pub fn check(&self) -> Result<()> {
        if self.is_triggered() {
            Err(BridgeError::Shutdown)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_new_signal_not_triggered() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_triggered());
        assert!(signal.check().is_ok());
    }

    #[test]
    fn test_clone_shares_state() {
        let signal = ShutdownSignal::new();
        let observer = signal.clone();
        signal.trigger();
        assert!(observer.is_triggered());
        assert!(matches!(observer.check(), Err(BridgeError::Shutdown)));
    }

    #[tokio::test]
    async fn test_wait_returns_after_trigger() {
        let signal = ShutdownSignal::new();
        let waiter = signal.clone();
        let task = tokio::spawn(async move { waiter.wait().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.trigger();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_on_triggered_signal_is_immediate() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        tokio::time::timeout(Duration::from_millis(100), signal.wait())
            .await
            .expect("should not block");
    }
}
