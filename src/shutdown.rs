// Shutdown - root cancellation shared by every long-lived task

use tokio::sync::watch;

/// A cloneable, one-way shutdown flag
///
/// Once triggered it stays triggered. Every clone observes the same flag.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }

    /// Request shutdown of all tasks holding a clone of this signal
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown has been triggered (immediately if it already was)
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives in `self`, so `wait_for` cannot observe a closed channel
        let _ = rx.wait_for(|triggered| *triggered).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_wakes_all_clones() {
        let shutdown = ShutdownSignal::new();
        let a = shutdown.clone();
        let b = shutdown.clone();

        let wait_a = tokio::spawn(async move { a.cancelled().await });
        let wait_b = tokio::spawn(async move { b.cancelled().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!shutdown.is_triggered());
        shutdown.trigger();

        tokio::time::timeout(Duration::from_secs(1), wait_a)
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), wait_b)
            .await
            .unwrap()
            .unwrap();
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_cancelled_after_trigger_returns_immediately() {
        let shutdown = ShutdownSignal::new();
        shutdown.trigger();
        tokio::time::timeout(Duration::from_millis(50), shutdown.cancelled())
            .await
            .unwrap();
    }
}
