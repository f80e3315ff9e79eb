//! Pause and cancel signalling between callers and a running session.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Cooperative control flags for one session.
///
/// The control loop checks the flags at dispatch and fold boundaries and
/// awaits [`ScanControl::changed`] while it has nothing else to do.
#[derive(Debug, Default)]
pub struct ScanControl {
    cancelled: AtomicBool,
    paused: AtomicBool,
    notify: Notify,
}

impl ScanControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Wait for the next pause, resume or cancel. A signal sent while nobody
    /// waits is kept for the next call.
    pub async fn changed(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_flags() {
        let control = ScanControl::new();
        assert!(!control.is_cancelled());
        assert!(!control.is_paused());

        control.pause();
        assert!(control.is_paused());
        control.resume();
        assert!(!control.is_paused());

        control.cancel();
        control.cancel();
        assert!(control.is_cancelled());
    }

    #[tokio::test]
    async fn test_signal_before_wait_is_kept() {
        let control = ScanControl::new();
        control.cancel();
        tokio::time::timeout(Duration::from_secs(1), control.changed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wakes_waiter() {
        let control = Arc::new(ScanControl::new());
        let waiter = {
            let control = Arc::clone(&control);
            tokio::spawn(async move {
                control.changed().await;
                control.is_paused()
            })
        };

        tokio::task::yield_now().await;
        control.pause();
        let paused = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(paused);
    }
}
