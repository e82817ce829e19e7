//! One-shot readiness latch.
//!
//! Signals "the outbound connection is confirmed open" from the dispatch
//! loop to the orchestrator waiting to let inbound traffic flow. The wait is
//! bounded and reports a timeout as a distinct result rather than an error.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;
use tokio::time::{timeout, Duration};

/// Outcome of a bounded latch wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchWait {
    Ready,
    TimedOut,
}

/// Single-fire latch: `ready` flips it once, `wait` blocks (with timeout)
/// until it has flipped.
#[derive(Debug, Default)]
pub struct ReadyLatch {
    ready: AtomicBool,
    notify: Notify,
}

impl ReadyLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Fires the latch. Subsequent calls have no effect.
    pub fn ready(&self) {
        if !self.ready.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }

    /// Waits until the latch fires, for at most `dur`.
    pub async fn wait(&self, dur: Duration) -> LatchWait {
        if self.is_ready() {
            return LatchWait::Ready;
        }

        let fired = async {
            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.is_ready() {
                    return;
                }
                notified.await;
            }
        };

        match timeout(dur, fired).await {
            Ok(()) => LatchWait::Ready,
            Err(_) => LatchWait::TimedOut,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn wait_returns_immediately_when_already_ready() {
        let latch = ReadyLatch::new();
        latch.ready();
        assert_eq!(latch.wait(Duration::from_millis(1)).await, LatchWait::Ready);
    }

    #[tokio::test]
    async fn wait_observes_a_later_ready() {
        let latch = Arc::new(ReadyLatch::new());
        let signaller = Arc::clone(&latch);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            signaller.ready();
        });

        assert_eq!(latch.wait(Duration::from_secs(5)).await, LatchWait::Ready);
    }

    #[tokio::test]
    async fn wait_times_out_when_never_fired() {
        let latch = ReadyLatch::new();
        assert_eq!(
            latch.wait(Duration::from_millis(20)).await,
            LatchWait::TimedOut
        );
        assert!(!latch.is_ready());
    }

    #[tokio::test]
    async fn ready_is_single_fire() {
        let latch = ReadyLatch::new();
        latch.ready();
        latch.ready();
        assert!(latch.is_ready());
        assert_eq!(latch.wait(Duration::from_millis(1)).await, LatchWait::Ready);
    }
}
