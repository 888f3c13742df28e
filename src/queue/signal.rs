//! One-shot completion signals.
//!
//! A `OnceSignal` is set at most once and stays set: every waiter - before
//! or after the set - observes the completed state, and late arrivals return
//! immediately without racing. Used for the "initial connection attempted"
//! and "bootstrap completed" milestones, each delivered exactly once per
//! queue lifetime.

use std::time::Duration;
use tokio::sync::watch;

pub struct OnceSignal {
    tx: watch::Sender<bool>,
}

impl OnceSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Set the signal. Returns true only for the call that actually set it;
    /// later calls are no-ops.
    pub fn set(&self) -> bool {
        let mut first = false;
        self.tx.send_if_modified(|value| {
            if *value {
                false
            } else {
                *value = true;
                first = true;
                true
            }
        });
        first
    }

    /// Whether the signal has been set.
    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Block until the signal is set or the timeout elapses. Returns true
    /// if the signal was (or already is) set.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        if *rx.borrow() {
            return true;
        }
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|set| *set)).await,
            Ok(Ok(_))
        )
    }
}

impl Default for OnceSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OnceSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnceSignal").field("set", &self.is_set()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_set_is_monotonic_and_once() {
        let signal = OnceSignal::new();
        assert!(!signal.is_set());
        assert!(signal.set());
        assert!(!signal.set());
        assert!(signal.is_set());
    }

    #[tokio::test]
    async fn test_wait_after_set_returns_immediately() {
        let signal = OnceSignal::new();
        signal.set();
        assert!(signal.wait(Duration::from_millis(1)).await);
    }

    #[tokio::test]
    async fn test_wait_times_out_when_unset() {
        let signal = OnceSignal::new();
        assert!(!signal.wait(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn test_multiple_waiters_all_observe_the_set() {
        let signal = Arc::new(OnceSignal::new());
        let mut waiters = Vec::new();
        for _ in 0..4 {
            let signal = Arc::clone(&signal);
            waiters.push(tokio::spawn(async move {
                signal.wait(Duration::from_secs(5)).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.set();
        for waiter in waiters {
            assert!(waiter.await.unwrap());
        }
    }
}
