//! A one-to-one wake signal matching the asio "exclusive signal" contract
//! from spec §4.3: `notify()` wakes a pending waiter, `notify_next()`
//! pre-signals whoever waits next, `cancel()` resumes the waiter with
//! `Aborted` instead of `Signaled`. Only one waiter is supported per cycle
//! — the dispatcher task is the only caller of [`WakeSignal::wait`].
//!
//! [`tokio::sync::Notify`] already stores a single wake-up permit for a
//! waiter that hasn't arrived yet, which is exactly `notify_next()`'s
//! "pre-signal" behavior, so both `notify()` and `notify_next()` are the
//! same call here.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeResult {
    Signaled,
    Aborted,
}

#[derive(Default)]
pub struct WakeSignal {
    notify: Notify,
    canceled: AtomicBool,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        self.notify.notify_one();
    }

    pub fn notify_next(&self) {
        self.notify.notify_one();
    }

    /// Resumes the current (or next) waiter with `Aborted` and latches
    /// canceled so every subsequent `wait()` returns immediately.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub async fn wait(&self) -> WakeResult {
        if self.canceled.load(Ordering::Acquire) {
            return WakeResult::Aborted;
        }
        self.notify.notified().await;
        if self.canceled.load(Ordering::Acquire) {
            WakeResult::Aborted
        } else {
            WakeResult::Signaled
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn notify_wakes_a_pending_waiter() {
        let signal = Arc::new(WakeSignal::new());
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.wait().await })
        };
        tokio::task::yield_now().await;
        signal.notify();
        assert_eq!(waiter.await.unwrap(), WakeResult::Signaled);
    }

    #[tokio::test]
    async fn cancel_resumes_with_aborted() {
        let signal = WakeSignal::new();
        signal.cancel();
        assert_eq!(signal.wait().await, WakeResult::Aborted);
    }
}
