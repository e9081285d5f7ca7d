//! Cooperative shutdown signal for background tasks.
//!
//! The balancer runner and migration workers sleep between rounds and
//! during retry back-off; a Condvar-backed wait lets `shutdown()` wake
//! them within milliseconds instead of letting the full interval elapse.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Clonable shutdown signal. All clones share the same state; once
/// `shutdown()` is called every waiter wakes immediately and every
/// subsequent `wait_timeout` returns at once.
#[derive(Clone)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

struct Inner {
    stopped: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                stopped: AtomicBool::new(false),
                mutex: Mutex::new(()),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Request shutdown and wake all waiters.
    pub fn shutdown(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.condvar.notify_all();
    }

    /// Non-blocking check.
    pub fn is_shutdown(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Sleep for at most `duration`, waking early on `shutdown()`.
    /// Returns `true` if shutdown was requested; the caller should exit
    /// its loop.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        if self.is_shutdown() {
            return true;
        }
        let guard = self.inner.mutex.lock().unwrap_or_else(|e| e.into_inner());
        let _ = self
            .inner
            .condvar
            .wait_timeout(guard, duration)
            .unwrap_or_else(|e| e.into_inner());
        self.is_shutdown()
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
    use std::time::Instant;

    #[test]
    fn test_starts_not_shutdown() {
        assert!(!ShutdownSignal::new().is_shutdown());
    }

    #[test]
    fn test_wait_returns_immediately_after_shutdown() {
        let sig = ShutdownSignal::new();
        sig.shutdown();
        let start = Instant::now();
        assert!(sig.wait_timeout(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_shutdown_wakes_a_blocked_waiter() {
        let sig = ShutdownSignal::new();
        let waiter = sig.clone();
        let handle = std::thread::spawn(move || {
            let start = Instant::now();
            (waiter.wait_timeout(Duration::from_secs(10)), start.elapsed())
        });
        std::thread::sleep(Duration::from_millis(20));
        sig.shutdown();
        let (stopped, elapsed) = handle.join().unwrap();
        assert!(stopped);
        assert!(elapsed < Duration::from_secs(1));
    }

    #[test]
    fn test_wait_expires_without_shutdown() {
        let sig = ShutdownSignal::new();
        assert!(!sig.wait_timeout(Duration::from_millis(20)));
    }
}
