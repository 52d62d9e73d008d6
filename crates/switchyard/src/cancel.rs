//! Cooperative cancellation shared between the hub and provider tasks.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Clonable flag that wakes waiters when fired.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    /// Builds a token that has not fired.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the token and wakes every waiter. Repeated calls are harmless.
    pub fn cancel(&self) {
        let (lock, condvar) = &*self.inner;
        let mut cancelled = lock.lock().unwrap_or_else(PoisonError::into_inner);
        *cancelled = true;
        condvar.notify_all();
    }

    /// Returns whether the token has fired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        let (lock, _) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until the token fires.
    pub fn wait(&self) {
        let (lock, condvar) = &*self.inner;
        let mut cancelled = lock.lock().unwrap_or_else(PoisonError::into_inner);
        while !*cancelled {
            cancelled = condvar
                .wait(cancelled)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Blocks until the token fires or `timeout` elapses.
    ///
    /// Returns `true` when the token fired.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (lock, condvar) = &*self.inner;
        let mut cancelled = lock.lock().unwrap_or_else(PoisonError::into_inner);
        while !*cancelled {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            cancelled = condvar
                .wait_timeout(cancelled, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *cancelled
    }
}
