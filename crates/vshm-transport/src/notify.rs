//! Edge-triggered notification objects.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Default)]
struct Inner {
    pending: Mutex<u64>,
    cond: Condvar,
}

/// A signal handle. `trigger` records an edge; a waiter consumes every edge recorded so far
/// in one go. Clones share the same object.
#[derive(Clone, Default)]
pub struct Notifier {
    inner: Arc<Inner>,
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("pending", &*self.lock())
            .finish()
    }
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, u64> {
        // The counter stays consistent even if a holder panicked.
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn trigger(&self) {
        let mut pending = self.lock();
        *pending = pending.saturating_add(1);
        self.inner.cond.notify_all();
    }

    /// Consume pending edges without blocking. Returns how many were pending.
    pub fn try_take(&self) -> u64 {
        std::mem::take(&mut *self.lock())
    }

    /// Block until at least one edge is pending, then consume all of them.
    pub fn wait(&self) -> u64 {
        let mut pending = self.lock();
        while *pending == 0 {
            pending = self
                .inner
                .cond
                .wait(pending)
                .unwrap_or_else(PoisonError::into_inner);
        }
        std::mem::take(&mut *pending)
    }

    /// Like [`Notifier::wait`] but gives up after `timeout`, returning `0`.
    pub fn wait_timeout(&self, timeout: Duration) -> u64 {
        let deadline = Instant::now() + timeout;
        let mut pending = self.lock();
        while *pending == 0 {
            let now = Instant::now();
            if now >= deadline {
                return 0;
            }
            let (guard, _) = self
                .inner
                .cond
                .wait_timeout(pending, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            pending = guard;
        }
        std::mem::take(&mut *pending)
    }

    pub fn same_object(&self, other: &Notifier) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
