//! Lock-free in-flight request counters.

use std::sync::atomic::{AtomicI64, Ordering};

/// Number of requests currently in flight against a cluster or destination.
#[derive(Debug, Default)]
pub struct ConcurrencyCounter {
    value: AtomicI64,
}

impl ConcurrencyCounter {
    /// Current number of in-flight requests.
    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Increment the counter and return a guard that decrements it on drop.
    pub fn enter(&self) -> ConcurrencyGuard<'_> {
        self.value.fetch_add(1, Ordering::Relaxed);
        ConcurrencyGuard { counter: self }
    }
}

/// RAII guard returned by [`ConcurrencyCounter::enter`].
pub struct ConcurrencyGuard<'a> {
    counter: &'a ConcurrencyCounter,
}

impl Drop for ConcurrencyGuard<'_> {
    fn drop(&mut self) {
        self.counter.value.fetch_sub(1, Ordering::Relaxed);
    }
}
