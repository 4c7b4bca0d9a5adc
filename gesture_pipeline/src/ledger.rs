//! Bookkeeping for tensor and model output buffers.
//!
//! Every buffer that crosses a pipeline stage is wrapped in a [`Tracked`] guard. Dropping the
//! guard releases the buffer and records the release, on every exit path including errors and
//! unwinding. The counters make the no-leak property of the tick loop observable.
use std::{
    fmt,
    ops::Deref,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

#[derive(Debug, Default)]
struct Counters {
    allocated: AtomicU64,
    released: AtomicU64,
}

/// Shared allocation ledger. Clones refer to the same counters.
#[derive(Clone, Debug, Default)]
pub struct BufferLedger {
    counters: Arc<Counters>,
}

impl BufferLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `value` and account for it until the guard is dropped.
    pub fn track<T>(&self, value: T) -> Tracked<T> {
        self.counters.allocated.fetch_add(1, Ordering::SeqCst);
        Tracked {
            value,
            ledger: self.clone(),
        }
    }

    pub fn allocated(&self) -> u64 {
        self.counters.allocated.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> u64 {
        self.counters.released.load(Ordering::SeqCst)
    }

    /// Number of buffers currently alive.
    pub fn live(&self) -> u64 {
        // Read `released` first so a concurrent release never makes the difference negative.
        let released = self.released();
        self.allocated().saturating_sub(released)
    }
}

/// A buffer owned through a [`BufferLedger`].
pub struct Tracked<T> {
    value: T,
    ledger: BufferLedger,
}

impl<T> Tracked<T> {
    /// Release the buffer now.
    pub fn release(self) {
        drop(self)
    }
}

impl<T> Deref for Tracked<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> Drop for Tracked<T> {
    fn drop(&mut self) {
        self.ledger.counters.released.fetch_add(1, Ordering::SeqCst);
    }
}

impl<T: fmt::Debug> fmt::Debug for Tracked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Tracked").field(&self.value).finish()
    }
}
