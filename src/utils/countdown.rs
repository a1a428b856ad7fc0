use parking_lot::{Condvar, Mutex};

use std::sync::Arc;

/// A resettable countdown latch.
///
/// The selector loop arms it with the size of a dispatch batch, every
/// dispatched job counts down once, and the loop waits for zero before it
/// reuses the shared event buffer or frees retired slots.
pub(crate) struct Countdown {
    remaining: Mutex<usize>,
    zero: Condvar,
}

impl Countdown {
    pub(crate) fn new() -> Self {
        Self {
            remaining: Mutex::new(0),
            zero: Condvar::new(),
        }
    }

    /// Arms the latch for `count` arrivals.
    pub(crate) fn reset(&self, count: usize) {
        *self.remaining.lock() = count;
    }

    /// Records one arrival.
    pub(crate) fn count_down(&self) {
        let mut remaining = self.remaining.lock();
        *remaining = remaining.saturating_sub(1);

        if *remaining == 0 {
            self.zero.notify_all();
        }
    }

    /// Blocks until every arrival was recorded.
    pub(crate) fn wait(&self) {
        let mut remaining = self.remaining.lock();
        while *remaining > 0 {
            self.zero.wait(&mut remaining);
        }
    }

    /// Returns a guard that counts down when dropped, even on unwind.
    pub(crate) fn arrival(self: &Arc<Self>) -> Arrival {
        Arrival {
            latch: self.clone(),
        }
    }
}

pub(crate) struct Arrival {
    latch: Arc<Countdown>,
}

impl Drop for Arrival {
    fn drop(&mut self) {
        self.latch.count_down();
    }
}
