//! Countdown latch used as a rendezvous across reactor threads.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

/// Blocks waiters until the count reaches zero
#[derive(Debug)]
pub struct CountDownLatch {
    count: Mutex<usize>,
    zero: Condvar,
}

impl CountDownLatch {
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            zero: Condvar::new(),
        }
    }

    /// Decrement the count, waking all waiters when it hits zero
    pub fn count_down(&self) {
        let mut count = self.count.lock();
        if *count == 0 {
            return;
        }
        *count -= 1;
        if *count == 0 {
            self.zero.notify_all();
        }
    }

    pub fn count(&self) -> usize {
        *self.count.lock()
    }

    /// Block until the count reaches zero
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.zero.wait(&mut count);
        }
    }

    /// Block until zero or timeout; returns whether zero was reached
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let mut count = self.count.lock();
        while *count > 0 {
            if self.zero.wait_for(&mut count, timeout).timed_out() {
                return *count == 0;
            }
        }
        true
    }

    /// Guard that counts down once when dropped, whether or not its task ran
    pub fn guard(self: &Arc<Self>) -> CountDownGuard {
        CountDownGuard {
            latch: Arc::clone(self),
        }
    }
}

/// Counts its latch down on drop
#[derive(Debug)]
pub struct CountDownGuard {
    latch: Arc<CountDownLatch>,
}

impl Drop for CountDownGuard {
    fn drop(&mut self) {
        self.latch.count_down();
    }
}
