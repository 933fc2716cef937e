//! Counting semaphore used to park and release mutator threads.
//!
//! The collector composes several of these into its stop-the-world
//! handshake. A single instance only promises that each `post` releases
//! some waiter; it makes no fairness guarantee among waiters.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::trace;

/// A counting semaphore.
#[derive(Debug)]
pub struct PauseSemaphore {
    count: Mutex<u32>,
    available: Condvar,
}

impl PauseSemaphore {
    /// Create a semaphore holding `value` permits.
    pub const fn new(value: u32) -> Self {
        Self {
            count: Mutex::new(value),
            available: Condvar::new(),
        }
    }

    /// Reset the permit count. Must not race with waiters.
    pub fn init(&self, value: u32) {
        *self.count.lock() = value;
    }

    /// Block until a permit is available, then take it.
    ///
    /// `what` names the wait in trace output.
    pub fn wait(&self, what: &str) {
        let mut count = self.count.lock();
        while *count == 0 {
            trace!(what, "pause semaphore: waiting");
            self.available.wait(&mut count);
        }
        *count -= 1;
        trace!(what, remaining = *count, "pause semaphore: acquired");
    }

    /// Take a permit if one is available without blocking.
    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock();
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    /// Wait at most `timeout` for a permit. Returns whether one was taken.
    pub fn wait_timeout(&self, what: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count == 0 {
            if self.available.wait_until(&mut count, deadline).timed_out() && *count == 0 {
                trace!(what, ?timeout, "pause semaphore: timed out");
                return false;
            }
        }
        *count -= 1;
        true
    }

    /// Add a permit and wake one waiter.
    pub fn post(&self, what: &str) {
        let mut count = self.count.lock();
        *count = count.saturating_add(1);
        trace!(what, count = *count, "pause semaphore: posted");
        drop(count);
        self.available.notify_one();
    }

    /// Permits currently available.
    pub fn value(&self) -> u32 {
        *self.count.lock()
    }

    /// Tear the semaphore down. Consuming `self` guarantees no waiter is left.
    pub fn destroy(self) {
        trace!(remaining = self.value(), "pause semaphore: destroyed");
    }
}

impl Default for PauseSemaphore {
    fn default() -> Self {
        Self::new(0)
    }
}
