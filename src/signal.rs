//! Manual-reset wait primitive.
//!
//! `WaitSignal` is the blocking point shared by pending operations (the
//! harvesting thread waits on it) and by the event monitor (close sets it to
//! unblock a pending hardware event wait).

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A manual-reset event: once set, every waiter is released until `reset`.
#[derive(Debug, Default)]
pub struct WaitSignal {
    set: Mutex<bool>,
    cond: Condvar,
}

impl WaitSignal {
    /// Create an unset signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the signal and wake every waiter.
    pub fn set(&self) {
        let mut set = self.set.lock();
        *set = true;
        self.cond.notify_all();
    }

    /// Return the signal to the unset state.
    pub fn reset(&self) {
        *self.set.lock() = false;
    }

    /// Whether the signal is currently set.
    pub fn is_set(&self) -> bool {
        *self.set.lock()
    }

    /// Block until the signal is set.
    pub fn wait(&self) {
        let mut set = self.set.lock();
        while !*set {
            self.cond.wait(&mut set);
        }
    }

    /// Block until the signal is set or `timeout` elapses.
    ///
    /// Returns `true` if the signal was observed set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut set = self.set.lock();
        while !*set {
            if self.cond.wait_until(&mut set, deadline).timed_out() {
                return *set;
            }
        }
        true
    }
}
