//! # shutdown
//!
//! The shared stop flag. All polling and pacing sleeps in the backend wait
//! on this condition variable with a predicate, never on a bare
//! `sleep_for`, so a stop request interrupts them immediately.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct Shutdown {
    stopped: Mutex<bool>,
    signal: Condvar,
}

impl Shutdown {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Requests shutdown and wakes every waiter.
    pub fn trigger(&self) {
        let mut stopped = self.stopped.lock().expect("shutdown mutex poisoned");
        *stopped = true;
        self.signal.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.stopped.lock().expect("shutdown mutex poisoned")
    }

    /// Sleeps for up to `duration`, returning early (true) if shutdown was
    /// requested.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        let stopped = self.stopped.lock().expect("shutdown mutex poisoned");
        let (stopped, _timeout) = self
            .signal
            .wait_timeout_while(stopped, duration, |stopped| !*stopped)
            .expect("shutdown mutex poisoned");
        *stopped
    }
}
