//! Cooperative stop flag with interruptible waits.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Inner {
    stopped: Mutex<bool>,
    cond: Condvar,
}

/// Cloneable handle; every clone observes the same flag.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<Inner>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        let mut stopped = self.inner.stopped.lock();
        *stopped = true;
        self.inner.cond.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.stopped.lock()
    }

    /// Sleeps up to `timeout`, returning early once stopped. Returns whether
    /// the signal is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut stopped = self.inner.stopped.lock();
        while !*stopped {
            match deadline {
                Some(deadline) => {
                    if self.inner.cond.wait_until(&mut stopped, deadline).timed_out() {
                        break;
                    }
                }
                None => self.inner.cond.wait(&mut stopped),
            }
        }
        *stopped
    }
}
