//! Cancellable one-shot timer for lockdown auto-release.
//!
//! A detached thread parks on a condvar for the requested duration. `cancel`
//! flips the flag and wakes the thread; a cancelled timer never runs its
//! callback. Dropping the handle cancels, so an engine being torn down
//! cannot leave a live callback behind.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

struct TimerShared {
    cancelled: Mutex<bool>,
    signal: Condvar,
}

pub struct OneShotTimer {
    shared: Arc<TimerShared>,
}

impl OneShotTimer {
    /// Run `callback` after `delay` unless cancelled first.
    pub fn schedule(delay: Duration, callback: impl FnOnce() + Send + 'static) -> Self {
        let shared = Arc::new(TimerShared { cancelled: Mutex::new(false), signal: Condvar::new() });
        let thread_shared = shared.clone();
        let _detached = std::thread::spawn(move || {
            let mut cancelled = thread_shared.cancelled.lock();
            if !*cancelled {
                thread_shared.signal.wait_for(&mut cancelled, delay);
            }
            let fire = !*cancelled;
            drop(cancelled);
            if fire {
                callback();
            }
        });
        Self { shared }
    }

    pub fn cancel(&self) {
        *self.shared.cancelled.lock() = true;
        self.shared.signal.notify_all();
    }
}

impl Drop for OneShotTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
