// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Single-shot events with mandatory timeouts.
//!
//! Used to correlate an asynchronous protocol response (a defending Neighbor
//! Advertisement, a Router Advertisement) with the driver waiting for it.
//! An event is created fresh for every attempt and never reused; a timed-out
//! wait is semantically a release with no data.

use parking_lot::Condvar;
use parking_lot::Mutex;
use std::time::Duration;
use std::time::Instant;

/// A single-value event: one producer signals at most once, one consumer
/// waits with a timeout.
#[derive(Debug)]
pub struct OneshotEvent<T> {
    value: Mutex<Option<T>>,
    signaled: Condvar,
}

impl<T> OneshotEvent<T> {
    /// Creates an unsignaled event.
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
            signaled: Condvar::new(),
        }
    }

    /// Releases the event with `value`.
    ///
    /// Only the first signal is kept; later signals are discarded.
    pub fn signal(&self, value: T) {
        let mut slot = self.value.lock();
        if slot.is_none() {
            *slot = Some(value);
            self.signaled.notify_all();
        }
    }

    /// Waits up to `timeout` for the event.
    ///
    /// Returns the signaled value, or `None` if the timeout elapsed first.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.value.lock();
        while slot.is_none() {
            if self.signaled.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        slot.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn signal_then_wait() {
        let event = OneshotEvent::new();
        event.signal(7u32);
        assert_eq!(event.wait_timeout(Duration::from_millis(1)), Some(7));
    }

    #[test]
    fn wait_times_out_without_signal() {
        let event = OneshotEvent::<u32>::new();
        assert_eq!(event.wait_timeout(Duration::from_millis(5)), None);
    }

    #[test]
    fn first_signal_wins() {
        let event = OneshotEvent::new();
        event.signal(1u32);
        event.signal(2u32);
        assert_eq!(event.wait_timeout(Duration::from_millis(1)), Some(1));
    }

    #[test]
    fn signal_wakes_waiter() {
        let event = Arc::new(OneshotEvent::new());
        let signaler = event.clone();
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            signaler.signal("done");
        });
        assert_eq!(event.wait_timeout(Duration::from_secs(5)), Some("done"));
        thread.join().unwrap();
    }
}
