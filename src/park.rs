use std::{
    sync::atomic::{AtomicI32, Ordering},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

const BLOCKED: i32 = -1;
const NEUTRAL: i32 = 0;
const SIGNALED: i32 = 1;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ParkResult {
    Unparked,
    TimedOut,
}

/// Per-thread blocking handle with a single permit.
///
/// The permit is one of `-1` (owner blocked), `0` (neutral) or `1` (signaled). `unpark`
/// sets it to signaled and wakes the owner if it is blocked; `park` consumes a signal or
/// blocks until one arrives. Only the owning thread parks. Wakeups may be spurious, so
/// callers always re-check their condition.
pub struct ParkEvent {
    event: AtomicI32,
    mutex: Mutex<()>,
    cond: Condvar,
}

impl ParkEvent {
    pub const fn new() -> Self {
        Self {
            event: AtomicI32::new(NEUTRAL),
            mutex: parking_lot::const_mutex(()),
            cond: Condvar::new(),
        }
    }

    /// Drops a pending signal.
    pub fn reset(&self) {
        self.event.store(NEUTRAL, Ordering::Relaxed);
    }

    pub fn park(&self) {
        if self.event.fetch_sub(1, Ordering::SeqCst) != NEUTRAL {
            // consumed a pending signal
            return;
        }
        let mut guard = self.mutex.lock();
        while self.event.load(Ordering::Acquire) == BLOCKED {
            self.cond.wait(&mut guard);
        }
        self.event.store(NEUTRAL, Ordering::Release);
    }

    pub fn park_for(&self, timeout: Duration) -> ParkResult {
        if self.event.fetch_sub(1, Ordering::SeqCst) != NEUTRAL {
            return ParkResult::Unparked;
        }
        let deadline = Instant::now() + timeout;
        let mut guard = self.mutex.lock();
        while self.event.load(Ordering::Acquire) == BLOCKED {
            if self.cond.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        if self.event.swap(NEUTRAL, Ordering::AcqRel) == BLOCKED {
            ParkResult::TimedOut
        } else {
            ParkResult::Unparked
        }
    }

    pub fn park_millis(&self, millis: u64) -> ParkResult {
        self.park_for(Duration::from_millis(millis))
    }

    pub fn unpark(&self) {
        if self.event.swap(SIGNALED, Ordering::SeqCst) != BLOCKED {
            return;
        }
        let guard = self.mutex.lock();
        self.cond.notify_one();
        drop(guard);
    }
}

impl Default for ParkEvent {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn pending_signal_is_consumed_once() {
        let event = ParkEvent::new();
        event.unpark();
        event.unpark();
        assert_eq!(event.park_millis(1000), ParkResult::Unparked);
        assert_eq!(event.park_millis(10), ParkResult::TimedOut);
    }

    #[test]
    fn reset_drops_signal() {
        let event = ParkEvent::new();
        event.unpark();
        event.reset();
        assert_eq!(event.park_millis(10), ParkResult::TimedOut);
    }

    #[test]
    fn unpark_from_other_thread() {
        let event = Arc::new(ParkEvent::new());
        let other = event.clone();
        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            other.unpark();
        });
        event.park();
        waker.join().unwrap();
    }
}
