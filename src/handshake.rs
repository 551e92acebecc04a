use std::{
    sync::atomic::{fence, Ordering},
    time::Duration,
};

use crossbeam_utils::Backoff;

use crate::thread::ThreadContext;

/// Epoch-based acknowledgement from every attached thread.
///
/// Monitor code runs inside a [crate::thread::CriticalScope], which makes the thread's
/// epoch odd. A thread whose epoch is even at the snapshot, or whose epoch changed since,
/// has not kept a reference obtained before the snapshot: anything unlinked before
/// [Handshake::synchronize] started is unreachable for it.
pub struct Handshake;

impl Handshake {
    /// Blocks until every other thread has been observed outside of the critical scope it
    /// was in when the call started. Returns the number of threads that had to be waited for.
    pub fn synchronize() -> usize {
        let me = ThreadContext::current();
        fence(Ordering::SeqCst);
        let mut pending = Vec::new();
        ThreadContext::for_each(|thread| {
            if std::ptr::eq(thread, me) {
                return;
            }
            let epoch = thread.critical_epoch();
            if epoch & 1 == 1 {
                pending.push((thread, epoch));
            }
        });

        let waited = pending.len();
        for (thread, epoch) in pending {
            let backoff = Backoff::new();
            while thread.critical_epoch() == epoch {
                if backoff.is_completed() {
                    std::thread::sleep(Duration::from_micros(50));
                } else {
                    backoff.snooze();
                }
            }
        }
        fence(Ordering::SeqCst);
        waited
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::{Condvar, Mutex};
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    #[test]
    fn waits_for_thread_inside_critical_scope() {
        let inside = Arc::new((Mutex::new(false), Condvar::new()));
        let release = Arc::new(AtomicBool::new(false));
        let left = Arc::new(AtomicBool::new(false));

        let worker = {
            let inside = inside.clone();
            let release = release.clone();
            let left = left.clone();
            std::thread::spawn(move || {
                let thread = ThreadContext::current();
                let scope = thread.enter_critical();
                {
                    let (lock, cv) = &*inside;
                    *lock.lock() = true;
                    cv.notify_all();
                }
                while !release.load(Ordering::Acquire) {
                    std::thread::yield_now();
                }
                left.store(true, Ordering::SeqCst);
                drop(scope);
            })
        };

        {
            let (lock, cv) = &*inside;
            let mut entered = lock.lock();
            while !*entered {
                cv.wait(&mut entered);
            }
        }

        let releaser = {
            let release = release.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                release.store(true, Ordering::Release);
            })
        };

        assert!(Handshake::synchronize() >= 1);
        assert!(left.load(Ordering::SeqCst));
        worker.join().unwrap();
        releaser.join().unwrap();
    }

    #[test]
    fn own_scope_is_skipped() {
        let thread = ThreadContext::current();
        let _scope = thread.enter_critical();
        Handshake::synchronize();
    }
}
