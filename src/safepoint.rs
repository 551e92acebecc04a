use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::thread::ThreadContext;

/// Pause requests as seen by the monitor engine.
///
/// The engine never initiates a pause. It only polls [GlobalSafepoint::is_armed] while
/// spinning (so that spinning never delays a pause) and lets long-running background
/// work stop at [GlobalSafepoint::block_if_armed] until the requester is done.
pub struct GlobalSafepoint {
    armed: AtomicBool,
    active_safepoint_scopes: AtomicI32,
    barrier: Barrier,
}

struct Barrier {
    mutex: Mutex<BarrierState>,
    cv_resume: Condvar,
    cv_stopped: Condvar,
}

struct BarrierState {
    armed: bool,
    stopped: usize,
}

impl Barrier {
    fn arm(&self) {
        let mut state = self.mutex.lock();
        debug_assert!(!state.armed);
        state.armed = true;
        state.stopped = 0;
    }

    fn disarm(&self) {
        let mut state = self.mutex.lock();
        state.armed = false;
        state.stopped = 0;
        self.cv_resume.notify_all();
    }

    fn wait_until_running_threads_in_safepoint(&self, running: usize) {
        let mut state = self.mutex.lock();
        while state.armed && state.stopped < running {
            self.cv_stopped.wait(&mut state);
        }
    }

    fn wait_in_safepoint(&self) -> bool {
        let mut state = self.mutex.lock();
        if !state.armed {
            return false;
        }
        state.stopped += 1;
        self.cv_stopped.notify_all();
        while state.armed {
            self.cv_resume.wait(&mut state);
        }
        true
    }
}

/// Keeps a pause requested until dropped.
pub struct SafepointScope<'a> {
    safepoint: &'a GlobalSafepoint,
}

impl Drop for SafepointScope<'_> {
    fn drop(&mut self) {
        self.safepoint.disarm();
    }
}

impl GlobalSafepoint {
    pub fn new() -> Self {
        Self {
            armed: AtomicBool::new(false),
            active_safepoint_scopes: AtomicI32::new(0),
            barrier: Barrier {
                mutex: Mutex::new(BarrierState {
                    armed: false,
                    stopped: 0,
                }),
                cv_resume: Condvar::new(),
                cv_stopped: Condvar::new(),
            },
        }
    }

    /// Requests a pause until the returned scope is dropped.
    pub fn enter_safepoint_scope(&self) -> SafepointScope<'_> {
        self.arm();
        SafepointScope { safepoint: self }
    }

    /// Requests a pause. Nested requests share one pause, released by the last [GlobalSafepoint::disarm].
    pub fn arm(&self) {
        if self.active_safepoint_scopes.fetch_add(1, Ordering::AcqRel) == 0 {
            self.barrier.arm();
            self.armed.store(true, Ordering::SeqCst);
        }
    }

    pub fn disarm(&self) {
        if self.active_safepoint_scopes.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.armed.store(false, Ordering::SeqCst);
            self.barrier.disarm();
        }
    }

    /// Cheap poll used from spin loops.
    #[inline(always)]
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Relaxed)
    }

    /// Stops the calling thread while a pause is requested. Returns whether it stopped.
    pub fn block_if_armed(&self) -> bool {
        if !self.is_armed() {
            return false;
        }
        let _blocked = ThreadContext::current().enter_blocked();
        self.barrier.wait_in_safepoint()
    }

    /// Waits until `running` threads have stopped in [GlobalSafepoint::block_if_armed]
    /// or the pause is released.
    pub fn wait_until_stopped(&self, running: usize) {
        self.barrier.wait_until_running_threads_in_safepoint(running);
    }
}

impl Default for GlobalSafepoint {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    #[test]
    fn disarmed_does_not_block() {
        let safepoint = GlobalSafepoint::new();
        assert!(!safepoint.is_armed());
        assert!(!safepoint.block_if_armed());
    }

    #[test]
    fn thread_stops_until_scope_dropped() {
        let safepoint = Arc::new(GlobalSafepoint::new());
        let resumed = Arc::new(AtomicBool::new(false));
        let scope = safepoint.enter_safepoint_scope();
        assert!(safepoint.is_armed());

        let handle = {
            let safepoint = safepoint.clone();
            let resumed = resumed.clone();
            std::thread::spawn(move || {
                assert!(safepoint.block_if_armed());
                resumed.store(true, Ordering::SeqCst);
            })
        };

        safepoint.wait_until_stopped(1);
        assert!(!resumed.load(Ordering::SeqCst));
        drop(scope);
        handle.join().unwrap();
        assert!(resumed.load(Ordering::SeqCst));
        assert!(!safepoint.is_armed());
    }
}
