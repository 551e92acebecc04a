use std::{
    sync::atomic::{fence, Ordering},
    time::{Duration, Instant},
};

use crossbeam_utils::Backoff;

use super::{
    waiter::{ObjectWaiter, WaiterState},
    EnterStatus, ObjectMonitor, WaitStatus,
};
use crate::{
    error::{MonitorError, Result},
    statistics::Counters,
    thread::ThreadContext,
};

/// Holds the short spin lock protecting the wait set.
struct WaitSetGuard<'a> {
    monitor: &'a ObjectMonitor,
}

impl Drop for WaitSetGuard<'_> {
    fn drop(&mut self) {
        self.monitor.wait_set_lock.store(false, Ordering::Release);
    }
}

impl ObjectMonitor {
    fn lock_wait_set(&self) -> WaitSetGuard<'_> {
        let backoff = Backoff::new();
        loop {
            if self
                .wait_set_lock
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return WaitSetGuard { monitor: self };
            }
            while self.wait_set_lock.load(Ordering::Relaxed) {
                backoff.snooze();
            }
        }
    }

    /// Releases the monitor and waits for a notification, the timeout (`millis == 0` waits
    /// forever) or, if `interruptible`, an interrupt. The monitor is re-acquired with the
    /// original recursion count before returning, whatever the outcome.
    pub fn wait(
        &self,
        current: &'static ThreadContext,
        millis: u64,
        interruptible: bool,
    ) -> Result<WaitStatus> {
        self.check_owner(current, "wait")?;

        if interruptible && current.is_interrupted(true) {
            return Err(MonitorError::Interrupted);
        }

        let me = current.identity();
        current.stalled.store(self.address(), Ordering::Relaxed);

        let node = ObjectWaiter::new(current);
        node.set_state(WaiterState::Wait);
        current.park_event.reset();
        // publish the reset before the interrupt flag is re-read
        fence(Ordering::SeqCst);

        {
            let _lock = self.lock_wait_set();
            unsafe {
                self.wait_set.add(&node);
            }
        }

        self.responsible.store(0, Ordering::Relaxed);
        let save = self.recursions();
        self.waiters.fetch_add(1, Ordering::SeqCst);
        self.recursions.store(0, Ordering::Relaxed);
        self.exit_owned(current);
        debug_assert_ne!(self.owner_raw(), me);

        let deadline = if millis > 0 {
            Some(Instant::now() + Duration::from_millis(millis))
        } else {
            None
        };
        let mut timed_out = false;
        loop {
            if node.notified.load(Ordering::Acquire) {
                break;
            }
            if interruptible && current.is_interrupted(false) {
                break;
            }
            match deadline {
                None => {
                    self.park(current, None);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        timed_out = true;
                        break;
                    }
                    self.park(current, Some(deadline - now));
                }
            }
        }

        // Timed out or interrupted: we may still be on the wait set. A racing notify
        // either already moved us, or it cannot see us once we hold the lock.
        if node.state() == WaiterState::Wait {
            let _lock = self.lock_wait_set();
            if node.state() == WaiterState::Wait {
                unsafe {
                    self.wait_set.dequeue_specific(&node);
                }
                debug_assert!(!node.notified.load(Ordering::Relaxed));
                node.set_state(WaiterState::Run);
            }
        }
        debug_assert_ne!(node.state(), WaiterState::Wait);

        fence(Ordering::Acquire);
        if self.succ.load(Ordering::Relaxed) == me {
            self.succ.store(0, Ordering::Relaxed);
        }
        let was_notified = node.notified.load(Ordering::Acquire);

        fence(Ordering::SeqCst);
        current.stalled.store(0, Ordering::Relaxed);
        debug_assert_ne!(self.owner_raw(), me);

        let reacquired = match node.state() {
            WaiterState::Run => {
                // waiters > 0 keeps the deflater away, so this cannot be cancelled
                if self.enter(current) == EnterStatus::Cancelled {
                    self.waiters.fetch_sub(1, Ordering::SeqCst);
                    return Err(internal_error!("wait re-entry raced with deflation"));
                }
                Ok(())
            }
            WaiterState::Enter | WaiterState::Cxq => self.reenter_i(current, &node),
            WaiterState::Wait => {
                self.waiters.fetch_sub(1, Ordering::SeqCst);
                return Err(internal_error!("waiter {:p} is still on the wait set", node.as_ptr()));
            }
        };

        debug_assert_eq!(node.state(), WaiterState::Run);
        debug_assert_eq!(self.owner_raw(), me);
        debug_assert_eq!(self.recursions(), 0);
        self.recursions.store(save, Ordering::Relaxed);
        self.waiters.fetch_sub(1, Ordering::SeqCst);
        // owned again even if the queue bookkeeping failed
        reacquired?;

        if !was_notified {
            if interruptible && current.is_interrupted(true) {
                return Ok(WaitStatus::Interrupted);
            }
            if timed_out {
                return Ok(WaitStatus::TimedOut);
            }
        }
        Ok(WaitStatus::Notified)
    }

    /// Moves the head of the wait set to the entry queues. The notified thread still has to
    /// win the lock once the notifier exits.
    fn inotify(&self) {
        let _lock = self.lock_wait_set();
        let iterator = unsafe { self.wait_set.dequeue() };
        if iterator.is_null() {
            return;
        }
        unsafe {
            let waiter = &*iterator;
            debug_assert_eq!(waiter.state(), WaiterState::Wait);
            debug_assert!(!waiter.notified.load(Ordering::Relaxed));
            waiter.notified.store(true, Ordering::Release);

            let list = self.entry_list.load(Ordering::Relaxed);
            if list.is_null() {
                waiter.set_next(std::ptr::null_mut());
                waiter.set_prev(std::ptr::null_mut());
                waiter.set_state(WaiterState::Enter);
                self.entry_list.store(iterator, Ordering::Release);
            } else {
                // prepend to cxq; notify_all therefore reverses the wait order
                waiter.set_state(WaiterState::Cxq);
                loop {
                    let front = self.cxq.load(Ordering::Acquire);
                    waiter.set_next(front);
                    if self
                        .cxq
                        .compare_exchange(front, iterator, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        break;
                    }
                }
            }
        }
    }

    pub fn notify(&self, current: &'static ThreadContext) -> Result<()> {
        self.check_owner(current, "notify")?;
        if self.wait_set.is_empty() {
            return Ok(());
        }
        self.inotify();
        Counters::bump(&self.env().counters.notifications);
        Ok(())
    }

    pub fn notify_all(&self, current: &'static ThreadContext) -> Result<()> {
        self.check_owner(current, "notify_all")?;
        let mut tally = 0;
        while !self.wait_set.is_empty() {
            tally += 1;
            self.inotify();
        }
        Counters::add(&self.env().counters.notifications, tally);
        Ok(())
    }

    /// Number of threads currently on the wait set.
    pub fn wait_set_len(&self) -> usize {
        let _lock = self.lock_wait_set();
        let head = self.wait_set.head();
        if head.is_null() {
            return 0;
        }
        let mut count = 1;
        unsafe {
            let mut p = (*head).next();
            while p != head {
                count += 1;
                p = (*p).next();
            }
        }
        count
    }
}
