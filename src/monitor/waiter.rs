use std::{
    ptr::null_mut,
    sync::atomic::{AtomicBool, AtomicPtr, Ordering},
};

use atomic::Atomic;

use crate::thread::ThreadContext;

/// Queue a waiter node is on.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum WaiterState {
    /// Not on any queue.
    Run = 0,
    /// On the `cxq` stack.
    Cxq = 1,
    /// On the `EntryList`.
    Enter = 2,
    /// On the `WaitSet`.
    Wait = 3,
}

/// Proxy for a thread blocked on a monitor.
///
/// A node lives on the blocked thread's stack for the duration of one contended enter or
/// one wait and is linked into at most one of the monitor's queues at any time. Other
/// threads reach it only through those queues, so it must be unlinked before the frame
/// that owns it returns.
pub(crate) struct ObjectWaiter {
    pub next: AtomicPtr<ObjectWaiter>,
    pub prev: AtomicPtr<ObjectWaiter>,
    pub thread: &'static ThreadContext,
    pub notified: AtomicBool,
    pub state: Atomic<WaiterState>,
}

impl ObjectWaiter {
    pub fn new(thread: &'static ThreadContext) -> Self {
        Self {
            next: AtomicPtr::new(null_mut()),
            prev: AtomicPtr::new(null_mut()),
            thread,
            notified: AtomicBool::new(false),
            state: Atomic::new(WaiterState::Run),
        }
    }

    #[inline(always)]
    pub fn as_ptr(&self) -> *mut ObjectWaiter {
        self as *const Self as *mut Self
    }

    #[inline(always)]
    pub fn state(&self) -> WaiterState {
        self.state.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn set_state(&self, state: WaiterState) {
        self.state.store(state, Ordering::Release);
    }

    #[inline(always)]
    pub fn next(&self) -> *mut ObjectWaiter {
        self.next.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn set_next(&self, next: *mut ObjectWaiter) {
        self.next.store(next, Ordering::Release);
    }

    #[inline(always)]
    pub fn prev(&self) -> *mut ObjectWaiter {
        self.prev.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn set_prev(&self, prev: *mut ObjectWaiter) {
        self.prev.store(prev, Ordering::Release);
    }
}

/// Circular doubly-linked list of waiting threads. Callers hold the wait-set lock.
pub(crate) struct WaitQueue {
    head: AtomicPtr<ObjectWaiter>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(null_mut()),
        }
    }

    /// Racy emptiness check, valid without the lock only as a hint.
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    pub fn head(&self) -> *mut ObjectWaiter {
        self.head.load(Ordering::Acquire)
    }

    /// Appends `node` at the tail.
    pub unsafe fn add(&self, node: &ObjectWaiter) {
        debug_assert!(node.prev().is_null() && node.next().is_null());
        let head = self.head();
        if head.is_null() {
            self.head.store(node.as_ptr(), Ordering::Release);
            node.set_prev(node.as_ptr());
            node.set_next(node.as_ptr());
        } else {
            let tail = (*head).prev();
            debug_assert_eq!((*tail).next(), head);
            (*tail).set_next(node.as_ptr());
            (*head).set_prev(node.as_ptr());
            node.set_next(head);
            node.set_prev(tail);
        }
    }

    /// Removes and returns the head, null when empty.
    pub unsafe fn dequeue(&self) -> *mut ObjectWaiter {
        let waiter = self.head();
        if !waiter.is_null() {
            self.dequeue_specific(&*waiter);
        }
        waiter
    }

    pub unsafe fn dequeue_specific(&self, node: &ObjectWaiter) {
        debug_assert!(!node.prev().is_null() && !node.next().is_null());
        let next = node.next();
        if next == node.as_ptr() {
            debug_assert_eq!(node.prev(), node.as_ptr());
            self.head.store(null_mut(), Ordering::Release);
        } else {
            let prev = node.prev();
            debug_assert_eq!((*prev).next(), node.as_ptr());
            debug_assert_eq!((*next).prev(), node.as_ptr());
            (*next).set_prev(prev);
            (*prev).set_next(next);
            if self.head() == node.as_ptr() {
                self.head.store(next, Ordering::Release);
            }
        }
        node.set_next(null_mut());
        node.set_prev(null_mut());
    }
}
