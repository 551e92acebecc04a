//! Inflated monitor: the heavyweight lock attached to one object at a time.
//!
//! # Theory of operation
//!
//! - A thread owns the monitor once it CASes `owner` from 0 to its identity.
//! - A thread is on at most one of `cxq`, `EntryList` and `WaitSet` at any time.
//! - Contending threads push themselves onto `cxq` with a CAS and then spin or park.
//!   Only the owner detaches `cxq`, always as a whole, and turns it into `EntryList`.
//! - `EntryList` is touched only by the owner. Exiting owners pick the successor from its
//!   head and unpark it; the successor competes for the lock like anybody else.
//! - `succ` tells an exiting owner that a successor is already awake and saves a redundant
//!   unpark. `responsible` is the single contender that parks with a timeout, so a missed
//!   wakeup can stall a contender for at most `max_recheck_interval_ms`.
//! - `contentions` counts threads inside the contended path. A negative value means the
//!   deflater committed and the monitor is about to be detached from its object.
use std::{
    alloc::{alloc, dealloc, Layout},
    fmt,
    ptr::null_mut,
    sync::{
        atomic::{fence, AtomicBool, AtomicI32, AtomicIsize, AtomicPtr, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use crossbeam_utils::CachePadded;

use crate::{
    error::{MonitorError, Result},
    gcref::{ObjectRef, WeakSlot},
    globals::{INITIAL_RECHECK_INTERVAL, RECHECK_INTERVAL_FACTOR},
    header::MarkWord,
    park::ParkResult,
    safepoint::GlobalSafepoint,
    statistics::Counters,
    thread::ThreadContext,
    Config,
};

mod deflate;
mod spin;
mod wait;
pub(crate) mod waiter;

use waiter::{ObjectWaiter, WaitQueue, WaiterState};

/// Owner value published by the deflater while it tries to claim an idle monitor.
pub const DEFLATER_MARKER: usize = 2;
/// Tag distinguishing a stack-lock owner (a [crate::header::BasicLock] address) from a thread.
pub(crate) const STACK_LOCK_OWNER_TAG: usize = 1;
const OWNER_TAG_MASK: usize = 0b111;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum EnterStatus {
    Acquired,
    /// The monitor was being deflated; inflate again and retry.
    Cancelled,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum WaitStatus {
    Notified,
    TimedOut,
    Interrupted,
}

/// State shared by every monitor of one synchronizer.
pub(crate) struct SyncEnv {
    pub config: Config,
    pub safepoint: Arc<GlobalSafepoint>,
    pub counters: Counters,
}

impl SyncEnv {
    pub fn new(config: Config, safepoint: Arc<GlobalSafepoint>) -> Self {
        Self {
            config,
            safepoint,
            counters: Counters::default(),
        }
    }
}

pub struct ObjectMonitor {
    /// Displaced lock-word of the object. Always neutral.
    header: AtomicUsize,
    object: WeakSlot,
    env: *const SyncEnv,
    owner: CachePadded<AtomicUsize>,
    pub(crate) next_om: AtomicPtr<ObjectMonitor>,
    recursions: AtomicIsize,
    entry_list: AtomicPtr<ObjectWaiter>,
    cxq: AtomicPtr<ObjectWaiter>,
    succ: AtomicUsize,
    responsible: AtomicUsize,
    spin_duration: AtomicI32,
    contentions: CachePadded<AtomicI32>,
    wait_set: WaitQueue,
    waiters: AtomicI32,
    wait_set_lock: AtomicBool,
}

unsafe impl Send for ObjectMonitor {}
unsafe impl Sync for ObjectMonitor {}

impl ObjectMonitor {
    fn new(env: *const SyncEnv, object: Option<ObjectRef>) -> Self {
        let spin_limit = unsafe { (*env).config.spin_limit };
        Self {
            header: AtomicUsize::new(0),
            object: WeakSlot::new(object),
            env,
            owner: CachePadded::new(AtomicUsize::new(0)),
            next_om: AtomicPtr::new(null_mut()),
            recursions: AtomicIsize::new(0),
            entry_list: AtomicPtr::new(null_mut()),
            cxq: AtomicPtr::new(null_mut()),
            succ: AtomicUsize::new(0),
            responsible: AtomicUsize::new(0),
            spin_duration: AtomicI32::new(spin_limit),
            contentions: CachePadded::new(AtomicI32::new(0)),
            wait_set: WaitQueue::new(),
            waiters: AtomicI32::new(0),
            wait_set_lock: AtomicBool::new(false),
        }
    }

    /// Allocates a monitor for `object`. Fails with [MonitorError::OutOfMemory] instead of aborting.
    pub(crate) fn allocate(env: *const SyncEnv, object: Option<ObjectRef>) -> Result<*mut Self> {
        unsafe {
            let layout = Layout::new::<Self>();
            let memory = alloc(layout).cast::<Self>();
            if memory.is_null() {
                log::error!(target: "monitorinflation", "failed to allocate {} bytes for a monitor", layout.size());
                return Err(MonitorError::OutOfMemory);
            }
            memory.write(Self::new(env, object));
            Ok(memory)
        }
    }

    /// # Safety
    ///
    /// `monitor` must come from [ObjectMonitor::allocate] and be unreachable for every thread.
    pub(crate) unsafe fn free(monitor: *mut Self) {
        core::ptr::drop_in_place(monitor);
        dealloc(monitor.cast(), Layout::new::<Self>());
    }

    #[inline(always)]
    fn env(&self) -> &SyncEnv {
        unsafe { &*self.env }
    }

    #[inline(always)]
    pub(crate) fn address(&self) -> usize {
        self as *const Self as usize
    }

    #[inline(always)]
    pub fn header(&self) -> MarkWord {
        MarkWord::from_raw(self.header.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub(crate) fn set_header(&self, mark: MarkWord) {
        self.header.store(mark.value(), Ordering::Release);
    }

    /// CAS on the displaced header, returns the witnessed value.
    pub(crate) fn cas_header(&self, new: MarkWord, old: MarkWord) -> MarkWord {
        match self.header.compare_exchange(
            old.value(),
            new.value(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(value) | Err(value) => MarkWord::from_raw(value),
        }
    }

    /// Peeks at the object without keeping it alive.
    #[inline(always)]
    pub fn object_peek(&self) -> Option<ObjectRef> {
        self.object.peek()
    }

    /// Called by the collector when the object died.
    pub(crate) fn clear_object(&self) {
        self.object.clear();
    }

    #[inline(always)]
    pub fn owner_raw(&self) -> usize {
        self.owner.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn owner_is_deflater_marker(&self) -> bool {
        self.owner_raw() == DEFLATER_MARKER
    }

    /// Owning thread, if the owner is a thread rather than a lock record or the marker.
    pub fn owner_thread(&self) -> Option<&'static ThreadContext> {
        let owner = self.owner_raw();
        if owner == 0 || owner & OWNER_TAG_MASK != 0 {
            return None;
        }
        Some(unsafe { ThreadContext::from_identity(owner) })
    }

    #[inline(always)]
    pub(crate) fn try_set_owner_from(&self, old: usize, new: usize) -> usize {
        match self
            .owner
            .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(value) | Err(value) => value,
        }
    }

    #[inline(always)]
    pub(crate) fn set_owner_from(&self, old: usize, new: usize) {
        debug_assert_eq!(self.owner_raw(), old);
        self.owner.store(new, Ordering::Relaxed);
    }

    fn set_owner_from_basic_lock(&self, lock_owner: usize, current: &ThreadContext) {
        debug_assert_eq!(lock_owner & STACK_LOCK_OWNER_TAG, STACK_LOCK_OWNER_TAG);
        self.set_owner_from(lock_owner, current.identity());
    }

    #[inline(always)]
    fn release_clear_owner(&self, current: &ThreadContext) {
        debug_assert_eq!(self.owner_raw(), current.identity());
        self.owner.store(0, Ordering::Release);
    }

    /// Whether `owner` is a lock record of `current`'s stack lock on this object.
    fn is_stack_locked_by(&self, current: &ThreadContext, owner: usize) -> bool {
        owner & OWNER_TAG_MASK == STACK_LOCK_OWNER_TAG
            && current.is_lock_owned(owner & !STACK_LOCK_OWNER_TAG)
    }

    #[inline(always)]
    pub fn recursions(&self) -> isize {
        self.recursions.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn contentions(&self) -> i32 {
        self.contentions.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub(crate) fn add_to_contentions(&self, value: i32) {
        self.contentions.fetch_add(value, Ordering::SeqCst);
    }

    #[inline(always)]
    pub fn waiters(&self) -> i32 {
        self.waiters.load(Ordering::Acquire)
    }

    /// Busy monitors are never deflated.
    pub fn is_busy(&self) -> bool {
        let mut busy = self.waiters() != 0
            || !self.cxq.load(Ordering::Acquire).is_null()
            || !self.entry_list.load(Ordering::Acquire).is_null()
            || self.contentions() > 0;
        if !self.owner_is_deflater_marker() {
            busy |= self.owner_raw() != 0;
        }
        busy
    }

    pub fn is_busy_to_string(&self) -> String {
        let contentions = self.contentions();
        let owner = if self.owner_is_deflater_marker() {
            0
        } else {
            self.owner_raw()
        };
        format!(
            "is_busy: waiters={}, contentions={}, owner={:#x}, cxq={:p}, EntryList={:p}",
            self.waiters(),
            contentions.max(0),
            owner,
            self.cxq.load(Ordering::Relaxed),
            self.entry_list.load(Ordering::Relaxed)
        )
    }

    #[inline(always)]
    pub fn is_entered(&self, current: &ThreadContext) -> bool {
        let owner = self.owner_raw();
        owner == current.identity() || self.is_stack_locked_by(current, owner)
    }

    fn park(&self, current: &ThreadContext, timeout: Option<Duration>) -> ParkResult {
        Counters::bump(&self.env().counters.parks);
        let _blocked = current.enter_blocked();
        match timeout {
            Some(timeout) => current.park_event.park_for(timeout),
            None => {
                current.park_event.park();
                ParkResult::Unparked
            }
        }
    }

    pub fn enter(&self, current: &'static ThreadContext) -> EnterStatus {
        let me = current.identity();
        let cur = self.try_set_owner_from(0, me);
        if cur == 0 {
            debug_assert_eq!(self.recursions(), 0);
            return EnterStatus::Acquired;
        }

        if cur == me {
            self.recursions.fetch_add(1, Ordering::Relaxed);
            return EnterStatus::Acquired;
        }

        if self.is_stack_locked_by(current, cur) {
            debug_assert_eq!(self.recursions(), 0);
            self.recursions.store(1, Ordering::Relaxed);
            self.set_owner_from_basic_lock(cur, current);
            return EnterStatus::Acquired;
        }

        // genuine contention
        current.stalled.store(self.address(), Ordering::Relaxed);

        if self.try_spin(current) {
            debug_assert_eq!(self.owner_raw(), me);
            debug_assert_eq!(self.recursions(), 0);
            current.stalled.store(0, Ordering::Relaxed);
            return EnterStatus::Acquired;
        }

        self.add_to_contentions(1);
        if self.is_being_async_deflated() {
            // Lost the race against the deflater. Put the header back ourselves so the
            // caller's retry does not find the dying monitor again.
            if let Some(object) = self.object_peek() {
                self.install_displaced_markword_in_object(object);
            }
            self.add_to_contentions(-1);
            current.stalled.store(0, Ordering::Relaxed);
            return EnterStatus::Cancelled;
        }

        Counters::bump(&self.env().counters.contended_lock_attempts);
        self.enter_i(current);
        self.add_to_contentions(-1);
        current.stalled.store(0, Ordering::Relaxed);
        debug_assert_eq!(self.owner_raw(), me);
        EnterStatus::Acquired
    }

    /// Test-and-test-and-set. Returns whether ownership was acquired.
    #[inline]
    pub(crate) fn try_lock(&self, current: &ThreadContext) -> bool {
        if self.owner_raw() != 0 {
            return false;
        }
        if self.try_set_owner_from(0, current.identity()) == 0 {
            debug_assert_eq!(self.recursions(), 0);
            return true;
        }
        false
    }

    /// Takes over ownership from an aborted deflation. The extra contention keeps the
    /// deflater from committing after our own decrement; the deflater removes it once it
    /// notices the abort.
    fn try_cancel_deflation(&self, current: &ThreadContext) -> bool {
        if self.try_set_owner_from(DEFLATER_MARKER, current.identity()) == DEFLATER_MARKER {
            self.add_to_contentions(1);
            return true;
        }
        false
    }

    fn enter_i(&self, current: &'static ThreadContext) {
        let me = current.identity();
        if self.try_lock(current) {
            return;
        }
        if self.try_cancel_deflation(current) {
            return;
        }
        if self.try_spin(current) {
            return;
        }

        let node = ObjectWaiter::new(current);
        current.park_event.reset();
        node.set_state(WaiterState::Cxq);

        let mut nxt;
        loop {
            nxt = self.cxq.load(Ordering::Acquire);
            node.set_next(nxt);
            if self
                .cxq
                .compare_exchange(nxt, node.as_ptr(), Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
            // interference, the node is not published yet
            if self.try_lock(current) {
                return;
            }
        }

        if nxt.is_null() && self.entry_list.load(Ordering::Acquire).is_null() {
            let _ = self
                .responsible
                .compare_exchange(0, me, Ordering::SeqCst, Ordering::Relaxed);
        }

        let max_recheck = self.env().config.max_recheck_interval_ms.max(1);
        let mut recheck_interval = INITIAL_RECHECK_INTERVAL;
        loop {
            if self.try_lock(current) {
                break;
            }
            debug_assert_ne!(self.owner_raw(), me);

            if self.responsible.load(Ordering::Acquire) == me {
                self.park(current, Some(Duration::from_millis(recheck_interval)));
                recheck_interval = (recheck_interval * RECHECK_INTERVAL_FACTOR).min(max_recheck);
            } else {
                self.park(current, None);
            }

            if self.try_lock(current) {
                break;
            }
            if self.try_cancel_deflation(current) {
                break;
            }

            Counters::bump(&self.env().counters.futile_wakeups);

            if self.try_spin(current) {
                break;
            }

            if self.succ.load(Ordering::Relaxed) == me {
                self.succ.store(0, Ordering::Relaxed);
            }
            // after clearing succ the owner field must be rechecked before parking
            fence(Ordering::SeqCst);
        }

        // A failed unlink has been reported; the node was not linked and we own the
        // monitor either way.
        let _ = unsafe { self.unlink_after_acquire(current, &node) };
        if self.succ.load(Ordering::Relaxed) == me {
            self.succ.store(0, Ordering::Relaxed);
        }
        if self.responsible.load(Ordering::Relaxed) == me {
            self.responsible.store(0, Ordering::Relaxed);
            fence(Ordering::SeqCst);
        }
    }

    /// Re-acquires the monitor after a notification moved `node` to the entry queues.
    fn reenter_i(&self, current: &'static ThreadContext, node: &ObjectWaiter) -> Result<()> {
        let me = current.identity();
        debug_assert!(self.waiters() > 0);
        loop {
            let state = node.state();
            debug_assert!(matches!(state, WaiterState::Enter | WaiterState::Cxq));
            debug_assert_ne!(self.owner_raw(), me);

            if self.try_lock(current) {
                break;
            }
            if self.try_spin(current) {
                break;
            }

            self.park(current, None);

            if self.try_lock(current) {
                break;
            }

            if self.succ.load(Ordering::Relaxed) == me {
                self.succ.store(0, Ordering::Relaxed);
            }
            fence(Ordering::SeqCst);
            Counters::bump(&self.env().counters.futile_wakeups);
        }

        debug_assert_eq!(self.owner_raw(), me);
        let unlinked = unsafe { self.unlink_after_acquire(current, node) };
        if self.succ.load(Ordering::Relaxed) == me {
            self.succ.store(0, Ordering::Relaxed);
        }
        node.set_state(WaiterState::Run);
        fence(Ordering::SeqCst);
        unlinked
    }

    /// Removes `node` from `EntryList` or `cxq` after its thread acquired the monitor.
    unsafe fn unlink_after_acquire(&self, current: &ThreadContext, node: &ObjectWaiter) -> Result<()> {
        debug_assert_eq!(self.owner_raw(), current.identity());
        debug_assert!(std::ptr::eq(node.thread, current));

        if node.state() == WaiterState::Enter {
            // EntryList is owner-only, unlink in O(1)
            let nxt = node.next();
            let prv = node.prev();
            if !nxt.is_null() {
                (*nxt).set_prev(prv);
            }
            if !prv.is_null() {
                (*prv).set_next(nxt);
            }
            if node.as_ptr() == self.entry_list.load(Ordering::Relaxed) {
                self.entry_list.store(nxt, Ordering::Relaxed);
            }
        } else {
            debug_assert_eq!(node.state(), WaiterState::Cxq);
            // Other threads only ever push at the head, so the head is the one element
            // that needs a CAS. Interior nodes are stable under the owner.
            let mut v = self.cxq.load(Ordering::Acquire);
            if v != node.as_ptr()
                || self
                    .cxq
                    .compare_exchange(v, node.next(), Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
            {
                if v == node.as_ptr() {
                    v = self.cxq.load(Ordering::Acquire);
                }
                let mut p = v;
                let mut q: *mut ObjectWaiter = null_mut();
                while !p.is_null() && p != node.as_ptr() {
                    q = p;
                    debug_assert_eq!((*p).state(), WaiterState::Cxq);
                    p = (*p).next();
                }
                if p.is_null() || q.is_null() {
                    node.set_state(WaiterState::Run);
                    return Err(internal_error!("node {:p} not found on cxq", node.as_ptr()));
                }
                (*q).set_next(node.next());
            }
        }

        node.set_prev(null_mut());
        node.set_next(null_mut());
        node.set_state(WaiterState::Run);
        Ok(())
    }

    /// Releases one level of ownership. Fails if `current` is not the owner.
    pub fn exit(&self, current: &'static ThreadContext) -> Result<()> {
        let cur = self.owner_raw();
        if cur != current.identity() {
            if self.is_stack_locked_by(current, cur) {
                debug_assert_eq!(self.recursions(), 0);
                self.set_owner_from_basic_lock(cur, current);
                self.recursions.store(0, Ordering::Relaxed);
            } else if cur == DEFLATER_MARKER && self.is_being_async_deflated() {
                // redundant exit racing with deflation, nothing is held
                return Ok(());
            } else {
                log::error!(
                    target: "monitorinflation",
                    "thread #{} is exiting a monitor it does not own: {}",
                    current.id(),
                    self
                );
                return Err(MonitorError::illegal_state("exit"));
            }
        }
        self.exit_owned(current);
        Ok(())
    }

    /// Exit for a caller that is known to own the monitor.
    fn exit_owned(&self, current: &'static ThreadContext) {
        let recursions = self.recursions();
        if recursions != 0 {
            self.recursions.store(recursions - 1, Ordering::Relaxed);
            return;
        }

        self.responsible.store(0, Ordering::Relaxed);

        loop {
            debug_assert_eq!(self.owner_raw(), current.identity());
            self.release_clear_owner(current);
            fence(Ordering::SeqCst);

            let queues_empty = self.entry_list.load(Ordering::Acquire).is_null()
                && self.cxq.load(Ordering::Acquire).is_null();
            if queues_empty || self.succ.load(Ordering::Acquire) != 0 {
                return;
            }

            // Somebody is queued and nobody is awake to take over. Re-acquire to pick a
            // successor; if that fails the new owner inherits the duty.
            if self.try_set_owner_from(0, current.identity()) != 0 {
                return;
            }

            let w = self.entry_list.load(Ordering::Relaxed);
            if !w.is_null() {
                unsafe {
                    self.exit_epilog(current, w);
                }
                return;
            }

            let mut w = self.cxq.load(Ordering::Acquire);
            if w.is_null() {
                continue;
            }

            // detach the whole stack in one go
            loop {
                match self.cxq.compare_exchange(
                    w,
                    null_mut(),
                    Ordering::SeqCst,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(actual) => w = actual,
                }
            }
            debug_assert!(!w.is_null());
            debug_assert!(self.entry_list.load(Ordering::Relaxed).is_null());

            // Reverse the LIFO stack so the earliest arrival heads EntryList.
            let mut head: *mut ObjectWaiter = null_mut();
            let mut p = w;
            unsafe {
                while !p.is_null() {
                    let next = (*p).next();
                    debug_assert_eq!((*p).state(), WaiterState::Cxq);
                    (*p).set_state(WaiterState::Enter);
                    (*p).set_prev(null_mut());
                    (*p).set_next(head);
                    if !head.is_null() {
                        (*head).set_prev(p);
                    }
                    head = p;
                    p = next;
                }
            }
            self.entry_list.store(head, Ordering::Release);

            if self.succ.load(Ordering::Acquire) != 0 {
                continue;
            }

            let w = self.entry_list.load(Ordering::Relaxed);
            if !w.is_null() {
                unsafe {
                    self.exit_epilog(current, w);
                }
                return;
            }
        }
    }

    /// Hands off to `wakee`: marks it as successor, drops ownership and unparks it.
    unsafe fn exit_epilog(&self, current: &ThreadContext, wakee: *mut ObjectWaiter) {
        debug_assert_eq!(self.owner_raw(), current.identity());
        debug_assert_eq!((*wakee).state(), WaiterState::Enter);
        // The node may vanish as soon as ownership is dropped, read it first.
        let thread = (*wakee).thread;
        self.succ.store(thread.identity(), Ordering::Relaxed);
        self.release_clear_owner(current);
        fence(Ordering::SeqCst);
        thread.park_event.unpark();
    }

    /// Fully releases the monitor regardless of recursion depth and returns the depth so it
    /// can be restored by [ObjectMonitor::reenter].
    pub fn complete_exit(&self, current: &'static ThreadContext) -> Result<isize> {
        self.check_owner(current, "complete_exit")?;
        let save = self.recursions();
        self.recursions.store(0, Ordering::Relaxed);
        self.exit_owned(current);
        debug_assert_ne!(self.owner_raw(), current.identity());
        Ok(save)
    }

    /// Counterpart of [ObjectMonitor::complete_exit].
    pub fn reenter(&self, recursions: isize, current: &'static ThreadContext) -> Result<EnterStatus> {
        if self.owner_raw() == current.identity() {
            return Err(internal_error!("reenter by a thread that already owns the monitor"));
        }
        if self.enter(current) == EnterStatus::Cancelled {
            return Ok(EnterStatus::Cancelled);
        }
        if self.recursions() != 0 {
            return Err(internal_error!("reenter found recursions={}", self.recursions()));
        }
        self.recursions.store(recursions, Ordering::Relaxed);
        Ok(EnterStatus::Acquired)
    }

    /// Ensures `current` owns the monitor, converting a stack-lock owner on the way.
    pub(crate) fn check_owner(&self, current: &ThreadContext, operation: &'static str) -> Result<()> {
        let cur = self.owner_raw();
        if cur == current.identity() {
            return Ok(());
        }
        if self.is_stack_locked_by(current, cur) {
            self.set_owner_from_basic_lock(cur, current);
            self.recursions.store(0, Ordering::Relaxed);
            return Ok(());
        }
        Err(MonitorError::illegal_state(operation))
    }
}

impl fmt::Display for ObjectMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{contentions={:#010x},waiters={:#010x},recursions={},owner={:#x}}}",
            self.contentions(),
            self.waiters(),
            self.recursions(),
            self.owner_raw()
        )
    }
}

impl fmt::Debug for ObjectMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectMonitor")
            .field("address", &(self as *const Self))
            .field("header", &self.header())
            .field("object", &self.object)
            .field("owner", &format_args!("{:#x}", self.owner_raw()))
            .field("recursions", &self.recursions())
            .field("contentions", &self.contentions())
            .field("waiters", &self.waiters())
            .field("spin_duration", &self.spin_duration.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::header::ObjectHeader;
    use std::sync::atomic::AtomicUsize;

    pub(crate) fn test_env() -> Box<SyncEnv> {
        test_env_with(Config::default())
    }

    pub(crate) fn test_env_with(config: Config) -> Box<SyncEnv> {
        Box::new(SyncEnv::new(config, Arc::new(GlobalSafepoint::new())))
    }

    pub(crate) struct TestMonitor {
        pub monitor: *mut ObjectMonitor,
        _env: Box<SyncEnv>,
    }

    impl TestMonitor {
        pub fn new(object: Option<&ObjectHeader>) -> Self {
            Self::with_config(object, Config::default())
        }

        pub fn with_config(object: Option<&ObjectHeader>, config: Config) -> Self {
            let env = test_env_with(config);
            let monitor =
                ObjectMonitor::allocate(&*env, object.map(ObjectRef::new)).unwrap();
            Self { monitor, _env: env }
        }

        pub fn get(&self) -> &'static ObjectMonitor {
            unsafe { &*self.monitor }
        }
    }

    impl Drop for TestMonitor {
        fn drop(&mut self) {
            unsafe { ObjectMonitor::free(self.monitor) }
        }
    }

    unsafe impl Send for TestMonitor {}
    unsafe impl Sync for TestMonitor {}

    #[test]
    fn recursive_enter_exit() {
        let test = TestMonitor::new(None);
        let monitor = test.get();
        let me = ThreadContext::current();
        for _ in 0..3 {
            assert_eq!(monitor.enter(me), EnterStatus::Acquired);
        }
        assert_eq!(monitor.recursions(), 2);
        monitor.exit(me).unwrap();
        monitor.exit(me).unwrap();
        assert!(monitor.is_entered(me));
        monitor.exit(me).unwrap();
        assert_eq!(monitor.owner_raw(), 0);
        assert!(!monitor.is_busy());
    }

    #[test]
    fn exit_by_non_owner_fails() {
        let test = TestMonitor::new(None);
        let monitor = test.get();
        let err = monitor.exit(ThreadContext::current()).unwrap_err();
        assert_eq!(err, MonitorError::illegal_state("exit"));
    }

    #[test]
    fn complete_exit_and_reenter() {
        let test = TestMonitor::new(None);
        let monitor = test.get();
        let me = ThreadContext::current();
        monitor.enter(me);
        monitor.enter(me);
        let saved = monitor.complete_exit(me).unwrap();
        assert_eq!(saved, 1);
        assert_eq!(monitor.owner_raw(), 0);
        assert_eq!(monitor.reenter(saved, me).unwrap(), EnterStatus::Acquired);
        assert_eq!(monitor.recursions(), 1);
        monitor.exit(me).unwrap();
        monitor.exit(me).unwrap();
        assert!(!monitor.is_busy());
    }

    #[test]
    fn contended_enter_blocks_until_exit() {
        let test = Arc::new(TestMonitor::new(None));
        let monitor = test.get();
        let me = ThreadContext::current();
        assert_eq!(monitor.enter(me), EnterStatus::Acquired);

        let acquired = Arc::new(AtomicUsize::new(0));
        let handle = {
            let test = test.clone();
            let acquired = acquired.clone();
            std::thread::spawn(move || {
                let current = ThreadContext::current();
                assert_eq!(test.get().enter(current), EnterStatus::Acquired);
                acquired.store(1, Ordering::SeqCst);
                test.get().exit(current).unwrap();
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(acquired.load(Ordering::SeqCst), 0);
        monitor.exit(me).unwrap();
        handle.join().unwrap();
        assert_eq!(acquired.load(Ordering::SeqCst), 1);
        assert!(!monitor.is_busy());
    }

    #[test]
    fn first_contender_is_responsible_until_it_acquires() {
        let mut config = Config::default();
        config.fixed_spin = -1;
        let test = Arc::new(TestMonitor::with_config(None, config));
        let monitor = test.get();
        let me = ThreadContext::current();
        assert_eq!(monitor.enter(me), EnterStatus::Acquired);

        let contender_id = Arc::new(AtomicUsize::new(0));
        let handle = {
            let (test, contender_id) = (test.clone(), contender_id.clone());
            std::thread::spawn(move || {
                let current = ThreadContext::current();
                contender_id.store(current.identity(), Ordering::SeqCst);
                assert_eq!(test.get().enter(current), EnterStatus::Acquired);
                assert_eq!(test.get().responsible.load(Ordering::SeqCst), 0);
                test.get().exit(current).unwrap();
            })
        };

        let start = std::time::Instant::now();
        loop {
            let id = contender_id.load(Ordering::SeqCst);
            if id != 0 && monitor.responsible.load(Ordering::SeqCst) == id {
                break;
            }
            assert!(start.elapsed() < Duration::from_secs(10));
            std::thread::sleep(Duration::from_millis(1));
        }

        // the responsible thread parks with a timeout and rechecks on its own
        let before = monitor.env().counters.futile_wakeups.load(Ordering::Relaxed);
        let start = std::time::Instant::now();
        while monitor.env().counters.futile_wakeups.load(Ordering::Relaxed) == before {
            assert!(start.elapsed() < Duration::from_secs(10));
            std::thread::sleep(Duration::from_millis(5));
        }

        monitor.exit(me).unwrap();
        handle.join().unwrap();
        assert_eq!(monitor.responsible.load(Ordering::SeqCst), 0);
        assert!(!monitor.is_busy());
    }

    #[test]
    fn unlinking_a_missing_node_is_reported() {
        let test = TestMonitor::new(None);
        let monitor = test.get();
        let me = ThreadContext::current();
        assert_eq!(monitor.enter(me), EnterStatus::Acquired);

        let node = ObjectWaiter::new(me);
        node.set_state(WaiterState::Cxq);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| unsafe {
            monitor.unlink_after_acquire(me, &node)
        }));
        match result {
            // debug builds halt on the broken invariant
            Err(_) => assert!(cfg!(debug_assertions)),
            Ok(unlinked) => {
                assert!(!cfg!(debug_assertions));
                assert!(matches!(unlinked, Err(MonitorError::Internal { .. })));
            }
        }
        assert_eq!(node.state(), WaiterState::Run);
        assert!(monitor.cxq.load(Ordering::SeqCst).is_null());
        monitor.exit(me).unwrap();
    }

    #[test]
    fn display_format() {
        let test = TestMonitor::new(None);
        let text = test.get().to_string();
        assert_eq!(
            text,
            "{contentions=0x00000000,waiters=0x00000000,recursions=0,owner=0x0}"
        );
        assert!(test.get().is_busy_to_string().starts_with("is_busy: waiters=0"));
    }
}
