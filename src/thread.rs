use std::{
    fmt,
    sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
};

use atomic::Atomic;
use parking_lot::Mutex;

use crate::{
    globals::{HASH_STATE_W, HASH_STATE_Y, HASH_STATE_Z},
    park::ParkEvent,
};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ThreadState {
    /// Executing runtime or managed code.
    InVm = 0,
    /// Executing foreign code that cannot touch monitors.
    InNative = 1,
    /// Parked or otherwise blocked.
    Blocked = 2,
    /// Context is on the free list.
    Terminated = 3,
}

impl ThreadState {
    /// Spinning on a lock owned by a thread in this state cannot pay off.
    pub fn not_runnable(self) -> bool {
        matches!(self, Self::InNative | Self::Blocked)
    }
}

/// Per-thread record used by the monitor engine.
///
/// Contexts are type-stable and immortal: once created they are never freed, and a
/// detached context goes onto a free list to be reused by the next attaching thread.
/// Other threads may therefore read a context (for instance the spin admission check
/// reading an owner's state) without any lifetime protocol; the values they see may be
/// stale but the memory is always valid.
pub struct ThreadContext {
    id: AtomicU64,
    pub(crate) park_event: ParkEvent,
    pub(crate) state: Atomic<ThreadState>,
    /// Address of the monitor this thread is contending for, 0 if none.
    pub(crate) stalled: AtomicUsize,
    interrupted: AtomicBool,
    hash_state: [AtomicU32; 4],
    lock_records: Mutex<Vec<usize>>,
    /// Handshake epoch. Odd while the thread is inside monitor code.
    critical_epoch: AtomicU64,
    critical_depth: AtomicU32,
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);
static ALL_THREADS: Mutex<Vec<&'static ThreadContext>> = parking_lot::const_mutex(Vec::new());
static FREE_THREADS: Mutex<Vec<&'static ThreadContext>> = parking_lot::const_mutex(Vec::new());
static ATTACHED_THREADS: AtomicUsize = AtomicUsize::new(0);

struct Attachment(&'static ThreadContext);

impl Drop for Attachment {
    fn drop(&mut self) {
        ThreadContext::detach(self.0);
    }
}

thread_local! {
    static CURRENT: Attachment = Attachment(ThreadContext::attach());
}

impl ThreadContext {
    fn new(id: u64) -> Self {
        let ctx = Self {
            id: AtomicU64::new(id),
            park_event: ParkEvent::new(),
            state: Atomic::new(ThreadState::InVm),
            stalled: AtomicUsize::new(0),
            interrupted: AtomicBool::new(false),
            hash_state: [
                AtomicU32::new(0),
                AtomicU32::new(HASH_STATE_Y),
                AtomicU32::new(HASH_STATE_Z),
                AtomicU32::new(HASH_STATE_W),
            ],
            lock_records: Mutex::new(Vec::new()),
            critical_epoch: AtomicU64::new(0),
            critical_depth: AtomicU32::new(0),
        };
        ctx.reseed_hash(id);
        ctx
    }

    fn attach() -> &'static ThreadContext {
        let id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
        let reused = FREE_THREADS.lock().pop();
        let ctx = match reused {
            Some(ctx) => {
                ctx.id.store(id, Ordering::Relaxed);
                ctx.park_event.reset();
                ctx.stalled.store(0, Ordering::Relaxed);
                ctx.interrupted.store(false, Ordering::Relaxed);
                ctx.lock_records.lock().clear();
                ctx.reseed_hash(id);
                ctx.state.store(ThreadState::InVm, Ordering::Release);
                ctx
            }
            None => {
                let ctx: &'static ThreadContext = Box::leak(Box::new(ThreadContext::new(id)));
                ALL_THREADS.lock().push(ctx);
                ctx
            }
        };
        ATTACHED_THREADS.fetch_add(1, Ordering::Relaxed);
        log::trace!(target: "monitor", "attached thread #{} ({:p})", id, ctx);
        ctx
    }

    fn detach(ctx: &'static ThreadContext) {
        debug_assert_eq!(ctx.critical_depth.load(Ordering::Relaxed), 0);
        ctx.state.store(ThreadState::Terminated, Ordering::Release);
        ATTACHED_THREADS.fetch_sub(1, Ordering::Relaxed);
        log::trace!(target: "monitor", "detached thread #{}", ctx.id());
        FREE_THREADS.lock().push(ctx);
    }

    /// Context of the calling thread, attaching it on first use.
    pub fn current() -> &'static ThreadContext {
        CURRENT.with(|attachment| attachment.0)
    }

    /// Number of currently attached threads.
    pub fn attached_count() -> usize {
        ATTACHED_THREADS.load(Ordering::Relaxed)
    }

    /// Visits every context ever created, attached or not.
    pub(crate) fn for_each(mut visitor: impl FnMut(&'static ThreadContext)) {
        let all = ALL_THREADS.lock().clone();
        for ctx in all {
            visitor(ctx);
        }
    }

    pub fn id(&self) -> u64 {
        self.id.load(Ordering::Relaxed)
    }

    /// Identity stored in a monitor's owner field.
    #[inline(always)]
    pub(crate) fn identity(&self) -> usize {
        self as *const Self as usize
    }

    /// # Safety
    ///
    /// `identity` must have been produced by [ThreadContext::identity].
    #[inline(always)]
    pub(crate) unsafe fn from_identity(identity: usize) -> &'static ThreadContext {
        &*(identity as *const ThreadContext)
    }

    pub fn state(&self) -> ThreadState {
        self.state.load(Ordering::Acquire)
    }

    pub fn park_event(&self) -> &ParkEvent {
        &self.park_event
    }

    /// Sets the interrupt flag and wakes the thread if it is parked.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.park_event.unpark();
    }

    pub fn is_interrupted(&self, clear: bool) -> bool {
        if clear {
            self.interrupted.swap(false, Ordering::SeqCst)
        } else {
            self.interrupted.load(Ordering::SeqCst)
        }
    }

    /// Runs `f` marked as executing foreign code. Contenders stop spinning on monitors
    /// owned by this thread for the duration.
    pub fn native_scope<R>(&self, f: impl FnOnce() -> R) -> R {
        let _state = StateGuard::new(self, ThreadState::InNative);
        f()
    }

    pub(crate) fn push_lock_record(&self, record: usize) {
        self.lock_records.lock().push(record);
    }

    pub(crate) fn remove_lock_record(&self, record: usize) {
        let mut records = self.lock_records.lock();
        if let Some(pos) = records.iter().rposition(|&r| r == record) {
            records.swap_remove(pos);
        }
    }

    /// Whether `record` is a lock record currently held by this thread.
    pub(crate) fn is_lock_owned(&self, record: usize) -> bool {
        self.lock_records.lock().contains(&record)
    }

    /// Thread whose live lock records include `record`.
    pub(crate) fn owner_of_lock_record(record: usize) -> Option<&'static ThreadContext> {
        let mut owner = None;
        Self::for_each(|thread| {
            if owner.is_none()
                && thread.state() != ThreadState::Terminated
                && thread.is_lock_owned(record)
            {
                owner = Some(thread);
            }
        });
        owner
    }

    /// Marsaglia's xor-shift scheme with thread-specific state.
    pub(crate) fn next_hash(&self) -> u32 {
        let mut t = self.hash_state[0].load(Ordering::Relaxed);
        t ^= t << 11;
        let y = self.hash_state[1].load(Ordering::Relaxed);
        let z = self.hash_state[2].load(Ordering::Relaxed);
        let w = self.hash_state[3].load(Ordering::Relaxed);
        self.hash_state[0].store(y, Ordering::Relaxed);
        self.hash_state[1].store(z, Ordering::Relaxed);
        self.hash_state[2].store(w, Ordering::Relaxed);
        let v = (w ^ (w >> 19)) ^ (t ^ (t >> 8));
        self.hash_state[3].store(v, Ordering::Relaxed);
        v
    }

    fn reseed_hash(&self, id: u64) {
        // splitmix64 of the id and context address
        let mut z = id
            .wrapping_add(self as *const Self as u64)
            .wrapping_add(0x9E37_79B9_7F4A_7C15);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^= z >> 31;
        self.hash_state[0].store(z as u32 | 1, Ordering::Relaxed);
        self.hash_state[1].store(HASH_STATE_Y, Ordering::Relaxed);
        self.hash_state[2].store(HASH_STATE_Z, Ordering::Relaxed);
        self.hash_state[3].store(HASH_STATE_W, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn critical_epoch(&self) -> u64 {
        self.critical_epoch.load(Ordering::SeqCst)
    }

    /// Marks the thread as running monitor code until the scope is dropped. Monitors
    /// reachable from the thread are not reclaimed while the scope is open.
    pub(crate) fn enter_critical(&self) -> CriticalScope<'_> {
        if self.critical_depth.fetch_add(1, Ordering::Relaxed) == 0 {
            self.critical_epoch.fetch_add(1, Ordering::SeqCst);
            fence(Ordering::SeqCst);
        }
        CriticalScope { thread: self }
    }

    /// Leaves the critical scope entirely (if open) and marks the thread blocked until the
    /// returned guard is dropped. Used around every park.
    pub(crate) fn enter_blocked(&self) -> BlockedGuard<'_> {
        let depth = self.critical_depth.swap(0, Ordering::Relaxed);
        if depth != 0 {
            self.critical_epoch.fetch_add(1, Ordering::SeqCst);
        }
        let previous = self.state.swap(ThreadState::Blocked, Ordering::AcqRel);
        BlockedGuard {
            thread: self,
            depth,
            previous,
        }
    }
}

impl fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThreadContext(#{}, {:?})", self.id(), self.state())
    }
}

pub(crate) struct CriticalScope<'a> {
    thread: &'a ThreadContext,
}

impl Drop for CriticalScope<'_> {
    fn drop(&mut self) {
        if self.thread.critical_depth.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.thread.critical_epoch.fetch_add(1, Ordering::SeqCst);
        }
    }
}

pub(crate) struct BlockedGuard<'a> {
    thread: &'a ThreadContext,
    depth: u32,
    previous: ThreadState,
}

impl Drop for BlockedGuard<'_> {
    fn drop(&mut self) {
        self.thread.state.store(self.previous, Ordering::Release);
        if self.depth != 0 {
            self.thread
                .critical_depth
                .store(self.depth, Ordering::Relaxed);
            self.thread.critical_epoch.fetch_add(1, Ordering::SeqCst);
            fence(Ordering::SeqCst);
        }
    }
}

struct StateGuard<'a> {
    thread: &'a ThreadContext,
    previous: ThreadState,
}

impl<'a> StateGuard<'a> {
    fn new(thread: &'a ThreadContext, state: ThreadState) -> Self {
        let previous = thread.state.swap(state, Ordering::AcqRel);
        Self { thread, previous }
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        self.thread.state.store(self.previous, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_is_stable_per_thread() {
        let a = ThreadContext::current();
        let b = ThreadContext::current();
        assert!(std::ptr::eq(a, b));
        let other = std::thread::spawn(|| ThreadContext::current().identity())
            .join()
            .unwrap();
        assert_ne!(a.identity(), other);
    }

    #[test]
    fn critical_scope_epoch_parity() {
        let thread = ThreadContext::current();
        let before = thread.critical_epoch();
        assert_eq!(before & 1, 0);
        {
            let _outer = thread.enter_critical();
            let _inner = thread.enter_critical();
            assert_eq!(thread.critical_epoch() & 1, 1);
            {
                let _blocked = thread.enter_blocked();
                assert_eq!(thread.critical_epoch() & 1, 0);
                assert_eq!(thread.state(), ThreadState::Blocked);
            }
            assert_eq!(thread.critical_epoch() & 1, 1);
        }
        assert_eq!(thread.critical_epoch() & 1, 0);
        assert_eq!(thread.state(), ThreadState::InVm);
    }

    #[test]
    fn interrupt_flag() {
        let thread = ThreadContext::current();
        thread.interrupt();
        assert!(thread.is_interrupted(false));
        assert!(thread.is_interrupted(true));
        assert!(!thread.is_interrupted(false));
        thread.park_event.reset();
    }

    #[test]
    fn native_scope_is_not_runnable() {
        let thread = ThreadContext::current();
        let state = thread.native_scope(|| thread.state());
        assert!(state.not_runnable());
        assert_eq!(thread.state(), ThreadState::InVm);
    }

    #[test]
    fn hash_sequence_is_nonconstant() {
        let thread = ThreadContext::current();
        let a = thread.next_hash();
        let b = thread.next_hash();
        assert_ne!(a, b);
    }
}
