//! Object-level synchronization: stack locks, inflation, identity hashes and the
//! bookkeeping that drives asynchronous deflation.
use std::{
    marker::PhantomData,
    ops::ControlFlow,
    sync::{
        atomic::{fence, AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{
    error::{MonitorError, Result},
    gcref::ObjectRef,
    globals::{
        INFLATION_SPIN_LIMIT, INFLATION_YIELDS_BEFORE_PARK, MIN_MONITOR_DEFLATION_MAX,
        NINFLATION_LOCKS, ZERO_HASH_SUBSTITUTE,
    },
    handshake::Handshake,
    header::{BasicLock, MarkWord, ObjectHeader, UNUSED_MARK},
    monitor::{EnterStatus, ObjectMonitor, SyncEnv, WaitStatus, STACK_LOCK_OWNER_TAG},
    monitor_list::MonitorList,
    safepoint::GlobalSafepoint,
    statistics::{Counters, MonitorStatistics},
    thread::ThreadContext,
    Config,
};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum InflateCause {
    VmInternal,
    MonitorEnter,
    Wait,
    Notify,
    HashCode,
}

impl InflateCause {
    pub fn name(self) -> &'static str {
        match self {
            Self::VmInternal => "VM Internal",
            Self::MonitorEnter => "Monitor Enter",
            Self::Wait => "Monitor Wait",
            Self::Notify => "Monitor Notify",
            Self::HashCode => "Monitor Hash Code",
        }
    }
}

pub(crate) struct DeflationSignal {
    pub shutdown: bool,
}

pub struct ObjectSynchronizer {
    env: Box<SyncEnv>,
    in_use_list: MonitorList,
    inflation_locks: Vec<Mutex<()>>,
    ceiling_bump: AtomicUsize,
    no_progress_cnt: AtomicUsize,
    created: Instant,
    last_async_deflation_ns: AtomicU64,
    is_async_deflation_requested: AtomicBool,
    /// Serializes deflation cycles; unlinking relies on a single deflater.
    deflation_lock: Mutex<()>,
    pub(crate) deflation_signal: Mutex<DeflationSignal>,
    pub(crate) deflation_cond: Condvar,
}

unsafe impl Send for ObjectSynchronizer {}
unsafe impl Sync for ObjectSynchronizer {}

impl ObjectSynchronizer {
    pub fn new(config: Config) -> Arc<Self> {
        Self::with_safepoint(config, Arc::new(GlobalSafepoint::new()))
    }

    /// Creates a synchronizer that honors pause requests made through `safepoint`.
    pub fn with_safepoint(mut config: Config, safepoint: Arc<GlobalSafepoint>) -> Arc<Self> {
        if config.monitor_deflation_max < MIN_MONITOR_DEFLATION_MAX {
            config.monitor_deflation_max = MIN_MONITOR_DEFLATION_MAX;
        }
        Arc::new(Self {
            env: Box::new(SyncEnv::new(config, safepoint)),
            in_use_list: MonitorList::new(),
            inflation_locks: (0..NINFLATION_LOCKS).map(|_| Mutex::new(())).collect(),
            ceiling_bump: AtomicUsize::new(0),
            no_progress_cnt: AtomicUsize::new(0),
            created: Instant::now(),
            last_async_deflation_ns: AtomicU64::new(0),
            is_async_deflation_requested: AtomicBool::new(false),
            deflation_lock: Mutex::new(()),
            deflation_signal: Mutex::new(DeflationSignal { shutdown: false }),
            deflation_cond: Condvar::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.env.config
    }

    pub fn safepoint(&self) -> &Arc<GlobalSafepoint> {
        &self.env.safepoint
    }

    fn env_ptr(&self) -> *const SyncEnv {
        &*self.env
    }

    /// Acquires `object` for the calling thread, recording the acquisition in `lock`.
    ///
    /// # Safety
    ///
    /// `object` must stay alive and `lock` must stay at the same address until the matching
    /// [ObjectSynchronizer::exit] on the same thread.
    pub unsafe fn enter(&self, object: ObjectRef, lock: &BasicLock) -> Result<()> {
        let current = ThreadContext::current();
        let _scope = current.enter_critical();
        let obj = object.get();
        let mark = obj.mark();
        if mark.is_neutral() {
            // the displaced header must be visible before the lock-word points at it
            lock.set_displaced_header(mark);
            if obj.cas_set_mark(MarkWord::from_locker(lock), mark) == mark {
                current.push_lock_record(lock.address());
                return Ok(());
            }
        } else if mark.has_locker() && current.is_lock_owned(mark.locker() as usize) {
            debug_assert_ne!(mark.locker(), lock as *const BasicLock);
            lock.set_displaced_header(MarkWord::from_raw(0));
            current.push_lock_record(lock.address());
            return Ok(());
        }

        // Never displaced into this record. Non-zero so it does not read as recursive.
        lock.set_displaced_header(UNUSED_MARK);
        loop {
            let monitor = self.inflate_in_scope(current, object, InflateCause::MonitorEnter)?;
            if (*monitor).enter(current) == EnterStatus::Acquired {
                return Ok(());
            }
        }
    }

    /// Releases an acquisition made by [ObjectSynchronizer::enter] with the same `lock`.
    ///
    /// # Safety
    ///
    /// `object` must be alive.
    pub unsafe fn exit(&self, object: ObjectRef, lock: &BasicLock) -> Result<()> {
        let current = ThreadContext::current();
        let _scope = current.enter_critical();
        let obj = object.get();
        let mark = obj.mark();
        let dhw = lock.displaced_header();

        if dhw.value() == 0 {
            // recursive stack lock, nothing to undo
            if !current.is_lock_owned(lock.address()) {
                return Err(MonitorError::illegal_state("exit"));
            }
            current.remove_lock_record(lock.address());
            return Ok(());
        }

        if mark == MarkWord::from_locker(lock) {
            debug_assert!(dhw.is_neutral());
            if obj.cas_set_mark(dhw, mark) == mark {
                current.remove_lock_record(lock.address());
                return Ok(());
            }
        }

        // The monitor cannot be deflated while we own it, which keeps it valid until the
        // ownership is dropped inside exit.
        let monitor = self.inflate_in_scope(current, object, InflateCause::VmInternal)?;
        let result = (*monitor).exit(current);
        current.remove_lock_record(lock.address());
        result
    }

    /// Runs `f` while holding `object`.
    pub fn synchronized<R>(&self, object: &ObjectHeader, f: impl FnOnce() -> R) -> Result<R> {
        let guard = self.lock(object)?;
        let result = f();
        guard.unlock()?;
        Ok(result)
    }

    /// Acquires `object` until the returned guard is dropped or unlocked.
    pub fn lock<'a>(&'a self, object: &'a ObjectHeader) -> Result<MonitorGuard<'a>> {
        let lock = Box::new(BasicLock::new());
        unsafe {
            self.enter(ObjectRef::new(object), &lock)?;
        }
        Ok(MonitorGuard {
            sync: self,
            object,
            lock,
            released: false,
            _not_send: PhantomData,
        })
    }

    /// # Safety
    ///
    /// `object` must be alive.
    pub unsafe fn wait(&self, object: ObjectRef, millis: u64) -> Result<WaitStatus> {
        let current = ThreadContext::current();
        let _scope = current.enter_critical();
        let monitor = self.inflate_in_scope(current, object, InflateCause::Wait)?;
        (*monitor).wait(current, millis, true)
    }

    /// Like [ObjectSynchronizer::wait] but interrupts do not end the wait.
    ///
    /// # Safety
    ///
    /// `object` must be alive.
    pub unsafe fn wait_uninterruptibly(&self, object: ObjectRef, millis: u64) -> Result<WaitStatus> {
        let current = ThreadContext::current();
        let _scope = current.enter_critical();
        let monitor = self.inflate_in_scope(current, object, InflateCause::Wait)?;
        (*monitor).wait(current, millis, false)
    }

    /// # Safety
    ///
    /// `object` must be alive.
    pub unsafe fn notify(&self, object: ObjectRef) -> Result<()> {
        let current = ThreadContext::current();
        let _scope = current.enter_critical();
        let mark = object.get().mark();
        if mark.has_locker() && current.is_lock_owned(mark.locker() as usize) {
            // not inflated, so nobody can be waiting
            return Ok(());
        }
        let monitor = self.inflate_in_scope(current, object, InflateCause::Notify)?;
        (*monitor).notify(current)
    }

    /// # Safety
    ///
    /// `object` must be alive.
    pub unsafe fn notify_all(&self, object: ObjectRef) -> Result<()> {
        let current = ThreadContext::current();
        let _scope = current.enter_critical();
        let mark = object.get().mark();
        if mark.has_locker() && current.is_lock_owned(mark.locker() as usize) {
            return Ok(());
        }
        let monitor = self.inflate_in_scope(current, object, InflateCause::Notify)?;
        (*monitor).notify_all(current)
    }

    /// Releases `object` completely, whatever the recursion depth, and returns the depth
    /// for [ObjectSynchronizer::reenter].
    ///
    /// # Safety
    ///
    /// `object` must be alive.
    pub unsafe fn complete_exit(&self, object: ObjectRef) -> Result<isize> {
        let current = ThreadContext::current();
        let _scope = current.enter_critical();
        let monitor = self.inflate_in_scope(current, object, InflateCause::VmInternal)?;
        (*monitor).complete_exit(current)
    }

    /// # Safety
    ///
    /// `object` must be alive.
    pub unsafe fn reenter(&self, object: ObjectRef, recursions: isize) -> Result<()> {
        let current = ThreadContext::current();
        let _scope = current.enter_critical();
        loop {
            let monitor = self.inflate_in_scope(current, object, InflateCause::VmInternal)?;
            if (*monitor).reenter(recursions, current)? == EnterStatus::Acquired {
                return Ok(());
            }
        }
    }

    /// Whether the calling thread holds `object`.
    ///
    /// # Safety
    ///
    /// `object` must be alive.
    pub unsafe fn holds_lock(&self, object: ObjectRef) -> bool {
        let current = ThreadContext::current();
        let _scope = current.enter_critical();
        let mark = self.read_stable_mark(current, object);
        if mark.has_locker() {
            return current.is_lock_owned(mark.locker() as usize);
        }
        if mark.has_monitor() {
            return (*mark.monitor()).is_entered(current);
        }
        debug_assert!(mark.is_neutral());
        false
    }

    /// Thread currently holding `object`, if any. The answer may be stale by the time it
    /// is returned.
    ///
    /// # Safety
    ///
    /// `object` must be alive.
    pub unsafe fn lock_owner(&self, object: ObjectRef) -> Option<&'static ThreadContext> {
        let current = ThreadContext::current();
        let _scope = current.enter_critical();
        let mark = self.read_stable_mark(current, object);
        if mark.has_locker() {
            return ThreadContext::owner_of_lock_record(mark.locker() as usize);
        }
        if mark.has_monitor() {
            let monitor = &*mark.monitor();
            let owner = monitor.owner_raw();
            if owner & STACK_LOCK_OWNER_TAG != 0 && !monitor.owner_is_deflater_marker() {
                return ThreadContext::owner_of_lock_record(owner & !STACK_LOCK_OWNER_TAG);
            }
            return monitor.owner_thread();
        }
        None
    }

    /// Returns `object`'s monitor, inflating it if needed.
    ///
    /// # Safety
    ///
    /// `object` must be alive. The monitor may be deflated as soon as the caller leaves the
    /// monitor engine unless the caller keeps it busy.
    pub unsafe fn inflate(&self, object: ObjectRef, cause: InflateCause) -> Result<*mut ObjectMonitor> {
        let current = ThreadContext::current();
        let _scope = current.enter_critical();
        self.inflate_in_scope(current, object, cause)
    }

    pub(crate) unsafe fn inflate_in_scope(
        &self,
        current: &ThreadContext,
        object: ObjectRef,
        cause: InflateCause,
    ) -> Result<*mut ObjectMonitor> {
        let obj = object.get();
        loop {
            let mark = obj.mark();

            // already inflated
            if mark.has_monitor() {
                let inf = mark.monitor();
                debug_assert!((*inf).header().is_neutral());
                return Ok(inf);
            }

            // Somebody else is inflating a stack lock. Wait until the lock-word settles.
            if mark.is_being_inflated() {
                self.read_stable_mark(current, object);
                continue;
            }

            if mark.has_locker() {
                // Allocate before the CAS to keep the INFLATING window short.
                let m = ObjectMonitor::allocate(self.env_ptr(), Some(object))?;
                let cmp = obj.cas_set_mark(MarkWord::INFLATING, mark);
                if cmp != mark {
                    ObjectMonitor::free(m);
                    continue;
                }

                // The owner cannot exit while the lock-word is INFLATING, so the lock
                // record is still live.
                let dmw = (*mark.locker()).displaced_header();
                if !dmw.is_neutral() {
                    // undo the INFLATING claim so other threads are not stuck on it
                    obj.release_set_mark(mark);
                    ObjectMonitor::free(m);
                    return Err(internal_error!(
                        "displaced header {:?} of {:p} is not neutral",
                        dmw,
                        object
                    ));
                }
                (*m).set_header(dmw);
                (*m).set_owner_from(0, mark.locker() as usize | STACK_LOCK_OWNER_TAG);

                // publish the fully initialized monitor
                obj.release_set_mark(MarkWord::encode(m));
                self.in_use_list.add(m);
                Counters::bump(&self.env.counters.inflations);
                log::trace!(
                    target: "monitorinflation",
                    "inflate(has_locker): object={:p}, mark={:?}, cause={}",
                    object,
                    obj.mark(),
                    cause.name()
                );
                return Ok(m);
            }

            debug_assert!(mark.is_neutral(), "invalid mark: {:?}", mark);
            let m = ObjectMonitor::allocate(self.env_ptr(), Some(object))?;
            (*m).set_header(mark);
            if obj.cas_set_mark(MarkWord::encode(m), mark) != mark {
                ObjectMonitor::free(m);
                continue;
            }
            self.in_use_list.add(m);
            Counters::bump(&self.env.counters.inflations);
            log::trace!(
                target: "monitorinflation",
                "inflate(neutral): object={:p}, mark={:?}, cause={}",
                object,
                obj.mark(),
                cause.name()
            );
            return Ok(m);
        }
    }

    /// Reads the lock-word, waiting out any inflation in progress.
    ///
    /// Waiters spin first, then alternate between yielding and blocking on one of the
    /// inflation locks, which limits the number of threads spinning on one object.
    unsafe fn read_stable_mark(&self, current: &ThreadContext, object: ObjectRef) -> MarkWord {
        let obj = object.get();
        let mark = obj.mark();
        if !mark.is_being_inflated() {
            return mark;
        }

        let mut its = 0usize;
        loop {
            let mark = obj.mark();
            if !mark.is_being_inflated() {
                return mark;
            }

            its += 1;
            if its > INFLATION_SPIN_LIMIT || self.env.config.spin_limit == 0 {
                if its & 1 == 1 {
                    std::thread::yield_now();
                } else {
                    let ix = (object.address() >> 5) & (NINFLATION_LOCKS - 1);
                    let mut yield_then_block = 0;
                    let _guard = self.inflation_locks[ix].lock();
                    while obj.mark() == MarkWord::INFLATING {
                        if yield_then_block >= INFLATION_YIELDS_BEFORE_PARK {
                            let _blocked = current.enter_blocked();
                            current.park_event.park_millis(1);
                        } else {
                            std::thread::yield_now();
                        }
                        yield_then_block += 1;
                    }
                }
            } else {
                std::hint::spin_loop();
            }
        }
    }

    fn next_hash(current: &ThreadContext) -> u32 {
        let value = current.next_hash() & MarkWord::HASH_MASK;
        if value == 0 {
            ZERO_HASH_SUBSTITUTE
        } else {
            value
        }
    }

    /// Identity hash of `object`, installing one if it has none yet. Never 0.
    ///
    /// # Safety
    ///
    /// `object` must be alive.
    pub unsafe fn identity_hash(&self, object: ObjectRef) -> Result<u32> {
        let current = ThreadContext::current();
        let _scope = current.enter_critical();
        let obj = object.get();
        loop {
            let mark = self.read_stable_mark(current, object);
            if mark.is_neutral() {
                let hash = mark.hash();
                if hash != 0 {
                    return Ok(hash);
                }
                let hash = Self::next_hash(current);
                let temp = mark.copy_set_hash(hash);
                if obj.cas_set_mark(temp, mark) == mark {
                    return Ok(hash);
                }
                // Lost a race with another hash install, a lock or an inflation. Inflate
                // for stability and install the hash in the monitor.
            } else if mark.has_monitor() {
                let monitor = &*mark.monitor();
                let temp = monitor.header();
                debug_assert!(temp.is_neutral());
                let hash = temp.hash();
                if hash != 0 {
                    // header and contentions are written by different threads
                    fence(Ordering::SeqCst);
                    if monitor.is_being_async_deflated() {
                        // The hash is good but the monitor is going away; help it along
                        // and read the restored header instead.
                        monitor.install_displaced_markword_in_object(object);
                        continue;
                    }
                    return Ok(hash);
                }
            } else if mark.has_locker() && current.is_lock_owned(mark.locker() as usize) {
                let temp = (*mark.locker()).displaced_header();
                debug_assert!(temp.is_neutral());
                let hash = temp.hash();
                if hash != 0 {
                    return Ok(hash);
                }
                // Lock records may be read by inflating threads at any time, so they are
                // never modified in place. Inflate instead.
            }

            let monitor = &*self.inflate_in_scope(current, object, InflateCause::HashCode)?;
            let mark = monitor.header();
            debug_assert!(mark.is_neutral());
            let mut hash = mark.hash();
            if hash == 0 {
                hash = Self::next_hash(current);
                let temp = mark.copy_set_hash(hash);
                let test = monitor.cas_header(temp, mark);
                if test != mark {
                    // only another hash install can change the header
                    hash = test.hash();
                    debug_assert_ne!(hash, 0);
                }
                if monitor.is_being_async_deflated() {
                    monitor.install_displaced_markword_in_object(object);
                    continue;
                }
            }
            return Ok(hash);
        }
    }

    /// Called by the collector once `object` is unreachable, before its memory is reused.
    /// Clears the monitor's back-reference and waits until no thread can still be using
    /// the object through the monitor engine.
    ///
    /// # Safety
    ///
    /// `object` must not be reachable by mutators any more, but its memory must still be valid.
    pub unsafe fn object_died(&self, object: ObjectRef) {
        let mark = object.get().mark();
        if mark.has_monitor() {
            (*mark.monitor()).clear_object();
            log::trace!(target: "monitorinflation", "object_died: object={:p}, monitor={:p}", object, mark.monitor());
        }
        Handshake::synchronize();
    }

    /// Visits every monitor that is attached to a live object and not being deflated.
    pub fn monitors_iterate(&self, mut visitor: impl FnMut(&ObjectMonitor)) {
        let current = ThreadContext::current();
        let _scope = current.enter_critical();
        self.in_use_list.for_each(|monitor| {
            if !monitor.is_being_async_deflated() && monitor.object_peek().is_some() {
                visitor(monitor);
            }
        });
    }

    /// Visits the monitors owned by `thread`.
    pub fn owned_monitors_iterate(
        &self,
        thread: &ThreadContext,
        mut visitor: impl FnMut(&ObjectMonitor),
    ) {
        self.monitors_iterate(|monitor| {
            if monitor.is_entered(thread) {
                visitor(monitor);
            }
        });
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use_list.count()
    }

    /// Ceiling used by the deflation threshold: an estimate per attached thread plus
    /// whatever the deflater added after fruitless cycles.
    pub fn in_use_list_ceiling(&self) -> usize {
        let per_thread = self.env.config.avg_monitors_per_thread_estimate;
        per_thread * ThreadContext::attached_count().max(1) + self.ceiling_bump.load(Ordering::Relaxed)
    }

    fn set_in_use_list_ceiling(&self, ceiling: usize) {
        let base = self.in_use_list_ceiling() - self.ceiling_bump.load(Ordering::Relaxed);
        self.ceiling_bump
            .store(ceiling.saturating_sub(base), Ordering::Relaxed);
    }

    fn monitors_used_above_threshold(&self) -> bool {
        let config = &self.env.config;
        if config.monitor_used_deflation_threshold == 0 {
            return false;
        }
        let old_ceiling = self.in_use_list_ceiling();
        let mut ceiling = old_ceiling.max(self.in_use_list.max());
        let monitors_used = self.in_use_list.count();
        if monitors_used == 0 {
            return false;
        }

        if config.no_async_deflation_progress_max != 0
            && self.no_progress_cnt.load(Ordering::Relaxed) >= config.no_async_deflation_progress_max
        {
            let remainder = 100usize.saturating_sub(config.monitor_used_deflation_threshold);
            let new_ceiling = ceiling + ceiling * remainder / 100 + 1;
            self.set_in_use_list_ceiling(new_ceiling);
            log::info!(
                target: "monitorinflation",
                "Too many deflations without progress; bumping in_use_list_ceiling from {} to {}",
                old_ceiling,
                new_ceiling
            );
            self.no_progress_cnt.store(0, Ordering::Relaxed);
            ceiling = new_ceiling;
        }

        let monitor_usage = monitors_used * 100 / ceiling;
        monitor_usage > config.monitor_used_deflation_threshold
    }

    fn time_since_last_async_deflation(&self) -> Duration {
        let last = Duration::from_nanos(self.last_async_deflation_ns.load(Ordering::Acquire));
        self.created.elapsed().saturating_sub(last)
    }

    pub fn is_async_deflation_requested(&self) -> bool {
        self.is_async_deflation_requested.load(Ordering::Acquire)
    }

    pub fn is_async_deflation_needed(&self) -> bool {
        if self.is_async_deflation_requested() {
            return true;
        }
        let interval = self.env.config.async_deflation_interval_ms;
        if interval > 0
            && self.time_since_last_async_deflation() > Duration::from_millis(interval)
            && self.monitors_used_above_threshold()
        {
            log::info!(target: "monitorinflation", "Async deflation needed: monitors used are above the threshold");
            return true;
        }
        false
    }

    /// Asks the deflation thread for a cycle and waits up to five seconds for it to happen.
    pub fn request_deflate_idle_monitors(&self) -> bool {
        const N_CHECKS: usize = 5;
        let last_time = self.last_async_deflation_ns.load(Ordering::Acquire);
        self.is_async_deflation_requested.store(true, Ordering::Release);
        {
            let _signal = self.deflation_signal.lock();
            self.deflation_cond.notify_all();
        }
        for i in 0..N_CHECKS {
            if self.last_async_deflation_ns.load(Ordering::Acquire) > last_time {
                log::info!(target: "monitorinflation", "Async Deflation happened after {} check(s).", i);
                return true;
            }
            std::thread::sleep(Duration::from_millis(999));
        }
        log::info!(target: "monitorinflation", "Async Deflation DID NOT happen after {} checks.", N_CHECKS);
        false
    }

    fn deflate_monitor_list(&self) -> usize {
        let max = self.env.config.monitor_deflation_max;
        let mut deflated_count = 0;
        self.in_use_list.try_for_each(|monitor| {
            if monitor.deflate_monitor() {
                deflated_count += 1;
            }
            self.env.safepoint.block_if_armed();
            if deflated_count >= max {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        deflated_count
    }

    /// Runs one deflation cycle: deflates idle monitors, unlinks them, waits for every
    /// thread to acknowledge and frees them. Returns the number deflated.
    pub fn deflate_idle_monitors(&self) -> usize {
        let current = ThreadContext::current();
        let _serial = self.deflation_lock.lock();
        let start = Instant::now();

        self.is_async_deflation_requested
            .store(false, Ordering::Release);

        let deflated_count = {
            let _scope = current.enter_critical();
            self.deflate_monitor_list()
        };

        let mut unlinked_count = 0;
        let mut deleted_count = 0;
        if deflated_count > 0 {
            let mut delete_list = Vec::with_capacity(deflated_count);
            unlinked_count = {
                let _scope = current.enter_critical();
                unsafe {
                    self.in_use_list.unlink_deflated(
                        self.env.config.monitor_deflation_max,
                        &self.env.safepoint,
                        &mut delete_list,
                    )
                }
            };

            let waited = Handshake::synchronize();
            log::debug!(target: "monitorinflation", "handshake waited for {} thread(s)", waited);

            for monitor in delete_list {
                unsafe {
                    ObjectMonitor::free(monitor);
                }
                deleted_count += 1;
                self.env.safepoint.block_if_armed();
            }
        }

        // stamped at the end so a requester that sees it also sees the freed monitors
        self.last_async_deflation_ns
            .store(self.created.elapsed().as_nanos() as u64, Ordering::Release);
        Counters::add(&self.env.counters.deflations, deflated_count);
        Counters::bump(&self.env.counters.deflation_cycles);

        if deflated_count != 0 {
            self.no_progress_cnt.store(0, Ordering::Relaxed);
        } else {
            self.no_progress_cnt.fetch_add(1, Ordering::Relaxed);
        }

        logln_if!(
            self.env.config.verbose,
            "deflated={}, unlinked={}, deleted={} in {:?}; in_use_list stats: ceiling={}, count={}, max={}",
            deflated_count,
            unlinked_count,
            deleted_count,
            start.elapsed(),
            self.in_use_list_ceiling(),
            self.in_use_list.count(),
            self.in_use_list.max()
        );

        deflated_count
    }

    pub fn statistics(&self) -> MonitorStatistics {
        self.env.counters.snapshot(
            self.in_use_list.count(),
            self.in_use_list.max(),
            self.in_use_list_ceiling(),
        )
    }
}

impl Drop for ObjectSynchronizer {
    fn drop(&mut self) {
        let mut monitors = Vec::new();
        self.in_use_list.for_each(|monitor| {
            monitors.push(monitor as *const ObjectMonitor as *mut ObjectMonitor);
        });
        logln_if!(
            self.env.config.verbose,
            "freeing {} monitors on shutdown",
            monitors.len()
        );
        for monitor in monitors {
            unsafe {
                ObjectMonitor::free(monitor);
            }
        }
    }
}

/// Holds an object's lock; released on drop. Must be dropped on the thread that took it.
pub struct MonitorGuard<'a> {
    sync: &'a ObjectSynchronizer,
    object: &'a ObjectHeader,
    lock: Box<BasicLock>,
    released: bool,
    _not_send: PhantomData<*const ()>,
}

impl MonitorGuard<'_> {
    pub fn object(&self) -> ObjectRef {
        ObjectRef::new(self.object)
    }

    pub fn wait(&self, millis: u64) -> Result<WaitStatus> {
        unsafe { self.sync.wait(self.object(), millis) }
    }

    pub fn notify(&self) -> Result<()> {
        unsafe { self.sync.notify(self.object()) }
    }

    pub fn notify_all(&self) -> Result<()> {
        unsafe { self.sync.notify_all(self.object()) }
    }

    pub fn unlock(mut self) -> Result<()> {
        self.released = true;
        unsafe { self.sync.exit(self.object(), &self.lock) }
    }
}

impl Drop for MonitorGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(error) = unsafe { self.sync.exit(self.object(), &self.lock) } {
            log::error!(target: "monitor", "failed to release {:p}: {}", self.object, error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::DEFLATER_MARKER;

    fn sync() -> Arc<ObjectSynchronizer> {
        ObjectSynchronizer::new(Config::default())
    }

    #[test]
    fn uncontended_lock_stays_thin() {
        let sync = sync();
        let object = ObjectHeader::new();
        let original = object.mark();
        {
            let _guard = sync.lock(&object).unwrap();
            assert!(object.mark().has_locker());
            assert!(unsafe { sync.holds_lock(ObjectRef::new(&object)) });
            let _inner = sync.lock(&object).unwrap();
            assert!(object.mark().has_locker());
        }
        assert_eq!(object.mark(), original);
        assert_eq!(sync.in_use_count(), 0);
    }

    #[test]
    fn exit_without_enter_fails() {
        let sync = sync();
        let object = ObjectHeader::new();
        let lock = BasicLock::new();
        let err = unsafe { sync.exit(ObjectRef::new(&object), &lock) }.unwrap_err();
        assert_eq!(err, MonitorError::illegal_state("exit"));
    }

    #[test]
    fn wait_inflates_stack_lock() {
        let sync = sync();
        let object = ObjectHeader::new();
        let guard = sync.lock(&object).unwrap();
        assert_eq!(guard.wait(10).unwrap(), WaitStatus::TimedOut);
        assert!(object.mark().has_monitor());
        assert!(unsafe { sync.holds_lock(guard.object()) });
        assert_eq!(
            unsafe { sync.lock_owner(guard.object()) }.map(|t| t.id()),
            Some(ThreadContext::current().id())
        );
        guard.unlock().unwrap();
        assert!(!unsafe { sync.holds_lock(ObjectRef::new(&object)) });
        assert!(unsafe { sync.lock_owner(ObjectRef::new(&object)) }.is_none());
    }

    #[test]
    fn notify_on_unowned_object_fails() {
        let sync = sync();
        let object = ObjectHeader::new();
        let err = unsafe { sync.notify(ObjectRef::new(&object)) }.unwrap_err();
        assert_eq!(err, MonitorError::illegal_state("notify"));
    }

    #[test]
    fn identity_hash_is_stable_and_nonzero() {
        let sync = sync();
        let object = ObjectHeader::new();
        let obj = ObjectRef::new(&object);
        let hash = unsafe { sync.identity_hash(obj) }.unwrap();
        assert_ne!(hash, 0);
        assert_eq!(object.mark().hash(), hash);
        assert_eq!(unsafe { sync.identity_hash(obj) }.unwrap(), hash);
    }

    #[test]
    fn identity_hash_of_own_stack_lock_inflates() {
        let sync = sync();
        let object = ObjectHeader::new();
        let guard = sync.lock(&object).unwrap();
        let hash = unsafe { sync.identity_hash(guard.object()) }.unwrap();
        assert!(object.mark().has_monitor());
        guard.unlock().unwrap();
        assert_eq!(unsafe { sync.identity_hash(ObjectRef::new(&object)) }.unwrap(), hash);
        sync.deflate_idle_monitors();
        assert!(object.mark().is_neutral());
        assert_eq!(object.mark().hash(), hash);
    }

    #[test]
    fn complete_exit_and_reenter_restore_depth() {
        let sync = sync();
        let object = ObjectHeader::new();
        let obj = ObjectRef::new(&object);
        let outer = sync.lock(&object).unwrap();
        let inner = sync.lock(&object).unwrap();
        let depth = unsafe { sync.complete_exit(obj) }.unwrap();
        assert!(!unsafe { sync.holds_lock(obj) });
        unsafe { sync.reenter(obj, depth) }.unwrap();
        assert!(unsafe { sync.holds_lock(obj) });
        inner.unlock().unwrap();
        outer.unlock().unwrap();
        assert!(!unsafe { sync.holds_lock(obj) });
    }

    #[test]
    fn ceiling_grows_after_fruitless_cycles() {
        let mut config = Config::default();
        config.avg_monitors_per_thread_estimate = 1;
        config.async_deflation_interval_ms = 1;
        config.no_async_deflation_progress_max = 1;
        let sync = ObjectSynchronizer::new(config);
        let object = ObjectHeader::new();
        let guard = sync.lock(&object).unwrap();
        unsafe { sync.inflate(guard.object(), InflateCause::VmInternal) }.unwrap();

        assert_eq!(sync.deflate_idle_monitors(), 0);
        assert_eq!(sync.ceiling_bump.load(Ordering::Relaxed), 0);
        std::thread::sleep(Duration::from_millis(5));
        sync.is_async_deflation_needed();
        assert!(sync.ceiling_bump.load(Ordering::Relaxed) > 0);
        assert_eq!(sync.no_progress_cnt.load(Ordering::Relaxed), 0);
        guard.unlock().unwrap();
    }

    #[test]
    fn reader_blocks_on_inflation_lock_until_mark_settles() {
        let sync = sync();
        let object = Arc::new(ObjectHeader::new());
        let original = object.mark();
        assert_eq!(object.cas_set_mark(MarkWord::INFLATING, original), original);

        let reader = {
            let (sync, object) = (sync.clone(), object.clone());
            std::thread::spawn(move || unsafe { sync.holds_lock(ObjectRef::new(&object)) })
        };

        // past the spin phase the reader parks while holding its shard of the lock array
        let ix = (ObjectRef::new(&object).address() >> 5) & (NINFLATION_LOCKS - 1);
        let start = Instant::now();
        while !sync.inflation_locks[ix].is_locked() {
            assert!(start.elapsed() < Duration::from_secs(10));
            std::thread::yield_now();
        }
        assert!(!reader.is_finished());

        object.release_set_mark(original);
        assert!(!reader.join().unwrap());
        assert!(!sync.inflation_locks[ix].is_locked());
        assert_eq!(object.mark(), original);
    }

    /// Leaves `monitor` as a deflater does between committing and restoring the header.
    fn commit_deflation(monitor: &ObjectMonitor) {
        assert_eq!(monitor.try_set_owner_from(0, DEFLATER_MARKER), 0);
        monitor.add_to_contentions(i32::MIN);
        assert!(monitor.is_being_async_deflated());
    }

    #[test]
    fn identity_hash_restores_header_of_deflating_monitor() {
        let sync = sync();
        let object = ObjectHeader::new();
        let obj = ObjectRef::new(&object);
        let hash = unsafe { sync.identity_hash(obj) }.unwrap();
        let monitor = unsafe { &*sync.inflate(obj, InflateCause::VmInternal).unwrap() };
        assert_eq!(monitor.header().hash(), hash);
        commit_deflation(monitor);

        assert_eq!(unsafe { sync.identity_hash(obj) }.unwrap(), hash);
        assert!(object.mark().is_neutral());
        assert_eq!(object.mark().hash(), hash);
    }

    #[test]
    fn identity_hash_installed_into_deflating_monitor_reaches_object() {
        let sync = sync();
        let object = ObjectHeader::new();
        let obj = ObjectRef::new(&object);
        let monitor = unsafe { &*sync.inflate(obj, InflateCause::VmInternal).unwrap() };
        assert_eq!(monitor.header().hash(), 0);
        commit_deflation(monitor);

        let hash = unsafe { sync.identity_hash(obj) }.unwrap();
        assert_ne!(hash, 0);
        assert!(object.mark().is_neutral());
        assert_eq!(object.mark().hash(), hash);
        assert_eq!(unsafe { sync.identity_hash(obj) }.unwrap(), hash);
    }

    #[test]
    fn deflation_cycle_stops_at_max() {
        let mut config = Config::default();
        config.monitor_deflation_max = MIN_MONITOR_DEFLATION_MAX;
        let sync = ObjectSynchronizer::new(config);
        let objects: Vec<ObjectHeader> = (0..MIN_MONITOR_DEFLATION_MAX + 76)
            .map(|_| ObjectHeader::new())
            .collect();
        for object in &objects {
            unsafe { sync.inflate(ObjectRef::new(object), InflateCause::VmInternal) }.unwrap();
        }
        assert_eq!(sync.in_use_count(), objects.len());

        assert_eq!(sync.deflate_idle_monitors(), MIN_MONITOR_DEFLATION_MAX);
        assert_eq!(sync.in_use_count(), 76);
        assert_eq!(sync.deflate_idle_monitors(), 76);
        assert_eq!(sync.in_use_count(), 0);
        assert!(objects.iter().all(|object| object.mark().is_neutral()));
    }

    #[test]
    fn inflating_lock_with_bad_displaced_header_is_reported() {
        let sync = sync();
        let object = ObjectHeader::new();
        let original = object.mark();
        let lock = BasicLock::new();
        lock.set_displaced_header(UNUSED_MARK);
        let locked = MarkWord::from_locker(&lock);
        assert_eq!(object.cas_set_mark(locked, original), original);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| unsafe {
            sync.inflate(ObjectRef::new(&object), InflateCause::VmInternal)
        }));
        match result {
            // debug builds halt on the broken invariant
            Err(_) => assert!(cfg!(debug_assertions)),
            Ok(inflated) => {
                assert!(!cfg!(debug_assertions));
                assert!(matches!(inflated, Err(MonitorError::Internal { .. })));
            }
        }
        // the INFLATING claim was undone and nothing was published
        assert_eq!(object.mark(), locked);
        assert_eq!(sync.in_use_count(), 0);
        object.release_set_mark(original);
    }
}
