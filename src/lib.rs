//! Object monitors for VMs written in Rust.
//!
//! Objects start out with a plain lock-word. Uncontended locking is done with stack locks
//! (the lock-word points at a [header::BasicLock] in the owner's frame). Contention,
//! `wait`/`notify` or an identity hash on a locked object inflates the lock into an
//! [monitor::ObjectMonitor]. Idle monitors are deflated asynchronously by
//! [synchronizer::ObjectSynchronizer::deflate_idle_monitors], usually driven by a
//! [deflation::MonitorDeflationThread].
#[macro_use]
pub mod error;

macro_rules! logln_if {
    ($cond: expr, $($t:tt)*) => {
        if $cond {
            log::info!(target: "monitorinflation", $($t)*);
        }
    };
}

pub mod deflation;
pub mod gcref;
pub mod globals;
pub mod handshake;
pub mod header;
pub mod monitor;
pub mod monitor_list;
pub mod park;
pub mod safepoint;
pub mod statistics;
pub mod synchronizer;
pub mod thread;


pub use error::{MonitorError, Result};
pub use gcref::ObjectRef;
pub use header::{BasicLock, ObjectHeader};
pub use monitor::{ObjectMonitor, WaitStatus};
pub use synchronizer::{InflateCause, MonitorGuard, ObjectSynchronizer};
pub use thread::ThreadContext;

/// Configuration for the synchronizer constructor.
#[repr(C)]
#[derive(Clone, Debug)]
pub struct Config {
    /// Enables per-cycle deflation summaries
    pub verbose: bool,
    /// Upper bound of a monitor's adaptive spin duration
    pub spin_limit: i32,
    /// Fixed pre-spin iterations before the adaptive spin
    pub pre_spin: i32,
    /// If positive, spin exactly this long instead of adapting. Negative disables spinning.
    pub fixed_spin: i32,
    pub spin_bonus: i32,
    pub spin_bonus_pre: i32,
    pub spin_penalty: i32,
    /// Floor of the spin duration before a reward is added
    pub spin_poverty: i32,
    /// Ceiling of the responsible thread's timed park
    pub max_recheck_interval_ms: u64,
    /// Minimum time between threshold driven deflation cycles. 0 disables them.
    pub async_deflation_interval_ms: u64,
    /// How often the deflation thread re-evaluates whether it has work
    pub guaranteed_safepoint_interval_ms: u64,
    /// Percentage of the in-use ceiling that triggers deflation. 0 disables it.
    pub monitor_used_deflation_threshold: usize,
    pub avg_monitors_per_thread_estimate: usize,
    /// Maximum number of monitors deflated or unlinked in one cycle (at least 1024)
    pub monitor_deflation_max: usize,
    /// Fruitless cycles after which the in-use ceiling is raised
    pub no_async_deflation_progress_max: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            verbose: false,
            spin_limit: 5000,
            pre_spin: 10,
            fixed_spin: 0,
            spin_bonus: 100,
            spin_bonus_pre: 100,
            spin_penalty: 200,
            spin_poverty: 1000,
            max_recheck_interval_ms: 1000,
            async_deflation_interval_ms: 250,
            guaranteed_safepoint_interval_ms: 1000,
            monitor_used_deflation_threshold: 90,
            avg_monitors_per_thread_estimate: 1024,
            monitor_deflation_max: 1_000_000,
            no_async_deflation_progress_max: 3,
        }
    }
}

impl Config {
    /// Disables spinning on a uniprocessor host, where spinning can only delay the owner.
    pub fn adjusted_for_host(mut self) -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        if cpus < 2 {
            self.spin_limit = 0;
            self.pre_spin = 0;
            self.fixed_spin = -1;
        }
        self
    }
}

pub mod c_api {
    use std::sync::Arc;

    use crate::{
        gcref::ObjectRef, header::BasicLock, header::ObjectHeader,
        synchronizer::ObjectSynchronizer, Config,
    };

    #[no_mangle]
    pub extern "C" fn comet_sync_default_config() -> Config {
        Config::default()
    }

    #[no_mangle]
    pub extern "C" fn comet_sync_create(config: Config) -> *const ObjectSynchronizer {
        Arc::into_raw(ObjectSynchronizer::new(config))
    }

    /// Free a synchronizer created by [comet_sync_create]
    #[no_mangle]
    pub extern "C" fn comet_sync_free(sync: *const ObjectSynchronizer) {
        if sync.is_null() {
            return;
        }
        unsafe {
            drop(Arc::from_raw(sync));
        }
    }

    /// Locks `object`. Returns false if the monitor could not be allocated.
    #[no_mangle]
    pub extern "C" fn comet_sync_enter(
        sync: *const ObjectSynchronizer,
        object: *mut ObjectHeader,
        lock: *mut BasicLock,
    ) -> bool {
        unsafe {
            match (*sync).enter(ObjectRef::new(&*object), &*lock) {
                Ok(()) => true,
                Err(error) => {
                    log::error!(target: "monitor", "comet_sync_enter: {}", error);
                    false
                }
            }
        }
    }

    /// Unlocks `object`. Returns false if the calling thread did not hold it.
    #[no_mangle]
    pub extern "C" fn comet_sync_exit(
        sync: *const ObjectSynchronizer,
        object: *mut ObjectHeader,
        lock: *mut BasicLock,
    ) -> bool {
        unsafe {
            match (*sync).exit(ObjectRef::new(&*object), &*lock) {
                Ok(()) => true,
                Err(error) => {
                    log::error!(target: "monitor", "comet_sync_exit: {}", error);
                    false
                }
            }
        }
    }

    /// Identity hash of `object`, or 0 on failure.
    #[no_mangle]
    pub extern "C" fn comet_sync_identity_hash(
        sync: *const ObjectSynchronizer,
        object: *mut ObjectHeader,
    ) -> u32 {
        unsafe { (*sync).identity_hash(ObjectRef::new(&*object)).unwrap_or(0) }
    }

    #[no_mangle]
    pub extern "C" fn comet_sync_deflate_idle_monitors(sync: *const ObjectSynchronizer) -> usize {
        unsafe { (*sync).deflate_idle_monitors() }
    }
}
