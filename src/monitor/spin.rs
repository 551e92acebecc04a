//! Adaptive spinning.
//!
//! Each monitor keeps its own spin budget in `spin_duration`. A spin that acquires the
//! lock raises the budget by a bonus, a spin that runs out lowers it by a penalty. Both
//! updates are racy plain stores: the budget only needs to stay within
//! `[0, spin_limit + bonus]`, which every interleaving of the updates preserves.
//!
//! Spinning is abandoned early when the owner cannot release the lock any time soon
//! (it is parked, running foreign code or stalled on another monitor), when ownership
//! changes hands to another spinner, or when a pause is requested.
use std::sync::atomic::{fence, Ordering};

use super::{ObjectMonitor, OWNER_TAG_MASK};
use crate::{globals::SPIN_PAUSE_CHECK_MASK, thread::ThreadContext};

impl ObjectMonitor {
    fn spin_reward(&self, bonus: i32) {
        let config = &self.env().config;
        let mut x = self.spin_duration.load(Ordering::Relaxed);
        if x < config.spin_limit {
            if x < config.spin_poverty {
                x = config.spin_poverty;
            }
            self.spin_duration.store(x + bonus, Ordering::Relaxed);
        }
    }

    fn spin_penalize(&self) {
        let x = self.spin_duration.load(Ordering::Relaxed);
        if x > 0 {
            let penalty = self.env().config.spin_penalty;
            self.spin_duration
                .store((x - penalty).max(0), Ordering::Relaxed);
        }
    }

    pub fn spin_duration(&self) -> i32 {
        self.spin_duration.load(Ordering::Relaxed)
    }

    /// Spins for ownership. Returns whether the monitor was acquired.
    pub(crate) fn try_spin(&self, current: &ThreadContext) -> bool {
        let env = self.env();
        let config = &env.config;
        let me = current.identity();

        let mut ctr = config.fixed_spin;
        if ctr != 0 {
            while ctr > 0 {
                ctr -= 1;
                if self.try_lock(current) {
                    return true;
                }
                std::hint::spin_loop();
            }
            return false;
        }

        // a short fixed pre-spin to ride out very short critical sections
        for _ in 0..=config.pre_spin.max(0) {
            if self.try_lock(current) {
                self.spin_reward(config.spin_bonus_pre);
                return true;
            }
            std::hint::spin_loop();
        }

        let mut ctr = self.spin_duration.load(Ordering::Relaxed);
        if ctr <= 0 {
            return false;
        }

        if self.not_runnable(self.owner_raw()) {
            return false;
        }

        // Advertise ourselves as successor so the exiting owner does not unpark anybody.
        if self.succ.load(Ordering::Relaxed) == 0 {
            self.succ.store(me, Ordering::Relaxed);
        }

        let mut prv = 0;
        let mut exhausted = true;
        while ctr > 0 {
            ctr -= 1;
            if ctr & SPIN_PAUSE_CHECK_MASK == 0 {
                if env.safepoint.is_armed() {
                    exhausted = false;
                    break;
                }
                std::hint::spin_loop();
            }

            let ox = self.owner_raw();
            if ox == 0 {
                let ox = self.try_set_owner_from(0, me);
                if ox == 0 {
                    if self.succ.load(Ordering::Relaxed) == me {
                        self.succ.store(0, Ordering::Relaxed);
                    }
                    self.spin_reward(config.spin_bonus);
                    return true;
                }
                // another spinner got it first, stop competing
                exhausted = false;
                break;
            }

            // ownership changed hands while we watched, leave it to the queue
            if ox != prv && prv != 0 {
                exhausted = false;
                break;
            }
            prv = ox;

            if self.not_runnable(ox) {
                exhausted = false;
                break;
            }
            if self.succ.load(Ordering::Relaxed) == 0 {
                self.succ.store(me, Ordering::Relaxed);
            }
        }

        if exhausted {
            self.spin_penalize();
        }

        if self.succ.load(Ordering::Relaxed) == me {
            self.succ.store(0, Ordering::Relaxed);
            // the owner may have exited seeing succ set, retry before giving up
            fence(Ordering::SeqCst);
            if self.try_lock(current) {
                return true;
            }
        }
        false
    }

    /// Racy check of whether the thread owning this monitor is unable to run. The owner's
    /// context is type-stable, so a stale owner value reads a valid but unrelated context;
    /// at worst the spinner takes a suboptimal decision.
    fn not_runnable(&self, owner: usize) -> bool {
        if owner == 0 || owner & OWNER_TAG_MASK != 0 {
            return false;
        }
        let thread = unsafe { ThreadContext::from_identity(owner) };
        let blocked_on = thread.stalled.load(Ordering::Relaxed);
        if blocked_on != 0 {
            return blocked_on != self.address() && self.owner_raw() == owner;
        }
        thread.state().not_runnable()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use crate::{
        monitor::{tests::TestMonitor, EnterStatus},
        thread::ThreadContext,
        Config,
    };

    #[test]
    fn spin_budget_adapts_within_bounds() {
        let config = Config::default();
        let test = TestMonitor::new(None);
        let monitor = test.get();
        assert_eq!(monitor.spin_duration(), config.spin_limit);

        // penalties step down and stop at zero
        let mut expected = config.spin_limit;
        while expected > 0 {
            monitor.spin_penalize();
            expected = (expected - config.spin_penalty).max(0);
            assert_eq!(monitor.spin_duration(), expected);
        }
        monitor.spin_penalize();
        assert_eq!(monitor.spin_duration(), 0);

        // a pre-spin success lifts an exhausted budget to poverty plus the bonus
        let me = ThreadContext::current();
        assert!(monitor.try_spin(me));
        assert_eq!(
            monitor.spin_duration(),
            config.spin_poverty + config.spin_bonus_pre
        );
        monitor.exit(me).unwrap();

        // rewards never push past the limit plus one bonus
        monitor
            .spin_duration
            .store(config.spin_limit - 50, Ordering::Relaxed);
        for _ in 0..3 {
            monitor.spin_reward(config.spin_bonus);
            assert!(monitor.spin_duration() <= config.spin_limit + config.spin_bonus);
        }
        assert_eq!(monitor.spin_duration(), config.spin_limit + 50);
    }

    #[test]
    fn exhausted_spin_is_penalized() {
        let config = Config::default();
        let test = Arc::new(TestMonitor::new(None));
        let held = Arc::new(AtomicBool::new(false));
        let release = Arc::new(AtomicBool::new(false));
        let owner = {
            let (test, held, release) = (test.clone(), held.clone(), release.clone());
            std::thread::spawn(move || {
                let current = ThreadContext::current();
                assert_eq!(test.get().enter(current), EnterStatus::Acquired);
                held.store(true, Ordering::SeqCst);
                // stay runnable while holding the monitor
                while !release.load(Ordering::SeqCst) {
                    std::hint::spin_loop();
                }
                test.get().exit(current).unwrap();
            })
        };
        while !held.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }

        let monitor = test.get();
        monitor.spin_duration.store(300, Ordering::Relaxed);
        assert!(!monitor.try_spin(ThreadContext::current()));
        assert_eq!(monitor.spin_duration(), 300 - config.spin_penalty);

        release.store(true, Ordering::SeqCst);
        owner.join().unwrap();
    }

    #[test]
    fn spin_acquires_free_monitor() {
        let test = TestMonitor::new(None);
        let monitor = test.get();
        let me = ThreadContext::current();
        let before = monitor.spin_duration();
        assert!(monitor.try_spin(me));
        assert!(monitor.spin_duration() >= before);
        monitor.exit(me).unwrap();
    }

    #[test]
    fn spin_gives_up_on_parked_owner() {
        let test = Arc::new(TestMonitor::new(None));
        let in_native = Arc::new(AtomicBool::new(false));
        let release = Arc::new(AtomicBool::new(false));
        let owner = {
            let (test, in_native, release) = (test.clone(), in_native.clone(), release.clone());
            std::thread::spawn(move || {
                let current = ThreadContext::current();
                assert_eq!(test.get().enter(current), EnterStatus::Acquired);
                current.native_scope(|| {
                    in_native.store(true, Ordering::SeqCst);
                    while !release.load(Ordering::SeqCst) {
                        std::thread::sleep(std::time::Duration::from_millis(1));
                    }
                });
                test.get().exit(current).unwrap();
            })
        };
        while !in_native.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }
        let me = ThreadContext::current();
        let before = test.get().spin_duration();
        assert!(!test.get().try_spin(me));
        // abandoned, not exhausted, so no penalty
        assert_eq!(test.get().spin_duration(), before);
        release.store(true, Ordering::SeqCst);
        owner.join().unwrap();
    }
}
