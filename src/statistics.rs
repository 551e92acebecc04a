use std::sync::atomic::{AtomicUsize, Ordering};

/// Snapshot of monitor engine counters, see [crate::synchronizer::ObjectSynchronizer::statistics].
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct MonitorStatistics {
    pub inflations: usize,
    pub deflations: usize,
    pub deflation_cycles: usize,
    pub contended_lock_attempts: usize,
    pub futile_wakeups: usize,
    pub parks: usize,
    pub notifications: usize,
    pub extant_monitors: usize,
    pub registry_max: usize,
    pub in_use_list_ceiling: usize,
}

/// Live counters behind [MonitorStatistics]. Updated with relaxed atomics; values are
/// indicative only.
#[derive(Default)]
pub(crate) struct Counters {
    pub inflations: AtomicUsize,
    pub deflations: AtomicUsize,
    pub deflation_cycles: AtomicUsize,
    pub contended_lock_attempts: AtomicUsize,
    pub futile_wakeups: AtomicUsize,
    pub parks: AtomicUsize,
    pub notifications: AtomicUsize,
}

impl Counters {
    #[inline(always)]
    pub fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn add(counter: &AtomicUsize, value: usize) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub fn snapshot(&self, extant_monitors: usize, registry_max: usize, ceiling: usize) -> MonitorStatistics {
        MonitorStatistics {
            inflations: self.inflations.load(Ordering::Relaxed),
            deflations: self.deflations.load(Ordering::Relaxed),
            deflation_cycles: self.deflation_cycles.load(Ordering::Relaxed),
            contended_lock_attempts: self.contended_lock_attempts.load(Ordering::Relaxed),
            futile_wakeups: self.futile_wakeups.load(Ordering::Relaxed),
            parks: self.parks.load(Ordering::Relaxed),
            notifications: self.notifications.load(Ordering::Relaxed),
            extant_monitors,
            registry_max,
            in_use_list_ceiling: ceiling,
        }
    }
}

struct Percent {
    part: usize,
    whole: usize,
}

impl std::fmt::Display for Percent {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.whole == 0 {
            return write!(f, "-");
        }
        write!(f, "{:.2}%", (self.part as f64 / self.whole as f64) * 100.0)
    }
}

fn percent(part: usize, whole: usize) -> Percent {
    Percent { part, whole }
}

impl std::fmt::Display for MonitorStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Monitor statistics:")?;
        writeln!(
            f,
            "  Extant monitors: {} (max {}, ceiling {}, {} used)",
            self.extant_monitors,
            self.registry_max,
            self.in_use_list_ceiling,
            percent(self.extant_monitors, self.in_use_list_ceiling)
        )?;
        writeln!(f, "  Inflations: {}", self.inflations)?;
        writeln!(
            f,
            "  Deflations: {} in {} cycles",
            self.deflations, self.deflation_cycles
        )?;
        writeln!(
            f,
            "  Contended lock attempts: {}",
            self.contended_lock_attempts
        )?;
        writeln!(
            f,
            "  Parks: {} ({} futile wakeups, {})",
            self.parks,
            self.futile_wakeups,
            percent(self.futile_wakeups, self.parks)
        )?;
        writeln!(f, "  Notifications: {}", self.notifications)?;
        Ok(())
    }
}
