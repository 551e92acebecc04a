use std::{
    ops::ControlFlow,
    ptr::null_mut,
    sync::atomic::{AtomicUsize, Ordering},
};

use crossbeam_utils::atomic::AtomicCell;

use crate::{monitor::ObjectMonitor, safepoint::GlobalSafepoint};

/// Lock-free list of every monitor in use.
///
/// Any thread may prepend. Only the deflater removes entries, so unlinking never races
/// with another unlink, only with prepends at the head.
pub struct MonitorList {
    head: AtomicCell<*mut ObjectMonitor>,
    count: AtomicUsize,
    max: AtomicUsize,
}

unsafe impl Send for MonitorList {}
unsafe impl Sync for MonitorList {}

impl MonitorList {
    pub fn new() -> Self {
        Self {
            head: AtomicCell::new(null_mut()),
            count: AtomicUsize::new(0),
            max: AtomicUsize::new(0),
        }
    }

    pub fn head(&self) -> *mut ObjectMonitor {
        self.head.load()
    }

    pub unsafe fn add(&self, monitor: *mut ObjectMonitor) {
        let mut head = self.head.load();
        loop {
            debug_assert_ne!(monitor, head);
            (*monitor).next_om.store(head, Ordering::Release);
            match self.head.compare_exchange(head, monitor) {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }

        let count = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        if count > self.max() {
            self.max.fetch_max(count, Ordering::AcqRel);
        }
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn max(&self) -> usize {
        self.max.load(Ordering::Acquire)
    }

    pub fn for_each(&self, mut visitor: impl FnMut(&ObjectMonitor)) {
        self.try_for_each(|monitor| {
            visitor(monitor);
            ControlFlow::Continue(())
        });
    }

    /// Walks the list from the head until `visitor` breaks. Returns the number of monitors
    /// visited.
    pub fn try_for_each(&self, mut visitor: impl FnMut(&ObjectMonitor) -> ControlFlow<()>) -> usize {
        let mut visited = 0;
        unsafe {
            let mut current = self.head.load();
            while !current.is_null() {
                visited += 1;
                if visitor(&*current).is_break() {
                    break;
                }
                current = (*current).next_om.load(Ordering::Acquire);
            }
        }
        visited
    }

    /// Unlinks up to `limit` deflated monitors, appending them to `unlinked`. Honors pause
    /// requests between entries. Returns the number unlinked.
    ///
    /// # Safety
    ///
    /// Only one thread may unlink at a time.
    pub unsafe fn unlink_deflated(
        &self,
        limit: usize,
        safepoint: &GlobalSafepoint,
        unlinked: &mut Vec<*mut ObjectMonitor>,
    ) -> usize {
        let mut unlinked_count = 0;
        let mut prev: *mut ObjectMonitor = null_mut();
        let head = self.head.load();
        let mut m = head;

        while !m.is_null() {
            if (*m).is_being_async_deflated() {
                // gather the run of deflated monitors starting at m
                let mut next = m;
                loop {
                    let next_next = (*next).next_om.load(Ordering::Acquire);
                    unlinked_count += 1;
                    unlinked.push(next);
                    next = next_next;
                    if unlinked_count >= limit
                        || next.is_null()
                        || !(*next).is_being_async_deflated()
                    {
                        break;
                    }
                }

                if prev.is_null() {
                    if let Err(new_head) = self.head.compare_exchange(head, next) {
                        // new monitors were prepended, find m's predecessor among them
                        let mut n = new_head;
                        while n != m {
                            prev = n;
                            n = (*n).next_om.load(Ordering::Acquire);
                        }
                        (*prev).next_om.store(next, Ordering::Release);
                    }
                } else {
                    (*prev).next_om.store(next, Ordering::Release);
                }

                if unlinked_count >= limit {
                    break;
                }
                m = next;
            } else {
                prev = m;
                m = (*m).next_om.load(Ordering::Acquire);
            }

            safepoint.block_if_armed();
        }

        self.count.fetch_sub(unlinked_count, Ordering::AcqRel);
        unlinked_count
    }
}

impl Default for MonitorList {
    fn default() -> Self {
        Self::new()
    }
}
