use std::sync::atomic::{fence, Ordering};

use super::{ObjectMonitor, DEFLATER_MARKER};
use crate::{gcref::ObjectRef, header::MarkWord};

impl ObjectMonitor {
    /// A committed deflation leaves `contentions` negative for good.
    #[inline(always)]
    pub fn is_being_async_deflated(&self) -> bool {
        self.contentions() < 0
    }

    /// Tries to deflate an idle monitor and restore the object's header. Returns whether
    /// the monitor is now deflated; it still has to be unlinked and freed by the caller.
    ///
    /// The claim takes two steps. `owner` goes from 0 to [DEFLATER_MARKER], which fends off
    /// fast-path enters, then `contentions` goes from 0 to `i32::MIN`, which commits. A
    /// contender slipping in between either bumps `contentions` (the commit CAS fails) or
    /// takes the marker for itself (the restore fails and we undo the extra contention
    /// it added on our behalf).
    pub(crate) fn deflate_monitor(&self) -> bool {
        if self.is_busy() {
            return false;
        }

        let object = self.object_peek();
        match object {
            None => {
                // The object died: nobody can reach this monitor through a lock-word.
                if self.try_set_owner_from(0, DEFLATER_MARKER) != 0 {
                    return false;
                }
                debug_assert!(self.contentions() >= 0);
                self.contentions.store(i32::MIN, Ordering::SeqCst);
            }
            Some(_) => {
                if self.try_set_owner_from(0, DEFLATER_MARKER) != 0 {
                    return false;
                }

                if self.contentions() > 0 || self.waiters() != 0 {
                    self.abort_deflation();
                    return false;
                }

                if self
                    .contentions
                    .compare_exchange(0, i32::MIN, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    self.abort_deflation();
                    return false;
                }
            }
        }

        debug_assert!(self.owner_is_deflater_marker());
        debug_assert!(self.contentions() < 0);
        debug_assert_eq!(self.waiters(), 0);
        debug_assert!(self.cxq.load(Ordering::Relaxed).is_null());
        debug_assert!(self.entry_list.load(Ordering::Relaxed).is_null());

        if let Some(object) = object {
            log::trace!(
                target: "monitorinflation",
                "deflate_monitor: object={:p}, mark={:?}",
                object,
                unsafe { object.get() }.mark()
            );
            self.install_displaced_markword_in_object(object);
        }
        true
    }

    fn abort_deflation(&self) {
        if self.try_set_owner_from(DEFLATER_MARKER, 0) != DEFLATER_MARKER {
            // A contender took the marker and added a contention for us.
            self.add_to_contentions(-1);
        }
    }

    /// Writes the displaced header back into `object` if its lock-word still points at this
    /// monitor. Safe to call more than once and from any thread that saw the monitor
    /// being deflated.
    pub fn install_displaced_markword_in_object(&self, object: ObjectRef) {
        fence(Ordering::SeqCst);

        let Some(l_object) = self.object_peek() else {
            return;
        };
        debug_assert_eq!(l_object, object);

        let dmw = self.header();
        debug_assert!(dmw.is_neutral(), "displaced header must be neutral: {:?}", dmw);

        let encoded = MarkWord::encode(self);
        let res = unsafe { object.get() }.cas_set_mark(dmw, encoded);
        if res != encoded {
            log::info!(
                target: "monitorinflation",
                "install_displaced_markword_in_object: failed cas_set_mark: new_mark={:#x}, old_mark={:#x}, res={:#x}",
                dmw.value(),
                encoded.value(),
                res.value()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        header::{MarkWord, ObjectHeader},
        monitor::{tests::TestMonitor, EnterStatus, DEFLATER_MARKER},
        thread::ThreadContext,
    };

    fn attach(object: &ObjectHeader, test: &TestMonitor) {
        let mark = object.mark();
        test.get().set_header(mark);
        assert_eq!(object.cas_set_mark(MarkWord::encode(test.monitor), mark), mark);
    }

    #[test]
    fn idle_monitor_deflates_and_restores_header() {
        let object = ObjectHeader::with_mark(MarkWord::prototype().copy_set_hash(0x1234).copy_set_age(3));
        let original = object.mark();
        let test = TestMonitor::new(Some(&object));
        attach(&object, &test);

        assert!(test.get().deflate_monitor());
        assert!(test.get().is_being_async_deflated());
        assert!(test.get().owner_is_deflater_marker());
        assert_eq!(object.mark(), original);

        // idempotent
        test.get().install_displaced_markword_in_object(crate::gcref::ObjectRef::new(&object));
        assert_eq!(object.mark(), original);
    }

    #[test]
    fn owned_monitor_is_not_deflated() {
        let object = ObjectHeader::new();
        let test = TestMonitor::new(Some(&object));
        attach(&object, &test);
        let me = ThreadContext::current();
        assert_eq!(test.get().enter(me), EnterStatus::Acquired);
        assert!(!test.get().deflate_monitor());
        assert!(object.mark().has_monitor());
        test.get().exit(me).unwrap();
    }

    #[test]
    fn contender_after_commit_is_cancelled() {
        let object = ObjectHeader::new();
        let test = TestMonitor::new(Some(&object));
        attach(&object, &test);
        assert!(test.get().deflate_monitor());
        let me = ThreadContext::current();
        assert_eq!(test.get().enter(me), EnterStatus::Cancelled);
        assert!(object.mark().is_neutral());
    }

    #[test]
    fn marker_taken_by_contender_aborts_deflation() {
        let object = ObjectHeader::new();
        let test = TestMonitor::new(Some(&object));
        attach(&object, &test);
        let monitor = test.get();
        let me = ThreadContext::current();

        // Deflater's first step, then a contender takes over the marker.
        assert_eq!(monitor.try_set_owner_from(0, DEFLATER_MARKER), 0);
        monitor.add_to_contentions(1);
        assert!(monitor.try_cancel_deflation(me));
        monitor.add_to_contentions(-1);
        assert_eq!(monitor.contentions(), 1);

        // Deflater notices the contention and undoes its claim.
        monitor.abort_deflation();
        assert_eq!(monitor.contentions(), 0);
        assert_eq!(monitor.owner_raw(), me.identity());
        assert!(!monitor.is_being_async_deflated());
        monitor.exit(me).unwrap();
        assert!(object.mark().has_monitor());
    }

    #[test]
    fn dead_object_monitor_deflates() {
        let object = ObjectHeader::new();
        let test = TestMonitor::new(Some(&object));
        attach(&object, &test);
        test.get().clear_object();
        assert!(test.get().deflate_monitor());
        assert_eq!(test.get().contentions(), i32::MIN);
    }
}
