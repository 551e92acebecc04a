use std::{
    fmt,
    ptr::{null_mut, NonNull},
    sync::atomic::{AtomicPtr, Ordering},
};

use crate::header::ObjectHeader;

/// Untyped, non-owning reference to an object header.
///
/// Validity is the collector's business: the engine only dereferences an `ObjectRef`
/// while the object is reachable from the calling mutator or, for the deflater, while the
/// handshake protocol keeps the collector from reclaiming it.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct ObjectRef {
    pub(crate) header: NonNull<ObjectHeader>,
}

impl ObjectRef {
    pub fn new(header: &ObjectHeader) -> Self {
        Self {
            header: NonNull::from(header),
        }
    }

    /// # Safety
    ///
    /// The object must still be alive.
    #[inline(always)]
    pub unsafe fn get<'a>(self) -> &'a ObjectHeader {
        &*self.header.as_ptr()
    }

    #[inline(always)]
    pub fn as_ptr(self) -> *mut ObjectHeader {
        self.header.as_ptr()
    }

    #[inline(always)]
    pub fn address(self) -> usize {
        self.header.as_ptr() as usize
    }
}

unsafe impl Send for ObjectRef {}
unsafe impl Sync for ObjectRef {}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header
    }
}

impl Eq for ObjectRef {}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:p})", self.header)
    }
}

impl fmt::Pointer for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p}", self.header)
    }
}

/// Weak slot holding a monitor's back-reference to its object.
///
/// Reading the slot never keeps the object alive; the collector clears it when the
/// object dies and the monitor has to cope with finding it empty.
pub struct WeakSlot {
    value: AtomicPtr<ObjectHeader>,
}

impl WeakSlot {
    pub fn new(object: Option<ObjectRef>) -> Self {
        Self {
            value: AtomicPtr::new(object.map_or(null_mut(), ObjectRef::as_ptr)),
        }
    }

    /// Non-owning read. `None` once the collector has cleared the slot.
    #[inline(always)]
    pub fn peek(&self) -> Option<ObjectRef> {
        NonNull::new(self.value.load(Ordering::Acquire)).map(|header| ObjectRef { header })
    }

    #[inline(always)]
    pub fn clear(&self) {
        self.value.store(null_mut(), Ordering::Release);
    }
}

impl fmt::Debug for WeakSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peek() {
            Some(object) => write!(f, "WeakSlot({:p})", object),
            None => write!(f, "WeakSlot(cleared)"),
        }
    }
}
