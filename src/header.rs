use crate::monitor::ObjectMonitor;
use modular_bitfield::prelude::*;
use std::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};

#[cfg(not(target_pointer_width = "64"))]
compile_error!("comet-sync encodes the lock-word for 64-bit targets only");

// MarkWord is the single machine word of lock state that every synchronizable object
// carries in its header.
//
// Neutral (unlocked) layout:
//
// +-----------------+------+------------------------------------------+
// | name            | bits |                                          |
// +-----------------+------+------------------------------------------+
// | unused          |   25 |                                          |
// | hash            |   31 | Identity hash, 0 until installed.        |
// | unused          |    1 |                                          |
// | age             |    4 | Owned by the collector.                  |
// | unused          |    1 |                                          |
// | lock            |    2 | 01                                       |
// +-----------------+------+------------------------------------------+
//
// Other encodings replace everything above the lock bits with a pointer:
//
//   [lock record address    | 00]  stack-locked, header displaced into a BasicLock
//   [ObjectMonitor address  | 10]  inflated, header displaced into the monitor
//   [0 ...................... 00]  INFLATING, transient while a stack lock is inflated
//
// Notes:
// - Lock records and monitors are at least 8 byte aligned so the low bits are free.
// - INFLATING is never observed as a stack lock because no lock record lives at 0.
#[bitfield(bits = 64)]
#[derive(Clone, Copy)]
pub struct NeutralBits {
    lock: B2,
    #[skip]
    unused_low: B1,
    age: B4,
    #[skip]
    unused_mid: B1,
    hash: B31,
    #[skip]
    unused_high: B25,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct MarkWord(usize);

impl MarkWord {
    pub const LOCK_MASK: usize = 0b11;
    pub const LOCKED_VALUE: usize = 0b00;
    pub const UNLOCKED_VALUE: usize = 0b01;
    pub const MONITOR_VALUE: usize = 0b10;
    pub const MARKED_VALUE: usize = 0b11;

    pub const HASH_BITS: u32 = 31;
    pub const HASH_MASK: u32 = (1 << Self::HASH_BITS) - 1;

    /// Transient sentinel published while a stack lock is being inflated.
    pub const INFLATING: MarkWord = MarkWord(0);

    #[inline(always)]
    pub const fn from_raw(value: usize) -> Self {
        Self(value)
    }

    #[inline(always)]
    pub const fn value(self) -> usize {
        self.0
    }

    /// Neutral mark without hash and with age 0.
    #[inline(always)]
    pub const fn prototype() -> Self {
        Self(Self::UNLOCKED_VALUE)
    }

    #[inline(always)]
    fn bits(self) -> NeutralBits {
        NeutralBits::from_bytes((self.0 as u64).to_le_bytes())
    }

    #[inline(always)]
    fn from_bits(bits: NeutralBits) -> Self {
        Self(u64::from_le_bytes(bits.into_bytes()) as usize)
    }

    #[inline(always)]
    pub fn lock_bits(self) -> usize {
        self.bits().lock() as usize
    }

    #[inline(always)]
    pub fn is_neutral(self) -> bool {
        self.lock_bits() == Self::UNLOCKED_VALUE
    }

    #[inline(always)]
    pub fn is_being_inflated(self) -> bool {
        self.0 == 0
    }

    /// Stack-locked by some thread; the mark points at its lock record.
    #[inline(always)]
    pub fn has_locker(self) -> bool {
        self.lock_bits() == Self::LOCKED_VALUE && !self.is_being_inflated()
    }

    #[inline(always)]
    pub fn has_monitor(self) -> bool {
        self.lock_bits() == Self::MONITOR_VALUE
    }

    #[inline(always)]
    pub fn locker(self) -> *const BasicLock {
        debug_assert!(self.has_locker());
        self.0 as *const BasicLock
    }

    #[inline(always)]
    pub fn from_locker(lock: &BasicLock) -> Self {
        Self(lock as *const BasicLock as usize)
    }

    #[inline(always)]
    pub fn monitor(self) -> *mut ObjectMonitor {
        debug_assert!(self.has_monitor());
        (self.0 ^ Self::MONITOR_VALUE) as *mut ObjectMonitor
    }

    #[inline(always)]
    pub fn encode(monitor: *const ObjectMonitor) -> Self {
        let addr = monitor as usize;
        debug_assert_eq!(addr & Self::LOCK_MASK, 0);
        Self(addr | Self::MONITOR_VALUE)
    }

    /// Identity hash of a neutral mark, 0 if none is installed.
    #[inline(always)]
    pub fn hash(self) -> u32 {
        self.bits().hash()
    }

    #[inline(always)]
    pub fn copy_set_hash(self, hash: u32) -> Self {
        debug_assert!(self.is_neutral());
        Self::from_bits(self.bits().with_hash(hash & Self::HASH_MASK))
    }

    #[inline(always)]
    pub fn age(self) -> u8 {
        self.bits().age()
    }

    #[inline(always)]
    pub fn copy_set_age(self, age: u8) -> Self {
        debug_assert!(self.is_neutral());
        Self::from_bits(self.bits().with_age(age & 0xF))
    }
}

impl fmt::Debug for MarkWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_being_inflated() {
            write!(f, "MarkWord(INFLATING)")
        } else if self.has_monitor() {
            write!(f, "MarkWord(monitor {:p})", self.monitor())
        } else if self.has_locker() {
            write!(f, "MarkWord(stack-locked {:p})", self.locker())
        } else if self.is_neutral() {
            write!(
                f,
                "MarkWord(neutral hash={:#x} age={})",
                self.hash(),
                self.age()
            )
        } else {
            write!(f, "MarkWord({:#x})", self.0)
        }
    }
}

/// Object header seen by the monitor engine: one atomically updated lock-word.
///
/// The engine never owns objects. It only reads and CASes the lock-word and, while a
/// monitor is attached, keeps a weak back-reference to the header (see [crate::gcref::WeakSlot]).
#[repr(C)]
pub struct ObjectHeader {
    mark: AtomicUsize,
}

impl ObjectHeader {
    pub const fn new() -> Self {
        Self {
            mark: AtomicUsize::new(MarkWord::UNLOCKED_VALUE),
        }
    }

    pub const fn with_mark(mark: MarkWord) -> Self {
        Self {
            mark: AtomicUsize::new(mark.0),
        }
    }

    #[inline(always)]
    pub fn mark(&self) -> MarkWord {
        MarkWord(self.mark.load(Ordering::Acquire))
    }

    /// CAS the lock-word from `old` to `new`. Returns the witnessed value, equal to `old`
    /// on success.
    #[inline(always)]
    pub fn cas_set_mark(&self, new: MarkWord, old: MarkWord) -> MarkWord {
        match self
            .mark
            .compare_exchange(old.0, new.0, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(value) | Err(value) => MarkWord(value),
        }
    }

    #[inline(always)]
    pub fn release_set_mark(&self, mark: MarkWord) {
        self.mark.store(mark.0, Ordering::Release);
    }
}

impl Default for ObjectHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ObjectHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectHeader({:p}, {:?})", self, self.mark())
    }
}

/// Lock record for the stack-locking fast path.
///
/// While an object is stack-locked its lock-word points here and the original mark lives
/// in `displaced_header`. A zero displaced header marks a recursive stack lock. The record
/// must stay at the same address until the matching exit.
#[repr(C, align(8))]
pub struct BasicLock {
    displaced_header: AtomicUsize,
}

impl BasicLock {
    pub const fn new() -> Self {
        Self {
            displaced_header: AtomicUsize::new(0),
        }
    }

    #[inline(always)]
    pub fn displaced_header(&self) -> MarkWord {
        MarkWord(self.displaced_header.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn set_displaced_header(&self, mark: MarkWord) {
        self.displaced_header.store(mark.0, Ordering::Release);
    }

    #[inline(always)]
    pub(crate) fn address(&self) -> usize {
        self as *const Self as usize
    }
}

impl Default for BasicLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Displaced-header value used when the lock record was not used for a stack lock.
pub const UNUSED_MARK: MarkWord = MarkWord(MarkWord::MARKED_VALUE);
