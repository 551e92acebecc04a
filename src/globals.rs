/// Number of shard locks used to wait out long inflations. Must be a power of two.
pub const NINFLATION_LOCKS: usize = 256;
/// Spins on an `INFLATING` mark before falling back to yield/park.
pub const INFLATION_SPIN_LIMIT: usize = 10_000;
/// Yields under a shard lock before the waiter starts parking for 1ms at a time.
pub const INFLATION_YIELDS_BEFORE_PARK: usize = 16;

/// Mask applied to the spin counter; a pending pause is checked whenever `ctr & mask == 0`.
pub const SPIN_PAUSE_CHECK_MASK: i32 = 0xFF;

/// Initial timed park of the responsible thread, in milliseconds. Multiplied by
/// [RECHECK_INTERVAL_FACTOR] after every futile wakeup.
pub const INITIAL_RECHECK_INTERVAL: u64 = 1;
pub const RECHECK_INTERVAL_FACTOR: u64 = 8;

/// Lower bound accepted for `Config::monitor_deflation_max`.
pub const MIN_MONITOR_DEFLATION_MAX: usize = 1024;

/// Value installed as identity hash when the generator produced zero.
pub const ZERO_HASH_SUBSTITUTE: u32 = 0xBAD;

// Marsaglia xor-shift seeds. `x` is seeded per thread.
pub const HASH_STATE_Y: u32 = 842_502_087;
pub const HASH_STATE_Z: u32 = 0x8767;
pub const HASH_STATE_W: u32 = 273_326_509;
