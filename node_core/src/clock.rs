//! Monotonic time source. The event loop and every periodic entity read time through a
//! [`Clock`] rather than the OS directly, so tests can drive scheduling deterministically with
//! [`VirtualClock`] instead of sleeping.

use std::cell::Cell;
use std::time::Instant;

pub trait Clock {
    /// Microseconds since an arbitrary, fixed epoch. Only differences between two calls are
    /// meaningful - the absolute value carries no significance.
    fn now_micros(&self) -> u64;
}

/// Wall/monotonic clock backed by `std::time::Instant`.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> SystemClock {
        SystemClock { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        SystemClock::new()
    }
}

impl Clock for SystemClock {
    #[inline]
    fn now_micros(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

/// Test double that only advances when told to. Never reads the real clock.
pub struct VirtualClock {
    now: Cell<u64>,
}

impl VirtualClock {
    pub fn new() -> VirtualClock {
        VirtualClock { now: Cell::new(0) }
    }

    pub fn advance(&self, micros: u64) {
        self.now.set(self.now.get() + micros);
    }

    pub fn set(&self, micros: u64) {
        self.now.set(micros);
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        VirtualClock::new()
    }
}

impl Clock for VirtualClock {
    #[inline]
    fn now_micros(&self) -> u64 {
        self.now.get()
    }
}
