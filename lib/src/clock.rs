//! Monotonic tick clock contract.
//!
//! The stack is written against a 32-bit tick counter with a compile-time
//! subsecond divisor ([`TICKS_PER_SEC`]).  The counter wraps; because only
//! half of the 32-bit range can unambiguously represent "future", all
//! comparisons go through the wrapping helpers on [`Instant`] and consumers
//! (notably the timer queue) must be polled well within half a wrap period.
//!
//! Platform integrations implement [`Clock`].  [`ManualClock`] is the hosted
//! implementation used by the test suites and simulations: time advances
//! only when told to.

use core::cell::Cell;

/// Timer ticks per second.
///
/// 100 Hz (10 ms granularity) is enough for every protocol timer in the
/// stack; the coarsest consumer is the PMTU minute sweep and the finest is
/// the TCP retransmission timer whose minimum is well above one tick.
pub const TICKS_PER_SEC: u32 = 100;

/// Half of the tick range — the boundary between "future" and "past" for
/// wrapping comparisons.
pub const HALF_RANGE: u32 = 1 << 31;

/// Convert whole seconds to ticks.
#[inline]
pub const fn ticks_from_secs(secs: u32) -> u32 {
    secs * TICKS_PER_SEC
}

/// Convert milliseconds to ticks, rounding up so short timeouts never
/// become zero.
#[inline]
pub const fn ticks_from_ms(ms: u32) -> u32 {
    ms.div_ceil(1000 / TICKS_PER_SEC)
}

/// A point in time on the wrapping 32-bit tick counter.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Instant(pub u32);

impl Instant {
    /// The zero instant; a convenient origin for tests.
    pub const ZERO: Self = Self(0);

    /// `self + ticks`, wrapping.
    #[inline]
    pub const fn plus(self, ticks: u32) -> Self {
        Self(self.0.wrapping_add(ticks))
    }

    /// Ticks elapsed from `earlier` to `self`, assuming `earlier` is in the
    /// past half-range.
    #[inline]
    pub const fn since(self, earlier: Instant) -> u32 {
        self.0.wrapping_sub(earlier.0)
    }

    /// `true` if `self` is at or after `other`, interpreted relative to
    /// `reference` (which must not be after either operand by more than half
    /// the tick range).
    #[inline]
    pub const fn at_or_after(self, other: Instant, reference: Instant) -> bool {
        self.0.wrapping_sub(reference.0) >= other.0.wrapping_sub(reference.0)
    }
}

/// The clock contract: a monotonic tick counter.
///
/// Implementations must be monotonic modulo wrap.  The stack never calls
/// `now` from interrupt context.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// Manually advanced clock for tests and host-side simulation.
pub struct ManualClock {
    ticks: Cell<u32>,
}

impl ManualClock {
    pub const fn new(start: u32) -> Self {
        Self {
            ticks: Cell::new(start),
        }
    }

    /// Advance time by `ticks`.
    pub fn advance(&self, ticks: u32) {
        self.ticks.set(self.ticks.get().wrapping_add(ticks));
    }

    pub fn set(&self, ticks: u32) {
        self.ticks.set(ticks);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        Instant(self.ticks.get())
    }
}
