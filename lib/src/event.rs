//! Fast events: single-bit latches crossing the ISR → main loop boundary.
//!
//! A driver interrupt handler cannot touch protocol state; it sets a fast
//! event bit and returns.  The cooperative main loop drains triggered bits
//! round-robin and dispatches each on the main thread.  Triggering is a
//! single atomic OR, so it is safe from any context; draining clears the
//! bit before dispatch so a re-trigger during handling is not lost.

use core::sync::atomic::{AtomicU32, Ordering};

/// Maximum number of distinct fast events per set.
pub const MAX_FAST_EVENTS: usize = 32;

/// A set of up to 32 one-bit event latches.
///
/// Round-robin fairness: successive [`take_next`](Self::take_next) calls
/// resume scanning after the last dispatched bit, so a constantly
/// re-triggering event cannot starve the others.
pub struct FastEventSet {
    bits: AtomicU32,
    cursor: AtomicU32,
}

impl FastEventSet {
    pub const fn new() -> Self {
        Self {
            bits: AtomicU32::new(0),
            cursor: AtomicU32::new(0),
        }
    }

    /// Latch event `index`.  Safe from interrupt context; idempotent while
    /// the event is pending.
    #[inline]
    pub fn trigger(&self, index: usize) {
        debug_assert!(index < MAX_FAST_EVENTS);
        self.bits.fetch_or(1 << index, Ordering::Release);
    }

    /// `true` if any event is pending.
    #[inline]
    pub fn any_pending(&self) -> bool {
        self.bits.load(Ordering::Acquire) != 0
    }

    /// Take the next pending event in round-robin order, clearing its
    /// latch.  Returns `None` when no event is pending.
    pub fn take_next(&self) -> Option<usize> {
        let snapshot = self.bits.load(Ordering::Acquire);
        if snapshot == 0 {
            return None;
        }
        let start = self.cursor.load(Ordering::Relaxed) as usize;
        for i in 0..MAX_FAST_EVENTS {
            let idx = (start + i) % MAX_FAST_EVENTS;
            let mask = 1u32 << idx;
            if snapshot & mask != 0 {
                let prev = self.bits.fetch_and(!mask, Ordering::AcqRel);
                if prev & mask != 0 {
                    self.cursor
                        .store((idx as u32 + 1) % MAX_FAST_EVENTS as u32, Ordering::Relaxed);
                    return Some(idx);
                }
            }
        }
        None
    }
}

impl Default for FastEventSet {
    fn default() -> Self {
        Self::new()
    }
}
