//! Fixed-capacity timer queue with typed dispatch and reference rebasing.
//!
//! All protocol timers (ARP aging sweep, PMTU minute sweep, reassembly
//! sweep, per-connection TCP timers, listen-queue aging) go through one
//! queue.  There are no bare function-pointer callbacks: a timer carries a
//! caller-defined `kind` discriminant plus a `u32` key identifying the
//! resource, and the owner matches on the kind when an expiry is popped.
//! The subsystem receiving an expiry must validate that the key still
//! refers to a live resource — the resource may have been freed between
//! arming and firing.
//!
//! # Wrap handling
//!
//! Deadlines live on the wrapping 32-bit tick counter, so only half of the
//! range can unambiguously mean "future".  The queue keeps a `reference`
//! instant with the invariant that every armed deadline lies within the
//! half-range ahead of it.  Whenever a poll finds nothing left to fire, the
//! reference is rebased to "now" (every remaining deadline is in the future
//! at that point, so the invariant is preserved).  Callers must poll at
//! least once per half wrap period; at 100 Hz that is roughly 124 days.
//!
//! # Ordering
//!
//! [`pop_expired`](TimerQueue::pop_expired) always returns the earliest
//! expired entry, so repeated popping dispatches expirations in
//! non-decreasing deadline order.  Entries sharing a deadline fire in an
//! unspecified order, each at most once per poll.

use crate::clock::{HALF_RANGE, Instant};

#[derive(Clone, Copy)]
struct TimerSlot<K: Copy> {
    deadline: Instant,
    kind: K,
    key: u32,
    armed: bool,
}

/// Fixed-capacity timer queue.  `K` is the caller's timer-kind enum; `N`
/// bounds the number of concurrently armed timers.
pub struct TimerQueue<K: Copy + Eq, const N: usize> {
    slots: [Option<TimerSlot<K>>; N],
    reference: Instant,
}

impl<K: Copy + Eq, const N: usize> TimerQueue<K, N> {
    pub const fn new() -> Self {
        Self {
            slots: [None; N],
            reference: Instant::ZERO,
        }
    }

    /// Arm (or re-arm) the timer identified by `(kind, key)` to fire
    /// `delay` ticks after `now`.
    ///
    /// A timer is identified by its `(kind, key)` pair: arming an already
    /// armed pair moves its deadline.  `delay` must be below half the tick
    /// range.  Returns `false` if the queue is full.
    pub fn arm(&mut self, now: Instant, delay: u32, kind: K, key: u32) -> bool {
        debug_assert!(delay < HALF_RANGE);
        let deadline = now.plus(delay);
        let mut free = None;
        for (i, slot) in self.slots.iter_mut().enumerate() {
            match slot {
                Some(s) if s.armed && s.kind == kind && s.key == key => {
                    s.deadline = deadline;
                    return true;
                }
                Some(s) if !s.armed => free = Some(i),
                None => free = Some(i),
                _ => {}
            }
        }
        let Some(i) = free else {
            return false;
        };
        self.slots[i] = Some(TimerSlot {
            deadline,
            kind,
            key,
            armed: true,
        });
        true
    }

    /// Disarm the timer identified by `(kind, key)`.  Idempotent: disarming
    /// an unarmed or unknown timer is a no-op.
    pub fn disarm(&mut self, kind: K, key: u32) {
        for slot in self.slots.iter_mut() {
            if let Some(s) = slot
                && s.armed
                && s.kind == kind
                && s.key == key
            {
                *slot = None;
                return;
            }
        }
    }

    /// `true` if `(kind, key)` is currently armed.
    pub fn is_armed(&self, kind: K, key: u32) -> bool {
        self.slots
            .iter()
            .flatten()
            .any(|s| s.armed && s.kind == kind && s.key == key)
    }

    /// Pop the earliest entry whose deadline is at or before `now`,
    /// disarming it.  Returns `None` when nothing is due; in that case the
    /// reference is rebased to `now`.
    pub fn pop_expired(&mut self, now: Instant) -> Option<(K, u32)> {
        let reference = self.reference;
        let now_rel = now.since(reference);
        let mut best: Option<(usize, u32)> = None;
        for (i, slot) in self.slots.iter().enumerate() {
            let Some(s) = slot else { continue };
            if !s.armed {
                continue;
            }
            let dl_rel = s.deadline.since(reference);
            if dl_rel <= now_rel && best.is_none_or(|(_, b)| dl_rel < b) {
                best = Some((i, dl_rel));
            }
        }
        match best {
            Some((i, _)) => {
                let s = self.slots[i].take();
                s.map(|s| (s.kind, s.key))
            }
            None => {
                // Nothing due: every armed deadline is in the future, so the
                // reference can safely move to now.
                self.reference = now;
                None
            }
        }
    }

    /// Ticks from `now` until the next armed deadline (zero if already
    /// due), or `None` if the queue is empty.
    pub fn ticks_to_next(&self, now: Instant) -> Option<u32> {
        let reference = self.reference;
        let now_rel = now.since(reference);
        self.slots
            .iter()
            .flatten()
            .filter(|s| s.armed)
            .map(|s| s.deadline.since(reference).saturating_sub(now_rel))
            .min()
    }

    /// Number of armed timers.
    pub fn armed_count(&self) -> usize {
        self.slots.iter().flatten().filter(|s| s.armed).count()
    }
}

impl<K: Copy + Eq, const N: usize> Default for TimerQueue<K, N> {
    fn default() -> Self {
        Self::new()
    }
}
