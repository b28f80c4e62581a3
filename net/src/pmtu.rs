//! Path-MTU cache: per-destination MTU estimates with reference counting
//! and minute-granularity aging.
//!
//! Entries live in a fixed arena.  A sender (typically a TCP connection)
//! holds an [`MtuRef`] — an index into the arena acting as a counted weak
//! reference.  Entries move between three states:
//!
//! - `Invalid`: not indexed, on the free list (head region — reused first).
//! - `Referenced`: indexed, holder count in `num_refs`, not on the free
//!   list.
//! - `Unused`: still indexed (the estimate stays useful), on the free-list
//!   tail so it is reused last.
//!
//! A minute sweep ages every non-Invalid entry.  At
//! [`MTU_TIMEOUT_MINUTES`](crate::config::MTU_TIMEOUT_MINUTES) an Unused
//! entry is invalidated; a Referenced entry has its estimate reset to the
//! interface MTU (keeping the old estimate if the route vanished) and its
//! age set to 1 — not 0 — so the next reset lands after exactly one full
//! period.
//!
//! ICMP "fragmentation needed" reports clamp to
//! [`MIN_MTU`](crate::config::MIN_MTU) from below and are ignored unless
//! they lower the estimate; only a lowering resets the entry age.  The
//! caller that holds the matching flow reacts immediately (retransmit with
//! a smaller MSS); other holders of the same entry observe the new value
//! on their next [`get_pmtu`](MtuRef::get_pmtu).

use log::{debug, trace};

use crate::config::{MIN_MTU, MTU_TIMEOUT_MINUTES, NUM_MTU_ENTRIES};
use crate::ipv4::{IfaceConfig, route};
use crate::types::{Ipv4Addr, NetError};

const NONE: u8 = u8::MAX;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum MtuState {
    Invalid,
    Referenced,
    Unused,
}

#[derive(Clone, Copy)]
struct MtuEntry {
    state: MtuState,
    /// Holder count; meaningful only in the Referenced state.
    num_refs: u16,
    /// Free-list link; meaningful only off the Referenced state.
    next_free: u8,
    mtu: u16,
    minutes_old: u8,
    remote_addr: Ipv4Addr,
}

// =============================================================================
// PmtuCache
// =============================================================================

pub struct PmtuCache {
    entries: [MtuEntry; NUM_MTU_ENTRIES],
    free_head: u8,
    free_tail: u8,
}

impl PmtuCache {
    pub fn new() -> Self {
        let mut entries = [MtuEntry {
            state: MtuState::Invalid,
            num_refs: 0,
            next_free: NONE,
            mtu: 0,
            minutes_old: 0,
            remote_addr: Ipv4Addr::UNSPECIFIED,
        }; NUM_MTU_ENTRIES];
        for (i, e) in entries.iter_mut().enumerate() {
            e.next_free = if i + 1 < NUM_MTU_ENTRIES {
                (i + 1) as u8
            } else {
                NONE
            };
        }
        Self {
            entries,
            free_head: 0,
            free_tail: (NUM_MTU_ENTRIES - 1) as u8,
        }
    }

    /// Index lookup by remote address over the non-Invalid entries.
    fn find(&self, remote: Ipv4Addr) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.state != MtuState::Invalid && e.remote_addr == remote)
    }

    fn free_list_pop_head(&mut self) -> Option<usize> {
        let idx = self.free_head;
        if idx == NONE {
            return None;
        }
        self.free_head = self.entries[idx as usize].next_free;
        if self.free_head == NONE {
            self.free_tail = NONE;
        }
        self.entries[idx as usize].next_free = NONE;
        Some(idx as usize)
    }

    fn free_list_append_tail(&mut self, idx: usize) {
        self.entries[idx].next_free = NONE;
        if self.free_tail == NONE {
            self.free_head = idx as u8;
        } else {
            self.entries[self.free_tail as usize].next_free = idx as u8;
        }
        self.free_tail = idx as u8;
    }

    fn free_list_prepend_head(&mut self, idx: usize) {
        self.entries[idx].next_free = self.free_head;
        self.free_head = idx as u8;
        if self.free_tail == NONE {
            self.free_tail = idx as u8;
        }
    }

    /// Unlink an arbitrary entry from the free list (O(n) scan; the list
    /// is small).
    fn free_list_remove(&mut self, idx: usize) {
        let target = idx as u8;
        if self.free_head == target {
            self.free_list_pop_head();
            return;
        }
        let mut cur = self.free_head;
        while cur != NONE {
            let next = self.entries[cur as usize].next_free;
            if next == target {
                self.entries[cur as usize].next_free = self.entries[idx].next_free;
                if self.free_tail == target {
                    self.free_tail = cur;
                }
                self.entries[idx].next_free = NONE;
                return;
            }
            cur = next;
        }
        debug_assert!(false, "entry not on free list");
    }

    fn assert_referenced(&self, idx: usize) {
        let e = &self.entries[idx];
        debug_assert!(e.state == MtuState::Referenced);
        debug_assert!(e.num_refs > 0);
        debug_assert!(e.mtu >= MIN_MTU);
    }

    // =========================================================================
    // Minute sweep
    // =========================================================================

    /// Per-minute aging pass over all non-Invalid entries.
    pub fn on_minute_tick(&mut self, iface: &IfaceConfig, iface_mtu: u16) {
        for idx in 0..NUM_MTU_ENTRIES {
            match self.entries[idx].state {
                MtuState::Invalid => {}
                state => {
                    debug_assert!(self.entries[idx].minutes_old <= MTU_TIMEOUT_MINUTES);
                    if self.entries[idx].minutes_old < MTU_TIMEOUT_MINUTES {
                        self.entries[idx].minutes_old += 1;
                        continue;
                    }
                    if state == MtuState::Unused {
                        // Expired and unreferenced: invalidate, make the slot
                        // the first to be reused.
                        trace!("pmtu: expiring entry for {}", self.entries[idx].remote_addr);
                        self.entries[idx].state = MtuState::Invalid;
                        self.free_list_remove(idx);
                        self.free_list_prepend_head(idx);
                        continue;
                    }
                    // Referenced: reset the estimate to the interface MTU,
                    // keeping the old estimate if the route disappeared.
                    if route(iface, self.entries[idx].remote_addr).is_some() {
                        self.entries[idx].mtu = iface_mtu;
                    }
                    // 1, not 0: the next reset happens after exactly one
                    // full period.
                    self.entries[idx].minutes_old = 1;
                    self.assert_referenced(idx);
                }
            }
        }
    }

    /// Number of non-Invalid entries (diagnostics).
    pub fn entry_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.state != MtuState::Invalid)
            .count()
    }
}

impl Default for PmtuCache {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// MtuRef
// =============================================================================

/// Counted handle to a PMTU entry, owned by a sender.
///
/// Must be [`reset`](Self::reset) before being dropped; the handle cannot
/// reach the cache from `Drop`.
pub struct MtuRef {
    entry_idx: u8,
}

impl MtuRef {
    pub const fn new() -> Self {
        Self { entry_idx: NONE }
    }

    #[inline]
    pub const fn is_setup(&self) -> bool {
        self.entry_idx != NONE
    }

    /// Attach to (or create) the entry for `remote`.
    ///
    /// Errors: [`NetError::RefCountSaturated`] when the entry's holder
    /// count is at the maximum, [`NetError::NoHwRoute`] when a new entry
    /// cannot be routed, [`NetError::OutOfResources`] when the arena has
    /// no free entry.
    pub fn setup(
        &mut self,
        cache: &mut PmtuCache,
        remote: Ipv4Addr,
        iface: &IfaceConfig,
        iface_mtu: u16,
    ) -> Result<(), NetError> {
        debug_assert!(!self.is_setup());

        if let Some(idx) = cache.find(remote) {
            let e = &mut cache.entries[idx];
            if e.state == MtuState::Referenced {
                if e.num_refs == u16::MAX {
                    return Err(NetError::RefCountSaturated);
                }
                e.num_refs += 1;
            } else {
                debug_assert!(e.state == MtuState::Unused);
                cache.free_list_remove(idx);
                let e = &mut cache.entries[idx];
                e.state = MtuState::Referenced;
                e.num_refs = 1;
            }
            self.entry_idx = idx as u8;
            cache.assert_referenced(idx);
            return Ok(());
        }

        // Miss: consult routing, then claim the free-list head.
        if route(iface, remote).is_none() {
            return Err(NetError::NoHwRoute);
        }
        let idx = cache.free_list_pop_head().ok_or(NetError::OutOfResources)?;
        {
            let e = &mut cache.entries[idx];
            debug_assert!(e.state != MtuState::Referenced);
            debug_assert!(e.state == MtuState::Invalid || e.remote_addr != remote);
            e.state = MtuState::Referenced;
            e.num_refs = 1;
            e.remote_addr = remote;
            e.mtu = iface_mtu.max(MIN_MTU);
            e.minutes_old = 0;
        }
        debug!("pmtu: new entry for {} at {}", remote, iface_mtu);
        self.entry_idx = idx as u8;
        cache.assert_referenced(idx);
        Ok(())
    }

    /// Drop the reference.  The last holder moves the entry to Unused (the
    /// estimate stays indexed until it ages out).
    pub fn reset(&mut self, cache: &mut PmtuCache) {
        if self.entry_idx == NONE {
            return;
        }
        let idx = self.entry_idx as usize;
        cache.assert_referenced(idx);
        let e = &mut cache.entries[idx];
        if e.num_refs > 1 {
            e.num_refs -= 1;
        } else {
            e.state = MtuState::Unused;
            cache.free_list_append_tail(idx);
        }
        self.entry_idx = NONE;
    }

    /// Current path MTU of the referenced entry.
    pub fn get_pmtu(&self, cache: &PmtuCache) -> u16 {
        debug_assert!(self.is_setup());
        let idx = self.entry_idx as usize;
        cache.assert_referenced(idx);
        cache.entries[idx].mtu
    }

    /// Apply an ICMP "fragmentation needed" report carrying `mtu_info`
    /// (0 when the router did not fill in the next-hop MTU).
    ///
    /// Returns whether the PMTU dropped; only then should the caller adapt
    /// in-flight state.  A non-lowering report changes nothing, not even
    /// the entry age.
    pub fn handle_icmp_packet_too_big(&self, cache: &mut PmtuCache, mtu_info: u16) -> bool {
        debug_assert!(self.is_setup());
        let idx = self.entry_idx as usize;
        cache.assert_referenced(idx);
        let e = &mut cache.entries[idx];

        let bump_mtu = MIN_MTU.max(mtu_info);
        if bump_mtu >= e.mtu {
            return false;
        }
        debug!(
            "pmtu: {} lowered {} -> {}",
            e.remote_addr, e.mtu, bump_mtu
        );
        e.mtu = bump_mtu;
        e.minutes_old = 0;
        true
    }
}

impl Default for MtuRef {
    fn default() -> Self {
        Self::new()
    }
}
