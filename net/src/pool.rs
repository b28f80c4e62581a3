//! Fixed frame pool and the driver → stack receive handoff.
//!
//! The pool backs the driver receive ring: an interrupt handler copies a
//! frame out of DMA memory into a pool slot, pushes the slot onto the
//! [`RxRing`], and triggers a fast event.  The main loop pops slots, wraps
//! them in a [`BufNode`]/[`BufRef`] and feeds the stack, after which the
//! [`FrameBuf`] drop returns the slot.  The stack never blocks the driver:
//! when the ring is full the frame is dropped and the overrun counter
//! incremented.
//!
//! Allocation and release are lock-free (a Treiber stack over slot indices
//! with a version-tagged head to defeat ABA), so they are safe from
//! interrupt context.  Only the handoff ring takes a lock, and only for a
//! few word moves.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use spin::Mutex;

use crate::buf::BufNode;

/// Size of each pool slot in bytes.  Covers a maximum Ethernet frame.
pub const FRAME_BUF_SIZE: usize = 1536;

/// Number of pre-allocated slots.
pub const FRAME_POOL_SIZE: usize = 32;

/// Capacity of the rx handoff ring.
pub const RX_RING_SIZE: usize = 16;

/// Sentinel: end of freelist / pool exhausted.
const FREELIST_EMPTY: u16 = u16::MAX;

// =============================================================================
// Storage
// =============================================================================

#[repr(C, align(64))]
struct PoolStorage {
    slots: UnsafeCell<[[u8; FRAME_BUF_SIZE]; FRAME_POOL_SIZE]>,
}

// SAFETY: slot access is serialized by the pool ownership model — a slot is
// touched only by the holder of its FrameBuf, which is move-only.
unsafe impl Sync for PoolStorage {}

static POOL_STORAGE: PoolStorage = PoolStorage {
    slots: UnsafeCell::new([[0; FRAME_BUF_SIZE]; FRAME_POOL_SIZE]),
};

// =============================================================================
// FramePool
// =============================================================================

/// Lock-free fixed pool of frame buffers.
///
/// The head word packs `(version << 16) | slot_index`; the version counter
/// makes the compare-exchange ABA-safe.
pub struct FramePool {
    head: AtomicU32,
    next: [AtomicU32; FRAME_POOL_SIZE],
    free_count: AtomicUsize,
    init_state: AtomicU32,
}

/// The global frame pool.  Lazily initialized on first allocation.
pub static FRAME_POOL: FramePool = FramePool::new();

const INIT_NONE: u32 = 0;
const INIT_RUNNING: u32 = 1;
const INIT_DONE: u32 = 2;

impl FramePool {
    const fn new() -> Self {
        Self {
            head: AtomicU32::new(FREELIST_EMPTY as u32),
            next: [const { AtomicU32::new(0) }; FRAME_POOL_SIZE],
            free_count: AtomicUsize::new(0),
            init_state: AtomicU32::new(INIT_NONE),
        }
    }

    /// Build the freelist.  First caller does the work; concurrent callers
    /// spin until publication.
    fn init(&self) {
        match self.init_state.compare_exchange(
            INIT_NONE,
            INIT_RUNNING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                for i in 0..FRAME_POOL_SIZE {
                    let next = if i + 1 < FRAME_POOL_SIZE {
                        (i + 1) as u32
                    } else {
                        FREELIST_EMPTY as u32
                    };
                    self.next[i].store(next, Ordering::Relaxed);
                }
                self.free_count.store(FRAME_POOL_SIZE, Ordering::Relaxed);
                // Publish: version 1, head slot 0.
                self.head.store(1 << 16, Ordering::Release);
                self.init_state.store(INIT_DONE, Ordering::Release);
            }
            Err(state) => {
                if state == INIT_RUNNING {
                    while self.init_state.load(Ordering::Acquire) != INIT_DONE {
                        core::hint::spin_loop();
                    }
                }
            }
        }
    }

    /// Allocate a slot.  O(1), lock-free, safe from interrupt context.
    pub fn alloc(&self) -> Option<FrameBuf> {
        self.init();
        loop {
            let old = self.head.load(Ordering::Acquire);
            let idx = (old & 0xFFFF) as u16;
            if idx == FREELIST_EMPTY {
                return None;
            }
            let ver = old >> 16;
            let next_idx = self.next[idx as usize].load(Ordering::Relaxed);
            let new = (ver.wrapping_add(1) << 16) | (next_idx & 0xFFFF);
            if self
                .head
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.free_count.fetch_sub(1, Ordering::Relaxed);
                return Some(FrameBuf { slot: idx, len: 0 });
            }
            core::hint::spin_loop();
        }
    }

    fn release(&self, slot: u16) {
        debug_assert!((slot as usize) < FRAME_POOL_SIZE);
        loop {
            let old = self.head.load(Ordering::Acquire);
            let ver = old >> 16;
            self.next[slot as usize].store(old & 0xFFFF, Ordering::Relaxed);
            let new = (ver.wrapping_add(1) << 16) | (slot as u32);
            if self
                .head
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.free_count.fetch_add(1, Ordering::Relaxed);
                return;
            }
            core::hint::spin_loop();
        }
    }

    /// Free slots remaining (racy snapshot, diagnostics only).
    pub fn available(&self) -> usize {
        self.free_count.load(Ordering::Relaxed)
    }

    #[inline]
    fn slot_ptr(&self, slot: u16) -> *mut u8 {
        debug_assert!((slot as usize) < FRAME_POOL_SIZE);
        // SAFETY: in-bounds by the assert; exclusivity by slot ownership.
        unsafe { (POOL_STORAGE.slots.get() as *mut u8).add(slot as usize * FRAME_BUF_SIZE) }
    }
}

// =============================================================================
// FrameBuf
// =============================================================================

/// An owned pool slot holding one received frame.
///
/// Move-only; dropping returns the slot to the pool.
pub struct FrameBuf {
    slot: u16,
    len: usize,
}

impl FrameBuf {
    /// Copy frame bytes in and record the frame length.
    ///
    /// Returns `false` (leaving the buffer empty) if `data` exceeds the
    /// slot size.
    pub fn fill(&mut self, data: &[u8]) -> bool {
        if data.len() > FRAME_BUF_SIZE {
            return false;
        }
        self.bytes_mut()[..data.len()].copy_from_slice(data);
        self.len = data.len();
        true
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The frame contents.
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: we own the slot exclusively (move-only, no Clone).
        unsafe { core::slice::from_raw_parts(FRAME_POOL.slot_ptr(self.slot), self.len) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, plus &mut self.
        unsafe { core::slice::from_raw_parts_mut(FRAME_POOL.slot_ptr(self.slot), FRAME_BUF_SIZE) }
    }

    /// A single-node chain over the frame contents.
    pub fn node(&self) -> BufNode {
        BufNode::from_slice(self.bytes())
    }
}

impl Drop for FrameBuf {
    fn drop(&mut self) {
        FRAME_POOL.release(self.slot);
    }
}

// =============================================================================
// RxRing
// =============================================================================

/// Handoff ring between the driver (producer, possibly interrupt context)
/// and the main loop (consumer).
///
/// Fixed capacity; pushing into a full ring drops the frame and counts an
/// overrun.  The lock is held only to move a couple of words.
pub struct RxRing {
    inner: Mutex<RxRingInner>,
    overruns: AtomicUsize,
}

struct RxRingInner {
    entries: [Option<FrameBuf>; RX_RING_SIZE],
    head: usize,
    len: usize,
}

impl RxRing {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RxRingInner {
                entries: [const { None }; RX_RING_SIZE],
                head: 0,
                len: 0,
            }),
            overruns: AtomicUsize::new(0),
        }
    }

    /// Push a received frame.  Returns `false` on overrun (frame dropped,
    /// slot recycled via the FrameBuf drop).
    pub fn push(&self, frame: FrameBuf) -> bool {
        let mut inner = self.inner.lock();
        if inner.len == RX_RING_SIZE {
            drop(inner);
            self.overruns.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let tail = (inner.head + inner.len) % RX_RING_SIZE;
        inner.entries[tail] = Some(frame);
        inner.len += 1;
        true
    }

    /// Pop the oldest pending frame.
    pub fn pop(&self) -> Option<FrameBuf> {
        let mut inner = self.inner.lock();
        if inner.len == 0 {
            return None;
        }
        let head = inner.head;
        let frame = inner.entries[head].take();
        inner.head = (head + 1) % RX_RING_SIZE;
        inner.len -= 1;
        frame
    }

    /// Frames dropped because the ring was full.
    pub fn overrun_count(&self) -> usize {
        self.overruns.load(Ordering::Relaxed)
    }
}

impl Default for RxRing {
    fn default() -> Self {
        Self::new()
    }
}
