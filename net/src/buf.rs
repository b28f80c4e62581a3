//! Buffer chains: discontiguous byte ranges over linked memory nodes.
//!
//! [`BufNode`] describes one physical buffer and an optional successor;
//! [`BufRef`] is a *reference* to a byte range within a chain — a node
//! pointer, an offset into that first node, and a total length.  A `BufRef`
//! never owns memory and operations on it never modify the nodes: they
//! either produce a new `BufRef` describing a different slice, or advance
//! the `BufRef` itself while consuming bytes.  The only operations that
//! write through to the underlying buffers are the explicit
//! [`give_bytes`](BufRef::give_bytes) / [`give_buf`](BufRef::give_buf) /
//! [`process_bytes`](BufRef::process_bytes) family.
//!
//! # Validity
//!
//! Except where noted, every operation requires the reference to be
//! *valid*: the node pointer is non-null, `offset <= node.len` (pointing
//! at the end is permitted), and the chain holds at least `tot_len` bytes
//! from that offset.  Callers construct `BufRef`s from nodes they keep
//! alive; a `BufRef` must not outlive the nodes or buffers it points into.
//! The stack is single-threaded (run-to-completion handlers), so no
//! concurrent mutation of referenced buffers occurs during an operation.
//!
//! # Eager advance
//!
//! Consuming operations move to the next node *eagerly*: when consumption
//! leaves the reference exactly at the end of the current node and a next
//! node exists, the reference advances to offset 0 of the next node.  With
//! ring-buffer nodes this keeps `offset` strictly below the node length,
//! which is what makes wrap handling trivial for ring producers.

use core::fmt;
use core::ptr;

// =============================================================================
// BufNode
// =============================================================================

/// Node in a chain of memory buffers: pointer, length, optional successor.
///
/// Topology is immutable while any `BufRef` references the node.
#[derive(Clone, Copy)]
pub struct BufNode {
    ptr: *mut u8,
    len: usize,
    next: *const BufNode,
}

impl BufNode {
    /// Node over a mutable buffer, no successor.
    #[inline]
    pub fn from_slice_mut(buf: &mut [u8]) -> Self {
        Self {
            ptr: buf.as_mut_ptr(),
            len: buf.len(),
            next: ptr::null(),
        }
    }

    /// Node over read-only memory, no successor.
    ///
    /// Write-through operations (`give_bytes` and friends) must never reach
    /// a node built this way.
    #[inline]
    pub fn from_slice(buf: &[u8]) -> Self {
        Self {
            ptr: buf.as_ptr() as *mut u8,
            len: buf.len(),
            next: ptr::null(),
        }
    }

    /// Attach a successor, consuming and returning the node.
    #[inline]
    pub fn with_next(mut self, next: &BufNode) -> Self {
        self.next = next;
        self
    }

    #[inline]
    pub fn set_next(&mut self, next: &BufNode) {
        self.next = next;
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Placeholder node for out-parameters; not valid to read through.
    #[inline]
    pub const fn empty() -> Self {
        Self {
            ptr: ptr::null_mut(),
            len: 0,
            next: ptr::null(),
        }
    }
}

impl Default for BufNode {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for BufNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BufNode {{ len={}, chained={} }}",
            self.len,
            !self.next.is_null()
        )
    }
}

// =============================================================================
// BufRef
// =============================================================================

/// Reference to a possibly discontiguous byte range in a buffer chain.
///
/// See the [module documentation](self) for the validity contract.
#[derive(Clone, Copy)]
pub struct BufRef {
    node: *const BufNode,
    offset: usize,
    tot_len: usize,
}

impl BufRef {
    /// Reference `tot_len` bytes starting `offset` into `node`'s chain.
    ///
    /// The chain must contain at least `tot_len` bytes past the offset for
    /// the reference to be valid.
    #[inline]
    pub fn new(node: &BufNode, offset: usize, tot_len: usize) -> Self {
        debug_assert!(offset <= node.len);
        Self {
            node,
            offset,
            tot_len,
        }
    }

    /// The empty reference.  Only `total_len` / `is_empty` are meaningful.
    #[inline]
    pub const fn empty() -> Self {
        Self {
            node: ptr::null(),
            offset: 0,
            tot_len: 0,
        }
    }

    /// Total length of the referenced range.  Valid on any reference.
    #[inline]
    pub const fn total_len(&self) -> usize {
        self.tot_len
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.tot_len == 0
    }

    /// Byte offset into the first node.
    #[inline]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    fn node(&self) -> &BufNode {
        debug_assert!(!self.node.is_null());
        // SAFETY: validity contract — the node outlives the reference.
        unsafe { &*self.node }
    }

    /// Length of the first contiguous chunk: `min(tot_len, node.len - offset)`.
    #[inline]
    pub fn chunk_len(&self) -> usize {
        let node = self.node();
        debug_assert!(self.offset <= node.len);
        self.tot_len.min(node.len - self.offset)
    }

    /// The first contiguous chunk of the range.
    #[inline]
    pub fn chunk(&self) -> &[u8] {
        let node = self.node();
        let len = self.chunk_len();
        // SAFETY: validity contract — node.ptr..node.ptr+node.len is live
        // memory and offset + len <= node.len.
        unsafe { core::slice::from_raw_parts(node.ptr.add(self.offset), len) }
    }

    /// Move to the next buffer in the range: drops the current chunk from
    /// `tot_len` and repositions at offset 0 of the successor.  Returns
    /// whether any data remains.
    pub fn next_chunk(&mut self) -> bool {
        let node = *self.node();
        self.tot_len -= self.chunk_len();
        self.node = node.next;
        self.offset = 0;
        let more = self.tot_len > 0;
        debug_assert!(!more || !self.node.is_null());
        more
    }

    // -------------------------------------------------------------------------
    // Header reveal / hide
    // -------------------------------------------------------------------------

    /// Extend the range backward by `amount` bytes within the first node.
    ///
    /// Fails (returns `None`) when fewer than `amount` bytes of room exist
    /// before `offset` in the first buffer.  Inverse of
    /// [`hide_header`](Self::hide_header).
    #[inline]
    pub fn reveal_header(&self, amount: usize) -> Option<BufRef> {
        if amount > self.offset {
            return None;
        }
        Some(BufRef {
            node: self.node,
            offset: self.offset - amount,
            tot_len: self.tot_len + amount,
        })
    }

    /// `true` if the first chunk holds at least `amount` contiguous bytes.
    #[inline]
    pub fn has_header(&self, amount: usize) -> bool {
        self.chunk_len() >= amount
    }

    /// Drop `amount` bytes from the front, staying within the first chunk.
    ///
    /// Requires `amount <= min(first chunk length, tot_len)`.
    #[inline]
    pub fn hide_header(&self, amount: usize) -> BufRef {
        let node = self.node();
        debug_assert!(self.offset <= node.len);
        debug_assert!(amount <= node.len - self.offset);
        debug_assert!(amount <= self.tot_len);
        BufRef {
            node: self.node,
            offset: self.offset + amount,
            tot_len: self.tot_len - amount,
        }
    }

    /// A node describing the first buffer with the offset applied:
    /// `{ptr + offset, len - offset, next}`.
    #[inline]
    pub fn to_node(&self) -> BufNode {
        let node = self.node();
        debug_assert!(self.offset <= node.len);
        BufNode {
            // SAFETY: offset <= node.len keeps the pointer in bounds.
            ptr: unsafe { node.ptr.add(self.offset) },
            len: node.len - self.offset,
            next: node.next,
        }
    }

    /// Build a range that takes `header_len` bytes from the first chunk of
    /// this range and continues into the chain `cont`, for a total of
    /// `total_len` bytes.
    ///
    /// Writes the splice node into `out_node`; the returned reference uses
    /// `out_node` as its first node and is valid only while `out_node`
    /// (and `cont`) stay alive and in place.  The offset is *not* applied
    /// to the splice node, so headers before it can still be revealed.
    pub fn sub_header_to_continued_by(
        &self,
        header_len: usize,
        cont: &BufNode,
        total_len: usize,
        out_node: &mut BufNode,
    ) -> BufRef {
        let node = self.node();
        debug_assert!(self.offset <= node.len);
        debug_assert!(header_len <= node.len - self.offset);
        debug_assert!(total_len >= header_len);
        *out_node = BufNode {
            ptr: node.ptr,
            len: self.offset + header_len,
            next: cont,
        };
        BufRef {
            node: out_node,
            offset: self.offset,
            tot_len: total_len,
        }
    }

    // -------------------------------------------------------------------------
    // Sub-ranges
    // -------------------------------------------------------------------------

    /// An initial part of this range, `new_tot_len <= tot_len`.
    #[inline]
    pub fn sub_to(&self, new_tot_len: usize) -> BufRef {
        debug_assert!(new_tot_len <= self.tot_len);
        BufRef {
            node: self.node,
            offset: self.offset,
            tot_len: new_tot_len,
        }
    }

    /// `len` bytes starting `from` bytes into this range; equivalent to
    /// skipping `from` bytes and then taking `len`.
    pub fn sub_from_to(&self, from: usize, len: usize) -> BufRef {
        let mut r = *self;
        r.skip_bytes(from);
        r.sub_to(len)
    }

    /// Extend the referenced range by `amount` bytes at the end.  The
    /// underlying chain must already contain them.
    #[inline]
    pub fn extend(&mut self, amount: usize) {
        self.tot_len += amount;
    }

    // -------------------------------------------------------------------------
    // Consuming operations
    // -------------------------------------------------------------------------

    /// Consume `amount` bytes from the front.
    pub fn skip_bytes(&mut self, amount: usize) {
        self.process_chunks(amount, |_, _| {});
    }

    /// Consume `amount` bytes while copying them into `dst[..amount]`.
    pub fn take_bytes(&mut self, amount: usize, dst: &mut [u8]) {
        debug_assert!(dst.len() >= amount);
        let mut at = 0;
        self.process_chunks(amount, |ptr, len| {
            // SAFETY: the chunk is live for `len` bytes per the validity
            // contract; `dst` cannot overlap a chain we are reading.
            let chunk = unsafe { core::slice::from_raw_parts(ptr, len) };
            dst[at..at + len].copy_from_slice(chunk);
            at += len;
        });
    }

    /// Consume `src.len()` bytes while writing `src` through into the
    /// consumed part of the range.  The chain must be over writable
    /// memory (built with [`BufNode::from_slice_mut`]).
    pub fn give_bytes(&mut self, src: &[u8]) {
        let mut at = 0;
        self.process_chunks(src.len(), |ptr, len| {
            // SAFETY: write-through contract — the caller owns the chain
            // memory mutably and holds no other references into it.
            let chunk = unsafe { core::slice::from_raw_parts_mut(ptr, len) };
            chunk.copy_from_slice(&src[at..at + len]);
            at += len;
        });
    }

    /// Consume `src.total_len()` bytes while copying the other range into
    /// the consumed part of this one (write-through, as `give_bytes`).
    pub fn give_buf(&mut self, mut src: BufRef) {
        self.process_chunks(src.total_len(), |ptr, len| {
            // SAFETY: as in give_bytes; src and destination chains never
            // alias (they belong to different layers).
            let chunk = unsafe { core::slice::from_raw_parts_mut(ptr, len) };
            src.take_bytes(len, chunk);
        });
    }

    /// Consume and return one byte.  Requires `tot_len > 0`.
    pub fn take_byte(&mut self) -> u8 {
        debug_assert!(self.tot_len > 0);
        let mut b = 0;
        self.process_chunks(1, |ptr, _| {
            // SAFETY: one live byte per the validity contract.
            b = unsafe { *ptr };
        });
        b
    }

    /// Consume `amount` bytes from the front, handing each contiguous
    /// chunk of the consumed part to `func` in order.  Zero-sized chunks
    /// are never passed.  The chain must be over writable memory.
    pub fn process_bytes(&mut self, amount: usize, mut func: impl FnMut(&mut [u8])) {
        self.process_chunks(amount, |ptr, len| {
            // SAFETY: write-through contract as in give_bytes.
            func(unsafe { core::slice::from_raw_parts_mut(ptr, len) });
        });
    }

    /// Core consuming walk: raw chunk pointers, eager node advance.
    fn process_chunks(&mut self, mut amount: usize, mut func: impl FnMut(*mut u8, usize)) {
        debug_assert!(!self.node.is_null() || amount == 0);
        debug_assert!(amount <= self.tot_len);
        if self.node.is_null() {
            return;
        }
        loop {
            let node = *self.node();
            debug_assert!(self.offset <= node.len);
            let rem_in_buf = node.len - self.offset;

            if rem_in_buf > 0 {
                if amount == 0 {
                    return;
                }
                let take = rem_in_buf.min(amount);
                // SAFETY: offset + take <= node.len keeps the pointer in
                // bounds.
                func(unsafe { node.ptr.add(self.offset) }, take);

                self.tot_len -= take;

                if take < rem_in_buf || node.next.is_null() {
                    self.offset += take;
                    debug_assert!(amount == take);
                    return;
                }
                amount -= take;
            } else if node.next.is_null() {
                debug_assert!(amount == 0);
                return;
            }

            self.node = node.next;
            self.offset = 0;
        }
    }
}

impl Default for BufRef {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for BufRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BufRef {{ offset={}, tot_len={} }}",
            self.offset, self.tot_len
        )
    }
}

// =============================================================================
// TxFrame
// =============================================================================

/// Stack-allocated TX staging buffer with reserved header room.
///
/// The transmit path stages computed headers (and small payloads) here,
/// leaving `headroom` bytes free in front so lower layers can reveal their
/// headers in place.  An optional continuation chain carries a user-owned
/// payload without copying.
pub struct TxFrame<const CAP: usize> {
    buf: [u8; CAP],
    headroom: usize,
    len: usize,
}

impl<const CAP: usize> TxFrame<CAP> {
    /// A frame with `len` staged bytes after `headroom` bytes of reserve.
    pub fn new(headroom: usize, len: usize) -> Self {
        debug_assert!(headroom + len <= CAP);
        Self {
            buf: [0; CAP],
            headroom,
            len,
        }
    }

    /// The staged region (after the headroom).
    #[inline]
    pub fn staged_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.headroom..self.headroom + self.len]
    }

    #[inline]
    pub fn staged(&self) -> &[u8] {
        &self.buf[self.headroom..self.headroom + self.len]
    }

    /// Build the reference for transmission.
    ///
    /// `out_node` receives the node describing this frame (optionally
    /// continued by `cont`, which contributes `cont_len` bytes); it must
    /// outlive the returned reference.  The reference is positioned after
    /// the headroom, so `reveal_header` can claim the reserve.
    pub fn buf_ref(&mut self, out_node: &mut BufNode, cont: Option<(&BufNode, usize)>) -> BufRef {
        let (next, cont_len) = match cont {
            Some((node, len)) => (node as *const BufNode, len),
            None => (ptr::null(), 0),
        };
        *out_node = BufNode {
            ptr: self.buf.as_mut_ptr(),
            len: self.headroom + self.len,
            next,
        };
        BufRef {
            node: out_node,
            offset: self.headroom,
            tot_len: self.len + cont_len,
        }
    }
}
