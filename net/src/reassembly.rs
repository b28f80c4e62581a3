//! IPv4 fragment reassembly with hole-descriptor tracking and aging.
//!
//! A fixed pool of contexts, one per in-progress datagram, keyed by
//! `(src, dst, protocol, ident)`.  Fragment payloads are copied into the
//! context buffer at `offset * 8`; the missing byte ranges are tracked as
//! an explicit hole list (RFC 815 style).  The final fragment (MF clear)
//! closes the right boundary.  When the hole list empties and the total
//! length is known, the reassembled payload is handed to the dispatcher.
//!
//! When the pool is full, the oldest incomplete context is dropped in
//! favour of the new datagram.  A one-second sweep decrements each
//! context's remaining lifetime; an expiry drops the context and — if the
//! offset-0 fragment had arrived, providing the header to quote — reports
//! it so the stack can originate an ICMP time-exceeded message.

use log::{debug, trace};

use crate::buf::BufRef;
use crate::config::{MAX_REASM_SIZE, NUM_REASM_CONTEXTS, NUM_REASM_HOLES, REASM_TIMEOUT_SECS};
use crate::ipv4::Ipv4Header;
use crate::types::Ipv4Addr;

/// Right edge of the tail hole before the total length is known.
const HOLE_INF: u16 = u16::MAX;

/// Bytes of the offending datagram quoted in an ICMP error: IP header
/// (no options in practice) plus 8 payload bytes.
pub const QUOTE_MAX: usize = 60 + 8;

// =============================================================================
// Context structures
// =============================================================================

/// Datagram identity: one reassembly context per distinct key.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct FragKey {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: u8,
    pub ident: u16,
}

/// A missing byte range `[first, last)` of the datagram payload.
#[derive(Clone, Copy, Debug)]
struct Hole {
    first: u16,
    last: u16,
}

struct FragContext {
    active: bool,
    key: FragKey,
    holes: [Hole; NUM_REASM_HOLES],
    num_holes: u8,
    /// Seconds of lifetime left.
    ttl: u8,
    /// Payload length, known once the MF=0 fragment arrives.
    total_len: Option<u16>,
    /// Allocation order, for oldest-first eviction.
    age_seq: u32,
    /// Whether the offset-0 fragment arrived (needed to quote the header
    /// in a time-exceeded error).
    first_frag_seen: bool,
    quote: [u8; QUOTE_MAX],
    quote_len: u8,
    data: [u8; MAX_REASM_SIZE],
}

impl FragContext {
    const fn new() -> Self {
        Self {
            active: false,
            key: FragKey {
                src: Ipv4Addr::UNSPECIFIED,
                dst: Ipv4Addr::UNSPECIFIED,
                protocol: 0,
                ident: 0,
            },
            holes: [Hole { first: 0, last: 0 }; NUM_REASM_HOLES],
            num_holes: 0,
            ttl: 0,
            total_len: None,
            age_seq: 0,
            first_frag_seen: false,
            quote: [0; QUOTE_MAX],
            quote_len: 0,
            data: [0; MAX_REASM_SIZE],
        }
    }
}

/// Expired-context report for ICMP time-exceeded origination.
#[derive(Clone, Copy)]
pub struct ReasmExpiry {
    /// Source of the offending datagram (destination of the ICMP error).
    pub src: Ipv4Addr,
    pub quote: [u8; QUOTE_MAX],
    pub quote_len: u8,
}

// =============================================================================
// IpReassembly
// =============================================================================

pub struct IpReassembly {
    contexts: [FragContext; NUM_REASM_CONTEXTS],
    next_age_seq: u32,
}

impl IpReassembly {
    pub fn new() -> Self {
        Self {
            contexts: [const { FragContext::new() }; NUM_REASM_CONTEXTS],
            next_age_seq: 0,
        }
    }

    /// Process one received fragment.
    ///
    /// `hdr_bytes` is the raw IP header (for the error quote), `payload`
    /// the fragment payload.  Returns the context index when the datagram
    /// became complete; the caller reads it via [`complete_data`]
    /// (Self::complete_data) and must then [`release`](Self::release) it.
    pub fn process_fragment(
        &mut self,
        hdr: &Ipv4Header,
        hdr_bytes: &[u8],
        payload: BufRef,
    ) -> Option<usize> {
        let key = FragKey {
            src: hdr.src,
            dst: hdr.dst,
            protocol: hdr.protocol,
            ident: hdr.ident,
        };
        let offset = hdr.frag_offset_bytes();
        let len = payload.total_len();
        let mf = hdr.more_fragments();

        // All fragments except the last carry a multiple of 8 bytes.
        if mf && (len == 0 || len % 8 != 0) {
            trace!("reasm: bad fragment length {len}");
            return None;
        }
        if offset + len > MAX_REASM_SIZE {
            debug!("reasm: datagram from {} exceeds buffer, dropping", key.src);
            if let Some(idx) = self.find(&key) {
                self.contexts[idx].active = false;
            }
            return None;
        }

        let idx = match self.find(&key) {
            Some(idx) => idx,
            None => {
                let idx = self.allocate()?;
                let ctx = &mut self.contexts[idx];
                ctx.active = true;
                ctx.key = key;
                ctx.holes[0] = Hole {
                    first: 0,
                    last: HOLE_INF,
                };
                ctx.num_holes = 1;
                ctx.ttl = REASM_TIMEOUT_SECS;
                ctx.total_len = None;
                ctx.first_frag_seen = false;
                ctx.quote_len = 0;
                ctx.age_seq = self.next_age_seq;
                self.next_age_seq = self.next_age_seq.wrapping_add(1);
                idx
            }
        };

        let ctx = &mut self.contexts[idx];

        // Copy the payload into place.
        let mut src = payload;
        src.take_bytes(len, &mut ctx.data[offset..offset + len]);

        if offset == 0 && !ctx.first_frag_seen {
            ctx.first_frag_seen = true;
            let hl = hdr_bytes.len().min(QUOTE_MAX);
            ctx.quote[..hl].copy_from_slice(&hdr_bytes[..hl]);
            let dn = len.min(8).min(QUOTE_MAX - hl);
            ctx.quote[hl..hl + dn].copy_from_slice(&ctx.data[..dn]);
            ctx.quote_len = (hl + dn) as u8;
        }

        if !update_holes(ctx, offset as u16, (offset + len) as u16) {
            // Hole table overflow: give up on this datagram.
            debug!("reasm: hole table overflow for {}", key.src);
            ctx.active = false;
            return None;
        }

        if !mf {
            let total = (offset + len) as u16;
            ctx.total_len = Some(total);
            close_right_boundary(ctx, total);
        }

        if ctx.num_holes == 0
            && let Some(total) = ctx.total_len
        {
            trace!("reasm: datagram from {} complete ({} bytes)", key.src, total);
            return Some(idx);
        }
        None
    }

    /// Identity and payload of a completed datagram.
    pub fn complete_data(&self, idx: usize) -> (FragKey, &[u8]) {
        let ctx = &self.contexts[idx];
        debug_assert!(ctx.active && ctx.num_holes == 0);
        let len = ctx.total_len.unwrap_or(0) as usize;
        (ctx.key, &ctx.data[..len])
    }

    /// Return a completed (or abandoned) context to the pool.
    pub fn release(&mut self, idx: usize) {
        self.contexts[idx].active = false;
    }

    /// One-second aging sweep.  Writes expiry reports for contexts that
    /// timed out with their first fragment present; returns the count.
    pub fn on_second_tick(&mut self, out: &mut [Option<ReasmExpiry>; NUM_REASM_CONTEXTS]) -> usize {
        let mut n = 0;
        for ctx in self.contexts.iter_mut() {
            if !ctx.active {
                continue;
            }
            ctx.ttl -= 1;
            if ctx.ttl > 0 {
                continue;
            }
            debug!("reasm: context for {} timed out", ctx.key.src);
            ctx.active = false;
            if ctx.first_frag_seen {
                out[n] = Some(ReasmExpiry {
                    src: ctx.key.src,
                    quote: ctx.quote,
                    quote_len: ctx.quote_len,
                });
                n += 1;
            }
        }
        n
    }

    /// Number of in-progress contexts (diagnostics).
    pub fn active_count(&self) -> usize {
        self.contexts.iter().filter(|c| c.active).count()
    }

    fn find(&self, key: &FragKey) -> Option<usize> {
        self.contexts
            .iter()
            .position(|c| c.active && c.key == *key)
    }

    /// A free context, or the oldest incomplete one when the pool is full.
    fn allocate(&mut self) -> Option<usize> {
        if let Some(idx) = self.contexts.iter().position(|c| !c.active) {
            return Some(idx);
        }
        let idx = self
            .contexts
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| c.age_seq)
            .map(|(i, _)| i)?;
        debug!("reasm: pool full, evicting oldest context");
        self.contexts[idx].active = false;
        Some(idx)
    }
}

impl Default for IpReassembly {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Hole list maintenance
// =============================================================================

/// Apply fragment `[fs, fe)` to the hole list.  Each overlapped hole is
/// removed and replaced by zero, one or two remnants.  Returns `false` on
/// hole-table overflow.
fn update_holes(ctx: &mut FragContext, fs: u16, fe: u16) -> bool {
    let mut new_holes = [Hole { first: 0, last: 0 }; NUM_REASM_HOLES];
    let mut n = 0usize;
    for i in 0..ctx.num_holes as usize {
        let hole = ctx.holes[i];
        if fe <= hole.first || fs >= hole.last {
            // Disjoint: keep as is.
            if n == NUM_REASM_HOLES {
                return false;
            }
            new_holes[n] = hole;
            n += 1;
            continue;
        }
        if hole.first < fs {
            if n == NUM_REASM_HOLES {
                return false;
            }
            new_holes[n] = Hole {
                first: hole.first,
                last: fs,
            };
            n += 1;
        }
        if fe < hole.last {
            if n == NUM_REASM_HOLES {
                return false;
            }
            new_holes[n] = Hole {
                first: fe,
                last: hole.last,
            };
            n += 1;
        }
    }
    ctx.holes = new_holes;
    ctx.num_holes = n as u8;
    true
}

/// The MF=0 fragment fixes the datagram length: discard or clip holes at
/// or beyond `total`.
fn close_right_boundary(ctx: &mut FragContext, total: u16) {
    let mut n = 0usize;
    for i in 0..ctx.num_holes as usize {
        let mut hole = ctx.holes[i];
        if hole.first >= total {
            continue;
        }
        if hole.last > total {
            hole.last = total;
        }
        ctx.holes[n] = hole;
        n += 1;
    }
    ctx.num_holes = n as u8;
}
