//! Out-of-sequence buffer: bookkeeping for received TCP data and FIN that
//! arrived ahead of `rcv_nxt`.
//!
//! Tracks up to [`NUM_OOS_SEGS`](crate::config::NUM_OOS_SEGS) contiguous
//! regions in a compact fixed array.  One descriptor encoding covers three
//! cases:
//!
//! - data segment: `start < end` (end exclusive),
//! - FIN marker: `start == end`, both equal to the FIN sequence plus one
//!   (so a FIN never "touches" preceding data and merge logic needs no
//!   special cases),
//! - end-of-list sentinel: `start == end + 1`, canonically `{1, 0}`.
//!
//! The actual out-of-order payload bytes are written into the receive
//! buffer at their proper offsets by the endpoint; this structure only
//! records which ranges are present.
//!
//! When the table is full and a new segment would land strictly before
//! existing data, the last (right-most) segment is sacrificed so earlier
//! data can be accepted — in-sequence progress must never stall on a full
//! table.  Dropped ranges are simply lost from the bookkeeping and are
//! recovered by peer retransmission.

use crate::config::NUM_OOS_SEGS;
use crate::tcp::{SeqNum, seq_add, seq_diff, seq_lt, seq_lte};

// =============================================================================
// OosSeg
// =============================================================================

/// One buffered region, FIN marker, or the end sentinel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct OosSeg {
    start: SeqNum,
    end: SeqNum,
}

impl OosSeg {
    #[inline]
    fn make_end() -> Self {
        Self { start: 1, end: 0 }
    }

    #[inline]
    fn make_fin(fin_seq: SeqNum) -> Self {
        let seg_seq = seq_add(fin_seq, 1);
        Self {
            start: seg_seq,
            end: seg_seq,
        }
    }

    #[inline]
    fn is_end(&self) -> bool {
        self.start == seq_add(self.end, 1)
    }

    #[inline]
    fn is_fin(&self) -> bool {
        self.start == self.end
    }

    /// FIN sequence number; only valid on a FIN segment.
    #[inline]
    fn fin_seq(&self) -> SeqNum {
        seq_diff(self.start, 1)
    }

    /// End sentinel or FIN, in one comparison.
    #[inline]
    fn is_end_or_fin(&self) -> bool {
        seq_diff(self.start, self.end) <= 1
    }
}

// =============================================================================
// TcpOosBuffer
// =============================================================================

pub struct TcpOosBuffer {
    segs: [OosSeg; NUM_OOS_SEGS],
}

impl TcpOosBuffer {
    pub fn new() -> Self {
        let mut segs = [OosSeg::make_end(); NUM_OOS_SEGS];
        segs[0] = OosSeg::make_end();
        Self { segs }
    }

    /// Clear all buffered information.
    pub fn init(&mut self) {
        self.segs[0] = OosSeg::make_end();
    }

    /// Whether neither data nor FIN is buffered.
    pub fn is_nothing_buffered(&self) -> bool {
        self.segs[0].is_end()
    }

    /// Record the arrival of a segment.
    ///
    /// `rcv_nxt` is the receive-next *before* this segment is applied.
    /// The segment must already have passed window acceptance.  Returns
    /// `Ok(need_ack)` — an ACK is owed when the segment was out of
    /// sequence or changed buffered state — or `Err(())` on FIN
    /// inconsistency (data beyond a buffered FIN, a FIN at a different
    /// position, or a FIN below buffered data), with no state changed.
    pub fn update_for_segment_received(
        &mut self,
        rcv_nxt: SeqNum,
        seg_start: SeqNum,
        seg_datalen: usize,
        seg_fin: bool,
    ) -> Result<bool, ()> {
        let mut need_ack = seg_start != rcv_nxt;

        let seg_end = seq_add(seg_start, seg_datalen as SeqNum);
        let mut num = self.count();

        // FIN consistency checks against what is already buffered.
        if num > 0 && self.segs[num - 1].is_fin() {
            let fin_seq = self.segs[num - 1].fin_seq();
            if seg_datalen > 0 && !seq_lte(seg_end, fin_seq, rcv_nxt) {
                return Err(());
            }
            if seg_fin && seg_end != fin_seq {
                return Err(());
            }
        } else if seg_fin && num > 0 && !seq_lte(self.segs[num - 1].end, seg_end, rcv_nxt) {
            return Err(());
        }

        if seg_datalen > 0 {
            // Find the insertion position: skip segments strictly before
            // the new one.  A FIN is never skipped here thanks to the
            // consistency check above.
            let mut pos = 0;
            while pos < num && seq_lt(self.segs[pos].end, seg_start, rcv_nxt) {
                pos += 1;
            }

            if pos == num || seq_lt(seg_end, self.segs[pos].start, rcv_nxt) {
                // Strictly between neighbours: insert.  If the table is
                // full and we are not appending at the end, sacrifice the
                // last segment — earlier data wins over later data.  (That
                // may discard a FIN marker; the only cost is a missed
                // chance at inconsistency detection.)
                if num == NUM_OOS_SEGS && pos < NUM_OOS_SEGS {
                    num -= 1;
                }
                if num < NUM_OOS_SEGS {
                    if pos < num {
                        need_ack = true;
                        self.segs.copy_within(pos..num, pos + 1);
                    }
                    self.segs[pos] = OosSeg {
                        start: seg_start,
                        end: seg_end,
                    };
                    num += 1;
                }
            } else {
                // Touches or overlaps segs[pos], which cannot be a FIN
                // (a FIN there would have tripped the consistency check).
                debug_assert!(!self.segs[pos].is_fin());

                if seq_lt(seg_start, self.segs[pos].start, rcv_nxt) {
                    need_ack = true;
                    self.segs[pos].start = seg_start;
                }

                if !seq_lte(seg_end, self.segs[pos].end, rcv_nxt) {
                    need_ack = true;
                    self.segs[pos].end = seg_end;

                    // Absorb any following segments the extension reaches.
                    let mut merge_pos = pos + 1;
                    while merge_pos < num && !seq_lt(seg_end, self.segs[merge_pos].start, rcv_nxt)
                    {
                        debug_assert!(!self.segs[merge_pos].is_fin());
                        if seq_lte(seg_end, self.segs[merge_pos].end, rcv_nxt) {
                            self.segs[pos].end = self.segs[merge_pos].end;
                            merge_pos += 1;
                            break;
                        }
                        merge_pos += 1;
                    }

                    let num_merged = merge_pos - (pos + 1);
                    if num_merged > 0 {
                        if merge_pos < num {
                            self.segs.copy_within(merge_pos..num, pos + 1);
                        }
                        num -= num_merged;
                    }
                }
            }
        }

        // Remember the FIN if it is new and there is room.
        if seg_fin && (num == 0 || !self.segs[num - 1].is_fin()) && num < NUM_OOS_SEGS {
            self.segs[num] = OosSeg::make_fin(seg_end);
            num += 1;
        }

        if num < NUM_OOS_SEGS {
            self.segs[num] = OosSeg::make_end();
        }
        debug_assert!(num == self.count());

        Ok(need_ack)
    }

    /// Shift out data (and report a FIN) that became in-sequence.
    ///
    /// `rcv_nxt` is the receive-next before the shift.  Returns the number
    /// of bytes now consumable starting at `rcv_nxt`, and whether a FIN
    /// immediately follows them.  The FIN marker itself is *not* consumed;
    /// the endpoint consumes it by changing state.
    pub fn shift_available(&mut self, rcv_nxt: SeqNum) -> (usize, bool) {
        let mut datalen = 0;

        if !self.segs[0].is_end_or_fin() && self.segs[0].start == rcv_nxt {
            let seq_end = self.segs[0].end;
            datalen = seq_diff(seq_end, self.segs[0].start) as usize;

            let mut num = self.count();
            if num > 1 {
                self.segs.copy_within(1..num, 0);
            }
            num -= 1;
            self.segs[num] = OosSeg::make_end();

            // Segments are separated by gaps, so the next one cannot be
            // immediately consumable data.
            debug_assert!(
                self.segs[0].is_end_or_fin() || !seq_lte(self.segs[0].start, seq_end, rcv_nxt)
            );
        }

        let fin = self.segs[0].is_fin()
            && self.segs[0].fin_seq() == seq_add(rcv_nxt, datalen as SeqNum);
        (datalen, fin)
    }

    /// Buffered FIN sequence number, if a FIN is buffered.
    pub fn buffered_fin(&self) -> Option<SeqNum> {
        let num = self.count();
        if num > 0 && self.segs[num - 1].is_fin() {
            Some(self.segs[num - 1].fin_seq())
        } else {
            None
        }
    }

    /// Count valid segments (data and FIN) up to the end sentinel.
    fn count(&self) -> usize {
        let mut n = 0;
        while n < NUM_OOS_SEGS && !self.segs[n].is_end() {
            n += 1;
        }
        n
    }
}

impl Default for TcpOosBuffer {
    fn default() -> Self {
        Self::new()
    }
}
