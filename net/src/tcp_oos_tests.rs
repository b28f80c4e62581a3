//! Out-of-sequence buffer behavior: insertion, merging, FIN handling, the
//! full-table drop policy, and sequence-wrap correctness.

use crate::config::NUM_OOS_SEGS;
use crate::tcp_oos::TcpOosBuffer;

#[test]
fn in_order_segment_needs_no_ack_flag() {
    let mut oos = TcpOosBuffer::new();
    let need_ack = oos.update_for_segment_received(100, 100, 5, false).unwrap();
    assert!(!need_ack);
    // The region is immediately shiftable.
    let (len, fin) = oos.shift_available(100);
    assert_eq!(len, 5);
    assert!(!fin);
}

#[test]
fn out_of_order_then_gap_fill() {
    let mut oos = TcpOosBuffer::new();

    // seq=105 len=5 while rcv_nxt=100: out of order, ACK owed.
    let need_ack = oos.update_for_segment_received(100, 105, 5, false).unwrap();
    assert!(need_ack);
    let (len, _) = oos.shift_available(100);
    assert_eq!(len, 0, "gap still open");
    assert!(!oos.is_nothing_buffered());

    // seq=100 len=5 closes the gap; everything drains at once.
    let _ = oos.update_for_segment_received(100, 100, 5, false).unwrap();
    let (len, fin) = oos.shift_available(100);
    assert_eq!(len, 10);
    assert!(!fin);
    assert!(oos.is_nothing_buffered());
}

#[test]
fn duplicate_update_is_idempotent() {
    let mut oos = TcpOosBuffer::new();
    let _ = oos.update_for_segment_received(100, 110, 8, false).unwrap();
    let _ = oos.update_for_segment_received(100, 110, 8, false).unwrap();
    // One merge-equivalent region only: draining after the gap fill
    // yields exactly 8 + 10 bytes once 100..110 arrives.
    let _ = oos.update_for_segment_received(100, 100, 10, false).unwrap();
    let (len, _) = oos.shift_available(100);
    assert_eq!(len, 18);
    assert!(oos.is_nothing_buffered());
}

#[test]
fn overlapping_segments_merge() {
    let mut oos = TcpOosBuffer::new();
    let _ = oos.update_for_segment_received(100, 110, 5, false).unwrap();
    let _ = oos.update_for_segment_received(100, 120, 5, false).unwrap();
    // 113..122 bridges both regions.
    let _ = oos.update_for_segment_received(100, 113, 9, false).unwrap();
    let _ = oos.update_for_segment_received(100, 100, 10, false).unwrap();
    let (len, _) = oos.shift_available(100);
    assert_eq!(len, 25, "110..125 merged into one region");
}

#[test]
fn fin_is_recorded_and_reported() {
    let mut oos = TcpOosBuffer::new();
    // Data 100..105 with FIN at 105, all in order.
    let _ = oos.update_for_segment_received(100, 100, 5, true).unwrap();
    let (len, fin) = oos.shift_available(100);
    assert_eq!(len, 5);
    assert!(fin, "FIN follows the drained data");
    // The FIN marker stays until consumed by the state machine.
    let (len2, fin2) = oos.shift_available(105);
    assert_eq!(len2, 0);
    assert!(fin2);
}

#[test]
fn data_beyond_buffered_fin_is_rejected() {
    let mut oos = TcpOosBuffer::new();
    let _ = oos.update_for_segment_received(100, 105, 5, true).unwrap();
    // 112..116 lies beyond the FIN at 110: inconsistent.
    assert!(oos.update_for_segment_received(100, 112, 4, false).is_err());
}

#[test]
fn second_fin_elsewhere_is_rejected() {
    let mut oos = TcpOosBuffer::new();
    let _ = oos.update_for_segment_received(100, 105, 5, true).unwrap();
    assert!(oos.update_for_segment_received(100, 105, 3, true).is_err());
    // Same position is fine (duplicate).
    assert!(oos.update_for_segment_received(100, 105, 5, true).is_ok());
}

#[test]
fn full_table_drops_rightmost_for_earlier_data() {
    let mut oos = TcpOosBuffer::new();
    // Fill all slots with disjoint regions, rightmost last.
    for i in 0..NUM_OOS_SEGS {
        let start = 110 + (i as u32) * 20;
        let _ = oos
            .update_for_segment_received(100, start, 5, false)
            .unwrap();
    }
    // An earlier region must displace the rightmost one.
    let need_ack = oos.update_for_segment_received(100, 102, 4, false).unwrap();
    assert!(need_ack);

    // Drain: fill 100..102, then everything up to the second-to-last
    // region is reachable; the rightmost region is gone.
    let _ = oos.update_for_segment_received(100, 100, 2, false).unwrap();
    let (len, _) = oos.shift_available(100);
    assert_eq!(len, 6, "100..106 contiguous");
}

#[test]
fn sequence_wrap_is_handled() {
    let mut oos = TcpOosBuffer::new();
    let rcv_nxt: u32 = u32::MAX - 2;
    // Segment straddling the wrap: starts at MAX-2+5 (wraps to 2).
    let seg_start = rcv_nxt.wrapping_add(5);
    let need_ack = oos
        .update_for_segment_received(rcv_nxt, seg_start, 4, false)
        .unwrap();
    assert!(need_ack);

    let _ = oos
        .update_for_segment_received(rcv_nxt, rcv_nxt, 5, false)
        .unwrap();
    let (len, _) = oos.shift_available(rcv_nxt);
    assert_eq!(len, 9);
}

#[test]
fn fin_alone_out_of_order() {
    let mut oos = TcpOosBuffer::new();
    // FIN at 110 while rcv_nxt=100 (data 100..110 missing).
    let need_ack = oos.update_for_segment_received(100, 110, 0, true).unwrap();
    assert!(need_ack);
    let (len, fin) = oos.shift_available(100);
    assert_eq!(len, 0);
    assert!(!fin, "FIN not reachable before the gap fills");

    let _ = oos.update_for_segment_received(100, 100, 10, false).unwrap();
    let (len, fin) = oos.shift_available(100);
    assert_eq!(len, 10);
    assert!(fin);
}
