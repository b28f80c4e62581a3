//! Stack-level flows: the listen queue, ICMP echo (with fragmentation),
//! and reassembly-timeout error origination.

use std::vec::Vec;

use fathom_lib::clock::{Instant, ticks_from_secs};

use crate::buf::{BufNode, BufRef};
use crate::config::{LISTEN_QUEUE_BUF_SIZE, LISTEN_QUEUE_SIZE};
use crate::stack::Stack;
use crate::tcp_pcb::{ConnId, ListenerId, TcpConn, TcpEvents};
use crate::testutil::{
    ACK, FIN, MockDriver, OUR_IP, PEER_IP, PEER_MAC, RST, SYN, arp_reply_frame, eth_ethertype,
    icmp_echo_request_frame, ipv4_packet, parse_tcp, peer_tcp_frame, test_iface, with_frame_ref,
};
use crate::types::{NetError, Port};
use crate::{
    ETH_HEADER_LEN, ETHERTYPE_IPV4, ICMP_TYPE_ECHO_REPLY, ICMP_TYPE_TIME_EXCEEDED, IPV4_FLAG_MF,
    IPV4_HEADER_LEN,
};

const Q_PORT: u16 = 80;
const Q_TIMEOUT_SECS: u32 = 5;

// A minimal sink: queue tests don't need buffers until accept.
struct Sink {
    ready: Vec<ListenerId>,
    received: Vec<(ConnId, usize)>,
    recv_store: [u8; 2048],
    recv_node: BufNode,
}

impl Sink {
    fn new() -> Self {
        Self {
            ready: Vec::new(),
            received: Vec::new(),
            recv_store: [0; 2048],
            recv_node: BufNode::empty(),
        }
    }
}

impl TcpEvents<MockDriver> for Sink {
    fn connection_established(&mut self, _conn: TcpConn<'_, '_, MockDriver>) {}
    fn data_received(&mut self, conn: TcpConn<'_, '_, MockDriver>, amount: usize) {
        self.received.push((conn.id(), amount));
    }
    fn data_sent(&mut self, _conn: TcpConn<'_, '_, MockDriver>, _amount: usize) {}
    fn connection_aborted(&mut self, _id: ConnId, _err: NetError) {}
    fn listen_ready(&mut self, listener: ListenerId) {
        self.ready.push(listener);
    }
}

fn feed(stack: &mut Stack<MockDriver>, now: Instant, sink: &mut Sink, frame: &[u8]) {
    with_frame_ref(frame, |buf| stack.on_rx_frame(now, buf, sink));
}

fn drain(stack: &mut Stack<MockDriver>) -> Vec<Vec<u8>> {
    core::mem::take(&mut stack.driver_mut().sent)
}

/// Complete a handshake from `sport` against the queued listener.
/// Returns our next sequence number.
fn queued_handshake(
    stack: &mut Stack<MockDriver>,
    sink: &mut Sink,
    now: Instant,
    sport: u16,
) -> u32 {
    feed(
        stack,
        now,
        sink,
        &peer_tcp_frame(sport, Q_PORT, 1000, 0, SYN, 65535, &[2, 4, 0x05, 0xb4], &[]),
    );
    let frames = drain(stack);
    let syn_ack = parse_tcp(frames.last().expect("SYN-ACK expected"));
    assert_eq!(syn_ack.flags & (SYN | ACK), SYN | ACK);
    assert_eq!(
        syn_ack.wnd as usize,
        LISTEN_QUEUE_BUF_SIZE,
        "queued listener announces its queue buffer"
    );
    let our_next = syn_ack.seq.wrapping_add(1);
    feed(
        stack,
        now,
        sink,
        &peer_tcp_frame(sport, Q_PORT, 1001, our_next, ACK, 65535, &[], &[]),
    );
    our_next
}

// =============================================================================
// Listen queue
// =============================================================================

#[test]
fn listen_queue_ages_out_silent_connections() {
    let mut stack: Stack<MockDriver> = Stack::new(MockDriver::new(), test_iface(), Instant::ZERO);
    let mut sink = Sink::new();
    let mut now = Instant::ZERO;

    stack
        .tcp_listen_queued(Port(Q_PORT), ticks_from_secs(Q_TIMEOUT_SECS))
        .unwrap();

    // Fill the queue with silent handshakes.
    for i in 0..LISTEN_QUEUE_SIZE as u16 {
        queued_handshake(&mut stack, &mut sink, now, 5001 + i);
    }
    assert!(sink.ready.is_empty(), "no data, nothing to accept");
    assert_eq!(stack.tcp_active_count(), LISTEN_QUEUE_SIZE);

    // One more SYN finds no room and is dropped without a reply.
    feed(
        &mut stack,
        now,
        &mut sink,
        &peer_tcp_frame(5999, Q_PORT, 1000, 0, SYN, 65535, &[], &[]),
    );
    assert!(drain(&mut stack).is_empty(), "queue full, SYN ignored");

    // Aging resets the oldest entry, freeing a slot for the newcomer.
    let mut frames = Vec::new();
    for _ in 0..=Q_TIMEOUT_SECS {
        now = now.plus(ticks_from_secs(1));
        stack.poll(now, &mut sink);
        frames = drain(&mut stack);
        if !frames.is_empty() {
            break;
        }
    }
    let rst = frames
        .iter()
        .map(|f| parse_tcp(f))
        .find(|v| v.flags & RST != 0)
        .expect("oldest queued connection reset");
    assert_eq!(rst.dport, 5001);
    assert_eq!(stack.tcp_active_count(), LISTEN_QUEUE_SIZE - 1);

    queued_handshake(&mut stack, &mut sink, now, 5999);
    assert_eq!(stack.tcp_active_count(), LISTEN_QUEUE_SIZE);
}

#[test]
fn queued_connection_becomes_ready_and_accepts_with_data() {
    let mut stack: Stack<MockDriver> = Stack::new(MockDriver::new(), test_iface(), Instant::ZERO);
    let mut sink = Sink::new();
    let now = Instant::ZERO;

    let listener = stack
        .tcp_listen_queued(Port(Q_PORT), ticks_from_secs(Q_TIMEOUT_SECS))
        .unwrap();
    let our_next = queued_handshake(&mut stack, &mut sink, now, 6000);

    // Nothing to accept before the first data.
    let mut initial = [0u8; LISTEN_QUEUE_BUF_SIZE];
    assert_eq!(
        stack.tcp_accept(now, listener, &mut initial).unwrap_err(),
        NetError::WouldBlock
    );

    feed(
        &mut stack,
        now,
        &mut sink,
        &peer_tcp_frame(6000, Q_PORT, 1001, our_next, ACK, 65535, &[], b"hello "),
    );
    assert_eq!(sink.ready, std::vec![listener]);
    // The data was acknowledged from the queue buffer.
    let ack = parse_tcp(drain(&mut stack).last().unwrap());
    assert_eq!(ack.ack, 1007);

    let (conn, n) = stack.tcp_accept(now, listener, &mut initial).unwrap();
    assert_eq!(n, 6);
    assert_eq!(&initial[..6], b"hello ");

    // Attach a real receive buffer; subsequent data reaches the events.
    sink.recv_node = BufNode::from_slice_mut(&mut sink.recv_store);
    let node_ref = &sink.recv_node;
    stack
        .with_tcp_conn(now, conn, |c| {
            c.set_recv_buf(BufRef::new(node_ref, 0, 2048));
        })
        .unwrap();

    feed(
        &mut stack,
        now,
        &mut sink,
        &peer_tcp_frame(6000, Q_PORT, 1007, our_next, ACK, 65535, &[], b"world"),
    );
    assert_eq!(sink.received, std::vec![(conn, 5)]);
    assert_eq!(&sink.recv_store[..5], b"world");
}

#[test]
fn fin_before_data_aborts_queued_connection() {
    let mut stack: Stack<MockDriver> = Stack::new(MockDriver::new(), test_iface(), Instant::ZERO);
    let mut sink = Sink::new();
    let now = Instant::ZERO;

    let listener = stack
        .tcp_listen_queued(Port(Q_PORT), ticks_from_secs(Q_TIMEOUT_SECS))
        .unwrap();
    let our_next = queued_handshake(&mut stack, &mut sink, now, 6100);

    feed(
        &mut stack,
        now,
        &mut sink,
        &peer_tcp_frame(6100, Q_PORT, 1001, our_next, ACK | FIN, 65535, &[], &[]),
    );
    // The queued connection was reset, not parked.
    let frames = drain(&mut stack);
    assert!(
        frames.iter().any(|f| parse_tcp(f).flags & RST != 0),
        "pure FIN before data -> RST"
    );
    assert_eq!(stack.tcp_active_count(), 0);
    let mut initial = [0u8; LISTEN_QUEUE_BUF_SIZE];
    assert_eq!(
        stack.tcp_accept(now, listener, &mut initial).unwrap_err(),
        NetError::WouldBlock
    );
}

// =============================================================================
// ICMP
// =============================================================================

fn learn_peer_mac(stack: &mut Stack<MockDriver>, sink: &mut Sink, now: Instant) {
    feed(stack, now, sink, &arp_reply_frame(PEER_IP, PEER_MAC, OUR_IP));
    drain(stack);
}

fn icmp_payload(frame: &[u8]) -> (u8, u8, Vec<u8>) {
    assert_eq!(eth_ethertype(frame), ETHERTYPE_IPV4);
    let ip = &frame[ETH_HEADER_LEN..];
    assert_eq!(ip[9], 1, "not ICMP");
    let ihl = ((ip[0] & 0x0f) as usize) * 4;
    let total = u16::from_be_bytes([ip[2], ip[3]]) as usize;
    let msg = &ip[ihl..total];
    (msg[0], msg[1], msg.to_vec())
}

#[test]
fn echo_request_is_answered() {
    let mut stack: Stack<MockDriver> = Stack::new(MockDriver::new(), test_iface(), Instant::ZERO);
    let mut sink = Sink::new();
    let now = Instant::ZERO;
    learn_peer_mac(&mut stack, &mut sink, now);

    let ident_seq = [0xab, 0xcd, 0x00, 0x07];
    feed(
        &mut stack,
        now,
        &mut sink,
        &icmp_echo_request_frame(ident_seq, b"ping payload"),
    );
    let frames = drain(&mut stack);
    assert_eq!(frames.len(), 1);
    let (t, _c, msg) = icmp_payload(&frames[0]);
    assert_eq!(t, ICMP_TYPE_ECHO_REPLY);
    assert_eq!(&msg[4..8], &ident_seq);
    assert_eq!(&msg[8..], b"ping payload");
    // A reply checksummed over itself folds to zero.
    assert_eq!(crate::checksum::header_checksum(&msg), 0);
}

#[test]
fn fragmented_echo_reassembles_and_reply_refragments() {
    // A small link MTU forces the reply to fragment.
    let mut stack: Stack<MockDriver> = Stack::new(MockDriver::with_mtu(554), test_iface(), Instant::ZERO);
    let mut sink = Sink::new();
    let now = Instant::ZERO;
    learn_peer_mac(&mut stack, &mut sink, now);

    // Build the full ICMP echo message (8 + 1392 bytes), then feed it as
    // two fragments.
    let data: Vec<u8> = (0..1392u32).map(|i| i as u8).collect();
    let mut msg = std::vec![0u8; 8 + data.len()];
    msg[0] = crate::ICMP_TYPE_ECHO_REQUEST;
    msg[4..8].copy_from_slice(&[1, 2, 3, 4]);
    msg[8..].copy_from_slice(&data);
    let csum = crate::checksum::header_checksum(&msg);
    msg[2..4].copy_from_slice(&csum.to_be_bytes());

    let frag1 = ipv4_packet(PEER_IP, OUR_IP, 1, 77, IPV4_FLAG_MF, &msg[..800]);
    let frag2 = ipv4_packet(PEER_IP, OUR_IP, 1, 77, (800 / 8) as u16, &msg[800..]);
    feed(
        &mut stack,
        now,
        &mut sink,
        &crate::testutil::eth_frame(
            crate::testutil::OUR_MAC,
            PEER_MAC,
            ETHERTYPE_IPV4,
            &frag1,
        ),
    );
    assert!(drain(&mut stack).is_empty(), "half a datagram, no reply yet");
    feed(
        &mut stack,
        now,
        &mut sink,
        &crate::testutil::eth_frame(
            crate::testutil::OUR_MAC,
            PEER_MAC,
            ETHERTYPE_IPV4,
            &frag2,
        ),
    );

    // ip_mtu = 540, so the 1400-byte reply leaves in ceil(1400/520) = 3
    // fragments with matching idents and 8-aligned offsets.
    let frames = drain(&mut stack);
    assert_eq!(frames.len(), 3);
    let mut reassembled = std::vec![0u8; 1400];
    let mut idents = Vec::new();
    for (i, f) in frames.iter().enumerate() {
        let ip = &f[ETH_HEADER_LEN..];
        assert_eq!(ip[9], 1);
        let flags_frag = u16::from_be_bytes([ip[6], ip[7]]);
        let off = ((flags_frag & 0x1fff) as usize) * 8;
        let mf = flags_frag & IPV4_FLAG_MF != 0;
        assert_eq!(mf, i < frames.len() - 1, "MF on all but the last");
        let total = u16::from_be_bytes([ip[2], ip[3]]) as usize;
        let payload = &ip[IPV4_HEADER_LEN..total];
        reassembled[off..off + payload.len()].copy_from_slice(payload);
        idents.push(u16::from_be_bytes([ip[4], ip[5]]));
    }
    assert!(idents.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(reassembled[0], ICMP_TYPE_ECHO_REPLY);
    assert_eq!(&reassembled[8..], &msg[8..], "echo data returned verbatim");
}

#[test]
fn drain_rx_pulls_parked_frames_through() {
    use crate::pool::{FRAME_POOL, RxRing};

    let mut stack: Stack<MockDriver> = Stack::new(MockDriver::new(), test_iface(), Instant::ZERO);
    let mut sink = Sink::new();
    let ring = RxRing::new();

    // The "driver" parks an ARP request for us in the ring.  (The pool is
    // shared across parallel tests; bail out if it is momentarily empty.)
    let request = crate::testutil::arp_request_frame(PEER_IP, PEER_MAC, OUR_IP);
    let Some(mut slot) = FRAME_POOL.alloc() else {
        return;
    };
    assert!(slot.fill(&request));
    assert!(ring.push(slot));

    stack.drain_rx(Instant::ZERO, &ring, &mut sink);
    let frames = drain(&mut stack);
    assert_eq!(frames.len(), 1, "ARP reply went out");
    assert_eq!(eth_ethertype(&frames[0]), crate::ETHERTYPE_ARP);
    assert!(ring.pop().is_none(), "ring drained");
}

#[test]
fn reassembly_timeout_originates_time_exceeded() {
    let mut stack: Stack<MockDriver> = Stack::new(MockDriver::new(), test_iface(), Instant::ZERO);
    let mut sink = Sink::new();
    let mut now = Instant::ZERO;
    learn_peer_mac(&mut stack, &mut sink, now);

    // Only the first fragment ever arrives.
    let frag = ipv4_packet(PEER_IP, OUR_IP, 17, 55, IPV4_FLAG_MF, &[9u8; 16]);
    feed(
        &mut stack,
        now,
        &mut sink,
        &crate::testutil::eth_frame(crate::testutil::OUR_MAC, PEER_MAC, ETHERTYPE_IPV4, &frag),
    );

    let mut reported = None;
    for _ in 0..crate::config::REASM_TIMEOUT_SECS as u32 + 1 {
        now = now.plus(ticks_from_secs(1));
        stack.poll(now, &mut sink);
        if let Some(f) = stack.driver_mut().sent.first() {
            reported = Some(f.clone());
            break;
        }
    }
    let frame = reported.expect("time exceeded sent");
    let (t, c, msg) = icmp_payload(&frame);
    assert_eq!(t, ICMP_TYPE_TIME_EXCEEDED);
    assert_eq!(c, crate::ICMP_CODE_REASS_TIMEOUT);
    // The quote holds the offending header: protocol 17 from the peer.
    assert_eq!(msg[8 + 9], 17);
    assert_eq!(&msg[8 + 12..8 + 16], &PEER_IP.0);
}
