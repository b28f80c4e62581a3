//! TCP endpoint scenarios, driven end to end through [`Stack`] with a
//! capturing driver: handshakes, echo, out-of-order delivery, windows,
//! retransmission, PMTU reaction and teardown.

use std::vec::Vec;

use fathom_lib::clock::{Instant, ticks_from_secs};

use crate::buf::{BufNode, BufRef};
use crate::config::{TCP_MAX_RETRANSMITS, TCP_PERSIST_TICKS, TCP_TIME_WAIT_TICKS};
use crate::stack::Stack;
use crate::tcp_pcb::{ConnId, ListenerId, TcpConn, TcpEvents};
use crate::testutil::{
    ACK, FIN, MockDriver, OUR_IP, PEER_IP, PEER_MAC, PSH, RST, SYN, TcpView, arp_reply_frame,
    eth_dst, find_mss_option, icmp_frag_needed_frame, parse_tcp, peer_tcp_frame, test_iface,
    with_frame_ref,
};
use crate::types::{NetError, Port};

const RECV_CAP: usize = 4096;
const SEND_CAP: usize = 8192;
const LISTEN_PORT: u16 = 1234;
const PEER_PORT: u16 = 5678;

// =============================================================================
// Test application
// =============================================================================

/// Event sink owning the connection buffers, with an optional canned
/// reply pushed on first data.
struct App {
    recv_store: [u8; RECV_CAP],
    recv_node: BufNode,
    send_store: [u8; SEND_CAP],
    send_node: BufNode,
    send_attached: bool,
    reply: Option<Vec<u8>>,
    established: Vec<ConnId>,
    received: Vec<(ConnId, usize)>,
    acked: Vec<(ConnId, usize)>,
    aborted: Vec<(ConnId, NetError)>,
    ready: Vec<ListenerId>,
}

impl App {
    fn new() -> Self {
        Self {
            recv_store: [0; RECV_CAP],
            recv_node: BufNode::empty(),
            send_store: [0; SEND_CAP],
            send_node: BufNode::empty(),
            send_attached: false,
            reply: None,
            established: Vec::new(),
            received: Vec::new(),
            acked: Vec::new(),
            aborted: Vec::new(),
            ready: Vec::new(),
        }
    }

    fn with_reply(reply: &[u8]) -> Self {
        let mut app = Self::new();
        app.reply = Some(reply.to_vec());
        app
    }

    fn attach_recv(&mut self, conn: &mut TcpConn<'_, '_, MockDriver>) {
        self.recv_node = BufNode::from_slice_mut(&mut self.recv_store);
        conn.set_recv_buf(BufRef::new(&self.recv_node, 0, RECV_CAP));
    }

    /// Stage bytes in the send store and hand them to the connection.
    fn send_bytes(&mut self, conn: &mut TcpConn<'_, '_, MockDriver>, data: &[u8]) {
        assert!(data.len() <= SEND_CAP);
        self.send_store[..data.len()].copy_from_slice(data);
        self.send_node = BufNode::from_slice_mut(&mut self.send_store);
        if !self.send_attached {
            conn.set_send_buf(BufRef::new(&self.send_node, 0, 0));
            self.send_attached = true;
        }
        conn.push();
        conn.extend_send_buf(data.len());
    }
}

/// Caller-owned send chain for tests driving `with_tcp_conn` directly.
/// Must outlive the connection's use of the data (the stack references
/// the chain until everything is acknowledged).
struct SendBuf {
    store: [u8; SEND_CAP],
    node: BufNode,
    attached: bool,
}

impl SendBuf {
    fn new() -> Self {
        Self {
            store: [0; SEND_CAP],
            node: BufNode::empty(),
            attached: false,
        }
    }

    fn send(&mut self, conn: &mut TcpConn<'_, '_, MockDriver>, data: &[u8]) {
        self.store[..data.len()].copy_from_slice(data);
        self.node = BufNode::from_slice_mut(&mut self.store);
        if !self.attached {
            conn.set_send_buf(BufRef::new(&self.node, 0, 0));
            self.attached = true;
        }
        conn.push();
        conn.extend_send_buf(data.len());
    }
}

impl TcpEvents<MockDriver> for App {
    fn connection_established(&mut self, mut conn: TcpConn<'_, '_, MockDriver>) {
        self.established.push(conn.id());
        self.attach_recv(&mut conn);
    }

    fn data_received(&mut self, mut conn: TcpConn<'_, '_, MockDriver>, amount: usize) {
        self.received.push((conn.id(), amount));
        if amount > 0
            && let Some(reply) = self.reply.take()
        {
            self.send_bytes(&mut conn, &reply);
        }
    }

    fn data_sent(&mut self, conn: TcpConn<'_, '_, MockDriver>, amount: usize) {
        self.acked.push((conn.id(), amount));
    }

    fn connection_aborted(&mut self, id: ConnId, err: NetError) {
        self.aborted.push((id, err));
    }

    fn listen_ready(&mut self, listener: ListenerId) {
        self.ready.push(listener);
    }
}

// =============================================================================
// Harness
// =============================================================================

fn new_stack() -> Stack<MockDriver> {
    Stack::new(MockDriver::new(), test_iface(), Instant::ZERO)
}

fn feed(stack: &mut Stack<MockDriver>, now: Instant, app: &mut App, frame: &[u8]) {
    with_frame_ref(frame, |buf| stack.on_rx_frame(now, buf, app));
}

fn sent_frames(stack: &mut Stack<MockDriver>) -> Vec<Vec<u8>> {
    core::mem::take(&mut stack.driver_mut().sent)
}

fn last_tcp(stack: &mut Stack<MockDriver>) -> TcpView {
    let frames = sent_frames(stack);
    parse_tcp(frames.last().expect("a frame was sent"))
}

/// Run the passive handshake; returns (our iss+1, peer next seq, conn id).
fn establish(stack: &mut Stack<MockDriver>, app: &mut App, now: Instant) -> (u32, u32, ConnId) {
    stack
        .tcp_listen(Port(LISTEN_PORT), RECV_CAP as u32)
        .expect("listen");

    let mss_opt = [2u8, 4, 0x05, 0xb4]; // MSS 1460
    feed(
        stack,
        now,
        app,
        &peer_tcp_frame(PEER_PORT, LISTEN_PORT, 1000, 0, SYN, 65535, &mss_opt, &[]),
    );

    let syn_ack = last_tcp(stack);
    assert_eq!(syn_ack.flags & (SYN | ACK), SYN | ACK);
    assert_eq!(syn_ack.ack, 1001);
    assert_eq!(find_mss_option(&syn_ack.options), Some(1460));
    let our_next = syn_ack.seq.wrapping_add(1);

    feed(
        stack,
        now,
        app,
        &peer_tcp_frame(PEER_PORT, LISTEN_PORT, 1001, our_next, ACK, 65535, &[], &[]),
    );
    assert_eq!(app.established.len(), 1);
    let id = app.established[0];
    (our_next, 1001, id)
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn echo_over_tcp() {
    let mut stack = new_stack();
    let mut app = App::with_reply(b"abcd");
    let now = Instant::ZERO;

    let (our_next, peer_seq, _id) = establish(&mut stack, &mut app, now);

    // Peer sends "ABCD"; the app answers "abcd" with a push.
    feed(
        &mut stack,
        now,
        &mut app,
        &peer_tcp_frame(
            PEER_PORT,
            LISTEN_PORT,
            peer_seq,
            our_next,
            ACK | PSH,
            65535,
            &[],
            b"ABCD",
        ),
    );
    assert_eq!(app.received, std::vec![(app.established[0], 4)]);
    assert_eq!(&app.recv_store[..4], b"ABCD");

    let reply = last_tcp(&mut stack);
    assert_eq!(reply.dst_ip, PEER_IP);
    assert_eq!(reply.ack, 1005, "all four bytes acknowledged");
    assert_eq!(reply.seq, our_next);
    assert_ne!(reply.flags & PSH, 0, "user flushed, PSH expected");
    assert_eq!(reply.payload, b"abcd");
    assert!(reply.ip_df, "TCP segments travel with DF for PMTU discovery");

    // Peer acknowledges the echo; the send buffer drains.
    feed(
        &mut stack,
        now,
        &mut app,
        &peer_tcp_frame(
            PEER_PORT,
            LISTEN_PORT,
            1005,
            our_next.wrapping_add(4),
            ACK,
            65535,
            &[],
            &[],
        ),
    );
    assert_eq!(app.acked, std::vec![(app.established[0], 4)]);
}

#[test]
fn out_of_order_then_gap_fill_sends_single_ack() {
    let mut stack = new_stack();
    let mut app = App::new();
    let now = Instant::ZERO;

    let (our_next, peer_seq, _) = establish(&mut stack, &mut app, now);
    assert_eq!(peer_seq, 1001);

    // Segment at +5 first: stored out of order, duplicate ACK emitted.
    feed(
        &mut stack,
        now,
        &mut app,
        &peer_tcp_frame(
            PEER_PORT,
            LISTEN_PORT,
            1006,
            our_next,
            ACK,
            65535,
            &[],
            b"WORLD",
        ),
    );
    let frames = sent_frames(&mut stack);
    assert_eq!(frames.len(), 1, "exactly one ACK for the gap");
    let dup = parse_tcp(&frames[0]);
    assert_eq!(dup.ack, 1001, "still waiting for the gap");
    assert!(app.received.is_empty(), "nothing delivered yet");

    // The gap fill delivers both segments and a single cumulative ACK.
    feed(
        &mut stack,
        now,
        &mut app,
        &peer_tcp_frame(
            PEER_PORT,
            LISTEN_PORT,
            1001,
            our_next,
            ACK,
            65535,
            &[],
            b"HELLO",
        ),
    );
    let frames = sent_frames(&mut stack);
    assert_eq!(frames.len(), 1, "single ACK after the fill");
    let ack = parse_tcp(&frames[0]);
    assert_eq!(ack.ack, 1011);
    assert_eq!(app.received, std::vec![(app.established[0], 10)]);
    assert_eq!(&app.recv_store[..10], b"HELLOWORLD");
}

#[test]
fn syn_with_tiny_mss_is_refused() {
    let mut stack = new_stack();
    let mut app = App::new();
    stack.tcp_listen(Port(LISTEN_PORT), 4096).unwrap();

    let tiny_mss = [2u8, 4, 0, 100];
    feed(
        &mut stack,
        Instant::ZERO,
        &mut app,
        &peer_tcp_frame(PEER_PORT, LISTEN_PORT, 1000, 0, SYN, 65535, &tiny_mss, &[]),
    );
    let rst = last_tcp(&mut stack);
    assert_ne!(rst.flags & RST, 0, "MSS below floor refused with RST");
    assert_eq!(stack.tcp_active_count(), 0);
}

#[test]
fn retransmission_timeout_and_abort() {
    let mut stack = new_stack();
    let mut app = App::new();
    let mut now = Instant::ZERO;

    let (_, _, id) = establish(&mut stack, &mut app, now);
    let mut snd = SendBuf::new();
    stack
        .with_tcp_conn(now, id, |conn| snd.send(conn, b"important"))
        .unwrap();
    let first = last_tcp(&mut stack);
    assert_eq!(first.payload, b"important");

    // No ACK arrives: the timer fires and the same segment returns.
    now = now.plus(ticks_from_secs(2));
    stack.poll(now, &mut app);
    let retx = last_tcp(&mut stack);
    assert_eq!(retx.seq, first.seq);
    assert_eq!(retx.payload, b"important");

    // Keep starving it: after the retry budget the connection dies with
    // a timeout and an RST on the wire.
    for _ in 0..=TCP_MAX_RETRANSMITS {
        now = now.plus(ticks_from_secs(61));
        stack.poll(now, &mut app);
    }
    assert_eq!(app.aborted.len(), 1);
    assert_eq!(app.aborted[0].1, NetError::Timeout);
    assert_eq!(stack.tcp_active_count(), 0);
}

#[test]
fn zero_window_probe() {
    let mut stack = new_stack();
    let mut app = App::new();
    let mut now = Instant::ZERO;

    stack.tcp_listen(Port(LISTEN_PORT), RECV_CAP as u32).unwrap();
    let mss_opt = [2u8, 4, 0x05, 0xb4];
    feed(
        &mut stack,
        now,
        &mut app,
        &peer_tcp_frame(PEER_PORT, LISTEN_PORT, 1000, 0, SYN, 65535, &mss_opt, &[]),
    );
    let syn_ack = last_tcp(&mut stack);
    let our_next = syn_ack.seq.wrapping_add(1);
    // The handshake ACK closes the peer window immediately.
    feed(
        &mut stack,
        now,
        &mut app,
        &peer_tcp_frame(PEER_PORT, LISTEN_PORT, 1001, our_next, ACK, 0, &[], &[]),
    );
    let id = app.established[0];

    let mut snd = SendBuf::new();
    stack
        .with_tcp_conn(now, id, |conn| snd.send(conn, b"pent-up"))
        .unwrap();
    assert!(
        sent_frames(&mut stack).is_empty(),
        "no data against a closed window"
    );

    // The persist timer sends a single byte.
    now = now.plus(TCP_PERSIST_TICKS + 1);
    stack.poll(now, &mut app);
    let probe = last_tcp(&mut stack);
    assert_eq!(probe.payload, b"p", "one-byte probe");
    assert_eq!(probe.seq, our_next);

    // The window opens: the probe is acknowledged and the rest flows.
    feed(
        &mut stack,
        now,
        &mut app,
        &peer_tcp_frame(
            PEER_PORT,
            LISTEN_PORT,
            1001,
            our_next.wrapping_add(1),
            ACK,
            65535,
            &[],
            &[],
        ),
    );
    let rest = last_tcp(&mut stack);
    assert_eq!(rest.payload, b"ent-up");
}

#[test]
fn icmp_frag_needed_shrinks_segments() {
    let mut stack = new_stack();
    let mut app = App::new();
    let now = Instant::ZERO;

    let (our_next, _, id) = establish(&mut stack, &mut app, now);

    // Queue more than one MSS worth of data.
    let big = std::vec![0x42u8; 3000];
    let mut snd = SendBuf::new();
    stack
        .with_tcp_conn(now, id, |conn| snd.send(conn, &big))
        .unwrap();
    let frames = sent_frames(&mut stack);
    let first = parse_tcp(&frames[0]);
    assert_eq!(first.payload.len(), 1460, "full-MSS segments before");

    // Router reports a 1400-byte bottleneck for our first segment.
    feed(
        &mut stack,
        now,
        &mut app,
        &icmp_frag_needed_frame(1400, first.sport, first.dport, our_next),
    );
    let retx = last_tcp(&mut stack);
    assert_eq!(retx.seq, our_next, "first unacked segment repacketized");
    assert_eq!(retx.payload.len(), 1400 - 40, "sized to the new path MTU");
}

#[test]
fn peer_reset_aborts_once() {
    let mut stack = new_stack();
    let mut app = App::new();
    let now = Instant::ZERO;

    let (our_next, _, id) = establish(&mut stack, &mut app, now);
    feed(
        &mut stack,
        now,
        &mut app,
        &peer_tcp_frame(PEER_PORT, LISTEN_PORT, 1001, our_next, RST, 0, &[], &[]),
    );
    assert_eq!(app.aborted, std::vec![(id, NetError::ConnectionReset)]);
    assert_eq!(stack.tcp_active_count(), 0);
}

#[test]
fn passive_close_through_last_ack() {
    let mut stack = new_stack();
    let mut app = App::new();
    let now = Instant::ZERO;

    let (our_next, _, id) = establish(&mut stack, &mut app, now);

    // Peer closes first.
    feed(
        &mut stack,
        now,
        &mut app,
        &peer_tcp_frame(PEER_PORT, LISTEN_PORT, 1001, our_next, ACK | FIN, 65535, &[], &[]),
    );
    assert_eq!(app.received, std::vec![(id, 0)], "FIN delivered as EOF");
    let ack = last_tcp(&mut stack);
    assert_eq!(ack.ack, 1002, "FIN occupies one sequence number");

    // We close; the FIN goes out and its ACK finishes the connection.
    stack.tcp_close(now, id).unwrap();
    let fin = last_tcp(&mut stack);
    assert_ne!(fin.flags & FIN, 0);
    assert_eq!(fin.seq, our_next);

    feed(
        &mut stack,
        now,
        &mut app,
        &peer_tcp_frame(
            PEER_PORT,
            LISTEN_PORT,
            1002,
            our_next.wrapping_add(1),
            ACK,
            65535,
            &[],
            &[],
        ),
    );
    assert_eq!(stack.tcp_active_count(), 0, "LAST_ACK resolved");
}

#[test]
fn active_close_lingers_in_time_wait() {
    let mut stack = new_stack();
    let mut app = App::new();
    let mut now = Instant::ZERO;

    let (our_next, _, id) = establish(&mut stack, &mut app, now);

    stack.tcp_close(now, id).unwrap();
    let fin = last_tcp(&mut stack);
    assert_ne!(fin.flags & FIN, 0);

    // Peer ACKs our FIN, then sends its own.
    feed(
        &mut stack,
        now,
        &mut app,
        &peer_tcp_frame(
            PEER_PORT,
            LISTEN_PORT,
            1001,
            our_next.wrapping_add(1),
            ACK,
            65535,
            &[],
            &[],
        ),
    );
    feed(
        &mut stack,
        now,
        &mut app,
        &peer_tcp_frame(
            PEER_PORT,
            LISTEN_PORT,
            1001,
            our_next.wrapping_add(1),
            ACK | FIN,
            65535,
            &[],
            &[],
        ),
    );
    let ack = last_tcp(&mut stack);
    assert_eq!(ack.ack, 1002);
    assert_eq!(stack.tcp_active_count(), 1, "lingering in TIME_WAIT");

    // The 2MSL linger releases the slot.
    now = now.plus(TCP_TIME_WAIT_TICKS + 1);
    stack.poll(now, &mut app);
    assert_eq!(stack.tcp_active_count(), 0);
}

#[test]
fn connect_waits_for_arp_then_retransmits_syn() {
    let mut stack = new_stack();
    let mut app = App::new();
    let mut now = Instant::ZERO;

    let id = stack
        .tcp_connect(now, PEER_IP, Port(PEER_PORT), RECV_CAP as u32)
        .expect("connect");

    // The SYN could not go out; an ARP query did instead.
    let frames = sent_frames(&mut stack);
    assert_eq!(frames.len(), 1);
    assert_eq!(crate::testutil::eth_ethertype(&frames[0]), crate::ETHERTYPE_ARP);

    // The peer answers ARP; the SYN retransmission then reaches the wire
    // with the learned destination MAC.
    feed(&mut stack, now, &mut app, &arp_reply_frame(PEER_IP, PEER_MAC, OUR_IP));
    now = now.plus(ticks_from_secs(2));
    stack.poll(now, &mut app);
    let frames = sent_frames(&mut stack);
    let syn = parse_tcp(frames.last().unwrap());
    assert_ne!(syn.flags & SYN, 0);
    assert_eq!(eth_dst(frames.last().unwrap()), PEER_MAC);
    assert_eq!(syn.dst_ip, PEER_IP);

    // Complete the handshake for good measure.
    let syn_view = syn;
    feed(
        &mut stack,
        now,
        &mut app,
        &peer_tcp_frame(
            PEER_PORT,
            syn_view.sport,
            7000,
            syn_view.seq.wrapping_add(1),
            SYN | ACK,
            65535,
            &[2, 4, 0x05, 0xb4],
            &[],
        ),
    );
    assert_eq!(app.established, std::vec![id]);
    let ack = last_tcp(&mut stack);
    assert_eq!(ack.ack, 7001);
}

#[test]
fn window_update_announced_after_recv_space_grows() {
    let mut stack = new_stack();
    let mut app = App::new();
    let now = Instant::ZERO;

    let (our_next, _, id) = establish(&mut stack, &mut app, now);

    // Fill a good chunk of the receive buffer.
    let chunk = std::vec![7u8; 2048];
    feed(
        &mut stack,
        now,
        &mut app,
        &peer_tcp_frame(
            PEER_PORT,
            LISTEN_PORT,
            1001,
            our_next,
            ACK,
            65535,
            &[],
            &chunk,
        ),
    );
    let ack = last_tcp(&mut stack);
    assert_eq!(ack.ack, 1001 + 2048);
    assert_eq!(ack.wnd as usize, RECV_CAP - 2048);

    // The application consumes everything and attaches a fresh buffer:
    // the reopened window is worth a wakeup, so an update goes out.
    let mut fresh_store = [0u8; RECV_CAP];
    let fresh_node = BufNode::from_slice_mut(&mut fresh_store);
    stack
        .with_tcp_conn(now, id, |conn| {
            conn.set_recv_buf(BufRef::new(&fresh_node, 0, RECV_CAP))
        })
        .unwrap();
    let upd = last_tcp(&mut stack);
    assert_eq!(upd.wnd as usize, RECV_CAP);
}
