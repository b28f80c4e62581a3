//! The TCP endpoint engine: per-connection state, segment output,
//! retransmission, congestion control, and user event delivery.
//!
//! A connection lives in a [`TcpPcb`] slot owned by the
//! [`TcpStack`](crate::tcp_stack::TcpStack) slab.  Segment *input* is
//! driven from `tcp_stack`; this module owns the PCB data model, the
//! output engine, the single per-connection timer, and the user-facing
//! [`TcpEvents`] / [`TcpConn`] surface.
//!
//! # Buffers
//!
//! Both directions use caller-owned buffer chains referenced by `BufRef`:
//!
//! - `snd.buf` covers the unacknowledged-and-unsent data starting at
//!   `snd.una`; `snd.buf_cur` is the unsent tail of the same chain
//!   starting at `snd.nxt`.  ACKs advance `buf`; transmission advances
//!   `buf_cur`; retransmission reads from the front of `buf` without
//!   touching either.
//! - `rcv.buf` is the space the application has granted for incoming
//!   data, starting at `rcv.nxt`.  In-order data is written through and
//!   consumes the reference; out-of-order data is written at its proper
//!   offset through a copy of the reference, with the ranges tracked in
//!   the [`TcpOosBuffer`].
//!
//! The chains must stay valid while the PCB references them; the
//! application is told what was consumed through the event callbacks.
//!
//! # Timer
//!
//! One timer per connection, interpreted by state: handshake or data
//! retransmission, zero-window probe (`PROBE` flag), or TIME_WAIT linger.
//!
//! # Callbacks
//!
//! Events for one connection are delivered in arrival order.  A callback
//! may call [`TcpConn::abort`]; teardown is then deferred until the
//! callback chain unwinds (`IN_CALLBACK`/`ABORT_PENDING` flags).

use bitflags::bitflags;
use fathom_lib::clock::Instant;
use fathom_lib::timer_queue::TimerQueue;
use log::trace;

use crate::buf::{BufNode, BufRef, TxFrame};
use crate::config::{
    DEFAULT_TTL, NUM_TIMERS, TCP_MAX_RETRANSMITS, TCP_MAX_RTO_TICKS, TCP_PERSIST_TICKS,
};
use crate::eth::{EthAdapter, EthDriver};
use crate::ipv4::{DgramMeta, IfaceConfig, Ipv4Engine, send_dgram};
use crate::pmtu::{MtuRef, PmtuCache};
use crate::stack::TimerKind;
use crate::tcp::{
    MAX_OPTIONS_WRITE_LEN, PcbKey, SeqNum, TcpFlags, TcpHeader, TcpOptions, TcpState,
    calc_options_len, segment_checksum, seq_add, seq_diff, write_header, write_options,
};
use crate::tcp_oos::TcpOosBuffer;
use crate::types::{IpProtocol, NetError};
use crate::{ETH_HEADER_LEN, IPV4_HEADER_LEN, TCP_HEADER_LEN, TCP_HEADER_MAX_LEN};

/// TX staging: room for all three headers; payload is chained, not staged.
const TCP_TX_STAGE: usize = ETH_HEADER_LEN + IPV4_HEADER_LEN + TCP_HEADER_MAX_LEN;

/// Headroom a TCP segment reserves in front of its TCP header.
const TCP_HEADROOM: usize = ETH_HEADER_LEN + IPV4_HEADER_LEN;

/// IP + minimal TCP header overhead, for MSS <-> MTU conversion.
pub(crate) const IP_TCP_OVERHEAD: u16 = (IPV4_HEADER_LEN + TCP_HEADER_LEN) as u16;

// =============================================================================
// Identifiers and context
// =============================================================================

/// Stable handle to a connection slot: slab index plus generation.
///
/// The generation distinguishes reincarnations of a slot so stale handles
/// (and stale timer keys) can be recognized.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ConnId {
    pub(crate) idx: u8,
    pub(crate) generation: u8,
}

impl ConnId {
    #[inline]
    pub(crate) fn to_key(self) -> u32 {
        (self.idx as u32) | ((self.generation as u32) << 8)
    }

    #[inline]
    pub(crate) fn from_key(key: u32) -> Self {
        Self {
            idx: (key & 0xff) as u8,
            generation: ((key >> 8) & 0xff) as u8,
        }
    }
}

/// Listener handle.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ListenerId(pub(crate) u8);

/// The transmit-side environment threaded through TCP processing: the
/// interface, the IP engine, the PMTU cache, the shared timer queue and
/// the current time.
pub struct TcpCtx<'a, D: EthDriver> {
    pub eth: &'a mut EthAdapter<D>,
    pub iface: &'a IfaceConfig,
    pub ip: &'a mut Ipv4Engine,
    pub pmtu: &'a mut PmtuCache,
    pub timers: &'a mut TimerQueue<TimerKind, NUM_TIMERS>,
    pub now: Instant,
}

// =============================================================================
// PCB state
// =============================================================================

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub(crate) struct PcbFlags: u16 {
        /// An ACK is owed to the peer.
        const ACK_PENDING = 1 << 0;
        /// The application closed the send side; FIN waits to go out.
        const FIN_QUEUED = 1 << 1;
        /// Our FIN has been transmitted (occupies `snd.nxt - 1`).
        const FIN_SENT = 1 << 2;
        /// An RTT measurement is running for `snd.rtt_seq`.
        const RTT_PENDING = 1 << 3;
        /// The per-connection timer is armed as a zero-window probe.
        const PROBE = 1 << 4;
        /// The application requested a push of the buffered data.
        const PSH_QUEUED = 1 << 5;
        /// Callback chain in progress; teardown must be deferred.
        const IN_CALLBACK = 1 << 6;
        /// Abort requested from within a callback.
        const ABORT_PENDING = 1 << 7;
        /// Window scaling negotiated (the peer offered the option).
        const WND_SCALE = 1 << 8;
    }
}

/// Send-direction state.
#[derive(Default)]
pub(crate) struct SndState {
    /// Oldest unacknowledged sequence number.
    pub una: SeqNum,
    /// Next sequence number to send.
    pub nxt: SeqNum,
    /// Peer receive window (scaled).
    pub wnd: u32,
    /// Segment/ack that last updated `wnd`.
    pub wl1: SeqNum,
    pub wl2: SeqNum,
    /// Negotiated MSS (before PMTU capping).
    pub base_mss: u16,
    /// Peer window-scale shift, 0 unless negotiated.
    pub wnd_shift: u8,
    /// Congestion window and slow-start threshold, bytes.
    pub cwnd: u32,
    pub ssthresh: u32,
    /// RTO in ticks; smoothed RTT (x8) and variance (x4) per RFC 6298.
    pub rto: u32,
    pub srtt: u32,
    pub rttvar: u32,
    pub rtt_seq: SeqNum,
    pub rtt_start: Instant,
    pub retx_count: u8,
    /// Unacknowledged-and-unsent data, from `una`.
    pub buf: BufRef,
    /// Unsent tail of the same chain, from `nxt`.
    pub buf_cur: BufRef,
}

/// Receive-direction state.
#[derive(Default)]
pub(crate) struct RcvState {
    /// Next expected sequence number.
    pub nxt: SeqNum,
    /// Window still promised to the peer, measured from `nxt`.
    pub ann_wnd: u32,
    /// Application-granted space for incoming data, from `nxt`.
    pub buf: BufRef,
    /// Window announced while no buffer is attached (handshake).
    pub init_wnd: u32,
}

/// One connection slot.
pub struct TcpPcb {
    pub(crate) key: PcbKey,
    pub(crate) state: TcpState,
    pub(crate) flags: PcbFlags,
    pub(crate) snd: SndState,
    pub(crate) rcv: RcvState,
    pub(crate) ooseq: TcpOosBuffer,
    pub(crate) mtu_ref: MtuRef,
    /// This slot's identity (index + generation).
    pub(crate) id: ConnId,
    /// Listener that spawned this connection, if passive.
    pub(crate) listener: Option<u8>,
    /// Still held by the listen queue (not yet accepted by the user).
    pub(crate) queued: bool,
    /// Queue entry index while `queued`.
    pub(crate) queue_entry: u8,
}

impl TcpPcb {
    pub(crate) fn new_closed(idx: u8) -> Self {
        Self {
            key: PcbKey::default(),
            state: TcpState::Closed,
            flags: PcbFlags::empty(),
            snd: SndState::default(),
            rcv: RcvState::default(),
            ooseq: TcpOosBuffer::new(),
            mtu_ref: MtuRef::new(),
            id: ConnId { idx, generation: 0 },
            listener: None,
            queued: false,
            queue_entry: 0,
        }
    }

    /// Sequence-space in flight (data plus SYN/FIN in progress).
    #[inline]
    pub(crate) fn in_flight(&self) -> u32 {
        seq_diff(self.snd.nxt, self.snd.una)
    }

    /// Effective send MSS: the negotiated MSS capped by the current path
    /// MTU estimate.
    pub(crate) fn eff_snd_mss(&self, pmtu: &PmtuCache) -> u16 {
        let base = self.snd.base_mss;
        if self.mtu_ref.is_setup() {
            let by_pmtu = self.mtu_ref.get_pmtu(pmtu).saturating_sub(IP_TCP_OVERHEAD);
            base.min(by_pmtu).max(1)
        } else {
            base.max(1)
        }
    }

    /// Receive window to announce right now: the application-granted
    /// space, or the configured initial window while no buffer is
    /// attached yet (handshake).
    pub(crate) fn rcv_wnd_to_announce(&self) -> u32 {
        if self.state.is_synsent_or_synrcvd() {
            self.rcv.init_wnd
        } else {
            self.rcv.buf.total_len() as u32
        }
    }

    /// Window field value for an outgoing segment (we announce unscaled).
    pub(crate) fn wnd_field(&self) -> u16 {
        self.rcv_wnd_to_announce().min(0xffff) as u16
    }
}

// =============================================================================
// User surface
// =============================================================================

/// Operations available on a live connection, both from application code
/// between polls and from within event callbacks.
pub struct TcpConn<'a, 'c, D: EthDriver> {
    pub(crate) pcb: &'a mut TcpPcb,
    pub(crate) ctx: &'a mut TcpCtx<'c, D>,
}

impl<'a, 'c, D: EthDriver> TcpConn<'a, 'c, D> {
    pub fn id(&self) -> ConnId {
        self.pcb.id
    }

    pub fn state_name(&self) -> &'static str {
        self.pcb.state.name()
    }

    /// Attach the send buffer chain.  Only valid while nothing is pending.
    pub fn set_send_buf(&mut self, buf: BufRef) {
        debug_assert!(self.pcb.snd.buf.total_len() == 0);
        self.pcb.snd.buf = buf;
        self.pcb.snd.buf_cur = buf;
    }

    /// The application appended `amount` bytes to its send chain.
    /// Triggers output.
    pub fn extend_send_buf(&mut self, amount: usize) {
        self.pcb.snd.buf = grow(self.pcb.snd.buf, amount);
        self.pcb.snd.buf_cur = grow(self.pcb.snd.buf_cur, amount);
        pcb_output(self.pcb, self.ctx);
    }

    /// Request a push: buffered data goes out now, tail segment flagged
    /// PSH.
    pub fn push(&mut self) {
        self.pcb.flags |= PcbFlags::PSH_QUEUED;
        pcb_output(self.pcb, self.ctx);
    }

    /// Bytes accepted but not yet acknowledged by the peer.
    pub fn snd_pending(&self) -> usize {
        self.pcb.snd.buf.total_len()
    }

    /// Attach the receive buffer chain (space from `rcv.nxt` on).
    /// Announces the window when the new space is worth announcing.
    pub fn set_recv_buf(&mut self, buf: BufRef) {
        self.pcb.rcv.buf = buf;
        maybe_announce_window(self.pcb, self.ctx);
    }

    /// The application made `amount` more bytes of receive space
    /// available.  Sends a window update when the opening is worth
    /// announcing (silly-window avoidance).
    pub fn extend_recv_buf(&mut self, amount: usize) {
        self.pcb.rcv.buf = grow(self.pcb.rcv.buf, amount);
        maybe_announce_window(self.pcb, self.ctx);
    }

    pub fn recv_buf(&self) -> BufRef {
        self.pcb.rcv.buf
    }

    /// Close the send direction: a FIN goes out after all buffered data.
    pub fn close_send(&mut self) {
        if !self.pcb.state.snd_open() || self.pcb.flags.contains(PcbFlags::FIN_QUEUED) {
            return;
        }
        self.pcb.flags |= PcbFlags::FIN_QUEUED;
        self.pcb.state = match self.pcb.state {
            TcpState::Established => TcpState::FinWait1,
            TcpState::CloseWait => TcpState::LastAck,
            s => s,
        };
        pcb_output(self.pcb, self.ctx);
    }

    /// Abort: sends an RST now; the slot teardown is deferred until the
    /// current callback chain unwinds.
    pub fn abort(&mut self) {
        self.pcb.flags |= PcbFlags::ABORT_PENDING;
        send_rst_for_pcb(self.pcb, self.ctx);
    }
}

/// Extend a buffer reference by `amount` bytes (the underlying chain
/// already holds them).
fn grow(buf: BufRef, amount: usize) -> BufRef {
    let mut b = buf;
    b.extend(amount);
    b
}

/// Application-facing event sink.
///
/// Within one connection, callbacks arrive in order.  `data_received`
/// with `amount == 0` signals the peer's FIN (end of stream).
pub trait TcpEvents<D: EthDriver> {
    /// A connection finished its handshake: an active open succeeded, or
    /// a direct (unqueued) listener produced a connection.
    fn connection_established(&mut self, conn: TcpConn<'_, '_, D>);

    /// `amount` bytes were written into the receive buffer (0 = FIN).
    fn data_received(&mut self, conn: TcpConn<'_, '_, D>, amount: usize);

    /// `amount` bytes were acknowledged and released from the send chain.
    fn data_sent(&mut self, conn: TcpConn<'_, '_, D>, amount: usize);

    /// Terminal failure: RST, retransmission timeout, or local abort.
    /// Delivered exactly once; the slot is gone afterwards.
    fn connection_aborted(&mut self, id: ConnId, err: NetError);

    /// A queued listener has a ready connection to accept.
    fn listen_ready(&mut self, listener: ListenerId);
}

// =============================================================================
// Segment transmission
// =============================================================================

/// Build and transmit one TCP segment.
pub(crate) fn send_segment<D: EthDriver>(
    ctx: &mut TcpCtx<'_, D>,
    key: &PcbKey,
    seq: SeqNum,
    ack: SeqNum,
    wnd: u16,
    flags: TcpFlags,
    opts: Option<&TcpOptions>,
    payload: BufRef,
) -> Result<(), NetError> {
    let opts_len = opts.map_or(0, calc_options_len);
    debug_assert!(opts_len <= MAX_OPTIONS_WRITE_LEN);
    let hdr_len = TCP_HEADER_LEN + opts_len;

    let mut frame = TxFrame::<TCP_TX_STAGE>::new(TCP_HEADROOM, hdr_len);
    {
        let staged = frame.staged_mut();
        write_header(
            staged,
            &TcpHeader {
                src_port: key.local_port,
                dst_port: key.remote_port,
                seq_num: seq,
                ack_num: ack,
                header_len: hdr_len,
                flags,
                window_size: wnd,
                urgent_ptr: 0,
            },
        );
        if let Some(o) = opts {
            write_options(o, &mut staged[TCP_HEADER_LEN..hdr_len]);
        }
    }

    let data_len = payload.total_len();
    let data_node;
    let mut node = BufNode::empty();
    let seg = if data_len > 0 {
        data_node = payload.to_node();
        frame.buf_ref(&mut node, Some((&data_node, data_len)))
    } else {
        frame.buf_ref(&mut node, None)
    };

    let csum = segment_checksum(key.local_addr, key.remote_addr, seg, hdr_len + data_len);
    frame.staged_mut()[16..18].copy_from_slice(&csum.to_be_bytes());

    let meta = DgramMeta {
        src: key.local_addr,
        dst: key.remote_addr,
        protocol: IpProtocol::Tcp.as_u8(),
        ttl: DEFAULT_TTL,
        tos: 0,
        dont_fragment: true,
    };
    send_dgram(ctx.ip, ctx.eth, ctx.iface, &meta, seg)
}

/// Send a bare ACK reflecting the current receive state.
pub(crate) fn send_ack<D: EthDriver>(pcb: &mut TcpPcb, ctx: &mut TcpCtx<'_, D>) {
    let wnd = pcb.wnd_field();
    let r = send_segment(
        ctx,
        &pcb.key,
        pcb.snd.nxt,
        pcb.rcv.nxt,
        wnd,
        TcpFlags::ACK,
        None,
        BufRef::empty(),
    );
    if r.is_ok() {
        pcb.rcv.ann_wnd = wnd as u32;
        pcb.flags.remove(PcbFlags::ACK_PENDING);
    }
}

/// Send an RST appropriate to the connection's current state.
pub(crate) fn send_rst_for_pcb<D: EthDriver>(pcb: &TcpPcb, ctx: &mut TcpCtx<'_, D>) {
    let _ = send_segment(
        ctx,
        &pcb.key,
        pcb.snd.nxt,
        pcb.rcv.nxt,
        0,
        TcpFlags::RST | TcpFlags::ACK,
        None,
        BufRef::empty(),
    );
}

// =============================================================================
// Window announcements
// =============================================================================

/// Announce an opened window when the opening passes the silly-window
/// threshold `min(MSS, buffer/2)`.
pub(crate) fn maybe_announce_window<D: EthDriver>(pcb: &mut TcpPcb, ctx: &mut TcpCtx<'_, D>) {
    if !pcb.state.is_active() {
        return;
    }
    let new_wnd = pcb.rcv_wnd_to_announce();
    let old = pcb.rcv.ann_wnd;
    if new_wnd <= old {
        return;
    }
    let thresh = (pcb.eff_snd_mss(ctx.pmtu) as u32).min(new_wnd / 2).max(1);
    if new_wnd - old >= thresh {
        send_ack(pcb, ctx);
    }
}

// =============================================================================
// Output engine
// =============================================================================

/// Transmit as much pending data (and FIN) as windows permit.
pub(crate) fn pcb_output<D: EthDriver>(pcb: &mut TcpPcb, ctx: &mut TcpCtx<'_, D>) {
    if !pcb.state.can_output() {
        return;
    }

    let eff_mss = pcb.eff_snd_mss(ctx.pmtu) as u32;

    loop {
        let in_flight = pcb.in_flight();
        let unsent = pcb.snd.buf_cur.total_len();
        let fin_wanted = pcb.flags.contains(PcbFlags::FIN_QUEUED)
            && !pcb.flags.contains(PcbFlags::FIN_SENT);

        if unsent == 0 && !fin_wanted {
            break;
        }

        let wnd_limit = pcb.snd.wnd.min(pcb.snd.cwnd).saturating_sub(in_flight);
        if wnd_limit == 0 && unsent > 0 {
            if pcb.snd.wnd == 0 && in_flight == 0 {
                // Peer closed its window: fall back to probing.
                arm_persist(pcb, ctx);
            }
            break;
        }

        let seg_len = (unsent as u32).min(wnd_limit).min(eff_mss) as usize;

        // Nagle: hold a sub-MSS tail while anything is in flight, unless
        // the application asked for a push or a FIN is going out.
        if seg_len == unsent
            && (seg_len as u32) < eff_mss
            && in_flight > 0
            && !pcb.flags.contains(PcbFlags::PSH_QUEUED)
            && !fin_wanted
        {
            break;
        }

        if seg_len == 0 && !(fin_wanted && unsent == 0) {
            break;
        }

        let is_tail = seg_len == unsent;
        let fin_now = fin_wanted && is_tail;

        let mut flags = TcpFlags::ACK;
        if fin_now {
            flags |= TcpFlags::FIN;
        }
        if is_tail && (pcb.flags.contains(PcbFlags::PSH_QUEUED) || fin_now) && seg_len > 0 {
            flags |= TcpFlags::PSH;
        }

        let payload = pcb.snd.buf_cur.sub_to(seg_len);
        let seq = pcb.snd.nxt;
        let wnd = pcb.wnd_field();
        if send_segment(ctx, &pcb.key, seq, pcb.rcv.nxt, wnd, flags, None, payload).is_err() {
            // Out of buffers or resolution pending; the retransmission
            // timer recovers.
            break;
        }
        pcb.rcv.ann_wnd = wnd as u32;
        pcb.flags.remove(PcbFlags::ACK_PENDING);

        pcb.snd.buf_cur.skip_bytes(seg_len);
        pcb.snd.nxt = seq_add(pcb.snd.nxt, seg_len as u32 + fin_now as u32);
        if fin_now {
            pcb.flags |= PcbFlags::FIN_SENT;
        }
        if is_tail {
            pcb.flags.remove(PcbFlags::PSH_QUEUED);
        }

        // Start an RTT measurement on a fresh data segment (Karn's rule:
        // never on retransmits, which clear RTT_PENDING).
        if seg_len > 0 && !pcb.flags.contains(PcbFlags::RTT_PENDING) {
            pcb.flags |= PcbFlags::RTT_PENDING;
            pcb.snd.rtt_seq = seq;
            pcb.snd.rtt_start = ctx.now;
        }

        arm_rtx(pcb, ctx);

        if fin_now && unsent == 0 {
            break;
        }
    }

    if pcb.flags.contains(PcbFlags::ACK_PENDING) {
        send_ack(pcb, ctx);
    }
}

fn arm_rtx<D: EthDriver>(pcb: &mut TcpPcb, ctx: &mut TcpCtx<'_, D>) {
    pcb.flags.remove(PcbFlags::PROBE);
    ctx.timers
        .arm(ctx.now, pcb.snd.rto, TimerKind::TcpPcb, pcb.id.to_key());
}

fn arm_persist<D: EthDriver>(pcb: &mut TcpPcb, ctx: &mut TcpCtx<'_, D>) {
    if pcb.flags.contains(PcbFlags::PROBE)
        && ctx.timers.is_armed(TimerKind::TcpPcb, pcb.id.to_key())
    {
        return;
    }
    pcb.flags |= PcbFlags::PROBE;
    ctx.timers
        .arm(ctx.now, TCP_PERSIST_TICKS, TimerKind::TcpPcb, pcb.id.to_key());
}

// =============================================================================
// Timer expiry
// =============================================================================

/// Outcome of a per-connection timer expiry, applied by the caller.
pub(crate) enum TimerVerdict {
    /// Nothing further.
    Done,
    /// Retransmission budget exhausted; abort with the given error.
    Abort(NetError),
    /// TIME_WAIT linger finished; free the slot silently.
    Free,
}

/// Handle the single per-connection timer.
pub(crate) fn on_pcb_timer<D: EthDriver>(pcb: &mut TcpPcb, ctx: &mut TcpCtx<'_, D>) -> TimerVerdict {
    match pcb.state {
        TcpState::Closed => TimerVerdict::Done,
        TcpState::TimeWait | TcpState::FinWait2TimeWait => TimerVerdict::Free,
        TcpState::SynSent => retransmit_handshake(pcb, ctx, false),
        TcpState::SynRcvd => retransmit_handshake(pcb, ctx, true),
        _ => {
            if pcb.flags.contains(PcbFlags::PROBE) {
                send_zero_window_probe(pcb, ctx);
                TimerVerdict::Done
            } else if pcb.in_flight() > 0 {
                retransmit_data(pcb, ctx)
            } else {
                TimerVerdict::Done
            }
        }
    }
}

fn backoff_rto(pcb: &mut TcpPcb) {
    pcb.snd.rto = (pcb.snd.rto * 2).min(TCP_MAX_RTO_TICKS);
}

fn retransmit_handshake<D: EthDriver>(
    pcb: &mut TcpPcb,
    ctx: &mut TcpCtx<'_, D>,
    syn_ack: bool,
) -> TimerVerdict {
    if pcb.snd.retx_count >= TCP_MAX_RETRANSMITS {
        return TimerVerdict::Abort(NetError::Timeout);
    }
    pcb.snd.retx_count += 1;
    backoff_rto(pcb);
    trace!(
        "tcp: {} retransmit #{} to {}:{}",
        if syn_ack { "SYN-ACK" } else { "SYN" },
        pcb.snd.retx_count,
        pcb.key.remote_addr,
        pcb.key.remote_port
    );
    send_syn(pcb, ctx, syn_ack);
    ctx.timers
        .arm(ctx.now, pcb.snd.rto, TimerKind::TcpPcb, pcb.id.to_key());
    TimerVerdict::Done
}

fn retransmit_data<D: EthDriver>(pcb: &mut TcpPcb, ctx: &mut TcpCtx<'_, D>) -> TimerVerdict {
    if pcb.snd.retx_count >= TCP_MAX_RETRANSMITS {
        return TimerVerdict::Abort(NetError::Timeout);
    }
    pcb.snd.retx_count += 1;

    // RFC 5681 on loss: collapse cwnd, halve the flight into ssthresh.
    let eff_mss = pcb.eff_snd_mss(ctx.pmtu) as u32;
    let in_flight = pcb.in_flight();
    pcb.snd.ssthresh = (in_flight / 2).max(2 * eff_mss);
    pcb.snd.cwnd = eff_mss;
    backoff_rto(pcb);
    pcb.flags.remove(PcbFlags::RTT_PENDING);

    retransmit_first_segment(pcb, ctx);

    ctx.timers
        .arm(ctx.now, pcb.snd.rto, TimerKind::TcpPcb, pcb.id.to_key());
    TimerVerdict::Done
}

/// Resend the first unacknowledged segment.  Also used when the path MTU
/// drops, to immediately repacketize.
pub(crate) fn retransmit_first_segment<D: EthDriver>(pcb: &mut TcpPcb, ctx: &mut TcpCtx<'_, D>) {
    let eff_mss = pcb.eff_snd_mss(ctx.pmtu) as usize;
    let fin_in_flight = pcb.flags.contains(PcbFlags::FIN_SENT);
    let data_in_flight = (pcb.in_flight() as usize).saturating_sub(fin_in_flight as usize);
    let sendable = pcb.snd.buf.total_len().min(data_in_flight);
    let seg_len = sendable.min(eff_mss);
    let covers_fin = fin_in_flight && seg_len == data_in_flight;

    let mut flags = TcpFlags::ACK;
    if covers_fin {
        flags |= TcpFlags::FIN;
    }

    let payload = pcb.snd.buf.sub_to(seg_len);
    let wnd = pcb.wnd_field();
    let _ = send_segment(
        ctx,
        &pcb.key,
        pcb.snd.una,
        pcb.rcv.nxt,
        wnd,
        flags,
        None,
        payload,
    );
    pcb.rcv.ann_wnd = wnd as u32;
}

fn send_zero_window_probe<D: EthDriver>(pcb: &mut TcpPcb, ctx: &mut TcpCtx<'_, D>) {
    if pcb.snd.wnd > 0 {
        // Window opened between arming and expiry; resume normal output.
        pcb.flags.remove(PcbFlags::PROBE);
        pcb_output(pcb, ctx);
        return;
    }
    if pcb.snd.buf_cur.total_len() == 0 {
        pcb.flags.remove(PcbFlags::PROBE);
        return;
    }
    trace!(
        "tcp: zero-window probe to {}:{}",
        pcb.key.remote_addr, pcb.key.remote_port
    );
    let payload = pcb.snd.buf_cur.sub_to(1);
    let seq = pcb.snd.nxt;
    let wnd = pcb.wnd_field();
    if send_segment(
        ctx,
        &pcb.key,
        seq,
        pcb.rcv.nxt,
        wnd,
        TcpFlags::ACK | TcpFlags::PSH,
        None,
        payload,
    )
    .is_ok()
    {
        pcb.snd.buf_cur.skip_bytes(1);
        pcb.snd.nxt = seq_add(pcb.snd.nxt, 1);
        pcb.rcv.ann_wnd = wnd as u32;
    }
    ctx.timers
        .arm(ctx.now, TCP_PERSIST_TICKS, TimerKind::TcpPcb, pcb.id.to_key());
}

// =============================================================================
// Handshake segments
// =============================================================================

/// (Re)send the SYN or SYN-ACK for this connection, with MSS and — when
/// the peer offered scaling (or on active open) — the window-scale
/// option.
pub(crate) fn send_syn<D: EthDriver>(pcb: &mut TcpPcb, ctx: &mut TcpCtx<'_, D>, syn_ack: bool) {
    use crate::tcp::OptionFlags;

    let mut opts = TcpOptions {
        options: OptionFlags::MSS,
        wnd_scale: 0,
        mss: (ctx.eth.ip_mtu() as u16).saturating_sub(IP_TCP_OVERHEAD),
    };
    if pcb.flags.contains(PcbFlags::WND_SCALE) || !syn_ack {
        // We always offer scaling on active opens; on a SYN-ACK only in
        // response to an offer.  Our shift is 0 — the receive buffers of
        // this stack fit comfortably in an unscaled window, but echoing
        // the option lets the peer scale its side.
        opts.options |= OptionFlags::WND_SCALE;
        opts.wnd_scale = 0;
    }

    let flags = if syn_ack {
        TcpFlags::SYN | TcpFlags::ACK
    } else {
        TcpFlags::SYN
    };
    let iss = seq_diff(pcb.snd.nxt, 1);
    let ack = if syn_ack { pcb.rcv.nxt } else { 0 };
    let wnd = pcb.rcv.init_wnd.min(0xffff) as u16;
    let _ = send_segment(ctx, &pcb.key, iss, ack, wnd, flags, Some(&opts), BufRef::empty());
    pcb.rcv.ann_wnd = wnd as u32;
}
