//! Connection management: the PCB slab, the 4-tuple index, listeners,
//! ephemeral ports, and segment input processing.
//!
//! All received TCP segments enter through [`input`]: checksum
//! verification, PCB lookup (sorted-array index ordered per
//! [`PcbKey`](crate::tcp::PcbKey)), then either per-connection processing,
//! listener handling for a SYN, or an RST for orphan segments.  The
//! per-connection state machine follows RFC 793 with the transient
//! `FinWait2TimeWait` state for FIN-in-FinWait2 (callbacks run before the
//! PCB officially lingers).

use log::{debug, trace};

use crate::buf::BufRef;
use crate::config::{
    LISTEN_QUEUE_BUF_SIZE, NUM_TCP_LISTENERS, NUM_TCP_PCBS, TCP_INITIAL_RTO_TICKS,
    TCP_MIN_RTO_TICKS, TCP_MAX_RTO_TICKS, TCP_TIME_WAIT_TICKS,
};
use crate::eth::EthDriver;
use crate::ipv4::{Ip4RxInfo, route};
use crate::stack::TimerKind;
use crate::tcp::{
    OptionFlags, PcbKey, SeqNum, TcpFlags, TcpHeader, TcpOptions, TcpState, calc_initial_cwnd,
    calc_snd_mss, in_open_closed_interval, parse_header, parse_options, segment_checksum, seq_add,
    seq_diff, seq_lt2, seq_lte, tcp_seq_len,
};
use crate::tcp_listen_queue::{self, ListenQueue};
use crate::tcp_pcb::{
    ConnId, IP_TCP_OVERHEAD, ListenerId, PcbFlags, TcpConn, TcpCtx, TcpEvents, TcpPcb,
    TimerVerdict, pcb_output, send_ack, send_rst_for_pcb, send_segment, send_syn,
};
use crate::types::{Ipv4Addr, NetError, Port};
use crate::TCP_HEADER_LEN;

/// First ephemeral port (IANA dynamic range).
const EPHEMERAL_BASE: u16 = 49152;

// =============================================================================
// Listener registry
// =============================================================================

#[derive(Clone, Copy)]
pub(crate) struct TcpListener {
    pub active: bool,
    /// Local address to match; `UNSPECIFIED` accepts any local address.
    pub addr: Ipv4Addr,
    pub port: Port,
    /// Whether accepted handshakes are parked in the listen queue.
    pub queued: bool,
    /// Listen-queue aging timeout, ticks.
    pub queue_timeout: u32,
    /// Window announced in the SYN-ACK (queued listeners announce their
    /// queue buffer size).
    pub initial_rcv_wnd: u32,
}

impl TcpListener {
    const fn inactive() -> Self {
        Self {
            active: false,
            addr: Ipv4Addr::UNSPECIFIED,
            port: Port(0),
            queued: false,
            queue_timeout: 0,
            initial_rcv_wnd: 0,
        }
    }
}

// =============================================================================
// Counters
// =============================================================================

#[derive(Clone, Copy, Debug, Default)]
pub struct TcpCounters {
    pub rx_bad_checksum: u32,
    pub rx_malformed: u32,
    pub rx_no_match: u32,
    pub rx_dropped: u32,
    pub rx_rst: u32,
}

// =============================================================================
// TcpStack
// =============================================================================

pub struct TcpStack {
    pub(crate) pcbs: [TcpPcb; NUM_TCP_PCBS],
    /// `(key, pcb index)` sorted by the PcbKey ordering.
    index: [(PcbKey, u8); NUM_TCP_PCBS],
    index_len: usize,
    pub(crate) listeners: [TcpListener; NUM_TCP_LISTENERS],
    pub(crate) queue: ListenQueue,
    next_iss: u32,
    next_ephemeral: u16,
    pub counters: TcpCounters,
}

impl TcpStack {
    pub fn new() -> Self {
        Self {
            pcbs: core::array::from_fn(|i| TcpPcb::new_closed(i as u8)),
            index: [(PcbKey::default(), 0); NUM_TCP_PCBS],
            index_len: 0,
            listeners: [TcpListener::inactive(); NUM_TCP_LISTENERS],
            queue: ListenQueue::new(),
            next_iss: 0x1f2e3d4c,
            next_ephemeral: EPHEMERAL_BASE,
            counters: TcpCounters::default(),
        }
    }

    // =========================================================================
    // Index
    // =========================================================================

    pub(crate) fn lookup(&self, key: &PcbKey) -> Option<usize> {
        self.index[..self.index_len]
            .binary_search_by(|(k, _)| k.cmp(key))
            .ok()
            .map(|pos| self.index[pos].1 as usize)
    }

    fn index_insert(&mut self, key: PcbKey, pcb_idx: usize) {
        debug_assert!(self.index_len < NUM_TCP_PCBS);
        let pos = self.index[..self.index_len]
            .binary_search_by(|(k, _)| k.cmp(&key))
            .unwrap_err();
        self.index
            .copy_within(pos..self.index_len, pos + 1);
        self.index[pos] = (key, pcb_idx as u8);
        self.index_len += 1;
    }

    fn index_remove(&mut self, key: &PcbKey) {
        if let Ok(pos) = self.index[..self.index_len].binary_search_by(|(k, _)| k.cmp(key)) {
            self.index.copy_within(pos + 1..self.index_len, pos);
            self.index_len -= 1;
        }
    }

    // =========================================================================
    // Slab
    // =========================================================================

    fn alloc_pcb(&mut self) -> Option<usize> {
        self.pcbs.iter().position(|p| p.state == TcpState::Closed)
    }

    fn take_iss(&mut self) -> SeqNum {
        // A fixed odd increment spreads initial sequence numbers without
        // needing a clock source.
        self.next_iss = self.next_iss.wrapping_add(0x3d06_1f29);
        self.next_iss
    }

    /// Resolve a [`ConnId`] to a live slot index.
    pub(crate) fn conn_slot(&self, id: ConnId) -> Option<usize> {
        let idx = id.idx as usize;
        if idx < NUM_TCP_PCBS
            && self.pcbs[idx].id == id
            && self.pcbs[idx].state != TcpState::Closed
        {
            Some(idx)
        } else {
            None
        }
    }

    /// Live connections (diagnostics).
    pub fn active_count(&self) -> usize {
        self.pcbs
            .iter()
            .filter(|p| p.state != TcpState::Closed)
            .count()
    }

    // =========================================================================
    // Listeners and ports
    // =========================================================================

    /// Register a listener.  `queue_timeout` is only meaningful for
    /// queued listeners.
    pub(crate) fn listen(
        &mut self,
        addr: Ipv4Addr,
        port: Port,
        queued: bool,
        queue_timeout: u32,
        initial_rcv_wnd: u32,
    ) -> Result<ListenerId, NetError> {
        if self
            .listeners
            .iter()
            .any(|l| l.active && l.port == port && (l.addr == addr || l.addr.is_unspecified()))
        {
            return Err(NetError::AddressInUse);
        }
        let slot = self
            .listeners
            .iter()
            .position(|l| !l.active)
            .ok_or(NetError::OutOfResources)?;
        self.listeners[slot] = TcpListener {
            active: true,
            addr,
            port,
            queued,
            queue_timeout,
            initial_rcv_wnd: if queued {
                LISTEN_QUEUE_BUF_SIZE as u32
            } else {
                initial_rcv_wnd
            },
        };
        debug!("tcp: listening on {}:{} (queued={})", addr, port, queued);
        Ok(ListenerId(slot as u8))
    }

    fn alloc_ephemeral(&mut self, local: Ipv4Addr, remote: Ipv4Addr, rport: Port) -> Option<Port> {
        let span = u16::MAX - EPHEMERAL_BASE;
        for _ in 0..span {
            let port = Port(self.next_ephemeral);
            self.next_ephemeral = if self.next_ephemeral == u16::MAX {
                EPHEMERAL_BASE
            } else {
                self.next_ephemeral + 1
            };
            let key = PcbKey {
                local_addr: local,
                remote_addr: remote,
                local_port: port,
                remote_port: rport,
            };
            let taken = self.lookup(&key).is_some()
                || self.listeners.iter().any(|l| l.active && l.port == port);
            if !taken {
                return Some(port);
            }
        }
        None
    }
}

impl Default for TcpStack {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Teardown
// =============================================================================

/// Return a PCB to the slab: disarm its timer, release its PMTU
/// reference, drop it from the index, free any listen-queue entry, and
/// bump the slot generation.
pub(crate) fn free_pcb<D: EthDriver>(tcp: &mut TcpStack, ctx: &mut TcpCtx<'_, D>, idx: usize) {
    let id = tcp.pcbs[idx].id;
    ctx.timers.disarm(TimerKind::TcpPcb, id.to_key());
    let key = tcp.pcbs[idx].key;
    tcp.index_remove(&key);
    if tcp.pcbs[idx].queued {
        let entry = tcp.pcbs[idx].queue_entry;
        tcp_listen_queue::release_entry(tcp, ctx, entry as usize);
    }
    let pcb = &mut tcp.pcbs[idx];
    pcb.mtu_ref.reset(ctx.pmtu);
    pcb.state = TcpState::Closed;
    pcb.flags = PcbFlags::empty();
    pcb.ooseq.init();
    pcb.snd = Default::default();
    pcb.rcv = Default::default();
    pcb.listener = None;
    pcb.queued = false;
    pcb.id.generation = pcb.id.generation.wrapping_add(1);
    trace!("tcp: slot {} freed", idx);
}

/// Abort a connection: optional RST, teardown, and a single
/// `connection_aborted` notification when the application knows about the
/// connection (it never hears about unaccepted passive opens).
pub(crate) fn abort_pcb<D: EthDriver>(
    tcp: &mut TcpStack,
    ctx: &mut TcpCtx<'_, D>,
    events: &mut dyn TcpEvents<D>,
    idx: usize,
    err: NetError,
    with_rst: bool,
) {
    let id = tcp.pcbs[idx].id;
    let user_knows = user_knows_pcb(&tcp.pcbs[idx]);
    if with_rst {
        send_rst_for_pcb(&tcp.pcbs[idx], ctx);
    }
    free_pcb(tcp, ctx, idx);
    if user_knows {
        events.connection_aborted(id, err);
    }
}

/// Whether the application has been told about this connection: it made
/// it (`connect`) or was handed it (`established` / `accept`).  Queued or
/// still-handshaking passive connections die silently.
fn user_knows_pcb(pcb: &TcpPcb) -> bool {
    if pcb.queued {
        return false;
    }
    match pcb.state {
        TcpState::SynRcvd => pcb.listener.is_none(),
        _ => true,
    }
}

fn enter_time_wait<D: EthDriver>(tcp: &mut TcpStack, ctx: &mut TcpCtx<'_, D>, idx: usize) {
    let pcb = &mut tcp.pcbs[idx];
    pcb.state = TcpState::TimeWait;
    pcb.ooseq.init();
    pcb.flags.remove(PcbFlags::PROBE);
    pcb.mtu_ref.reset(ctx.pmtu);
    ctx.timers.arm(
        ctx.now,
        TCP_TIME_WAIT_TICKS,
        TimerKind::TcpPcb,
        pcb.id.to_key(),
    );
}

// =============================================================================
// Event delivery (deferred-abort aware)
// =============================================================================

/// Run one callback for a live PCB.  Returns `false` when the callback
/// aborted the connection (the slot is already recycled).
fn deliver<D: EthDriver>(
    tcp: &mut TcpStack,
    ctx: &mut TcpCtx<'_, D>,
    events: &mut dyn TcpEvents<D>,
    idx: usize,
    f: impl FnOnce(&mut dyn TcpEvents<D>, TcpConn<'_, '_, D>),
) -> bool {
    tcp.pcbs[idx].flags |= PcbFlags::IN_CALLBACK;
    f(
        events,
        TcpConn {
            pcb: &mut tcp.pcbs[idx],
            ctx: &mut *ctx,
        },
    );
    let flags = &mut tcp.pcbs[idx].flags;
    flags.remove(PcbFlags::IN_CALLBACK);
    if flags.contains(PcbFlags::ABORT_PENDING) {
        // The RST already went out from TcpConn::abort; the application
        // initiated this, so no aborted notification.
        free_pcb(tcp, ctx, idx);
        return false;
    }
    true
}

fn deliver_data_received<D: EthDriver>(
    tcp: &mut TcpStack,
    ctx: &mut TcpCtx<'_, D>,
    events: &mut dyn TcpEvents<D>,
    idx: usize,
    amount: usize,
) -> bool {
    if tcp.pcbs[idx].queued {
        tcp_listen_queue::on_queued_data(tcp, ctx, events, idx, amount)
    } else {
        deliver(tcp, ctx, events, idx, |ev, conn| {
            ev.data_received(conn, amount)
        })
    }
}

// =============================================================================
// Segment input
// =============================================================================

/// Entry point for received TCP segments (post IP validation and
/// reassembly).
pub(crate) fn input<D: EthDriver>(
    tcp: &mut TcpStack,
    ctx: &mut TcpCtx<'_, D>,
    events: &mut dyn TcpEvents<D>,
    rx: Ip4RxInfo,
    dgram: BufRef,
) {
    // Header must be contiguous; parse and verify the checksum over the
    // whole segment.
    if !dgram.has_header(TCP_HEADER_LEN) {
        tcp.counters.rx_malformed += 1;
        return;
    }
    let Some(hdr) = parse_header(dgram.chunk()) else {
        tcp.counters.rx_malformed += 1;
        return;
    };
    if !dgram.has_header(hdr.header_len) {
        tcp.counters.rx_malformed += 1;
        return;
    }
    if segment_checksum(rx.src, rx.dst, dgram, dgram.total_len()) != 0 {
        trace!("tcp: bad checksum from {}", rx.src);
        tcp.counters.rx_bad_checksum += 1;
        return;
    }

    let opts_buf = dgram.sub_from_to(TCP_HEADER_LEN, hdr.header_len - TCP_HEADER_LEN);
    let data = dgram.hide_header(hdr.header_len);

    let key = PcbKey {
        local_addr: rx.dst,
        remote_addr: rx.src,
        local_port: hdr.dst_port,
        remote_port: hdr.src_port,
    };

    if let Some(idx) = tcp.lookup(&key) {
        pcb_input(tcp, ctx, events, idx, &hdr, opts_buf, data);
        return;
    }

    if hdr.flags.contains(TcpFlags::SYN)
        && !hdr.flags.intersects(TcpFlags::ACK | TcpFlags::RST)
    {
        listener_input(tcp, ctx, &key, &hdr, opts_buf);
        return;
    }

    tcp.counters.rx_no_match += 1;
    rst_for_orphan(ctx, &key, &hdr, data.total_len());
}

/// RST in response to a segment that matches no connection.
fn rst_for_orphan<D: EthDriver>(
    ctx: &mut TcpCtx<'_, D>,
    key: &PcbKey,
    hdr: &TcpHeader,
    data_len: usize,
) {
    if hdr.flags.contains(TcpFlags::RST) {
        return;
    }
    let (seq, ack, flags) = if hdr.flags.contains(TcpFlags::ACK) {
        (hdr.ack_num, 0, TcpFlags::RST)
    } else {
        let ack = seq_add(hdr.seq_num, tcp_seq_len(hdr.flags, data_len) as u32);
        (0, ack, TcpFlags::RST | TcpFlags::ACK)
    };
    let _ = send_segment(ctx, key, seq, ack, 0, flags, None, BufRef::empty());
}

// -----------------------------------------------------------------------------
// Passive open
// -----------------------------------------------------------------------------

fn listener_input<D: EthDriver>(
    tcp: &mut TcpStack,
    ctx: &mut TcpCtx<'_, D>,
    key: &PcbKey,
    hdr: &TcpHeader,
    opts_buf: BufRef,
) {
    // Listeners match unicast traffic to our address only.
    if !ctx.iface.is_local_dst(key.local_addr) || key.local_addr != ctx.iface.addr {
        return;
    }
    let listener_idx = match tcp.listeners.iter().position(|l| {
        l.active && l.port == key.local_port && (l.addr.is_unspecified() || l.addr == key.local_addr)
    }) {
        Some(i) => i,
        None => {
            tcp.counters.rx_no_match += 1;
            rst_for_orphan(ctx, key, hdr, 0);
            return;
        }
    };

    let mut opts = TcpOptions::default();
    parse_options(opts_buf, &mut opts);

    let iface_mss = (ctx.eth.ip_mtu() as u16).saturating_sub(IP_TCP_OVERHEAD);
    let Some(snd_mss) = calc_snd_mss(iface_mss, &opts) else {
        // Degenerate MSS: refuse the connection outright.
        debug!("tcp: refusing SYN from {} (MSS below floor)", key.remote_addr);
        rst_for_orphan(ctx, key, hdr, 0);
        return;
    };

    let listener = tcp.listeners[listener_idx];
    if listener.queued && !tcp.queue.has_room(listener_idx) {
        // Queue full: drop the SYN, the peer retries while slots age out.
        trace!("tcp: listen queue full on port {}", listener.port);
        tcp.counters.rx_dropped += 1;
        return;
    }
    let Some(idx) = tcp.alloc_pcb() else {
        trace!("tcp: PCB slab exhausted, dropping SYN");
        tcp.counters.rx_dropped += 1;
        return;
    };

    let iss = tcp.take_iss();
    {
        let pcb = &mut tcp.pcbs[idx];
        pcb.key = *key;
        pcb.state = TcpState::SynRcvd;
        pcb.listener = Some(listener_idx as u8);
        pcb.queued = listener.queued;
        pcb.snd.una = iss;
        pcb.snd.nxt = seq_add(iss, 1);
        pcb.snd.base_mss = snd_mss;
        pcb.snd.wnd = hdr.window_size as u32;
        pcb.snd.wl1 = hdr.seq_num;
        pcb.snd.wl2 = iss;
        pcb.snd.cwnd = calc_initial_cwnd(snd_mss);
        pcb.snd.ssthresh = u32::MAX;
        pcb.snd.rto = TCP_INITIAL_RTO_TICKS;
        if opts.options.contains(OptionFlags::WND_SCALE) {
            pcb.flags |= PcbFlags::WND_SCALE;
            pcb.snd.wnd_shift = opts.wnd_scale.min(14);
        }
        pcb.rcv.nxt = seq_add(hdr.seq_num, 1);
        pcb.rcv.init_wnd = listener.initial_rcv_wnd;
    }
    tcp.index_insert(*key, idx);

    // A PMTU reference from the start; without one the MSS simply stays
    // uncapped at the negotiated value.
    let iface_mtu = ctx.eth.ip_mtu() as u16;
    let (mtu_ref, pmtu) = (&mut tcp.pcbs[idx].mtu_ref, &mut *ctx.pmtu);
    let _ = mtu_ref.setup(pmtu, key.remote_addr, ctx.iface, iface_mtu);

    debug!(
        "tcp: SYN from {}:{} -> SYN_RCVD (slot {})",
        key.remote_addr, key.remote_port, idx
    );
    send_syn(&mut tcp.pcbs[idx], ctx, true);
    let id_key = tcp.pcbs[idx].id.to_key();
    ctx.timers
        .arm(ctx.now, TCP_INITIAL_RTO_TICKS, TimerKind::TcpPcb, id_key);
}

// -----------------------------------------------------------------------------
// Active open
// -----------------------------------------------------------------------------

/// Open a connection to `remote_addr:remote_port`.  `initial_rcv_wnd` is
/// announced until a receive buffer is attached (normally from the
/// `connection_established` callback).
pub(crate) fn connect<D: EthDriver>(
    tcp: &mut TcpStack,
    ctx: &mut TcpCtx<'_, D>,
    remote_addr: Ipv4Addr,
    remote_port: Port,
    initial_rcv_wnd: u32,
) -> Result<ConnId, NetError> {
    if route(ctx.iface, remote_addr).is_none() {
        return Err(NetError::NoHwRoute);
    }
    let local_addr = ctx.iface.addr;
    let local_port = tcp
        .alloc_ephemeral(local_addr, remote_addr, remote_port)
        .ok_or(NetError::AddressInUse)?;
    let idx = tcp.alloc_pcb().ok_or(NetError::OutOfResources)?;
    let key = PcbKey {
        local_addr,
        remote_addr,
        local_port,
        remote_port,
    };

    let iss = tcp.take_iss();
    let iface_mss = (ctx.eth.ip_mtu() as u16).saturating_sub(IP_TCP_OVERHEAD);
    {
        let pcb = &mut tcp.pcbs[idx];
        pcb.key = key;
        pcb.state = TcpState::SynSent;
        pcb.listener = None;
        pcb.snd.una = iss;
        pcb.snd.nxt = seq_add(iss, 1);
        pcb.snd.base_mss = iface_mss;
        pcb.snd.ssthresh = u32::MAX;
        pcb.snd.cwnd = u32::MAX; // set properly once the MSS is known
        pcb.snd.rto = TCP_INITIAL_RTO_TICKS;
        pcb.rcv.init_wnd = initial_rcv_wnd;
    }
    tcp.index_insert(key, idx);

    let iface_mtu = ctx.eth.ip_mtu() as u16;
    let (mtu_ref, pmtu) = (&mut tcp.pcbs[idx].mtu_ref, &mut *ctx.pmtu);
    let _ = mtu_ref.setup(pmtu, remote_addr, ctx.iface, iface_mtu);

    debug!("tcp: connecting to {}:{}", remote_addr, remote_port);
    send_syn(&mut tcp.pcbs[idx], ctx, false);
    let id_key = tcp.pcbs[idx].id.to_key();
    ctx.timers
        .arm(ctx.now, TCP_INITIAL_RTO_TICKS, TimerKind::TcpPcb, id_key);
    Ok(tcp.pcbs[idx].id)
}

// -----------------------------------------------------------------------------
// Per-connection input
// -----------------------------------------------------------------------------

fn pcb_input<D: EthDriver>(
    tcp: &mut TcpStack,
    ctx: &mut TcpCtx<'_, D>,
    events: &mut dyn TcpEvents<D>,
    idx: usize,
    hdr: &TcpHeader,
    opts_buf: BufRef,
    data: BufRef,
) {
    if tcp.pcbs[idx].state == TcpState::SynSent {
        syn_sent_input(tcp, ctx, events, idx, hdr, opts_buf);
        return;
    }

    let mut seq = hdr.seq_num;
    let mut data = data;
    let mut fin = hdr.flags.contains(TcpFlags::FIN);

    // ---- Sequence acceptability and trimming --------------------------------
    {
        let pcb = &tcp.pcbs[idx];
        let rcv_nxt = pcb.rcv.nxt;
        let wnd = pcb.rcv.ann_wnd.max(pcb.rcv_wnd_to_announce());
        let seg_len = tcp_seq_len(hdr.flags, data.total_len()) as u32;

        let acceptable = if seg_len == 0 {
            if wnd == 0 {
                seq == rcv_nxt
            } else {
                in_open_closed_interval(seq_diff(rcv_nxt, 1), wnd, seq)
            }
        } else if wnd == 0 {
            false
        } else {
            // Some part of [seq, seq+seg_len) must fall in
            // [rcv_nxt, rcv_nxt+wnd): either the segment starts inside the
            // window, or it starts before and extends past rcv_nxt.
            in_open_closed_interval(seq_diff(rcv_nxt, 1), wnd, seq)
                || in_open_closed_interval(seq, seg_len - 1, rcv_nxt)
        };

        if !acceptable {
            if !hdr.flags.contains(TcpFlags::RST) {
                // Duplicate or out-of-window: re-ACK our position.
                send_ack(&mut tcp.pcbs[idx], ctx);
            }
            return;
        }
    }

    // ---- RST ----------------------------------------------------------------
    if hdr.flags.contains(TcpFlags::RST) {
        tcp.counters.rx_rst += 1;
        debug!("tcp: RST from {}", tcp.pcbs[idx].key.remote_addr);
        abort_pcb(tcp, ctx, events, idx, NetError::ConnectionReset, false);
        return;
    }

    // ---- SYN in a synchronized state ----------------------------------------
    if hdr.flags.contains(TcpFlags::SYN) {
        abort_pcb(tcp, ctx, events, idx, NetError::ConnectionReset, true);
        return;
    }

    if !hdr.flags.contains(TcpFlags::ACK) {
        return;
    }
    let ack = hdr.ack_num;

    // ---- SYN_RCVD: handshake completion -------------------------------------
    if tcp.pcbs[idx].state == TcpState::SynRcvd {
        if ack != tcp.pcbs[idx].snd.nxt {
            let _ = send_segment(
                ctx,
                &tcp.pcbs[idx].key,
                ack,
                0,
                0,
                TcpFlags::RST,
                None,
                BufRef::empty(),
            );
            return;
        }
        {
            let pcb = &mut tcp.pcbs[idx];
            pcb.snd.una = ack;
            pcb.state = TcpState::Established;
            pcb.snd.retx_count = 0;
            ctx.timers.disarm(TimerKind::TcpPcb, pcb.id.to_key());
            debug!(
                "tcp: {}:{} established (passive)",
                pcb.key.remote_addr, pcb.key.remote_port
            );
        }
        if tcp.pcbs[idx].queued {
            if !tcp_listen_queue::attach(tcp, ctx, idx) {
                abort_pcb(tcp, ctx, events, idx, NetError::OutOfResources, true);
                return;
            }
        } else if !deliver(tcp, ctx, events, idx, |ev, conn| {
            ev.connection_established(conn)
        }) {
            return;
        }
    }

    // ---- ACK processing ------------------------------------------------------
    {
        let in_flight = tcp.pcbs[idx].in_flight();
        if seq_lt2(tcp.pcbs[idx].snd.nxt, ack) {
            // Acks something not yet sent.
            send_ack(&mut tcp.pcbs[idx], ctx);
            return;
        }
        if in_open_closed_interval(tcp.pcbs[idx].snd.una, in_flight, ack) {
            let acked = seq_diff(ack, tcp.pcbs[idx].snd.una);
            if !process_ack(tcp, ctx, events, idx, ack, acked) {
                return; // connection ended (LastAck completion or abort)
            }
        }
    }

    // ---- Window update -------------------------------------------------------
    {
        let pcb = &mut tcp.pcbs[idx];
        if seq_lt2(pcb.snd.wl1, seq) || (pcb.snd.wl1 == seq && !seq_lt2(ack, pcb.snd.wl2)) {
            let new_wnd = (hdr.window_size as u32) << pcb.snd.wnd_shift;
            let was_zero = pcb.snd.wnd == 0;
            pcb.snd.wnd = new_wnd;
            pcb.snd.wl1 = seq;
            pcb.snd.wl2 = ack;
            if was_zero && new_wnd > 0 && pcb.flags.contains(PcbFlags::PROBE) {
                pcb.flags.remove(PcbFlags::PROBE);
                ctx.timers.disarm(TimerKind::TcpPcb, pcb.id.to_key());
            }
        }
    }

    // ---- Data and FIN --------------------------------------------------------
    if (data.total_len() > 0 || fin) && tcp.pcbs[idx].state.accepting_data() {
        // Left-trim old overlap.
        let rcv_nxt = tcp.pcbs[idx].rcv.nxt;
        if seq_lt2(seq, rcv_nxt) {
            let overlap = seq_diff(rcv_nxt, seq) as usize;
            if overlap >= data.total_len() {
                // Data entirely old; a FIN may still be new.
                if !(fin && seq_add(seq, data.total_len() as u32) == rcv_nxt) {
                    fin = false;
                }
                data = BufRef::empty();
            } else {
                data.skip_bytes(overlap);
            }
            seq = rcv_nxt;
        }
        // Right-trim beyond the window.
        {
            let pcb = &tcp.pcbs[idx];
            let wnd = pcb.rcv.ann_wnd.max(pcb.rcv_wnd_to_announce());
            let off = seq_diff(seq, rcv_nxt);
            let room = wnd.saturating_sub(off) as usize;
            if data.total_len() > room {
                data = data.sub_to(room);
                fin = false;
            }
        }

        if !process_data(tcp, ctx, events, idx, seq, data, fin) {
            return;
        }
    } else if fin || data.total_len() > 0 {
        // Data in a non-accepting state still deserves an ACK.
        tcp.pcbs[idx].flags |= PcbFlags::ACK_PENDING;
    }

    // ---- Output and pending ACK ---------------------------------------------
    let pcb = &mut tcp.pcbs[idx];
    if pcb.state != TcpState::Closed {
        pcb_output(pcb, ctx);
        if pcb.flags.contains(PcbFlags::ACK_PENDING) {
            send_ack(pcb, ctx);
        }
    }
}

/// Apply an acceptable ACK: advance `snd.una`, release send data, update
/// RTT and the congestion window, and run the close-side transitions.
/// Returns `false` when the PCB was freed.
fn process_ack<D: EthDriver>(
    tcp: &mut TcpStack,
    ctx: &mut TcpCtx<'_, D>,
    events: &mut dyn TcpEvents<D>,
    idx: usize,
    ack: SeqNum,
    acked: u32,
) -> bool {
    let data_acked;
    let fin_acked;
    {
        let pcb = &mut tcp.pcbs[idx];
        fin_acked = pcb.flags.contains(PcbFlags::FIN_SENT) && ack == pcb.snd.nxt;
        data_acked = (acked as usize) - fin_acked as usize;

        // Karn/Jacobson: only segments that were never retransmitted feed
        // the estimator.
        if pcb.flags.contains(PcbFlags::RTT_PENDING) && seq_lt2(pcb.snd.rtt_seq, ack) {
            pcb.flags.remove(PcbFlags::RTT_PENDING);
            let sample = ctx.now.since(pcb.snd.rtt_start);
            update_rtt(pcb, sample);
        }

        pcb.snd.una = ack;
        pcb.snd.buf.skip_bytes(data_acked.min(pcb.snd.buf.total_len()));
        pcb.snd.retx_count = 0;

        // Congestion window growth (RFC 5681): slow start below ssthresh,
        // roughly one MSS per RTT above it.
        let mss = pcb.eff_snd_mss(ctx.pmtu) as u32;
        if data_acked > 0 {
            if pcb.snd.cwnd < pcb.snd.ssthresh {
                pcb.snd.cwnd = pcb.snd.cwnd.saturating_add((data_acked as u32).min(mss));
            } else {
                let incr = (mss * mss / pcb.snd.cwnd.max(1)).max(1);
                pcb.snd.cwnd = pcb.snd.cwnd.saturating_add(incr);
            }
        }

        if pcb.in_flight() == 0 {
            ctx.timers.disarm(TimerKind::TcpPcb, pcb.id.to_key());
        } else {
            ctx.timers
                .arm(ctx.now, pcb.snd.rto, TimerKind::TcpPcb, pcb.id.to_key());
        }
    }

    if data_acked > 0
        && !deliver(tcp, ctx, events, idx, |ev, conn| {
            ev.data_sent(conn, data_acked)
        })
    {
        return false;
    }

    if fin_acked {
        match tcp.pcbs[idx].state {
            TcpState::FinWait1 => tcp.pcbs[idx].state = TcpState::FinWait2,
            TcpState::Closing => {
                enter_time_wait(tcp, ctx, idx);
            }
            TcpState::LastAck => {
                // Graceful close fully complete.
                debug!("tcp: {} closed", tcp.pcbs[idx].key.remote_addr);
                free_pcb(tcp, ctx, idx);
                return false;
            }
            _ => {}
        }
    }
    true
}

/// RFC 6298 with srtt scaled by 8 and rttvar by 4, in ticks.
fn update_rtt(pcb: &mut TcpPcb, sample: u32) {
    let snd = &mut pcb.snd;
    if snd.srtt == 0 {
        snd.srtt = sample << 3;
        snd.rttvar = sample << 1;
    } else {
        let srtt = snd.srtt >> 3;
        let delta = srtt.abs_diff(sample);
        snd.rttvar = snd.rttvar - (snd.rttvar >> 2) + delta;
        snd.srtt = snd.srtt - srtt + sample;
    }
    let rto = (snd.srtt >> 3) + (snd.rttvar).max(1);
    snd.rto = rto.clamp(TCP_MIN_RTO_TICKS, TCP_MAX_RTO_TICKS);
}

/// Store in-window data (in order or out of order) and run the FIN
/// transitions.  Returns `false` when the PCB was freed during delivery.
fn process_data<D: EthDriver>(
    tcp: &mut TcpStack,
    ctx: &mut TcpCtx<'_, D>,
    events: &mut dyn TcpEvents<D>,
    idx: usize,
    seq: SeqNum,
    data: BufRef,
    fin: bool,
) -> bool {
    let rcv_nxt = tcp.pcbs[idx].rcv.nxt;

    if seq == rcv_nxt {
        // In order: write through the receive buffer, then drain whatever
        // out-of-order data this made contiguous.
        let (accepted, oos_len, fin_now) = {
            let pcb = &mut tcp.pcbs[idx];
            let accepted = data.total_len().min(pcb.rcv.buf.total_len());
            if accepted > 0 {
                pcb.rcv.buf.give_buf(data.sub_to(accepted));
                pcb.rcv.nxt = seq_add(pcb.rcv.nxt, accepted as u32);
                pcb.rcv.ann_wnd = pcb.rcv.ann_wnd.saturating_sub(accepted as u32);
            }
            let (oos_len, oos_fin) = pcb.ooseq.shift_available(pcb.rcv.nxt);
            if oos_len > 0 {
                // Those bytes were already written at their offsets.
                pcb.rcv.buf.skip_bytes(oos_len);
                pcb.rcv.nxt = seq_add(pcb.rcv.nxt, oos_len as u32);
                pcb.rcv.ann_wnd = pcb.rcv.ann_wnd.saturating_sub(oos_len as u32);
            }
            pcb.flags |= PcbFlags::ACK_PENDING;
            let fin_now = (fin && accepted == data.total_len()) || oos_fin;
            (accepted, oos_len, fin_now)
        };

        let delivered = accepted + oos_len;
        if delivered > 0 && !deliver_data_received(tcp, ctx, events, idx, delivered) {
            return false;
        }
        if fin_now {
            return process_fin(tcp, ctx, events, idx);
        }
    } else {
        // Out of order: store at its offset if the buffer covers it, and
        // record the range.  Anything we cannot store is not recorded —
        // retransmission recovers it.
        let pcb = &mut tcp.pcbs[idx];
        let off = seq_diff(seq, rcv_nxt) as usize;
        let len = data.total_len();
        if off + len <= pcb.rcv.buf.total_len() {
            if len > 0 {
                let mut dst = pcb.rcv.buf;
                dst.skip_bytes(off);
                dst.give_buf(data);
            }
            match pcb
                .ooseq
                .update_for_segment_received(rcv_nxt, seq, len, fin)
            {
                Ok(need_ack) => {
                    if need_ack {
                        pcb.flags |= PcbFlags::ACK_PENDING;
                    }
                }
                Err(()) => {
                    trace!("tcp: inconsistent out-of-order segment dropped");
                    tcp.counters.rx_dropped += 1;
                }
            }
        } else {
            pcb.flags |= PcbFlags::ACK_PENDING;
        }
    }
    true
}

/// The peer's FIN became in-sequence: advance over it and transition.
fn process_fin<D: EthDriver>(
    tcp: &mut TcpStack,
    ctx: &mut TcpCtx<'_, D>,
    events: &mut dyn TcpEvents<D>,
    idx: usize,
) -> bool {
    {
        let pcb = &mut tcp.pcbs[idx];
        pcb.rcv.nxt = seq_add(pcb.rcv.nxt, 1);
        pcb.flags |= PcbFlags::ACK_PENDING;
        pcb.state = match pcb.state {
            TcpState::Established => TcpState::CloseWait,
            TcpState::FinWait1 => TcpState::Closing,
            TcpState::FinWait2 => TcpState::FinWait2TimeWait,
            s => s,
        };
    }

    // End-of-stream notification (amount 0).  For queued connections this
    // is where FIN-before-data kills the entry.
    if !deliver_data_received(tcp, ctx, events, idx, 0) {
        return false;
    }

    if tcp.pcbs[idx].state == TcpState::FinWait2TimeWait {
        // Callbacks have run; linger now.
        send_ack(&mut tcp.pcbs[idx], ctx);
        enter_time_wait(tcp, ctx, idx);
        return false;
    }
    true
}

// -----------------------------------------------------------------------------
// SYN_SENT input
// -----------------------------------------------------------------------------

fn syn_sent_input<D: EthDriver>(
    tcp: &mut TcpStack,
    ctx: &mut TcpCtx<'_, D>,
    events: &mut dyn TcpEvents<D>,
    idx: usize,
    hdr: &TcpHeader,
    opts_buf: BufRef,
) {
    let (snd_nxt, key) = {
        let pcb = &tcp.pcbs[idx];
        (pcb.snd.nxt, pcb.key)
    };

    if hdr.flags.contains(TcpFlags::ACK) && hdr.ack_num != snd_nxt {
        if !hdr.flags.contains(TcpFlags::RST) {
            let _ = send_segment(
                ctx,
                &key,
                hdr.ack_num,
                0,
                0,
                TcpFlags::RST,
                None,
                BufRef::empty(),
            );
        }
        return;
    }

    if hdr.flags.contains(TcpFlags::RST) {
        if hdr.flags.contains(TcpFlags::ACK) {
            debug!("tcp: connection to {} refused", key.remote_addr);
            abort_pcb(tcp, ctx, events, idx, NetError::ConnectionReset, false);
        }
        return;
    }

    if !hdr.flags.contains(TcpFlags::SYN) || !hdr.flags.contains(TcpFlags::ACK) {
        // Simultaneous open is not supported; the SYN retransmit path
        // sorts the rest out.
        return;
    }

    let mut opts = TcpOptions::default();
    parse_options(opts_buf, &mut opts);

    let iface_mss = (ctx.eth.ip_mtu() as u16).saturating_sub(IP_TCP_OVERHEAD);
    let Some(snd_mss) = calc_snd_mss(iface_mss, &opts) else {
        debug!("tcp: peer MSS below floor, dropping connection");
        abort_pcb(tcp, ctx, events, idx, NetError::Timeout, true);
        return;
    };

    {
        let pcb = &mut tcp.pcbs[idx];
        pcb.snd.una = hdr.ack_num;
        pcb.rcv.nxt = seq_add(hdr.seq_num, 1);
        pcb.snd.base_mss = snd_mss;
        if opts.options.contains(OptionFlags::WND_SCALE) {
            pcb.flags |= PcbFlags::WND_SCALE;
            pcb.snd.wnd_shift = opts.wnd_scale.min(14);
        }
        pcb.snd.wnd = hdr.window_size as u32; // unscaled on SYN
        pcb.snd.wl1 = hdr.seq_num;
        pcb.snd.wl2 = hdr.ack_num;
        pcb.snd.cwnd = calc_initial_cwnd(snd_mss);
        pcb.snd.retx_count = 0;
        pcb.state = TcpState::Established;
        ctx.timers.disarm(TimerKind::TcpPcb, pcb.id.to_key());
        debug!(
            "tcp: {}:{} established (active)",
            pcb.key.remote_addr, pcb.key.remote_port
        );
    }

    // Let the application attach its buffers first, so the ACK completing
    // the handshake announces a real window.
    if deliver(tcp, ctx, events, idx, |ev, conn| {
        ev.connection_established(conn)
    }) {
        send_ack(&mut tcp.pcbs[idx], ctx);
        pcb_output(&mut tcp.pcbs[idx], ctx);
    }
}

// -----------------------------------------------------------------------------
// Timers
// -----------------------------------------------------------------------------

/// Dispatch a fired per-connection timer.
pub(crate) fn on_timer<D: EthDriver>(
    tcp: &mut TcpStack,
    ctx: &mut TcpCtx<'_, D>,
    events: &mut dyn TcpEvents<D>,
    timer_key: u32,
) {
    let id = ConnId::from_key(timer_key);
    let Some(idx) = tcp.conn_slot(id) else {
        // The connection ended between arming and firing.
        return;
    };
    match crate::tcp_pcb::on_pcb_timer(&mut tcp.pcbs[idx], ctx) {
        TimerVerdict::Done => {}
        TimerVerdict::Free => free_pcb(tcp, ctx, idx),
        TimerVerdict::Abort(err) => {
            debug!(
                "tcp: {} aborted ({})",
                tcp.pcbs[idx].key.remote_addr, err
            );
            abort_pcb(tcp, ctx, events, idx, err, true);
        }
    }
}

// -----------------------------------------------------------------------------
// ICMP destination unreachable (fragmentation needed)
// -----------------------------------------------------------------------------

/// Handle an ICMP destination-unreachable for protocol TCP.
///
/// `inner_src`/`inner_dst` come from the encapsulated IP header (the
/// datagram *we* sent); `inner_payload` holds at least the first 8 bytes
/// of its TCP header.  Only code 4 (fragmentation needed) is acted on,
/// and only for an active flow whose quoted sequence is plausibly in
/// flight.
pub(crate) fn handle_dest_unreach<D: EthDriver>(
    tcp: &mut TcpStack,
    ctx: &mut TcpCtx<'_, D>,
    code: u8,
    next_hop_mtu: u16,
    inner_src: Ipv4Addr,
    inner_dst: Ipv4Addr,
    inner_payload: BufRef,
) {
    if code != crate::ICMP_CODE_FRAG_NEEDED || inner_payload.total_len() < 8 {
        return;
    }
    let mut ports = [0u8; 8];
    let mut b = inner_payload;
    b.take_bytes(8, &mut ports);
    let src_port = Port(u16::from_be_bytes([ports[0], ports[1]]));
    let dst_port = Port(u16::from_be_bytes([ports[2], ports[3]]));
    let quoted_seq = u32::from_be_bytes([ports[4], ports[5], ports[6], ports[7]]);

    // The quoted datagram traveled local -> remote.
    let key = PcbKey {
        local_addr: inner_src,
        remote_addr: inner_dst,
        local_port: src_port,
        remote_port: dst_port,
    };
    let Some(idx) = tcp.lookup(&key) else {
        return;
    };
    let pcb = &mut tcp.pcbs[idx];
    if !(pcb.state.is_active() || pcb.state.is_synsent_or_synrcvd()) || !pcb.mtu_ref.is_setup() {
        return;
    }
    // The quoted sequence must be plausibly ours.
    if !seq_lte(quoted_seq, pcb.snd.nxt, pcb.snd.una) {
        return;
    }

    if pcb.mtu_ref.handle_icmp_packet_too_big(ctx.pmtu, next_hop_mtu) {
        debug!(
            "tcp: path MTU to {} dropped to {}, repacketizing",
            key.remote_addr, next_hop_mtu
        );
        // Effective MSS shrank; put the first unacked segment back on the
        // wire at the new size right away.
        if pcb.in_flight() > 0 {
            crate::tcp_pcb::retransmit_first_segment(pcb, ctx);
        }
    }
}

// -----------------------------------------------------------------------------
// User-level close
// -----------------------------------------------------------------------------

/// Graceful close of the send direction from application level.
pub(crate) fn close_send<D: EthDriver>(tcp: &mut TcpStack, ctx: &mut TcpCtx<'_, D>, idx: usize) {
    let pcb = &mut tcp.pcbs[idx];
    if !pcb.state.snd_open() || pcb.flags.contains(PcbFlags::FIN_QUEUED) {
        return;
    }
    pcb.flags |= PcbFlags::FIN_QUEUED;
    pcb.state = match pcb.state {
        TcpState::Established => TcpState::FinWait1,
        TcpState::CloseWait => TcpState::LastAck,
        s => s,
    };
    pcb_output(pcb, ctx);
}
