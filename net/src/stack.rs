//! Composition root: one interface, one stack.
//!
//! [`Stack`] owns the Ethernet adapter (with the driver inside), the IPv4
//! engine, reassembly, the PMTU cache, the TCP engine and the shared
//! timer queue.  The event loop drives it through three entry points:
//!
//! - [`Stack::on_rx_frame`] for each received frame (or
//!   [`Stack::drain_rx`] to pull everything a driver parked in an
//!   [`RxRing`](crate::pool::RxRing)),
//! - [`Stack::poll`] whenever a timer may have expired
//!   ([`Stack::ticks_to_next_timer`] tells the loop how long it may
//!   sleep),
//! - the `tcp_*` methods for application-initiated actions.
//!
//! All handlers run to completion on the calling thread; the only
//! ISR-facing pieces are the frame pool and rx ring in [`crate::pool`].
//!
//! The stack must stay at a stable address while connections are live:
//! queued-connection receive buffers are referenced internally.  Place it
//! in a `static`, a `Box`, or construct it where it will be used.

use fathom_lib::clock::{Instant, ticks_from_secs};
use fathom_lib::timer_queue::TimerQueue;

use crate::buf::{BufNode, BufRef};
use crate::config::{NUM_REASM_CONTEXTS, NUM_TIMERS};
use crate::eth::{EthAdapter, EthDriver, EthRx};
use crate::icmp::{self, IcmpAction};
use crate::ipv4::{
    DestUnreachMeta, IfaceConfig, Ip4RxInfo, IpCounters, IpProtocolHandler, Ipv4Engine,
};
use crate::pmtu::PmtuCache;
use crate::pool::RxRing;
use crate::reassembly::IpReassembly;
use crate::tcp_listen_queue;
use crate::tcp_pcb::{ConnId, ListenerId, PcbFlags, TcpConn, TcpCtx, TcpEvents};
use crate::tcp_stack::{self, TcpCounters, TcpStack};
use crate::types::{IpProtocol, Ipv4Addr, NetError, Port};

/// Discriminants for the shared timer queue.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TimerKind {
    /// One-second ARP cache aging sweep.
    ArpSweep,
    /// One-minute PMTU cache aging sweep.
    PmtuSweep,
    /// One-second reassembly aging sweep.
    ReasmSweep,
    /// Per-connection TCP timer (retransmit / probe / linger); the key is
    /// the connection identity.
    TcpPcb,
    /// Listen-queue aging; the key is the listener index.
    ListenQueue,
}

// =============================================================================
// Stack
// =============================================================================

pub struct Stack<D: EthDriver, H: IpProtocolHandler = ()> {
    eth: EthAdapter<D>,
    iface: IfaceConfig,
    ip: Ipv4Engine,
    reassembly: IpReassembly,
    pmtu: PmtuCache,
    tcp: TcpStack,
    timers: TimerQueue<TimerKind, NUM_TIMERS>,
    user_handler: Option<H>,
}

impl<D: EthDriver, H: IpProtocolHandler> Stack<D, H> {
    /// Bring up a stack on `driver` with the given interface addressing.
    pub fn new(driver: D, iface: IfaceConfig, now: Instant) -> Self {
        let mut timers = TimerQueue::new();
        timers.arm(now, ticks_from_secs(1), TimerKind::ArpSweep, 0);
        timers.arm(now, ticks_from_secs(1), TimerKind::ReasmSweep, 0);
        timers.arm(now, ticks_from_secs(60), TimerKind::PmtuSweep, 0);
        Self {
            eth: EthAdapter::new(driver),
            iface,
            ip: Ipv4Engine::new(),
            reassembly: IpReassembly::new(),
            pmtu: PmtuCache::new(),
            tcp: TcpStack::new(),
            timers,
            user_handler: None,
        }
    }

    /// Install the user protocol handler (UDP, raw sockets, ...).
    pub fn set_user_handler(&mut self, handler: H) {
        self.user_handler = Some(handler);
    }

    pub fn iface(&self) -> &IfaceConfig {
        &self.iface
    }

    pub fn driver_mut(&mut self) -> &mut D {
        self.eth.driver_mut()
    }

    pub fn ip_counters(&self) -> &IpCounters {
        &self.ip.counters
    }

    pub fn tcp_counters(&self) -> &TcpCounters {
        &self.tcp.counters
    }

    // =========================================================================
    // Receive path
    // =========================================================================

    /// Feed one received Ethernet frame.  The chain behind `frame` only
    /// needs to stay valid for the duration of the call.
    pub fn on_rx_frame(&mut self, now: Instant, frame: BufRef, events: &mut dyn TcpEvents<D>) {
        let Self {
            eth,
            iface,
            ip,
            reassembly,
            pmtu,
            tcp,
            timers,
            user_handler,
        } = self;

        let pkt = match eth.recv_frame(iface, frame) {
            EthRx::Consumed => return,
            EthRx::Ipv4(pkt) => pkt,
        };
        let Some((hdr, payload)) = ip.validate_rx(pkt) else {
            return;
        };
        if !iface.is_local_dst(hdr.dst) {
            ip.drop_nonlocal(hdr.dst);
            return;
        }

        if hdr.is_fragment() {
            ip.counters.rx_fragments += 1;
            let hdr_bytes = &pkt.chunk()[..hdr.ihl_bytes as usize];
            let Some(done) = reassembly.process_fragment(&hdr, hdr_bytes, payload) else {
                return;
            };
            let (key, data) = reassembly.complete_data(done);
            let node = BufNode::from_slice(data);
            let buf = BufRef::new(&node, 0, data.len());
            let rx = Ip4RxInfo {
                src: key.src,
                dst: key.dst,
                ttl: hdr.ttl,
            };
            dispatch_protocol(
                eth,
                iface,
                ip,
                pmtu,
                tcp,
                timers,
                user_handler,
                now,
                events,
                key.protocol,
                rx,
                buf,
            );
            reassembly.release(done);
        } else {
            let rx = Ip4RxInfo {
                src: hdr.src,
                dst: hdr.dst,
                ttl: hdr.ttl,
            };
            dispatch_protocol(
                eth,
                iface,
                ip,
                pmtu,
                tcp,
                timers,
                user_handler,
                now,
                events,
                hdr.protocol,
                rx,
                payload,
            );
        }
    }

    /// Pull every frame a driver parked in `ring` through the stack.
    pub fn drain_rx(&mut self, now: Instant, ring: &RxRing, events: &mut dyn TcpEvents<D>) {
        while let Some(frame) = ring.pop() {
            let node = frame.node();
            let buf = BufRef::new(&node, 0, frame.len());
            self.on_rx_frame(now, buf, events);
        }
    }

    // =========================================================================
    // Timers
    // =========================================================================

    /// Fire everything due at `now`, in deadline order.
    pub fn poll(&mut self, now: Instant, events: &mut dyn TcpEvents<D>) {
        loop {
            let Some((kind, key)) = self.timers.pop_expired(now) else {
                return;
            };
            let Self {
                eth,
                iface,
                ip,
                reassembly,
                pmtu,
                tcp,
                timers,
                ..
            } = self;
            match kind {
                TimerKind::ArpSweep => {
                    eth.on_second_tick(iface);
                    timers.arm(now, ticks_from_secs(1), TimerKind::ArpSweep, 0);
                }
                TimerKind::ReasmSweep => {
                    let mut expired = [None; NUM_REASM_CONTEXTS];
                    let n = reassembly.on_second_tick(&mut expired);
                    for expiry in expired.iter().take(n).flatten() {
                        icmp::send_time_exceeded(ip, eth, iface, expiry);
                    }
                    timers.arm(now, ticks_from_secs(1), TimerKind::ReasmSweep, 0);
                }
                TimerKind::PmtuSweep => {
                    let iface_mtu = eth.ip_mtu() as u16;
                    pmtu.on_minute_tick(iface, iface_mtu);
                    timers.arm(now, ticks_from_secs(60), TimerKind::PmtuSweep, 0);
                }
                TimerKind::TcpPcb => {
                    let mut ctx = TcpCtx {
                        eth,
                        iface,
                        ip,
                        pmtu,
                        timers,
                        now,
                    };
                    tcp_stack::on_timer(tcp, &mut ctx, events, key);
                }
                TimerKind::ListenQueue => {
                    let mut ctx = TcpCtx {
                        eth,
                        iface,
                        ip,
                        pmtu,
                        timers,
                        now,
                    };
                    tcp_listen_queue::on_queue_timer(tcp, &mut ctx, events, key);
                }
            }
        }
    }

    /// How long the event loop may sleep before the next timer is due.
    pub fn ticks_to_next_timer(&self, now: Instant) -> Option<u32> {
        self.timers.ticks_to_next(now)
    }

    // =========================================================================
    // TCP application surface
    // =========================================================================

    /// Listen on `port`; each completed handshake is announced through
    /// `connection_established` right away.
    pub fn tcp_listen(&mut self, port: Port, initial_rcv_wnd: u32) -> Result<ListenerId, NetError> {
        self.tcp
            .listen(Ipv4Addr::UNSPECIFIED, port, false, 0, initial_rcv_wnd)
    }

    /// Listen on `port` with queueing: completed handshakes are parked
    /// with a receive buffer until the first data arrives, then announced
    /// through `listen_ready` and claimed with [`Stack::tcp_accept`].
    /// Parked connections that stay silent for `queue_timeout` ticks are
    /// reset.
    pub fn tcp_listen_queued(
        &mut self,
        port: Port,
        queue_timeout: u32,
    ) -> Result<ListenerId, NetError> {
        self.tcp.listen(Ipv4Addr::UNSPECIFIED, port, true, queue_timeout, 0)
    }

    /// Active open.
    pub fn tcp_connect(
        &mut self,
        now: Instant,
        remote_addr: Ipv4Addr,
        remote_port: Port,
        initial_rcv_wnd: u32,
    ) -> Result<ConnId, NetError> {
        let Self {
            eth,
            iface,
            ip,
            pmtu,
            tcp,
            timers,
            ..
        } = self;
        let mut ctx = TcpCtx {
            eth,
            iface,
            ip,
            pmtu,
            timers,
            now,
        };
        tcp_stack::connect(tcp, &mut ctx, remote_addr, remote_port, initial_rcv_wnd)
    }

    /// Claim the oldest ready connection of a queued listener.  The
    /// buffered initial bytes are copied into `initial_data` (which must
    /// hold [`LISTEN_QUEUE_BUF_SIZE`](crate::config::LISTEN_QUEUE_BUF_SIZE)
    /// bytes); attach a receive buffer via [`Stack::with_tcp_conn`]
    /// immediately after.
    pub fn tcp_accept(
        &mut self,
        now: Instant,
        listener: ListenerId,
        initial_data: &mut [u8],
    ) -> Result<(ConnId, usize), NetError> {
        let Self {
            eth,
            iface,
            ip,
            pmtu,
            tcp,
            timers,
            ..
        } = self;
        let mut ctx = TcpCtx {
            eth,
            iface,
            ip,
            pmtu,
            timers,
            now,
        };
        tcp_listen_queue::accept_into(tcp, &mut ctx, listener, initial_data)
    }

    /// Operate on a live connection (attach buffers, send, push, close).
    pub fn with_tcp_conn<R>(
        &mut self,
        now: Instant,
        id: ConnId,
        f: impl FnOnce(&mut TcpConn<'_, '_, D>) -> R,
    ) -> Result<R, NetError> {
        let Self {
            eth,
            iface,
            ip,
            pmtu,
            tcp,
            timers,
            ..
        } = self;
        let idx = tcp.conn_slot(id).ok_or(NetError::InvalidArgument)?;
        let mut ctx = TcpCtx {
            eth,
            iface,
            ip,
            pmtu,
            timers,
            now,
        };
        let r = f(&mut TcpConn {
            pcb: &mut tcp.pcbs[idx],
            ctx: &mut ctx,
        });
        if tcp.pcbs[idx].flags.contains(PcbFlags::ABORT_PENDING) {
            // Application-initiated; the RST already went out.
            tcp_stack::free_pcb(tcp, &mut ctx, idx);
        }
        Ok(r)
    }

    /// Graceful close of the send direction.
    pub fn tcp_close(&mut self, now: Instant, id: ConnId) -> Result<(), NetError> {
        let Self {
            eth,
            iface,
            ip,
            pmtu,
            tcp,
            timers,
            ..
        } = self;
        let idx = tcp.conn_slot(id).ok_or(NetError::InvalidArgument)?;
        let mut ctx = TcpCtx {
            eth,
            iface,
            ip,
            pmtu,
            timers,
            now,
        };
        tcp_stack::close_send(tcp, &mut ctx, idx);
        Ok(())
    }

    /// Hard abort: RST out, slot recycled, no further callbacks.
    pub fn tcp_abort(&mut self, now: Instant, id: ConnId) -> Result<(), NetError> {
        let Self {
            eth,
            iface,
            ip,
            pmtu,
            tcp,
            timers,
            ..
        } = self;
        let idx = tcp.conn_slot(id).ok_or(NetError::InvalidArgument)?;
        let mut ctx = TcpCtx {
            eth,
            iface,
            ip,
            pmtu,
            timers,
            now,
        };
        crate::tcp_pcb::send_rst_for_pcb(&tcp.pcbs[idx], &mut ctx);
        tcp_stack::free_pcb(tcp, &mut ctx, idx);
        Ok(())
    }

    /// Live TCP connection count (diagnostics).
    pub fn tcp_active_count(&self) -> usize {
        self.tcp.active_count()
    }
}

// =============================================================================
// Protocol dispatch
// =============================================================================

#[allow(clippy::too_many_arguments)]
fn dispatch_protocol<D: EthDriver, H: IpProtocolHandler>(
    eth: &mut EthAdapter<D>,
    iface: &IfaceConfig,
    ip: &mut Ipv4Engine,
    pmtu: &mut PmtuCache,
    tcp: &mut TcpStack,
    timers: &mut TimerQueue<TimerKind, NUM_TIMERS>,
    user_handler: &mut Option<H>,
    now: Instant,
    events: &mut dyn TcpEvents<D>,
    protocol: u8,
    rx: Ip4RxInfo,
    payload: BufRef,
) {
    match IpProtocol::from_u8(protocol) {
        Some(IpProtocol::Tcp) => {
            let mut ctx = TcpCtx {
                eth,
                iface,
                ip,
                pmtu,
                timers,
                now,
            };
            tcp_stack::input(tcp, &mut ctx, events, rx, payload);
        }
        Some(IpProtocol::Icmp) => {
            match icmp::handle_rx(ip, eth, iface, &rx, payload) {
                IcmpAction::None => {}
                IcmpAction::DestUnreach {
                    code,
                    next_hop_mtu,
                    inner,
                    inner_payload,
                } => {
                    if inner.protocol == IpProtocol::Tcp.as_u8() {
                        let mut ctx = TcpCtx {
                            eth,
                            iface,
                            ip,
                            pmtu,
                            timers,
                            now,
                        };
                        tcp_stack::handle_dest_unreach(
                            tcp,
                            &mut ctx,
                            code,
                            next_hop_mtu,
                            inner.src,
                            inner.dst,
                            inner_payload,
                        );
                    } else if let Some(h) = user_handler
                        && h.protocol_number() == inner.protocol
                    {
                        let meta = DestUnreachMeta {
                            icmp_code: code,
                            next_hop_mtu,
                        };
                        let inner_rx = Ip4RxInfo {
                            src: inner.src,
                            dst: inner.dst,
                            ttl: inner.ttl,
                        };
                        h.handle_ip4_dest_unreach(&meta, &inner_rx, inner_payload);
                    }
                }
            }
        }
        _ => {
            if let Some(h) = user_handler
                && h.protocol_number() == protocol
            {
                h.recv_ip4_dgram(&rx, payload);
            } else {
                ip.counters.rx_unknown_proto += 1;
            }
        }
    }
}
