//! IPv4 engine: header validation, local routing, egress with
//! fragmentation.
//!
//! # Ingress
//!
//! [`Ipv4Engine::validate_rx`] is the single entry point for received IPv4
//! packets after Ethernet demux.  It checks version, IHL, total length and
//! the header checksum, truncates away link padding, and returns the parsed
//! header together with the payload reference.  The stack drops datagrams
//! whose destination is not local — this is an endpoint stack, never a
//! forwarder.  Fragments are detected here and routed to reassembly by the
//! composition root.
//!
//! # Egress
//!
//! [`send_dgram`] routes a datagram onto the single attached interface
//! (directly to on-subnet destinations, via the gateway otherwise), fills
//! in the IP header by revealing 20 bytes in front of the payload, and
//! fragments at 8-byte multiples when the payload exceeds the interface
//! MTU and DF permits.

use log::{debug, trace};

use crate::buf::{BufNode, BufRef, TxFrame};
use crate::checksum::header_checksum;
use crate::eth::{EthAdapter, EthDriver};
use crate::types::{Ipv4Addr, NetError};
use crate::{ETH_HEADER_LEN, IPV4_FLAG_DF, IPV4_FLAG_MF, IPV4_HEADER_LEN, IPV4_OFFSET_MASK};

// =============================================================================
// Interface configuration
// =============================================================================

/// IPv4 configuration of the attached interface.
#[derive(Clone, Copy, Debug)]
pub struct IfaceConfig {
    pub addr: Ipv4Addr,
    pub netmask: Ipv4Addr,
    /// Default gateway; `UNSPECIFIED` if none.
    pub gateway: Ipv4Addr,
}

impl IfaceConfig {
    /// Directed broadcast address of the subnet: `addr | !netmask`.
    #[inline]
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from_u32_be(self.addr.to_u32_be() | !self.netmask.to_u32_be())
    }

    /// `true` if `ip` is on the directly connected subnet.
    #[inline]
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        ip.in_subnet(self.addr, self.netmask)
    }

    /// `true` if a received datagram addressed to `dst` is for us.
    #[inline]
    pub fn is_local_dst(&self, dst: Ipv4Addr) -> bool {
        dst == self.addr || dst == self.broadcast() || dst.is_limited_broadcast()
    }
}

/// Next hop for `dst` through the interface, or `None` when unroutable.
pub fn route(iface: &IfaceConfig, dst: Ipv4Addr) -> Option<Ipv4Addr> {
    if dst.is_limited_broadcast() || iface.contains(dst) {
        Some(dst)
    } else if !iface.gateway.is_unspecified() {
        Some(iface.gateway)
    } else {
        None
    }
}

// =============================================================================
// Header
// =============================================================================

/// Parsed IPv4 header, multi-byte fields in host order.
#[derive(Clone, Copy, Debug, Default)]
pub struct Ipv4Header {
    pub ihl_bytes: u8,
    pub tos: u8,
    pub total_len: u16,
    pub ident: u16,
    pub flags_frag: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    #[inline]
    pub const fn dont_fragment(&self) -> bool {
        self.flags_frag & IPV4_FLAG_DF != 0
    }

    #[inline]
    pub const fn more_fragments(&self) -> bool {
        self.flags_frag & IPV4_FLAG_MF != 0
    }

    #[inline]
    pub const fn frag_offset_bytes(&self) -> usize {
        ((self.flags_frag & IPV4_OFFSET_MASK) as usize) * 8
    }

    /// `true` if the datagram is one fragment of a larger datagram.
    #[inline]
    pub const fn is_fragment(&self) -> bool {
        self.more_fragments() || self.frag_offset_bytes() != 0
    }
}

/// Addressing information passed to upper-protocol handlers.
#[derive(Clone, Copy, Debug)]
pub struct Ip4RxInfo {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub ttl: u8,
}

/// ICMP destination-unreachable details handed to a protocol handler.
#[derive(Clone, Copy, Debug)]
pub struct DestUnreachMeta {
    pub icmp_code: u8,
    /// Next-hop MTU from the unused word (code 4 only, else 0).
    pub next_hop_mtu: u16,
}

/// Contract for an application-supplied upper-protocol handler (UDP, raw).
///
/// `recv_ip4_dgram` runs after header validation, checksum and
/// reassembly; the buffer must not be retained past the call.  For ICMP
/// destination-unreachable errors quoting this protocol,
/// `handle_ip4_dest_unreach` runs with the encapsulated addressing and
/// the initial bytes of the quoted datagram; the handler decides locally
/// whether the error concerns one of its flows.
pub trait IpProtocolHandler {
    fn protocol_number(&self) -> u8;
    fn recv_ip4_dgram(&mut self, rx: &Ip4RxInfo, dgram: BufRef);
    fn handle_ip4_dest_unreach(
        &mut self,
        du_meta: &DestUnreachMeta,
        inner: &Ip4RxInfo,
        dgram_initial: BufRef,
    );
}

/// Placeholder for stacks without a user protocol handler.
impl IpProtocolHandler for () {
    fn protocol_number(&self) -> u8 {
        255 // IANA reserved; matches no traffic
    }
    fn recv_ip4_dgram(&mut self, _rx: &Ip4RxInfo, _dgram: BufRef) {}
    fn handle_ip4_dest_unreach(
        &mut self,
        _du_meta: &DestUnreachMeta,
        _inner: &Ip4RxInfo,
        _dgram_initial: BufRef,
    ) {
    }
}

/// Serialize an IPv4 header (with checksum) into `out`.
pub fn write_header(out: &mut [u8], hdr: &Ipv4Header) {
    debug_assert!(out.len() >= IPV4_HEADER_LEN);
    out[0] = 0x40 | (IPV4_HEADER_LEN as u8 / 4);
    out[1] = hdr.tos;
    out[2..4].copy_from_slice(&hdr.total_len.to_be_bytes());
    out[4..6].copy_from_slice(&hdr.ident.to_be_bytes());
    out[6..8].copy_from_slice(&hdr.flags_frag.to_be_bytes());
    out[8] = hdr.ttl;
    out[9] = hdr.protocol;
    out[10..12].copy_from_slice(&[0, 0]);
    out[12..16].copy_from_slice(&hdr.src.0);
    out[16..20].copy_from_slice(&hdr.dst.0);
    let csum = header_checksum(&out[..IPV4_HEADER_LEN]);
    out[10..12].copy_from_slice(&csum.to_be_bytes());
}

/// Parse an IPv4 header from a contiguous slice.  Length and checksum are
/// *not* validated here; see [`Ipv4Engine::validate_rx`].
pub fn parse_header(data: &[u8]) -> Option<Ipv4Header> {
    if data.len() < IPV4_HEADER_LEN {
        return None;
    }
    let version = data[0] >> 4;
    let ihl_bytes = (data[0] & 0x0f) * 4;
    if version != 4 || (ihl_bytes as usize) < IPV4_HEADER_LEN {
        return None;
    }
    Some(Ipv4Header {
        ihl_bytes,
        tos: data[1],
        total_len: u16::from_be_bytes([data[2], data[3]]),
        ident: u16::from_be_bytes([data[4], data[5]]),
        flags_frag: u16::from_be_bytes([data[6], data[7]]),
        ttl: data[8],
        protocol: data[9],
        src: Ipv4Addr([data[12], data[13], data[14], data[15]]),
        dst: Ipv4Addr([data[16], data[17], data[18], data[19]]),
    })
}

// =============================================================================
// Engine
// =============================================================================

/// Drop/traffic counters, one set per stack.
#[derive(Clone, Copy, Debug, Default)]
pub struct IpCounters {
    pub rx_malformed: u32,
    pub rx_bad_checksum: u32,
    pub rx_nonlocal: u32,
    pub rx_unknown_proto: u32,
    pub rx_fragments: u32,
    pub tx_dgrams: u32,
    pub tx_fragmented: u32,
}

/// Engine state: the IP ident sequence and counters.
pub struct Ipv4Engine {
    next_ident: u16,
    pub counters: IpCounters,
}

impl Ipv4Engine {
    pub fn new() -> Self {
        Self {
            next_ident: 1,
            counters: IpCounters::default(),
        }
    }

    fn take_ident(&mut self) -> u16 {
        let id = self.next_ident;
        self.next_ident = self.next_ident.wrapping_add(1);
        id
    }

    /// Validate one received IPv4 packet.
    ///
    /// On success returns the parsed header and the payload reference (IP
    /// header consumed, link padding truncated).  Drops are counted and
    /// return `None`.
    pub fn validate_rx(&mut self, pkt: BufRef) -> Option<(Ipv4Header, BufRef)> {
        if !pkt.has_header(IPV4_HEADER_LEN) {
            self.counters.rx_malformed += 1;
            return None;
        }
        let head = pkt.chunk();
        let Some(hdr) = parse_header(head) else {
            trace!("ipv4: malformed header");
            self.counters.rx_malformed += 1;
            return None;
        };
        let ihl = hdr.ihl_bytes as usize;
        if head.len() < ihl {
            // Options must be contiguous with the fixed header.
            self.counters.rx_malformed += 1;
            return None;
        }
        let total_len = hdr.total_len as usize;
        if total_len < ihl || total_len > pkt.total_len() {
            trace!(
                "ipv4: bad total length {} (ihl {}, frame {})",
                total_len,
                ihl,
                pkt.total_len()
            );
            self.counters.rx_malformed += 1;
            return None;
        }
        if header_checksum(&head[..ihl]) != 0 {
            trace!("ipv4: bad header checksum");
            self.counters.rx_bad_checksum += 1;
            return None;
        }

        let payload = pkt.sub_to(total_len).hide_header(ihl);
        Some((hdr, payload))
    }

    /// Count and drop a datagram whose destination is not ours.
    pub fn drop_nonlocal(&mut self, dst: Ipv4Addr) {
        trace!("ipv4: dropping non-local datagram for {}", dst);
        self.counters.rx_nonlocal += 1;
    }
}

impl Default for Ipv4Engine {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Egress
// =============================================================================

/// Metadata for one outgoing datagram.
#[derive(Clone, Copy, Debug)]
pub struct DgramMeta {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: u8,
    pub ttl: u8,
    pub tos: u8,
    pub dont_fragment: bool,
}

/// Send one IP datagram.
///
/// The payload reference must carry at least `ETH_HEADER_LEN +
/// IPV4_HEADER_LEN` bytes of headroom in its first node (transmit staging
/// buffers reserve this).  Payloads exceeding the interface MTU are
/// fragmented unless `dont_fragment` is set, in which case the call fails
/// with [`NetError::FragNeeded`] carrying the interface MTU.
pub fn send_dgram<D: EthDriver>(
    engine: &mut Ipv4Engine,
    eth: &mut EthAdapter<D>,
    iface: &IfaceConfig,
    meta: &DgramMeta,
    payload: BufRef,
) -> Result<(), NetError> {
    let next_hop = route(iface, meta.dst).ok_or_else(|| {
        debug!("ipv4: no route to {}", meta.dst);
        NetError::NoHwRoute
    })?;

    let mtu = eth.ip_mtu();
    let data_len = payload.total_len();

    if IPV4_HEADER_LEN + data_len <= mtu {
        let ident = engine.take_ident();
        let dgram = payload
            .reveal_header(IPV4_HEADER_LEN)
            .ok_or(NetError::NoHeaderSpace)?;
        let mut hdr = [0u8; IPV4_HEADER_LEN];
        write_header(
            &mut hdr,
            &Ipv4Header {
                ihl_bytes: IPV4_HEADER_LEN as u8,
                tos: meta.tos,
                total_len: (IPV4_HEADER_LEN + data_len) as u16,
                ident,
                flags_frag: if meta.dont_fragment { IPV4_FLAG_DF } else { 0 },
                ttl: meta.ttl,
                protocol: meta.protocol,
                src: meta.src,
                dst: meta.dst,
            },
        );
        let mut w = dgram;
        w.give_bytes(&hdr);
        engine.counters.tx_dgrams += 1;
        return eth.send_ip4_frame(iface, dgram, next_hop);
    }

    if meta.dont_fragment {
        return Err(NetError::FragNeeded(mtu as u16));
    }

    // Local fragmentation: 8-byte-aligned payload slices, fresh header and
    // staging per fragment, payload spliced zero-copy from the original
    // chain.
    let ident = engine.take_ident();
    let max_frag = (mtu - IPV4_HEADER_LEN) & !7;
    debug_assert!(max_frag > 0);
    let mut off = 0;
    while off < data_len {
        let flen = max_frag.min(data_len - off);
        let more = off + flen < data_len;

        let data = payload.sub_from_to(off, flen);
        let data_node = data.to_node();

        let mut stage =
            TxFrame::<{ ETH_HEADER_LEN + IPV4_HEADER_LEN }>::new(ETH_HEADER_LEN, IPV4_HEADER_LEN);
        write_header(
            stage.staged_mut(),
            &Ipv4Header {
                ihl_bytes: IPV4_HEADER_LEN as u8,
                tos: meta.tos,
                total_len: (IPV4_HEADER_LEN + flen) as u16,
                ident,
                flags_frag: ((off / 8) as u16 & IPV4_OFFSET_MASK)
                    | if more { IPV4_FLAG_MF } else { 0 },
                ttl: meta.ttl,
                protocol: meta.protocol,
                src: meta.src,
                dst: meta.dst,
            },
        );
        let mut node = BufNode::empty();
        let dgram = stage.buf_ref(&mut node, Some((&data_node, flen)));
        eth.send_ip4_frame(iface, dgram, next_hop)?;
        engine.counters.tx_fragmented += 1;
        off += flen;
    }
    engine.counters.tx_dgrams += 1;
    Ok(())
}
