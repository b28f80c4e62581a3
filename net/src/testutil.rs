//! Shared helpers for the test suites: a capturing mock driver, wire
//! frame builders with real checksums, and parsers for captured frames.

use std::vec::Vec;

use crate::buf::{BufNode, BufRef};
use crate::checksum::{ChecksumAccum, header_checksum};
use crate::eth::EthDriver;
use crate::ipv4::IfaceConfig;
use crate::types::{Ipv4Addr, MacAddr, NetError};
use crate::{ETH_HEADER_LEN, ETHERTYPE_ARP, ETHERTYPE_IPV4, IPV4_HEADER_LEN, TCP_HEADER_LEN};

pub const OUR_MAC: MacAddr = MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
pub const PEER_MAC: MacAddr = MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x02]);
pub const OUR_IP: Ipv4Addr = Ipv4Addr([10, 0, 0, 1]);
pub const PEER_IP: Ipv4Addr = Ipv4Addr([10, 0, 0, 2]);

pub fn test_iface() -> IfaceConfig {
    IfaceConfig {
        addr: OUR_IP,
        netmask: Ipv4Addr([255, 255, 255, 0]),
        gateway: Ipv4Addr([10, 0, 0, 254]),
    }
}

// =============================================================================
// Mock driver
// =============================================================================

/// Driver that copies every transmitted frame into a log.
pub struct MockDriver {
    pub sent: Vec<Vec<u8>>,
    pub mtu: usize,
    pub fail_tx: bool,
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            sent: Vec::new(),
            mtu: 1514,
            fail_tx: false,
        }
    }

    pub fn with_mtu(mtu: usize) -> Self {
        Self {
            sent: Vec::new(),
            mtu,
            fail_tx: false,
        }
    }
}

impl EthDriver for MockDriver {
    fn send_frame(&mut self, frame: BufRef) -> Result<(), NetError> {
        if self.fail_tx {
            return Err(NetError::OutOfBuffers);
        }
        let mut bytes = std::vec![0u8; frame.total_len()];
        let mut r = frame;
        r.take_bytes(bytes.len(), &mut bytes);
        self.sent.push(bytes);
        Ok(())
    }

    fn eth_mtu(&self) -> usize {
        self.mtu
    }

    fn mac_addr(&self) -> MacAddr {
        OUR_MAC
    }
}

// =============================================================================
// Frame builders
// =============================================================================

pub fn eth_frame(dst: MacAddr, src: MacAddr, ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut f = Vec::with_capacity(ETH_HEADER_LEN + payload.len());
    f.extend_from_slice(dst.as_bytes());
    f.extend_from_slice(src.as_bytes());
    f.extend_from_slice(&ethertype.to_be_bytes());
    f.extend_from_slice(payload);
    f
}

pub fn ipv4_packet(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    ident: u16,
    flags_frag: u16,
    payload: &[u8],
) -> Vec<u8> {
    let total = IPV4_HEADER_LEN + payload.len();
    let mut p = std::vec![0u8; total];
    p[0] = 0x45;
    p[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    p[4..6].copy_from_slice(&ident.to_be_bytes());
    p[6..8].copy_from_slice(&flags_frag.to_be_bytes());
    p[8] = 64;
    p[9] = protocol;
    p[12..16].copy_from_slice(&src.0);
    p[16..20].copy_from_slice(&dst.0);
    let csum = header_checksum(&p[..IPV4_HEADER_LEN]);
    p[10..12].copy_from_slice(&csum.to_be_bytes());
    p[IPV4_HEADER_LEN..].copy_from_slice(payload);
    p
}

#[allow(clippy::too_many_arguments)]
pub fn tcp_segment(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    sport: u16,
    dport: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    wnd: u16,
    options: &[u8],
    payload: &[u8],
) -> Vec<u8> {
    assert!(options.len() % 4 == 0);
    let hdr_len = TCP_HEADER_LEN + options.len();
    let mut seg = std::vec![0u8; hdr_len + payload.len()];
    seg[0..2].copy_from_slice(&sport.to_be_bytes());
    seg[2..4].copy_from_slice(&dport.to_be_bytes());
    seg[4..8].copy_from_slice(&seq.to_be_bytes());
    seg[8..12].copy_from_slice(&ack.to_be_bytes());
    seg[12] = ((hdr_len / 4) as u8) << 4;
    seg[13] = flags;
    seg[14..16].copy_from_slice(&wnd.to_be_bytes());
    seg[TCP_HEADER_LEN..hdr_len].copy_from_slice(options);
    seg[hdr_len..].copy_from_slice(payload);

    let mut acc = ChecksumAccum::new();
    acc.add_pseudo_header(src, dst, 6, seg.len());
    acc.add_bytes(&seg);
    let csum = acc.finish();
    seg[16..18].copy_from_slice(&csum.to_be_bytes());
    seg
}

/// A complete Ethernet frame carrying a TCP segment from the peer.
#[allow(clippy::too_many_arguments)]
pub fn peer_tcp_frame(
    sport: u16,
    dport: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    wnd: u16,
    options: &[u8],
    payload: &[u8],
) -> Vec<u8> {
    let seg = tcp_segment(
        PEER_IP, OUR_IP, sport, dport, seq, ack, flags, wnd, options, payload,
    );
    let pkt = ipv4_packet(PEER_IP, OUR_IP, 6, 7, 0, &seg);
    eth_frame(OUR_MAC, PEER_MAC, ETHERTYPE_IPV4, &pkt)
}

pub fn arp_reply_frame(sender_ip: Ipv4Addr, sender_mac: MacAddr, target_ip: Ipv4Addr) -> Vec<u8> {
    let mut a = [0u8; 28];
    a[0..2].copy_from_slice(&1u16.to_be_bytes());
    a[2..4].copy_from_slice(&0x0800u16.to_be_bytes());
    a[4] = 6;
    a[5] = 4;
    a[6..8].copy_from_slice(&2u16.to_be_bytes());
    a[8..14].copy_from_slice(sender_mac.as_bytes());
    a[14..18].copy_from_slice(&sender_ip.0);
    a[18..24].copy_from_slice(OUR_MAC.as_bytes());
    a[24..28].copy_from_slice(&target_ip.0);
    eth_frame(OUR_MAC, sender_mac, ETHERTYPE_ARP, &a)
}

pub fn arp_request_frame(sender_ip: Ipv4Addr, sender_mac: MacAddr, target_ip: Ipv4Addr) -> Vec<u8> {
    let mut a = [0u8; 28];
    a[0..2].copy_from_slice(&1u16.to_be_bytes());
    a[2..4].copy_from_slice(&0x0800u16.to_be_bytes());
    a[4] = 6;
    a[5] = 4;
    a[6..8].copy_from_slice(&1u16.to_be_bytes());
    a[8..14].copy_from_slice(sender_mac.as_bytes());
    a[14..18].copy_from_slice(&sender_ip.0);
    a[24..28].copy_from_slice(&target_ip.0);
    eth_frame(MacAddr::BROADCAST, sender_mac, ETHERTYPE_ARP, &a)
}

/// ICMP echo request from the peer with the given identifier bytes and
/// payload.
pub fn icmp_echo_request_frame(ident_seq: [u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut msg = std::vec![0u8; 8 + payload.len()];
    msg[0] = crate::ICMP_TYPE_ECHO_REQUEST;
    msg[4..8].copy_from_slice(&ident_seq);
    msg[8..].copy_from_slice(payload);
    let csum = header_checksum(&msg);
    msg[2..4].copy_from_slice(&csum.to_be_bytes());
    let pkt = ipv4_packet(PEER_IP, OUR_IP, 1, 40, 0, &msg);
    eth_frame(OUR_MAC, PEER_MAC, ETHERTYPE_IPV4, &pkt)
}

/// ICMP destination-unreachable (fragmentation needed) from the peer,
/// quoting a TCP datagram we sent.
pub fn icmp_frag_needed_frame(next_hop_mtu: u16, sport: u16, dport: u16, quoted_seq: u32) -> Vec<u8> {
    // The quoted datagram: our IP header plus the first 8 TCP bytes.
    let mut quoted_tcp = [0u8; 8];
    quoted_tcp[0..2].copy_from_slice(&sport.to_be_bytes());
    quoted_tcp[2..4].copy_from_slice(&dport.to_be_bytes());
    quoted_tcp[4..8].copy_from_slice(&quoted_seq.to_be_bytes());
    let quoted_ip = ipv4_packet(OUR_IP, PEER_IP, 6, 99, 0x4000, &quoted_tcp);

    let mut msg = std::vec![0u8; 8 + quoted_ip.len()];
    msg[0] = crate::ICMP_TYPE_DEST_UNREACH;
    msg[1] = crate::ICMP_CODE_FRAG_NEEDED;
    msg[6..8].copy_from_slice(&next_hop_mtu.to_be_bytes());
    msg[8..].copy_from_slice(&quoted_ip);
    let csum = header_checksum(&msg);
    msg[2..4].copy_from_slice(&csum.to_be_bytes());
    let pkt = ipv4_packet(PEER_IP, OUR_IP, 1, 41, 0, &msg);
    eth_frame(OUR_MAC, PEER_MAC, ETHERTYPE_IPV4, &pkt)
}

// =============================================================================
// Frame parsers
// =============================================================================

pub fn eth_ethertype(frame: &[u8]) -> u16 {
    u16::from_be_bytes([frame[12], frame[13]])
}

pub fn eth_dst(frame: &[u8]) -> MacAddr {
    let mut m = [0u8; 6];
    m.copy_from_slice(&frame[0..6]);
    MacAddr(m)
}

/// Parsed view of a captured TCP frame.
#[derive(Debug)]
pub struct TcpView {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub ip_ident: u16,
    pub ip_df: bool,
    pub sport: u16,
    pub dport: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub wnd: u16,
    pub options: Vec<u8>,
    pub payload: Vec<u8>,
}

pub const FIN: u8 = 0x01;
pub const SYN: u8 = 0x02;
pub const RST: u8 = 0x04;
pub const PSH: u8 = 0x08;
pub const ACK: u8 = 0x10;

/// Parse an Ethernet frame known to carry an unfragmented TCP segment.
pub fn parse_tcp(frame: &[u8]) -> TcpView {
    assert_eq!(eth_ethertype(frame), ETHERTYPE_IPV4, "not IPv4");
    let ip = &frame[ETH_HEADER_LEN..];
    let ihl = ((ip[0] & 0x0f) as usize) * 4;
    let total = u16::from_be_bytes([ip[2], ip[3]]) as usize;
    assert_eq!(ip[9], 6, "not TCP");
    let seg = &ip[ihl..total];
    let hdr_len = ((seg[12] >> 4) as usize) * 4;
    TcpView {
        src_ip: Ipv4Addr([ip[12], ip[13], ip[14], ip[15]]),
        dst_ip: Ipv4Addr([ip[16], ip[17], ip[18], ip[19]]),
        ip_ident: u16::from_be_bytes([ip[4], ip[5]]),
        ip_df: ip[6] & 0x40 != 0,
        sport: u16::from_be_bytes([seg[0], seg[1]]),
        dport: u16::from_be_bytes([seg[2], seg[3]]),
        seq: u32::from_be_bytes([seg[4], seg[5], seg[6], seg[7]]),
        ack: u32::from_be_bytes([seg[8], seg[9], seg[10], seg[11]]),
        flags: seg[13],
        wnd: u16::from_be_bytes([seg[14], seg[15]]),
        options: seg[TCP_HEADER_LEN..hdr_len].to_vec(),
        payload: seg[hdr_len..].to_vec(),
    }
}

/// MSS announced in the options of a SYN/SYN-ACK, if present.
pub fn find_mss_option(options: &[u8]) -> Option<u16> {
    let mut i = 0;
    while i < options.len() {
        match options[i] {
            0 => break,
            1 => i += 1,
            2 if i + 3 < options.len() && options[i + 1] == 4 => {
                return Some(u16::from_be_bytes([options[i + 2], options[i + 3]]));
            }
            _ => {
                if i + 1 >= options.len() {
                    break;
                }
                i += options[i + 1].max(2) as usize;
            }
        }
    }
    None
}

/// Wrap raw frame bytes and feed them through a closure as a `BufRef`.
pub fn with_frame_ref<R>(bytes: &[u8], f: impl FnOnce(BufRef) -> R) -> R {
    let node = BufNode::from_slice(bytes);
    f(BufRef::new(&node, 0, bytes.len()))
}
