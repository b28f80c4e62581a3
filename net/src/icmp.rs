//! ICMP: echo reply, destination-unreachable parsing, and error
//! origination for the reassembly plane.
//!
//! Echo requests addressed to the interface (broadcast pings are ignored)
//! are answered in place with the request payload chained zero-copy into
//! the reply.  Destination-unreachable messages are parsed and surfaced
//! as an [`IcmpAction`] so the composition root can route
//! "fragmentation needed" to the protocol handler owning the quoted flow.

use log::{debug, trace};

use crate::buf::{BufNode, BufRef, TxFrame};
use crate::checksum::chain_checksum;
use crate::config::DEFAULT_TTL;
use crate::eth::{EthAdapter, EthDriver};
use crate::ipv4::{DgramMeta, IfaceConfig, Ip4RxInfo, Ipv4Engine, Ipv4Header, send_dgram};
use crate::reassembly::ReasmExpiry;
use crate::types::{IpProtocol, Ipv4Addr};
use crate::{
    ETH_HEADER_LEN, ICMP_CODE_REASS_TIMEOUT, ICMP_HEADER_LEN, ICMP_TYPE_DEST_UNREACH,
    ICMP_TYPE_ECHO_REPLY, ICMP_TYPE_ECHO_REQUEST, ICMP_TYPE_TIME_EXCEEDED, IPV4_HEADER_LEN,
};

/// What the caller must do with a received ICMP message after local
/// handling.
pub(crate) enum IcmpAction {
    /// Fully handled (echo replied, or dropped).
    None,
    /// Destination unreachable: dispatch to the protocol handler matching
    /// the encapsulated datagram.
    DestUnreach {
        code: u8,
        /// Next-hop MTU from the low half of the unused word (code 4).
        next_hop_mtu: u16,
        /// The encapsulated IP header (the datagram we sent).
        inner: Ipv4Header,
        /// Start of the encapsulated transport header (>= 8 bytes for
        /// well-formed senders).
        inner_payload: BufRef,
    },
}

/// Process one ICMP datagram addressed to us.
pub(crate) fn handle_rx<D: EthDriver>(
    engine: &mut Ipv4Engine,
    eth: &mut EthAdapter<D>,
    iface: &IfaceConfig,
    rx: &Ip4RxInfo,
    dgram: BufRef,
) -> IcmpAction {
    if !dgram.has_header(ICMP_HEADER_LEN) {
        engine.counters.rx_malformed += 1;
        return IcmpAction::None;
    }
    if chain_checksum(dgram, dgram.total_len()) != 0 {
        trace!("icmp: bad checksum from {}", rx.src);
        engine.counters.rx_bad_checksum += 1;
        return IcmpAction::None;
    }
    let head = dgram.chunk();
    let msg_type = head[0];
    let code = head[1];

    match msg_type {
        ICMP_TYPE_ECHO_REQUEST => {
            // Only unicast pings to our address get a reply.
            if rx.dst == iface.addr {
                let rest_of_header = [head[4], head[5], head[6], head[7]];
                send_echo_reply(
                    engine,
                    eth,
                    iface,
                    rx.src,
                    rest_of_header,
                    dgram.hide_header(ICMP_HEADER_LEN),
                );
            }
            IcmpAction::None
        }
        ICMP_TYPE_DEST_UNREACH => {
            let next_hop_mtu = u16::from_be_bytes([head[6], head[7]]);
            let encap = dgram.hide_header(ICMP_HEADER_LEN);
            if !encap.has_header(IPV4_HEADER_LEN) {
                return IcmpAction::None;
            }
            let Some(inner) = crate::ipv4::parse_header(encap.chunk()) else {
                return IcmpAction::None;
            };
            let ihl = inner.ihl_bytes as usize;
            if !encap.has_header(ihl) || encap.total_len() < ihl {
                return IcmpAction::None;
            }
            // The quoted datagram must be one *we* sent.
            if inner.src != iface.addr {
                return IcmpAction::None;
            }
            IcmpAction::DestUnreach {
                code,
                next_hop_mtu,
                inner,
                inner_payload: encap.hide_header(ihl),
            }
        }
        _ => {
            trace!("icmp: ignoring type {} from {}", msg_type, rx.src);
            IcmpAction::None
        }
    }
}

/// Reply to an echo request, chaining the request payload.
fn send_echo_reply<D: EthDriver>(
    engine: &mut Ipv4Engine,
    eth: &mut EthAdapter<D>,
    iface: &IfaceConfig,
    dst: Ipv4Addr,
    rest_of_header: [u8; 4],
    echo_data: BufRef,
) {
    let mut frame = TxFrame::<{ ETH_HEADER_LEN + IPV4_HEADER_LEN + ICMP_HEADER_LEN }>::new(
        ETH_HEADER_LEN + IPV4_HEADER_LEN,
        ICMP_HEADER_LEN,
    );
    {
        let s = frame.staged_mut();
        s[0] = ICMP_TYPE_ECHO_REPLY;
        s[1] = 0;
        s[2..4].copy_from_slice(&[0, 0]);
        s[4..8].copy_from_slice(&rest_of_header);
    }

    let data_len = echo_data.total_len();
    let data_node;
    let mut node = BufNode::empty();
    let msg = if data_len > 0 {
        data_node = echo_data.to_node();
        frame.buf_ref(&mut node, Some((&data_node, data_len)))
    } else {
        frame.buf_ref(&mut node, None)
    };

    let csum = chain_checksum(msg, ICMP_HEADER_LEN + data_len);
    frame.staged_mut()[2..4].copy_from_slice(&csum.to_be_bytes());

    let meta = DgramMeta {
        src: iface.addr,
        dst,
        protocol: IpProtocol::Icmp.as_u8(),
        ttl: DEFAULT_TTL,
        tos: 0,
        dont_fragment: false,
    };
    if let Err(e) = send_dgram(engine, eth, iface, &meta, msg) {
        debug!("icmp: echo reply to {} failed: {}", dst, e);
    }
}

/// Originate a time-exceeded (reassembly timeout) error for an expired
/// reassembly context.
pub(crate) fn send_time_exceeded<D: EthDriver>(
    engine: &mut Ipv4Engine,
    eth: &mut EthAdapter<D>,
    iface: &IfaceConfig,
    expiry: &ReasmExpiry,
) {
    const STAGE: usize =
        ETH_HEADER_LEN + IPV4_HEADER_LEN + ICMP_HEADER_LEN + crate::reassembly::QUOTE_MAX;
    let quote_len = expiry.quote_len as usize;
    let mut frame =
        TxFrame::<STAGE>::new(ETH_HEADER_LEN + IPV4_HEADER_LEN, ICMP_HEADER_LEN + quote_len);
    {
        let s = frame.staged_mut();
        s[0] = ICMP_TYPE_TIME_EXCEEDED;
        s[1] = ICMP_CODE_REASS_TIMEOUT;
        s[2..8].copy_from_slice(&[0; 6]);
        s[ICMP_HEADER_LEN..].copy_from_slice(&expiry.quote[..quote_len]);
    }

    let mut node = BufNode::empty();
    let msg = frame.buf_ref(&mut node, None);
    let csum = chain_checksum(msg, ICMP_HEADER_LEN + quote_len);
    frame.staged_mut()[2..4].copy_from_slice(&csum.to_be_bytes());

    let meta = DgramMeta {
        src: iface.addr,
        dst: expiry.src,
        protocol: IpProtocol::Icmp.as_u8(),
        ttl: DEFAULT_TTL,
        tos: 0,
        dont_fragment: false,
    };
    debug!("icmp: reassembly time exceeded -> {}", expiry.src);
    let _ = send_dgram(engine, eth, iface, &meta, msg);
}
