//! Ethernet adaptation layer: frame demux, framing, and the ARP cache.
//!
//! The adapter sits between one interface driver and the IPv4 engine.  On
//! receive it validates the Ethernet header, keeps only frames addressed
//! to us or to broadcast, answers ARP and learns mappings, and hands IPv4
//! payloads up.  On transmit it resolves the next-hop MAC through the ARP
//! cache, reveals the 14-byte header in front of the IP datagram and fills
//! it in place.
//!
//! # Cache policy
//!
//! The cache is a fixed array of entries threaded onto an MRU list with
//! array-index links.  Entries are *hard* (created by a resolution request
//! for an outgoing packet) or *weak* (learned passively from ARP traffic).
//! A resolution hit promotes a weak entry to hard.  On allocation when the
//! table is full the evictee comes from the over-budget class: inserting
//! weak evicts the oldest hard only while hard entries exceed
//! [`ARP_PROTECT_COUNT`](crate::config::ARP_PROTECT_COUNT), otherwise the
//! oldest weak goes, and symmetrically for hard inserts.  "Oldest" is the
//! tail of the MRU list within the class.
//!
//! # Aging
//!
//! A one-second tick counts `time_left` down per entry: Query entries
//! re-broadcast each tick and free at zero; Valid entries just age (a use
//! at zero turns them Refreshing); Refreshing entries re-probe unicast and
//! fall back to a broadcast Query at zero.

use log::{debug, trace};

use crate::buf::{BufNode, BufRef, TxFrame};
use crate::config::{
    ARP_PROTECT_COUNT, ARP_QUERY_TIMEOUT_SECS, ARP_REFRESH_TIMEOUT_SECS, ARP_VALID_TIMEOUT_SECS,
    NUM_ARP_ENTRIES,
};
use crate::ipv4::IfaceConfig;
use crate::types::{EtherType, Ipv4Addr, MacAddr, NetError};
use crate::{
    ARP_HEADER_LEN, ARP_HLEN_ETHERNET, ARP_HTYPE_ETHERNET, ARP_OPER_REPLY, ARP_OPER_REQUEST,
    ARP_PLEN_IPV4, ARP_PTYPE_IPV4, ETH_ADDR_LEN, ETH_HEADER_LEN, ETHERTYPE_ARP, ETHERTYPE_IPV4,
};

/// Index sentinel terminating the MRU list.
const NONE: u8 = u8::MAX;

/// Weak-class budget: slots not protected for hard entries.
const ARP_NON_PROTECT_COUNT: usize = NUM_ARP_ENTRIES - ARP_PROTECT_COUNT;

// =============================================================================
// Driver contract
// =============================================================================

/// Interface driver boundary.
///
/// `send_frame` receives a complete Ethernet frame; the buffer chain is
/// valid only for the duration of the call (drivers copy into their TX
/// ring).  `eth_mtu` includes the Ethernet header budget.
pub trait EthDriver {
    fn send_frame(&mut self, frame: BufRef) -> Result<(), NetError>;
    fn eth_mtu(&self) -> usize;
    fn mac_addr(&self) -> MacAddr;
}

// =============================================================================
// ARP entries
// =============================================================================

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ArpState {
    Free,
    /// Request broadcast, no answer yet.  Senders get [`NetError::ArpQuery`].
    Query,
    /// Mapping known and fresh.
    Valid,
    /// Mapping known but stale; unicast re-probe in flight, still usable.
    Refreshing,
}

#[derive(Clone, Copy)]
struct ArpEntry {
    next: u8,
    state: ArpState,
    weak: bool,
    time_left: u8,
    mac: MacAddr,
    ip: Ipv4Addr,
}

// =============================================================================
// EthAdapter
// =============================================================================

/// Result of feeding a received frame to the adapter.
pub enum EthRx {
    /// An IPv4 payload addressed to us; Ethernet header already consumed.
    Ipv4(BufRef),
    /// Frame handled internally (ARP) or dropped.
    Consumed,
}

/// The Ethernet adapter: one driver, one ARP cache.
pub struct EthAdapter<D: EthDriver> {
    driver: D,
    mac: MacAddr,
    first_entry: u8,
    entries: [ArpEntry; NUM_ARP_ENTRIES],
}

impl<D: EthDriver> EthAdapter<D> {
    pub fn new(driver: D) -> Self {
        let mac = driver.mac_addr();
        let mut entries = [ArpEntry {
            next: NONE,
            state: ArpState::Free,
            weak: true,
            time_left: 0,
            mac: MacAddr::ZERO,
            ip: Ipv4Addr::UNSPECIFIED,
        }; NUM_ARP_ENTRIES];
        for (i, e) in entries.iter_mut().enumerate() {
            e.next = if i + 1 < NUM_ARP_ENTRIES {
                (i + 1) as u8
            } else {
                NONE
            };
        }
        Self {
            driver,
            mac,
            first_entry: 0,
            entries,
        }
    }

    /// IP-layer MTU of the interface (Ethernet MTU minus the header).
    pub fn ip_mtu(&self) -> usize {
        let eth_mtu = self.driver.eth_mtu();
        debug_assert!(eth_mtu > ETH_HEADER_LEN);
        eth_mtu - ETH_HEADER_LEN
    }

    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    // =========================================================================
    // Receive path
    // =========================================================================

    /// Demux one received Ethernet frame.
    pub fn recv_frame(&mut self, iface: &IfaceConfig, frame: BufRef) -> EthRx {
        if !frame.has_header(ETH_HEADER_LEN) {
            return EthRx::Consumed;
        }
        let hdr = frame.chunk();
        let mut dst = [0u8; ETH_ADDR_LEN];
        let mut src = [0u8; ETH_ADDR_LEN];
        dst.copy_from_slice(&hdr[0..6]);
        src.copy_from_slice(&hdr[6..12]);
        let ethertype = u16::from_be_bytes([hdr[12], hdr[13]]);
        let dst = MacAddr(dst);
        let src = MacAddr(src);

        if dst != self.mac && !dst.is_broadcast() {
            return EthRx::Consumed;
        }

        let pkt = frame.hide_header(ETH_HEADER_LEN);

        match EtherType::from_u16(ethertype) {
            Some(EtherType::Ipv4) => EthRx::Ipv4(pkt),
            Some(EtherType::Arp) => {
                self.recv_arp(iface, src, pkt);
                EthRx::Consumed
            }
            None => {
                trace!("eth: dropping unknown ethertype 0x{ethertype:04x}");
                EthRx::Consumed
            }
        }
    }

    /// Validate and process an ARP packet.
    fn recv_arp(&mut self, iface: &IfaceConfig, frame_src: MacAddr, pkt: BufRef) {
        if !pkt.has_header(ARP_HEADER_LEN) {
            return;
        }
        let data = pkt.chunk();

        let htype = u16::from_be_bytes([data[0], data[1]]);
        let ptype = u16::from_be_bytes([data[2], data[3]]);
        let hlen = data[4];
        let plen = data[5];
        let oper = u16::from_be_bytes([data[6], data[7]]);
        let sender_mac = MacAddr([data[8], data[9], data[10], data[11], data[12], data[13]]);
        let sender_ip = Ipv4Addr([data[14], data[15], data[16], data[17]]);
        let target_ip = Ipv4Addr([data[24], data[25], data[26], data[27]]);

        if htype != ARP_HTYPE_ETHERNET
            || ptype != ARP_PTYPE_IPV4
            || hlen != ARP_HLEN_ETHERNET
            || plen != ARP_PLEN_IPV4
            || sender_mac != frame_src
        {
            trace!("arp: malformed packet (htype={htype}, ptype=0x{ptype:04x})");
            return;
        }

        self.save_hw_addr(iface, sender_ip, sender_mac);

        if oper == ARP_OPER_REQUEST && target_ip == iface.addr && !iface.addr.is_unspecified() {
            debug!("arp: request for {} from {}, replying", target_ip, sender_ip);
            self.send_arp_packet(iface, ARP_OPER_REPLY, sender_mac, sender_ip);
        }
    }

    // =========================================================================
    // Transmit path
    // =========================================================================

    /// Send an IP datagram to `next_hop`, revealing and filling the
    /// Ethernet header in front of `pkt`.
    pub fn send_ip4_frame(
        &mut self,
        iface: &IfaceConfig,
        pkt: BufRef,
        next_hop: Ipv4Addr,
    ) -> Result<(), NetError> {
        let dst_mac = self.resolve_hw_addr(iface, next_hop)?;

        let frame = pkt.reveal_header(ETH_HEADER_LEN).ok_or_else(|| {
            debug!("eth: no header space for Ethernet header");
            NetError::NoHeaderSpace
        })?;

        let mut hdr = [0u8; ETH_HEADER_LEN];
        hdr[0..6].copy_from_slice(dst_mac.as_bytes());
        hdr[6..12].copy_from_slice(self.mac.as_bytes());
        hdr[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        let mut w = frame;
        w.give_bytes(&hdr);

        self.driver.send_frame(frame)
    }

    /// Resolve `ip` to a MAC address, creating or refreshing cache entries
    /// as needed.
    fn resolve_hw_addr(&mut self, iface: &IfaceConfig, ip: Ipv4Addr) -> Result<MacAddr, NetError> {
        if ip.is_limited_broadcast() {
            return Ok(MacAddr::BROADCAST);
        }
        if !ip.in_subnet(iface.addr, iface.netmask) {
            return Err(NetError::NoHwRoute);
        }
        if ip == iface.broadcast() {
            return Ok(MacAddr::BROADCAST);
        }

        let idx = self.get_arp_entry(ip, false);

        if self.entries[idx].state == ArpState::Free {
            self.entries[idx].state = ArpState::Query;
            self.entries[idx].time_left = ARP_QUERY_TIMEOUT_SECS;
            debug!("arp: querying {}", ip);
            self.send_arp_packet(iface, ARP_OPER_REQUEST, MacAddr::BROADCAST, ip);
        }

        if self.entries[idx].state == ArpState::Query {
            return Err(NetError::ArpQuery);
        }

        if self.entries[idx].state == ArpState::Valid && self.entries[idx].time_left == 0 {
            self.entries[idx].state = ArpState::Refreshing;
            self.entries[idx].time_left = ARP_REFRESH_TIMEOUT_SECS;
            let mac = self.entries[idx].mac;
            trace!("arp: {} stale, refreshing", ip);
            self.send_arp_packet(iface, ARP_OPER_REQUEST, mac, ip);
        }

        Ok(self.entries[idx].mac)
    }

    /// Passively learn a mapping for a local-subnet address.
    fn save_hw_addr(&mut self, iface: &IfaceConfig, ip: Ipv4Addr, mac: MacAddr) {
        if ip.in_subnet(iface.addr, iface.netmask) && ip != iface.broadcast() {
            let idx = self.get_arp_entry(ip, true);
            self.entries[idx].state = ArpState::Valid;
            self.entries[idx].time_left = ARP_VALID_TIMEOUT_SECS;
            self.entries[idx].mac = mac;
        }
    }

    /// Find or allocate the cache entry for `ip`, maintaining MRU order and
    /// the weak/hard class budgets.  Returns the entry's index after moving
    /// it to the list head.
    fn get_arp_entry(&mut self, ip: Ipv4Addr, weak: bool) -> usize {
        let mut index = self.first_entry;
        let mut prev = NONE;

        let mut num_hard = 0usize;
        let mut last_weak = NONE;
        let mut last_weak_prev = NONE;
        let mut last_hard = NONE;
        let mut last_hard_prev = NONE;

        while index != NONE {
            let e = &self.entries[index as usize];
            if e.state != ArpState::Free && e.ip == ip {
                break;
            }
            if e.weak {
                last_weak = index;
                last_weak_prev = prev;
            } else {
                num_hard += 1;
                last_hard = index;
                last_hard_prev = prev;
            }
            prev = index;
            index = e.next;
        }

        if index != NONE {
            // Hit: a hard reference promotes a weak entry.
            if !weak {
                self.entries[index as usize].weak = false;
            }
        } else {
            // Miss: pick the victim class.  A free entry at the weak tail is
            // always preferred (fresh entries start weak, so the tail of the
            // weak class is where free slots accumulate).
            let use_weak = if last_weak != NONE && self.entries[last_weak as usize].state == ArpState::Free
            {
                true
            } else if weak {
                !(num_hard > ARP_PROTECT_COUNT || last_weak == NONE)
            } else {
                let num_weak = NUM_ARP_ENTRIES - num_hard;
                num_weak > ARP_NON_PROTECT_COUNT || last_hard == NONE
            };

            if use_weak {
                index = last_weak;
                prev = last_weak_prev;
            } else {
                index = last_hard;
                prev = last_hard_prev;
            }
            debug_assert!(index != NONE);

            let e = &mut self.entries[index as usize];
            e.state = ArpState::Free;
            e.ip = ip;
            e.weak = weak;
        }

        // Move to front.
        if prev != NONE {
            self.entries[prev as usize].next = self.entries[index as usize].next;
            self.entries[index as usize].next = self.first_entry;
            self.first_entry = index;
        }

        index as usize
    }

    /// Build and transmit one ARP packet.
    fn send_arp_packet(
        &mut self,
        iface: &IfaceConfig,
        oper: u16,
        dst_mac: MacAddr,
        dst_ip: Ipv4Addr,
    ) {
        const PKT: usize = ETH_HEADER_LEN + ARP_HEADER_LEN;
        let mut frame = TxFrame::<PKT>::new(0, PKT);
        {
            let b = frame.staged_mut();
            b[0..6].copy_from_slice(dst_mac.as_bytes());
            b[6..12].copy_from_slice(self.mac.as_bytes());
            b[12..14].copy_from_slice(&ETHERTYPE_ARP.to_be_bytes());
            let a = &mut b[ETH_HEADER_LEN..];
            a[0..2].copy_from_slice(&ARP_HTYPE_ETHERNET.to_be_bytes());
            a[2..4].copy_from_slice(&ARP_PTYPE_IPV4.to_be_bytes());
            a[4] = ARP_HLEN_ETHERNET;
            a[5] = ARP_PLEN_IPV4;
            a[6..8].copy_from_slice(&oper.to_be_bytes());
            a[8..14].copy_from_slice(self.mac.as_bytes());
            a[14..18].copy_from_slice(&iface.addr.0);
            a[18..24].copy_from_slice(dst_mac.as_bytes());
            a[24..28].copy_from_slice(&dst_ip.0);
        }
        let mut node = BufNode::empty();
        let buf = frame.buf_ref(&mut node, None);
        if let Err(e) = self.driver.send_frame(buf) {
            debug!("arp: tx failed: {e}");
        }
    }

    // =========================================================================
    // Aging
    // =========================================================================

    /// One-second aging tick over the cache.
    pub fn on_second_tick(&mut self, iface: &IfaceConfig) {
        for i in 0..NUM_ARP_ENTRIES {
            let (state, time_left, ip, mac) = {
                let e = &self.entries[i];
                (e.state, e.time_left, e.ip, e.mac)
            };
            match state {
                ArpState::Query => {
                    let t = time_left - 1;
                    self.entries[i].time_left = t;
                    if t == 0 {
                        trace!("arp: query for {} timed out", ip);
                        self.entries[i].state = ArpState::Free;
                    } else {
                        self.send_arp_packet(iface, ARP_OPER_REQUEST, MacAddr::BROADCAST, ip);
                    }
                }
                ArpState::Valid => {
                    if time_left > 0 {
                        self.entries[i].time_left = time_left - 1;
                    }
                }
                ArpState::Refreshing => {
                    let t = time_left - 1;
                    self.entries[i].time_left = t;
                    if t == 0 {
                        self.entries[i].state = ArpState::Query;
                        self.entries[i].time_left = ARP_QUERY_TIMEOUT_SECS;
                        self.send_arp_packet(iface, ARP_OPER_REQUEST, MacAddr::BROADCAST, ip);
                    } else {
                        self.send_arp_packet(iface, ARP_OPER_REQUEST, mac, ip);
                    }
                }
                ArpState::Free => {}
            }
        }
    }

    /// Number of non-free cache entries (diagnostics).
    pub fn arp_entry_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.state != ArpState::Free)
            .count()
    }
}
