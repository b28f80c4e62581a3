//! Ethernet adapter and ARP cache behavior.

use crate::buf::{BufNode, BufRef};
use crate::config::{ARP_QUERY_TIMEOUT_SECS, NUM_ARP_ENTRIES};
use crate::eth::{EthAdapter, EthRx};
use crate::testutil::{
    MockDriver, OUR_MAC, PEER_IP, PEER_MAC, arp_reply_frame, arp_request_frame, eth_dst,
    eth_ethertype, test_iface,
};
use crate::types::{Ipv4Addr, MacAddr, NetError};
use crate::{ARP_OPER_REPLY, ARP_OPER_REQUEST, ETH_HEADER_LEN, ETHERTYPE_ARP, ETHERTYPE_IPV4};

fn feed(eth: &mut EthAdapter<MockDriver>, frame: &[u8]) -> bool {
    let iface = test_iface();
    let node = BufNode::from_slice(frame);
    let buf = BufRef::new(&node, 0, frame.len());
    matches!(eth.recv_frame(&iface, buf), EthRx::Ipv4(_))
}

/// Send a minimal IP payload with Ethernet headroom through the adapter.
fn try_send(eth: &mut EthAdapter<MockDriver>, next_hop: Ipv4Addr) -> Result<(), NetError> {
    let iface = test_iface();
    let mut store = [0u8; ETH_HEADER_LEN + 20];
    let node = BufNode::from_slice_mut(&mut store);
    let pkt = BufRef::new(&node, ETH_HEADER_LEN, 20);
    eth.send_ip4_frame(&iface, pkt, next_hop)
}

fn arp_oper(frame: &[u8]) -> u16 {
    u16::from_be_bytes([frame[ETH_HEADER_LEN + 6], frame[ETH_HEADER_LEN + 7]])
}

#[test]
fn frames_for_other_macs_are_dropped() {
    let mut eth = EthAdapter::new(MockDriver::new());
    let other = MacAddr([0x02, 9, 9, 9, 9, 9]);
    let mut frame = std::vec![0u8; 60];
    frame[0..6].copy_from_slice(other.as_bytes());
    frame[6..12].copy_from_slice(PEER_MAC.as_bytes());
    frame[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
    assert!(!feed(&mut eth, &frame));

    // Addressed to us: passes.
    frame[0..6].copy_from_slice(OUR_MAC.as_bytes());
    assert!(feed(&mut eth, &frame));
    // Broadcast: passes.
    frame[0..6].copy_from_slice(MacAddr::BROADCAST.as_bytes());
    assert!(feed(&mut eth, &frame));
}

#[test]
fn arp_request_for_our_ip_gets_unicast_reply() {
    let mut eth = EthAdapter::new(MockDriver::new());
    let iface = test_iface();
    let frame = arp_request_frame(PEER_IP, PEER_MAC, iface.addr);
    feed(&mut eth, &frame);

    let sent = &eth.driver_mut().sent;
    assert_eq!(sent.len(), 1);
    let reply = &sent[0];
    assert_eq!(eth_ethertype(reply), ETHERTYPE_ARP);
    assert_eq!(eth_dst(reply), PEER_MAC, "reply is unicast");
    assert_eq!(arp_oper(reply), ARP_OPER_REPLY);
    // Sender fields carry our identity.
    assert_eq!(&reply[ETH_HEADER_LEN + 8..ETH_HEADER_LEN + 14], OUR_MAC.as_bytes());
    assert_eq!(&reply[ETH_HEADER_LEN + 14..ETH_HEADER_LEN + 18], &iface.addr.0);
}

#[test]
fn arp_request_for_other_ip_learns_but_stays_quiet() {
    let mut eth = EthAdapter::new(MockDriver::new());
    let frame = arp_request_frame(PEER_IP, PEER_MAC, Ipv4Addr([10, 0, 0, 9]));
    feed(&mut eth, &frame);
    assert!(eth.driver_mut().sent.is_empty());
    // The sender was learned: an immediate send needs no query.
    assert!(try_send(&mut eth, PEER_IP).is_ok());
    let frame = eth.driver_mut().sent.pop().unwrap();
    assert_eq!(eth_dst(&frame), PEER_MAC);
}

#[test]
fn resolve_query_then_success_after_reply() {
    let mut eth = EthAdapter::new(MockDriver::new());

    // First send: no mapping -> broadcast query, ArpQuery returned.
    assert_eq!(try_send(&mut eth, PEER_IP), Err(NetError::ArpQuery));
    {
        let sent = &eth.driver_mut().sent;
        assert_eq!(sent.len(), 1);
        assert_eq!(eth_ethertype(&sent[0]), ETHERTYPE_ARP);
        assert_eq!(eth_dst(&sent[0]), MacAddr::BROADCAST);
        assert_eq!(arp_oper(&sent[0]), ARP_OPER_REQUEST);
    }

    // Peer answers; the next send goes straight out with the learned MAC.
    let reply = arp_reply_frame(PEER_IP, PEER_MAC, test_iface().addr);
    feed(&mut eth, &reply);
    assert!(try_send(&mut eth, PEER_IP).is_ok());
    let frame = eth.driver_mut().sent.pop().unwrap();
    assert_eq!(eth_ethertype(&frame), ETHERTYPE_IPV4);
    assert_eq!(eth_dst(&frame), PEER_MAC);
}

#[test]
fn broadcast_destinations_need_no_arp() {
    let mut eth = EthAdapter::new(MockDriver::new());
    assert!(try_send(&mut eth, Ipv4Addr::BROADCAST).is_ok());
    assert!(try_send(&mut eth, test_iface().broadcast()).is_ok());
    assert_eq!(eth.arp_entry_count(), 0, "no cache entry for broadcasts");
    for frame in &eth.driver_mut().sent {
        assert_eq!(eth_dst(frame), MacAddr::BROADCAST);
    }
}

#[test]
fn off_subnet_destination_has_no_hw_route() {
    let mut eth = EthAdapter::new(MockDriver::new());
    assert_eq!(
        try_send(&mut eth, Ipv4Addr([192, 168, 1, 1])),
        Err(NetError::NoHwRoute)
    );
}

#[test]
fn query_entry_ages_out() {
    let mut eth = EthAdapter::new(MockDriver::new());
    let iface = test_iface();
    assert_eq!(try_send(&mut eth, PEER_IP), Err(NetError::ArpQuery));
    assert_eq!(eth.arp_entry_count(), 1);

    // Each tick re-broadcasts until the countdown frees the entry.
    for _ in 0..ARP_QUERY_TIMEOUT_SECS {
        eth.on_second_tick(&iface);
    }
    assert_eq!(eth.arp_entry_count(), 0);
}

#[test]
fn weak_entries_lose_to_hard_budget_pressure() {
    let mut eth = EthAdapter::new(MockDriver::new());
    let iface = test_iface();

    // Learn NUM_ARP_ENTRIES weak entries passively (fills the table).
    for i in 0..NUM_ARP_ENTRIES as u8 {
        let ip = Ipv4Addr([10, 0, 0, 100 + i]);
        let mac = MacAddr([2, 0, 0, 0, 1, i]);
        feed(&mut eth, &arp_reply_frame(ip, mac, iface.addr));
    }
    assert_eq!(eth.arp_entry_count(), NUM_ARP_ENTRIES);

    // A hard resolution for a new address must evict a weak entry, and
    // the evictee is the oldest one (10.0.0.100).
    assert_eq!(try_send(&mut eth, PEER_IP), Err(NetError::ArpQuery));
    assert_eq!(eth.arp_entry_count(), NUM_ARP_ENTRIES);

    // The most recently learned weak entry must still be present.
    let newest = Ipv4Addr([10, 0, 0, 100 + NUM_ARP_ENTRIES as u8 - 1]);
    assert!(try_send(&mut eth, newest).is_ok());
}
