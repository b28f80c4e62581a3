//! PMTU cache: reference counting, the free-list discipline, clamping,
//! and minute aging.

use crate::config::{MIN_MTU, MTU_TIMEOUT_MINUTES, NUM_MTU_ENTRIES};
use crate::pmtu::{MtuRef, PmtuCache};
use crate::testutil::test_iface;
use crate::types::{Ipv4Addr, NetError};

const IFACE_MTU: u16 = 1500;

fn remote(n: u8) -> Ipv4Addr {
    Ipv4Addr([10, 0, 0, n])
}

#[test]
fn setup_creates_and_shares_entries() {
    let iface = test_iface();
    let mut cache = PmtuCache::new();

    let mut r1 = MtuRef::new();
    r1.setup(&mut cache, remote(5), &iface, IFACE_MTU).unwrap();
    assert_eq!(r1.get_pmtu(&cache), IFACE_MTU);
    assert_eq!(cache.entry_count(), 1);

    // A second holder shares the same entry.
    let mut r2 = MtuRef::new();
    r2.setup(&mut cache, remote(5), &iface, IFACE_MTU).unwrap();
    assert_eq!(cache.entry_count(), 1);

    r1.reset(&mut cache);
    // Still referenced by r2: the entry must stay.
    assert_eq!(cache.entry_count(), 1);
    assert_eq!(r2.get_pmtu(&cache), IFACE_MTU);
    r2.reset(&mut cache);
    // Unused now, but still indexed.
    assert_eq!(cache.entry_count(), 1);
}

#[test]
fn unused_entry_is_reattached_with_its_estimate() {
    let iface = test_iface();
    let mut cache = PmtuCache::new();

    let mut r = MtuRef::new();
    r.setup(&mut cache, remote(6), &iface, IFACE_MTU).unwrap();
    assert!(r.handle_icmp_packet_too_big(&mut cache, 1200));
    r.reset(&mut cache);

    // Re-setup must find the Unused entry and keep the learned estimate.
    let mut r2 = MtuRef::new();
    r2.setup(&mut cache, remote(6), &iface, IFACE_MTU).unwrap();
    assert_eq!(r2.get_pmtu(&cache), 1200);
    r2.reset(&mut cache);
}

#[test]
fn unroutable_destination_is_refused() {
    let iface = crate::ipv4::IfaceConfig {
        gateway: Ipv4Addr::UNSPECIFIED,
        ..test_iface()
    };
    let mut cache = PmtuCache::new();
    let mut r = MtuRef::new();
    assert_eq!(
        r.setup(&mut cache, Ipv4Addr([192, 168, 9, 9]), &iface, IFACE_MTU),
        Err(NetError::NoHwRoute)
    );
    assert!(!r.is_setup());
}

#[test]
fn packet_too_big_clamps_and_reports_lowering() {
    let iface = test_iface();
    let mut cache = PmtuCache::new();
    let mut r = MtuRef::new();
    r.setup(&mut cache, remote(7), &iface, IFACE_MTU).unwrap();

    // A lowering report changes the estimate.
    assert!(r.handle_icmp_packet_too_big(&mut cache, 1400));
    assert_eq!(r.get_pmtu(&cache), 1400);

    // Equal or higher is ignored.
    assert!(!r.handle_icmp_packet_too_big(&mut cache, 1400));
    assert!(!r.handle_icmp_packet_too_big(&mut cache, 1500));
    assert_eq!(r.get_pmtu(&cache), 1400);

    // A zero MTU (router did not fill it in) clamps to the floor.
    assert!(r.handle_icmp_packet_too_big(&mut cache, 0));
    assert_eq!(r.get_pmtu(&cache), MIN_MTU);

    // Below-floor reports cannot push further down.
    assert!(!r.handle_icmp_packet_too_big(&mut cache, 100));
    assert_eq!(r.get_pmtu(&cache), MIN_MTU);

    r.reset(&mut cache);
}

#[test]
fn minute_sweep_expires_unused_and_resets_referenced() {
    let iface = test_iface();
    let mut cache = PmtuCache::new();

    let mut held = MtuRef::new();
    held.setup(&mut cache, remote(8), &iface, IFACE_MTU).unwrap();
    assert!(held.handle_icmp_packet_too_big(&mut cache, 1300));

    let mut dropped = MtuRef::new();
    dropped
        .setup(&mut cache, remote(9), &iface, IFACE_MTU)
        .unwrap();
    assert!(dropped.handle_icmp_packet_too_big(&mut cache, 1200));
    dropped.reset(&mut cache);
    assert_eq!(cache.entry_count(), 2);

    // Age everything to the timeout...
    for _ in 0..MTU_TIMEOUT_MINUTES {
        cache.on_minute_tick(&iface, IFACE_MTU);
    }
    // ...then one more sweep performs the expiry actions.
    cache.on_minute_tick(&iface, IFACE_MTU);

    // The unused entry is gone; the referenced one was reset to the
    // interface MTU.
    assert_eq!(cache.entry_count(), 1);
    assert_eq!(held.get_pmtu(&cache), IFACE_MTU);

    held.reset(&mut cache);
}

#[test]
fn lowering_resets_age_but_ignoring_does_not() {
    let iface = test_iface();
    let mut cache = PmtuCache::new();
    let mut r = MtuRef::new();
    r.setup(&mut cache, remote(10), &iface, IFACE_MTU).unwrap();

    // Age part-way, then lower: the age restarts, so the original
    // deadline passes without a reset.
    for _ in 0..(MTU_TIMEOUT_MINUTES - 2) {
        cache.on_minute_tick(&iface, IFACE_MTU);
    }
    assert!(r.handle_icmp_packet_too_big(&mut cache, 1100));
    for _ in 0..3 {
        cache.on_minute_tick(&iface, IFACE_MTU);
    }
    assert_eq!(r.get_pmtu(&cache), 1100, "estimate survived old deadline");

    r.reset(&mut cache);
}

#[test]
fn exhaustion_reuses_free_list_in_order() {
    let iface = test_iface();
    let mut cache = PmtuCache::new();

    let mut refs: std::vec::Vec<MtuRef> = (0..NUM_MTU_ENTRIES)
        .map(|i| {
            let mut r = MtuRef::new();
            r.setup(&mut cache, remote(20 + i as u8), &iface, IFACE_MTU)
                .unwrap();
            r
        })
        .collect();
    assert_eq!(cache.entry_count(), NUM_MTU_ENTRIES);

    // All entries referenced: a new destination cannot be tracked.
    let mut extra = MtuRef::new();
    assert_eq!(
        extra.setup(&mut cache, remote(99), &iface, IFACE_MTU),
        Err(NetError::OutOfResources)
    );

    // Release one; the new destination takes over its slot (the index
    // forgets the old key).
    refs[0].reset(&mut cache);
    extra.setup(&mut cache, remote(99), &iface, IFACE_MTU).unwrap();
    assert_eq!(cache.entry_count(), NUM_MTU_ENTRIES);

    extra.reset(&mut cache);
    for r in refs.iter_mut().skip(1) {
        r.reset(&mut cache);
    }
}
