// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! ICMPv6 Neighbor Discovery cache.
//!
//! Maps on-link IPv6 addresses to their link-layer addresses. A lookup miss
//! emits a Neighbor Solicitation and reports the address as unresolved; the
//! answering Neighbor Advertisement populates the cache through
//! [`NdCache::add`]. A periodic maintenance sweep hard-expires entries past
//! their maximum age and opportunistically re-solicits entries that are both
//! close to expiry and still in use.

use crate::Counter;
use crate::cache::CacheStore;
use crate::clock::Clock;
use crate::hosts::HostRegistry;
use crate::tx::Icmpv6Tx;
use crate::tx::Icmpv6TxMessage;
use crate::tx::PacketTx;
use smoltcp::wire::EthernetAddress;
use smoltcp::wire::Ipv6Address;
use std::sync::Arc;
use std::time::Duration;

/// Event counters for the ND cache.
#[derive(Debug, Default)]
pub struct NdCacheStats {
    /// Lookups that returned a binding.
    pub hits: Counter,
    /// Lookups that missed and emitted a solicitation.
    pub misses: Counter,
    /// Entries evicted by the maintenance sweep.
    pub expired: Counter,
    /// Refresh solicitations emitted by the maintenance sweep.
    pub refreshed: Counter,
}

/// The IPv6 neighbor cache.
pub struct NdCache {
    store: CacheStore<Ipv6Address>,
    hosts: Arc<HostRegistry>,
    tx: Arc<dyn PacketTx>,
    stats: NdCacheStats,
}

impl NdCache {
    /// Creates an empty cache.
    pub fn new(
        hosts: Arc<HostRegistry>,
        tx: Arc<dyn PacketTx>,
        clock: Arc<dyn Clock>,
        max_age: Duration,
        refresh_window: Duration,
    ) -> Self {
        Self {
            store: CacheStore::new(clock, max_age, refresh_window),
            hosts,
            tx,
            stats: NdCacheStats::default(),
        }
    }

    /// Adds or refreshes a binding. Overwrites unconditionally and restarts
    /// the entry's age.
    pub fn add(&self, address: Ipv6Address, link_addr: EthernetAddress) {
        tracing::debug!(%address, %link_addr, "ND cache add");
        self.store.add(address, link_addr);
    }

    /// Adds a statically configured binding that is never aged or refreshed.
    pub fn add_permanent(&self, address: Ipv6Address, link_addr: EthernetAddress) {
        tracing::debug!(%address, %link_addr, "ND cache add permanent");
        self.store.add_permanent(address, link_addr);
    }

    /// Resolves `address` to a link-layer address.
    ///
    /// Never blocks. On a miss a Neighbor Solicitation is emitted and `None`
    /// is returned; the caller retries or drops its packet, relying on the
    /// advertisement to populate the cache.
    pub fn lookup(&self, address: &Ipv6Address) -> Option<EthernetAddress> {
        if let Some(link_addr) = self.store.get(address) {
            self.stats.hits.increment();
            return Some(link_addr);
        }
        self.stats.misses.increment();
        tracing::debug!(%address, "no ND cache entry, soliciting");
        self.solicit(*address);
        None
    }

    /// Removes a binding. Silent if absent.
    pub fn delete(&self, address: &Ipv6Address) {
        self.store.delete(address);
    }

    /// Whether a binding for `address` exists. Does not count as a hit.
    pub fn contains(&self, address: &Ipv6Address) -> bool {
        self.store.contains(address)
    }

    /// Number of cached bindings.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.store.len() == 0
    }

    /// Event counters.
    pub fn stats(&self) -> &NdCacheStats {
        &self.stats
    }

    /// Runs one maintenance sweep: hard-expires entries past the maximum
    /// age and re-solicits used entries inside the trailing refresh window.
    /// Registered with the timer scheduler at the configured sweep period.
    pub fn maintain(&self) {
        let report = self.store.sweep();
        for (address, link_addr) in &report.expired {
            self.stats.expired.increment();
            tracing::debug!(%address, %link_addr, "discarded expired ND cache entry");
        }
        for address in report.refresh {
            self.stats.refreshed.increment();
            tracing::debug!(%address, "refreshing expiring ND cache entry");
            self.solicit(address);
        }
    }

    fn solicit(&self, target: Ipv6Address) {
        if !target.is_unicast() {
            return;
        }
        let src = self.hosts.ip6_source_for(&target);
        let result = self.tx.send_icmpv6(Icmpv6Tx {
            src,
            dst: target.solicited_node(),
            hop_limit: 255,
            link_dst: None,
            message: Icmpv6TxMessage::NeighborSolicit {
                target,
                slla: Some(self.hosts.mac()),
            },
        });
        if let Err(error) = result {
            // Not retried here; the next lookup re-emits.
            tracing::warn!(%target, %error, "failed to send neighbor solicitation");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::hosts::Ipv6HostAddress;
    use crate::testutil::RecordingTx;
    use smoltcp::wire::Ipv6Cidr;

    const MAX_AGE: Duration = Duration::from_secs(60);
    const REFRESH_WINDOW: Duration = Duration::from_secs(5);

    struct Fixture {
        clock: Arc<ManualClock>,
        hosts: Arc<HostRegistry>,
        tx: Arc<RecordingTx>,
        cache: NdCache,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new());
        let hosts = Arc::new(HostRegistry::new(stack_mac()));
        let tx = Arc::new(RecordingTx::new());
        let cache = NdCache::new(
            hosts.clone(),
            tx.clone(),
            clock.clone(),
            MAX_AGE,
            REFRESH_WINDOW,
        );
        Fixture {
            clock,
            hosts,
            tx,
            cache,
        }
    }

    fn stack_mac() -> EthernetAddress {
        EthernetAddress([0x02, 0x00, 0x00, 0x11, 0x22, 0x33])
    }

    fn target() -> Ipv6Address {
        Ipv6Address::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)
    }

    fn peer_mac() -> EthernetAddress {
        EthernetAddress([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff])
    }

    #[test]
    fn cold_lookup_emits_solicitation() {
        let f = fixture();
        let our_address = Ipv6Address::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0xff);
        f.hosts.add_ip6_host(Ipv6HostAddress {
            address: our_address,
            network: Ipv6Cidr::new(our_address, 64),
            gateway: None,
        });

        assert_eq!(f.cache.lookup(&target()), None);

        let sent = f.tx.icmpv6_sent();
        assert_eq!(sent.len(), 1);
        let ns = &sent[0];
        assert_eq!(ns.src, our_address);
        assert_eq!(ns.dst, target().solicited_node());
        assert_eq!(
            ns.dst,
            Ipv6Address::new(0xff02, 0, 0, 0, 0, 1, 0xff00, 0x0001)
        );
        assert_eq!(ns.hop_limit, 255);
        assert_eq!(
            ns.message,
            Icmpv6TxMessage::NeighborSolicit {
                target: target(),
                slla: Some(stack_mac()),
            }
        );
        assert_eq!(f.cache.stats().misses.get(), 1);
    }

    #[test]
    fn lookup_without_matching_network_uses_unspecified_source() {
        let f = fixture();
        assert_eq!(f.cache.lookup(&target()), None);
        assert_eq!(f.tx.icmpv6_sent()[0].src, Ipv6Address::UNSPECIFIED);
    }

    #[test]
    fn advertisement_populates_and_lookup_hits() {
        let f = fixture();
        f.cache.add(target(), peer_mac());
        assert_eq!(f.cache.lookup(&target()), Some(peer_mac()));
        assert_eq!(f.cache.stats().hits.get(), 1);
        assert!(f.tx.icmpv6_sent().is_empty(), "a hit must not solicit");
    }

    #[test]
    fn refresh_window_re_solicits_then_expires() {
        let f = fixture();
        f.cache.add(target(), peer_mac());

        f.clock.advance(Duration::from_secs(30));
        assert_eq!(f.cache.lookup(&target()), Some(peer_mac()));

        // t=56: used entry inside the refresh window.
        f.clock.advance(Duration::from_secs(26));
        f.cache.maintain();
        let sent = f.tx.icmpv6_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].message,
            Icmpv6TxMessage::NeighborSolicit {
                target: target(),
                slla: Some(stack_mac()),
            }
        );
        assert!(f.cache.contains(&target()));
        assert_eq!(f.cache.stats().refreshed.get(), 1);

        // t=61: the refresh went unanswered, the entry still expires.
        f.clock.advance(Duration::from_secs(5));
        f.cache.maintain();
        assert!(!f.cache.contains(&target()));
        assert_eq!(f.cache.stats().expired.get(), 1);
    }

    #[test]
    fn permanent_entry_survives_sweeps() {
        let f = fixture();
        let static_neighbor = Ipv6Address::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 2);
        f.cache
            .add_permanent(static_neighbor, EthernetAddress([0, 0x11, 0x22, 0x33, 0x44, 0x55]));
        f.cache.lookup(&static_neighbor);
        for _ in 0..10 {
            f.clock.advance(MAX_AGE);
            f.cache.maintain();
        }
        assert!(f.cache.contains(&static_neighbor));
        assert!(f.tx.icmpv6_sent().is_empty(), "no refresh for permanent entries");
    }

    #[test]
    fn delete_then_lookup_solicits_again() {
        let f = fixture();
        f.cache.add(target(), peer_mac());
        f.cache.delete(&target());
        assert_eq!(f.cache.lookup(&target()), None);
        assert_eq!(f.tx.icmpv6_sent().len(), 1);
    }

    #[test]
    fn multicast_target_is_not_solicited() {
        let f = fixture();
        assert_eq!(f.cache.lookup(&Ipv6Address::LINK_LOCAL_ALL_NODES), None);
        assert!(f.tx.icmpv6_sent().is_empty());
    }
}
