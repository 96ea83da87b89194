// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! ARP resolution cache and inbound ARP handling.
//!
//! The IPv4 twin of the ND cache: identical entry shape, identical aging,
//! with broadcast ARP Requests in place of Neighbor Solicitations. Inbound
//! handling answers requests for our addresses and absorbs sender bindings,
//! the same way the ICMPv6 path absorbs SLLA/TLLA options.

use crate::Counter;
use crate::DropReason;
use crate::cache::CacheStore;
use crate::clock::Clock;
use crate::hosts::HostRegistry;
use crate::tx::ArpTx;
use crate::tx::PacketTx;
use smoltcp::wire::ArpOperation;
use smoltcp::wire::ArpPacket;
use smoltcp::wire::ArpRepr;
use smoltcp::wire::EthernetAddress;
use smoltcp::wire::Ipv4Address;
use std::sync::Arc;
use std::time::Duration;

/// Event counters for the ARP cache and handler.
#[derive(Debug, Default)]
pub struct ArpStats {
    /// Lookups that returned a binding.
    pub hits: Counter,
    /// Lookups that missed and emitted a request.
    pub misses: Counter,
    /// Entries evicted by the maintenance sweep.
    pub expired: Counter,
    /// Refresh requests emitted by the maintenance sweep.
    pub refreshed: Counter,
    /// Inbound packets dropped.
    pub dropped: Counter,
}

/// The IPv4 ARP cache and protocol handler.
pub struct ArpCache {
    store: CacheStore<Ipv4Address>,
    hosts: Arc<HostRegistry>,
    tx: Arc<dyn PacketTx>,
    stats: ArpStats,
}

impl ArpCache {
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
            stats: ArpStats::default(),
        }
    }

    /// Adds or refreshes a binding.
    pub fn add(&self, address: Ipv4Address, link_addr: EthernetAddress) {
        tracing::debug!(%address, %link_addr, "ARP cache add");
        self.store.add(address, link_addr);
    }

    /// Adds a statically configured binding that is never aged or refreshed.
    pub fn add_permanent(&self, address: Ipv4Address, link_addr: EthernetAddress) {
        tracing::debug!(%address, %link_addr, "ARP cache add permanent");
        self.store.add_permanent(address, link_addr);
    }

    /// Resolves `address`; on a miss broadcasts an ARP Request and returns
    /// `None`. Never blocks.
    pub fn lookup(&self, address: &Ipv4Address) -> Option<EthernetAddress> {
        if let Some(link_addr) = self.store.get(address) {
            self.stats.hits.increment();
            return Some(link_addr);
        }
        self.stats.misses.increment();
        tracing::debug!(%address, "no ARP cache entry, sending request");
        self.solicit(*address);
        None
    }

    /// Removes a binding. Silent if absent.
    pub fn delete(&self, address: &Ipv4Address) {
        self.store.delete(address);
    }

    /// Whether a binding for `address` exists. Does not count as a hit.
    pub fn contains(&self, address: &Ipv4Address) -> bool {
        self.store.contains(address)
    }

    /// Event counters.
    pub fn stats(&self) -> &ArpStats {
        &self.stats
    }

    /// Runs one maintenance sweep; same discipline as the ND cache.
    pub fn maintain(&self) {
        let report = self.store.sweep();
        for (address, link_addr) in &report.expired {
            self.stats.expired.increment();
            tracing::debug!(%address, %link_addr, "discarded expired ARP cache entry");
        }
        for address in report.refresh {
            self.stats.refreshed.increment();
            tracing::debug!(%address, "refreshing expiring ARP cache entry");
            self.solicit(address);
        }
    }

    /// Handles an inbound ARP payload (the bytes after the Ethernet header).
    pub fn handle(&self, payload: &[u8]) -> Result<(), DropReason> {
        match self.dispatch(payload) {
            Ok(()) => Ok(()),
            Err(reason) => {
                self.stats.dropped.increment();
                tracing::debug!(%reason, "dropping ARP packet");
                Err(reason)
            }
        }
    }

    fn dispatch(&self, payload: &[u8]) -> Result<(), DropReason> {
        let packet = ArpPacket::new_checked(payload)?;
        let ArpRepr::EthernetIpv4 {
            operation,
            source_hardware_addr,
            source_protocol_addr,
            target_hardware_addr: _,
            target_protocol_addr,
        } = ArpRepr::parse(&packet)?
        else {
            return Err(DropReason::Packet(smoltcp::wire::Error));
        };

        match operation {
            ArpOperation::Request => {
                if !self.hosts.is_ip4_unicast(&target_protocol_addr) {
                    return Err(DropReason::TargetNotOurs);
                }
                // An ARP probe (RFC 5227) has an unspecified sender address
                // and must not be cached.
                if !source_protocol_addr.is_unspecified() {
                    self.add(source_protocol_addr, source_hardware_addr);
                }
                tracing::debug!(
                    requester = %source_protocol_addr,
                    target = %target_protocol_addr,
                    "answering ARP request"
                );
                self.tx.send_arp(ArpTx::Reply {
                    src_mac: self.hosts.mac(),
                    src_ip: target_protocol_addr,
                    target_mac: source_hardware_addr,
                    target_ip: source_protocol_addr,
                })?;
                Ok(())
            }
            ArpOperation::Reply => {
                // Accept replies addressed to us and gratuitous announcements.
                let gratuitous = source_protocol_addr == target_protocol_addr;
                if !gratuitous && !self.hosts.is_ip4_unicast(&target_protocol_addr) {
                    return Err(DropReason::TargetNotOurs);
                }
                self.add(source_protocol_addr, source_hardware_addr);
                Ok(())
            }
            ArpOperation::Unknown(operation) => {
                tracing::debug!(operation, "unsupported ARP operation");
                Err(DropReason::UnsupportedArp(operation))
            }
        }
    }

    fn solicit(&self, target: Ipv4Address) {
        if target.is_multicast() || target.is_broadcast() {
            return;
        }
        let result = self.tx.send_arp(ArpTx::Request {
            src_mac: self.hosts.mac(),
            src_ip: self.hosts.ip4_source_for(&target),
            target_ip: target,
        });
        if let Err(error) = result {
            tracing::warn!(%target, %error, "failed to send ARP request");
        }
    }
}
