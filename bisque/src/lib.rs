// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! `bisque` is the neighbor-discovery core of a userspace TCP/IP stack that
//! attaches to a layer-2 tap device.
//!
//! It implements the IPv6 Neighbor Discovery cache and the IPv4 ARP cache
//! with timer-driven maintenance, the inbound/outbound ICMPv6 ND protocol
//! machinery (RFC 4861) including Duplicate Address Detection and SLAAC
//! (RFC 4862), and the shared interfaces those pieces rely on: a periodic
//! timer scheduler, a typed TX dispatcher feeding a bounded egress queue,
//! and the per-stack host address registry. Wire formats are parsed and
//! assembled through [`smoltcp::wire`]; this crate owns the protocol state
//! machines on top.
//!
//! The tap driver, frame demux, socket data path, and DHCP clients are the
//! caller's: handlers here take already-demuxed input, and resolution
//! results come back as values, never as panics.
//!
//! ```
//! use bisque::Stack;
//! use bisque::StackConfig;
//! use bisque::tx::EgressQueue;
//! use bisque::tx::EthernetTx;
//! use smoltcp::wire::EthernetAddress;
//! use smoltcp::wire::Ipv6Address;
//! use std::sync::Arc;
//!
//! let mac = EthernetAddress([0x02, 0x00, 0x00, 0x11, 0x22, 0x33]);
//! let egress = Arc::new(EgressQueue::new(64));
//! let tx = Arc::new(EthernetTx::new(mac, egress.clone()));
//! let stack = Stack::new(StackConfig::default(), mac, tx);
//! stack.start().unwrap();
//!
//! // A cache miss emits a Neighbor Solicitation onto the egress queue.
//! let neighbor = Ipv6Address::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1);
//! assert_eq!(stack.nd_cache().lookup(&neighbor), None);
//! assert!(egress.try_pop().is_some());
//! ```

#![forbid(unsafe_code)]

pub mod arp;
mod cache;
pub mod clock;
pub mod hosts;
pub mod nd_cache;
pub mod ndp;
pub mod oneshot;
pub mod slaac;
pub mod sockets;
pub mod timer;
pub mod tx;

use crate::arp::ArpCache;
use crate::clock::Clock;
use crate::clock::MonotonicClock;
use crate::hosts::HostRegistry;
use crate::nd_cache::NdCache;
use crate::ndp::Ndp;
use crate::slaac::NdEvents;
use crate::slaac::Slaac;
use crate::sockets::UdpSocketRegistry;
use crate::timer::Timer;
use crate::tx::PacketTx;
use crate::tx::TxError;
use smoltcp::wire::EthernetAddress;
use smoltcp::wire::Icmpv6Message;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use thiserror::Error;

/// A relaxed monotonic event counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Adds one.
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Reason an inbound packet was dropped instead of being processed.
///
/// Wire-format and policy drops are recovered locally: the packet is
/// counted and discarded, and processing continues with the next one.
#[derive(Debug, Error)]
pub enum DropReason {
    /// Truncated or otherwise malformed wire format.
    #[error("malformed packet")]
    Packet(smoltcp::wire::Error),
    /// The ICMPv6 checksum over the IPv6 pseudo-header did not verify.
    #[error("bad ICMPv6 checksum")]
    Checksum,
    /// An ND message arrived with a decremented hop limit.
    #[error("ND hop limit {0}, expected 255")]
    HopLimit(u8),
    /// The target of a solicitation is not an address of this stack.
    #[error("target address is not assigned to this stack")]
    TargetNotOurs,
    /// An unspecified source address carried a source link-layer option.
    #[error("unspecified source with source link-layer address option")]
    UnspecifiedSourceWithSlla,
    /// A valid but unhandled ICMPv6 message type.
    #[error("unsupported ICMPv6 message {0:?}")]
    UnsupportedIcmpv6(Icmpv6Message),
    /// An ARP operation other than request or reply.
    #[error("unsupported ARP operation {0}")]
    UnsupportedArp(u16),
    /// The datagram embedded in an ICMPv6 error failed the integrity check.
    #[error("embedded datagram failed integrity check")]
    BadEmbeddedDatagram,
    /// The reply could not be transmitted.
    #[error("transmit failed: {0}")]
    Tx(#[from] TxError),
}

impl From<smoltcp::wire::Error> for DropReason {
    fn from(err: smoltcp::wire::Error) -> Self {
        Self::Packet(err)
    }
}

/// Tunables read by the neighbor discovery core. No files or environment
/// variables are involved; the embedding application decides where these
/// come from.
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Total lifetime of a non-permanent ND cache entry.
    pub nd_cache_entry_max_age: Duration,
    /// Trailing interval during which a used ND entry triggers a refresh
    /// solicitation.
    pub nd_cache_entry_refresh_time: Duration,
    /// Total lifetime of a non-permanent ARP cache entry.
    pub arp_cache_entry_max_age: Duration,
    /// Trailing refresh interval for ARP entries.
    pub arp_cache_entry_refresh_time: Duration,
    /// Cadence of the cache maintenance sweeps.
    pub cache_sweep_period: Duration,
    /// How long DAD waits for a defending Neighbor Advertisement.
    pub dad_timeout: Duration,
    /// How long SLAAC waits for a Router Advertisement.
    pub ra_timeout: Duration,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            nd_cache_entry_max_age: Duration::from_secs(60),
            nd_cache_entry_refresh_time: Duration::from_secs(5),
            arp_cache_entry_max_age: Duration::from_secs(60),
            arp_cache_entry_refresh_time: Duration::from_secs(5),
            cache_sweep_period: Duration::from_secs(1),
            dad_timeout: Duration::from_secs(1),
            ra_timeout: Duration::from_secs(2),
        }
    }
}

/// One wired-up instance of the neighbor discovery core.
///
/// Construction builds the registries and handlers with explicit dependency
/// injection (every subsystem holds `Arc`s to exactly what it needs) and
/// registers the cache maintenance sweeps; [`Stack::start`] starts the
/// timer thread. Dropping the stack stops it.
pub struct Stack {
    hosts: Arc<HostRegistry>,
    nd_cache: Arc<NdCache>,
    arp_cache: Arc<ArpCache>,
    events: Arc<NdEvents>,
    sockets: Arc<UdpSocketRegistry>,
    ndp: Ndp,
    slaac: Slaac,
    timer: Timer,
}

impl Stack {
    /// Creates a stack over the system monotonic clock.
    pub fn new(config: StackConfig, mac: EthernetAddress, tx: Arc<dyn PacketTx>) -> Self {
        Self::with_clock(config, mac, tx, Arc::new(MonotonicClock))
    }

    /// Creates a stack with an explicit clock.
    pub fn with_clock(
        config: StackConfig,
        mac: EthernetAddress,
        tx: Arc<dyn PacketTx>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let hosts = Arc::new(HostRegistry::new(mac));
        let nd_cache = Arc::new(NdCache::new(
            hosts.clone(),
            tx.clone(),
            clock.clone(),
            config.nd_cache_entry_max_age,
            config.nd_cache_entry_refresh_time,
        ));
        let arp_cache = Arc::new(ArpCache::new(
            hosts.clone(),
            tx.clone(),
            clock,
            config.arp_cache_entry_max_age,
            config.arp_cache_entry_refresh_time,
        ));
        let events = Arc::new(NdEvents::new());
        let sockets = Arc::new(UdpSocketRegistry::new());
        let ndp = Ndp::new(
            hosts.clone(),
            nd_cache.clone(),
            tx.clone(),
            events.clone(),
            sockets.clone(),
        );
        let slaac = Slaac::new(hosts.clone(), tx, events.clone(), &config);

        let timer = Timer::new();
        let sweep = nd_cache.clone();
        timer.every(config.cache_sweep_period, move || sweep.maintain());
        let sweep = arp_cache.clone();
        timer.every(config.cache_sweep_period, move || sweep.maintain());

        Self {
            hosts,
            nd_cache,
            arp_cache,
            events,
            sockets,
            ndp,
            slaac,
            timer,
        }
    }

    /// Starts the timer thread driving cache maintenance. Idempotent.
    pub fn start(&self) -> std::io::Result<()> {
        self.timer.start()
    }

    /// The host address registry.
    pub fn hosts(&self) -> &Arc<HostRegistry> {
        &self.hosts
    }

    /// The IPv6 neighbor cache.
    pub fn nd_cache(&self) -> &Arc<NdCache> {
        &self.nd_cache
    }

    /// The IPv4 ARP cache and handler.
    pub fn arp_cache(&self) -> &Arc<ArpCache> {
        &self.arp_cache
    }

    /// The DAD/RA rendezvous shared by the handler and the SLAAC driver.
    pub fn events(&self) -> &Arc<NdEvents> {
        &self.events
    }

    /// The UDP socket registry.
    pub fn sockets(&self) -> &Arc<UdpSocketRegistry> {
        &self.sockets
    }

    /// The inbound ICMPv6 handler.
    pub fn ndp(&self) -> &Ndp {
        &self.ndp
    }

    /// The DAD / SLAAC driver.
    pub fn slaac(&self) -> &Slaac {
        &self.slaac
    }

    /// The timer scheduler, for callers that want to register their own
    /// periodic work.
    pub fn timer(&self) -> &Timer {
        &self.timer
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::tx::EgressQueue;
    use crate::tx::EthernetTx;
    use smoltcp::wire::EthernetFrame;
    use smoltcp::wire::EthernetProtocol;
    use smoltcp::wire::Icmpv6Packet;
    use smoltcp::wire::Ipv6Address;
    use smoltcp::wire::Ipv6Packet;
    use smoltcp::wire::NdiscRepr;

    fn mac() -> EthernetAddress {
        EthernetAddress([0x02, 0x00, 0x00, 0x11, 0x22, 0x33])
    }

    #[test]
    fn lookup_miss_produces_a_wire_level_solicitation() {
        let egress = Arc::new(EgressQueue::new(16));
        let tx = Arc::new(EthernetTx::new(mac(), egress.clone()));
        let stack = Stack::new(StackConfig::default(), mac(), tx);

        let neighbor = Ipv6Address::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1);
        assert_eq!(stack.nd_cache().lookup(&neighbor), None);

        let frame = egress.try_pop().expect("solicitation frame");
        let eth = EthernetFrame::new_checked(&frame[..]).unwrap();
        assert_eq!(eth.ethertype(), EthernetProtocol::Ipv6);
        let ipv6 = Ipv6Packet::new_checked(eth.payload()).unwrap();
        assert_eq!(ipv6.hop_limit(), 255);
        assert_eq!(ipv6.dst_addr(), neighbor.solicited_node());
        let icmpv6 = Icmpv6Packet::new_checked(ipv6.payload()).unwrap();
        let ndisc = NdiscRepr::parse(&icmpv6).unwrap();
        assert!(matches!(
            ndisc,
            NdiscRepr::NeighborSolicit { target_addr, .. } if target_addr == neighbor
        ));
    }

    #[test]
    fn timer_driven_sweep_expires_entries() {
        let egress = Arc::new(EgressQueue::new(16));
        let tx = Arc::new(EthernetTx::new(mac(), egress.clone()));
        let clock = Arc::new(ManualClock::new());
        let config = StackConfig {
            cache_sweep_period: Duration::from_millis(10),
            ..StackConfig::default()
        };
        let stack = Stack::with_clock(config, mac(), tx, clock.clone());
        stack.start().unwrap();

        let neighbor = Ipv6Address::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1);
        stack
            .nd_cache()
            .add(neighbor, EthernetAddress([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]));
        assert!(stack.nd_cache().contains(&neighbor));

        clock.advance(Duration::from_secs(61));
        // Give the sweep a few periods to run.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while stack.nd_cache().contains(&neighbor) {
            assert!(std::time::Instant::now() < deadline, "entry never expired");
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}
