// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Inbound ICMPv6 Neighbor Discovery machinery.
//!
//! Implements the receive side of RFC 4861: Neighbor Solicitations are
//! answered for our addresses (with the flag selection RFC 4862 wants for
//! DAD probes), Neighbor Advertisements feed the ND cache or release a
//! pending DAD wait, Router Advertisements release a pending SLAAC wait
//! with their prefix options, and Router Solicitations are ignored (this
//! stack is a host, not a router). Echo Requests and Destination
//! Unreachable messages are handled here too, as in the rest of the ICMPv6
//! receive path.
//!
//! The caller hands in already-demuxed input: the Ethernet header, the
//! IPv6 header, and the ICMPv6 payload bytes.

use crate::Counter;
use crate::DropReason;
use crate::hosts::HostRegistry;
use crate::nd_cache::NdCache;
use crate::slaac::NdEvents;
use crate::slaac::RaPrefix;
use crate::sockets::UdpSocketRegistry;
use crate::tx::Icmpv6Tx;
use crate::tx::Icmpv6TxMessage;
use crate::tx::PacketTx;
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::phy::Medium;
use smoltcp::wire::EthernetAddress;
use smoltcp::wire::EthernetRepr;
use smoltcp::wire::HardwareAddress;
use smoltcp::wire::IPV6_HEADER_LEN;
use smoltcp::wire::Icmpv6Message;
use smoltcp::wire::Icmpv6Packet;
use smoltcp::wire::Icmpv6Repr;
use smoltcp::wire::IpAddress;
use smoltcp::wire::IpProtocol;
use smoltcp::wire::Ipv6Address;
use smoltcp::wire::Ipv6Repr;
use smoltcp::wire::NdiscOption;
use smoltcp::wire::NdiscOptionRepr;
use smoltcp::wire::NdiscRepr;
use smoltcp::wire::RawHardwareAddress;
use smoltcp::wire::UDP_HEADER_LEN;
use std::sync::Arc;

/// Event counters for the ICMPv6 handler.
#[derive(Debug, Default)]
pub struct NdpStats {
    /// Neighbor Solicitations processed.
    pub ns: Counter,
    /// Neighbor Advertisements processed.
    pub na: Counter,
    /// Router Solicitations seen (and ignored).
    pub rs: Counter,
    /// Router Advertisements processed.
    pub ra: Counter,
    /// Echo Requests answered.
    pub echo: Counter,
    /// Destination Unreachable messages processed.
    pub unreachable: Counter,
    /// Inbound packets dropped.
    pub dropped: Counter,
}

/// The inbound ICMPv6 handler.
pub struct Ndp {
    hosts: Arc<HostRegistry>,
    cache: Arc<NdCache>,
    tx: Arc<dyn PacketTx>,
    events: Arc<NdEvents>,
    sockets: Arc<UdpSocketRegistry>,
    stats: NdpStats,
}

impl Ndp {
    /// Creates the handler.
    pub fn new(
        hosts: Arc<HostRegistry>,
        cache: Arc<NdCache>,
        tx: Arc<dyn PacketTx>,
        events: Arc<NdEvents>,
        sockets: Arc<UdpSocketRegistry>,
    ) -> Self {
        Self {
            hosts,
            cache,
            tx,
            events,
            sockets,
            stats: NdpStats::default(),
        }
    }

    /// Event counters.
    pub fn stats(&self) -> &NdpStats {
        &self.stats
    }

    /// Handles an inbound ICMPv6 packet.
    ///
    /// `payload` is the ICMPv6 message (the bytes after the IPv6 header);
    /// `frame` provides the link-layer source used for unicast replies.
    pub fn handle(
        &self,
        frame: &EthernetRepr,
        ip6: &Ipv6Repr,
        payload: &[u8],
    ) -> Result<(), DropReason> {
        match self.dispatch(frame, ip6, payload) {
            Ok(()) => Ok(()),
            Err(reason) => {
                self.stats.dropped.increment();
                tracing::debug!(src = %ip6.src_addr, %reason, "dropping ICMPv6 packet");
                Err(reason)
            }
        }
    }

    fn dispatch(
        &self,
        frame: &EthernetRepr,
        ip6: &Ipv6Repr,
        payload: &[u8],
    ) -> Result<(), DropReason> {
        let packet = Icmpv6Packet::new_checked(payload)?;
        if !packet.verify_checksum(
            &IpAddress::Ipv6(ip6.src_addr),
            &IpAddress::Ipv6(ip6.dst_addr),
        ) {
            return Err(DropReason::Checksum);
        }

        match packet.msg_type() {
            Icmpv6Message::NeighborSolicit | Icmpv6Message::NeighborAdvert => {
                // RFC 4861 Sections 7.1.1/7.1.2: ND messages must arrive
                // with an undecremented hop limit.
                if ip6.hop_limit != 255 {
                    return Err(DropReason::HopLimit(ip6.hop_limit));
                }
                match NdiscRepr::parse(&packet)? {
                    NdiscRepr::NeighborSolicit {
                        target_addr,
                        lladdr,
                    } => self.handle_neighbor_solicit(frame, ip6, target_addr, lladdr),
                    NdiscRepr::NeighborAdvert {
                        flags: _,
                        target_addr,
                        lladdr,
                    } => self.handle_neighbor_advert(ip6, target_addr, lladdr),
                    _ => Err(DropReason::Packet(smoltcp::wire::Error)),
                }
            }
            Icmpv6Message::RouterSolicit => {
                if ip6.hop_limit != 255 {
                    return Err(DropReason::HopLimit(ip6.hop_limit));
                }
                self.stats.rs.increment();
                tracing::debug!(src = %ip6.src_addr, "ignoring router solicitation");
                Ok(())
            }
            Icmpv6Message::RouterAdvert => {
                if ip6.hop_limit != 255 {
                    return Err(DropReason::HopLimit(ip6.hop_limit));
                }
                self.handle_router_advert(ip6, packet.payload())
            }
            Icmpv6Message::EchoRequest => self.handle_echo_request(frame, ip6, &packet),
            Icmpv6Message::DstUnreachable => self.handle_unreachable(packet.payload()),
            other => Err(DropReason::UnsupportedIcmpv6(other)),
        }
    }

    /// RFC 4861 Section 7.2.3/7.2.4: answer solicitations for our unicast
    /// addresses, absorbing the solicitor's SLLA on the way.
    fn handle_neighbor_solicit(
        &self,
        frame: &EthernetRepr,
        ip6: &Ipv6Repr,
        target_addr: Ipv6Address,
        lladdr: Option<RawHardwareAddress>,
    ) -> Result<(), DropReason> {
        self.stats.ns.increment();

        // RFC 4861 Section 7.1.1: an unspecified source must not carry a
        // source link-layer address option.
        if ip6.src_addr.is_unspecified() && lladdr.is_some() {
            return Err(DropReason::UnspecifiedSourceWithSlla);
        }
        if !self.hosts.is_ip6_unicast(&target_addr) {
            return Err(DropReason::TargetNotOurs);
        }

        if !(ip6.src_addr.is_unspecified() || ip6.src_addr.is_multicast()) {
            if let Some(slla) = lladdr.and_then(ethernet_lladdr) {
                self.cache.add(ip6.src_addr, slla);
            }
        }

        // An unspecified source means the solicitation is a peer's DAD
        // probe (RFC 4862 Section 5.4.3): answer to all-nodes, unsolicited,
        // with the override flag the way Linux does.
        let dad_probe = ip6.src_addr.is_unspecified();
        let (dst, link_dst) = if dad_probe {
            (Ipv6Address::LINK_LOCAL_ALL_NODES, None)
        } else {
            (ip6.src_addr, Some(frame.src_addr))
        };

        tracing::debug!(src = %ip6.src_addr, target = %target_addr, "answering neighbor solicitation");
        self.tx.send_icmpv6(Icmpv6Tx {
            src: target_addr,
            dst,
            hop_limit: 255,
            link_dst,
            message: Icmpv6TxMessage::NeighborAdvert {
                target: target_addr,
                solicited: !dad_probe,
                override_lladdr: dad_probe,
                tlla: self.hosts.mac(),
            },
        })?;
        Ok(())
    }

    /// RFC 4861 Section 7.2.5: an advertisement either answers our DAD
    /// probe or refreshes the cache.
    fn handle_neighbor_advert(
        &self,
        ip6: &Ipv6Repr,
        target_addr: Ipv6Address,
        lladdr: Option<RawHardwareAddress>,
    ) -> Result<(), DropReason> {
        self.stats.na.increment();
        let tlla = lladdr.and_then(ethernet_lladdr);

        if self.hosts.candidate() == Some(target_addr) {
            tracing::debug!(target = %target_addr, src = %ip6.src_addr, "advertisement defends our candidate");
            self.events.signal_dad(tlla);
            return Ok(());
        }

        if let Some(tlla) = tlla {
            self.cache.add(target_addr, tlla);
        }
        Ok(())
    }

    /// RFC 4861 Section 6.3.4, reduced to what SLAAC consumes: snapshot
    /// every Prefix Information option together with the advertising
    /// router.
    ///
    /// The options are walked manually: the summarized [`NdiscRepr`] keeps
    /// only one prefix option, while an advertisement may carry several.
    /// Unknown options are skipped, not rejected (RFC 4861 Section 4.6).
    fn handle_router_advert(&self, ip6: &Ipv6Repr, options: &[u8]) -> Result<(), DropReason> {
        self.stats.ra.increment();

        let mut prefixes = Vec::new();
        let mut rest = options;
        while !rest.is_empty() {
            let option = NdiscOption::new_checked(rest)?;
            let repr = NdiscOptionRepr::parse(&option)?;
            if let NdiscOptionRepr::PrefixInformation(info) = repr {
                prefixes.push(RaPrefix {
                    info,
                    router: ip6.src_addr,
                });
            }
            // RFC 4861 Section 4.6: a zero option length is invalid and the
            // packet MUST be silently discarded. Checked here so the walk
            // always advances.
            if repr.buffer_len() == 0 {
                return Err(DropReason::Packet(smoltcp::wire::Error));
            }
            rest = rest
                .get(repr.buffer_len()..)
                .ok_or(DropReason::Packet(smoltcp::wire::Error))?;
        }

        tracing::debug!(
            src = %ip6.src_addr,
            prefixes = prefixes.len(),
            "received router advertisement"
        );
        if !self.events.signal_ra(prefixes) {
            tracing::debug!("no address autoconfiguration in progress, discarding prefixes");
        }
        Ok(())
    }

    fn handle_echo_request(
        &self,
        frame: &EthernetRepr,
        ip6: &Ipv6Repr,
        packet: &Icmpv6Packet<&[u8]>,
    ) -> Result<(), DropReason> {
        let repr = Icmpv6Repr::parse(
            &IpAddress::Ipv6(ip6.src_addr),
            &IpAddress::Ipv6(ip6.dst_addr),
            packet,
            &ChecksumCapabilities::default(),
        )?;
        let Icmpv6Repr::EchoRequest {
            ident,
            seq_no,
            data,
        } = repr
        else {
            return Err(DropReason::Packet(smoltcp::wire::Error));
        };
        self.stats.echo.increment();

        tracing::debug!(src = %ip6.src_addr, ident, seq_no, "answering echo request");
        self.tx.send_icmpv6(Icmpv6Tx {
            src: ip6.dst_addr,
            dst: ip6.src_addr,
            hop_limit: 255,
            link_dst: Some(frame.src_addr),
            message: Icmpv6TxMessage::EchoReply {
                ident,
                seq_no,
                data: data.to_vec(),
            },
        })?;
        Ok(())
    }

    /// Matches the embedded offending datagram of an unreachable message
    /// against the UDP socket registry.
    ///
    /// Only a plain IPv6+UDP datagram is recognized; extension headers are
    /// not walked, so such payloads never match and are dropped.
    fn handle_unreachable(&self, data: &[u8]) -> Result<(), DropReason> {
        self.stats.unreachable.increment();

        if data.len() < IPV6_HEADER_LEN + UDP_HEADER_LEN
            || data[0] >> 4 != 6
            || data[6] != u8::from(IpProtocol::Udp)
        {
            return Err(DropReason::BadEmbeddedDatagram);
        }

        // The embedded datagram is one we sent: its source is our local
        // endpoint, its destination the remote one.
        let local_addr = Ipv6Address::from_bytes(&data[8..24]);
        let remote_addr = Ipv6Address::from_bytes(&data[24..40]);
        let local_port = u16::from_be_bytes([data[40], data[41]]);
        let remote_port = u16::from_be_bytes([data[42], data[43]]);

        let matched =
            self.sockets
                .notify_unreachable(local_addr, local_port, remote_addr, remote_port);
        if matched {
            tracing::debug!(
                local = %local_addr,
                local_port,
                remote = %remote_addr,
                remote_port,
                "notified socket of unreachable destination"
            );
        } else {
            tracing::debug!("unreachable datagram matches no UDP socket");
        }
        Ok(())
    }
}

fn ethernet_lladdr(lladdr: RawHardwareAddress) -> Option<EthernetAddress> {
    match lladdr.parse(Medium::Ethernet) {
        Ok(HardwareAddress::Ethernet(mac)) => Some(mac),
        _ => None,
    }
}
