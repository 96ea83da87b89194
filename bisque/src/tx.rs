// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Typed outbound dispatch.
//!
//! Upper layers express intent ("send a Neighbor Solicitation for X") as a
//! sum type; the dispatcher exhaustively matches it, assembles the
//! Ethernet/IPv6/ICMPv6 (or Ethernet/ARP) framing through `smoltcp`, and
//! hands the finished frame to a bounded egress queue drained by the
//! transmit thread.

use parking_lot::Condvar;
use parking_lot::Mutex;
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::ArpOperation;
use smoltcp::wire::ArpPacket;
use smoltcp::wire::ArpRepr;
use smoltcp::wire::EthernetAddress;
use smoltcp::wire::EthernetFrame;
use smoltcp::wire::EthernetProtocol;
use smoltcp::wire::EthernetRepr;
use smoltcp::wire::Icmpv6Packet;
use smoltcp::wire::Icmpv6Repr;
use smoltcp::wire::IpAddress;
use smoltcp::wire::IpProtocol;
use smoltcp::wire::Ipv4Address;
use smoltcp::wire::Ipv6Address;
use smoltcp::wire::Ipv6Packet;
use smoltcp::wire::Ipv6Repr;
use smoltcp::wire::NdiscNeighborFlags;
use smoltcp::wire::NdiscRepr;
use smoltcp::wire::RawHardwareAddress;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;

/// An outbound ICMPv6 message, one variant per message type, each carrying
/// exactly its required fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Icmpv6TxMessage {
    /// Neighbor Solicitation for `target`.
    NeighborSolicit {
        /// The address being resolved or probed.
        target: Ipv6Address,
        /// Source link-layer address option; absent for DAD probes.
        slla: Option<EthernetAddress>,
    },
    /// Neighbor Advertisement answering a solicitation for `target`.
    NeighborAdvert {
        /// The address being advertised.
        target: Ipv6Address,
        /// Solicited flag: set when answering a directed solicitation.
        solicited: bool,
        /// Override flag: set when answering a DAD probe.
        override_lladdr: bool,
        /// Target link-layer address option.
        tlla: EthernetAddress,
    },
    /// Router Solicitation to the all-routers group.
    RouterSolicit {
        /// Source link-layer address option; absent when sourced from `::`.
        slla: Option<EthernetAddress>,
    },
    /// Echo Reply mirroring a received Echo Request.
    EchoReply {
        /// Echoed identifier.
        ident: u16,
        /// Echoed sequence number.
        seq_no: u16,
        /// Echoed payload.
        data: Vec<u8>,
    },
}

/// An outbound ICMPv6 packet: addressing plus the typed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Icmpv6Tx {
    /// IPv6 source address.
    pub src: Ipv6Address,
    /// IPv6 destination address.
    pub dst: Ipv6Address,
    /// Hop limit; 255 for every ND message.
    pub hop_limit: u8,
    /// Link-layer destination when the caller already knows it (unicast
    /// replies use the solicitor's frame source). For a multicast `dst` the
    /// dispatcher derives the group MAC itself.
    pub link_dst: Option<EthernetAddress>,
    /// The message to assemble.
    pub message: Icmpv6TxMessage,
}

/// An outbound ARP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpTx {
    /// Broadcast request resolving `target_ip`.
    Request {
        /// Our MAC.
        src_mac: EthernetAddress,
        /// Our protocol address, or unspecified if none matches.
        src_ip: Ipv4Address,
        /// The address being resolved.
        target_ip: Ipv4Address,
    },
    /// Directed reply to a request we received.
    Reply {
        /// Our MAC.
        src_mac: EthernetAddress,
        /// The address being advertised.
        src_ip: Ipv4Address,
        /// The requester's MAC.
        target_mac: EthernetAddress,
        /// The requester's protocol address.
        target_ip: Ipv4Address,
    },
}

/// Errors on the egress path.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TxError {
    /// A unicast destination with no known link-layer address reached the
    /// dispatcher.
    #[error("no link-layer destination for {0}")]
    Unresolved(Ipv6Address),
    /// The egress queue was shut down.
    #[error("egress queue closed")]
    QueueClosed,
}

/// The single outbound entry point the neighbor discovery core holds.
pub trait PacketTx: Send + Sync {
    /// Assembles and enqueues an ICMPv6 message.
    fn send_icmpv6(&self, packet: Icmpv6Tx) -> Result<(), TxError>;
    /// Assembles and enqueues an ARP message.
    fn send_arp(&self, packet: ArpTx) -> Result<(), TxError>;
}

/// Maps an IPv6 multicast group to its Ethernet group address
/// (RFC 2464 Section 7): `33:33` followed by the low 32 bits.
pub fn multicast_mac(group: &Ipv6Address) -> EthernetAddress {
    let bytes = group.as_bytes();
    EthernetAddress([0x33, 0x33, bytes[12], bytes[13], bytes[14], bytes[15]])
}

struct EgressState {
    frames: VecDeque<Vec<u8>>,
    closed: bool,
}

/// A bounded queue of finished frames awaiting the transmit thread.
///
/// `push` blocks only while the queue is full; `pop` blocks until a frame or
/// shutdown.
pub struct EgressQueue {
    state: Mutex<EgressState>,
    capacity: usize,
    not_full: Condvar,
    not_empty: Condvar,
}

impl EgressQueue {
    /// Creates a queue holding at most `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            state: Mutex::new(EgressState {
                frames: VecDeque::new(),
                closed: false,
            }),
            capacity,
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    /// Enqueues a frame, blocking while the queue is full.
    pub fn push(&self, frame: Vec<u8>) -> Result<(), TxError> {
        let mut state = self.state.lock();
        while state.frames.len() >= self.capacity && !state.closed {
            self.not_full.wait(&mut state);
        }
        if state.closed {
            return Err(TxError::QueueClosed);
        }
        state.frames.push_back(frame);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Dequeues the next frame, blocking until one is available. Returns
    /// `None` once the queue is closed and drained.
    pub fn pop(&self) -> Option<Vec<u8>> {
        let mut state = self.state.lock();
        loop {
            if let Some(frame) = state.frames.pop_front() {
                self.not_full.notify_one();
                return Some(frame);
            }
            if state.closed {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Dequeues the next frame if one is immediately available.
    pub fn try_pop(&self) -> Option<Vec<u8>> {
        let frame = self.state.lock().frames.pop_front();
        if frame.is_some() {
            self.not_full.notify_one();
        }
        frame
    }

    /// Shuts the queue down, waking all blocked producers and consumers.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    /// Number of frames currently queued.
    pub fn len(&self) -> usize {
        self.state.lock().frames.len()
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.state.lock().frames.is_empty()
    }
}

/// Assembles Ethernet frames for typed messages and feeds the egress queue.
pub struct EthernetTx {
    mac: EthernetAddress,
    egress: Arc<EgressQueue>,
}

impl EthernetTx {
    /// Creates a dispatcher sourcing frames from `mac`.
    pub fn new(mac: EthernetAddress, egress: Arc<EgressQueue>) -> Self {
        Self { mac, egress }
    }

    fn eth_destination(&self, packet: &Icmpv6Tx) -> Result<EthernetAddress, TxError> {
        if let Some(mac) = packet.link_dst {
            return Ok(mac);
        }
        if packet.dst.is_multicast() {
            return Ok(multicast_mac(&packet.dst));
        }
        Err(TxError::Unresolved(packet.dst))
    }
}

impl PacketTx for EthernetTx {
    fn send_icmpv6(&self, packet: Icmpv6Tx) -> Result<(), TxError> {
        let eth_dst = self.eth_destination(&packet)?;

        let icmp_repr = match &packet.message {
            Icmpv6TxMessage::NeighborSolicit { target, slla } => {
                Icmpv6Repr::Ndisc(NdiscRepr::NeighborSolicit {
                    target_addr: *target,
                    lladdr: slla.map(RawHardwareAddress::from),
                })
            }
            Icmpv6TxMessage::NeighborAdvert {
                target,
                solicited,
                override_lladdr,
                tlla,
            } => {
                let mut flags = NdiscNeighborFlags::empty();
                if *solicited {
                    flags |= NdiscNeighborFlags::SOLICITED;
                }
                if *override_lladdr {
                    flags |= NdiscNeighborFlags::OVERRIDE;
                }
                Icmpv6Repr::Ndisc(NdiscRepr::NeighborAdvert {
                    flags,
                    target_addr: *target,
                    lladdr: Some(RawHardwareAddress::from(*tlla)),
                })
            }
            Icmpv6TxMessage::RouterSolicit { slla } => {
                Icmpv6Repr::Ndisc(NdiscRepr::RouterSolicit {
                    lladdr: slla.map(RawHardwareAddress::from),
                })
            }
            Icmpv6TxMessage::EchoReply {
                ident,
                seq_no,
                data,
            } => Icmpv6Repr::EchoReply {
                ident: *ident,
                seq_no: *seq_no,
                data: data.as_slice(),
            },
        };

        let ipv6_repr = Ipv6Repr {
            src_addr: packet.src,
            dst_addr: packet.dst,
            next_header: IpProtocol::Icmpv6,
            payload_len: icmp_repr.buffer_len(),
            hop_limit: packet.hop_limit,
        };
        let eth_repr = EthernetRepr {
            src_addr: self.mac,
            dst_addr: eth_dst,
            ethertype: EthernetProtocol::Ipv6,
        };

        let total_len = eth_repr.buffer_len() + ipv6_repr.buffer_len() + icmp_repr.buffer_len();
        let mut buffer = vec![0; total_len];

        let mut eth_frame = EthernetFrame::new_unchecked(&mut buffer);
        eth_repr.emit(&mut eth_frame);

        let mut ipv6_packet = Ipv6Packet::new_unchecked(eth_frame.payload_mut());
        ipv6_repr.emit(&mut ipv6_packet);

        let mut icmpv6_packet = Icmpv6Packet::new_unchecked(ipv6_packet.payload_mut());
        icmp_repr.emit(
            &IpAddress::Ipv6(packet.src),
            &IpAddress::Ipv6(packet.dst),
            &mut icmpv6_packet,
            &ChecksumCapabilities::default(),
        );

        tracing::debug!(
            src = %packet.src,
            dst = %packet.dst,
            eth_dst = %eth_dst,
            len = total_len,
            "sending ICMPv6 packet"
        );
        self.egress.push(buffer)
    }

    fn send_arp(&self, packet: ArpTx) -> Result<(), TxError> {
        let (arp_repr, eth_dst) = match packet {
            ArpTx::Request {
                src_mac,
                src_ip,
                target_ip,
            } => (
                ArpRepr::EthernetIpv4 {
                    operation: ArpOperation::Request,
                    source_hardware_addr: src_mac,
                    source_protocol_addr: src_ip,
                    target_hardware_addr: EthernetAddress([0; 6]),
                    target_protocol_addr: target_ip,
                },
                EthernetAddress::BROADCAST,
            ),
            ArpTx::Reply {
                src_mac,
                src_ip,
                target_mac,
                target_ip,
            } => (
                ArpRepr::EthernetIpv4 {
                    operation: ArpOperation::Reply,
                    source_hardware_addr: src_mac,
                    source_protocol_addr: src_ip,
                    target_hardware_addr: target_mac,
                    target_protocol_addr: target_ip,
                },
                target_mac,
            ),
        };

        let eth_repr = EthernetRepr {
            src_addr: self.mac,
            dst_addr: eth_dst,
            ethertype: EthernetProtocol::Arp,
        };

        let total_len = eth_repr.buffer_len() + arp_repr.buffer_len();
        let mut buffer = vec![0; total_len];

        let mut eth_frame = EthernetFrame::new_unchecked(&mut buffer);
        eth_repr.emit(&mut eth_frame);

        let mut arp_packet = ArpPacket::new_unchecked(eth_frame.payload_mut());
        arp_repr.emit(&mut arp_packet);

        tracing::debug!(eth_dst = %eth_dst, len = total_len, "sending ARP packet");
        self.egress.push(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smoltcp::wire::Ipv6Cidr;

    fn mac() -> EthernetAddress {
        EthernetAddress([0x02, 0x00, 0x00, 0x11, 0x22, 0x33])
    }

    fn tx() -> (Arc<EgressQueue>, EthernetTx) {
        let egress = Arc::new(EgressQueue::new(16));
        let tx = EthernetTx::new(mac(), egress.clone());
        (egress, tx)
    }

    // Parses a frame off the egress queue back into reprs.
    fn parse_icmpv6(frame: &[u8]) -> (EthernetRepr, Ipv6Repr, Vec<u8>) {
        let eth = EthernetFrame::new_checked(frame).unwrap();
        let eth_repr = EthernetRepr::parse(&eth).unwrap();
        let ipv6 = Ipv6Packet::new_checked(eth.payload()).unwrap();
        let ipv6_repr = Ipv6Repr::parse(&ipv6).unwrap();
        (eth_repr, ipv6_repr, ipv6.payload().to_vec())
    }

    #[test]
    fn neighbor_solicit_round_trips() {
        let (egress, tx) = tx();
        let target = Ipv6Address::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1);
        let src = Ipv6Address::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0xff);
        tx.send_icmpv6(Icmpv6Tx {
            src,
            dst: target.solicited_node(),
            hop_limit: 255,
            link_dst: None,
            message: Icmpv6TxMessage::NeighborSolicit {
                target,
                slla: Some(mac()),
            },
        })
        .unwrap();

        let frame = egress.try_pop().unwrap();
        let (eth_repr, ipv6_repr, payload) = parse_icmpv6(&frame);

        // RFC 2464 multicast mapping on the Ethernet layer.
        assert_eq!(
            eth_repr.dst_addr,
            EthernetAddress([0x33, 0x33, 0xff, 0x00, 0x00, 0x01])
        );
        assert_eq!(eth_repr.ethertype, EthernetProtocol::Ipv6);
        assert_eq!(ipv6_repr.hop_limit, 255);
        assert_eq!(ipv6_repr.dst_addr, target.solicited_node());

        let icmpv6 = Icmpv6Packet::new_checked(&payload[..]).unwrap();
        assert!(icmpv6.verify_checksum(
            &IpAddress::Ipv6(ipv6_repr.src_addr),
            &IpAddress::Ipv6(ipv6_repr.dst_addr)
        ));
        let ndisc = NdiscRepr::parse(&icmpv6).unwrap();
        assert_eq!(
            ndisc,
            NdiscRepr::NeighborSolicit {
                target_addr: target,
                lladdr: Some(RawHardwareAddress::from(mac())),
            }
        );
    }

    #[test]
    fn neighbor_advert_flags_round_trip() {
        let (egress, tx) = tx();
        let target = Ipv6Address::new(0xfe80, 0, 0, 0, 0, 0, 0, 0xabcd);
        let peer = Ipv6Address::new(0xfe80, 0, 0, 0, 0, 0, 0, 0x1);
        let peer_mac = EthernetAddress([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        tx.send_icmpv6(Icmpv6Tx {
            src: target,
            dst: peer,
            hop_limit: 255,
            link_dst: Some(peer_mac),
            message: Icmpv6TxMessage::NeighborAdvert {
                target,
                solicited: true,
                override_lladdr: false,
                tlla: mac(),
            },
        })
        .unwrap();

        let frame = egress.try_pop().unwrap();
        let (eth_repr, ipv6_repr, payload) = parse_icmpv6(&frame);
        assert_eq!(eth_repr.dst_addr, peer_mac);
        assert_eq!(ipv6_repr.hop_limit, 255);

        let icmpv6 = Icmpv6Packet::new_checked(&payload[..]).unwrap();
        let NdiscRepr::NeighborAdvert {
            flags,
            target_addr,
            lladdr,
        } = NdiscRepr::parse(&icmpv6).unwrap()
        else {
            panic!("not a neighbor advertisement");
        };
        assert_eq!(target_addr, target);
        assert!(flags.contains(NdiscNeighborFlags::SOLICITED));
        assert!(!flags.contains(NdiscNeighborFlags::OVERRIDE));
        assert_eq!(lladdr, Some(RawHardwareAddress::from(mac())));
    }

    #[test]
    fn unicast_without_link_destination_is_rejected() {
        let (egress, tx) = tx();
        let dst = Ipv6Address::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 2);
        let err = tx
            .send_icmpv6(Icmpv6Tx {
                src: Ipv6Address::UNSPECIFIED,
                dst,
                hop_limit: 255,
                link_dst: None,
                message: Icmpv6TxMessage::RouterSolicit { slla: None },
            })
            .unwrap_err();
        assert_eq!(err, TxError::Unresolved(dst));
        assert_eq!(egress.len(), 0);
    }

    #[test]
    fn arp_request_is_broadcast_and_round_trips() {
        let (egress, tx) = tx();
        let src_ip = Ipv4Address([192, 168, 9, 7]);
        let target_ip = Ipv4Address([192, 168, 9, 102]);
        tx.send_arp(ArpTx::Request {
            src_mac: mac(),
            src_ip,
            target_ip,
        })
        .unwrap();

        let frame = egress.try_pop().unwrap();
        let eth = EthernetFrame::new_checked(&frame[..]).unwrap();
        assert_eq!(eth.dst_addr(), EthernetAddress::BROADCAST);
        assert_eq!(eth.ethertype(), EthernetProtocol::Arp);
        let arp = ArpPacket::new_checked(eth.payload()).unwrap();
        let ArpRepr::EthernetIpv4 {
            operation,
            source_protocol_addr,
            target_protocol_addr,
            ..
        } = ArpRepr::parse(&arp).unwrap()
        else {
            unreachable!()
        };
        assert_eq!(operation, ArpOperation::Request);
        assert_eq!(source_protocol_addr, src_ip);
        assert_eq!(target_protocol_addr, target_ip);
    }

    #[test]
    fn egress_queue_close_unblocks() {
        let egress = Arc::new(EgressQueue::new(1));
        egress.push(vec![1]).unwrap();
        let producer = egress.clone();
        let thread = std::thread::spawn(move || producer.push(vec![2]));
        // The queue is full; give the producer a moment to block, then close.
        std::thread::sleep(std::time::Duration::from_millis(10));
        egress.close();
        assert_eq!(thread.join().unwrap(), Err(TxError::QueueClosed));
        assert_eq!(egress.pop(), Some(vec![1]));
        assert_eq!(egress.pop(), None);
    }

    #[test]
    fn cidr_sanity() {
        // Anchor for the host registry tests: smoltcp CIDR containment.
        let network = Ipv6Cidr::new(Ipv6Address::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0), 64);
        assert!(network.contains_addr(&Ipv6Address::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)));
        assert!(!network.contains_addr(&Ipv6Address::new(0x2001, 0xdb9, 0, 0, 0, 0, 0, 1)));
    }
}
