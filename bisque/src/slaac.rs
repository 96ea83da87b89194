// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Duplicate Address Detection and stateless address autoconfiguration.
//!
//! Implements the host side of RFC 4862: every tentative address runs DAD
//! (a Neighbor Solicitation from the unspecified address, then a timed wait
//! for a defending advertisement), and `autoconfigure` runs the full SLAAC
//! handshake (Router Solicitation, timed wait for a Router Advertisement,
//! EUI-64 derivation and DAD per advertised prefix).
//!
//! The protocol handler and the drivers meet in [`NdEvents`]: one-shot
//! events armed per attempt, released by the matching inbound message or
//! abandoned on timeout.

use crate::StackConfig;
use crate::hosts::HostRegistry;
use crate::hosts::Ipv6HostAddress;
use crate::oneshot::OneshotEvent;
use crate::tx::Icmpv6Tx;
use crate::tx::Icmpv6TxMessage;
use crate::tx::PacketTx;
use crate::tx::TxError;
use parking_lot::Mutex;
use smoltcp::wire::EthernetAddress;
use smoltcp::wire::Ipv6Address;
use smoltcp::wire::Ipv6Cidr;
use smoltcp::wire::NdiscPrefixInfoFlags;
use smoltcp::wire::NdiscPrefixInformation;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// A defending Neighbor Advertisement observed during DAD.
#[derive(Debug, Clone, Copy)]
pub struct DadCollision {
    /// The defender's target link-layer address option, if it sent one.
    pub tlla: Option<EthernetAddress>,
}

/// One Prefix Information option from a Router Advertisement, paired with
/// the advertising router.
#[derive(Debug, Clone)]
pub struct RaPrefix {
    /// The advertised prefix option.
    pub info: NdiscPrefixInformation,
    /// The router's source address, used as the gateway for autoconfigured
    /// hosts.
    pub router: Ipv6Address,
}

/// Rendezvous between the ICMPv6 handler and the DAD/SLAAC drivers.
///
/// Events are one-shot and armed per attempt; signaling an unarmed event is
/// a no-op (an unsolicited advertisement with nobody waiting).
pub struct NdEvents {
    dad: Mutex<Option<Arc<OneshotEvent<DadCollision>>>>,
    ra: Mutex<Option<Arc<OneshotEvent<Vec<RaPrefix>>>>>,
}

impl NdEvents {
    /// Creates the rendezvous with nothing armed.
    pub fn new() -> Self {
        Self {
            dad: Mutex::new(None),
            ra: Mutex::new(None),
        }
    }

    fn arm_dad(&self) -> Arc<OneshotEvent<DadCollision>> {
        let event = Arc::new(OneshotEvent::new());
        *self.dad.lock() = Some(event.clone());
        event
    }

    fn disarm_dad(&self) {
        *self.dad.lock() = None;
    }

    /// Releases the DAD waiter, if any. Called on a Neighbor Advertisement
    /// whose target equals the candidate.
    pub(crate) fn signal_dad(&self, tlla: Option<EthernetAddress>) {
        if let Some(event) = self.dad.lock().take() {
            event.signal(DadCollision { tlla });
        }
    }

    fn arm_ra(&self) -> Arc<OneshotEvent<Vec<RaPrefix>>> {
        let event = Arc::new(OneshotEvent::new());
        *self.ra.lock() = Some(event.clone());
        event
    }

    fn disarm_ra(&self) {
        *self.ra.lock() = None;
    }

    /// Releases the RA waiter, if any, with the advertised prefixes.
    /// Returns whether a waiter consumed them.
    pub(crate) fn signal_ra(&self, prefixes: Vec<RaPrefix>) -> bool {
        match self.ra.lock().take() {
            Some(event) => {
                event.signal(prefixes);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
impl NdEvents {
    pub(crate) fn dad_armed(&self) -> bool {
        self.dad.lock().is_some()
    }

    pub(crate) fn wait_dad_for_test(&self, timeout: Duration) -> Option<DadCollision> {
        self.arm_dad().wait_timeout(timeout)
    }

    pub(crate) fn ra_armed(&self) -> bool {
        self.ra.lock().is_some()
    }

    pub(crate) fn wait_ra_for_test(&self, timeout: Duration) -> Option<Vec<RaPrefix>> {
        self.arm_ra().wait_timeout(timeout)
    }
}

/// Outcome of one Duplicate Address Detection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// No defender appeared before the timeout; the address was installed.
    Installed,
    /// A neighbor defended the address; nothing was installed.
    Duplicate,
}

/// Errors from the autoconfiguration handshake.
#[derive(Debug, Error)]
pub enum SlaacError {
    /// No Router Advertisement arrived before the timeout.
    #[error("no router advertisement received")]
    RouterTimeout,
    /// The egress path failed.
    #[error("transmit failed")]
    Tx(#[from] TxError),
}

/// The DAD / SLAAC driver.
pub struct Slaac {
    hosts: Arc<HostRegistry>,
    tx: Arc<dyn PacketTx>,
    events: Arc<NdEvents>,
    dad_timeout: Duration,
    ra_timeout: Duration,
    // Serializes attempts: the registry holds at most one candidate.
    attempt_gate: Mutex<()>,
}

impl Slaac {
    /// Creates the driver with the timeouts from `config`.
    pub fn new(
        hosts: Arc<HostRegistry>,
        tx: Arc<dyn PacketTx>,
        events: Arc<NdEvents>,
        config: &StackConfig,
    ) -> Self {
        Self {
            hosts,
            tx,
            events,
            dad_timeout: config.dad_timeout,
            ra_timeout: config.ra_timeout,
            attempt_gate: Mutex::new(()),
        }
    }

    /// Runs Duplicate Address Detection for `host` and installs it on
    /// success.
    ///
    /// Registers the address as the DAD candidate (joining its
    /// solicited-node group), probes it with a Neighbor Solicitation from
    /// the unspecified address, and waits for a defending advertisement.
    /// A timeout means the address is free.
    pub fn attempt(&self, host: Ipv6HostAddress) -> Result<AttemptOutcome, TxError> {
        let _serialized = self.attempt_gate.lock();
        let candidate = host.address;

        self.hosts.set_candidate(candidate);
        let event = self.events.arm_dad();
        tracing::info!(address = %candidate, "starting duplicate address detection");

        // RFC 4862 Section 5.4.2: DAD probes are sourced from the
        // unspecified address and carry no source link-layer option.
        let sent = self.tx.send_icmpv6(Icmpv6Tx {
            src: Ipv6Address::UNSPECIFIED,
            dst: candidate.solicited_node(),
            hop_limit: 255,
            link_dst: None,
            message: Icmpv6TxMessage::NeighborSolicit {
                target: candidate,
                slla: None,
            },
        });
        if let Err(error) = sent {
            self.events.disarm_dad();
            self.hosts.clear_candidate();
            return Err(error);
        }

        match event.wait_timeout(self.dad_timeout) {
            Some(collision) => {
                self.hosts.clear_candidate();
                tracing::warn!(
                    address = %candidate,
                    defender = ?collision.tlla,
                    "duplicate address detected, not installing"
                );
                Ok(AttemptOutcome::Duplicate)
            }
            None => {
                self.events.disarm_dad();
                self.hosts.clear_candidate();
                self.hosts.add_ip6_host(host);
                tracing::info!(address = %candidate, "address passed duplicate address detection");
                Ok(AttemptOutcome::Installed)
            }
        }
    }

    /// Runs stateless address autoconfiguration.
    ///
    /// Solicits routers, waits for an advertisement, and for every
    /// autonomous /64 prefix derives the EUI-64 address and runs
    /// [`Slaac::attempt`] with the advertising router as gateway. Returns
    /// the hosts that were installed.
    pub fn autoconfigure(&self) -> Result<Vec<Ipv6HostAddress>, SlaacError> {
        let event = self.events.arm_ra();

        // Source from our link-local address when one is assigned; a
        // solicitation from :: must not carry an SLLA option.
        let src = self
            .hosts
            .ip6_hosts()
            .iter()
            .map(|h| h.address)
            .find(|a| a.is_link_local())
            .unwrap_or(Ipv6Address::UNSPECIFIED);
        let slla = (!src.is_unspecified()).then(|| self.hosts.mac());

        let sent = self.tx.send_icmpv6(Icmpv6Tx {
            src,
            dst: Ipv6Address::LINK_LOCAL_ALL_ROUTERS,
            hop_limit: 255,
            link_dst: None,
            message: Icmpv6TxMessage::RouterSolicit { slla },
        });
        if let Err(error) = sent {
            self.events.disarm_ra();
            return Err(error.into());
        }

        let prefixes = match event.wait_timeout(self.ra_timeout) {
            Some(prefixes) => prefixes,
            None => {
                self.events.disarm_ra();
                tracing::info!("no router advertisement received");
                return Err(SlaacError::RouterTimeout);
            }
        };

        let mut installed = Vec::new();
        for RaPrefix { info, router } in prefixes {
            if !info.flags.contains(NdiscPrefixInfoFlags::ADDRCONF) {
                continue;
            }
            if info.prefix_len != 64 {
                tracing::debug!(
                    prefix = %info.prefix,
                    prefix_len = info.prefix_len,
                    "only /64 prefixes are autoconfigured"
                );
                continue;
            }
            let address = eui64_address(&info.prefix, self.hosts.mac());
            if self.hosts.is_ip6_unicast(&address) {
                continue;
            }
            let host = Ipv6HostAddress {
                address,
                network: Ipv6Cidr::new(info.prefix, info.prefix_len),
                gateway: Some(router),
            };
            match self.attempt(host)? {
                AttemptOutcome::Installed => installed.push(host),
                AttemptOutcome::Duplicate => {}
            }
        }
        Ok(installed)
    }
}

/// Combines a /64 prefix with an EUI-64 interface identifier derived from
/// `mac` (RFC 2464 Section 4: insert `ff:fe`, flip the universal/local bit).
pub fn eui64_address(prefix: &Ipv6Address, mac: EthernetAddress) -> Ipv6Address {
    let mut bytes = [0; 16];
    bytes[..8].copy_from_slice(&prefix.0[..8]);
    bytes[8] = mac.0[0] ^ 0x02;
    bytes[9] = mac.0[1];
    bytes[10] = mac.0[2];
    bytes[11] = 0xff;
    bytes[12] = 0xfe;
    bytes[13] = mac.0[3];
    bytes[14] = mac.0[4];
    bytes[15] = mac.0[5];
    Ipv6Address(bytes)
}

/// The link-local address (`fe80::/64`) derived from `mac`.
pub fn link_local_address(mac: EthernetAddress) -> Ipv6Address {
    eui64_address(&Ipv6Address::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), mac)
}
