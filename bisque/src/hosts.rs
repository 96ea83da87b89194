// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-interface host address registry.
//!
//! Owns the set of addresses assigned to the stack: IPv6 hosts (address +
//! network + optional gateway), their IPv4 twins, the primary MAC, the
//! address currently undergoing Duplicate Address Detection, and the joined
//! multicast groups. Reads vastly outnumber writes (writes happen only
//! during SLAAC and admin changes), so the state sits behind a `RwLock`.

use parking_lot::RwLock;
use smoltcp::wire::EthernetAddress;
use smoltcp::wire::Ipv4Address;
use smoltcp::wire::Ipv4Cidr;
use smoltcp::wire::Ipv6Address;
use smoltcp::wire::Ipv6Cidr;

/// An IPv6 address assigned to the stack, with the on-link network it
/// belongs to and the router learned for it, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv6HostAddress {
    /// The assigned unicast address.
    pub address: Ipv6Address,
    /// The on-link prefix containing `address`.
    pub network: Ipv6Cidr,
    /// Default router for traffic leaving `network`.
    pub gateway: Option<Ipv6Address>,
}

/// An IPv4 address assigned to the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4HostAddress {
    /// The assigned unicast address.
    pub address: Ipv4Address,
    /// The on-link network containing `address`.
    pub network: Ipv4Cidr,
    /// Default router.
    pub gateway: Option<Ipv4Address>,
}

#[derive(Default)]
struct RegistryState {
    ip6_hosts: Vec<Ipv6HostAddress>,
    ip4_hosts: Vec<Ipv4HostAddress>,
    ip6_groups: Vec<Ipv6Address>,
    candidate: Option<Ipv6Address>,
}

/// The per-stack set of assigned addresses and multicast memberships.
pub struct HostRegistry {
    mac: EthernetAddress,
    state: RwLock<RegistryState>,
}

impl HostRegistry {
    /// Creates an empty registry for an interface with the given MAC.
    pub fn new(mac: EthernetAddress) -> Self {
        Self {
            mac,
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// The interface's unicast MAC.
    pub fn mac(&self) -> EthernetAddress {
        self.mac
    }

    /// Installs an IPv6 host address. Replaces any host with the same
    /// address. The address's solicited-node group becomes a derived
    /// multicast membership.
    pub fn add_ip6_host(&self, host: Ipv6HostAddress) {
        let mut state = self.state.write();
        state.ip6_hosts.retain(|h| h.address != host.address);
        state.ip6_hosts.push(host);
        tracing::info!(address = %host.address, network = %host.network, "assigned IPv6 host address");
    }

    /// Removes an IPv6 host address. Silent if absent.
    pub fn remove_ip6_host(&self, address: &Ipv6Address) {
        self.state.write().ip6_hosts.retain(|h| h.address != *address);
    }

    /// Installs an IPv4 host address. Replaces any host with the same
    /// address.
    pub fn add_ip4_host(&self, host: Ipv4HostAddress) {
        let mut state = self.state.write();
        state.ip4_hosts.retain(|h| h.address != host.address);
        state.ip4_hosts.push(host);
        tracing::info!(address = %host.address, network = %host.network, "assigned IPv4 host address");
    }

    /// Snapshot of the assigned IPv6 hosts.
    pub fn ip6_hosts(&self) -> Vec<Ipv6HostAddress> {
        self.state.read().ip6_hosts.clone()
    }

    /// Snapshot of the assigned IPv4 hosts.
    pub fn ip4_hosts(&self) -> Vec<Ipv4HostAddress> {
        self.state.read().ip4_hosts.clone()
    }

    /// Whether `address` is one of our assigned IPv6 unicast addresses.
    ///
    /// A DAD candidate is tentative and deliberately not part of this set.
    pub fn is_ip6_unicast(&self, address: &Ipv6Address) -> bool {
        self.state.read().ip6_hosts.iter().any(|h| h.address == *address)
    }

    /// Whether `address` is one of our assigned IPv4 unicast addresses.
    pub fn is_ip4_unicast(&self, address: &Ipv4Address) -> bool {
        self.state.read().ip4_hosts.iter().any(|h| h.address == *address)
    }

    /// The IPv6 unicast addresses considered "ours".
    pub fn ip6_unicast_addresses(&self) -> Vec<Ipv6Address> {
        self.state.read().ip6_hosts.iter().map(|h| h.address).collect()
    }

    /// The IPv6 multicast groups the stack listens on: the all-nodes group,
    /// the solicited-node group of every unicast address and of the DAD
    /// candidate, plus explicit joins.
    pub fn ip6_multicast_addresses(&self) -> Vec<Ipv6Address> {
        let state = self.state.read();
        let mut groups = vec![Ipv6Address::LINK_LOCAL_ALL_NODES];
        let derived = state
            .ip6_hosts
            .iter()
            .map(|h| h.address.solicited_node())
            .chain(state.candidate.map(|c| c.solicited_node()))
            .chain(state.ip6_groups.iter().copied());
        for group in derived {
            if !groups.contains(&group) {
                groups.push(group);
            }
        }
        groups
    }

    /// Whether `group` is an IPv6 multicast group the stack listens on.
    pub fn is_ip6_multicast_member(&self, group: &Ipv6Address) -> bool {
        self.ip6_multicast_addresses().contains(group)
    }

    /// Joins an IPv6 multicast group explicitly.
    pub fn join_ip6_group(&self, group: Ipv6Address) {
        let mut state = self.state.write();
        if !state.ip6_groups.contains(&group) {
            state.ip6_groups.push(group);
        }
    }

    /// Leaves an explicitly joined IPv6 multicast group.
    pub fn leave_ip6_group(&self, group: &Ipv6Address) {
        self.state.write().ip6_groups.retain(|g| g != group);
    }

    /// The address currently undergoing Duplicate Address Detection.
    pub fn candidate(&self) -> Option<Ipv6Address> {
        self.state.read().candidate
    }

    /// Marks `address` as the DAD candidate. At most one candidate exists;
    /// a previous candidate is replaced.
    pub fn set_candidate(&self, address: Ipv6Address) {
        self.state.write().candidate = Some(address);
    }

    /// Clears the DAD candidate.
    pub fn clear_candidate(&self) {
        self.state.write().candidate = None;
    }

    /// Picks the source address for a solicitation toward `target`: the
    /// assigned host with the longest prefix containing the target, or the
    /// unspecified address when no network matches.
    pub fn ip6_source_for(&self, target: &Ipv6Address) -> Ipv6Address {
        let state = self.state.read();
        let mut best: Option<&Ipv6HostAddress> = None;
        for host in &state.ip6_hosts {
            if host.network.contains_addr(target)
                && best.is_none_or(|b| host.network.prefix_len() > b.network.prefix_len())
            {
                best = Some(host);
            }
        }
        best.map(|h| h.address).unwrap_or(Ipv6Address::UNSPECIFIED)
    }

    /// IPv4 twin of [`HostRegistry::ip6_source_for`].
    pub fn ip4_source_for(&self, target: &Ipv4Address) -> Ipv4Address {
        let state = self.state.read();
        let mut best: Option<&Ipv4HostAddress> = None;
        for host in &state.ip4_hosts {
            if host.network.contains_addr(target)
                && best.is_none_or(|b| host.network.prefix_len() > b.network.prefix_len())
            {
                best = Some(host);
            }
        }
        best.map(|h| h.address).unwrap_or(Ipv4Address::UNSPECIFIED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac() -> EthernetAddress {
        EthernetAddress([0x02, 0x00, 0x00, 0x11, 0x22, 0x33])
    }

    fn host(address: Ipv6Address, prefix_len: u8) -> Ipv6HostAddress {
        Ipv6HostAddress {
            address,
            network: Ipv6Cidr::new(address, prefix_len),
            gateway: None,
        }
    }

    #[test]
    fn source_selection_prefers_longest_prefix() {
        let registry = HostRegistry::new(mac());
        let wide = Ipv6Address::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0x10);
        let narrow = Ipv6Address::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0x20);
        registry.add_ip6_host(Ipv6HostAddress {
            address: wide,
            network: Ipv6Cidr::new(wide, 32),
            gateway: None,
        });
        registry.add_ip6_host(Ipv6HostAddress {
            address: narrow,
            network: Ipv6Cidr::new(narrow, 64),
            gateway: None,
        });

        let target = Ipv6Address::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1);
        assert_eq!(registry.ip6_source_for(&target), narrow);
    }

    #[test]
    fn source_selection_falls_back_to_unspecified() {
        let registry = HostRegistry::new(mac());
        let target = Ipv6Address::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1);
        assert_eq!(registry.ip6_source_for(&target), Ipv6Address::UNSPECIFIED);
    }

    #[test]
    fn multicast_membership_is_derived() {
        let registry = HostRegistry::new(mac());
        let address = Ipv6Address::new(0xfe80, 0, 0, 0, 0, 0, 0, 0xabcd);
        registry.add_ip6_host(host(address, 64));

        assert!(registry.is_ip6_multicast_member(&Ipv6Address::LINK_LOCAL_ALL_NODES));
        assert!(registry.is_ip6_multicast_member(&address.solicited_node()));

        let candidate = Ipv6Address::new(0xfe80, 0, 0, 0, 0, 0, 0, 0x1234);
        registry.set_candidate(candidate);
        assert!(registry.is_ip6_multicast_member(&candidate.solicited_node()));
        registry.clear_candidate();
        assert!(!registry.is_ip6_multicast_member(&candidate.solicited_node()));
    }

    #[test]
    fn candidate_is_not_unicast() {
        let registry = HostRegistry::new(mac());
        let candidate = Ipv6Address::new(0xfe80, 0, 0, 0, 0, 0, 0, 1);
        registry.set_candidate(candidate);
        assert!(!registry.is_ip6_unicast(&candidate));
        assert_eq!(registry.candidate(), Some(candidate));
    }

    #[test]
    fn reassigning_an_address_replaces_the_host() {
        let registry = HostRegistry::new(mac());
        let address = Ipv6Address::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1);
        registry.add_ip6_host(host(address, 64));
        registry.add_ip6_host(Ipv6HostAddress {
            gateway: Some(Ipv6Address::new(0xfe80, 0, 0, 0, 0, 0, 0, 1)),
            ..host(address, 64)
        });
        assert_eq!(registry.ip6_hosts().len(), 1);
        assert!(registry.ip6_hosts()[0].gateway.is_some());
    }
}
