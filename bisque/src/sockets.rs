// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! UDP socket registry.
//!
//! The slice of the socket layer the ICMPv6 error path depends on: a
//! registry keyed by 4-tuple patterns (wildcards for unbound fields) with a
//! progressively-less-specific lookup, used to route Destination
//! Unreachable notifications back to the owning socket. The UDP data path
//! itself lives elsewhere.

use parking_lot::Mutex;
use parking_lot::RwLock;
use smoltcp::wire::Ipv6Address;
use std::collections::HashMap;
use std::sync::Arc;

/// Identity of a bound UDP socket. The unspecified address and port zero
/// act as wildcards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UdpSocketId {
    /// Local (bound) address.
    pub local_addr: Ipv6Address,
    /// Local (bound) port.
    pub local_port: u16,
    /// Connected remote address, or unspecified.
    pub remote_addr: Ipv6Address,
    /// Connected remote port, or zero.
    pub remote_port: u16,
}

impl UdpSocketId {
    /// Lookup patterns for a flow, most specific first: the exact 4-tuple,
    /// the connected-local listener, then the any-address listener.
    fn patterns(&self) -> [UdpSocketId; 3] {
        [
            *self,
            UdpSocketId {
                remote_addr: Ipv6Address::UNSPECIFIED,
                remote_port: 0,
                ..*self
            },
            UdpSocketId {
                local_addr: Ipv6Address::UNSPECIFIED,
                remote_addr: Ipv6Address::UNSPECIFIED,
                remote_port: 0,
                ..*self
            },
        ]
    }
}

/// Per-socket notification state handed to the socket owner.
#[derive(Debug, Default)]
pub struct UdpSocketHandle {
    unreachable: Mutex<Option<UdpSocketId>>,
}

impl UdpSocketHandle {
    /// Records that a datagram of this socket bounced.
    fn notify(&self, flow: UdpSocketId) {
        *self.unreachable.lock() = Some(flow);
    }

    /// Takes the last unreachable flow, if any.
    pub fn take_unreachable(&self) -> Option<UdpSocketId> {
        self.unreachable.lock().take()
    }
}

/// The registry of bound UDP sockets.
pub struct UdpSocketRegistry {
    sockets: RwLock<HashMap<UdpSocketId, Arc<UdpSocketHandle>>>,
}

impl UdpSocketRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            sockets: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a socket under `id`, returning its notification handle.
    /// Re-registering an id replaces the previous handle.
    pub fn register(&self, id: UdpSocketId) -> Arc<UdpSocketHandle> {
        let handle = Arc::new(UdpSocketHandle::default());
        self.sockets.write().insert(id, handle.clone());
        handle
    }

    /// Removes a socket. Silent if absent.
    pub fn unregister(&self, id: &UdpSocketId) {
        self.sockets.write().remove(id);
    }

    /// Finds the socket owning the given flow, trying progressively less
    /// specific patterns, and notifies it. Returns whether one matched.
    pub fn notify_unreachable(
        &self,
        local_addr: Ipv6Address,
        local_port: u16,
        remote_addr: Ipv6Address,
        remote_port: u16,
    ) -> bool {
        let flow = UdpSocketId {
            local_addr,
            local_port,
            remote_addr,
            remote_port,
        };
        let sockets = self.sockets.read();
        for pattern in flow.patterns() {
            if let Some(handle) = sockets.get(&pattern) {
                handle.notify(flow);
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local() -> Ipv6Address {
        Ipv6Address::new(0xfe80, 0, 0, 0, 0, 0, 0, 0xabcd)
    }

    fn remote() -> Ipv6Address {
        Ipv6Address::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0x50)
    }

    #[test]
    fn exact_match_wins_over_listener() {
        let registry = UdpSocketRegistry::new();
        let listener = registry.register(UdpSocketId {
            local_addr: local(),
            local_port: 53,
            remote_addr: Ipv6Address::UNSPECIFIED,
            remote_port: 0,
        });
        let connected = registry.register(UdpSocketId {
            local_addr: local(),
            local_port: 53,
            remote_addr: remote(),
            remote_port: 5353,
        });

        assert!(registry.notify_unreachable(local(), 53, remote(), 5353));
        assert!(connected.take_unreachable().is_some());
        assert!(listener.take_unreachable().is_none());
    }

    #[test]
    fn any_address_listener_matches_last() {
        let registry = UdpSocketRegistry::new();
        let handle = registry.register(UdpSocketId {
            local_addr: Ipv6Address::UNSPECIFIED,
            local_port: 53,
            remote_addr: Ipv6Address::UNSPECIFIED,
            remote_port: 0,
        });

        assert!(registry.notify_unreachable(local(), 53, remote(), 5353));
        let flow = handle.take_unreachable().unwrap();
        assert_eq!(flow.remote_port, 5353);
    }

    #[test]
    fn no_socket_no_match() {
        let registry = UdpSocketRegistry::new();
        assert!(!registry.notify_unreachable(local(), 53, remote(), 5353));
    }

    #[test]
    fn unregister_removes_the_socket() {
        let registry = UdpSocketRegistry::new();
        let id = UdpSocketId {
            local_addr: local(),
            local_port: 53,
            remote_addr: Ipv6Address::UNSPECIFIED,
            remote_port: 0,
        };
        registry.register(id);
        registry.unregister(&id);
        assert!(!registry.notify_unreachable(local(), 53, remote(), 5353));
    }
}
