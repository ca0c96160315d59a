use std::net::IpAddr;

use serde::Deserialize;

/// Socket options for a datagram endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DatagramOptions {
    /// Allow sending to broadcast addresses (SO_BROADCAST)
    pub broadcast: bool,

    /// Multicast group joined once the endpoint listens
    pub multicast_group: Option<IpAddr>,

    /// Local interface address used for multicast membership
    pub multicast_interface: Option<IpAddr>,

    /// Share the bound port with other endpoints that also enable reuse
    pub reuse_address: bool,

    /// Receive our own multicast traffic (IP_MULTICAST_LOOP)
    pub multicast_loopback: bool,

    /// Multicast time to live (IP_MULTICAST_TTL)
    pub multicast_ttl: u32,
}

impl Default for DatagramOptions {
    fn default() -> Self {
        Self {
            broadcast: false,
            multicast_group: None,
            multicast_interface: None,
            reuse_address: false,
            multicast_loopback: true,
            multicast_ttl: 1,
        }
    }
}

impl DatagramOptions {
    /// Create default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable broadcast.
    pub fn with_broadcast(mut self, broadcast: bool) -> Self {
        self.broadcast = broadcast;
        self
    }

    /// Enable or disable port reuse.
    pub fn with_reuse_address(mut self, reuse: bool) -> Self {
        self.reuse_address = reuse;
        self
    }

    /// Join a multicast group, optionally on a specific interface.
    pub fn with_multicast_group(mut self, group: IpAddr, interface: Option<IpAddr>) -> Self {
        self.multicast_group = Some(group);
        self.multicast_interface = interface;
        self
    }

    /// Set the multicast loopback mode.
    pub fn with_multicast_loopback(mut self, loopback: bool) -> Self {
        self.multicast_loopback = loopback;
        self
    }

    /// Set the multicast TTL.
    pub fn with_multicast_ttl(mut self, ttl: u32) -> Self {
        self.multicast_ttl = ttl;
        self
    }
}
