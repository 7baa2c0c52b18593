//! Overlay device addresses.
//!
//! Every device on the mesh is identified by a 16-byte address derived from
//! its public key. The address doubles as an IPv6 address inside the
//! reserved `fc94::/16` range, so the same value routes packets on the
//! virtual interface and keys peer state inside the engine.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Length of a device address in bytes.
pub const ADDR_LEN: usize = 16;

/// First two bytes of every overlay address (`fc94::/16`).
pub const OVERLAY_PREFIX: [u8; 2] = [0xfc, 0x94];

/// 16-byte overlay device address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DeviceAddr([u8; ADDR_LEN]);

impl DeviceAddr {
    /// The all-zero address, used as a placeholder for "no peer".
    pub const UNSPECIFIED: DeviceAddr = DeviceAddr([0u8; ADDR_LEN]);

    pub fn from_bytes(bytes: [u8; ADDR_LEN]) -> Self {
        DeviceAddr(bytes)
    }

    /// Builds an address from a slice, returning `None` on length mismatch.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; ADDR_LEN] = bytes.try_into().ok()?;
        Some(DeviceAddr(arr))
    }

    pub fn as_bytes(&self) -> &[u8; ADDR_LEN] {
        &self.0
    }

    pub fn is_unspecified(&self) -> bool {
        self.0 == [0u8; ADDR_LEN]
    }

    /// True if this address lies inside the reserved overlay prefix.
    pub fn is_overlay(&self) -> bool {
        self.0[0] == OVERLAY_PREFIX[0] && self.0[1] == OVERLAY_PREFIX[1]
    }

    /// True for IPv6 multicast destinations (`ff00::/8`).
    pub fn is_multicast(&self) -> bool {
        self.0[0] == 0xff
    }

    pub fn to_ipv6(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.0)
    }

    pub fn from_ipv6(ip: Ipv6Addr) -> Self {
        DeviceAddr(ip.octets())
    }
}

impl fmt::Display for DeviceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_ipv6())
    }
}

impl fmt::Debug for DeviceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceAddr({})", self.to_ipv6())
    }
}

impl From<[u8; ADDR_LEN]> for DeviceAddr {
    fn from(bytes: [u8; ADDR_LEN]) -> Self {
        DeviceAddr(bytes)
    }
}

/// True if `ip` falls inside the overlay prefix. Used to keep overlay
/// traffic from being advertised or dialed as a real-world address.
pub fn is_overlay_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V6(v6) => {
            let o = v6.octets();
            o[0] == OVERLAY_PREFIX[0] && o[1] == OVERLAY_PREFIX[1]
        }
        IpAddr::V4(_) => false,
    }
}

/// IPv6 link-local (`fe80::/10`).
pub fn is_link_local_v6(ip: &Ipv6Addr) -> bool {
    let o = ip.octets();
    o[0] == 0xfe && (o[1] & 0xc0) == 0x80
}

/// RFC 1918 private IPv4 space.
pub fn is_private_v4(ip: &Ipv4Addr) -> bool {
    let o = ip.octets();
    o[0] == 10 || (o[0] == 172 && (16..=31).contains(&o[1])) || (o[0] == 192 && o[1] == 168)
}

/// True if a datagram source is plausibly on the local network segment.
/// Discovery beacons from anywhere else are dropped.
pub fn is_local_segment(addr: &SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V4(v4) => is_private_v4(&v4) || v4.is_link_local(),
        IpAddr::V6(v6) => is_link_local_v6(&v6),
    }
}
