//! Link-local peer discovery.
//!
//! Peers on the same network segment find each other without the base
//! server: every refresh round broadcasts a small presence beacon to two
//! fixed multicast groups, and inbound beacons teach the engine a peer's
//! link-local address so it can hole-punch locally.

use log::{debug, warn};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;

use crate::addr::{DeviceAddr, ADDR_LEN};
use crate::transport::Engine;

/// Fixed discovery port for beacons.
pub const DISCOVERY_PORT: u16 = 5581;

/// IPv4 ad-hoc multicast group (224.3.252.148).
pub const GROUP_V4: Ipv4Addr = Ipv4Addr::new(224, 3, 252, 148);

/// IPv6 link-local multicast group.
pub const GROUP_V6: Ipv6Addr = Ipv6Addr::new(
    0xff02, 0x88bb, 0x31e4, 0x95f7, 0x2b87, 0x6b52, 0xe112, 0x19ac,
);

/// Beacon payload: unicast source port followed by the device address.
pub const BEACON_LEN: usize = 2 + ADDR_LEN;

pub fn encode_beacon(source_port: u16, addr: DeviceAddr) -> [u8; BEACON_LEN] {
    let mut beacon = [0u8; BEACON_LEN];
    beacon[..2].copy_from_slice(&source_port.to_le_bytes());
    beacon[2..].copy_from_slice(addr.as_bytes());
    beacon
}

/// Decodes a beacon; extra trailing bytes are tolerated for forward
/// compatibility.
pub fn decode_beacon(data: &[u8]) -> Option<(u16, DeviceAddr)> {
    if data.len() < BEACON_LEN {
        return None;
    }
    let port = u16::from_le_bytes([data[0], data[1]]);
    let addr = DeviceAddr::from_slice(&data[2..BEACON_LEN])?;
    Some((port, addr))
}

/// Discovery sockets joined to both multicast groups. Either family may be
/// unavailable; discovery degrades to whatever could be bound.
pub struct Discovery {
    v4: Option<Arc<UdpSocket>>,
    v6: Option<Arc<UdpSocket>>,
}

impl Discovery {
    pub async fn bind() -> Self {
        let v4 = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, DISCOVERY_PORT)).await {
            Ok(socket) => match socket.join_multicast_v4(GROUP_V4, Ipv4Addr::UNSPECIFIED) {
                Ok(()) => Some(Arc::new(socket)),
                Err(e) => {
                    warn!("failed to join IPv4 discovery group: {}", e);
                    None
                }
            },
            Err(e) => {
                warn!("failed to bind IPv4 discovery socket: {}", e);
                None
            }
        };

        let v6 = match UdpSocket::bind((Ipv6Addr::UNSPECIFIED, DISCOVERY_PORT)).await {
            Ok(socket) => match socket.join_multicast_v6(&GROUP_V6, 0) {
                Ok(()) => Some(Arc::new(socket)),
                Err(e) => {
                    warn!("failed to join IPv6 discovery group: {}", e);
                    None
                }
            },
            Err(e) => {
                debug!("no IPv6 discovery socket: {}", e);
                None
            }
        };

        Discovery { v4, v6 }
    }

    /// Sends one presence beacon to each reachable group.
    pub fn send_beacon(&self, source_port: u16, addr: DeviceAddr) {
        let beacon = encode_beacon(source_port, addr);
        if let Some(socket) = &self.v4 {
            let dest = SocketAddr::new(IpAddr::V4(GROUP_V4), DISCOVERY_PORT);
            if let Err(e) = socket.try_send_to(&beacon, dest) {
                debug!("IPv4 beacon send failed: {}", e);
            }
        }
        if let Some(socket) = &self.v6 {
            let dest = SocketAddr::new(IpAddr::V6(GROUP_V6), DISCOVERY_PORT);
            if let Err(e) = socket.try_send_to(&beacon, dest) {
                debug!("IPv6 beacon send failed: {}", e);
            }
        }
    }

    /// Spawns one receive loop per bound socket, feeding beacons into the
    /// engine.
    pub(crate) fn spawn_receivers(&self, engine: &Arc<Engine>) {
        for socket in [self.v4.clone(), self.v6.clone()].into_iter().flatten() {
            let engine = engine.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 256];
                loop {
                    match socket.recv_from(&mut buf).await {
                        Ok((n, source)) => engine.discovery_packet(source, &buf[..n]),
                        Err(e) => {
                            debug!("discovery receive error: {}", e);
                        }
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beacon_round_trip() {
        let addr = DeviceAddr::from_ipv6("fc94::abcd".parse().unwrap());
        let beacon = encode_beacon(5582, addr);
        assert_eq!(decode_beacon(&beacon), Some((5582, addr)));
    }

    #[test]
    fn short_beacon_is_rejected() {
        assert_eq!(decode_beacon(&[0u8; 17]), None);
        assert_eq!(decode_beacon(&[]), None);
    }

    #[test]
    fn trailing_bytes_are_tolerated() {
        let addr = DeviceAddr::from_ipv6("fc94::1".parse().unwrap());
        let mut data = encode_beacon(7000, addr).to_vec();
        data.extend_from_slice(b"future extension");
        assert_eq!(decode_beacon(&data), Some((7000, addr)));
    }
}
