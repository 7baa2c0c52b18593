//! Unicast overlay sockets.
//!
//! Binds the local UDP socket the engine speaks through, scanning upward
//! from the default source port when it is taken. IPv4 and IPv6 get
//! separate sockets bound to the same port; systems without a usable IPv6
//! stack degrade to IPv4-only operation.

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;

/// First source port tried when none is pinned.
pub const SOURCE_PORT_START: u16 = 5582;
/// Scanning past this port aborts: without a local socket the engine
/// cannot function at all.
pub const SOURCE_PORT_LIMIT: u16 = 7000;

pub struct OverlaySocket {
    v4: Arc<UdpSocket>,
    v6: Option<Arc<UdpSocket>>,
    port: u16,
}

impl OverlaySocket {
    /// Binds the unicast sockets. A pinned port is tried exactly once;
    /// otherwise ports are scanned from the default until one binds.
    pub async fn bind(override_port: Option<u16>) -> Result<Self> {
        let v4 = match override_port {
            Some(port) => UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))
                .await
                .with_context(|| format!("failed to bind pinned source port {}", port))?,
            None => {
                let mut bound = None;
                for port in SOURCE_PORT_START..SOURCE_PORT_LIMIT {
                    match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await {
                        Ok(socket) => {
                            bound = Some(socket);
                            break;
                        }
                        Err(e) => debug!("port {} unavailable: {}", port, e),
                    }
                }
                match bound {
                    Some(socket) => socket,
                    None => bail!(
                        "failed to bind any UDP source port in {}..{}",
                        SOURCE_PORT_START,
                        SOURCE_PORT_LIMIT
                    ),
                }
            }
        };

        let port = v4.local_addr()?.port();
        info!("overlay socket listening on UDP port {}", port);

        let v6 = match UdpSocket::bind((Ipv6Addr::UNSPECIFIED, port)).await {
            Ok(socket) => Some(Arc::new(socket)),
            Err(e) => {
                warn!("IPv6 unavailable ({}), running IPv4-only", e);
                None
            }
        };

        Ok(OverlaySocket {
            v4: Arc::new(v4),
            v6,
            port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn v4(&self) -> Arc<UdpSocket> {
        self.v4.clone()
    }

    pub fn v6(&self) -> Option<Arc<UdpSocket>> {
        self.v6.clone()
    }

    /// Fire-and-forget datagram send, routed by address family. Failures
    /// are logged and dropped; UDP gives no delivery promise anyway.
    pub fn send_to(&self, buf: &[u8], addr: SocketAddr) {
        let result = match addr {
            SocketAddr::V4(_) => self.v4.try_send_to(buf, addr),
            SocketAddr::V6(_) => match &self.v6 {
                Some(socket) => socket.try_send_to(buf, addr),
                None => {
                    debug!("no IPv6 socket, dropping send to {}", addr);
                    return;
                }
            },
        };
        if let Err(e) = result {
            debug!("UDP send to {} failed: {}", addr, e);
        }
    }
}
