//! Multicast fan-out and pseudo-IPv6 header synthesis.
//!
//! The layers below this one only understand point-to-point payloads
//! addressed by device. This stage gives the tunnel adapter the illusion of
//! a normal IPv6 link: inbound payloads get a synthesized 40-byte IPv6
//! header, and outbound multicast packets are expanded into one tagged copy
//! per configured destination peer.

use log::{debug, warn};
use std::sync::Arc;

use crate::addr::DeviceAddr;
use crate::config::RuntimeOptions;
use crate::pipeline::StageOutput;

/// Tag prefix marking a payload as carrying an embedded multicast address.
pub const MULTICAST_TAG: [u8; 2] = [0xff, 0x01];

/// Size of the synthesized IPv6 header.
pub const IPV6_HEADER_LEN: usize = 40;

/// Hop limit stamped into synthesized headers.
const HOP_LIMIT: u8 = 3;

/// Wrapped multicast payload: tag (2) + protocol (1) + group address (16).
const MULTICAST_WRAP_LEN: usize = 3 + 16;

pub struct MulticastLayer {
    own_addr: DeviceAddr,
    options: Arc<RuntimeOptions>,
}

impl MulticastLayer {
    pub fn new(own_addr: DeviceAddr, options: Arc<RuntimeOptions>) -> Self {
        MulticastLayer { own_addr, options }
    }

    /// Builds a minimal IPv6 header in front of a payload. Only the fields
    /// the tunnel consumer actually reads are populated: version, payload
    /// length, next header and hop limit.
    fn synthesize(src: &DeviceAddr, dst: &[u8; 16], protocol: u8, payload: &[u8]) -> Vec<u8> {
        let mut packet = Vec::with_capacity(IPV6_HEADER_LEN + payload.len());
        packet.resize(8, 0);
        packet[0] = 6 << 4;
        packet[4] = (payload.len() >> 8) as u8;
        packet[5] = (payload.len() & 0xff) as u8;
        packet[6] = protocol;
        packet[7] = HOP_LIMIT;
        packet.extend_from_slice(src.as_bytes());
        packet.extend_from_slice(dst);
        packet.extend_from_slice(payload);
        packet
    }

    /// Outbound: a raw IPv6 packet from the tunnel adapter.
    pub(crate) fn handle_upper(&mut self, _addr: DeviceAddr, packet: &[u8]) -> StageOutput {
        if packet.len() <= IPV6_HEADER_LEN {
            warn!("dropping truncated packet from tunnel ({} bytes)", packet.len());
            return StageOutput::empty();
        }
        let version = packet[0] >> 4;
        if version != 6 {
            warn!("dropping tunnel packet with IP version {}", version);
            return StageOutput::empty();
        }

        let protocol = packet[6];
        let src = DeviceAddr::from_slice(&packet[8..24]).unwrap_or_default();
        let dst = DeviceAddr::from_slice(&packet[24..40]).unwrap_or_default();
        let payload = &packet[IPV6_HEADER_LEN..];

        if dst.is_multicast() {
            let mut msg = Vec::with_capacity(MULTICAST_WRAP_LEN + payload.len());
            msg.extend_from_slice(&MULTICAST_TAG);
            msg.push(protocol);
            msg.extend_from_slice(dst.as_bytes());
            msg.extend_from_slice(payload);

            let destinations = self.options.multicast_destinations(self.own_addr);
            if !destinations.is_empty() {
                debug!("multicast fan-out to {} destinations", destinations.len());
            }
            let mut out = StageOutput::empty();
            for dest in destinations {
                out.down.push((dest, msg.clone()));
            }
            return out;
        }

        if dst.is_overlay() {
            // Only forward packets this node originated. Anything else is
            // spoofed or misrouted local traffic.
            if src != self.own_addr {
                debug!("dropping packet with foreign source {}", src);
                return StageOutput::empty();
            }
            let mut msg = Vec::with_capacity(1 + payload.len());
            msg.push(protocol);
            msg.extend_from_slice(payload);
            return StageOutput::down(dst, msg);
        }

        debug!("ignoring tunnel packet to non-overlay destination");
        StageOutput::empty()
    }

    /// Inbound: a decrypted payload from a peer.
    pub(crate) fn handle_lower(&mut self, source: DeviceAddr, data: &[u8]) -> StageOutput {
        if data.len() < 2 {
            return StageOutput::empty();
        }

        if data[..2] == MULTICAST_TAG {
            if data.len() < MULTICAST_WRAP_LEN + 1 {
                return StageOutput::empty();
            }
            let protocol = data[2];
            let group: [u8; 16] = data[3..19].try_into().unwrap_or([0; 16]);
            if group[0] != 0xff {
                // The embedded address must actually be multicast.
                return StageOutput::empty();
            }
            let payload = &data[MULTICAST_WRAP_LEN..];
            debug!("received multicast from {}", source);
            let packet = Self::synthesize(&source, &group, protocol, payload);
            return StageOutput::up(source, packet);
        }

        let protocol = data[0];
        let payload = &data[1..];
        let packet = Self::synthesize(&source, self.own_addr.as_bytes(), protocol, payload);
        StageOutput::up(source, packet)
    }
}
