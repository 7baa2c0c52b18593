//! The packet-processing pipeline.
//!
//! Layers are ordered top to bottom: tunnel adapter (raw OS packets),
//! multicast, compression, security, transport (wire datagrams). Stages are
//! stored as enum variants in a fixed-order container and composed by a
//! small driver loop; a stage never calls its neighbors, it only returns
//! outputs and the driver routes them.
//!
//! Directions: "down" moves toward the transport (outbound), "up" moves
//! toward the tunnel (inbound). A stage may answer traffic from either
//! side in both directions — the security stage, for example, responds to
//! an inbound handshake packet with an outbound reply.

use crate::addr::DeviceAddr;
use crate::compression::CompressionLayer;
use crate::multicast::MulticastLayer;
use crate::security::SecurityLayer;

/// Outputs produced by one stage invocation.
#[derive(Default)]
pub struct StageOutput {
    /// Packets heading toward the tunnel adapter.
    pub up: Vec<(DeviceAddr, Vec<u8>)>,
    /// Packets heading toward the transport socket.
    pub down: Vec<(DeviceAddr, Vec<u8>)>,
}

impl StageOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn up(addr: DeviceAddr, data: Vec<u8>) -> Self {
        StageOutput {
            up: vec![(addr, data)],
            down: Vec::new(),
        }
    }

    pub fn down(addr: DeviceAddr, data: Vec<u8>) -> Self {
        StageOutput {
            up: Vec::new(),
            down: vec![(addr, data)],
        }
    }
}

/// A pipeline stage, tagged by kind.
pub enum Stage {
    Multicast(MulticastLayer),
    Compression(CompressionLayer),
    Security(SecurityLayer),
}

impl Stage {
    /// Handles data arriving from the layer above, heading down.
    fn handle_upper(&mut self, addr: DeviceAddr, data: &[u8]) -> StageOutput {
        match self {
            Stage::Multicast(layer) => layer.handle_upper(addr, data),
            Stage::Compression(layer) => layer.handle_upper(addr, data),
            Stage::Security(layer) => layer.handle_upper(addr, data),
        }
    }

    /// Handles data arriving from the layer below, heading up.
    fn handle_lower(&mut self, addr: DeviceAddr, data: &[u8]) -> StageOutput {
        match self {
            Stage::Multicast(layer) => layer.handle_lower(addr, data),
            Stage::Compression(layer) => layer.handle_lower(addr, data),
            Stage::Security(layer) => layer.handle_lower(addr, data),
        }
    }
}

/// What falls out of the pipeline after a packet is fully driven through.
#[derive(Default)]
pub struct PipelineOutput {
    /// Synthesized packets for the tunnel adapter.
    pub to_tunnel: Vec<(DeviceAddr, Vec<u8>)>,
    /// Payloads for the transport socket, addressed by device.
    pub to_transport: Vec<(DeviceAddr, Vec<u8>)>,
}

enum Direction {
    Down,
    Up,
}

pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    /// Builds the standard stack: multicast over compression over security.
    pub fn standard(
        multicast: MulticastLayer,
        compression: CompressionLayer,
        security: SecurityLayer,
    ) -> Self {
        Pipeline {
            stages: vec![
                Stage::Multicast(multicast),
                Stage::Compression(compression),
                Stage::Security(security),
            ],
        }
    }

    /// Drives a raw packet from the tunnel adapter down the stack.
    pub fn from_tunnel(&mut self, packet: &[u8]) -> PipelineOutput {
        self.drive(0, Direction::Down, DeviceAddr::UNSPECIFIED, packet.to_vec())
    }

    /// Drives a decrypted-on-arrival transport payload up the stack.
    pub fn from_transport(&mut self, source: DeviceAddr, data: &[u8]) -> PipelineOutput {
        let last = self.stages.len() - 1;
        self.drive(last, Direction::Up, source, data.to_vec())
    }

    /// Routes stage outputs between neighbors until the work queue drains.
    fn drive(
        &mut self,
        start: usize,
        direction: Direction,
        addr: DeviceAddr,
        data: Vec<u8>,
    ) -> PipelineOutput {
        let mut result = PipelineOutput::default();
        let mut queue: std::collections::VecDeque<(usize, Direction, DeviceAddr, Vec<u8>)> =
            std::collections::VecDeque::new();
        queue.push_back((start, direction, addr, data));

        while let Some((idx, dir, addr, data)) = queue.pop_front() {
            let output = match dir {
                Direction::Down => self.stages[idx].handle_upper(addr, &data),
                Direction::Up => self.stages[idx].handle_lower(addr, &data),
            };

            for (addr, data) in output.down {
                if idx + 1 < self.stages.len() {
                    queue.push_back((idx + 1, Direction::Down, addr, data));
                } else {
                    result.to_transport.push((addr, data));
                }
            }
            for (addr, data) in output.up {
                if idx > 0 {
                    queue.push_back((idx - 1, Direction::Up, addr, data));
                } else {
                    result.to_tunnel.push((addr, data));
                }
            }
        }

        result
    }

    /// Direct access to the security stage, for heartbeat probing.
    pub fn security_mut(&mut self) -> Option<&mut SecurityLayer> {
        self.stages.iter_mut().find_map(|stage| match stage {
            Stage::Security(layer) => Some(layer),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeOptions;
    use crate::identity::Identity;
    use crate::peers::PeerRegistry;
    use std::sync::{Arc, Mutex};

    fn build_pipeline() -> (Pipeline, Arc<Identity>) {
        let identity = Arc::new(Identity::create());
        let options = Arc::new(RuntimeOptions::default());
        let registry = Arc::new(Mutex::new(PeerRegistry::new(
            identity.address(),
            options.clone(),
        )));
        let pipeline = Pipeline::standard(
            MulticastLayer::new(identity.address(), options.clone()),
            CompressionLayer::new(registry.clone(), options.compression),
            SecurityLayer::new(identity.clone(), registry, false),
        );
        (pipeline, identity)
    }

    #[test]
    fn outbound_unicast_reaches_transport() {
        let (mut pipeline, identity) = build_pipeline();
        let peer = Identity::create();

        // Minimal IPv6 packet from "the OS": our address to the peer.
        let mut packet = vec![0u8; 48];
        packet[0] = 6 << 4;
        packet[4] = 0;
        packet[5] = 8;
        packet[6] = 17; // UDP
        packet[8..24].copy_from_slice(identity.address().as_bytes());
        packet[24..40].copy_from_slice(peer.address().as_bytes());

        let out = pipeline.from_tunnel(&packet);
        assert!(out.to_tunnel.is_empty());
        // The security layer has no session yet, so the transport should
        // see a key-exchange hello for the destination peer.
        assert_eq!(out.to_transport.len(), 1);
        assert_eq!(out.to_transport[0].0, peer.address());
        assert_eq!(out.to_transport[0].1[0], 1);
    }

    #[test]
    fn malformed_tunnel_packet_produces_nothing() {
        let (mut pipeline, _identity) = build_pipeline();
        let out = pipeline.from_tunnel(&[0u8; 10]);
        assert!(out.to_tunnel.is_empty());
        assert!(out.to_transport.is_empty());
    }
}
