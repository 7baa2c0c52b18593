//! Payload compression stage.
//!
//! The compression capability is negotiated end-to-end (see
//! [`crate::security::FLAG_COMPRESSION`]), but the current protocol
//! revision transmits payloads uncompressed: this stage reserves the
//! transform slot in the pipeline so a compressor can be added without
//! changing the layering contract or the wire framing around it.

use log::trace;
use std::sync::{Arc, Mutex};

use crate::addr::DeviceAddr;
use crate::peers::PeerRegistry;
use crate::pipeline::StageOutput;
use crate::security::FLAG_COMPRESSION;
use crate::util::lock;

pub struct CompressionLayer {
    registry: Arc<Mutex<PeerRegistry>>,
    /// Whether this node advertises the capability at all.
    enabled: bool,
}

impl CompressionLayer {
    pub fn new(registry: Arc<Mutex<PeerRegistry>>, enabled: bool) -> Self {
        CompressionLayer { registry, enabled }
    }

    /// True when both ends negotiated the capability for this peer.
    fn negotiated_with(&self, addr: DeviceAddr) -> bool {
        if !self.enabled {
            return false;
        }
        let mut registry = lock(&self.registry);
        registry
            .get_peer(addr)
            .map(|peer| peer.session.flags & FLAG_COMPRESSION != 0)
            .unwrap_or(false)
    }

    pub(crate) fn handle_upper(&mut self, addr: DeviceAddr, data: &[u8]) -> StageOutput {
        if self.negotiated_with(addr) {
            trace!("compression negotiated with {}, transmitting uncompressed", addr);
        }
        StageOutput::down(addr, data.to_vec())
    }

    pub(crate) fn handle_lower(&mut self, addr: DeviceAddr, data: &[u8]) -> StageOutput {
        StageOutput::up(addr, data.to_vec())
    }
}
