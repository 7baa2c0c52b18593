//! Peer state and the peer registry.
//!
//! One [`Peer`] object exists per remote device address for the lifetime of
//! the process. Peers that stop talking simply become inactive; they are
//! never destroyed, only skipped by periodic work. The registry owns all
//! peers plus a reverse map from observed UDP source addresses, and every
//! creation or lookup passes the admission check.

use log::{debug, info, warn};
use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::addr::DeviceAddr;
use crate::config::RuntimeOptions;

/// Upper bound on remembered UDP source addresses per peer.
pub const MAX_SOURCE_ADDRESSES: usize = 5;
/// Global cap on payloads queued while handshakes are in flight.
pub const MAX_QUEUED_PACKETS: usize = 10;

/// Security-layer session state, owned by the peer object.
pub struct SessionState {
    /// True once session keys are negotiated and data can flow.
    pub negotiated: bool,
    /// Ephemeral key-exchange keypair, fresh per peer object.
    pub kx_secret: [u8; 32],
    pub kx_public: [u8; 32],
    pub tx_key: Option<[u8; 32]>,
    pub rx_key: Option<[u8; 32]>,
    /// Capability flags the peer advertised during the handshake.
    pub flags: u64,
    pub heartbeat_ident: [u8; 8],
    pub last_latency_sent: Option<Instant>,
    pub last_latency_received: Option<Instant>,
    pub latency: Option<Duration>,
    /// Payloads waiting for the handshake to finish, flushed FIFO.
    pub queue: VecDeque<Vec<u8>>,
}

impl SessionState {
    fn new() -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        SessionState {
            negotiated: false,
            kx_secret: secret.to_bytes(),
            kx_public: public.to_bytes(),
            tx_key: None,
            rx_key: None,
            flags: 0,
            heartbeat_ident: rand::random(),
            last_latency_sent: None,
            last_latency_received: None,
            latency: None,
            queue: VecDeque::new(),
        }
    }
}

impl Drop for SessionState {
    fn drop(&mut self) {
        self.kx_secret.zeroize();
        if let Some(key) = self.tx_key.as_mut() {
            key.zeroize();
        }
        if let Some(key) = self.rx_key.as_mut() {
            key.zeroize();
        }
    }
}

/// State for one remote device.
pub struct Peer {
    pub addr: DeviceAddr,
    /// Last time we pushed data toward this peer.
    pub last_packet: Option<Instant>,
    pub last_reestablish: Option<Instant>,
    pub connected: bool,
    pub reestablishing: bool,
    pub failed_establishments: u32,
    /// Address direct UDP traffic is currently sent to.
    pub target_address: Option<SocketAddr>,
    /// Cookie of the in-flight path handshake.
    pub hello_cookie: [u8; 16],
    /// Candidate addresses advertised by the base server, kept sorted.
    pub target_addresses: Vec<SocketAddr>,
    /// Address learned from link-local discovery beacons.
    pub link_local_address: Option<SocketAddr>,
    /// Addresses this peer's packets have arrived from.
    pub source_addresses: HashSet<SocketAddr>,
    pub session: SessionState,
}

impl Peer {
    fn new(addr: DeviceAddr) -> Self {
        Peer {
            addr,
            last_packet: None,
            last_reestablish: None,
            connected: false,
            reestablishing: false,
            failed_establishments: 0,
            target_address: None,
            hello_cookie: rand::random(),
            target_addresses: Vec::new(),
            link_local_address: None,
            source_addresses: HashSet::new(),
            session: SessionState::new(),
        }
    }

    /// A peer is active while data flowed toward it within the teardown
    /// window. Inactive peers are skipped by periodic work.
    pub fn is_active(&self, teardown: Duration) -> bool {
        self.last_packet
            .map(|t| t.elapsed() < teardown)
            .unwrap_or(false)
    }
}

/// Registry of all known peers.
pub struct PeerRegistry {
    own_addr: DeviceAddr,
    options: Arc<RuntimeOptions>,
    peers: HashMap<DeviceAddr, Peer>,
    by_source: HashMap<SocketAddr, DeviceAddr>,
    /// Last successful lookup; lets the hot path skip admission checks.
    /// Guarded by the same lock as the maps it shadows.
    cached: Option<DeviceAddr>,
    queued_packets: usize,
}

impl PeerRegistry {
    pub fn new(own_addr: DeviceAddr, options: Arc<RuntimeOptions>) -> Self {
        PeerRegistry {
            own_addr,
            options,
            peers: HashMap::new(),
            by_source: HashMap::new(),
            cached: None,
            queued_packets: 0,
        }
    }

    fn create_peer(&mut self, addr: DeviceAddr) -> bool {
        if addr == self.own_addr {
            return false;
        }
        if !self.options.is_peer_allowed(addr) {
            warn!("peer {} is not on the whitelist", addr);
            return false;
        }
        info!("created peer {}", addr);
        self.peers.insert(addr, Peer::new(addr));
        true
    }

    /// Looks up an existing peer, applying the admission check.
    pub fn get_peer(&mut self, addr: DeviceAddr) -> Option<&mut Peer> {
        if self.cached != Some(addr) {
            if addr == self.own_addr {
                return None;
            }
            if !self.options.is_peer_allowed(addr) {
                warn!("peer {} is not on the whitelist", addr);
                return None;
            }
            if !self.peers.contains_key(&addr) {
                return None;
            }
            self.cached = Some(addr);
        }
        self.peers.get_mut(&addr)
    }

    /// Idempotent per address: at most one peer object ever exists for it.
    pub fn get_or_create(&mut self, addr: DeviceAddr) -> Option<&mut Peer> {
        if self.get_peer(addr).is_none() && !self.create_peer(addr) {
            return None;
        }
        self.get_peer(addr)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Snapshot of all known peer addresses, for periodic iteration.
    pub fn peer_addrs(&self) -> Vec<DeviceAddr> {
        self.peers.keys().copied().collect()
    }

    /// Resolves the sender of an inbound direct datagram.
    pub fn find_by_source(&self, source: &SocketAddr) -> Option<DeviceAddr> {
        self.by_source.get(source).copied()
    }

    fn remove_source_address(&mut self, addr: DeviceAddr, source: &SocketAddr) {
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.source_addresses.remove(source);
        }
        self.by_source.remove(source);
    }

    /// Records a source address for a peer, evicting a pseudo-random old
    /// entry when the per-peer cap is reached. A source address can only
    /// map to one peer; recording it here displaces any previous owner.
    pub fn add_source_address(&mut self, addr: DeviceAddr, source: SocketAddr) {
        let Some(peer) = self.peers.get_mut(&addr) else {
            return;
        };
        if peer.source_addresses.contains(&source) {
            return;
        }

        if peer.source_addresses.len() >= MAX_SOURCE_ADDRESSES {
            let victims: Vec<SocketAddr> = peer.source_addresses.iter().copied().collect();
            let victim = victims[rand::thread_rng().gen_range(0..victims.len())];
            self.remove_source_address(addr, &victim);
        }

        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.source_addresses.insert(source);
        }

        if let Some(previous) = self.by_source.insert(source, addr) {
            if previous != addr {
                debug!("source {} moved from {} to {}", source, previous, addr);
                if let Some(old) = self.peers.get_mut(&previous) {
                    old.source_addresses.remove(&source);
                }
            }
        }
    }

    /// Queues a payload while a handshake is in flight. Bounded globally;
    /// returns false (payload dropped) once the cap is reached.
    pub fn try_enqueue(&mut self, addr: DeviceAddr, payload: Vec<u8>) -> bool {
        if self.queued_packets >= MAX_QUEUED_PACKETS {
            return false;
        }
        let Some(peer) = self.peers.get_mut(&addr) else {
            return false;
        };
        peer.session.queue.push_back(payload);
        self.queued_packets += 1;
        true
    }

    /// Drains a peer's pending queue in FIFO order.
    pub fn take_queue(&mut self, addr: DeviceAddr) -> Vec<Vec<u8>> {
        let Some(peer) = self.peers.get_mut(&addr) else {
            return Vec::new();
        };
        let drained: Vec<Vec<u8>> = peer.session.queue.drain(..).collect();
        self.queued_packets = self.queued_packets.saturating_sub(drained.len());
        drained
    }
}
