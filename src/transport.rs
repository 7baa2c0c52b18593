//! Transport socket and NAT-traversal state machine.
//!
//! The engine owns the unicast UDP sockets and the base-server
//! relationship, and drives every peer's path state machine:
//! disconnected peers fall back to relaying through the base while
//! hole-punching attempts run in the background, and a confirmed
//! hello/hello-reply round trip promotes a peer to direct UDP.
//!
//! Latency-sensitive traffic (sealed data) is handled inline on the
//! receive path; signature-verified handshake packets and routine
//! periodic work go through a bounded worker queue that drops and logs
//! under overload instead of ever blocking the socket loop.

use log::{debug, info, warn};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::addr::{is_link_local_v6, is_local_segment, is_overlay_ip, DeviceAddr};
use crate::base::{self, BaseState};
use crate::compression::CompressionLayer;
use crate::config::{RuntimeOptions, Timing};
use crate::crypto;
use crate::discovery::{self, Discovery};
use crate::identity::Identity;
use crate::multicast::MulticastLayer;
use crate::peers::{Peer, PeerRegistry};
use crate::pipeline::{Pipeline, PipelineOutput};
use crate::security::SecurityLayer;
use crate::socket::OverlaySocket;
use crate::util::lock;
use crate::wire::{self, BaseToPeer, PathHello, PeerToBase, PeerToPeer};

/// Capacity of the background worker queue.
pub const WORKER_QUEUE_SIZE: usize = 256;

/// Work items processed off the socket receive path.
pub enum Work {
    /// Periodic refresh round: address push, NAT keepalives, per-peer
    /// housekeeping.
    Refresh,
    /// A path handshake datagram awaiting signature verification.
    PeerFrame { source: SocketAddr, data: Vec<u8> },
}

/// Supplies the local interface addresses advertised to the base server.
pub trait LocalAddressProvider: Send + Sync {
    fn local_addresses(&self) -> Vec<IpAddr>;
}

/// Discovers local addresses through route-table probes: connecting a UDP
/// socket performs a route lookup without transmitting anything, and the
/// chosen source address is the one peers on that path would see.
pub struct ProbedAddresses;

impl LocalAddressProvider for ProbedAddresses {
    fn local_addresses(&self) -> Vec<IpAddr> {
        let mut addresses = Vec::new();
        if let Ok(socket) = std::net::UdpSocket::bind(("0.0.0.0", 0)) {
            if socket.connect(("8.8.8.8", 53)).is_ok() {
                if let Ok(local) = socket.local_addr() {
                    addresses.push(local.ip());
                }
            }
        }
        if let Ok(socket) = std::net::UdpSocket::bind(("::", 0)) {
            if socket.connect(("2001:4860:4860::8888", 53)).is_ok() {
                if let Ok(local) = socket.local_addr() {
                    addresses.push(local.ip());
                }
            }
        }
        addresses
    }
}

/// Fixed address list, for configuration overrides and tests.
pub struct StaticAddresses(pub Vec<IpAddr>);

impl LocalAddressProvider for StaticAddresses {
    fn local_addresses(&self) -> Vec<IpAddr> {
        self.0.clone()
    }
}

fn since(instant: Option<Instant>) -> Duration {
    instant.map(|t| t.elapsed()).unwrap_or(Duration::MAX)
}

/// Builds the candidate address set for a reestablish attempt: everything
/// the base advertised, the link-local discovery address and every
/// previously observed source address, deduplicated and sorted for
/// deterministic fan-out. Addresses inside the overlay's own range and
/// policy-rejected addresses never appear.
pub(crate) fn reestablish_candidates(peer: &Peer, options: &RuntimeOptions) -> Vec<SocketAddr> {
    let mut addresses = peer.target_addresses.clone();
    if let Some(link_local) = peer.link_local_address {
        addresses.push(link_local);
    }
    addresses.extend(peer.source_addresses.iter().copied());
    addresses.sort();
    addresses.dedup();
    addresses.retain(|addr| !is_overlay_ip(&addr.ip()) && options.is_address_allowed(addr));
    addresses
}

struct NetState {
    /// Sorted snapshot of advertised local addresses.
    local_addresses: Vec<SocketAddr>,
    last_refresh: Option<Instant>,
    last_periodic: Option<Instant>,
}

/// The peer-to-peer socket engine.
pub struct Engine {
    weak: Weak<Engine>,
    identity: Arc<Identity>,
    options: Arc<RuntimeOptions>,
    timing: Timing,
    socket: OverlaySocket,
    registry: Arc<Mutex<PeerRegistry>>,
    pipeline: Mutex<Pipeline>,
    base: Mutex<BaseState>,
    net: Mutex<NetState>,
    worker_tx: mpsc::Sender<Work>,
    /// Inbound packets for the tunnel adapter.
    tunnel_tx: mpsc::Sender<Vec<u8>>,
    discovery: Option<Discovery>,
    local_provider: Arc<dyn LocalAddressProvider>,
}

impl Engine {
    /// Binds the engine's sockets and assembles the pipeline. The returned
    /// worker receiver must be passed to [`Engine::start`].
    pub async fn bind(
        identity: Arc<Identity>,
        options: Arc<RuntimeOptions>,
        timing: Timing,
        local_provider: Arc<dyn LocalAddressProvider>,
        discovery: Option<Discovery>,
        tunnel_tx: mpsc::Sender<Vec<u8>>,
    ) -> anyhow::Result<(Arc<Engine>, mpsc::Receiver<Work>)> {
        let socket = OverlaySocket::bind(options.override_source_port).await?;
        let registry = Arc::new(Mutex::new(PeerRegistry::new(
            identity.address(),
            options.clone(),
        )));
        let pipeline = Pipeline::standard(
            MulticastLayer::new(identity.address(), options.clone()),
            CompressionLayer::new(registry.clone(), options.compression),
            SecurityLayer::new(identity.clone(), registry.clone(), options.compression),
        );
        let (worker_tx, worker_rx) = mpsc::channel(WORKER_QUEUE_SIZE);

        let engine = Arc::new_cyclic(|weak| Engine {
            weak: weak.clone(),
            identity,
            options,
            timing,
            socket,
            registry,
            pipeline: Mutex::new(pipeline),
            base: Mutex::new(BaseState::new()),
            net: Mutex::new(NetState {
                local_addresses: Vec::new(),
                last_refresh: None,
                last_periodic: None,
            }),
            worker_tx,
            tunnel_tx,
            discovery,
            local_provider,
        });
        info!("engine listening as {}", engine.identity.address());
        Ok((engine, worker_rx))
    }

    /// Spawns the socket receivers, the worker loop and the periodic tick.
    pub fn start(&self, mut worker_rx: mpsc::Receiver<Work>) {
        let Some(engine) = self.weak.upgrade() else {
            return;
        };

        for socket in [Some(self.socket.v4()), self.socket.v6()].into_iter().flatten() {
            let engine = engine.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 65536];
                loop {
                    match socket.recv_from(&mut buf).await {
                        Ok((n, source)) => engine.udp_packet_received(source, &buf[..n]),
                        Err(e) => debug!("UDP receive error: {}", e),
                    }
                }
            });
        }

        {
            let engine = engine.clone();
            tokio::spawn(async move {
                while let Some(work) = worker_rx.recv().await {
                    engine.handle_work(work);
                }
            });
        }

        {
            let engine = engine.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(1));
                loop {
                    tick.tick().await;
                    engine.periodic();
                }
            });
        }

        if let Some(discovery) = &self.discovery {
            discovery.spawn_receivers(&engine);
        }
    }

    pub fn address(&self) -> DeviceAddr {
        self.identity.address()
    }

    // ========================================================================
    // Periodic work
    // ========================================================================

    /// Time-gated housekeeping, driven by the 1 s tick.
    pub fn periodic(&self) {
        {
            let mut net = lock(&self.net);
            let gate = net
                .last_periodic
                .map(|t| t.elapsed() < Duration::from_secs(1))
                .unwrap_or(false);
            if gate {
                return;
            }
            net.last_periodic = Some(Instant::now());
        }

        if self.reload_local_addresses() {
            info!("local address change detected");
            self.request_refresh();
            let reconnect = since(lock(&self.base).last_tcp_action) > self.timing.nat_init;
            if reconnect {
                self.connect_to_base();
            }
        }

        if since(lock(&self.net).last_refresh) > self.timing.refresh {
            self.request_refresh();
        }

        let (retry_nat_init, reconnect) = {
            let st = lock(&self.base);
            let retry = !st.nat_init_confirmed
                && since(st.last_nat_init_sent) > self.timing.nat_init;
            let timeout = if st.connection.is_some() {
                self.timing.tcp_pong
            } else {
                self.timing.nat_init
            };
            (retry, since(st.last_tcp_action) > timeout)
        };
        if retry_nat_init {
            self.send_nat_init();
        }
        if reconnect {
            self.connect_to_base();
        }
    }

    fn request_refresh(&self) {
        if self.worker_tx.try_send(Work::Refresh).is_err() {
            warn!("worker queue full, skipping refresh");
        }
    }

    pub(crate) fn handle_work(&self, work: Work) {
        match work {
            Work::Refresh => self.refresh(),
            Work::PeerFrame { source, data } => self.peer_frame_received(source, &data),
        }
    }

    fn refresh(&self) {
        lock(&self.net).last_refresh = Some(Instant::now());
        self.send_local_addresses();
        self.send_nat_init();
        self.send_beacons();
        let peers = lock(&self.registry).peer_addrs();
        for addr in peers {
            self.periodic_peer(addr);
        }
    }

    fn periodic_peer(&self, addr: DeviceAddr) {
        let mut registry = lock(&self.registry);
        let Some(peer) = registry.get_peer(addr) else {
            return;
        };
        if !peer.is_active(self.timing.teardown) {
            peer.connected = false;
            return;
        }
        if peer.reestablishing
            && peer.connected
            && since(peer.last_reestablish) > self.timing.reestablish
        {
            peer.connected = false;
            info!("falling back to relay for peer {}", addr);
        }
        self.attempt_reestablish(peer);
    }

    // ========================================================================
    // Path establishment
    // ========================================================================

    /// Sends a fresh-cookie hello to every candidate address of a peer.
    fn attempt_reestablish(&self, peer: &mut Peer) {
        if !self.options.enable_udp {
            return;
        }
        peer.failed_establishments += 1;
        peer.last_reestablish = Some(Instant::now());
        peer.reestablishing = true;
        peer.hello_cookie = rand::random();

        let candidates = reestablish_candidates(peer, &self.options);
        debug!(
            "reestablishing path to {} via {} candidate(s)",
            peer.addr,
            candidates.len()
        );
        let hello = wire::encode_path_hello(&self.identity, false, peer.addr, &peer.hello_cookie);
        for addr in &candidates {
            self.socket.send_to(&hello, *addr);
            if Some(*addr) == peer.target_address {
                // Bias the reply race toward the currently active address.
                self.socket.send_to(&hello, *addr);
            }
        }
    }

    pub(crate) fn hello_received(&self, source: SocketAddr, hello: PathHello) {
        if hello.target != self.identity.address() {
            return;
        }
        let mut registry = lock(&self.registry);
        if registry.get_or_create(hello.source).is_none() {
            return;
        }
        debug!("path hello from {} at {}", hello.source, source);
        if !self.options.is_address_allowed(&source) {
            debug!("hello source {} rejected by address policy", source);
            return;
        }
        registry.add_source_address(hello.source, source);

        let link_local = matches!(source.ip(), IpAddr::V6(v6) if is_link_local_v6(&v6));
        if link_local {
            if let Some(peer) = registry.get_peer(hello.source) {
                if peer.link_local_address.is_none() {
                    peer.link_local_address = Some(source);
                    if peer.is_active(self.timing.teardown) {
                        self.attempt_reestablish(peer);
                    }
                }
            }
        }
        drop(registry);

        let reply = wire::encode_path_hello(&self.identity, true, hello.source, &hello.cookie);
        self.socket.send_to(&reply, source);
    }

    pub(crate) fn hello_reply_received(&self, source: SocketAddr, hello: PathHello) {
        if hello.target != self.identity.address() {
            return;
        }
        let mut registry = lock(&self.registry);
        let Some(peer) = registry.get_peer(hello.source) else {
            return;
        };
        if !peer.reestablishing {
            return;
        }
        if !crypto::safe_eq(&peer.hello_cookie, &hello.cookie) {
            return;
        }
        if !self.options.is_address_allowed(&source) {
            debug!("hello reply source {} rejected by address policy", source);
            return;
        }

        info!("peer {} reachable directly at {}", hello.source, source);
        peer.target_address = Some(source);
        peer.connected = true;
        peer.failed_establishments = 0;
        peer.reestablishing = false;
    }

    // ========================================================================
    // Data plane
    // ========================================================================

    /// Entry point for raw packets read from the tunnel adapter.
    pub fn send_tunnel_packet(&self, packet: &[u8]) {
        let output = lock(&self.pipeline).from_tunnel(packet);
        self.route(output);
    }

    fn ascend(&self, source: DeviceAddr, payload: &[u8]) {
        let output = lock(&self.pipeline).from_transport(source, payload);
        self.route(output);
    }

    fn route(&self, output: PipelineOutput) {
        for (addr, data) in output.to_transport {
            self.send_data_packet(addr, &data);
        }
        for (_, packet) in output.to_tunnel {
            if self.tunnel_tx.try_send(packet).is_err() {
                warn!("tunnel queue full, dropping inbound packet");
            }
        }
    }

    /// Delivers a payload toward a peer: directly while connected,
    /// otherwise relayed through the base with reestablishment running in
    /// the background. Guarantees forward progress either way.
    pub(crate) fn send_data_packet(&self, target: DeviceAddr, payload: &[u8]) {
        let mut relay = false;
        let was_active;
        {
            let mut registry = lock(&self.registry);
            let Some(peer) = registry.get_or_create(target) else {
                return;
            };

            if peer.connected {
                if let Some(dest) = peer.target_address {
                    self.socket.send_to(&wire::encode_peer_data(payload), dest);
                }
            } else {
                let may_retry = !peer.reestablishing
                    || (since(peer.last_reestablish) > self.timing.reestablish
                        && peer.failed_establishments <= self.timing.max_failed_establishments);
                if may_retry {
                    self.attempt_reestablish(peer);
                }
                relay = true;
            }
            was_active = peer.is_active(self.timing.teardown);
            peer.last_packet = Some(Instant::now());
        }

        if relay {
            let msg = PeerToBase::Data {
                target,
                payload: payload.to_vec(),
            };
            let udp_live = lock(&self.base).is_udp_session_live(self.timing.udp_base);
            if udp_live && self.options.udp_tunnelling {
                self.send_to_base_udp(&msg);
            } else if self.options.tcp_tunnelling {
                self.send_to_base_tcp(&msg);
            }
        }

        if !was_active {
            self.send_info_request(target);
        }
    }

    // ========================================================================
    // Socket receive path
    // ========================================================================

    pub fn udp_packet_received(&self, source: SocketAddr, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let from_base = lock(&self.base).udp_address == Some(source);
        if from_base {
            self.base_message_udp(wire::decode_base_to_peer(data));
            return;
        }

        if wire::is_path_handshake(data) {
            // Signature verification is the expensive part; keep it off
            // the receive path.
            let work = Work::PeerFrame {
                source,
                data: data.to_vec(),
            };
            if self.worker_tx.try_send(work).is_err() {
                warn!("worker queue full, dropping handshake packet");
            }
            return;
        }

        self.peer_frame_received(source, data);
    }

    fn peer_frame_received(&self, source: SocketAddr, data: &[u8]) {
        match wire::decode_peer_to_peer(data) {
            PeerToPeer::Hello(hello) => self.hello_received(source, hello),
            PeerToPeer::HelloReply(hello) => self.hello_reply_received(source, hello),
            PeerToPeer::Data(payload) => self.peer_data_received(source, &payload),
            PeerToPeer::Invalid => debug!("invalid peer message from {}", source),
        }
    }

    fn peer_data_received(&self, source: SocketAddr, payload: &[u8]) {
        let addr = lock(&self.registry).find_by_source(&source);
        match addr {
            Some(addr) => self.ascend(addr, payload),
            None => debug!("data packet from unknown source {}", source),
        }
    }

    // ========================================================================
    // Base connection
    // ========================================================================

    fn connect_to_base(&self) {
        let Some(engine) = self.weak.upgrade() else {
            return;
        };
        let (addr, id, outbound_rx) = {
            let mut st = lock(&self.base);
            let Some(addr) = st.choose_address(&self.options) else {
                info!("no base address configured yet, waiting");
                return;
            };
            let (tx, rx) = mpsc::unbounded_channel();
            let id = st.install_connection(tx);
            (addr, id, rx)
        };
        info!("establishing connection to base {}", addr);
        tokio::spawn(base::run_connection(engine, addr, id, outbound_rx));
    }

    pub(crate) fn base_connected(&self, id: u64) {
        {
            let mut st = lock(&self.base);
            if !st.is_current(id) {
                return;
            }
            st.last_tcp_action = Some(Instant::now());
        }
        self.send_to_base_tcp(&PeerToBase::UserAgent {
            agent: self.options.user_agent(),
        });
    }

    pub(crate) fn base_frame(&self, id: u64, data: &[u8]) {
        {
            let mut st = lock(&self.base);
            if !st.is_current(id) {
                return;
            }
            let now = Instant::now();
            st.last_tcp_message = Some(now);
            st.last_tcp_action = Some(now);
            st.connect_retries = 0;
        }
        self.base_message_tcp(wire::decode_base_to_peer(data));
    }

    pub(crate) fn base_closed(&self, id: u64) {
        let mut st = lock(&self.base);
        if st.is_current(id) {
            st.connection = None;
            st.last_tcp_action = Some(Instant::now());
        }
    }

    fn base_message_tcp(&self, msg: BaseToPeer) {
        match msg {
            BaseToPeer::Hello { cookie } => {
                lock(&self.base).cookie = Some(cookie);
                info!("base session established");
                self.resend_info_requests();
                self.send_local_addresses();
                self.request_refresh();
            }
            BaseToPeer::DeviceAddresses { device, addresses } => {
                if !self.options.enable_udp {
                    return;
                }
                let mut sorted = addresses;
                sorted.sort();
                let mut registry = lock(&self.registry);
                let Some(peer) = registry.get_peer(device) else {
                    return;
                };
                if peer.target_addresses != sorted {
                    peer.target_addresses = sorted;
                    self.attempt_reestablish(peer);
                }
            }
            BaseToPeer::Data { source, payload } => self.ascend(source, &payload),
            BaseToPeer::State {
                udp_addresses,
                transient_range,
            } => {
                if self.options.enable_udp {
                    lock(&self.base).apply_state(udp_addresses, transient_range);
                }
            }
            BaseToPeer::Redirect { address } => {
                info!("redirected to new base server {}", address);
                lock(&self.base).address = Some(address);
                self.connect_to_base();
            }
            BaseToPeer::NatOk | BaseToPeer::Invalid => {
                debug!("unexpected message on base TCP connection");
            }
        }
    }

    fn base_message_udp(&self, msg: BaseToPeer) {
        match msg {
            BaseToPeer::NatOk => {
                let mut st = lock(&self.base);
                if st.last_nat_init_confirmation.is_none() {
                    info!("UDP session to base established");
                }
                st.last_nat_init_confirmation = Some(Instant::now());
                st.nat_init_confirmed = true;

                let (Some(cookie), Some(udp_addr)) = (st.cookie, st.udp_address) else {
                    return;
                };
                let confirm = PeerToBase::NatOkConfirm {
                    counter: st.nat_init_counter,
                };
                let bytes = wire::encode_peer_to_base(&self.identity, &cookie, &confirm);
                self.socket.send_to(&bytes, udp_addr);
            }
            BaseToPeer::Data { source, payload } => self.ascend(source, &payload),
            _ => debug!("invalid UDP message from base"),
        }
    }

    /// One NAT-init round: a keepalive to every advertised base UDP
    /// address, plus a transient-port keepalive aimed at the rotating
    /// cursor so the NAT keeps minting fresh mappings.
    pub(crate) fn send_nat_init(&self) {
        if !self.options.enable_udp {
            return;
        }
        let mut st = lock(&self.base);
        if st.connection.is_none() {
            return;
        }
        let Some(cookie) = st.cookie else {
            return;
        };
        st.last_nat_init_sent = Some(Instant::now());
        st.nat_init_confirmed = false;

        let msg = PeerToBase::NatInit {
            counter: st.nat_init_counter,
        };
        st.nat_init_counter += 1;
        let bytes = wire::encode_peer_to_base(&self.identity, &cookie, &msg);
        for addr in &st.all_udp_addresses {
            self.socket.send_to(&bytes, *addr);
        }

        if st.transient_port != 0 {
            let transient =
                wire::encode_peer_to_base(&self.identity, &cookie, &PeerToBase::NatInitTransient);
            for addr in &st.all_udp_addresses {
                let mut dest = *addr;
                dest.set_port(st.transient_port);
                self.socket.send_to(&transient, dest);
            }
            st.advance_transient_port();
        }
    }

    fn send_to_base_udp(&self, msg: &PeerToBase) {
        let st = lock(&self.base);
        if st.connection.is_none() {
            return;
        }
        let (Some(cookie), Some(udp_addr)) = (st.cookie, st.udp_address) else {
            return;
        };
        let bytes = wire::encode_peer_to_base(&self.identity, &cookie, msg);
        self.socket.send_to(&bytes, udp_addr);
    }

    fn send_to_base_tcp(&self, msg: &PeerToBase) {
        let st = lock(&self.base);
        let Some(handle) = st.connection.as_ref() else {
            return;
        };
        // The user agent is unsigned and carries no cookie, so it may go
        // out before the base HELLO arrives.
        let cookie = match (st.cookie, msg) {
            (Some(cookie), _) => cookie,
            (None, PeerToBase::UserAgent { .. }) => [0u8; 16],
            (None, _) => return,
        };
        let bytes = wire::encode_peer_to_base(&self.identity, &cookie, msg);
        let _ = handle.outbound.send(base::encode_frame(&bytes));
    }

    fn send_local_addresses(&self) {
        let addresses = if self.options.enable_udp {
            lock(&self.net).local_addresses.clone()
        } else {
            Vec::new()
        };
        self.send_to_base_tcp(&PeerToBase::Info { addresses });
    }

    fn send_info_request(&self, device: DeviceAddr) {
        debug!("requesting addresses for {}", device);
        self.send_to_base_tcp(&PeerToBase::RequestInfo { device });
    }

    fn resend_info_requests(&self) {
        let active: Vec<DeviceAddr> = {
            let mut registry = lock(&self.registry);
            let addrs = registry.peer_addrs();
            addrs
                .into_iter()
                .filter(|addr| {
                    registry
                        .get_peer(*addr)
                        .map(|peer| peer.is_active(self.timing.teardown))
                        .unwrap_or(false)
                })
                .collect()
        };
        for addr in active {
            self.send_info_request(addr);
        }
    }

    /// Rebuilds the advertised address list. Returns true when the list
    /// changed after having been populated before, which accelerates
    /// reconnection on network moves.
    fn reload_local_addresses(&self) -> bool {
        let mut addresses: Vec<SocketAddr> = self
            .local_provider
            .local_addresses()
            .into_iter()
            .filter(|ip| !is_overlay_ip(ip) && !ip.is_loopback())
            .map(|ip| SocketAddr::new(ip, self.socket.port()))
            .collect();
        addresses.extend(self.options.extra_addresses.iter().copied());
        addresses.sort();
        addresses.dedup();

        let mut net = lock(&self.net);
        if net.local_addresses != addresses {
            let had_any = !net.local_addresses.is_empty();
            net.local_addresses = addresses;
            had_any
        } else {
            false
        }
    }

    // ========================================================================
    // Link-local discovery
    // ========================================================================

    pub(crate) fn discovery_packet(&self, source: SocketAddr, data: &[u8]) {
        if !self.options.enable_udp || !self.options.enable_multicast {
            return;
        }
        // Only the local segment may teach us link-local addresses.
        if !is_local_segment(&source) {
            return;
        }
        let Some((port, device)) = discovery::decode_beacon(data) else {
            return;
        };
        if device == self.identity.address() {
            return;
        }

        let mut registry = lock(&self.registry);
        let Some(peer) = registry.get_peer(device) else {
            return;
        };
        let beacon_addr = SocketAddr::new(source.ip(), port);
        debug!("discovery beacon from {} at {}", device, beacon_addr);
        if peer.link_local_address != Some(beacon_addr) {
            peer.link_local_address = Some(beacon_addr);
            self.attempt_reestablish(peer);
        }
    }

    fn send_beacons(&self) {
        if !self.options.enable_udp || !self.options.enable_multicast {
            return;
        }
        if let Some(discovery) = &self.discovery {
            discovery.send_beacon(self.socket.port(), self.identity.address());
        }
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Heartbeat-probes a peer's latency; the sample lands asynchronously
    /// and is read back with [`Engine::latency`].
    pub fn probe_latency(&self, target: DeviceAddr) {
        let probe = lock(&self.pipeline)
            .security_mut()
            .and_then(|security| security.start_latency_probe(target));
        if let Some((addr, frame)) = probe {
            self.send_data_packet(addr, &frame);
        }
    }

    pub fn latency(&self, target: DeviceAddr) -> Option<Duration> {
        lock(&self.pipeline)
            .security_mut()
            .and_then(|security| security.latency(target))
    }

    pub fn general_info(&self) -> String {
        let mut info = format!("tunnelmesh {}\n", env!("CARGO_PKG_VERSION"));
        info += &format!("overlay address: {}\n", self.identity.address());
        let st = lock(&self.base);
        if st.is_udp_session_live(self.timing.udp_base) {
            if let Some(addr) = st.udp_address {
                info += &format!("UDP connection to base: {}\n", addr);
            }
        } else if since(st.last_tcp_message) < self.timing.udp_base {
            info += "WARN: only TCP connection to base established\n";
        } else {
            info += "ERROR: no base connection\n";
        }
        info
    }

    pub fn peer_info(&self, addr: DeviceAddr) -> String {
        let mut registry = lock(&self.registry);
        let Some(peer) = registry.get_peer(addr) else {
            return String::new();
        };
        if !peer.is_active(self.timing.teardown) && !peer.reestablishing {
            return String::new();
        }

        let mut info = String::new();
        if !peer.source_addresses.is_empty() {
            let sources: Vec<String> =
                peer.source_addresses.iter().map(|a| a.to_string()).collect();
            info += &format!("  sources: {}\n", sources.join(" "));
        }
        if !peer.target_addresses.is_empty() {
            let targets: Vec<String> =
                peer.target_addresses.iter().map(|a| a.to_string()).collect();
            info += &format!("  addresses from base: {}\n", targets.join(" "));
        }
        match (peer.connected, peer.target_address) {
            (true, Some(target)) => info += &format!("  target: {}\n", target),
            _ => info += "  tunnelled\n",
        }
        if let (true, Some(link_local)) = (peer.connected, peer.link_local_address) {
            info += &format!("  link local: {}\n", link_local);
        }
        info
    }

    /// Full status dump: general info plus every known peer.
    pub fn info(&self) -> String {
        let mut info = self.general_info();
        let peers = lock(&self.registry).peer_addrs();
        for addr in peers {
            let details = self.peer_info(addr);
            if !details.is_empty() {
                info += &format!("peer {}\n{}", addr, details);
            }
        }
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::DecodedPeerToBase;
    use tokio::net::UdpSocket;
    use tokio::time::timeout;

    const RECV_TIMEOUT: Duration = Duration::from_secs(2);

    async fn test_engine() -> (Arc<Engine>, mpsc::Receiver<Work>, mpsc::Receiver<Vec<u8>>) {
        let identity = Arc::new(Identity::create());
        let mut options = RuntimeOptions::default();
        options.override_source_port = Some(0);
        let options = Arc::new(options);
        let (tunnel_tx, tunnel_rx) = mpsc::channel(16);
        let (engine, worker_rx) = Engine::bind(
            identity,
            options,
            Timing::default(),
            Arc::new(StaticAddresses(Vec::new())),
            None,
            tunnel_tx,
        )
        .await
        .unwrap();
        (engine, worker_rx, tunnel_rx)
    }

    fn install_fake_base(engine: &Engine) -> (u64, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut st = lock(&engine.base);
        let id = st.install_connection(tx);
        st.cookie = Some([5u8; 16]);
        (id, rx)
    }

    async fn recv_datagram(socket: &UdpSocket) -> Vec<u8> {
        let mut buf = vec![0u8; 2048];
        let (n, _) = timeout(RECV_TIMEOUT, socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for datagram")
            .expect("receive failed");
        buf.truncate(n);
        buf
    }

    #[tokio::test]
    async fn data_while_disconnected_relays_and_probes() {
        let (engine, _worker, _tunnel) = test_engine().await;
        let (_id, mut base_rx) = install_fake_base(&engine);

        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let candidate = listener.local_addr().unwrap();
        let peer_identity = Identity::create();
        let peer_addr = peer_identity.address();
        {
            let mut registry = lock(&engine.registry);
            let peer = registry.get_or_create(peer_addr).unwrap();
            peer.target_addresses = vec![candidate];
        }

        engine.send_data_packet(peer_addr, b"relayed payload");

        // The payload went through the base as a relay DATA message with
        // our address as source and the peer as target.
        let frame = base_rx.recv().await.unwrap();
        match wire::decode_peer_to_base(&frame[5..]) {
            DecodedPeerToBase::Data {
                source,
                target,
                payload,
            } => {
                assert_eq!(source, engine.identity.address());
                assert_eq!(target, peer_addr);
                assert_eq!(payload, b"relayed payload");
            }
            other => panic!("expected relayed Data, got {:?}", other),
        }

        // Simultaneously, a path hello raced toward the candidate address.
        let datagram = recv_datagram(&listener).await;
        match wire::decode_peer_to_peer(&datagram) {
            PeerToPeer::Hello(hello) => {
                assert_eq!(hello.source, engine.identity.address());
                assert_eq!(hello.target, peer_addr);
            }
            other => panic!("expected Hello, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn state_message_sets_base_udp_and_rotates_transient_ports() {
        let (engine, _worker, _tunnel) = test_engine().await;
        let (id, _base_rx) = install_fake_base(&engine);

        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let base_udp = listener.local_addr().unwrap();
        let state = wire::encode_base_to_peer(&BaseToPeer::State {
            udp_addresses: vec![base_udp, "127.0.0.1:9999".parse().unwrap()],
            transient_range: Some((20001, 20003)),
        });
        engine.base_frame(id, &state);

        {
            let st = lock(&engine.base);
            assert_eq!(st.udp_address, Some(base_udp));
            assert_eq!(st.all_udp_addresses.len(), 2);
            assert_eq!(st.transient_port, 20001);
        }

        engine.send_nat_init();
        let datagram = recv_datagram(&listener).await;
        match wire::decode_peer_to_base(&datagram) {
            DecodedPeerToBase::Signed { body, source, .. } => {
                assert_eq!(source, engine.identity.address());
                assert_eq!(body, PeerToBase::NatInit { counter: 0 });
            }
            other => panic!("expected NatInit, got {:?}", other),
        }
        {
            let st = lock(&engine.base);
            assert!(!st.nat_init_confirmed);
            assert_eq!(st.transient_port, 20002);
        }

        // The cursor walks the inclusive range, then wraps.
        engine.send_nat_init();
        engine.send_nat_init();
        assert_eq!(lock(&engine.base).transient_port, 20001);
    }

    #[tokio::test]
    async fn nat_ok_confirms_session_and_acknowledges() {
        let (engine, _worker, _tunnel) = test_engine().await;
        let (id, _base_rx) = install_fake_base(&engine);

        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let base_udp = listener.local_addr().unwrap();
        engine.base_frame(
            id,
            &wire::encode_base_to_peer(&BaseToPeer::State {
                udp_addresses: vec![base_udp],
                transient_range: None,
            }),
        );

        engine.udp_packet_received(base_udp, &wire::encode_base_to_peer(&BaseToPeer::NatOk));

        assert!(lock(&engine.base).is_udp_session_live(Duration::from_secs(35)));
        let datagram = recv_datagram(&listener).await;
        match wire::decode_peer_to_base(&datagram) {
            DecodedPeerToBase::Signed { body, .. } => {
                assert!(matches!(body, PeerToBase::NatOkConfirm { .. }));
            }
            other => panic!("expected NatOkConfirm, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn hello_reply_adopts_target_idempotently() {
        let (engine, _worker, _tunnel) = test_engine().await;
        let peer_identity = Identity::create();
        let peer_addr = peer_identity.address();
        let cookie: [u8; 16] = rand::random();
        {
            let mut registry = lock(&engine.registry);
            let peer = registry.get_or_create(peer_addr).unwrap();
            peer.reestablishing = true;
            peer.hello_cookie = cookie;
            peer.failed_establishments = 3;
        }

        let reply = PathHello {
            source: peer_addr,
            pubkey: peer_identity.public_key(),
            target: engine.identity.address(),
            cookie,
        };
        let from: SocketAddr = "192.0.2.50:4444".parse().unwrap();
        engine.hello_reply_received(from, reply.clone());
        {
            let mut registry = lock(&engine.registry);
            let peer = registry.get_peer(peer_addr).unwrap();
            assert!(peer.connected);
            assert!(!peer.reestablishing);
            assert_eq!(peer.target_address, Some(from));
            assert_eq!(peer.failed_establishments, 0);
        }

        // Replaying the same reply (even from another address) must not
        // regress or retarget anything.
        let elsewhere: SocketAddr = "192.0.2.51:4444".parse().unwrap();
        engine.hello_reply_received(elsewhere, reply);
        {
            let mut registry = lock(&engine.registry);
            let peer = registry.get_peer(peer_addr).unwrap();
            assert!(peer.connected);
            assert_eq!(peer.target_address, Some(from));
        }
    }

    #[tokio::test]
    async fn wrong_cookie_does_not_connect() {
        let (engine, _worker, _tunnel) = test_engine().await;
        let peer_identity = Identity::create();
        let peer_addr = peer_identity.address();
        {
            let mut registry = lock(&engine.registry);
            let peer = registry.get_or_create(peer_addr).unwrap();
            peer.reestablishing = true;
            peer.hello_cookie = [1u8; 16];
        }
        let reply = PathHello {
            source: peer_addr,
            pubkey: peer_identity.public_key(),
            target: engine.identity.address(),
            cookie: [2u8; 16],
        };
        engine.hello_reply_received("192.0.2.50:4444".parse().unwrap(), reply);
        let mut registry = lock(&engine.registry);
        assert!(!registry.get_peer(peer_addr).unwrap().connected);
    }

    #[tokio::test]
    async fn hello_is_answered_with_echoed_cookie() {
        let (engine, _worker, _tunnel) = test_engine().await;
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let source = listener.local_addr().unwrap();
        let peer_identity = Identity::create();
        let cookie: [u8; 16] = rand::random();

        let hello = PathHello {
            source: peer_identity.address(),
            pubkey: peer_identity.public_key(),
            target: engine.identity.address(),
            cookie,
        };
        engine.hello_received(source, hello);

        // The sender's address is now a known source for that peer.
        assert_eq!(
            lock(&engine.registry).find_by_source(&source),
            Some(peer_identity.address())
        );

        let datagram = recv_datagram(&listener).await;
        match wire::decode_peer_to_peer(&datagram) {
            PeerToPeer::HelloReply(reply) => {
                assert_eq!(reply.cookie, cookie);
                assert_eq!(reply.target, peer_identity.address());
                assert_eq!(reply.source, engine.identity.address());
            }
            other => panic!("expected HelloReply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn misdirected_hello_is_ignored() {
        let (engine, _worker, _tunnel) = test_engine().await;
        let peer_identity = Identity::create();
        let other = Identity::create();
        let hello = PathHello {
            source: peer_identity.address(),
            pubkey: peer_identity.public_key(),
            target: other.address(), // not us
            cookie: [0u8; 16],
        };
        engine.hello_received("192.0.2.9:1000".parse().unwrap(), hello);
        assert!(lock(&engine.registry).is_empty());
    }

    #[tokio::test]
    async fn reestablish_ceiling_blocks_further_attempts() {
        let (engine, _worker, _tunnel) = test_engine().await;
        let peer_identity = Identity::create();
        let peer_addr = peer_identity.address();
        {
            let mut registry = lock(&engine.registry);
            let peer = registry.get_or_create(peer_addr).unwrap();
            peer.reestablishing = true;
            peer.last_reestablish = Instant::now().checked_sub(Duration::from_secs(30));
            peer.failed_establishments = Timing::default().max_failed_establishments + 1;
        }

        engine.send_data_packet(peer_addr, b"x");
        {
            let mut registry = lock(&engine.registry);
            let peer = registry.get_peer(peer_addr).unwrap();
            // Past the ceiling: no new attempt was made.
            assert_eq!(
                peer.failed_establishments,
                Timing::default().max_failed_establishments + 1
            );
            // New address information resets the counter via a successful
            // reply; emulate the base push path instead.
            peer.failed_establishments = 0;
            peer.reestablishing = false;
        }

        engine.send_data_packet(peer_addr, b"y");
        {
            let mut registry = lock(&engine.registry);
            let peer = registry.get_peer(peer_addr).unwrap();
            assert_eq!(peer.failed_establishments, 1);
        }
    }

    #[tokio::test]
    async fn device_addresses_push_retriggers_reestablish() {
        let (engine, _worker, _tunnel) = test_engine().await;
        let (id, _base_rx) = install_fake_base(&engine);

        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let candidate = listener.local_addr().unwrap();
        let peer_identity = Identity::create();
        let peer_addr = peer_identity.address();
        lock(&engine.registry).get_or_create(peer_addr).unwrap();

        let push = wire::encode_base_to_peer(&BaseToPeer::DeviceAddresses {
            device: peer_addr,
            addresses: vec![candidate],
        });
        engine.base_frame(id, &push);

        {
            let mut registry = lock(&engine.registry);
            let peer = registry.get_peer(peer_addr).unwrap();
            assert_eq!(peer.target_addresses, vec![candidate]);
            assert!(peer.reestablishing);
        }
        let datagram = recv_datagram(&listener).await;
        assert!(matches!(
            wire::decode_peer_to_peer(&datagram),
            PeerToPeer::Hello(_)
        ));
    }

    #[tokio::test]
    async fn redirect_swaps_base_address() {
        let (engine, _worker, _tunnel) = test_engine().await;
        let (id, _base_rx) = install_fake_base(&engine);

        let new_base: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let redirect = wire::encode_base_to_peer(&BaseToPeer::Redirect { address: new_base });
        engine.base_frame(id, &redirect);

        let st = lock(&engine.base);
        assert_eq!(st.address, Some(new_base));
        // A new connection attempt superseded the old handle.
        assert!(!st.is_current(id));
    }

    #[tokio::test]
    async fn stale_connection_events_are_ignored() {
        let (engine, _worker, _tunnel) = test_engine().await;
        let (old_id, _old_rx) = install_fake_base(&engine);
        let (new_id, _new_rx) = install_fake_base(&engine);

        engine.base_frame(
            old_id,
            &wire::encode_base_to_peer(&BaseToPeer::Hello { cookie: [9u8; 16] }),
        );
        // The stale frame must not have refreshed anything.
        assert_eq!(lock(&engine.base).cookie, Some([5u8; 16]));

        engine.base_closed(old_id);
        assert!(lock(&engine.base).is_current(new_id));
    }

    #[tokio::test]
    async fn discovery_beacon_updates_link_local_address() {
        let (engine, _worker, _tunnel) = test_engine().await;
        let peer_identity = Identity::create();
        let peer_addr = peer_identity.address();
        lock(&engine.registry).get_or_create(peer_addr).unwrap();

        let beacon = discovery::encode_beacon(6001, peer_addr);
        let source: SocketAddr = "192.168.1.20:5581".parse().unwrap();
        engine.discovery_packet(source, &beacon);

        let mut registry = lock(&engine.registry);
        let peer = registry.get_peer(peer_addr).unwrap();
        assert_eq!(
            peer.link_local_address,
            Some("192.168.1.20:6001".parse().unwrap())
        );
        assert!(peer.reestablishing);
    }

    #[tokio::test]
    async fn discovery_beacon_from_public_source_is_ignored() {
        let (engine, _worker, _tunnel) = test_engine().await;
        let peer_identity = Identity::create();
        let peer_addr = peer_identity.address();
        lock(&engine.registry).get_or_create(peer_addr).unwrap();

        let beacon = discovery::encode_beacon(6001, peer_addr);
        engine.discovery_packet("203.0.113.4:5581".parse().unwrap(), &beacon);

        let mut registry = lock(&engine.registry);
        assert!(registry.get_peer(peer_addr).unwrap().link_local_address.is_none());
    }

    #[test]
    fn candidates_exclude_overlay_addresses_and_duplicates() {
        let options = RuntimeOptions::default();
        let registry_options = Arc::new(RuntimeOptions::default());
        let own = DeviceAddr::from_ipv6("fc94::aa".parse().unwrap());
        let mut registry = PeerRegistry::new(own, registry_options);
        let peer_addr = DeviceAddr::from_ipv6("fc94::bb".parse().unwrap());
        let peer = registry.get_or_create(peer_addr).unwrap();

        let dup: SocketAddr = "192.0.2.1:5582".parse().unwrap();
        peer.target_addresses = vec![dup, "[fc94::5]:5582".parse().unwrap()];
        peer.link_local_address = Some("[fe80::1]:5582".parse().unwrap());
        peer.source_addresses.insert(dup);
        peer.source_addresses.insert("198.51.100.2:41000".parse().unwrap());

        let candidates = reestablish_candidates(peer, &options);
        assert!(candidates.iter().all(|a| !is_overlay_ip(&a.ip())));
        assert_eq!(candidates.iter().filter(|a| **a == dup).count(), 1);
        assert_eq!(candidates.len(), 3);
        let mut sorted = candidates.clone();
        sorted.sort();
        assert_eq!(candidates, sorted);
    }

    #[tokio::test]
    async fn inactive_peer_expires_on_refresh() {
        let (engine, _worker, _tunnel) = test_engine().await;
        let peer_identity = Identity::create();
        let peer_addr = peer_identity.address();
        {
            let mut registry = lock(&engine.registry);
            let peer = registry.get_or_create(peer_addr).unwrap();
            peer.connected = true;
            peer.target_address = Some("192.0.2.7:5582".parse().unwrap());
            // Never carried data, so the peer counts as inactive.
        }
        engine.periodic_peer(peer_addr);
        let mut registry = lock(&engine.registry);
        assert!(!registry.get_peer(peer_addr).unwrap().connected);
    }
}
