//! Authenticated encryption and per-peer key exchange.
//!
//! Sits directly above the transport. Every data payload is sealed with a
//! per-peer symmetric key negotiated through a three-phase signed hello
//! exchange; heartbeat probes ride alongside as separate packet kinds.
//!
//! Inner packet kinds (first byte of every transport payload):
//! `0` sealed data, `1`..`3` handshake phases, `4` heartbeat, `5`
//! heartbeat reply.

use crypto_secretbox::aead::{Aead, KeyInit};
use crypto_secretbox::{Key, Nonce, XSalsa20Poly1305};
use log::{debug, info, warn};
use sha2::{Digest, Sha256, Sha512};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::addr::DeviceAddr;
use crate::crypto::{self, PUBKEY_LEN, SIGNATURE_LEN};
use crate::identity::Identity;
use crate::peers::{Peer, PeerRegistry};
use crate::pipeline::StageOutput;
use crate::util::lock;

/// Advertised in every handshake; lets the other side know the flags word
/// is meaningful at all.
pub const FLAG_SUPPORTS_FLAGS: u64 = 0x1;
/// Payload compression capability.
pub const FLAG_COMPRESSION: u64 = 0x2;

/// The top half of the hello sequence is a per-boot random value, so
/// sequence numbers never repeat across restarts.
const BOOT_ID_MASK: u64 = 0xFFFF_FFFF_0000_0000;

const KIND_DATA: u8 = 0;
const KIND_HEARTBEAT: u8 = 4;
const KIND_HEARTBEAT_REPLY: u8 = 5;

const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;
/// kind + nonce + MAC.
const DATA_OVERHEAD: usize = 1 + NONCE_LEN + TAG_LEN;
/// Reserved sequence prefix inside the sealed plaintext. Zero-filled on
/// the wire in this protocol revision and not used for replay protection;
/// the layout is kept for compatibility.
const SEQ_PREFIX_LEN: usize = 8;

/// Signed hello fields before the optional flags word:
/// phase + pubkey + kx pubkey + target + two sequence words.
const HELLO_CORE_LEN: usize = 1 + PUBKEY_LEN + 32 + 16 + 8 + 8;
/// Legacy hello without the flags word.
const HELLO_LEGACY_LEN: usize = HELLO_CORE_LEN + SIGNATURE_LEN;
/// Current hello carrying capability flags.
const HELLO_FLAGS_LEN: usize = HELLO_CORE_LEN + 8 + SIGNATURE_LEN;

/// A latency sample older than this is discarded as stale.
const LATENCY_STALE: Duration = Duration::from_secs(10);

pub struct SecurityLayer {
    identity: Arc<Identity>,
    registry: Arc<Mutex<PeerRegistry>>,
    /// Our current hello sequence; echoes of anything else are rejected.
    helloseq: u64,
    my_flags: u64,
}

/// Derives directional session keys from the ephemeral exchange. The side
/// whose *peer* has the numerically smaller address runs the client
/// schedule; both sides hash the same `shared || client_pk || server_pk`
/// transcript and split it so that tx on one end equals rx on the other.
/// Returns `None` when the exchange was non-contributory (degenerate
/// remote key).
fn derive_session_keys(
    own_addr: DeviceAddr,
    peer_addr: DeviceAddr,
    own_secret: &[u8; 32],
    own_public: &[u8; 32],
    peer_public: &[u8; 32],
) -> Option<([u8; 32], [u8; 32])> {
    let secret = StaticSecret::from(*own_secret);
    let shared = secret.diffie_hellman(&PublicKey::from(*peer_public));
    if !shared.was_contributory() {
        return None;
    }

    let client_role = peer_addr < own_addr;
    let (client_pk, server_pk) = if client_role {
        (own_public, peer_public)
    } else {
        (peer_public, own_public)
    };

    let mut hasher = Sha512::new();
    hasher.update(shared.as_bytes());
    hasher.update(client_pk);
    hasher.update(server_pk);
    let digest = hasher.finalize();

    let first: [u8; 32] = digest[..32].try_into().ok()?;
    let second: [u8; 32] = digest[32..].try_into().ok()?;
    // (rx, tx): the client reads from the first half, the server from the
    // second, which makes the directions line up across the wire.
    Some(if client_role {
        (first, second)
    } else {
        (second, first)
    })
}

/// Binds the exchanged capability flags into a session key. Each side
/// hashes with the flag words in the order it observed them, so two peers
/// with differing views of the exchange end up with unusable keys instead
/// of a silently downgraded session.
fn mix_flags(key: &[u8; 32], first: u64, second: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(key);
    hasher.update(first.to_le_bytes());
    hasher.update(second.to_le_bytes());
    hasher.finalize().into()
}

impl SecurityLayer {
    pub fn new(
        identity: Arc<Identity>,
        registry: Arc<Mutex<PeerRegistry>>,
        compression: bool,
    ) -> Self {
        let mut my_flags = FLAG_SUPPORTS_FLAGS;
        if compression {
            my_flags |= FLAG_COMPRESSION;
        }
        SecurityLayer {
            identity,
            registry,
            helloseq: rand::random::<u64>() & BOOT_ID_MASK,
            my_flags,
        }
    }

    fn build_hello(&self, peer: &Peer, phase: u8, echo_seq: u64) -> Vec<u8> {
        let mut packet = Vec::with_capacity(HELLO_FLAGS_LEN);
        packet.push(phase);
        packet.extend_from_slice(&self.identity.public_key());
        packet.extend_from_slice(&peer.session.kx_public);
        packet.extend_from_slice(peer.addr.as_bytes());
        packet.extend_from_slice(&self.helloseq.to_le_bytes());
        packet.extend_from_slice(&echo_seq.to_le_bytes());
        packet.extend_from_slice(&self.my_flags.to_le_bytes());
        let sig = self.identity.sign(crypto::KX_PUBKEY_DOMAIN, &packet);
        packet.extend_from_slice(&sig);
        packet
    }

    fn seal(peer: &Peer, payload: &[u8]) -> Option<Vec<u8>> {
        let key = peer.session.tx_key.as_ref()?;
        let cipher = XSalsa20Poly1305::new(Key::from_slice(key));
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from(nonce_bytes);

        let mut cleartext = Vec::with_capacity(SEQ_PREFIX_LEN + payload.len());
        cleartext.extend_from_slice(&[0u8; SEQ_PREFIX_LEN]);
        cleartext.extend_from_slice(payload);

        let ciphertext = cipher.encrypt(&nonce, cleartext.as_slice()).ok()?;
        let mut packet = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
        packet.push(KIND_DATA);
        packet.extend_from_slice(&nonce_bytes);
        packet.extend_from_slice(&ciphertext);
        Some(packet)
    }

    fn open(peer: &Peer, data: &[u8]) -> Option<Vec<u8>> {
        let key = peer.session.rx_key.as_ref()?;
        let cipher = XSalsa20Poly1305::new(Key::from_slice(key));
        let nonce = Nonce::from_slice(&data[1..1 + NONCE_LEN]);
        cipher.decrypt(nonce, &data[1 + NONCE_LEN..]).ok()
    }

    /// Outbound payload from the layer above.
    pub(crate) fn handle_upper(&mut self, target: DeviceAddr, payload: &[u8]) -> StageOutput {
        let mut registry = lock(&self.registry);
        let Some(peer) = registry.get_or_create(target) else {
            return StageOutput::empty();
        };

        if peer.session.negotiated {
            match Self::seal(peer, payload) {
                Some(packet) => return StageOutput::down(target, packet),
                None => return StageOutput::empty(),
            }
        }

        let hello = self.build_hello(peer, 1, 0);
        if !registry.try_enqueue(target, payload.to_vec()) {
            warn!("handshake queue full, dropping payload for {}", target);
        }
        StageOutput::down(target, hello)
    }

    /// Inbound payload from the transport.
    pub(crate) fn handle_lower(&mut self, source: DeviceAddr, data: &[u8]) -> StageOutput {
        let Some(&kind) = data.first() else {
            return StageOutput::empty();
        };
        match kind {
            KIND_DATA => self.handle_data(source, data),
            1..=3 => self.handle_hello(source, data, kind),
            KIND_HEARTBEAT | KIND_HEARTBEAT_REPLY => self.handle_heartbeat(source, data, kind),
            _ => {
                debug!("unknown security packet kind {} from {}", kind, source);
                StageOutput::empty()
            }
        }
    }

    fn handle_data(&mut self, source: DeviceAddr, data: &[u8]) -> StageOutput {
        if data.len() <= DATA_OVERHEAD + SEQ_PREFIX_LEN {
            return StageOutput::empty();
        }

        let mut registry = lock(&self.registry);
        let Some(peer) = registry.get_or_create(source) else {
            return StageOutput::empty();
        };

        if !peer.session.negotiated {
            debug!("data from {} before handshake, initiating one", source);
            let hello = self.build_hello(peer, 1, 0);
            return StageOutput::down(source, hello);
        }

        match Self::open(peer, data) {
            Some(cleartext) if cleartext.len() > SEQ_PREFIX_LEN => {
                // The sequence prefix is reserved and deliberately ignored.
                StageOutput::up(source, cleartext[SEQ_PREFIX_LEN..].to_vec())
            }
            Some(_) => StageOutput::empty(),
            None => {
                warn!("dropping undecryptable packet from {}", source);
                StageOutput::empty()
            }
        }
    }

    fn handle_hello(&mut self, source: DeviceAddr, data: &[u8], phase: u8) -> StageOutput {
        if data.len() < HELLO_LEGACY_LEN {
            return StageOutput::empty();
        }
        debug!("key-exchange hello {} from {}", phase, source);

        let pubkey: [u8; PUBKEY_LEN] = data[1..33].try_into().unwrap_or([0; PUBKEY_LEN]);
        let peer_kx_public: [u8; 32] = data[33..65].try_into().unwrap_or([0; 32]);
        let target = DeviceAddr::from_slice(&data[65..81]).unwrap_or_default();
        let their_seq = u64::from_le_bytes(data[81..89].try_into().unwrap_or([0; 8]));
        let echoed_seq = u64::from_le_bytes(data[89..97].try_into().unwrap_or([0; 8]));
        // Legacy senders omit the flags word; tolerate both lengths.
        let peer_flags = if data.len() >= HELLO_FLAGS_LEN {
            u64::from_le_bytes(data[97..105].try_into().unwrap_or([0; 8]))
        } else {
            0
        };
        let signed_len = data.len() - SIGNATURE_LEN;
        let signature: [u8; SIGNATURE_LEN] =
            data[signed_len..].try_into().unwrap_or([0; SIGNATURE_LEN]);

        if target != self.identity.address() {
            debug!("misdirected hello packet");
            return StageOutput::empty();
        }
        if crypto::pubkey_to_addr(&pubkey) != Some(source) {
            debug!("forged hello packet (pubkey does not match source)");
            return StageOutput::empty();
        }
        if !crypto::verify(&pubkey, crypto::KX_PUBKEY_DOMAIN, &data[..signed_len], &signature) {
            debug!("forged hello packet (invalid signature)");
            return StageOutput::empty();
        }

        let mut registry = lock(&self.registry);
        let Some(peer) = registry.get_or_create(source) else {
            return StageOutput::empty();
        };

        if phase == 1 {
            let reply = self.build_hello(peer, 2, their_seq);
            return StageOutput::down(source, reply);
        }

        // Phases 2 and 3 must echo our current sequence. Replays and
        // crossed concurrent handshakes fail here and are retried by the
        // next outbound payload.
        if echoed_seq != self.helloseq {
            debug!("hello with stale sequence from {}", source);
            return StageOutput::empty();
        }

        peer.session.flags = peer_flags;

        let own_addr = self.identity.address();
        let Some((mut rx, mut tx)) = derive_session_keys(
            own_addr,
            source,
            &peer.session.kx_secret,
            &peer.session.kx_public,
            &peer_kx_public,
        ) else {
            warn!("key exchange with {} failed", source);
            return StageOutput::empty();
        };

        if peer_flags != 0 {
            rx = mix_flags(&rx, peer_flags, self.my_flags);
            tx = mix_flags(&tx, self.my_flags, peer_flags);
        }

        peer.session.rx_key = Some(rx);
        peer.session.tx_key = Some(tx);
        peer.session.negotiated = true;
        info!("established secure connection to {}", source);

        let mut out = StageOutput::empty();
        // Close the loop before flushing: the responder derives its keys
        // only on phase 3, so data emitted ahead of it would be dropped.
        if phase == 2 {
            if let Some(peer) = registry.get_peer(source) {
                out.down.push((source, self.build_hello(peer, 3, their_seq)));
            }
        }
        for payload in registry.take_queue(source) {
            if let Some(peer) = registry.get_peer(source) {
                if let Some(packet) = Self::seal(peer, &payload) {
                    out.down.push((source, packet));
                }
            }
        }

        self.helloseq = self.helloseq.wrapping_add(1);
        out
    }

    fn handle_heartbeat(&mut self, source: DeviceAddr, data: &[u8], kind: u8) -> StageOutput {
        if data.len() < 1 + 8 {
            return StageOutput::empty();
        }
        let ident: [u8; 8] = data[1..9].try_into().unwrap_or([0; 8]);

        if kind == KIND_HEARTBEAT {
            let mut reply = Vec::with_capacity(9);
            reply.push(KIND_HEARTBEAT_REPLY);
            reply.extend_from_slice(&ident);
            return StageOutput::down(source, reply);
        }

        let mut registry = lock(&self.registry);
        if let Some(peer) = registry.get_or_create(source) {
            if crypto::safe_eq(&ident, &peer.session.heartbeat_ident) {
                let now = Instant::now();
                peer.session.last_latency_received = Some(now);
                peer.session.latency = peer
                    .session
                    .last_latency_sent
                    .map(|sent| now.duration_since(sent));
            }
        }
        StageOutput::empty()
    }

    /// Starts a heartbeat round trip; returns the probe to transmit.
    pub fn start_latency_probe(&mut self, target: DeviceAddr) -> Option<(DeviceAddr, Vec<u8>)> {
        let mut registry = lock(&self.registry);
        let peer = registry.get_or_create(target)?;
        peer.session.heartbeat_ident = rand::random();
        peer.session.last_latency_sent = Some(Instant::now());
        let mut packet = Vec::with_capacity(9);
        packet.push(KIND_HEARTBEAT);
        packet.extend_from_slice(&peer.session.heartbeat_ident);
        Some((target, packet))
    }

    /// Most recent latency sample, unless it has gone stale.
    pub fn latency(&self, target: DeviceAddr) -> Option<Duration> {
        let mut registry = lock(&self.registry);
        let peer = registry.get_peer(target)?;
        let received = peer.session.last_latency_received?;
        if received.elapsed() > LATENCY_STALE {
            return None;
        }
        peer.session.latency
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeOptions;
    use crate::peers::MAX_QUEUED_PACKETS;

    struct Endpoint {
        identity: Arc<Identity>,
        registry: Arc<Mutex<PeerRegistry>>,
        layer: SecurityLayer,
    }

    fn endpoint(compression: bool) -> Endpoint {
        let identity = Arc::new(Identity::create());
        let options = Arc::new(RuntimeOptions::default());
        let registry = Arc::new(Mutex::new(PeerRegistry::new(identity.address(), options)));
        let layer = SecurityLayer::new(identity.clone(), registry.clone(), compression);
        Endpoint {
            identity,
            registry,
            layer,
        }
    }

    fn session_keys(
        registry: &Arc<Mutex<PeerRegistry>>,
        addr: DeviceAddr,
    ) -> ([u8; 32], [u8; 32]) {
        let mut reg = lock(registry);
        let peer = reg.get_peer(addr).unwrap();
        (
            peer.session.tx_key.unwrap(),
            peer.session.rx_key.unwrap(),
        )
    }

    /// Runs the full phase 1→2→3 exchange, returning B's view of A's first
    /// payload as delivered upward.
    fn run_handshake(a: &mut Endpoint, b: &mut Endpoint, payload: &[u8]) -> Vec<(DeviceAddr, Vec<u8>)> {
        let a_addr = a.identity.address();
        let b_addr = b.identity.address();

        let out = a.layer.handle_upper(b_addr, payload);
        assert_eq!(out.down.len(), 1);
        let hello1 = out.down[0].1.clone();
        assert_eq!(hello1[0], 1);

        let out = b.layer.handle_lower(a_addr, &hello1);
        assert_eq!(out.down.len(), 1);
        let hello2 = out.down[0].1.clone();
        assert_eq!(hello2[0], 2);

        // A derives keys, closes the loop and flushes its queue; phase 3
        // is emitted first so B can decrypt what follows.
        let out = a.layer.handle_lower(b_addr, &hello2);
        assert!(out.down.len() >= 2);
        assert_eq!(out.down[0].1[0], 3);

        let mut delivered = Vec::new();
        for (addr, packet) in out.down {
            assert_eq!(addr, b_addr);
            let up = b.layer.handle_lower(a_addr, &packet);
            assert!(up.down.is_empty());
            delivered.extend(up.up);
        }
        delivered
    }

    #[test]
    fn handshake_derives_matching_keys_and_flushes_queue() {
        let mut a = endpoint(false);
        let mut b = endpoint(false);
        let a_addr = a.identity.address();
        let b_addr = b.identity.address();

        let delivered = run_handshake(&mut a, &mut b, b"queued payload");
        assert_eq!(delivered, vec![(a_addr, b"queued payload".to_vec())]);

        let (a_tx, a_rx) = session_keys(&a.registry, b_addr);
        let (b_tx, b_rx) = session_keys(&b.registry, a_addr);
        assert_eq!(a_tx, b_rx);
        assert_eq!(a_rx, b_tx);
        assert_ne!(a_tx, a_rx);
    }

    #[test]
    fn data_flows_both_ways_after_handshake() {
        let mut a = endpoint(false);
        let mut b = endpoint(false);
        let a_addr = a.identity.address();
        let b_addr = b.identity.address();
        run_handshake(&mut a, &mut b, b"first");

        // B → A.
        let out = b.layer.handle_upper(a_addr, b"reply");
        assert_eq!(out.down.len(), 1);
        assert_eq!(out.down[0].1[0], 0);
        let up = a.layer.handle_lower(b_addr, &out.down[0].1);
        assert_eq!(up.up, vec![(b_addr, b"reply".to_vec())]);
    }

    #[test]
    fn honest_capability_difference_still_interoperates() {
        // One side advertises compression, the other does not. Both views
        // of the exchange agree, so keys must still match.
        let mut a = endpoint(true);
        let mut b = endpoint(false);
        let a_addr = a.identity.address();
        let delivered = run_handshake(&mut a, &mut b, b"x");
        assert_eq!(delivered, vec![(a_addr, b"x".to_vec())]);
    }

    #[test]
    fn disagreeing_flag_views_make_data_undecryptable() {
        let mut a = endpoint(false);
        let mut b = endpoint(false);
        let a_addr = a.identity.address();
        let b_addr = b.identity.address();

        let out = a.layer.handle_upper(b_addr, b"payload");
        let hello1 = out.down[0].1.clone();
        let out = b.layer.handle_lower(a_addr, &hello1);
        let hello2 = out.down[0].1.clone();

        // Corrupt B's advertised flags and re-sign with B's identity,
        // simulating an endpoint whose view of the exchange differs.
        let mut forged = hello2[..HELLO_FLAGS_LEN - SIGNATURE_LEN].to_vec();
        forged[97..105].copy_from_slice(&(FLAG_SUPPORTS_FLAGS | FLAG_COMPRESSION).to_le_bytes());
        let sig = b.identity.sign(crypto::KX_PUBKEY_DOMAIN, &forged);
        forged.extend_from_slice(&sig);

        let out = a.layer.handle_lower(b_addr, &forged);
        // A completed its side and flushed a data packet.
        let data_packet = out
            .down
            .iter()
            .find(|(_, p)| p[0] == 0)
            .expect("flushed data packet")
            .1
            .clone();
        let hello3 = out
            .down
            .iter()
            .find(|(_, p)| p[0] == 3)
            .expect("phase 3")
            .1
            .clone();
        b.layer.handle_lower(a_addr, &hello3);

        // B's keys were derived from the honest flags, so A's traffic
        // does not decrypt. No crash, no delivery.
        let up = b.layer.handle_lower(a_addr, &data_packet);
        assert!(up.up.is_empty());
    }

    #[test]
    fn replayed_phase2_is_rejected() {
        let mut a = endpoint(false);
        let mut b = endpoint(false);
        let a_addr = a.identity.address();
        let b_addr = b.identity.address();

        let out = a.layer.handle_upper(b_addr, b"payload");
        let hello1 = out.down[0].1.clone();
        let hello2 = b.layer.handle_lower(a_addr, &hello1).down[0].1.clone();

        // First delivery completes A's side and bumps its sequence.
        let out = a.layer.handle_lower(b_addr, &hello2);
        assert!(!out.down.is_empty());

        // Replaying the same phase 2 must now be a no-op.
        let out = a.layer.handle_lower(b_addr, &hello2);
        assert!(out.down.is_empty());
        assert!(out.up.is_empty());
    }

    #[test]
    fn queue_cap_drops_excess_payloads() {
        let mut a = endpoint(false);
        let b = endpoint(false);
        let b_addr = b.identity.address();

        for i in 0..MAX_QUEUED_PACKETS + 3 {
            a.layer.handle_upper(b_addr, &[i as u8]);
        }
        let mut reg = lock(&a.registry);
        let peer = reg.get_peer(b_addr).unwrap();
        assert_eq!(peer.session.queue.len(), MAX_QUEUED_PACKETS);
    }

    #[test]
    fn data_before_handshake_triggers_hello() {
        let mut a = endpoint(false);
        let b = endpoint(false);
        let b_addr = b.identity.address();

        // A well-formed-looking sealed packet from an unknown session.
        let mut bogus = vec![KIND_DATA];
        bogus.extend_from_slice(&[0u8; NONCE_LEN + TAG_LEN + SEQ_PREFIX_LEN + 4]);
        let out = a.layer.handle_lower(b_addr, &bogus);
        assert!(out.up.is_empty());
        assert_eq!(out.down.len(), 1);
        assert_eq!(out.down[0].1[0], 1);
    }

    #[test]
    fn truncated_packets_are_dropped() {
        let mut a = endpoint(false);
        let b_addr = endpoint(false).identity.address();

        for packet in [&[][..], &[KIND_DATA][..], &[1u8; 64][..], &[KIND_HEARTBEAT, 1][..]] {
            let out = a.layer.handle_lower(b_addr, packet);
            assert!(out.up.is_empty());
            assert!(out.down.is_empty());
        }
    }

    #[test]
    fn heartbeat_round_trip_yields_latency() {
        let mut a = endpoint(false);
        let mut b = endpoint(false);
        let a_addr = a.identity.address();
        let b_addr = b.identity.address();

        let (target, probe) = a.layer.start_latency_probe(b_addr).unwrap();
        assert_eq!(target, b_addr);

        let out = b.layer.handle_lower(a_addr, &probe);
        assert_eq!(out.down.len(), 1);
        let reply = out.down[0].1.clone();
        assert_eq!(reply[0], KIND_HEARTBEAT_REPLY);

        a.layer.handle_lower(b_addr, &reply);
        assert!(a.layer.latency(b_addr).is_some());
    }

    #[test]
    fn mismatched_heartbeat_ident_is_ignored() {
        let mut a = endpoint(false);
        let b_addr = endpoint(false).identity.address();

        a.layer.start_latency_probe(b_addr).unwrap();
        let mut reply = vec![KIND_HEARTBEAT_REPLY];
        reply.extend_from_slice(&[0xee; 8]);
        a.layer.handle_lower(b_addr, &reply);
        assert!(a.layer.latency(b_addr).is_none());
    }

    #[test]
    fn session_key_derivation_is_symmetric() {
        let a_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let b_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let a_public = PublicKey::from(&a_secret).to_bytes();
        let b_public = PublicKey::from(&b_secret).to_bytes();
        let a_addr = DeviceAddr::from_ipv6("fc94::1".parse().unwrap());
        let b_addr = DeviceAddr::from_ipv6("fc94::2".parse().unwrap());

        let (a_rx, a_tx) =
            derive_session_keys(a_addr, b_addr, &a_secret.to_bytes(), &a_public, &b_public)
                .unwrap();
        let (b_rx, b_tx) =
            derive_session_keys(b_addr, a_addr, &b_secret.to_bytes(), &b_public, &a_public)
                .unwrap();
        assert_eq!(a_tx, b_rx);
        assert_eq!(a_rx, b_tx);
    }

    #[test]
    fn flag_mixing_is_order_sensitive() {
        let key = [7u8; 32];
        assert_ne!(mix_flags(&key, 1, 3), mix_flags(&key, 3, 1));
        assert_ne!(mix_flags(&key, 1, 1), key);
    }
}
