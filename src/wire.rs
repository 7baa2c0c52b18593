//! Wire codec for the three protocol message families.
//!
//! Three disjoint families share the same shape: a 1-byte discriminant tag
//! followed by a kind-specific body. Decoding never panics and never reads
//! out of bounds; anything malformed, truncated, or carrying a bad
//! signature collapses to an `Invalid` sentinel that callers must check
//! before trusting any field.
//!
//! Integers are little-endian. Socket addresses are 18 bytes on the wire:
//! a 16-byte IP (IPv4 mapped into IPv6) followed by a 2-byte port.

use log::debug;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use crate::addr::{DeviceAddr, ADDR_LEN};
use crate::crypto::{self, PUBKEY_LEN, SIGNATURE_LEN};
use crate::identity::Identity;

/// Wire size of one `[ip][port]` entry.
pub const INET_LEN: usize = ADDR_LEN + 2;

// ============================================================================
// Socket address packing
// ============================================================================

pub(crate) fn encode_inet(addr: &SocketAddr, out: &mut Vec<u8>) {
    let ip = match addr.ip() {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    };
    out.extend_from_slice(&ip.octets());
    out.extend_from_slice(&addr.port().to_le_bytes());
}

/// Decodes one 18-byte address entry, unmapping IPv4-mapped addresses so
/// decoded values compare equal to addresses observed on real sockets.
pub(crate) fn decode_inet(bytes: &[u8]) -> Option<SocketAddr> {
    if bytes.len() < INET_LEN {
        return None;
    }
    let octets: [u8; ADDR_LEN] = bytes[..ADDR_LEN].try_into().ok()?;
    let port = u16::from_le_bytes([bytes[ADDR_LEN], bytes[ADDR_LEN + 1]]);
    let ip = Ipv6Addr::from(octets);
    Some(match ip.to_ipv4_mapped() {
        Some(v4) => SocketAddr::new(IpAddr::V4(v4), port),
        None => SocketAddr::new(IpAddr::V6(ip), port),
    })
}

// ============================================================================
// Peer to peer
// ============================================================================

const P2P_HELLO: u8 = 0;
const P2P_HELLO_REPLY: u8 = 1;
const P2P_DATA: u8 = 2;

/// Signed portion of a path hello: tag + source + pubkey + target + cookie.
const PATH_HELLO_SIGNED_LEN: usize = 1 + ADDR_LEN + PUBKEY_LEN + ADDR_LEN + 16;
/// Full path hello size on the wire.
pub const PATH_HELLO_LEN: usize = PATH_HELLO_SIGNED_LEN + SIGNATURE_LEN;

/// Transport-layer path handshake message. Establishes which real-world
/// address currently reaches a peer; key negotiation happens a layer up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathHello {
    /// Sender's device address (verified against the embedded public key).
    pub source: DeviceAddr,
    pub pubkey: [u8; PUBKEY_LEN],
    /// Intended recipient; mismatches are silently dropped.
    pub target: DeviceAddr,
    /// Random per-attempt cookie echoed by the reply.
    pub cookie: [u8; 16],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerToPeer {
    Hello(PathHello),
    HelloReply(PathHello),
    Data(Vec<u8>),
    Invalid,
}

/// Encodes and signs a path hello or hello-reply.
pub fn encode_path_hello(
    identity: &Identity,
    reply: bool,
    target: DeviceAddr,
    cookie: &[u8; 16],
) -> Vec<u8> {
    let mut data = Vec::with_capacity(PATH_HELLO_LEN);
    data.push(if reply { P2P_HELLO_REPLY } else { P2P_HELLO });
    data.extend_from_slice(identity.address().as_bytes());
    data.extend_from_slice(&identity.public_key());
    data.extend_from_slice(target.as_bytes());
    data.extend_from_slice(cookie);
    let sig = identity.sign(crypto::P2P_MSG_DOMAIN, &data);
    data.extend_from_slice(&sig);
    data
}

pub fn encode_peer_data(payload: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(1 + payload.len());
    data.push(P2P_DATA);
    data.extend_from_slice(payload);
    data
}

pub fn decode_peer_to_peer(data: &[u8]) -> PeerToPeer {
    let Some(&tag) = data.first() else {
        return PeerToPeer::Invalid;
    };

    match tag {
        P2P_HELLO | P2P_HELLO_REPLY => {
            if data.len() != PATH_HELLO_LEN {
                return PeerToPeer::Invalid;
            }
            let source = DeviceAddr::from_slice(&data[1..17]).unwrap_or_default();
            let pubkey: [u8; PUBKEY_LEN] = data[17..49].try_into().unwrap_or([0; PUBKEY_LEN]);
            let target = DeviceAddr::from_slice(&data[49..65]).unwrap_or_default();
            let cookie: [u8; 16] = data[65..81].try_into().unwrap_or([0; 16]);
            let signature: [u8; SIGNATURE_LEN] =
                data[81..].try_into().unwrap_or([0; SIGNATURE_LEN]);

            if crypto::pubkey_to_addr(&pubkey) != Some(source) {
                debug!("path hello with forged source address");
                return PeerToPeer::Invalid;
            }
            if !crypto::verify(
                &pubkey,
                crypto::P2P_MSG_DOMAIN,
                &data[..PATH_HELLO_SIGNED_LEN],
                &signature,
            ) {
                debug!("path hello with invalid signature");
                return PeerToPeer::Invalid;
            }

            let hello = PathHello {
                source,
                pubkey,
                target,
                cookie,
            };
            if tag == P2P_HELLO {
                PeerToPeer::Hello(hello)
            } else {
                PeerToPeer::HelloReply(hello)
            }
        }
        P2P_DATA => PeerToPeer::Data(data[1..].to_vec()),
        _ => PeerToPeer::Invalid,
    }
}

/// True if a raw datagram looks like a path handshake message. Those are
/// dispatched to the background worker; everything else stays inline.
pub fn is_path_handshake(data: &[u8]) -> bool {
    matches!(data.first(), Some(&P2P_HELLO) | Some(&P2P_HELLO_REPLY))
}

// ============================================================================
// Peer to base
// ============================================================================

const P2B_REQUEST_INFO: u8 = 0;
const P2B_DATA: u8 = 1;
const P2B_INFO: u8 = 2;
const P2B_NAT_INIT: u8 = 3;
const P2B_USER_AGENT: u8 = 4;
const P2B_NAT_OK_CONFIRM: u8 = 5;
const P2B_NAT_INIT_TRANSIENT: u8 = 6;

/// Common signed header: tag + self address + pubkey + session cookie.
const P2B_HEADER_LEN: usize = 1 + ADDR_LEN + PUBKEY_LEN + 16;

/// Message bodies a peer sends to the base server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerToBase {
    /// Ask the base for a device's candidate addresses.
    RequestInfo { device: DeviceAddr },
    /// Relay a payload to another peer. Hot path: no pubkey, cookie or
    /// signature on the wire.
    Data { target: DeviceAddr, payload: Vec<u8> },
    /// Advertise our local candidate addresses.
    Info { addresses: Vec<SocketAddr> },
    NatInit { counter: u64 },
    UserAgent { agent: String },
    NatOkConfirm { counter: u64 },
    /// NAT keepalive aimed at a rotating transient base port.
    NatInitTransient,
}

/// A decoded peer-to-base frame, as seen by the base server (and by the
/// codec round-trip tests).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedPeerToBase {
    Signed {
        source: DeviceAddr,
        pubkey: [u8; PUBKEY_LEN],
        cookie: [u8; 16],
        body: PeerToBase,
    },
    Data {
        source: DeviceAddr,
        target: DeviceAddr,
        payload: Vec<u8>,
    },
    UserAgent {
        agent: String,
    },
    Invalid,
}

pub fn encode_peer_to_base(identity: &Identity, cookie: &[u8; 16], msg: &PeerToBase) -> Vec<u8> {
    match msg {
        PeerToBase::Data { target, payload } => {
            let mut data = Vec::with_capacity(1 + 2 * ADDR_LEN + payload.len());
            data.push(P2B_DATA);
            data.extend_from_slice(identity.address().as_bytes());
            data.extend_from_slice(target.as_bytes());
            data.extend_from_slice(payload);
            data
        }
        PeerToBase::UserAgent { agent } => {
            let mut data = Vec::with_capacity(1 + agent.len());
            data.push(P2B_USER_AGENT);
            data.extend_from_slice(agent.as_bytes());
            data
        }
        _ => {
            let tag = match msg {
                PeerToBase::RequestInfo { .. } => P2B_REQUEST_INFO,
                PeerToBase::Info { .. } => P2B_INFO,
                PeerToBase::NatInit { .. } => P2B_NAT_INIT,
                PeerToBase::NatOkConfirm { .. } => P2B_NAT_OK_CONFIRM,
                PeerToBase::NatInitTransient => P2B_NAT_INIT_TRANSIENT,
                PeerToBase::Data { .. } | PeerToBase::UserAgent { .. } => unreachable!(),
            };
            let mut data = Vec::with_capacity(P2B_HEADER_LEN + SIGNATURE_LEN + 32);
            data.push(tag);
            data.extend_from_slice(identity.address().as_bytes());
            data.extend_from_slice(&identity.public_key());
            data.extend_from_slice(cookie);

            match msg {
                PeerToBase::RequestInfo { device } => {
                    data.extend_from_slice(device.as_bytes());
                }
                PeerToBase::Info { addresses } => {
                    for addr in addresses {
                        encode_inet(addr, &mut data);
                    }
                }
                PeerToBase::NatInit { counter } | PeerToBase::NatOkConfirm { counter } => {
                    data.extend_from_slice(&counter.to_le_bytes());
                }
                PeerToBase::NatInitTransient => {}
                PeerToBase::Data { .. } | PeerToBase::UserAgent { .. } => unreachable!(),
            }

            let sig = identity.sign(crypto::P2B_MSG_DOMAIN, &data);
            data.extend_from_slice(&sig);
            data
        }
    }
}

pub fn decode_peer_to_base(data: &[u8]) -> DecodedPeerToBase {
    let Some(&tag) = data.first() else {
        return DecodedPeerToBase::Invalid;
    };

    match tag {
        P2B_DATA => {
            if data.len() < 1 + 2 * ADDR_LEN {
                return DecodedPeerToBase::Invalid;
            }
            DecodedPeerToBase::Data {
                source: DeviceAddr::from_slice(&data[1..17]).unwrap_or_default(),
                target: DeviceAddr::from_slice(&data[17..33]).unwrap_or_default(),
                payload: data[33..].to_vec(),
            }
        }
        P2B_USER_AGENT => DecodedPeerToBase::UserAgent {
            agent: String::from_utf8_lossy(&data[1..]).into_owned(),
        },
        P2B_REQUEST_INFO | P2B_INFO | P2B_NAT_INIT | P2B_NAT_OK_CONFIRM
        | P2B_NAT_INIT_TRANSIENT => {
            if data.len() < P2B_HEADER_LEN + SIGNATURE_LEN {
                return DecodedPeerToBase::Invalid;
            }
            let source = DeviceAddr::from_slice(&data[1..17]).unwrap_or_default();
            let pubkey: [u8; PUBKEY_LEN] = data[17..49].try_into().unwrap_or([0; PUBKEY_LEN]);
            let cookie: [u8; 16] = data[49..65].try_into().unwrap_or([0; 16]);
            let signed_len = data.len() - SIGNATURE_LEN;
            let signature: [u8; SIGNATURE_LEN] =
                data[signed_len..].try_into().unwrap_or([0; SIGNATURE_LEN]);

            if crypto::pubkey_to_addr(&pubkey) != Some(source) {
                debug!("base-bound message with forged source address");
                return DecodedPeerToBase::Invalid;
            }
            if !crypto::verify(&pubkey, crypto::P2B_MSG_DOMAIN, &data[..signed_len], &signature) {
                debug!("base-bound message with invalid signature");
                return DecodedPeerToBase::Invalid;
            }

            let body_bytes = &data[P2B_HEADER_LEN..signed_len];
            let body = match tag {
                P2B_REQUEST_INFO => {
                    if body_bytes.len() != ADDR_LEN {
                        return DecodedPeerToBase::Invalid;
                    }
                    PeerToBase::RequestInfo {
                        device: DeviceAddr::from_slice(body_bytes).unwrap_or_default(),
                    }
                }
                P2B_INFO => {
                    if body_bytes.len() % INET_LEN != 0 {
                        return DecodedPeerToBase::Invalid;
                    }
                    let addresses = body_bytes
                        .chunks_exact(INET_LEN)
                        .filter_map(decode_inet)
                        .collect();
                    PeerToBase::Info { addresses }
                }
                P2B_NAT_INIT | P2B_NAT_OK_CONFIRM => {
                    let Ok(counter_bytes) = <[u8; 8]>::try_from(body_bytes) else {
                        return DecodedPeerToBase::Invalid;
                    };
                    let counter = u64::from_le_bytes(counter_bytes);
                    if tag == P2B_NAT_INIT {
                        PeerToBase::NatInit { counter }
                    } else {
                        PeerToBase::NatOkConfirm { counter }
                    }
                }
                P2B_NAT_INIT_TRANSIENT => {
                    if !body_bytes.is_empty() {
                        return DecodedPeerToBase::Invalid;
                    }
                    PeerToBase::NatInitTransient
                }
                _ => unreachable!(),
            };

            DecodedPeerToBase::Signed {
                source,
                pubkey,
                cookie,
                body,
            }
        }
        _ => DecodedPeerToBase::Invalid,
    }
}

// ============================================================================
// Base to peer
// ============================================================================

const B2P_HELLO: u8 = 0;
const B2P_DEVICE_ADDRESSES: u8 = 1;
const B2P_DATA: u8 = 2;
const B2P_NAT_OK: u8 = 3;
const B2P_STATE: u8 = 4;
const B2P_REDIRECT: u8 = 5;

/// At most this many base UDP addresses are accepted from a STATE message.
const MAX_STATE_ADDRESSES: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseToPeer {
    /// Session establishment: carries the cookie required on every
    /// subsequent signed peer-to-base message.
    Hello { cookie: [u8; 16] },
    /// Push of a device's candidate addresses.
    DeviceAddresses {
        device: DeviceAddr,
        addresses: Vec<SocketAddr>,
    },
    /// Relayed payload from another peer.
    Data { source: DeviceAddr, payload: Vec<u8> },
    /// Confirms a NAT init round trip.
    NatOk,
    /// Base UDP endpoints plus an optional NAT transient port range.
    State {
        udp_addresses: Vec<SocketAddr>,
        transient_range: Option<(u16, u16)>,
    },
    /// Instructs the peer to reconnect to a different base server.
    Redirect { address: SocketAddr },
    Invalid,
}

pub fn decode_base_to_peer(data: &[u8]) -> BaseToPeer {
    let Some(&tag) = data.first() else {
        return BaseToPeer::Invalid;
    };

    match tag {
        B2P_HELLO => {
            if data.len() != 1 + 16 {
                return BaseToPeer::Invalid;
            }
            BaseToPeer::Hello {
                cookie: data[1..17].try_into().unwrap_or([0; 16]),
            }
        }
        B2P_DEVICE_ADDRESSES => {
            if data.len() <= 1 + ADDR_LEN {
                return BaseToPeer::Invalid;
            }
            let device = DeviceAddr::from_slice(&data[1..17]).unwrap_or_default();
            let addresses = data[17..]
                .chunks_exact(INET_LEN)
                .filter_map(decode_inet)
                .collect();
            BaseToPeer::DeviceAddresses { device, addresses }
        }
        B2P_DATA => {
            if data.len() <= 1 + ADDR_LEN {
                return BaseToPeer::Invalid;
            }
            BaseToPeer::Data {
                source: DeviceAddr::from_slice(&data[1..17]).unwrap_or_default(),
                payload: data[17..].to_vec(),
            }
        }
        B2P_NAT_OK => BaseToPeer::NatOk,
        B2P_STATE => {
            let mut udp_addresses = Vec::new();
            let mut i = 1;
            while i + INET_LEN <= data.len() && udp_addresses.len() < MAX_STATE_ADDRESSES {
                if let Some(addr) = decode_inet(&data[i..i + INET_LEN]) {
                    udp_addresses.push(addr);
                }
                i += INET_LEN;
            }
            if udp_addresses.is_empty() {
                return BaseToPeer::Invalid;
            }
            let transient_range = if i + 4 <= data.len() {
                Some((
                    u16::from_le_bytes([data[i], data[i + 1]]),
                    u16::from_le_bytes([data[i + 2], data[i + 3]]),
                ))
            } else {
                None
            };
            BaseToPeer::State {
                udp_addresses,
                transient_range,
            }
        }
        B2P_REDIRECT => {
            if data.len() != 1 + INET_LEN {
                return BaseToPeer::Invalid;
            }
            match decode_inet(&data[1..]) {
                Some(address) => BaseToPeer::Redirect { address },
                None => BaseToPeer::Invalid,
            }
        }
        _ => BaseToPeer::Invalid,
    }
}

/// Encoder for the base-to-peer family. The daemon never sends these; it
/// exists for the base-server end of the protocol and for tests.
pub fn encode_base_to_peer(msg: &BaseToPeer) -> Vec<u8> {
    match msg {
        BaseToPeer::Hello { cookie } => {
            let mut data = vec![B2P_HELLO];
            data.extend_from_slice(cookie);
            data
        }
        BaseToPeer::DeviceAddresses { device, addresses } => {
            let mut data = vec![B2P_DEVICE_ADDRESSES];
            data.extend_from_slice(device.as_bytes());
            for addr in addresses {
                encode_inet(addr, &mut data);
            }
            data
        }
        BaseToPeer::Data { source, payload } => {
            let mut data = vec![B2P_DATA];
            data.extend_from_slice(source.as_bytes());
            data.extend_from_slice(payload);
            data
        }
        BaseToPeer::NatOk => vec![B2P_NAT_OK],
        BaseToPeer::State {
            udp_addresses,
            transient_range,
        } => {
            let mut data = vec![B2P_STATE];
            for addr in udp_addresses.iter().take(MAX_STATE_ADDRESSES) {
                encode_inet(addr, &mut data);
            }
            if let Some((lo, hi)) = transient_range {
                data.extend_from_slice(&lo.to_le_bytes());
                data.extend_from_slice(&hi.to_le_bytes());
            }
            data
        }
        BaseToPeer::Redirect { address } => {
            let mut data = vec![B2P_REDIRECT];
            encode_inet(address, &mut data);
            data
        }
        BaseToPeer::Invalid => Vec::new(),
    }
}
