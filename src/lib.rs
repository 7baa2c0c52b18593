//! # tunnelmesh
//!
//! Peer-to-peer virtual networking overlay. Every device derives a stable
//! IPv6 address inside `fc94::/16` from its signing key, and the engine
//! routes packets between devices over hole-punched UDP paths, falling
//! back to relaying through a base (rendezvous) server over UDP or a
//! framed TCP tunnel when direct connectivity is impossible.
//!
//! ## Key components
//!
//! ### Identity & wire format
//! - [`Identity`] - signing keypair with the derived overlay address
//! - [`wire`] - codec for the peer↔peer, peer→base and base→peer families
//!
//! ### Packet pipeline
//! - [`Pipeline`] - fixed-order stage container with a driver loop
//! - [`MulticastLayer`] - fan-out and pseudo-IPv6 header synthesis
//! - [`CompressionLayer`] - capability-gated transform slot
//! - [`SecurityLayer`] - key exchange, AEAD data plane, heartbeats
//!
//! ### Transport
//! - [`Engine`] - UDP/TCP socket engine and NAT-traversal state machine
//! - [`PeerRegistry`] - admission-checked peer state store
//! - [`Discovery`] - link-local presence beacons
//!
//! ## Example
//!
//! ```rust,ignore
//! use tunnelmesh::{Config, Engine, Identity, RuntimeOptions, Timing};
//!
//! let config = Config::load_or_default();
//! let options = Arc::new(RuntimeOptions::from_config(&config)?);
//! let identity = Arc::new(Identity::load_or_generate(&Identity::default_path())?);
//!
//! let (engine, worker_rx) = Engine::bind(
//!     identity, options, Timing::from_config(&config.timing),
//!     Arc::new(ProbedAddresses), None, tunnel_tx,
//! ).await?;
//! engine.start(worker_rx);
//! ```

pub mod addr;
pub mod base;
pub mod compression;
pub mod config;
pub mod crypto;
pub mod discovery;
pub mod identity;
pub mod multicast;
pub mod peers;
pub mod pipeline;
pub mod security;
pub mod socket;
pub mod transport;
#[cfg(feature = "tun")]
pub mod tun;
mod util;
pub mod wire;

// ============================================================================
// Addressing
// ============================================================================

pub use addr::DeviceAddr;

// ============================================================================
// Identity
// ============================================================================

pub use identity::Identity;

// ============================================================================
// Configuration
// ============================================================================

pub use config::{Config, RuntimeOptions, Timing};

// ============================================================================
// Peers
// ============================================================================

pub use peers::{Peer, PeerRegistry};

// ============================================================================
// Pipeline stages
// ============================================================================

pub use compression::CompressionLayer;
pub use multicast::MulticastLayer;
pub use pipeline::{Pipeline, PipelineOutput, Stage, StageOutput};
pub use security::{SecurityLayer, FLAG_COMPRESSION, FLAG_SUPPORTS_FLAGS};

// ============================================================================
// Transport
// ============================================================================

pub use base::BaseState;
pub use discovery::Discovery;
pub use socket::OverlaySocket;
pub use transport::{Engine, LocalAddressProvider, ProbedAddresses, StaticAddresses};
