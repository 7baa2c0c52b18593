//! Daemon configuration.
//!
//! Loaded from a TOML file with per-field defaults, then compiled into the
//! typed [`RuntimeOptions`] and [`Timing`] structs the engine consumes.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::addr::{is_overlay_ip, DeviceAddr};

/// Top-level configuration for the tunnelmesh daemon.
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub peers: PeersConfig,
}

/// Daemon runtime settings.
#[derive(Debug, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_iface")]
    pub interface: String,
    #[serde(default)]
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            interface: default_iface(),
            log_level: "info".to_string(),
        }
    }
}

/// Network configuration.
#[derive(Debug, Deserialize)]
pub struct NetworkConfig {
    /// Base (rendezvous) server TCP addresses, rotated through on repeated
    /// connection failures.
    #[serde(default)]
    pub base_addresses: Vec<String>,
    /// Pins the base address, bypassing the rotation list entirely.
    pub override_base_address: Option<String>,
    /// Pins the local UDP source port instead of scanning from the default.
    pub override_source_port: Option<u16>,
    #[serde(default = "default_true")]
    pub enable_udp: bool,
    #[serde(default = "default_true")]
    pub enable_multicast: bool,
    /// Allow relaying data through the base server over UDP.
    #[serde(default = "default_true")]
    pub udp_tunnelling: bool,
    /// Allow relaying data through the base server over TCP.
    #[serde(default = "default_true")]
    pub tcp_tunnelling: bool,
    /// Extra `ip:port` pairs advertised to the base alongside the
    /// auto-detected local addresses.
    #[serde(default)]
    pub extra_addresses: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            base_addresses: Vec::new(),
            override_base_address: None,
            override_source_port: None,
            enable_udp: true,
            enable_multicast: true,
            udp_tunnelling: true,
            tcp_tunnelling: true,
            extra_addresses: Vec::new(),
        }
    }
}

/// Security settings.
#[derive(Debug, Deserialize, Default)]
pub struct SecurityConfig {
    pub identity_path: Option<String>,
    /// Advertise the payload-compression capability to peers.
    #[serde(default)]
    pub enable_compression: bool,
}

/// Protocol timing knobs. The defaults match the deployed protocol; they
/// exist as configuration mainly so tests and constrained links can shrink
/// them.
#[derive(Debug, Deserialize, Clone)]
pub struct TimingConfig {
    /// Seconds of peer silence before a connection is considered torn down.
    #[serde(default = "default_teardown")]
    pub teardown_secs: u64,
    /// Interval between refresh rounds (address push, NAT keepalive,
    /// per-peer housekeeping).
    #[serde(default = "default_refresh")]
    pub refresh_secs: u64,
    /// Retry interval for unconfirmed NAT init packets.
    #[serde(default = "default_nat_init")]
    pub nat_init_secs: u64,
    /// Base TCP considered dead after this much silence.
    #[serde(default = "default_tcp_pong")]
    pub tcp_pong_secs: u64,
    /// Base UDP session considered stale after this much silence.
    #[serde(default = "default_udp_base")]
    pub udp_base_secs: u64,
    /// Minimum interval between reestablish attempts for one peer.
    #[serde(default = "default_reestablish")]
    pub reestablish_secs: u64,
    /// Failed establishment ceiling before a peer goes relay-only until
    /// new address information arrives.
    #[serde(default = "default_max_failed")]
    pub max_failed_establishments: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            teardown_secs: default_teardown(),
            refresh_secs: default_refresh(),
            nat_init_secs: default_nat_init(),
            tcp_pong_secs: default_tcp_pong(),
            udp_base_secs: default_udp_base(),
            reestablish_secs: default_reestablish(),
            max_failed_establishments: default_max_failed(),
        }
    }
}

/// Peer admission settings.
#[derive(Debug, Deserialize, Default)]
pub struct PeersConfig {
    /// When true, only whitelisted device addresses are admitted.
    #[serde(default)]
    pub whitelist_enabled: bool,
    /// Whitelisted device addresses (overlay IPv6 strings). Also the
    /// destination set for multicast fan-out.
    #[serde(default)]
    pub whitelist: Vec<String>,
}

fn default_iface() -> String {
    "mesh0".to_string()
}
fn default_true() -> bool {
    true
}
fn default_teardown() -> u64 {
    120
}
fn default_refresh() -> u64 {
    25
}
fn default_nat_init() -> u64 {
    3
}
fn default_tcp_pong() -> u64 {
    35
}
fn default_udp_base() -> u64 {
    35
}
fn default_reestablish() -> u64 {
    3
}
fn default_max_failed() -> u32 {
    5
}

impl Config {
    /// Loads configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file {:?}", path.as_ref()))?;
        toml::from_str(&content).context("failed to parse TOML config")
    }

    /// Loads from the usual locations, falling back to defaults.
    pub fn load_or_default() -> Self {
        let paths = [
            "/etc/tunnelmesh/config.toml",
            "~/.tunnelmesh/config.toml",
            "./tunnelmesh.toml",
        ];
        for path in &paths {
            let expanded = shellexpand::tilde(path).to_string();
            if Path::new(&expanded).exists() {
                if let Ok(config) = Self::load(&expanded) {
                    return config;
                }
            }
        }
        Self::default()
    }
}

// ============================================================================
// Compiled runtime options
// ============================================================================

/// Typed, parsed options the engine reads on the hot path.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub enable_udp: bool,
    pub enable_multicast: bool,
    pub udp_tunnelling: bool,
    pub tcp_tunnelling: bool,
    pub compression: bool,
    pub override_base_address: Option<SocketAddr>,
    pub base_tcp_addresses: Vec<SocketAddr>,
    pub override_source_port: Option<u16>,
    pub extra_addresses: Vec<SocketAddr>,
    whitelist: Option<HashSet<DeviceAddr>>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            enable_udp: true,
            enable_multicast: true,
            udp_tunnelling: true,
            tcp_tunnelling: true,
            compression: false,
            override_base_address: None,
            base_tcp_addresses: Vec::new(),
            override_source_port: None,
            extra_addresses: Vec::new(),
            whitelist: None,
        }
    }
}

impl RuntimeOptions {
    pub fn from_config(config: &Config) -> Result<Self> {
        let parse_addrs = |list: &[String], what: &str| -> Result<Vec<SocketAddr>> {
            list.iter()
                .map(|s| {
                    s.parse::<SocketAddr>()
                        .with_context(|| format!("invalid {} entry: {}", what, s))
                })
                .collect()
        };

        let whitelist = if config.peers.whitelist_enabled {
            let mut set = HashSet::new();
            for entry in &config.peers.whitelist {
                let ip: std::net::Ipv6Addr = entry
                    .parse()
                    .with_context(|| format!("invalid whitelist entry: {}", entry))?;
                set.insert(DeviceAddr::from_ipv6(ip));
            }
            Some(set)
        } else {
            None
        };

        Ok(Self {
            enable_udp: config.network.enable_udp,
            enable_multicast: config.network.enable_multicast,
            udp_tunnelling: config.network.udp_tunnelling,
            tcp_tunnelling: config.network.tcp_tunnelling,
            compression: config.security.enable_compression,
            override_base_address: config
                .network
                .override_base_address
                .as_deref()
                .map(|s| {
                    s.parse::<SocketAddr>()
                        .context("invalid override_base_address")
                })
                .transpose()?,
            base_tcp_addresses: parse_addrs(&config.network.base_addresses, "base address")?,
            override_source_port: config.network.override_source_port,
            extra_addresses: parse_addrs(&config.network.extra_addresses, "extra address")?,
            whitelist,
        })
    }

    /// Admission check applied on every peer creation and lookup.
    pub fn is_peer_allowed(&self, addr: DeviceAddr) -> bool {
        match &self.whitelist {
            Some(set) => set.contains(&addr),
            None => true,
        }
    }

    /// Real-world address policy: never dial or advertise addresses inside
    /// the overlay range.
    pub fn is_address_allowed(&self, addr: &SocketAddr) -> bool {
        !is_overlay_ip(&addr.ip())
    }

    /// Destination set for multicast fan-out (the whitelist; empty when
    /// no whitelist is configured).
    pub fn multicast_destinations(&self, own: DeviceAddr) -> Vec<DeviceAddr> {
        match &self.whitelist {
            Some(set) => {
                let mut dst: Vec<DeviceAddr> = set.iter().copied().filter(|a| *a != own).collect();
                dst.sort();
                dst
            }
            None => Vec::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_whitelist(addrs: &[DeviceAddr]) -> Self {
        Self {
            whitelist: Some(addrs.iter().copied().collect()),
            ..Self::default()
        }
    }

    pub fn user_agent(&self) -> String {
        format!(
            "tunnelmesh {}\n{}\n",
            env!("CARGO_PKG_VERSION"),
            std::env::consts::OS
        )
    }
}

/// Protocol timings as durations.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub teardown: Duration,
    pub refresh: Duration,
    pub nat_init: Duration,
    pub tcp_pong: Duration,
    pub udp_base: Duration,
    pub reestablish: Duration,
    pub max_failed_establishments: u32,
}

impl Timing {
    pub fn from_config(config: &TimingConfig) -> Self {
        Self {
            teardown: Duration::from_secs(config.teardown_secs),
            refresh: Duration::from_secs(config.refresh_secs),
            nat_init: Duration::from_secs(config.nat_init_secs),
            tcp_pong: Duration::from_secs(config.tcp_pong_secs),
            udp_base: Duration::from_secs(config.udp_base_secs),
            reestablish: Duration::from_secs(config.reestablish_secs),
            max_failed_establishments: config.max_failed_establishments,
        }
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self::from_config(&TimingConfig::default())
    }
}
