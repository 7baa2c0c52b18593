//! Virtual network interface (TUN) adapter.
//!
//! The tunnel device is an external collaborator: the engine only ever
//! sees raw packets moving through channels, so everything OS-specific
//! stays behind this module (and behind the `tun` feature, letting the
//! engine and its tests build without a TUN stack).

#![cfg(feature = "tun")]

use anyhow::{Context, Result};
use log::{info, warn};
use std::net::Ipv6Addr;
use std::process::Command;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};

/// MTU leaving room for the overlay's encryption and relay overhead.
const DEFAULT_MTU: u16 = 1350;

pub struct TunDevice {
    device: tun2::AsyncDevice,
    name: String,
}

impl TunDevice {
    /// Creates the interface and assigns the overlay address. Address
    /// configuration shells out to `ip`, since the TUN crate only speaks
    /// IPv4 natively.
    pub async fn create(name: &str, address: Ipv6Addr) -> Result<Self> {
        info!("creating TUN interface '{}' with address {}", name, address);

        let mut config = tun2::Configuration::default();
        config.tun_name(name).mtu(DEFAULT_MTU).up();
        #[cfg(target_os = "linux")]
        config.platform_config(|platform| {
            platform.ensure_root_privileges(true);
        });

        let device = tun2::create_as_async(&config).context("failed to create TUN device")?;

        let status = Command::new("ip")
            .args(["-6", "addr", "add", &format!("{}/16", address), "dev", name])
            .status()
            .context("failed to run ip(8)")?;
        if !status.success() {
            // Likely already configured from a previous run.
            warn!("could not assign {} to {}", address, name);
        }

        info!("TUN interface '{}' is up (mtu {})", name, DEFAULT_MTU);
        Ok(TunDevice {
            device,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Splits into independent read/write halves for the two pump tasks.
    pub fn split(self) -> (ReadHalf<tun2::AsyncDevice>, WriteHalf<tun2::AsyncDevice>) {
        tokio::io::split(self.device)
    }
}

/// Reads packets from the device into the engine.
pub async fn pump_outbound(
    mut reader: ReadHalf<tun2::AsyncDevice>,
    engine: std::sync::Arc<crate::transport::Engine>,
) {
    let mut buf = vec![0u8; 65536];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                warn!("TUN device closed");
                return;
            }
            Ok(n) => engine.send_tunnel_packet(&buf[..n]),
            Err(e) => {
                warn!("TUN read error: {}", e);
                return;
            }
        }
    }
}

/// Writes inbound overlay packets out to the OS.
pub async fn pump_inbound(
    mut writer: WriteHalf<tun2::AsyncDevice>,
    mut packets: tokio::sync::mpsc::Receiver<Vec<u8>>,
) {
    while let Some(packet) = packets.recv().await {
        if let Err(e) = writer.write_all(&packet).await {
            warn!("TUN write error: {}", e);
            return;
        }
    }
}

/// Checks whether TUN devices can plausibly be created at all.
pub fn check_permissions() -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        if std::fs::metadata("/dev/net/tun").is_err() {
            anyhow::bail!("TUN device not available; is the tun module loaded?");
        }
        if unsafe { libc::geteuid() } != 0 {
            warn!("not running as root, TUN creation may fail without CAP_NET_ADMIN");
        }
    }
    Ok(())
}
