use anyhow::Result;
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use tunnelmesh::config::{Config, RuntimeOptions, Timing};
use tunnelmesh::discovery::Discovery;
use tunnelmesh::identity::Identity;
use tunnelmesh::transport::{Engine, ProbedAddresses};

#[derive(Parser, Debug)]
#[command(
    name = "tunnelmesh",
    version,
    about = "Peer-to-peer virtual networking overlay daemon",
    long_about = "tunnelmesh daemon\n\n\
        Joins the overlay network: derives a stable IPv6 address from the\n\
        device identity, connects to the base server and routes packets\n\
        between peers over hole-punched UDP with relay fallback."
)]
struct Args {
    /// Path to the config file
    #[arg(long, short = 'C')]
    config: Option<PathBuf>,

    /// Path to the identity file
    #[arg(long)]
    identity: Option<PathBuf>,

    /// Virtual interface name (overrides the config)
    #[arg(long)]
    tun_name: Option<String>,

    /// Generate an identity, print the overlay address and exit
    #[arg(long)]
    init: bool,

    /// Run without a TUN device (engine only; useful for diagnostics)
    #[arg(long)]
    no_tun: bool,
}

fn load_config(args: &Args) -> Config {
    match &args.config {
        Some(path) => Config::load(path).unwrap_or_else(|e| {
            log::warn!("failed to load config {:?}: {}; using defaults", path, e);
            Config::default()
        }),
        None => Config::load_or_default(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = load_config(&args);
    let options = Arc::new(RuntimeOptions::from_config(&config)?);
    let timing = Timing::from_config(&config.timing);

    let identity_path = args
        .identity
        .clone()
        .or_else(|| config.security.identity_path.as_ref().map(PathBuf::from))
        .unwrap_or_else(Identity::default_path);
    let identity = Arc::new(Identity::load_or_generate(&identity_path)?);

    if args.init {
        println!("{}", identity.address());
        return Ok(());
    }

    let discovery = if options.enable_udp && options.enable_multicast {
        Some(Discovery::bind().await)
    } else {
        None
    };

    let (tunnel_tx, tunnel_rx) = mpsc::channel::<Vec<u8>>(256);
    let (engine, worker_rx) = Engine::bind(
        identity.clone(),
        options,
        timing,
        Arc::new(ProbedAddresses),
        discovery,
        tunnel_tx,
    )
    .await?;
    engine.start(worker_rx);

    #[cfg(feature = "tun")]
    {
        if args.no_tun {
            drain_tunnel(tunnel_rx);
        } else {
            use tunnelmesh::tun;

            tun::check_permissions()?;
            let name = args
                .tun_name
                .clone()
                .unwrap_or_else(|| config.daemon.interface.clone());
            let device = tun::TunDevice::create(&name, identity.address().to_ipv6()).await?;
            let (reader, writer) = device.split();
            tokio::spawn(tun::pump_outbound(reader, engine.clone()));
            tokio::spawn(tun::pump_inbound(writer, tunnel_rx));
        }
    }

    #[cfg(not(feature = "tun"))]
    {
        let _ = args.no_tun;
        drain_tunnel(tunnel_rx);
    }

    info!("running; overlay address {}", identity.address());

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut status = signal(SignalKind::user_defined1())?;
        let engine_for_status = engine.clone();
        tokio::spawn(async move {
            loop {
                status.recv().await;
                info!("status:\n{}", engine_for_status.info());
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}

/// Without a TUN device, inbound packets have nowhere to go; keep the
/// queue draining so the engine never blocks on it.
fn drain_tunnel(mut rx: mpsc::Receiver<Vec<u8>>) {
    tokio::spawn(async move { while rx.recv().await.is_some() {} });
}
