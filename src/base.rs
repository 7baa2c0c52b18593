//! Base (rendezvous) server connection state and framed TCP transport.
//!
//! The base server provides peer discovery and store-and-forward relay.
//! Every peer keeps one TCP connection to it (frames dressed up as TLS
//! application-data records, since the base listens on 443) and
//! independently confirms a UDP session through NAT-init round trips.
//!
//! To survive NAT devices that never keep a mapping alive, the base also
//! advertises a small range of *transient* ports. One NAT-init keepalive
//! per refresh round is aimed at a cursor that walks this range: touching
//! ~20 distinct outbound ports over a ~500 s window outlives the typical
//! 30–180 s NAT binding lifetime, so at least one mapping stays usable.

use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::config::RuntimeOptions;
use crate::transport::Engine;

/// Base servers listen for peers on the HTTPS port.
pub const BASE_TCP_PORT: u16 = 443;

/// TLS application-data lookalike prefix on every TCP frame.
const FRAME_MAGIC: [u8; 3] = [0x17, 0x03, 0x03];
const FRAME_HEADER_LEN: usize = FRAME_MAGIC.len() + 2;

/// Rotate to the next configured base address after this many failures.
const ROTATE_AFTER_RETRIES: u32 = 2;

/// Handle to the current TCP connection's writer task.
pub struct BaseHandle {
    pub id: u64,
    pub outbound: mpsc::UnboundedSender<Vec<u8>>,
}

/// All state tied to the base relationship.
pub struct BaseState {
    /// Session cookie from the base HELLO; required on signed sends.
    pub cookie: Option<[u8; 16]>,
    /// Currently selected base TCP address.
    pub address: Option<SocketAddr>,
    /// Primary base UDP endpoint (first entry of the last STATE message).
    pub udp_address: Option<SocketAddr>,
    pub all_udp_addresses: Vec<SocketAddr>,
    /// Cursor into the transient port range; 0 while unset.
    pub transient_port: u16,
    pub transient_range: Option<(u16, u16)>,
    pub nat_init_counter: u64,
    pub nat_init_confirmed: bool,
    pub last_nat_init_confirmation: Option<Instant>,
    pub last_nat_init_sent: Option<Instant>,
    pub last_tcp_message: Option<Instant>,
    pub last_tcp_action: Option<Instant>,
    pub connect_retries: u32,
    pub connection: Option<BaseHandle>,
    next_connection_id: u64,
}

impl BaseState {
    pub fn new() -> Self {
        BaseState {
            cookie: None,
            address: None,
            udp_address: None,
            all_udp_addresses: Vec::new(),
            transient_port: 0,
            transient_range: None,
            nat_init_counter: 0,
            nat_init_confirmed: true,
            last_nat_init_confirmation: None,
            last_nat_init_sent: None,
            last_tcp_message: None,
            last_tcp_action: None,
            connect_retries: 0,
            connection: None,
            next_connection_id: 0,
        }
    }

    /// A UDP session counts as live while NAT-init confirmations keep
    /// arriving within the staleness window.
    pub fn is_udp_session_live(&self, window: Duration) -> bool {
        self.last_nat_init_confirmation
            .map(|t| t.elapsed() < window)
            .unwrap_or(false)
    }

    /// Applies a STATE message: base UDP endpoints plus the transient
    /// port range. A zero lower bound or an inverted range is ignored.
    pub fn apply_state(
        &mut self,
        udp_addresses: Vec<SocketAddr>,
        transient_range: Option<(u16, u16)>,
    ) {
        if udp_addresses.is_empty() {
            return;
        }
        self.udp_address = Some(udp_addresses[0]);
        self.all_udp_addresses = udp_addresses;
        debug!("base UDP address is now {:?}", self.udp_address);

        if let Some((lo, hi)) = transient_range {
            if lo != 0 && hi >= lo {
                debug!("base transient port range {}..={}", lo, hi);
                self.transient_range = Some((lo, hi));
                if self.transient_port == 0 {
                    self.transient_port = lo;
                }
            }
        }
    }

    /// Advances the transient port cursor, wrapping inside the inclusive
    /// range. One step per NAT-init round.
    pub fn advance_transient_port(&mut self) {
        if let Some((lo, hi)) = self.transient_range {
            self.transient_port += 1;
            if self.transient_port > hi {
                self.transient_port = lo;
            }
        }
    }

    /// Picks the base TCP address for the next connection attempt:
    /// a pinned override wins, otherwise the configured list is rotated
    /// through after repeated failures.
    pub fn choose_address(&mut self, options: &RuntimeOptions) -> Option<SocketAddr> {
        if let Some(addr) = options.override_base_address {
            self.address = Some(addr);
        } else {
            if self.address.is_none() {
                self.address = options.base_tcp_addresses.first().copied();
            }
            if self.connect_retries > ROTATE_AFTER_RETRIES && !options.base_tcp_addresses.is_empty()
            {
                let idx = self.connect_retries as usize % options.base_tcp_addresses.len();
                self.address = Some(options.base_tcp_addresses[idx]);
                warn!("retrying with fallback base address {:?}", self.address);
            }
        }
        self.connect_retries += 1;
        self.address
    }

    /// Allocates a connection id and installs the handle, superseding any
    /// previous connection.
    pub fn install_connection(&mut self, outbound: mpsc::UnboundedSender<Vec<u8>>) -> u64 {
        self.next_connection_id += 1;
        let id = self.next_connection_id;
        self.connection = Some(BaseHandle { id, outbound });
        self.last_tcp_action = Some(Instant::now());
        id
    }

    /// True if `id` refers to the connection currently in service.
    pub fn is_current(&self, id: u64) -> bool {
        self.connection.as_ref().map(|h| h.id) == Some(id)
    }
}

impl Default for BaseState {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Framed TCP
// ============================================================================

pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= u16::MAX as usize);
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&FRAME_MAGIC);
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

async fn read_frame(stream: &mut (impl AsyncReadExt + Unpin)) -> std::io::Result<Vec<u8>> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    stream.read_exact(&mut header).await?;
    if header[..3] != FRAME_MAGIC {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "bad frame header from base",
        ));
    }
    let len = u16::from_le_bytes([header[3], header[4]]) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Runs one base TCP connection to completion: connects, pumps inbound
/// frames into the engine and drains the outbound queue. Exits when the
/// stream breaks or the connection is superseded (outbound sender dropped).
pub(crate) async fn run_connection(
    engine: Arc<Engine>,
    addr: SocketAddr,
    id: u64,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let stream = match TcpStream::connect(addr).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("base TCP connect to {} failed: {}", addr, e);
            engine.base_closed(id);
            return;
        }
    };
    info!("base TCP connection to {} established", addr);
    let (mut reader, mut writer) = stream.into_split();
    engine.base_connected(id);

    loop {
        tokio::select! {
            frame = read_frame(&mut reader) => {
                match frame {
                    Ok(payload) => engine.base_frame(id, &payload),
                    Err(e) => {
                        debug!("base TCP connection closed: {}", e);
                        engine.base_closed(id);
                        return;
                    }
                }
            }
            msg = outbound.recv() => {
                match msg {
                    Some(frame) => {
                        if let Err(e) = writer.write_all(&frame).await {
                            debug!("base TCP write failed: {}", e);
                            engine.base_closed(id);
                            return;
                        }
                    }
                    // Sender dropped: this connection was superseded.
                    None => return,
                }
            }
        }
    }
}
