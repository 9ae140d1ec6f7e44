//! KCP transport: reliable UDP with FEC and stream multiplexing
//!
//! Stack, bottom to top:
//!
//! 1. a [`PacketConn`]: a real UDP socket here, or the raw-packet fake
//!    conn from [`super::raw_kcp`]
//! 2. whole-datagram AEAD under a PBKDF2-derived key
//! 3. Reed-Solomon FEC shards ([`fec`])
//! 4. the KCP reliability engine ([`session`])
//! 5. a yamux stream multiplexer; one stream per dial, servers accept
//!    one stream per session

pub(crate) mod fec;
pub(crate) mod session;

use super::{ConnWrapper, Connection, Listener, Transport, TransportError};
use crate::config::KcpConfig;
use crate::crypto::RecordCipher;
use async_trait::async_trait;
use fec::{FecDecoder, FecEncoder};
use rand::Rng;
use session::{spawn_session, KcpConn, SessionConfig, SessionInput};
use sha2::Sha256;
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tracing::{debug, trace, warn};

/// PBKDF2 salt for the standalone KCP mode
pub const KCP_KEY_SALT: &[u8] = b"xp-protocol-kcp-salt";

/// PBKDF2 iteration count
const KCP_KEY_ROUNDS: u32 = 4096;

/// Fixed KCP MTU, leaving headroom for FEC and AEAD framing
const KCP_MTU: usize = 1350;

/// Kernel socket buffer size for bulk transfer (4 MiB)
const UDP_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Send/receive window, in packets
const KCP_WINDOW: u16 = 1024;

/// Default Reed-Solomon shard counts
const DEFAULT_DATA_SHARDS: usize = 10;
const DEFAULT_PARITY_SHARDS: usize = 3;

/// Queued sessions awaiting accept; beyond this, new peers are dropped
const ACCEPT_BACKLOG: usize = 16;

/// Smallest well-formed KCP packet (one bare header)
const KCP_OVERHEAD: usize = 24;

/// Derive a 32-byte datagram key from a passphrase
pub(crate) fn derive_kcp_key(password: &str, salt: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, KCP_KEY_ROUNDS, &mut key);
    key
}

/// Nodelay tuning profile
#[derive(Debug, Clone, Copy)]
pub struct KcpProfile {
    pub nodelay: bool,
    pub interval: i32,
    pub resend: i32,
    pub nc: bool,
}

impl KcpProfile {
    /// Parse a profile name; unknown names fall back to `fast2`
    pub fn from_mode(mode: &str) -> Self {
        match mode {
            "normal" => Self { nodelay: false, interval: 40, resend: 0, nc: false },
            "fast" => Self { nodelay: false, interval: 30, resend: 2, nc: true },
            "fast3" => Self { nodelay: true, interval: 10, resend: 2, nc: true },
            _ => Self { nodelay: true, interval: 20, resend: 2, nc: true },
        }
    }
}

/// Datagram source/sink the KCP stack runs over
#[async_trait]
pub trait PacketConn: Send + Sync + 'static {
    async fn send_to(&self, buf: &[u8], addr: SocketAddrV4) -> io::Result<()>;
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddrV4)>;
    fn local_addr(&self) -> SocketAddrV4;
}

/// [`PacketConn`] over a kernel UDP socket
pub struct UdpPacketConn {
    socket: UdpSocket,
}

impl UdpPacketConn {
    pub fn new(socket: UdpSocket) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl PacketConn for UdpPacketConn {
    async fn send_to(&self, buf: &[u8], addr: SocketAddrV4) -> io::Result<()> {
        self.socket.send_to(buf, SocketAddr::V4(addr)).await?;
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddrV4)> {
        loop {
            let (n, addr) = self.socket.recv_from(buf).await?;
            if let SocketAddr::V4(v4) = addr {
                return Ok((n, v4));
            }
        }
    }

    fn local_addr(&self) -> SocketAddrV4 {
        match self.socket.local_addr() {
            Ok(SocketAddr::V4(v4)) => v4,
            _ => SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
        }
    }
}

/// Shared tuning for one KCP endpoint
#[derive(Debug, Clone)]
pub(crate) struct KcpSettings {
    pub key: [u8; 32],
    pub profile: KcpProfile,
    pub data_shards: usize,
    pub parity_shards: usize,
}

impl KcpSettings {
    fn session_config(&self, conv: u32) -> SessionConfig {
        SessionConfig {
            conv,
            nodelay: self.profile.nodelay,
            interval: self.profile.interval,
            resend: self.profile.resend,
            nc: self.profile.nc,
            mtu: KCP_MTU,
            snd_wnd: KCP_WINDOW,
            rcv_wnd: KCP_WINDOW,
        }
    }
}

/// KCP transport over kernel UDP
pub struct KcpTransport {
    settings: KcpSettings,
}

impl KcpTransport {
    pub fn new(cfg: &KcpConfig) -> Result<Self, TransportError> {
        let salt = if cfg.salt.is_empty() {
            KCP_KEY_SALT.to_vec()
        } else {
            cfg.salt.as_bytes().to_vec()
        };
        let settings = KcpSettings {
            key: derive_kcp_key(&cfg.key, &salt),
            profile: KcpProfile::from_mode(&cfg.mode),
            data_shards: if cfg.data_shards == 0 {
                DEFAULT_DATA_SHARDS
            } else {
                cfg.data_shards
            },
            parity_shards: if cfg.parity_shards == 0 {
                DEFAULT_PARITY_SHARDS
            } else {
                cfg.parity_shards
            },
        };
        // Validate shard counts up front
        FecEncoder::new(settings.data_shards, settings.parity_shards)
            .map_err(TransportError::ConnectionFailed)?;
        Ok(Self { settings })
    }
}

/// UDP socket with the enlarged buffers bulk KCP traffic needs
fn bind_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    let _ = socket.set_recv_buffer_size(UDP_BUFFER_SIZE);
    let _ = socket.set_send_buffer_size(UDP_BUFFER_SIZE);
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

#[async_trait]
impl Transport for KcpTransport {
    async fn dial(&self, addr: &str) -> Result<Box<dyn Connection>, TransportError> {
        let remote = super::resolve_ipv4(addr).await?;
        let socket = bind_udp("0.0.0.0:0".parse().expect("static bind address"))?;
        let conn: Arc<dyn PacketConn> = Arc::new(UdpPacketConn::new(socket));
        dial_over(conn, remote, &self.settings).await
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>, TransportError> {
        let bind_addr: SocketAddr = addr
            .parse()
            .map_err(|_| TransportError::InvalidAddress(addr.to_string()))?;
        let socket = bind_udp(bind_addr)?;
        let conn: Arc<dyn PacketConn> = Arc::new(UdpPacketConn::new(socket));
        Ok(Box::new(listen_over(conn, &self.settings)))
    }
}

/// Dial one multiplexed stream over any packet conn
pub(crate) async fn dial_over(
    conn: Arc<dyn PacketConn>,
    remote: SocketAddrV4,
    settings: &KcpSettings,
) -> Result<Box<dyn Connection>, TransportError> {
    let conv: u32 = rand::rngs::OsRng.gen_range(1..=u32::MAX);
    let (stream, input, out_rx) = spawn_session(settings.session_config(conv));

    spawn_output_pump(
        Arc::clone(&conn),
        remote,
        settings,
        input.clone(),
        out_rx,
    )?;
    spawn_client_input_pump(Arc::clone(&conn), remote, settings, input)?;

    debug!("KCP session {} dialing {}", conv, remote);
    let local = conn.local_addr().to_string();
    let mux_stream = mux_client(stream).await?;
    Ok(Box::new(ConnWrapper::new(
        mux_stream,
        local,
        remote.to_string(),
    )))
}

/// Shard, seal and transmit everything the KCP engine emits
fn spawn_output_pump(
    conn: Arc<dyn PacketConn>,
    remote: SocketAddrV4,
    settings: &KcpSettings,
    input: SessionInput,
    mut out_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) -> Result<(), TransportError> {
    let mut encoder = FecEncoder::new(settings.data_shards, settings.parity_shards)
        .map_err(TransportError::ConnectionFailed)?;
    let mut sealer = RecordCipher::new(&settings.key)
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                packet = out_rx.recv() => {
                    let Some(packet) = packet else { break };
                    for shard in encoder.encode(&packet) {
                        let Ok(sealed) = sealer.seal(&shard) else { continue };
                        if conn.send_to(&sealed, remote).await.is_err() {
                            input.close();
                            return;
                        }
                    }
                }
                _ = input.closed() => break,
            }
        }
    });
    Ok(())
}

/// Receive, open and un-shard datagrams into the client session
fn spawn_client_input_pump(
    conn: Arc<dyn PacketConn>,
    remote: SocketAddrV4,
    settings: &KcpSettings,
    input: SessionInput,
) -> Result<(), TransportError> {
    let mut decoder = FecDecoder::new(settings.data_shards, settings.parity_shards)
        .map_err(TransportError::ConnectionFailed)?;
    let opener = RecordCipher::new(&settings.key)
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        loop {
            let received = tokio::select! {
                received = conn.recv_from(&mut buf) => received,
                _ = input.closed() => break,
            };
            let (n, from) = match received {
                Ok(received) => received,
                Err(_) => {
                    input.close();
                    break;
                }
            };
            if from != remote {
                continue;
            }
            let Ok(shard) = opener.open(&buf[..n]) else {
                trace!("dropping undecryptable datagram from {}", from);
                continue;
            };
            for packet in decoder.decode(&shard) {
                input.input(&packet);
            }
        }
    });
    Ok(())
}

struct PeerSession {
    input: SessionInput,
    decoder: FecDecoder,
}

/// KCP listener: one pump task demultiplexes datagrams by peer address
pub(crate) struct KcpListener {
    accept_rx: mpsc::Receiver<(KcpConn, SocketAddrV4)>,
    local: String,
    pump: tokio::task::JoinHandle<()>,
}

pub(crate) fn listen_over(conn: Arc<dyn PacketConn>, settings: &KcpSettings) -> KcpListener {
    let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);
    let local = conn.local_addr().to_string();
    let settings = settings.clone();

    let pump = tokio::spawn(async move {
        let opener = match RecordCipher::new(&settings.key) {
            Ok(opener) => opener,
            Err(_) => return,
        };
        let mut peers: HashMap<SocketAddrV4, PeerSession> = HashMap::new();
        let mut buf = vec![0u8; 2048];

        loop {
            let (n, from) = match conn.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!("KCP listener socket error: {}", e);
                    break;
                }
            };

            // Peers that cannot produce a valid seal never get a session
            let Ok(shard) = opener.open(&buf[..n]) else {
                trace!("dropping undecryptable datagram from {}", from);
                continue;
            };

            peers.retain(|_, peer| !peer.input.is_closed());

            if let Some(peer) = peers.get_mut(&from) {
                let packets = peer.decoder.decode(&shard);
                for packet in &packets {
                    peer.input.input(packet);
                }
                continue;
            }

            // New peer: the first decodable KCP packet carries the conv id
            let Ok(mut decoder) =
                FecDecoder::new(settings.data_shards, settings.parity_shards)
            else {
                continue;
            };
            let packets = decoder.decode(&shard);
            let Some(first) = packets.first() else {
                continue;
            };
            if first.len() < KCP_OVERHEAD {
                continue;
            }
            // The conv id is the first little-endian u32 of a KCP packet
            let conv = u32::from_le_bytes([first[0], first[1], first[2], first[3]]);
            let (stream, input, out_rx) = spawn_session(settings.session_config(conv));
            if spawn_output_pump(
                Arc::clone(&conn),
                from,
                &settings,
                input.clone(),
                out_rx,
            )
            .is_err()
            {
                continue;
            }

            for packet in &packets {
                input.input(packet);
            }

            debug!("KCP session {} accepted from {}", conv, from);
            match accept_tx.try_send((stream, from)) {
                Ok(()) => {
                    peers.insert(from, PeerSession { input, decoder });
                }
                Err(_) => {
                    // Backlog full; drop the session under pressure
                    input.close();
                }
            }
        }
    });

    KcpListener {
        accept_rx,
        local,
        pump,
    }
}

impl Drop for KcpListener {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[async_trait]
impl Listener for KcpListener {
    async fn accept(&mut self) -> Result<Box<dyn Connection>, TransportError> {
        let (stream, from) = self
            .accept_rx
            .recv()
            .await
            .ok_or(TransportError::Closed)?;
        let mux_stream = mux_server(stream).await?;
        Ok(Box::new(ConnWrapper::new(
            mux_stream,
            self.local.clone(),
            from.to_string(),
        )))
    }

    fn local_addr(&self) -> String {
        self.local.clone()
    }
}

fn mux_config() -> yamux::Config {
    let mut config = yamux::Config::default();
    config.set_max_num_streams(256);
    config
}

/// Open the single client stream and keep the mux driven in the
/// background
async fn mux_client(
    stream: KcpConn,
) -> Result<Compat<yamux::Stream>, TransportError> {
    let mut muxed = yamux::Connection::new(stream.compat(), mux_config(), yamux::Mode::Client);
    let outbound = futures::future::poll_fn(|cx| muxed.poll_new_outbound(cx))
        .await
        .map_err(|e| TransportError::ConnectionFailed(format!("mux open: {e}")))?;
    tokio::spawn(drive_mux(muxed));
    Ok(outbound.compat())
}

/// Accept the single server-side stream and keep the mux driven
async fn mux_server(
    stream: KcpConn,
) -> Result<Compat<yamux::Stream>, TransportError> {
    let mut muxed = yamux::Connection::new(stream.compat(), mux_config(), yamux::Mode::Server);
    let inbound = futures::future::poll_fn(|cx| muxed.poll_next_inbound(cx))
        .await
        .ok_or_else(|| TransportError::ConnectionFailed("mux closed before stream".into()))?
        .map_err(|e| TransportError::ConnectionFailed(format!("mux accept: {e}")))?;
    tokio::spawn(drive_mux(muxed));
    Ok(inbound.compat())
}

/// Drive connection progress; extra inbound streams are dropped
async fn drive_mux(mut muxed: yamux::Connection<Compat<KcpConn>>) {
    loop {
        match futures::future::poll_fn(|cx| muxed.poll_next_inbound(cx)).await {
            Some(Ok(stream)) => drop(stream),
            Some(Err(_)) | None => break,
        }
    }
}
