//! Raw-packet transport: userland TCP over a datalink channel
//!
//! Performs the TCP three-way handshake in userspace, bypassing the
//! kernel stack entirely, so middlebox state tables keyed to OS TCP
//! behavior never see a matching flow.
//!
//! Experimental on its own: there is no retransmission, reassembly or
//! window management, so a lossy path will stall. Production
//! deployments set `use_kcp` and run the KCP layer on top
//! ([`super::raw_kcp`]), which delegates all reliability.

pub(crate) mod packet;

use super::{Connection, Listener, Transport, TransportError};
use crate::config::RawConfig;
use async_trait::async_trait;
use bytes::Bytes;
use packet::{LinkHandle, RawPacket, TcpSegment};
use parking_lot::Mutex;
use pnet::packet::tcp::TcpFlags;
use rand::rngs::OsRng;
use rand::Rng;
use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// SYN-ACK wait during the userland handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest payload per emitted segment
const MAX_SEGMENT_PAYLOAD: usize = 1400;

/// Per-connection receive queue depth; overflow drops (KCP above
/// recovers)
const RECV_QUEUE: usize = 256;

/// Pending-accept depth
const ACCEPT_BACKLOG: usize = 16;

/// Ephemeral source-port range
const EPHEMERAL_PORTS: std::ops::RangeInclusive<u16> = 49152..=65535;

struct TcpState {
    seq: u32,
    ack: u32,
}

struct ConnShared {
    local_port: u16,
    remote_ip: Ipv4Addr,
    remote_port: u16,
    state: Mutex<TcpState>,
    closed: AtomicBool,
    /// Receive queue feed; taken on FIN so the reader sees EOF
    recv_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    /// Fired by the dispatcher when the SYN-ACK lands
    synack_tx: Mutex<Option<oneshot::Sender<()>>>,
}

struct ListenerState {
    port: u16,
    accept_tx: mpsc::Sender<RawConnection>,
}

struct RawInner {
    link: LinkHandle,
    conns: Mutex<HashMap<(Ipv4Addr, u16), Arc<ConnShared>>>,
    listener: Mutex<Option<ListenerState>>,
}

impl RawInner {
    /// Compose and queue one segment, advancing seq per TCP rules
    fn send_segment(&self, conn: &ConnShared, flags: u8, payload: &[u8]) {
        let mut state = conn.state.lock();
        let frame = self.link.tcp_segment(
            conn.remote_ip,
            conn.local_port,
            conn.remote_port,
            state.seq,
            state.ack,
            flags,
            payload,
        );
        if flags & TcpFlags::SYN != 0 {
            state.seq = state.seq.wrapping_add(1);
        }
        state.seq = state.seq.wrapping_add(payload.len() as u32);
        drop(state);
        self.link.send_frame(frame, !payload.is_empty());
    }

    fn remove_conn(&self, conn: &ConnShared) {
        self.conns
            .lock()
            .remove(&(conn.remote_ip, conn.remote_port));
    }
}

/// Userland TCP transport
pub struct RawTransport {
    inner: Arc<RawInner>,
}

impl RawTransport {
    pub fn new(cfg: &RawConfig) -> Result<Self, TransportError> {
        let (inner, packets) = open_raw(cfg)?;
        tokio::spawn(dispatch(Arc::clone(&inner), packets));
        Ok(Self { inner })
    }
}

/// Parse the raw-mode addressing inputs: local IPv4, router MAC and the
/// optional explicit local MAC
pub(crate) fn parse_addressing(
    cfg: &RawConfig,
) -> Result<(Ipv4Addr, pnet::util::MacAddr, Option<pnet::util::MacAddr>), TransportError> {
    let local_ip = Ipv4Addr::from_str(&cfg.local_ip)
        .map_err(|_| TransportError::InvalidAddress(format!("local IP '{}'", cfg.local_ip)))?;
    let router_mac = pnet::util::MacAddr::from_str(&cfg.router_mac)
        .map_err(|_| TransportError::InvalidAddress(format!("router MAC '{}'", cfg.router_mac)))?;
    let local_mac = if cfg.local_mac.is_empty() {
        None
    } else {
        Some(
            pnet::util::MacAddr::from_str(&cfg.local_mac).map_err(|_| {
                TransportError::InvalidAddress(format!("local MAC '{}'", cfg.local_mac))
            })?,
        )
    };
    Ok((local_ip, router_mac, local_mac))
}

/// Parse addressing config and open the datalink channel
fn open_raw(
    cfg: &RawConfig,
) -> Result<(Arc<RawInner>, mpsc::UnboundedReceiver<RawPacket>), TransportError> {
    let (local_ip, router_mac, local_mac) = parse_addressing(cfg)?;
    let (link, packets) = packet::open_link(&cfg.interface, local_ip, router_mac, local_mac)?;
    Ok((
        Arc::new(RawInner {
            link,
            conns: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
        }),
        packets,
    ))
}

/// Background packet loop: handshakes, ack tracking, payload delivery
async fn dispatch(inner: Arc<RawInner>, mut packets: mpsc::UnboundedReceiver<RawPacket>) {
    while let Some(packet) = packets.recv().await {
        let RawPacket::Tcp(seg) = packet else {
            continue;
        };

        let is_syn = seg.flags & TcpFlags::SYN != 0;
        let is_ack = seg.flags & TcpFlags::ACK != 0;

        if is_syn && !is_ack {
            accept_syn(&inner, &seg);
            continue;
        }

        let conn = {
            let conns = inner.conns.lock();
            conns.get(&(seg.src_ip, seg.src_port)).cloned()
        };
        let Some(conn) = conn else {
            continue;
        };

        if seg.flags & TcpFlags::FIN != 0 {
            trace!("FIN from {}:{}", seg.src_ip, seg.src_port);
            conn.closed.store(true, Ordering::Release);
            conn.recv_tx.lock().take();
            inner.remove_conn(&conn);
            continue;
        }

        {
            let mut state = conn.state.lock();
            if seg.payload.is_empty() && is_syn {
                state.ack = seg.seq.wrapping_add(1);
            } else {
                state.ack = seg.seq.wrapping_add(seg.payload.len() as u32);
            }
        }

        if is_syn && is_ack {
            if let Some(waiter) = conn.synack_tx.lock().take() {
                let _ = waiter.send(());
            }
            continue;
        }

        if !seg.payload.is_empty() {
            if let Some(tx) = conn.recv_tx.lock().as_ref() {
                // Queue full: drop; the reliability layer above recovers
                let _ = tx.try_send(seg.payload.clone());
            }
        }
    }
}

/// Synthesize a server-side connection for an incoming SYN
fn accept_syn(inner: &Arc<RawInner>, seg: &TcpSegment) {
    let listener_port = match &*inner.listener.lock() {
        Some(listener) if listener.port == seg.dst_port => listener.port,
        _ => return,
    };

    debug!("SYN from {}:{}", seg.src_ip, seg.src_port);
    let (recv_tx, recv_rx) = mpsc::channel(RECV_QUEUE);
    let shared = Arc::new(ConnShared {
        local_port: listener_port,
        remote_ip: seg.src_ip,
        remote_port: seg.src_port,
        state: Mutex::new(TcpState {
            seq: OsRng.gen(),
            ack: seg.seq.wrapping_add(1),
        }),
        closed: AtomicBool::new(false),
        recv_tx: Mutex::new(Some(recv_tx)),
        synack_tx: Mutex::new(None),
    });

    inner
        .conns
        .lock()
        .insert((seg.src_ip, seg.src_port), Arc::clone(&shared));

    inner.send_segment(&shared, TcpFlags::SYN | TcpFlags::ACK, &[]);

    let conn = RawConnection {
        shared: Arc::clone(&shared),
        inner: Arc::clone(inner),
        recv_rx,
        leftover: Bytes::new(),
    };
    let listener = inner.listener.lock();
    if let Some(listener) = &*listener {
        // Accept queue full: drop the connection under pressure
        if listener.accept_tx.try_send(conn).is_err() {
            warn!("raw accept queue full, dropping {}:{}", seg.src_ip, seg.src_port);
            inner.remove_conn(&shared);
        }
    }
}

#[async_trait]
impl Transport for RawTransport {
    async fn dial(&self, addr: &str) -> Result<Box<dyn Connection>, TransportError> {
        let remote = super::resolve_ipv4(addr).await?;
        let (recv_tx, recv_rx) = mpsc::channel(RECV_QUEUE);
        let (synack_tx, synack_rx) = oneshot::channel();

        let shared = Arc::new(ConnShared {
            local_port: OsRng.gen_range(EPHEMERAL_PORTS),
            remote_ip: *remote.ip(),
            remote_port: remote.port(),
            state: Mutex::new(TcpState {
                seq: OsRng.gen(),
                ack: 0,
            }),
            closed: AtomicBool::new(false),
            recv_tx: Mutex::new(Some(recv_tx)),
            synack_tx: Mutex::new(Some(synack_tx)),
        });

        self.inner
            .conns
            .lock()
            .insert((*remote.ip(), remote.port()), Arc::clone(&shared));

        self.inner.send_segment(&shared, TcpFlags::SYN, &[]);

        match tokio::time::timeout(HANDSHAKE_TIMEOUT, synack_rx).await {
            Ok(Ok(())) => {}
            _ => {
                self.inner.remove_conn(&shared);
                return Err(TransportError::Timeout);
            }
        }

        self.inner.send_segment(&shared, TcpFlags::ACK, &[]);
        debug!("raw handshake complete with {}", remote);

        Ok(Box::new(RawConnection {
            shared,
            inner: Arc::clone(&self.inner),
            recv_rx,
            leftover: Bytes::new(),
        }))
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>, TransportError> {
        let port = parse_port(addr)?;
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);
        *self.inner.listener.lock() = Some(ListenerState {
            port,
            accept_tx,
        });
        Ok(Box::new(RawListener {
            local: format!("{}:{}", self.inner.link.local_ip, port),
            accept_rx,
        }))
    }
}

pub(crate) fn parse_port(addr: &str) -> Result<u16, TransportError> {
    addr.rsplit_once(':')
        .and_then(|(_, port)| port.parse().ok())
        .ok_or_else(|| TransportError::InvalidAddress(addr.to_string()))
}

struct RawListener {
    local: String,
    accept_rx: mpsc::Receiver<RawConnection>,
}

#[async_trait]
impl Listener for RawListener {
    async fn accept(&mut self) -> Result<Box<dyn Connection>, TransportError> {
        let conn = self.accept_rx.recv().await.ok_or(TransportError::Closed)?;
        Ok(Box::new(conn))
    }

    fn local_addr(&self) -> String {
        self.local.clone()
    }
}

/// One userland TCP connection
pub struct RawConnection {
    shared: Arc<ConnShared>,
    inner: Arc<RawInner>,
    recv_rx: mpsc::Receiver<Bytes>,
    leftover: Bytes,
}

impl RawConnection {
    fn teardown(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner
            .send_segment(&self.shared, TcpFlags::FIN | TcpFlags::ACK, &[]);
        self.inner.remove_conn(&self.shared);
    }
}

impl AsyncRead for RawConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.leftover.is_empty() {
            let n = this.leftover.len().min(buf.remaining());
            buf.put_slice(&this.leftover[..n]);
            this.leftover = this.leftover.slice(n..);
            return Poll::Ready(Ok(()));
        }

        match this.recv_rx.poll_recv(cx) {
            Poll::Ready(Some(data)) => {
                let n = data.len().min(buf.remaining());
                buf.put_slice(&data[..n]);
                if n < data.len() {
                    this.leftover = data.slice(n..);
                }
                Poll::Ready(Ok(()))
            }
            // Channel closed on FIN: EOF
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for RawConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.shared.closed.load(Ordering::Acquire) {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }

        for chunk in buf.chunks(MAX_SEGMENT_PAYLOAD) {
            this.inner
                .send_segment(&this.shared, TcpFlags::PSH | TcpFlags::ACK, chunk);
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().teardown();
        Poll::Ready(Ok(()))
    }
}

impl Connection for RawConnection {
    fn local_addr(&self) -> String {
        format!("{}:{}", self.inner.link.local_ip, self.shared.local_port)
    }

    fn remote_addr(&self) -> String {
        format!("{}:{}", self.shared.remote_ip, self.shared.remote_port)
    }
}

impl Drop for RawConnection {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port() {
        assert_eq!(parse_port("0.0.0.0:4443").unwrap(), 4443);
        assert_eq!(parse_port(":9").unwrap(), 9);
        assert!(parse_port("no-port").is_err());
    }

    #[test]
    fn test_ephemeral_port_range() {
        for _ in 0..64 {
            let port = OsRng.gen_range(EPHEMERAL_PORTS);
            assert!(port >= 49152);
        }
    }
}
