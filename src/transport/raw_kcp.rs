//! Raw packets + KCP: the supported stealth composition
//!
//! UDP datagrams are emitted directly through the datalink channel
//! instead of the kernel socket API; encryption, FEC, reliability and
//! multiplexing above it are the standard KCP stack from
//! [`super::kcp`]. The fake packet conn replaces the kernel's UDP
//! socket; the transport keeps only a `Weak` reference to it so the
//! conn's lifetime is owned by the KCP pumps and no reference cycle
//! forms.

use super::kcp::{derive_kcp_key, dial_over, listen_over, KcpProfile, KcpSettings, PacketConn};
use super::raw::packet::{self, LinkHandle, RawPacket};
use super::raw::{parse_addressing, parse_port};
use super::{Connection, Listener, Transport, TransportError};
use crate::config::RawConfig;
use async_trait::async_trait;
use bytes::Bytes;
use rand::rngs::OsRng;
use rand::Rng;
use std::io;
use std::net::SocketAddrV4;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// PBKDF2 salt for the raw+KCP composition
pub const RAW_KCP_SALT: &[u8] = b"xp-protocol-raw-kcp";

/// Built-in passphrase matching the peer's default
const RAW_KCP_PASSWORD: &str = "xp-proto";

/// Datagram queue depth per fake conn
const RECV_QUEUE: usize = 256;

struct FakeUdpState {
    local_port: u16,
    recv_tx: mpsc::Sender<(Bytes, SocketAddrV4)>,
}

/// `PacketConn` that speaks UDP through the datalink channel
struct FakeUdpConn {
    link: LinkHandle,
    state: Arc<FakeUdpState>,
    recv_rx: Mutex<mpsc::Receiver<(Bytes, SocketAddrV4)>>,
}

#[async_trait]
impl PacketConn for FakeUdpConn {
    async fn send_to(&self, buf: &[u8], addr: SocketAddrV4) -> io::Result<()> {
        let frame = self
            .link
            .udp_datagram(*addr.ip(), self.state.local_port, addr.port(), buf);
        self.link.send_frame(frame, false);
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddrV4)> {
        let mut rx = self.recv_rx.lock().await;
        let (data, from) = rx
            .recv()
            .await
            .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionAborted))?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok((n, from))
    }

    fn local_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.link.local_ip, self.state.local_port)
    }
}

/// Raw-packet transport with KCP reliability on top
pub struct RawKcpTransport {
    link: LinkHandle,
    settings: KcpSettings,
    /// Live fake conn, if any; `Weak` so dropping the KCP stack frees it
    current: Arc<Mutex<Weak<FakeUdpState>>>,
}

impl RawKcpTransport {
    pub fn new(cfg: &RawConfig) -> Result<Self, TransportError> {
        let (local_ip, router_mac, local_mac) = parse_addressing(cfg)?;
        let (link, packets) = packet::open_link(&cfg.interface, local_ip, router_mac, local_mac)?;

        let current: Arc<Mutex<Weak<FakeUdpState>>> = Arc::new(Mutex::new(Weak::new()));
        tokio::spawn(dispatch(Arc::clone(&current), packets));

        Ok(Self {
            link,
            settings: KcpSettings {
                key: derive_kcp_key(RAW_KCP_PASSWORD, RAW_KCP_SALT),
                profile: KcpProfile::from_mode("fast2"),
                data_shards: 10,
                parity_shards: 3,
            },
            current,
        })
    }

    async fn make_conn(&self, local_port: u16) -> Arc<dyn PacketConn> {
        let (recv_tx, recv_rx) = mpsc::channel(RECV_QUEUE);
        let state = Arc::new(FakeUdpState {
            local_port,
            recv_tx,
        });
        *self.current.lock().await = Arc::downgrade(&state);
        Arc::new(FakeUdpConn {
            link: self.link.clone(),
            state,
            recv_rx: Mutex::new(recv_rx),
        })
    }
}

/// Feed received raw UDP payloads into the live fake conn
async fn dispatch(
    current: Arc<Mutex<Weak<FakeUdpState>>>,
    mut packets: mpsc::UnboundedReceiver<RawPacket>,
) {
    while let Some(packet) = packets.recv().await {
        let RawPacket::Udp(dgram) = packet else {
            continue;
        };
        let Some(state) = current.lock().await.upgrade() else {
            continue;
        };
        if dgram.dst_port != state.local_port {
            continue;
        }
        let from = SocketAddrV4::new(dgram.src_ip, dgram.src_port);
        // Queue full: drop; KCP retransmits
        let _ = state.recv_tx.try_send((dgram.payload.clone(), from));
    }
}

#[async_trait]
impl Transport for RawKcpTransport {
    async fn dial(&self, addr: &str) -> Result<Box<dyn Connection>, TransportError> {
        let remote = super::resolve_ipv4(addr).await?;
        let local_port = OsRng.gen_range(49152..=65535u16);
        let conn = self.make_conn(local_port).await;
        debug!("raw+KCP dialing {} from port {}", remote, local_port);
        dial_over(conn, remote, &self.settings).await
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>, TransportError> {
        let port = parse_port(addr)?;
        let conn = self.make_conn(port).await;
        debug!("raw+KCP listening on port {}", port);
        Ok(Box::new(listen_over(conn, &self.settings)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_kcp_key_differs_from_kcp_key() {
        let raw = derive_kcp_key(RAW_KCP_PASSWORD, RAW_KCP_SALT);
        let plain = derive_kcp_key(RAW_KCP_PASSWORD, super::super::kcp::KCP_KEY_SALT);
        assert_ne!(raw, plain);
    }
}
