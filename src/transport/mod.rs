//! Transport layer implementations
//!
//! Provides pluggable transport backends behind one trait:
//! - TCP (plain, for testing and internal networks)
//! - TLS with fake SNI and ClientHello fragmentation (default)
//! - KCP: reliable UDP with FEC and stream multiplexing
//! - Raw packets: userland TCP/UDP that bypasses the kernel stack,
//!   optionally with KCP on top
//!
//! Host resolution is IPv4-only throughout: the networks this tunnel
//! targets do not route IPv6.

pub mod kcp;
pub mod raw;
pub mod raw_kcp;
mod tcp;
mod tls;

pub use tcp::TcpTransport;
pub use tls::{TlsOptions, TlsTransport};

pub(crate) use tls::insecure_connector as tls_insecure_connector;

use crate::config::Config;
use async_trait::async_trait;
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// Deadline for underlying TCP connects
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("no IPv4 address found for {0}")]
    NoIpv4(String),

    #[error("unsupported transport mode: {0}")]
    UnsupportedMode(String),

    #[error("connection closed")]
    Closed,

    #[error("timeout")]
    Timeout,
}

/// A connected byte stream over some transport
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {
    fn local_addr(&self) -> String;
    fn remote_addr(&self) -> String;
}

/// Accepts inbound connections
#[async_trait]
pub trait Listener: Send {
    async fn accept(&mut self) -> Result<Box<dyn Connection>, TransportError>;
    fn local_addr(&self) -> String;
}

/// Uniform dial/listen surface over all transport modes
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to `host:port`
    async fn dial(&self, addr: &str) -> Result<Box<dyn Connection>, TransportError>;

    /// Bind a listener on `addr`
    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>, TransportError>;
}

/// Build the transport selected by configuration.
///
/// `tls` is the default mode; `raw` composes with KCP when `use_kcp` is
/// set (the bare raw-TCP mode is experimental, see [`raw`]).
pub fn from_config(cfg: &Config) -> Result<Box<dyn Transport>, TransportError> {
    match cfg.transport.mode.as_str() {
        "kcp" => Ok(Box::new(kcp::KcpTransport::new(&cfg.transport.kcp)?)),
        "raw" => {
            if cfg.transport.raw.use_kcp {
                Ok(Box::new(raw_kcp::RawKcpTransport::new(&cfg.transport.raw)?))
            } else {
                Ok(Box::new(raw::RawTransport::new(&cfg.transport.raw)?))
            }
        }
        "tcp" => Ok(Box::new(TcpTransport::new())),
        "tls" | "" => Ok(Box::new(TlsTransport::new(TlsOptions::from_config(cfg)))),
        other => Err(TransportError::UnsupportedMode(other.to_string())),
    }
}

/// Resolve `host:port` to an IPv4 socket address; AAAA records are ignored
pub async fn resolve_ipv4(addr: &str) -> Result<SocketAddrV4, TransportError> {
    let mut addrs = tokio::net::lookup_host(addr)
        .await
        .map_err(|e| TransportError::ConnectionFailed(format!("resolve {addr}: {e}")))?;
    addrs
        .find_map(|a| match a {
            SocketAddr::V4(v4) => Some(v4),
            SocketAddr::V6(_) => None,
        })
        .ok_or_else(|| TransportError::NoIpv4(addr.to_string()))
}

/// Dial a plain IPv4 TCP connection with the standard connect deadline
pub async fn dial_tcp4(addr: &str) -> Result<TcpStream, TransportError> {
    let target = resolve_ipv4(addr).await?;
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(target))
        .await
        .map_err(|_| TransportError::Timeout)??;
    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// Adapts any byte stream into a [`Connection`] by pinning its addresses
/// at creation time
pub(crate) struct ConnWrapper<S> {
    io: S,
    local: String,
    remote: String,
}

impl<S> ConnWrapper<S> {
    pub(crate) fn new(io: S, local: String, remote: String) -> Self {
        Self { io, local, remote }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ConnWrapper<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ConnWrapper<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin> Connection for ConnWrapper<S> {
    fn local_addr(&self) -> String {
        self.local.clone()
    }

    fn remote_addr(&self) -> String {
        self.remote.clone()
    }
}
