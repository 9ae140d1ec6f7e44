//! SOCKS5 proxy ingress (RFC 1928 subset)
//!
//! No-auth only, CONNECT only. Each accepted client is handed to the
//! shared tunnel: the target address travels as a command frame, the
//! server's status record becomes the SOCKS reply, and the connection is
//! then spliced.

use super::{Address, ProxyError};
use crate::protocol::{Command, STATUS_OK};
use crate::tunnel::{splice, Tunnel};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// SOCKS5 version byte
const SOCKS_VERSION: u8 = 0x05;

/// No-authentication method
const AUTH_NONE: u8 = 0x00;

/// CONNECT command
const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Reply codes
const REP_SUCCESS: u8 = 0x00;
const REP_SERVER_FAILURE: u8 = 0x01;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// SOCKS5 proxy server bound to a shared tunnel.
///
/// The tunnel reference is snapshotted per request, so it can be swapped
/// while the server runs (e.g. after a reconnect).
pub struct Socks5Server {
    listener: TcpListener,
    tunnel: Arc<Mutex<Option<Arc<Tunnel>>>>,
}

impl Socks5Server {
    /// Bind the local listener
    pub async fn bind(addr: &str) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr).await?;
        info!("SOCKS5 server listening on {}", addr);
        Ok(Self {
            listener,
            tunnel: Arc::new(Mutex::new(None)),
        })
    }

    /// Address the listener actually bound to
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Install or replace the tunnel used for new sessions
    pub async fn set_tunnel(&self, tunnel: Arc<Tunnel>) {
        *self.tunnel.lock().await = Some(tunnel);
    }

    /// Accept clients until the task is dropped. Per-connection failures
    /// are logged and swallowed so one bad client cannot kill the
    /// listener.
    pub async fn run(&self) -> Result<(), ProxyError> {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("SOCKS5 accept error: {}", e);
                    continue;
                }
            };
            debug!("SOCKS5 connection from {}", peer);

            let tunnel = Arc::clone(&self.tunnel);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, tunnel).await {
                    debug!("SOCKS5 session from {} ended: {}", peer, e);
                }
            });
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    tunnel: Arc<Mutex<Option<Arc<Tunnel>>>>,
) -> Result<(), ProxyError> {
    let mut buf = [0u8; 262];

    // Greeting: VER NMETHODS METHODS...
    stream.read_exact(&mut buf[..2]).await?;
    if buf[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(buf[0]));
    }
    let nmethods = buf[1] as usize;
    stream.read_exact(&mut buf[..nmethods]).await?;
    stream.write_all(&[SOCKS_VERSION, AUTH_NONE]).await?;

    // Request: VER CMD RSV ATYP ...
    stream.read_exact(&mut buf[..4]).await?;
    if buf[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(buf[0]));
    }
    if buf[1] != CMD_CONNECT {
        send_reply(&mut stream, REP_CMD_NOT_SUPPORTED).await?;
        return Err(ProxyError::UnsupportedCommand(buf[1]));
    }

    let address = match buf[3] {
        ATYP_IPV4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            let port = read_port(&mut stream).await?;
            Address::Ipv4(ip, port)
        }
        ATYP_DOMAIN => {
            stream.read_exact(&mut buf[..1]).await?;
            let len = buf[0] as usize;
            stream.read_exact(&mut buf[..len]).await?;
            let domain = String::from_utf8_lossy(&buf[..len]).to_string();
            let port = read_port(&mut stream).await?;
            Address::Domain(domain, port)
        }
        ATYP_IPV6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            let port = read_port(&mut stream).await?;
            Address::Ipv6(ip, port)
        }
        other => {
            send_reply(&mut stream, REP_ATYP_NOT_SUPPORTED).await?;
            return Err(ProxyError::UnsupportedAddressType(other));
        }
    };

    let target = address.to_string();
    debug!("SOCKS5 CONNECT to {} via tunnel", target);

    // Snapshot the current tunnel
    let tun = match tunnel.lock().await.clone() {
        Some(tun) => tun,
        None => {
            send_reply(&mut stream, REP_SERVER_FAILURE).await?;
            return Err(ProxyError::NoTunnel);
        }
    };

    // One command frame out, one status record back
    let frame = Command::Connect(target.clone()).encode();
    if tun.write(&frame).await.is_err() {
        send_reply(&mut stream, REP_SERVER_FAILURE).await?;
        return Err(ProxyError::NoTunnel);
    }

    let mut status = [0u8; 1024];
    match tun.read(&mut status).await {
        Ok(n) if n >= 1 => {}
        _ => {
            send_reply(&mut stream, REP_SERVER_FAILURE).await?;
            return Err(ProxyError::NoTunnel);
        }
    }

    if status[0] != STATUS_OK {
        send_reply(&mut stream, REP_SERVER_FAILURE).await?;
        return Err(ProxyError::RemoteDialFailed(status[0]));
    }

    send_reply(&mut stream, REP_SUCCESS).await?;
    info!("SOCKS5 session established to {}", target);

    splice(tun, stream).await;
    Ok(())
}

async fn read_port(stream: &mut TcpStream) -> Result<u16, ProxyError> {
    let mut port_buf = [0u8; 2];
    stream.read_exact(&mut port_buf).await?;
    Ok(u16::from_be_bytes(port_buf))
}

/// Fixed 10-byte reply: VER REP RSV ATYP=IPv4 BND.ADDR=0.0.0.0 BND.PORT=0
async fn send_reply(stream: &mut TcpStream, rep: u8) -> Result<(), ProxyError> {
    stream
        .write_all(&[SOCKS_VERSION, rep, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok(())
}
