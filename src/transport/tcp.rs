//! Plain TCP transport (for testing and trusted networks)

use super::{dial_tcp4, ConnWrapper, Connection, Listener, Transport, TransportError};
use async_trait::async_trait;
use tokio::net::TcpListener;

/// Plain IPv4 TCP transport, no camouflage
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn dial(&self, addr: &str) -> Result<Box<dyn Connection>, TransportError> {
        let stream = dial_tcp4(addr).await?;
        let local = stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let remote = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        Ok(Box::new(ConnWrapper::new(stream, local, remote)))
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Box::new(TcpListenerWrapper { listener }))
    }
}

struct TcpListenerWrapper {
    listener: TcpListener,
}

#[async_trait]
impl Listener for TcpListenerWrapper {
    async fn accept(&mut self) -> Result<Box<dyn Connection>, TransportError> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true).ok();
        let local = stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        Ok(Box::new(ConnWrapper::new(stream, local, peer.to_string())))
    }

    fn local_addr(&self) -> String {
        self.listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default()
    }
}
