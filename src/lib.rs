//! # XP Tunnel
//!
//! A censorship-circumventing tunnel designed to survive deep packet
//! inspection in highly restricted network environments.
//!
//! ## Features
//!
//! - **Authenticated encryption** with XChaCha20-Poly1305 over a shared key
//! - **TLS camouflage** with fake SNI and ClientHello fragmentation
//! - **Traffic obfuscation** with random padding and HTTP-like timing
//! - **Multiple transports**: TCP/TLS, KCP over UDP, raw userland packets
//! - **SOCKS5** proxy ingress
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Application Layer                    │
//! │              (browser via SOCKS5 proxy)              │
//! ├─────────────────────────────────────────────────────┤
//! │                   Tunnel Layer                       │
//! │      (padding, AEAD records, timing jitter)          │
//! ├─────────────────────────────────────────────────────┤
//! │                  Transport Layer                     │
//! │  (TLS + fragmentation, KCP + FEC + mux, raw packets) │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod crypto;
pub mod obfuscation;
pub mod protocol;
pub mod proxy;
pub mod server;
pub mod transport;
pub mod tunnel;
pub mod uri;

pub use config::Config;

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum encrypted record length on the wire (1 MiB)
pub const MAX_RECORD_SIZE: usize = 1024 * 1024;

/// Default server port
pub const DEFAULT_PORT: u16 = 443;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout")]
    Timeout,
}
