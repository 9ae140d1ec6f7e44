//! Configuration management
//!
//! YAML documents with a `mode`, a transport section and per-endpoint
//! server/client sections. Keys the deployed fleet already uses keep
//! their exact names.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// `server` or `client`
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(&path)
            .map_err(|e| crate::Error::Config(format!("failed to read config: {e}")))?;
        serde_yaml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("failed to parse config: {e}")))
    }

    /// Save configuration to a YAML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = serde_yaml::to_string(self)
            .map_err(|e| crate::Error::Config(format!("failed to serialize config: {e}")))?;
        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("failed to write config: {e}")))
    }
}

/// Transport selection and per-mode tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// `tls` (default), `kcp`, `raw` or `tcp`
    #[serde(default = "default_transport_mode")]
    pub mode: String,
    #[serde(default)]
    pub tls: TlsTransportConfig,
    #[serde(default)]
    pub kcp: KcpConfig,
    #[serde(default)]
    pub raw: RawConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mode: default_transport_mode(),
            tls: TlsTransportConfig::default(),
            kcp: KcpConfig::default(),
            raw: RawConfig::default(),
        }
    }
}

fn default_transport_mode() -> String {
    "tls".to_string()
}

/// TLS-mode obfuscation defaults (per-endpoint flags take precedence)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsTransportConfig {
    #[serde(default = "default_true")]
    pub fragment: bool,
    #[serde(default = "default_true")]
    pub padding: bool,
    #[serde(default = "default_true")]
    pub timing_jitter: bool,
}

impl Default for TlsTransportConfig {
    fn default() -> Self {
        Self {
            fragment: true,
            padding: true,
            timing_jitter: true,
        }
    }
}

/// KCP transport tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KcpConfig {
    /// Passphrase for the datagram key
    #[serde(default)]
    pub key: String,
    /// Key-derivation salt; the protocol default applies when empty
    #[serde(default)]
    pub salt: String,
    /// `normal`, `fast`, `fast2` (default) or `fast3`
    #[serde(default = "default_kcp_mode")]
    pub mode: String,
    #[serde(default = "default_data_shards")]
    pub data_shards: usize,
    #[serde(default = "default_parity_shards")]
    pub parity_shards: usize,
}

impl Default for KcpConfig {
    fn default() -> Self {
        Self {
            key: String::new(),
            salt: String::new(),
            mode: default_kcp_mode(),
            data_shards: default_data_shards(),
            parity_shards: default_parity_shards(),
        }
    }
}

fn default_kcp_mode() -> String {
    "fast2".to_string()
}

fn default_data_shards() -> usize {
    10
}

fn default_parity_shards() -> usize {
    3
}

/// Raw-packet transport addressing
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RawConfig {
    /// Interface name (eth0, en0, ...)
    #[serde(default)]
    pub interface: String,
    /// Local IPv4 address on that interface
    #[serde(default)]
    pub local_ip: String,
    /// Default gateway MAC
    #[serde(default)]
    pub router_mac: String,
    /// Local MAC; auto-detected from the interface when empty
    #[serde(default)]
    pub local_mac: String,
    /// Run KCP on top of raw packets (the supported composition)
    #[serde(default = "default_true")]
    pub use_kcp: bool,
}

/// Server endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Base64 32-byte shared key
    #[serde(default)]
    pub key: String,
    /// Hostname on the presented certificate
    #[serde(default = "default_cover_site")]
    pub fake_site: String,
    /// Deflect unauthenticated peers to the fallback site
    #[serde(default = "default_true")]
    pub probe_resist: bool,
    /// HTTPS host probers are spliced to; `fake_site` applies when empty
    #[serde(default)]
    pub fallback_site: String,
    #[serde(default = "default_true")]
    pub fragment: bool,
    #[serde(default = "default_true")]
    pub padding: bool,
    #[serde(default = "default_true")]
    pub timing_jitter: bool,
    /// PEM certificate path; self-signed when absent
    #[serde(default)]
    pub tls_cert: Option<String>,
    /// PEM private key path
    #[serde(default)]
    pub tls_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            key: String::new(),
            fake_site: default_cover_site(),
            probe_resist: true,
            fallback_site: String::new(),
            fragment: true,
            padding: true,
            timing_jitter: true,
            tls_cert: None,
            tls_key: None,
        }
    }
}

/// Client endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server `host:port`
    #[serde(default)]
    pub server_addr: String,
    /// Base64 32-byte shared key
    #[serde(default)]
    pub key: String,
    /// SNI presented in the ClientHello
    #[serde(default = "default_cover_site")]
    pub fake_sni: String,
    /// Local SOCKS5 listener
    #[serde(default = "default_socks_addr")]
    pub socks_addr: String,
    #[serde(default = "default_true")]
    pub fragment: bool,
    #[serde(default = "default_true")]
    pub padding: bool,
    #[serde(default = "default_true")]
    pub timing_jitter: bool,
    /// TLS fingerprint profile name (accepted for compatibility)
    #[serde(default = "default_fingerprint")]
    pub fingerprint: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: String::new(),
            key: String::new(),
            fake_sni: default_cover_site(),
            socks_addr: default_socks_addr(),
            fragment: true,
            padding: true,
            timing_jitter: true,
            fingerprint: default_fingerprint(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_listen() -> String {
    "0.0.0.0:443".to_string()
}

fn default_cover_site() -> String {
    "www.microsoft.com".to_string()
}

fn default_socks_addr() -> String {
    "127.0.0.1:1080".to_string()
}

fn default_fingerprint() -> String {
    "chrome".to_string()
}

impl ServerConfig {
    /// Decode the shared key
    pub fn key_bytes(&self) -> Result<[u8; 32], crate::Error> {
        Ok(crate::crypto::key_from_base64(&self.key)?)
    }

    /// Site probers are deflected to
    pub fn fallback(&self) -> &str {
        if self.fallback_site.is_empty() {
            &self.fake_site
        } else {
            &self.fallback_site
        }
    }
}

impl ClientConfig {
    /// Decode the shared key
    pub fn key_bytes(&self) -> Result<[u8; 32], crate::Error> {
        Ok(crate::crypto::key_from_base64(&self.key)?)
    }
}

/// Render a commented example configuration for `--genconfig`
pub fn example_config(mode: &str) -> String {
    if mode == "server" {
        return r#"# XP Tunnel Server Configuration
mode: server

server:
  listen: "0.0.0.0:443"
  key: "YOUR_BASE64_KEY_HERE"
  fake_site: "www.microsoft.com"
  probe_resist: true
  fallback_site: "www.microsoft.com"
  fragment: true
  padding: true
  timing_jitter: true
"#
        .to_string();
    }
    r#"# XP Tunnel Client Configuration
mode: client

client:
  server_addr: "your-server.com:443"
  key: "YOUR_BASE64_KEY_HERE"
  fake_sni: "www.microsoft.com"
  socks_addr: "127.0.0.1:1080"
  fragment: true
  padding: true
  timing_jitter: true
  fingerprint: "chrome"
"#
    .to_string()
}
