//! TLS transport with fake SNI and ClientHello fragmentation
//!
//! The camouflage model: the client completes a real TLS handshake with
//! the tunnel server while presenting an arbitrary cover hostname as SNI,
//! and the first flight is fragmented at the TCP level so SNI filters
//! cannot cheaply reassemble it. Certificate verification is disabled:
//! the server presents a throwaway certificate and the actual
//! authentication is the tunnel's shared key.

use super::{dial_tcp4, ConnWrapper, Connection, Listener, Transport, TransportError, CONNECT_TIMEOUT};
use crate::config::Config;
use crate::obfuscation::FragmentingStream;
use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use std::io::BufReader;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

/// TLS transport options, pulled from both config sections so one
/// transport object serves either role
#[derive(Debug, Clone)]
pub struct TlsOptions {
    /// SNI presented in the ClientHello (client role)
    pub sni: String,
    /// Fragment the ClientHello across TCP segments (client role)
    pub fragment: bool,
    /// Hostname on the self-signed certificate (server role)
    pub cert_hostname: String,
    /// PEM certificate/key paths; a self-signed pair is generated when
    /// absent (server role)
    pub cert_pem: Option<(String, String)>,
}

impl TlsOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            sni: cfg.client.fake_sni.clone(),
            fragment: cfg.client.fragment,
            cert_hostname: cfg.server.fake_site.clone(),
            cert_pem: match (&cfg.server.tls_cert, &cfg.server.tls_key) {
                (Some(cert), Some(key)) => Some((cert.clone(), key.clone())),
                _ => None,
            },
        }
    }
}

/// TLS transport (default mode)
pub struct TlsTransport {
    options: TlsOptions,
    connector: TlsConnector,
}

impl TlsTransport {
    pub fn new(options: TlsOptions) -> Self {
        Self {
            options,
            connector: insecure_connector(),
        }
    }
}

#[async_trait]
impl Transport for TlsTransport {
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

        let sni = if self.options.sni.is_empty() {
            addr.rsplit_once(':')
                .map(|(host, _)| host.to_string())
                .unwrap_or_else(|| addr.to_string())
        } else {
            self.options.sni.clone()
        };
        let server_name = ServerName::try_from(sni.clone())
            .map_err(|e| TransportError::Tls(format!("invalid SNI '{sni}': {e}")))?;

        // The ClientHello is the first write on the socket, so wrapping
        // here is all the fragmenter needs.
        if self.options.fragment {
            debug!("fragmenting TLS ClientHello (SNI: {})", sni);
            let fragmented = FragmentingStream::new(stream);
            let tls = tokio::time::timeout(
                CONNECT_TIMEOUT,
                self.connector.connect(server_name, fragmented),
            )
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Tls(e.to_string()))?;
            Ok(Box::new(ConnWrapper::new(tls, local, remote)))
        } else {
            let tls = tokio::time::timeout(
                CONNECT_TIMEOUT,
                self.connector.connect(server_name, stream),
            )
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Tls(e.to_string()))?;
            Ok(Box::new(ConnWrapper::new(tls, local, remote)))
        }
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>, TransportError> {
        let server_config = match &self.options.cert_pem {
            Some((cert_path, key_path)) => load_server_config(cert_path, key_path)?,
            None => self_signed_config(&self.options.cert_hostname)?,
        };
        let listener = TcpListener::bind(addr).await?;
        Ok(Box::new(TlsListenerWrapper {
            listener,
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
        }))
    }
}

struct TlsListenerWrapper {
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

#[async_trait]
impl Listener for TlsListenerWrapper {
    async fn accept(&mut self) -> Result<Box<dyn Connection>, TransportError> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true).ok();
        let local = stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let tls = self
            .acceptor
            .accept(stream)
            .await
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        Ok(Box::new(ConnWrapper::new(tls, local, peer.to_string())))
    }

    fn local_addr(&self) -> String {
        self.listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default()
    }
}

/// TLS connector that accepts any server certificate. The tunnel
/// authenticates with its shared key; the certificate is scenery.
pub(crate) fn insecure_connector() -> TlsConnector {
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

fn load_server_config(
    cert_path: &str,
    key_path: &str,
) -> Result<rustls::ServerConfig, TransportError> {
    let cert_file = std::fs::File::open(cert_path)
        .map_err(|e| TransportError::Tls(format!("open {cert_path}: {e}")))?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<_, _>>()
        .map_err(|e| TransportError::Tls(format!("parse {cert_path}: {e}")))?;

    let key_file = std::fs::File::open(key_path)
        .map_err(|e| TransportError::Tls(format!("open {key_path}: {e}")))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| TransportError::Tls(format!("parse {key_path}: {e}")))?
        .ok_or_else(|| TransportError::Tls(format!("no private key in {key_path}")))?;

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::Tls(e.to_string()))
}

fn self_signed_config(hostname: &str) -> Result<rustls::ServerConfig, TransportError> {
    let hostname = if hostname.is_empty() {
        "localhost".to_string()
    } else {
        hostname.to_string()
    };
    let cert = rcgen::generate_simple_self_signed(vec![hostname])
        .map_err(|e| TransportError::Tls(format!("generate certificate: {e}")))?;
    let cert_der = CertificateDer::from(
        cert.serialize_der()
            .map_err(|e| TransportError::Tls(format!("serialize certificate: {e}")))?,
    );
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.serialize_private_key_der()));

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .map_err(|e| TransportError::Tls(e.to_string()))
}

#[derive(Debug)]
struct NoCertificateVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_options() -> TlsOptions {
        TlsOptions {
            sni: "www.example.com".to_string(),
            fragment: false,
            cert_hostname: "www.example.com".to_string(),
            cert_pem: None,
        }
    }

    #[tokio::test]
    async fn test_tls_roundtrip_self_signed() {
        let transport = TlsTransport::new(test_options());
        let mut listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();

        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let mut buf = [0u8; 32];
            let n = conn.read(&mut buf).await.unwrap();
            conn.write_all(&buf[..n]).await.unwrap();
            conn.shutdown().await.ok();
        });

        let mut conn = transport.dial(&addr).await.unwrap();
        conn.write_all(b"over tls").await.unwrap();
        let mut buf = [0u8; 32];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"over tls");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_tls_roundtrip_fragmented_hello() {
        let mut options = test_options();
        options.fragment = true;
        let transport = TlsTransport::new(options);
        let mut listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();

        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let mut buf = [0u8; 32];
            let n = conn.read(&mut buf).await.unwrap();
            conn.write_all(&buf[..n]).await.unwrap();
            conn.shutdown().await.ok();
        });

        let mut conn = transport.dial(&addr).await.unwrap();
        conn.write_all(b"fragmented").await.unwrap();
        let mut buf = [0u8; 32];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"fragmented");

        server.await.unwrap();
    }
}
