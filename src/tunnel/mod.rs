//! Tunnel record layer
//!
//! Composes padding and AEAD sealing over one bidirectional byte stream.
//! Every logical message travels as one record:
//!
//! ```text
//! u32be wire_length (≤ 1 MiB)
//!   24-byte nonce
//!   AEAD ciphertext of: u16be payload_length || payload || padding
//! ```
//!
//! The layer is message-oriented in both directions: a read returns one
//! whole record and truncates silently if the caller's buffer is smaller
//! (upstream readers supply 32 KiB buffers).

use crate::crypto::{CryptoError, RecordCipher};
use crate::obfuscation::{ObfuscationConfig, Padder, TimingObfuscator};
use crate::MAX_RECORD_SIZE;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

/// Buffer size for splice copy loops
pub const SPLICE_BUF_SIZE: usize = 32 * 1024;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("record too large: {0} bytes")]
    OversizedRecord(usize),

    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("tunnel closed")]
    Closed,
}

/// Tunnel lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TunnelState {
    Open = 0,
    Closing = 1,
    Closed = 2,
}

struct WriteHalf {
    io: Box<dyn AsyncWrite + Send + Unpin>,
    cipher: RecordCipher,
    padder: Padder,
    timing: TimingObfuscator,
}

struct ReadHalf {
    io: Box<dyn AsyncRead + Send + Unpin>,
    cipher: RecordCipher,
    padder: Padder,
}

/// An encrypted, obfuscated message channel over one connection.
///
/// Safe for concurrent use: writes are serialised by one mutex (so nonces
/// are consumed in counter order and records never interleave), reads by
/// another, and the two directions proceed independently.
pub struct Tunnel {
    write: Mutex<WriteHalf>,
    read: Mutex<ReadHalf>,
    state: AtomicU8,
}

impl Tunnel {
    /// Wrap a connected byte stream with the record layer.
    ///
    /// Fails if the key is not 32 bytes.
    pub fn new<C>(conn: C, key: &[u8], obfs: ObfuscationConfig) -> Result<Self, TunnelError>
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let cipher = RecordCipher::new(key)?;
        let padder = Padder::new(obfs.padding);
        let (read_io, write_io) = tokio::io::split(conn);

        Ok(Self {
            write: Mutex::new(WriteHalf {
                io: Box::new(write_io),
                cipher: cipher.clone(),
                padder: padder.clone(),
                timing: TimingObfuscator::new(obfs.timing),
            }),
            read: Mutex::new(ReadHalf {
                io: Box::new(read_io),
                cipher,
                padder,
            }),
            state: AtomicU8::new(TunnelState::Open as u8),
        })
    }

    /// Current lifecycle state
    pub fn state(&self) -> TunnelState {
        match self.state.load(Ordering::Acquire) {
            0 => TunnelState::Open,
            1 => TunnelState::Closing,
            _ => TunnelState::Closed,
        }
    }

    fn check_open(&self) -> Result<(), TunnelError> {
        if self.state() != TunnelState::Open {
            return Err(TunnelError::Closed);
        }
        Ok(())
    }

    /// Send one payload as a single record.
    ///
    /// Returns the payload length on success. The length prefix and the
    /// sealed record go out in one socket write.
    pub async fn write(&self, payload: &[u8]) -> Result<usize, TunnelError> {
        self.check_open()?;
        if payload.len() > u16::MAX as usize {
            return Err(TunnelError::PayloadTooLarge(payload.len()));
        }

        let mut half = self.write.lock().await;
        self.check_open()?;

        let framed = half.padder.pad(payload);
        let wire = half.cipher.seal(&framed)?;

        half.timing.jitter().await;

        let mut packet = Vec::with_capacity(4 + wire.len());
        packet.extend_from_slice(&(wire.len() as u32).to_be_bytes());
        packet.extend_from_slice(&wire);
        half.io.write_all(&packet).await?;
        half.io.flush().await?;

        Ok(payload.len())
    }

    /// Receive one record into `buf`, returning the bytes copied.
    ///
    /// A length field above 1 MiB is fatal and rejected before any buffer
    /// is allocated or further bytes read. Decryption failure is fatal.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        self.check_open()?;
        let mut half = self.read.lock().await;
        self.check_open()?;

        let mut len_buf = [0u8; 4];
        half.io.read_exact(&mut len_buf).await?;
        let wire_len = u32::from_be_bytes(len_buf) as usize;
        if wire_len > MAX_RECORD_SIZE {
            return Err(TunnelError::OversizedRecord(wire_len));
        }

        let mut wire = vec![0u8; wire_len];
        half.io.read_exact(&mut wire).await?;

        let framed = half.cipher.open(&wire)?;
        let payload = half.padder.unpad(&framed);
        let n = payload.len().min(buf.len());
        buf[..n].copy_from_slice(&payload[..n]);
        Ok(n)
    }

    /// Close the tunnel. Idempotent; subsequent reads and writes return
    /// [`TunnelError::Closed`].
    pub async fn close(&self) {
        let prev = self
            .state
            .swap(TunnelState::Closing as u8, Ordering::AcqRel);
        if prev != TunnelState::Open as u8 {
            self.state.store(TunnelState::Closed as u8, Ordering::Release);
            return;
        }
        let mut half = self.write.lock().await;
        let _ = half.io.shutdown().await;
        self.state.store(TunnelState::Closed as u8, Ordering::Release);
    }
}

/// Copy bytes both ways between a tunnel and a plain stream.
///
/// Either copy loop ending tears the stream down: the other loop is
/// cancelled and the stream's write half is shut down. The tunnel is
/// left open (it may be shared by other sessions).
pub async fn splice<S>(tunnel: Arc<Tunnel>, stream: S)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut stream_rd, stream_wr) = tokio::io::split(stream);
    let stream_wr = Arc::new(tokio::sync::Mutex::new(stream_wr));

    let up_tunnel = Arc::clone(&tunnel);
    let mut upstream = tokio::spawn(async move {
        let mut buf = vec![0u8; SPLICE_BUF_SIZE];
        loop {
            match stream_rd.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if up_tunnel.write(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let down_wr = Arc::clone(&stream_wr);
    let mut downstream = tokio::spawn(async move {
        let mut buf = vec![0u8; SPLICE_BUF_SIZE];
        loop {
            match tunnel.read(&mut buf).await {
                Err(_) => break,
                Ok(0) => continue,
                Ok(n) => {
                    if down_wr.lock().await.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    tokio::select! {
        _ = &mut upstream => downstream.abort(),
        _ = &mut downstream => upstream.abort(),
    }
    let _ = stream_wr.lock().await.shutdown().await;
    debug!("splice finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KEY_LEN;

    fn test_pair() -> (Tunnel, Tunnel) {
        let key = [0u8; KEY_LEN];
        let (a, b) = tokio::io::duplex(1024 * 1024 * 4);
        let client = Tunnel::new(a, &key, ObfuscationConfig::disabled()).unwrap();
        let server = Tunnel::new(b, &key, ObfuscationConfig::disabled()).unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let (client, server) = test_pair();

        let sent = client.write(b"ping").await.unwrap();
        assert_eq!(sent, 4);

        let mut buf = [0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[tokio::test]
    async fn test_records_are_message_oriented() {
        let (client, server) = test_pair();

        client.write(b"first").await.unwrap();
        client.write(b"second").await.unwrap();

        let mut buf = [0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"first");
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"second");
    }

    #[tokio::test]
    async fn test_roundtrip_with_padding() {
        let key = [7u8; KEY_LEN];
        let (a, b) = tokio::io::duplex(1024 * 1024 * 4);
        let mut obfs = ObfuscationConfig::disabled();
        obfs.padding.enabled = true;
        let client = Tunnel::new(a, &key, obfs.clone()).unwrap();
        let server = Tunnel::new(b, &key, obfs).unwrap();

        let payload = vec![0xabu8; 1000];
        client.write(&payload).await.unwrap();
        let mut buf = vec![0u8; 2048];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &payload[..]);
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let key = [0u8; KEY_LEN];
        let (a, mut b) = tokio::io::duplex(1024);
        let tunnel = Tunnel::new(a, &key, ObfuscationConfig::disabled()).unwrap();

        // 2 MiB declared length followed by bytes that must never be read
        b.write_all(&[0x00, 0x20, 0x00, 0x00]).await.unwrap();
        b.write_all(&[0xff; 16]).await.unwrap();

        let mut buf = [0u8; 64];
        match tunnel.read(&mut buf).await {
            Err(TunnelError::OversizedRecord(n)) => assert_eq!(n, 0x0020_0000),
            other => panic!("expected oversized error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wrong_key_is_fatal() {
        let (a, b) = tokio::io::duplex(1024 * 1024);
        let client = Tunnel::new(a, &[0u8; KEY_LEN], ObfuscationConfig::disabled()).unwrap();
        let server = Tunnel::new(b, &[1u8; KEY_LEN], ObfuscationConfig::disabled()).unwrap();

        client.write(b"secret").await.unwrap();
        let mut buf = [0u8; 64];
        assert!(matches!(
            server.read(&mut buf).await,
            Err(TunnelError::Crypto(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_tunnel_rejects_io() {
        let (client, _server) = test_pair();

        client.close().await;
        assert_eq!(client.state(), TunnelState::Closed);

        let mut buf = [0u8; 8];
        assert!(matches!(client.read(&mut buf).await, Err(TunnelError::Closed)));
        assert!(matches!(client.write(b"x").await, Err(TunnelError::Closed)));

        // Close is idempotent
        client.close().await;
        assert_eq!(client.state(), TunnelState::Closed);
    }

    #[tokio::test]
    async fn test_payload_too_large() {
        let (client, _server) = test_pair();
        let huge = vec![0u8; u16::MAX as usize + 1];
        assert!(matches!(
            client.write(&huge).await,
            Err(TunnelError::PayloadTooLarge(_))
        ));
    }
}
