//! Server-side tunnel dispatcher
//!
//! Each accepted transport connection carries one command session: the
//! first record is a CONNECT command frame, the server dials the target
//! and splices. The first record is read *before* a tunnel is
//! constructed so that an unauthenticated peer (an active prober) can
//! be deflected to a real HTTPS site instead of receiving a protocol
//! error.

use crate::crypto::RecordCipher;
use crate::obfuscation::{ObfuscationConfig, Padder};
use crate::protocol::{Command, ProtocolError, STATUS_FAILED, STATUS_OK};
use crate::transport;
use crate::tunnel::{splice, Tunnel, TunnelError, SPLICE_BUF_SIZE};
use crate::MAX_RECORD_SIZE;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Per-server settings shared by all connection handlers
#[derive(Clone)]
pub struct ServerSettings {
    /// Shared 32-byte tunnel key
    pub key: [u8; 32],
    /// Obfuscation applied to server-sent records
    pub obfs: ObfuscationConfig,
    /// Deflect unauthenticated peers instead of dropping them
    pub probe_resist: bool,
    /// HTTPS host probers are spliced to (port 443)
    pub fallback_site: String,
}

/// Handle one accepted connection through its whole life.
///
/// Errors are for the caller's log; the accept loop must keep running
/// regardless.
pub async fn handle_connection<C>(
    mut conn: C,
    peer: String,
    settings: Arc<ServerSettings>,
) -> Result<(), crate::Error>
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    // Pre-read the first record: decryption failure here means the peer
    // does not hold the key.
    let mut consumed = Vec::new();
    let first = match read_first_record(&mut conn, &settings, &mut consumed).await {
        Ok(frame) => frame,
        Err(e) => {
            if settings.probe_resist && !settings.fallback_site.is_empty() {
                info!("[{}] unauthenticated peer, proxying to cover site", peer);
                deflect_probe(conn, &consumed, &settings.fallback_site).await;
                return Ok(());
            }
            return Err(e.into());
        }
    };

    let tunnel = Arc::new(Tunnel::new(conn, &settings.key, settings.obfs.clone())?);

    let mut frame = first;
    loop {
        match Command::parse(&frame) {
            Ok(Command::Connect(target)) => {
                info!("[{}] CONNECT {}", peer, target);
                return handle_connect(tunnel, &peer, &target).await;
            }
            Err(ProtocolError::EmptyFrame) => {}
            Err(e) => warn!("[{}] dropping bad command frame: {}", peer, e),
        }

        let mut buf = vec![0u8; SPLICE_BUF_SIZE];
        let n = tunnel.read(&mut buf).await?;
        buf.truncate(n);
        frame = buf;
    }
}

async fn handle_connect(
    tunnel: Arc<Tunnel>,
    peer: &str,
    target: &str,
) -> Result<(), crate::Error> {
    let stream = match transport::dial_tcp4(target).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("[{}] dial {} failed: {}", peer, target, e);
            tunnel.write(&[STATUS_FAILED]).await?;
            tunnel.close().await;
            return Ok(());
        }
    };

    tunnel.write(&[STATUS_OK]).await?;
    debug!("[{}] connected to {}", peer, target);

    splice(tunnel, stream).await;
    info!("[{}] session to {} ended", peer, target);
    Ok(())
}

/// Read and open the first record directly off the connection, recording
/// every consumed byte so a failed open can be replayed to the cover
/// site.
async fn read_first_record<C>(
    conn: &mut C,
    settings: &ServerSettings,
    consumed: &mut Vec<u8>,
) -> Result<Vec<u8>, TunnelError>
where
    C: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    conn.read_exact(&mut len_buf).await?;
    consumed.extend_from_slice(&len_buf);

    let wire_len = u32::from_be_bytes(len_buf) as usize;
    if wire_len > MAX_RECORD_SIZE {
        return Err(TunnelError::OversizedRecord(wire_len));
    }

    let mut wire = vec![0u8; wire_len];
    conn.read_exact(&mut wire).await?;
    consumed.extend_from_slice(&wire);

    let opener = RecordCipher::new(&settings.key)?;
    let framed = opener.open(&wire)?;
    Ok(Padder::new(settings.obfs.padding).unpad(&framed).to_vec())
}

/// Blind-splice an unauthenticated peer to `site:443`, replaying the
/// bytes already consumed, so a prober sees the cover site's behavior.
async fn deflect_probe<C>(mut conn: C, consumed: &[u8], site: &str)
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let upstream = match transport::dial_tcp4(&format!("{site}:443")).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("cover site {} unreachable: {}", site, e);
            return;
        }
    };

    let server_name = match rustls::pki_types::ServerName::try_from(site.to_string()) {
        Ok(name) => name,
        Err(_) => return,
    };
    let connector = transport::tls_insecure_connector();
    let mut upstream = match connector.connect(server_name, upstream).await {
        Ok(tls) => tls,
        Err(e) => {
            warn!("cover site {} TLS failed: {}", site, e);
            return;
        }
    };

    if !consumed.is_empty() && upstream.write_all(consumed).await.is_err() {
        return;
    }
    let _ = tokio::io::copy_bidirectional(&mut conn, &mut upstream).await;
}
