//! Integration tests for XP Tunnel
//!
//! Exercises the full client-server pipeline in-process: SOCKS5 ingress,
//! command frames over the encrypted tunnel, server-side dialing and the
//! bidirectional splice, plus the obfuscation edges.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use xp_tunnel::crypto::{key_to_base64, RecordCipher, KEY_LEN};
use xp_tunnel::obfuscation::{Fragmenter, ObfuscationConfig, Padder, PaddingConfig};
use xp_tunnel::protocol::{Command, STATUS_OK};
use xp_tunnel::proxy::Socks5Server;
use xp_tunnel::server::{handle_connection, ServerSettings};
use xp_tunnel::tunnel::Tunnel;

const KEY: [u8; KEY_LEN] = [0u8; KEY_LEN];

fn plain_settings() -> Arc<ServerSettings> {
    Arc::new(ServerSettings {
        key: KEY,
        obfs: ObfuscationConfig::disabled(),
        probe_resist: false,
        fallback_site: String::new(),
    })
}

/// Spawn a loopback echo server that answers one connection
async fn spawn_echo() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut sock, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                while let Ok(n) = sock.read(&mut buf).await {
                    if n == 0 || sock.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

/// Wire a SOCKS5 ingress to an in-process dispatcher over a duplex pipe,
/// returning the SOCKS listener address
async fn spawn_pipeline(settings: Arc<ServerSettings>) -> std::net::SocketAddr {
    let (client_io, server_io) = tokio::io::duplex(1024 * 1024 * 4);
    tokio::spawn(handle_connection(server_io, "pipe".to_string(), settings));

    let tunnel = Arc::new(
        Tunnel::new(client_io, &KEY, ObfuscationConfig::disabled()).unwrap(),
    );
    let socks = Socks5Server::bind("127.0.0.1:0").await.unwrap();
    let addr = socks.local_addr().unwrap();
    socks.set_tunnel(tunnel).await;
    tokio::spawn(async move {
        let _ = socks.run().await;
    });
    addr
}

/// Perform the SOCKS5 greeting + CONNECT request, returning the stream
/// and the reply code
async fn socks_connect(addr: std::net::SocketAddr, request: &[u8]) -> (TcpStream, u8) {
    let mut stream = TcpStream::connect(addr).await.unwrap();

    // Greeting: version 5, one method, no-auth
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00], "greeting reply");

    stream.write_all(request).await.unwrap();
    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], 0x05);
    (stream, reply[1])
}

/// S1: padding/fragment/timing off, zero key, CONNECT through the whole
/// pipeline to a loopback echo
#[tokio::test]
async fn test_happy_path_end_to_end() {
    let echo = spawn_echo().await;
    let socks = spawn_pipeline(plain_settings()).await;

    // CONNECT with a domain-form address for the echo target
    let host = echo.ip().to_string();
    let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&echo.port().to_be_bytes());

    let (mut stream, rep) = socks_connect(socks, &request).await;
    assert_eq!(rep, 0x00, "CONNECT must succeed");

    stream.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
}

/// Same pipeline with padding and timing jitter enabled on both ends
#[tokio::test]
async fn test_end_to_end_with_obfuscation() {
    let echo = spawn_echo().await;

    let obfs = ObfuscationConfig::from_flags(false, true, true);
    let settings = Arc::new(ServerSettings {
        key: KEY,
        obfs: obfs.clone(),
        probe_resist: false,
        fallback_site: String::new(),
    });

    let (client_io, server_io) = tokio::io::duplex(1024 * 1024 * 4);
    tokio::spawn(handle_connection(server_io, "pipe".to_string(), settings));
    let tunnel = Arc::new(Tunnel::new(client_io, &KEY, obfs).unwrap());

    let frame = Command::Connect(echo.to_string()).encode();
    tunnel.write(&frame).await.unwrap();
    let mut buf = [0u8; 64];
    let n = tunnel.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], &[STATUS_OK]);

    tunnel.write(b"padded ping").await.unwrap();
    let n = tunnel.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"padded ping");
}

/// S4: IPv6 CONNECT produces the command frame `0x01 "::1:8443"`
#[tokio::test]
async fn test_socks5_ipv6_command_frame() {
    let (client_io, server_io) = tokio::io::duplex(1024 * 1024);
    let far = Tunnel::new(server_io, &KEY, ObfuscationConfig::disabled()).unwrap();
    let tunnel = Arc::new(
        Tunnel::new(client_io, &KEY, ObfuscationConfig::disabled()).unwrap(),
    );

    let socks = Socks5Server::bind("127.0.0.1:0").await.unwrap();
    let addr = socks.local_addr().unwrap();
    socks.set_tunnel(tunnel).await;
    tokio::spawn(async move {
        let _ = socks.run().await;
    });

    let checker = tokio::spawn(async move {
        let mut buf = [0u8; 256];
        let n = far.read(&mut buf).await.unwrap();
        let mut expected = vec![0x01];
        expected.extend_from_slice(b"::1:8443");
        assert_eq!(&buf[..n], &expected[..], "command frame bytes");
        far.write(&[STATUS_OK]).await.unwrap();
    });

    let mut request = vec![0x05, 0x01, 0x00, 0x04];
    let mut v6 = [0u8; 16];
    v6[15] = 1;
    request.extend_from_slice(&v6);
    request.extend_from_slice(&8443u16.to_be_bytes());

    let (_stream, rep) = socks_connect(addr, &request).await;
    assert_eq!(rep, 0x00);
    checker.await.unwrap();
}

/// S5: target refuses the connection; the SOCKS client sees REP 0x01 and
/// the socket closes
#[tokio::test]
async fn test_refused_target_reports_failure() {
    let socks = spawn_pipeline(plain_settings()).await;

    // Nothing listens on loopback port 1
    let request = [
        0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x01,
    ];
    let (mut stream, rep) = socks_connect(socks, &request).await;
    assert_eq!(rep, 0x01, "dial failure maps to general failure");

    // Socket closes after the failure reply
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("socket should close")
        .unwrap();
    assert_eq!(n, 0);
}

/// Unsupported SOCKS command gets REP 0x07
#[tokio::test]
async fn test_socks5_rejects_bind() {
    let socks = spawn_pipeline(plain_settings()).await;

    // BIND request
    let request = [
        0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0x1f, 0x90,
    ];
    let (_stream, rep) = socks_connect(socks, &request).await;
    assert_eq!(rep, 0x07);
}

/// S3: with padding on, sealed record sizes spread across the whole
/// trailer range
#[test]
fn test_padding_distribution() {
    let padder = Padder::new(PaddingConfig::default());
    let mut cipher = RecordCipher::new(&KEY).unwrap();

    let baseline = cipher.seal(&{
        let p = Padder::new(PaddingConfig::disabled());
        p.pad(b"A")
    })
    .unwrap()
    .len();

    // Trailer lengths 16..=256 in width-10 buckets
    let mut buckets = [0u32; 25];
    for _ in 0..10_000 {
        let framed = padder.pad(b"A");
        let sealed = cipher.seal(&framed).unwrap();
        let trailer = sealed.len() - baseline;
        assert!((16..=256).contains(&trailer), "trailer {trailer}");
        buckets[(trailer - 16) / 10] += 1;
    }

    let covered = buckets.iter().filter(|&&count| count > 0).count();
    assert!(covered * 10 >= buckets.len() * 9, "covered {covered}/25 buckets");
}

/// S6: 99-byte buffers bypass fragmentation; 100-byte buffers are minced
/// through the SNI region
#[tokio::test(start_paused = true)]
async fn test_fragmenter_write_counts() {
    struct Recorder {
        writes: Vec<usize>,
        bytes: Vec<u8>,
    }

    impl tokio::io::AsyncWrite for Recorder {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            let this = self.get_mut();
            this.writes.push(buf.len());
            this.bytes.extend_from_slice(buf);
            std::task::Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    // 99 bytes: exactly one write
    let mut recorder = Recorder {
        writes: Vec::new(),
        bytes: Vec::new(),
    };
    let data = vec![0x17u8; 99];
    Fragmenter::fragment_client_hello(&mut recorder, &data)
        .await
        .unwrap();
    assert_eq!(recorder.writes, vec![99]);
    assert_eq!(recorder.bytes, data);

    // 100 bytes: at least three writes inside the SNI region, and the
    // concatenation is byte-identical
    let mut recorder = Recorder {
        writes: Vec::new(),
        bytes: Vec::new(),
    };
    let data: Vec<u8> = (0..100).map(|i| i as u8).collect();
    Fragmenter::fragment_client_hello(&mut recorder, &data)
        .await
        .unwrap();
    assert!(recorder.writes.len() >= 3, "writes: {:?}", recorder.writes);
    assert_eq!(recorder.bytes, data);
}

/// The whole pipeline over real TCP + the plain TCP transport
#[tokio::test]
async fn test_pipeline_over_tcp_transport() {
    use xp_tunnel::transport::{TcpTransport, Transport};

    let echo = spawn_echo().await;
    let settings = plain_settings();

    let transport = TcpTransport::new();
    let mut listener = transport.listen("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr();

    tokio::spawn(async move {
        while let Ok(conn) = listener.accept().await {
            let peer = conn.remote_addr();
            tokio::spawn(handle_connection(conn, peer, Arc::clone(&settings)));
        }
    });

    let conn = transport.dial(&server_addr).await.unwrap();
    let tunnel = Tunnel::new(conn, &KEY, ObfuscationConfig::disabled()).unwrap();

    let frame = Command::Connect(echo.to_string()).encode();
    tunnel.write(&frame).await.unwrap();
    let mut buf = [0u8; 64];
    let n = tunnel.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], &[STATUS_OK]);

    tunnel.write(b"across real sockets").await.unwrap();
    let n = tunnel.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"across real sockets");
}

/// Key material helpers round-trip through the config encoding
#[test]
fn test_key_encoding_is_config_compatible() {
    let key = xp_tunnel::crypto::generate_key();
    let encoded = key_to_base64(&key);
    let decoded = xp_tunnel::crypto::key_from_base64(&encoded).unwrap();
    assert_eq!(key, decoded);
}
