//! Async driver for the KCP protocol engine
//!
//! The `kcp` crate is a sans-io state machine: packets go in via
//! `input`, come out via its output sink, and a clock must call `update`.
//! This module owns that choreography. [`KcpConn`] is the byte-stream
//! face (AsyncRead/AsyncWrite); a background task runs the update timer;
//! the transport feeds packets in through [`SessionInput`] and drains
//! outgoing packets from the channel returned by [`spawn_session`].

use kcp::Kcp;
use parking_lot::Mutex;
use std::io::{self, Write};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::trace;

/// Outgoing send queue high-water mark, in packets
const MAX_WAIT_SND: usize = 2048;

/// Hard ceiling on the update timer period
const MAX_UPDATE_DELAY: Duration = Duration::from_millis(100);

/// KCP tuning parameters
#[derive(Debug, Clone, Copy)]
pub(crate) struct SessionConfig {
    pub conv: u32,
    pub nodelay: bool,
    pub interval: i32,
    pub resend: i32,
    pub nc: bool,
    pub mtu: usize,
    pub snd_wnd: u16,
    pub rcv_wnd: u16,
}

/// Sink the KCP engine writes raw packets into; each `write` call is one
/// datagram
struct PacketSink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl Write for PacketSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // Receiver gone means the session is shutting down; swallow
        let _ = self.tx.send(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct SessionCore {
    kcp: Mutex<Kcp<PacketSink>>,
    read_waker: Mutex<Option<Waker>>,
    write_waker: Mutex<Option<Waker>>,
    closed: AtomicBool,
    /// Pokes the update task after sends and inputs
    kick: Notify,
    epoch: Instant,
}

impl SessionCore {
    fn now(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }

    fn wake_readers(&self) {
        if let Some(waker) = self.read_waker.lock().take() {
            waker.wake();
        }
    }

    fn wake_writers(&self) {
        if let Some(waker) = self.write_waker.lock().take() {
            waker.wake();
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.kick.notify_waiters();
            self.wake_readers();
            self.wake_writers();
        }
    }
}

/// Packet-side handle: the transport feeds received KCP packets in and
/// observes session death
#[derive(Clone)]
pub(crate) struct SessionInput {
    core: Arc<SessionCore>,
}

impl SessionInput {
    /// Feed one raw KCP packet from the wire
    pub(crate) fn input(&self, packet: &[u8]) {
        {
            let mut kcp = self.core.kcp.lock();
            if kcp.input(packet).is_err() {
                trace!("dropping malformed KCP packet ({} bytes)", packet.len());
                return;
            }
            let now = self.core.now();
            let _ = kcp.update(now);
        }
        self.core.wake_readers();
        self.core.wake_writers();
        self.core.kick.notify_waiters();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.core.closed.load(Ordering::Acquire)
    }

    pub(crate) fn close(&self) {
        self.core.close();
    }

    /// Resolve once the session is closed
    pub(crate) async fn closed(&self) {
        loop {
            if self.is_closed() {
                return;
            }
            let mut notified = std::pin::pin!(self.core.kick.notified());
            notified.as_mut().enable();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

/// Byte-stream face of one KCP session
pub(crate) struct KcpConn {
    core: Arc<SessionCore>,
    /// Spill buffer for reads smaller than one KCP message
    leftover: Vec<u8>,
    leftover_pos: usize,
}

/// Create a session: returns the stream, the packet-input handle, and
/// the outgoing-packet channel the transport must drain onto the wire.
/// A background task drives the retransmission clock until close.
pub(crate) fn spawn_session(
    config: SessionConfig,
) -> (KcpConn, SessionInput, mpsc::UnboundedReceiver<Vec<u8>>) {
    let (tx, rx) = mpsc::unbounded_channel();

    let mut kcp = Kcp::new_stream(config.conv, PacketSink { tx });
    let _ = kcp.set_mtu(config.mtu);
    kcp.set_wndsize(config.snd_wnd, config.rcv_wnd);
    kcp.set_nodelay(config.nodelay, config.interval, config.resend, config.nc);

    let core = Arc::new(SessionCore {
        kcp: Mutex::new(kcp),
        read_waker: Mutex::new(None),
        write_waker: Mutex::new(None),
        closed: AtomicBool::new(false),
        kick: Notify::new(),
        epoch: Instant::now(),
    });

    tokio::spawn(update_loop(Arc::clone(&core)));

    (
        KcpConn {
            core: Arc::clone(&core),
            leftover: Vec::new(),
            leftover_pos: 0,
        },
        SessionInput { core },
        rx,
    )
}

async fn update_loop(core: Arc<SessionCore>) {
    loop {
        if core.closed.load(Ordering::Acquire) {
            break;
        }

        let delay = {
            let mut kcp = core.kcp.lock();
            let now = core.now();
            if kcp.update(now).is_err() {
                drop(kcp);
                core.close();
                break;
            }
            let next = kcp.check(now);
            Duration::from_millis(u64::from(next.saturating_sub(now)))
        };

        core.wake_readers();
        core.wake_writers();

        tokio::select! {
            _ = tokio::time::sleep(delay.min(MAX_UPDATE_DELAY)) => {}
            _ = core.kick.notified() => {}
        }
    }
}

impl AsyncRead for KcpConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        // Drain any spill from a previous oversized message first
        if this.leftover_pos < this.leftover.len() {
            let n = (this.leftover.len() - this.leftover_pos).min(buf.remaining());
            buf.put_slice(&this.leftover[this.leftover_pos..this.leftover_pos + n]);
            this.leftover_pos += n;
            if this.leftover_pos == this.leftover.len() {
                this.leftover.clear();
                this.leftover_pos = 0;
            }
            return Poll::Ready(Ok(()));
        }

        let mut kcp = this.core.kcp.lock();
        let size = match kcp.peeksize() {
            Ok(size) => size,
            Err(_) => {
                if this.core.closed.load(Ordering::Acquire) {
                    return Poll::Ready(Ok(()));
                }
                *this.core.read_waker.lock() = Some(cx.waker().clone());
                return Poll::Pending;
            }
        };

        if buf.remaining() >= size {
            let dst = buf.initialize_unfilled_to(size);
            match kcp.recv(&mut dst[..size]) {
                Ok(n) => {
                    buf.advance(n);
                    Poll::Ready(Ok(()))
                }
                Err(e) => Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, format!("kcp: {e:?}")))),
            }
        } else {
            let mut tmp = vec![0u8; size];
            match kcp.recv(&mut tmp) {
                Ok(n) => {
                    tmp.truncate(n);
                    let take = buf.remaining();
                    buf.put_slice(&tmp[..take]);
                    this.leftover = tmp;
                    this.leftover_pos = take;
                    Poll::Ready(Ok(()))
                }
                Err(e) => Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, format!("kcp: {e:?}")))),
            }
        }
    }
}

impl AsyncWrite for KcpConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.core.closed.load(Ordering::Acquire) {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }

        let mut kcp = this.core.kcp.lock();
        if kcp.wait_snd() > MAX_WAIT_SND {
            *this.core.write_waker.lock() = Some(cx.waker().clone());
            return Poll::Pending;
        }

        match kcp.send(buf) {
            Ok(n) => {
                drop(kcp);
                this.core.kick.notify_waiters();
                Poll::Ready(Ok(n))
            }
            Err(e) => Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, format!("kcp: {e:?}")))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut kcp = this.core.kcp.lock();
        let _ = kcp.flush();
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let _ = self.as_mut().poll_flush(cx);
        Poll::Ready(Ok(()))
    }
}

impl Drop for KcpConn {
    fn drop(&mut self) {
        // Last flush so queued data still reaches the wire, then stop the
        // update task
        let _ = self.core.kcp.lock().flush();
        self.core.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_config(conv: u32) -> SessionConfig {
        SessionConfig {
            conv,
            nodelay: true,
            interval: 10,
            resend: 2,
            nc: true,
            mtu: 1350,
            snd_wnd: 256,
            rcv_wnd: 256,
        }
    }

    /// Shuttle packets between two sessions in-process
    fn bridge(
        mut a_out: mpsc::UnboundedReceiver<Vec<u8>>,
        b_in: SessionInput,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(pkt) = a_out.recv().await {
                if b_in.is_closed() {
                    break;
                }
                b_in.input(&pkt);
            }
        })
    }

    #[tokio::test]
    async fn test_session_roundtrip() {
        let (mut client, client_in, client_out) = spawn_session(test_config(7));
        let (mut server, server_in, server_out) = spawn_session(test_config(7));

        bridge(client_out, server_in);
        bridge(server_out, client_in);

        client.write_all(b"hello kcp").await.unwrap();
        client.flush().await.unwrap();

        let mut buf = [0u8; 32];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello kcp");

        server.write_all(b"hello back").await.unwrap();
        server.flush().await.unwrap();
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello back");
    }

    #[tokio::test]
    async fn test_session_bulk_transfer() {
        let (mut client, client_in, client_out) = spawn_session(test_config(9));
        let (mut server, server_in, server_out) = spawn_session(test_config(9));

        bridge(client_out, server_in);
        bridge(server_out, client_in);

        let payload: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client.flush().await.unwrap();
            client
        });

        let mut received = vec![0u8; expected.len()];
        server.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_small_read_buffer_spills() {
        let (mut client, client_in, client_out) = spawn_session(test_config(3));
        let (mut server, server_in, server_out) = spawn_session(test_config(3));

        bridge(client_out, server_in);
        bridge(server_out, client_in);

        client.write_all(b"0123456789").await.unwrap();
        client.flush().await.unwrap();

        let mut out = Vec::new();
        while out.len() < 10 {
            let mut tiny = [0u8; 3];
            let n = server.read(&mut tiny).await.unwrap();
            assert!(n > 0);
            out.extend_from_slice(&tiny[..n]);
        }
        assert_eq!(&out, b"0123456789");
    }
}
