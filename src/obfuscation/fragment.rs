//! TCP-level fragmentation of outbound writes
//!
//! SNI-based DPI reassembles the start of a TLS ClientHello to read the
//! server name. Splitting the ClientHello across many small TCP segments
//! with irregular pacing forces the middlebox to hold per-flow state far
//! longer than its fast path allows.
//!
//! Fragmentation is expressed as a *plan* (chunk ranges plus the delay
//! preceding each chunk) so that byte-stream equivalence is testable
//! without timing, and executed either as an async write loop or inside
//! [`FragmentingStream`], which intercepts the first write of a dial
//! socket (the ClientHello emitted by the TLS library).

use rand::rngs::OsRng;
use rand::Rng;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::time::{sleep, Sleep};

/// Buffers below this length are written unmodified by the ClientHello path
const HELLO_MIN_LEN: usize = 100;

/// The SNI extension sits within the first 200 bytes of a ClientHello
const SNI_REGION_END: usize = 200;

/// Fragmentation configuration (generic bulk-write variant)
#[derive(Debug, Clone, Copy)]
pub struct FragmentConfig {
    pub enabled: bool,
    /// Minimum chunk size in bytes
    pub min_size: usize,
    /// Maximum chunk size in bytes
    pub max_size: usize,
    /// Minimum inter-chunk delay
    pub min_delay: Duration,
    /// Maximum inter-chunk delay
    pub max_delay: Duration,
}

impl Default for FragmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_size: 10,
            max_size: 50,
            min_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        }
    }
}

impl FragmentConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// One planned sub-write: the byte range and the pause preceding it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub start: usize,
    pub end: usize,
    pub delay_before: Duration,
}

/// Splits byte buffers into timed sub-writes
#[derive(Debug, Clone)]
pub struct Fragmenter {
    config: FragmentConfig,
}

impl Fragmenter {
    pub fn new(config: FragmentConfig) -> Self {
        Self { config }
    }

    /// Plan the ClientHello split.
    ///
    /// Buffers under 100 bytes go out whole. Otherwise: a 15-25 byte head,
    /// a 20-50 ms pause, 1-5 byte fragments with 10-30 ms pacing through
    /// the SNI region (byte 200), then a 10-20 ms pause and the tail in
    /// one write. All sizes and pauses come from the OS RNG.
    pub fn client_hello_plan(len: usize) -> Vec<Chunk> {
        if len < HELLO_MIN_LEN {
            return vec![Chunk {
                start: 0,
                end: len,
                delay_before: Duration::ZERO,
            }];
        }

        let mut plan = Vec::new();
        let first = OsRng.gen_range(15..=25).min(len);
        plan.push(Chunk {
            start: 0,
            end: first,
            delay_before: Duration::ZERO,
        });

        let sni_end = len.min(SNI_REGION_END);
        let mut cursor = first;
        let mut delay = rand_delay(20, 50);
        while cursor < sni_end {
            let size = OsRng.gen_range(1..=5).min(sni_end - cursor);
            plan.push(Chunk {
                start: cursor,
                end: cursor + size,
                delay_before: delay,
            });
            cursor += size;
            delay = rand_delay(10, 30);
        }

        if cursor < len {
            plan.push(Chunk {
                start: cursor,
                end: len,
                delay_before: rand_delay(10, 20),
            });
        }

        plan
    }

    /// Plan a generic bulk-write split: chunks of `min_size..=max_size`
    /// bytes with `min_delay..=max_delay` pacing. Buffers shorter than two
    /// minimum chunks (or a disabled config) go out whole.
    pub fn plan(&self, len: usize) -> Vec<Chunk> {
        if !self.config.enabled || len < self.config.min_size * 2 {
            return vec![Chunk {
                start: 0,
                end: len,
                delay_before: Duration::ZERO,
            }];
        }

        let mut plan = Vec::new();
        let mut cursor = 0;
        while cursor < len {
            let size = OsRng
                .gen_range(self.config.min_size..=self.config.max_size)
                .min(len - cursor);
            let delay_before = if cursor == 0 {
                Duration::ZERO
            } else {
                random_duration(self.config.min_delay, self.config.max_delay)
            };
            plan.push(Chunk {
                start: cursor,
                end: cursor + size,
                delay_before,
            });
            cursor += size;
        }
        plan
    }

    /// Fragment a TLS ClientHello onto `writer`
    pub async fn fragment_client_hello<W>(writer: &mut W, data: &[u8]) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        execute(writer, data, &Self::client_hello_plan(data.len())).await
    }

    /// Fragment a bulk buffer onto `writer` per this fragmenter's config
    pub async fn write_fragmented<W>(&self, writer: &mut W, data: &[u8]) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        execute(writer, data, &self.plan(data.len())).await
    }
}

impl Default for Fragmenter {
    fn default() -> Self {
        Self::new(FragmentConfig::default())
    }
}

fn rand_delay(min_ms: u64, max_ms: u64) -> Duration {
    Duration::from_millis(OsRng.gen_range(min_ms..=max_ms))
}

fn random_duration(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let millis = OsRng.gen_range(min.as_millis() as u64..=max.as_millis() as u64);
    Duration::from_millis(millis)
}

async fn execute<W>(writer: &mut W, data: &[u8], plan: &[Chunk]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    for chunk in plan {
        if !chunk.delay_before.is_zero() {
            sleep(chunk.delay_before).await;
        }
        writer.write_all(&data[chunk.start..chunk.end]).await?;
        writer.flush().await?;
    }
    Ok(())
}

enum WriteState {
    /// Next write is the ClientHello and gets fragmented
    FirstWrite,
    /// Mid-fragmentation; incoming polls drive the stored plan
    Fragmenting {
        data: Vec<u8>,
        plan: Vec<Chunk>,
        index: usize,
        written: usize,
        delay: Option<Pin<Box<Sleep>>>,
    },
    /// All later writes pass straight through
    Passthrough,
}

/// Wraps a dial socket and fragments its first outbound write.
///
/// The TLS library writes the ClientHello as one buffer; this wrapper
/// turns that single write into the planned sub-writes underneath it,
/// without the library's cooperation. Reads and subsequent writes are
/// transparent.
pub struct FragmentingStream<S> {
    inner: S,
    state: WriteState,
}

impl<S> FragmentingStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            state: WriteState::FirstWrite,
        }
    }

    /// Consume the wrapper, returning the underlying stream
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for FragmentingStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for FragmentingStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if let WriteState::Passthrough = this.state {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }

        if let WriteState::FirstWrite = this.state {
            this.state = WriteState::Fragmenting {
                data: buf.to_vec(),
                plan: Fragmenter::client_hello_plan(buf.len()),
                index: 0,
                written: 0,
                delay: None,
            };
        }

        loop {
            let WriteState::Fragmenting {
                data,
                plan,
                index,
                written,
                delay,
            } = &mut this.state
            else {
                unreachable!("fragmenting state set above");
            };

            if *index >= plan.len() {
                let total = data.len();
                this.state = WriteState::Passthrough;
                return Poll::Ready(Ok(total));
            }

            if let Some(pending) = delay {
                ready!(pending.as_mut().poll(cx));
                *delay = None;
            }

            let chunk = plan[*index];
            let slice = &data[chunk.start + *written..chunk.end];
            let n = ready!(Pin::new(&mut this.inner).poll_write(cx, slice))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            *written += n;

            if chunk.start + *written == chunk.end {
                *index += 1;
                *written = 0;
                if let Some(next) = plan.get(*index) {
                    if !next.delay_before.is_zero() {
                        *delay = Some(Box::pin(sleep(next.delay_before)));
                    }
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_contiguous(plan: &[Chunk], len: usize) {
        let mut cursor = 0;
        for chunk in plan {
            assert_eq!(chunk.start, cursor);
            assert!(chunk.end > chunk.start || len == 0);
            cursor = chunk.end;
        }
        assert_eq!(cursor, len);
    }

    #[test]
    fn test_hello_plan_small_buffer_whole() {
        let plan = Fragmenter::client_hello_plan(99);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0], Chunk {
            start: 0,
            end: 99,
            delay_before: Duration::ZERO,
        });
    }

    #[test]
    fn test_hello_plan_structure() {
        for len in [100, 150, 200, 517, 2000] {
            let plan = Fragmenter::client_hello_plan(len);
            assert_contiguous(&plan, len);

            // Head chunk is 15-25 bytes, and the SNI region is minced
            assert!((15..=25).contains(&plan[0].end));
            let before_sni_end = plan
                .iter()
                .filter(|c| c.end <= len.min(200))
                .count();
            assert!(before_sni_end >= 3, "len {len}: {before_sni_end} writes");
            for chunk in &plan[1..] {
                if chunk.end <= len.min(200) {
                    assert!(chunk.end - chunk.start <= 5);
                }
            }
        }
    }

    #[test]
    fn test_generic_plan_skips_short() {
        let fragmenter = Fragmenter::default();
        let plan = fragmenter.plan(19);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].delay_before, Duration::ZERO);
    }

    #[test]
    fn test_generic_plan_disabled() {
        let fragmenter = Fragmenter::new(FragmentConfig::disabled());
        assert_eq!(fragmenter.plan(4096).len(), 1);
    }

    #[test]
    fn test_generic_plan_chunk_sizes() {
        let fragmenter = Fragmenter::default();
        let plan = fragmenter.plan(1000);
        assert_contiguous(&plan, 1000);
        for chunk in &plan {
            assert!(chunk.end - chunk.start <= 50);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_preserves_bytes() {
        let data: Vec<u8> = (0..=255).cycle().take(517).map(|b| b as u8).collect();
        let mut sink = Vec::new();
        Fragmenter::fragment_client_hello(&mut sink, &data)
            .await
            .unwrap();
        assert_eq!(sink, data);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fragmenting_stream_first_write_only() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut wrapped = FragmentingStream::new(client);

        let hello: Vec<u8> = (0..300).map(|i| i as u8).collect();
        let reader = tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let mut server = server;
            let mut out = vec![0u8; 600];
            let mut total = 0;
            while total < 600 {
                let n = server.read(&mut out[total..]).await.unwrap();
                assert!(n > 0);
                total += n;
            }
            out
        });

        use tokio::io::AsyncWriteExt;
        wrapped.write_all(&hello).await.unwrap();
        let second: Vec<u8> = (0..300).map(|i| (i % 7) as u8).collect();
        wrapped.write_all(&second).await.unwrap();
        wrapped.flush().await.unwrap();

        let received = reader.await.unwrap();
        assert_eq!(&received[..300], &hello[..]);
        assert_eq!(&received[300..], &second[..]);
    }
}
