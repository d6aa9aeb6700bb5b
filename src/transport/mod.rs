//! Transport module - framed, transactional duplex stream.
//!
//! A [`Transport`] wraps any `AsyncRead` + `AsyncWrite` pair and exposes two
//! independent transaction locks:
//!
//! - **read**: [`Transport::begin_read`] yields a [`ReadTransaction`] holding
//!   exactly one frame's payload. Dropping it discards unread bytes and
//!   releases the lock.
//! - **write**: [`Transport::begin_write`] yields a [`WriteTransaction`] that
//!   buffers everything in memory. [`WriteTransaction::commit`] emits one
//!   frame (or nothing, if the buffer is empty); dropping it without commit
//!   cancels.
//!
//! One reader and one writer may run concurrently. Readers serialize behind
//! the read lock, writers behind the write lock.
//!
//! # Example
//!
//! ```
//! use objwire::transport::Transport;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> objwire::Result<()> {
//! let (a, b) = tokio::io::duplex(1024);
//! let (left, right) = (Transport::from_stream(a), Transport::from_stream(b));
//!
//! let mut txn = left.begin_write(7).await?;
//! txn.write(b"hello");
//! txn.commit().await?;
//!
//! let mut txn = right.begin_read(None).await?;
//! assert_eq!(txn.seq(), 7);
//! assert_eq!(&txn.read_all()[..], b"hello");
//! # Ok(())
//! # }
//! ```

mod socket;

pub use socket::{SocketListener, SocketTransport, SOCKET_COMPRESSION_THRESHOLD};

use std::collections::VecDeque;
use std::io::IoSlice;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::PoisonError;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, MutexGuard};

use crate::error::{Error, PackingError, Result};
use crate::packers::Packer;
use crate::protocol::{compress, Frame, FrameBuffer, FrameHeader, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Configuration for a [`Transport`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Largest payload accepted or produced, in bytes.
    pub max_payload_size: i32,
    /// Payload size above which compressed frames are worth sending.
    /// `None` means the transport cannot compress at all.
    pub compression_threshold: Option<usize>,
    /// Size of each read from the underlying channel.
    pub read_chunk_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            compression_threshold: None,
            read_chunk_size: 64 * 1024,
        }
    }
}

impl TransportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_payload_size(mut self, size: i32) -> Self {
        self.max_payload_size = size;
        self
    }

    pub fn with_compression_threshold(mut self, threshold: usize) -> Self {
        self.compression_threshold = Some(threshold);
        self
    }

    pub fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size.max(1);
        self
    }
}

struct ReaderState {
    stream: BoxedReader,
    frames: FrameBuffer,
    ready: VecDeque<Frame>,
    chunk: Vec<u8>,
}

impl ReaderState {
    /// Next complete frame. Cancel-safe: partial input stays in `frames`.
    async fn next_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Ok(frame);
            }

            let n = self.stream.read(&mut self.chunk).await?;
            if n == 0 {
                if self.frames.is_mid_frame() {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "stream ended in the middle of a frame",
                    )));
                }
                return Err(Error::Closed);
            }

            let frames = self.frames.push(&self.chunk[..n])?;
            self.ready.extend(frames);
        }
    }
}

struct WriterState {
    sink: BoxedWriter,
    buffer: BytesMut,
}

/// Execution context currently holding one of the transaction locks.
///
/// Inside a task this is the task id. Code driven directly by `block_on` has
/// no task id and is identified by its thread instead.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Holder {
    Task(tokio::task::Id),
    Thread(std::thread::ThreadId),
}

impl Holder {
    fn current() -> Self {
        match tokio::task::try_id() {
            Some(id) => Holder::Task(id),
            None => Holder::Thread(std::thread::current().id()),
        }
    }
}

#[derive(Default)]
struct LockOwner(std::sync::Mutex<Option<Holder>>);

impl LockOwner {
    fn ensure_not_held(&self, what: &str) -> Result<()> {
        if *self.slot() == Some(Holder::current()) {
            return Err(Error::Usage(format!(
                "{} called again before the current transaction ended",
                what
            )));
        }
        Ok(())
    }

    fn claim(&self) {
        *self.slot() = Some(Holder::current());
    }

    fn release(&self) {
        *self.slot() = None;
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<Holder>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Framed, transactional, duplex transport.
pub struct Transport {
    reader: Mutex<ReaderState>,
    writer: Mutex<WriterState>,
    read_owner: LockOwner,
    write_owner: LockOwner,
    closed: AtomicBool,
    compression_enabled: AtomicBool,
    config: TransportConfig,
}

impl Transport {
    /// Create a transport over separate read and write halves.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_config(reader, writer, TransportConfig::default())
    }

    pub fn with_config<R, W>(reader: R, writer: W, config: TransportConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Mutex::new(ReaderState {
                stream: Box::new(reader),
                frames: FrameBuffer::with_max_payload(config.max_payload_size),
                ready: VecDeque::new(),
                chunk: vec![0u8; config.read_chunk_size.max(1)],
            }),
            writer: Mutex::new(WriterState {
                sink: Box::new(writer),
                buffer: BytesMut::with_capacity(4096),
            }),
            read_owner: LockOwner::default(),
            write_owner: LockOwner::default(),
            closed: AtomicBool::new(false),
            compression_enabled: AtomicBool::new(false),
            config,
        }
    }

    /// Create a transport over a single duplex stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::from_stream_with_config(stream, TransportConfig::default())
    }

    pub fn from_stream_with_config<S>(stream: S, config: TransportConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::with_config(reader, writer, config)
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    /// Turn compression on. Returns `false` if this transport cannot compress.
    pub fn enable_compression(&self) -> bool {
        let supported = self.config.compression_threshold.is_some();
        self.compression_enabled.store(supported, Ordering::Release);
        supported
    }

    pub fn disable_compression(&self) {
        self.compression_enabled.store(false, Ordering::Release);
    }

    pub fn is_compression_enabled(&self) -> bool {
        self.compression_enabled.load(Ordering::Acquire)
    }

    fn should_compress(&self, len: usize) -> bool {
        match self.config.compression_threshold {
            Some(threshold) => self.is_compression_enabled() && len > threshold,
            None => false,
        }
    }

    /// Acquire the read lock without waiting for a frame yet.
    ///
    /// Used by callers that must re-check shared state after acquiring the
    /// lock and before blocking on the channel.
    ///
    /// Asking again from the task (or `block_on` thread) that already holds
    /// the lock is an [`Error::Usage`] instead of a deadlock.
    pub async fn reader(&self) -> Result<ReadLock<'_>> {
        self.ensure_open()?;
        self.read_owner.ensure_not_held("begin_read")?;
        let guard = self.reader.lock().await;
        self.read_owner.claim();
        Ok(ReadLock {
            transport: self,
            guard,
        })
    }

    /// Acquire the read lock and wait for the next frame.
    ///
    /// The timeout covers both lock acquisition and the wait for a frame.
    /// On timeout the lock is released and [`Error::Timeout`] is returned.
    /// Reentrant calls fail as with [`reader`](Self::reader).
    pub async fn begin_read(&self, timeout: Option<Duration>) -> Result<ReadTransaction<'_>> {
        match timeout {
            None => self.reader().await?.begin(None).await,
            Some(limit) => {
                let deadline = tokio::time::Instant::now() + limit;
                let lock = tokio::time::timeout_at(deadline, self.reader())
                    .await
                    .map_err(|_| Error::Timeout(limit))??;
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                lock.begin(Some(remaining)).await
            }
        }
    }

    /// Acquire the write lock and start buffering a frame for `seq`.
    ///
    /// Calling it again while the same task (or `block_on` thread) still
    /// holds a [`WriteTransaction`] is an [`Error::Usage`].
    pub async fn begin_write(&self, seq: i32) -> Result<WriteTransaction<'_>> {
        self.ensure_open()?;
        self.write_owner.ensure_not_held("begin_write")?;
        let mut guard = self.writer.lock().await;
        self.write_owner.claim();
        guard.buffer.clear();
        Ok(WriteTransaction {
            transport: self,
            guard,
            seq,
            in_flight: false,
        })
    }

    /// Close the transport. Further transactions fail with [`Error::Closed`].
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::debug!("closing transport");
        let mut state = self.writer.lock().await;
        state.sink.shutdown().await?;
        Ok(())
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("closed", &self.is_closed())
            .field("compression_enabled", &self.is_compression_enabled())
            .field("config", &self.config)
            .finish()
    }
}

/// Held read lock, before a frame has been taken.
pub struct ReadLock<'a> {
    transport: &'a Transport,
    guard: MutexGuard<'a, ReaderState>,
}

impl<'a> ReadLock<'a> {
    /// Wait for the next frame and open a read transaction over it.
    ///
    /// Consumes the lock: on any error, including timeout, the lock is released.
    pub async fn begin(mut self, timeout: Option<Duration>) -> Result<ReadTransaction<'a>> {
        let transport = self.transport;
        let result = match timeout {
            None => self.guard.next_frame().await,
            Some(limit) => tokio::time::timeout(limit, self.guard.next_frame())
                .await
                .unwrap_or(Err(Error::Timeout(limit))),
        };

        let frame = match result {
            Ok(frame) => frame,
            Err(err) => {
                if !err.is_timeout() {
                    if matches!(err, Error::Protocol(_)) {
                        self.guard.frames.clear();
                        self.guard.ready.clear();
                    }
                    if err.is_fatal() || matches!(err, Error::Protocol(_)) {
                        tracing::debug!("read side failed: {}", err);
                        transport.mark_closed();
                    }
                }
                return Err(err);
            }
        };

        let seq = frame.seq();
        let window = frame.into_payload()?;
        tracing::trace!(seq, len = window.len(), "frame received");

        Ok(ReadTransaction {
            lock: self,
            seq,
            window,
        })
    }
}

impl Drop for ReadLock<'_> {
    fn drop(&mut self) {
        self.transport.read_owner.release();
    }
}

/// One frame's payload, readable until the transaction ends.
pub struct ReadTransaction<'a> {
    lock: ReadLock<'a>,
    seq: i32,
    window: Bytes,
}

impl<'a> ReadTransaction<'a> {
    /// Sequence number from the frame header.
    pub fn seq(&self) -> i32 {
        self.seq
    }

    /// Unread bytes left in this frame.
    pub fn remaining(&self) -> usize {
        self.window.len()
    }

    /// Read exactly `count` bytes.
    ///
    /// Fails with [`Error::FrameBoundary`] if the frame holds fewer.
    pub fn read(&mut self, count: usize) -> Result<Bytes> {
        if count > self.window.len() {
            return Err(Error::FrameBoundary {
                requested: count,
                available: self.window.len(),
            });
        }
        Ok(self.window.split_to(count))
    }

    /// Read everything left in this frame.
    pub fn read_all(&mut self) -> Bytes {
        std::mem::take(&mut self.window)
    }

    /// Decode one value from the frame.
    pub fn unpack<P: Packer + ?Sized>(&mut self, packer: &P) -> Result<P::Item> {
        packer.unpack(&mut self.window)
    }

    /// Direct access to the unread window.
    pub fn window_mut(&mut self) -> &mut Bytes {
        &mut self.window
    }

    /// End the transaction, discarding unread bytes. Same as dropping it.
    pub fn end(self) {}

    pub fn transport(&self) -> &'a Transport {
        self.lock.transport
    }
}

/// Buffered frame being built under the write lock.
pub struct WriteTransaction<'a> {
    transport: &'a Transport,
    guard: MutexGuard<'a, WriterState>,
    seq: i32,
    in_flight: bool,
}

impl<'a> WriteTransaction<'a> {
    pub fn seq(&self) -> i32 {
        self.seq
    }

    /// Append raw bytes to the frame.
    pub fn write(&mut self, data: &[u8]) {
        self.guard.buffer.extend_from_slice(data);
    }

    /// Encode one value into the frame.
    pub fn pack<P: Packer + ?Sized>(&mut self, packer: &P, item: &P::Item) -> Result<()> {
        packer.pack(item, &mut self.guard.buffer)
    }

    /// Mutable access to the frame buffer.
    pub fn buffer(&mut self) -> &mut BytesMut {
        &mut self.guard.buffer
    }

    /// Number of bytes buffered so far.
    pub fn len(&self) -> usize {
        self.guard.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard.buffer.is_empty()
    }

    /// Drop everything buffered so far but keep the lock.
    pub fn restart(&mut self) {
        self.guard.buffer.clear();
    }

    /// Discard the buffer and release the lock without writing.
    pub fn cancel(self) {}

    /// Write the buffered frame, flush and release the lock.
    ///
    /// An empty buffer writes nothing.
    pub async fn commit(mut self) -> Result<()> {
        if self.guard.buffer.is_empty() {
            return Ok(());
        }

        let transport = self.transport;
        let seq = self.seq;
        let raw = self.guard.buffer.split().freeze();

        if raw.len() > transport.config.max_payload_size as usize {
            return Err(Error::Packing(PackingError::LengthOverflow(raw.len())));
        }

        let (header, payload) = if transport.should_compress(raw.len()) {
            let packed = compress(&raw)?;
            if packed.len() < raw.len() {
                let header = FrameHeader::compressed(seq, packed.len() as i32, raw.len() as i32);
                (header, Bytes::from(packed))
            } else {
                (FrameHeader::new(seq, raw.len() as i32), raw)
            }
        } else {
            (FrameHeader::new(seq, raw.len() as i32), raw)
        };

        self.in_flight = true;
        let header_bytes = header.encode();
        if let Err(err) = write_frame(&mut self.guard.sink, &header_bytes, &payload).await {
            tracing::error!("frame write failed, closing transport: {}", err);
            transport.mark_closed();
            return Err(err);
        }
        self.in_flight = false;

        tracing::trace!(
            seq,
            len = payload.len(),
            compressed = header.is_compressed(),
            "frame sent"
        );
        Ok(())
    }
}

impl Drop for WriteTransaction<'_> {
    fn drop(&mut self) {
        // A commit future dropped mid-write leaves a torn frame on the channel.
        if self.in_flight {
            self.transport.mark_closed();
        }
        self.guard.buffer.clear();
        self.transport.write_owner.release();
    }
}

/// Write header and payload with scatter/gather I/O, then flush.
async fn write_frame<W>(writer: &mut W, header: &[u8; HEADER_SIZE], payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let total = HEADER_SIZE + payload.len();
    let mut written = 0;

    while written < total {
        let slices = remaining_slices(header, payload, written);
        let n = writer.write_vectored(&slices).await?;
        if n == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        written += n;
    }

    writer.flush().await?;
    Ok(())
}

/// Slices still to be written after `skip` bytes went out.
fn remaining_slices<'b>(header: &'b [u8], payload: &'b [u8], skip: usize) -> Vec<IoSlice<'b>> {
    let mut slices = Vec::with_capacity(2);
    if skip < header.len() {
        slices.push(IoSlice::new(&header[skip..]));
    }
    let payload_skip = skip.saturating_sub(header.len());
    if payload_skip < payload.len() {
        slices.push(IoSlice::new(&payload[payload_skip..]));
    }
    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packers::{Int32, Str};
    use std::sync::Arc;
    use tokio::io::duplex;

    fn pair() -> (Transport, Transport) {
        let (a, b) = duplex(64 * 1024);
        (Transport::from_stream(a), Transport::from_stream(b))
    }

    #[test]
    fn test_remaining_slices() {
        let header = [1u8; HEADER_SIZE];
        let payload = [2u8; 5];

        assert_eq!(remaining_slices(&header, &payload, 0).len(), 2);

        let slices = remaining_slices(&header, &payload, HEADER_SIZE + 2);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].len(), 3);

        assert!(remaining_slices(&header, &payload, HEADER_SIZE + 5).is_empty());
    }

    #[tokio::test]
    async fn test_only_non_empty_transactions_produce_frames() {
        let (left, right) = pair();

        let writes: [(i32, &[u8]); 4] = [(1, b"one"), (2, b""), (3, b"three"), (4, b"")];
        for (seq, data) in writes {
            let mut txn = left.begin_write(seq).await.unwrap();
            txn.write(data);
            txn.commit().await.unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..2 {
            let mut txn = right.begin_read(None).await.unwrap();
            seen.push((txn.seq(), txn.read_all().to_vec()));
        }
        assert_eq!(seen, vec![(1, b"one".to_vec()), (3, b"three".to_vec())]);

        let err = right
            .begin_read(Some(Duration::from_millis(20)))
            .await
            .err()
            .unwrap();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_restart_discards_earlier_bytes() {
        let (left, right) = pair();

        let mut txn = left.begin_write(5).await.unwrap();
        txn.write(b"stale");
        txn.restart();
        txn.write(b"also stale");
        txn.restart();
        txn.write(b"fresh");
        txn.commit().await.unwrap();

        let mut txn = right.begin_read(None).await.unwrap();
        assert_eq!(&txn.read_all()[..], b"fresh");
    }

    #[tokio::test]
    async fn test_restart_to_empty_sends_nothing() {
        let (left, right) = pair();

        let mut txn = left.begin_write(1).await.unwrap();
        txn.write(b"gone");
        txn.restart();
        txn.commit().await.unwrap();

        let mut txn = left.begin_write(2).await.unwrap();
        txn.write(b"kept");
        txn.commit().await.unwrap();

        let txn = right.begin_read(None).await.unwrap();
        assert_eq!(txn.seq(), 2);
    }

    #[tokio::test]
    async fn test_cancel_and_drop_write_nothing() {
        let (left, right) = pair();

        let mut txn = left.begin_write(1).await.unwrap();
        txn.write(b"cancelled");
        txn.cancel();

        {
            let mut txn = left.begin_write(2).await.unwrap();
            txn.write(b"dropped");
        }

        let mut txn = left.begin_write(3).await.unwrap();
        txn.pack(&Int32, &99).unwrap();
        txn.commit().await.unwrap();

        let mut txn = right.begin_read(None).await.unwrap();
        assert_eq!(txn.seq(), 3);
        assert_eq!(txn.unpack(&Int32).unwrap(), 99);
        assert_eq!(txn.remaining(), 0);
    }

    #[tokio::test]
    async fn test_read_past_frame_boundary() {
        let (left, right) = pair();

        let mut txn = left.begin_write(1).await.unwrap();
        txn.write(b"abc");
        txn.commit().await.unwrap();

        let mut txn = right.begin_read(None).await.unwrap();
        assert_eq!(&txn.read(2).unwrap()[..], b"ab");
        let err = txn.read(2).unwrap_err();
        assert!(matches!(
            err,
            Error::FrameBoundary {
                requested: 2,
                available: 1
            }
        ));
    }

    #[tokio::test]
    async fn test_unread_bytes_are_discarded() {
        let (left, right) = pair();

        for seq in [1, 2] {
            let mut txn = left.begin_write(seq).await.unwrap();
            txn.pack(&Str, &format!("frame {}", seq)).unwrap();
            txn.commit().await.unwrap();
        }

        let mut txn = right.begin_read(None).await.unwrap();
        let _ = txn.read(1).unwrap();
        txn.end();

        let mut txn = right.begin_read(None).await.unwrap();
        assert_eq!(txn.seq(), 2);
        assert_eq!(txn.unpack(&Str).unwrap(), "frame 2");
    }

    #[tokio::test]
    async fn test_timeout_releases_read_lock() {
        let (left, right) = pair();

        let err = right
            .begin_read(Some(Duration::from_millis(10)))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(!right.is_closed());

        let mut txn = left.begin_write(8).await.unwrap();
        txn.write(b"late");
        txn.commit().await.unwrap();

        let txn = right
            .begin_read(Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(txn.seq(), 8);
    }

    #[tokio::test]
    async fn test_compression_roundtrip() {
        let (a, b) = duplex(64 * 1024);
        let config = TransportConfig::new().with_compression_threshold(16);
        let left = Transport::from_stream_with_config(a, config);
        let right = Transport::from_stream(b);

        assert!(!right.enable_compression());
        assert!(left.enable_compression());
        assert!(left.is_compression_enabled());

        let data = vec![b'x'; 5000];
        let mut txn = left.begin_write(1).await.unwrap();
        txn.write(&data);
        txn.commit().await.unwrap();

        let mut txn = right.begin_read(None).await.unwrap();
        assert_eq!(&txn.read_all()[..], &data[..]);
    }

    #[tokio::test]
    async fn test_peer_close_is_reported() {
        let (left, right) = pair();
        left.close().await.unwrap();

        let err = right.begin_read(None).await.err().unwrap();
        assert!(matches!(err, Error::Closed));
        assert!(right.is_closed());
        assert!(matches!(left.begin_write(1).await.err(), Some(Error::Closed)));
    }

    #[tokio::test]
    async fn test_reentrant_begin_read_is_usage_error() {
        let (_left, right) = pair();
        let right = Arc::new(right);

        let result = tokio::spawn(async move {
            let _lock = right.reader().await.unwrap();
            right.reader().await.map(|_| ())
        })
        .await
        .unwrap();

        assert!(matches!(result, Err(Error::Usage(_))));
    }

    #[test]
    fn test_reentrant_calls_outside_tasks_are_usage_errors() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (_left, right) = runtime.block_on(async { pair() });

        runtime.block_on(async {
            let txn = right.begin_write(1).await.unwrap();
            assert!(matches!(right.begin_write(2).await, Err(Error::Usage(_))));
            txn.cancel();
            right.begin_write(3).await.unwrap().cancel();

            let _lock = right.reader().await.unwrap();
            let again = right.begin_read(Some(Duration::from_millis(10))).await;
            assert!(matches!(again, Err(Error::Usage(_))));
        });
    }

    #[tokio::test]
    async fn test_concurrent_read_and_write() {
        let (left, right) = pair();
        let left = Arc::new(left);

        let reader = {
            let left = Arc::clone(&left);
            tokio::spawn(async move {
                let mut txn = left.begin_read(None).await.unwrap();
                (txn.seq(), txn.read_all())
            })
        };

        tokio::task::yield_now().await;
        let mut txn = left.begin_write(1).await.unwrap();
        txn.write(b"ping");
        txn.commit().await.unwrap();

        let mut txn = right.begin_read(None).await.unwrap();
        let seq = txn.seq();
        let data = txn.read_all();
        drop(txn);
        let mut reply = right.begin_write(seq).await.unwrap();
        reply.write(&data);
        reply.commit().await.unwrap();

        let (seq, data) = reader.await.unwrap();
        assert_eq!(seq, 1);
        assert_eq!(&data[..], b"ping");
    }
}
