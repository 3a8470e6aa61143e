//! Random-access byte sources and the streams derived from them.
//!
//! An archive does not own a seek cursor; every operation names the
//! absolute offset it wants. [`ReadAt`] is the one seam a caller can
//! implement to serve archives from anywhere (a file, a buffer, an HTTP
//! range endpoint, a synthetic source in tests). The crate derives
//! everything else from it: exact reads for headers and a chunked,
//! backpressure-preserving [`RegionStream`] for file data.

use std::future::Future;
use std::io;
use std::mem::ManuallyDrop;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::task;

use crate::result::{ZipError, ZipResult};

/// How many file-data bytes a region stream pulls per `read_at` call.
const STREAM_CHUNK_LENGTH: usize = 64 * 1024;

/// A source of bytes addressable at arbitrary 64-bit offsets.
///
/// Implementations return `Ok(n)` with `1 <= n <= buf.len()` when bytes
/// were available, and `Ok(0)` only at the end of the source. They must
/// tolerate concurrent calls: several streams may be reading different
/// regions of the same source at once.
#[async_trait]
pub trait ReadAt: Send + Sync {
    /// Read up to `buf.len()` bytes starting at `offset`.
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
}

fn read_file_at(file: &std::fs::File, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    #[cfg(unix)]
    {
        std::os::unix::fs::FileExt::read_at(file, buf, offset)
    }
    #[cfg(windows)]
    {
        std::os::windows::fs::FileExt::seek_read(file, buf, offset)
    }
}

async fn blocking_read_at(
    file: Arc<std::fs::File>,
    offset: u64,
    buf: &mut [u8],
) -> io::Result<usize> {
    let len = buf.len();
    let data = task::spawn_blocking(move || -> io::Result<Vec<u8>> {
        let mut tmp = vec![0u8; len];
        let n = read_file_at(&file, offset, &mut tmp)?;
        tmp.truncate(n);
        Ok(tmp)
    })
    .await
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
    buf[..data.len()].copy_from_slice(&data);
    Ok(data.len())
}

/// A [`ReadAt`] source backed by an owned file.
///
/// Positional reads never move a shared cursor, so any number of streams
/// can read concurrently. The blocking filesystem calls run on the
/// runtime's blocking pool.
pub struct FileReader {
    file: Arc<std::fs::File>,
    len: u64,
}

impl FileReader {
    /// Open the file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> io::Result<FileReader> {
        let path = path.as_ref().to_owned();
        task::spawn_blocking(move || {
            let file = std::fs::File::open(path)?;
            let len = file.metadata()?.len();
            Ok(FileReader {
                file: Arc::new(file),
                len,
            })
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }

    /// Total length of the file in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the file is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[async_trait]
impl ReadAt for FileReader {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        blocking_read_at(Arc::clone(&self.file), offset, buf).await
    }
}

/// A [`ReadAt`] source borrowing a file descriptor owned by the caller.
///
/// The descriptor is never closed by this type, no matter how streams
/// are created, cancelled, or dropped; the caller keeps ownership.
#[cfg(unix)]
pub struct FdReader {
    file: Arc<ManuallyDrop<std::fs::File>>,
    len: u64,
}

#[cfg(unix)]
impl FdReader {
    /// Wrap a raw file descriptor without taking ownership of it.
    ///
    /// # Safety
    ///
    /// `fd` must be a valid, open file descriptor that supports
    /// positional reads, and must stay open for the lifetime of the
    /// returned reader and every stream derived from it.
    pub async unsafe fn from_raw_fd(fd: std::os::unix::io::RawFd) -> io::Result<FdReader> {
        use std::os::unix::io::FromRawFd;

        let file = ManuallyDrop::new(std::fs::File::from_raw_fd(fd));
        let file = Arc::new(file);
        let probe = Arc::clone(&file);
        let len = task::spawn_blocking(move || probe.metadata().map(|m| m.len()))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
        Ok(FdReader { file, len })
    }

    /// Total length of the underlying file in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the underlying file is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(unix)]
#[async_trait]
impl ReadAt for FdReader {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let file = Arc::clone(&self.file);
        let len = buf.len();
        let data = task::spawn_blocking(move || -> io::Result<Vec<u8>> {
            let mut tmp = vec![0u8; len];
            let n = read_file_at(&file, offset, &mut tmp)?;
            tmp.truncate(n);
            Ok(tmp)
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }
}

/// A [`ReadAt`] source over an in-memory buffer.
pub struct BufferReader {
    data: Arc<Vec<u8>>,
}

impl BufferReader {
    /// Wrap `data` as a readable archive source.
    pub fn new(data: Vec<u8>) -> BufferReader {
        BufferReader {
            data: Arc::new(data),
        }
    }

    /// Total length of the buffer in bytes.
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl From<Vec<u8>> for BufferReader {
    fn from(data: Vec<u8>) -> BufferReader {
        BufferReader::new(data)
    }
}

#[async_trait]
impl ReadAt for BufferReader {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        if offset >= self.data.len() as u64 {
            return Ok(0);
        }
        let available = &self.data[offset as usize..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        Ok(n)
    }
}

/// The crate's handle on a [`ReadAt`] source: lifecycle state plus the
/// bookkeeping that makes `close()` safe while reads and streams are in
/// flight.
pub(crate) struct ArchiveReader {
    source: Arc<dyn ReadAt + 'static>,
    size: u64,
    open: AtomicBool,
    inflight_reads: AtomicUsize,
    active_streams: Arc<AtomicUsize>,
}

struct InflightGuard<'a>(&'a AtomicUsize);

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ArchiveReader {
    pub fn new(source: Arc<dyn ReadAt + 'static>, size: u64) -> ArchiveReader {
        ArchiveReader {
            source,
            size,
            open: AtomicBool::new(true),
            inflight_reads: AtomicUsize::new(0),
            active_streams: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn eof_error() -> ZipError {
        ZipError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "Unexpected end of file",
        ))
    }

    /// Read exactly `length` bytes at `offset`.
    ///
    /// Zero-length reads return an empty buffer without touching the
    /// source; a read past the end of the source fails rather than
    /// returning a short buffer.
    pub async fn read_exact_at(&self, offset: u64, length: usize) -> ZipResult<Bytes> {
        if length == 0 {
            return Ok(Bytes::new());
        }
        if !self.is_open() {
            return Err(ZipError::InvalidUsage("archive has been closed"));
        }
        if offset.checked_add(length as u64).map_or(true, |end| end > self.size) {
            return Err(Self::eof_error());
        }

        self.inflight_reads.fetch_add(1, Ordering::SeqCst);
        let _guard = InflightGuard(&self.inflight_reads);

        let mut buf = vec![0u8; length];
        let mut filled = 0;
        while filled < length {
            let n = self
                .source
                .read_at(offset + filled as u64, &mut buf[filled..])
                .await?;
            if n == 0 {
                return Err(Self::eof_error());
            }
            filled += n;
        }
        Ok(buf.into())
    }

    /// Open a stream over `length` bytes starting at `offset`.
    pub fn stream(&self, offset: u64, length: u64) -> ZipResult<RegionStream> {
        if !self.is_open() {
            return Err(ZipError::InvalidUsage("archive has been closed"));
        }
        if offset.checked_add(length).map_or(true, |end| end > self.size) {
            return Err(Self::eof_error());
        }

        self.active_streams.fetch_add(1, Ordering::SeqCst);
        Ok(RegionStream {
            source: Arc::clone(&self.source),
            position: offset,
            remaining: length,
            chunk: Bytes::new(),
            pending: None,
            _guard: StreamGuard(Arc::clone(&self.active_streams)),
        })
    }

    /// Mark the reader closed. Idempotent.
    ///
    /// In-flight header reads get one scheduler turn to drain; if any
    /// remain after that, closing fails. Streams opened earlier keep
    /// their own handle on the source and are unaffected.
    pub async fn close(&self) -> ZipResult<()> {
        if !self.is_open() {
            return Ok(());
        }
        if self.inflight_reads.load(Ordering::SeqCst) > 0 {
            task::yield_now().await;
            if self.inflight_reads.load(Ordering::SeqCst) > 0 {
                return Err(ZipError::InvalidUsage(
                    "Cannot close while reading in progress",
                ));
            }
        }
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct StreamGuard(Arc<AtomicUsize>);

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

type ChunkFuture = Pin<Box<dyn Future<Output = io::Result<Bytes>> + Send>>;

/// An `AsyncRead` over a fixed byte range of a [`ReadAt`] source.
///
/// Chunks are fetched only when polled, so a slow consumer never forces
/// the source to read ahead. Delivers exactly the requested number of
/// bytes; a source that runs dry earlier surfaces "Unexpected end of
/// file". A zero-length region is an immediately-ended stream.
pub struct RegionStream {
    source: Arc<dyn ReadAt + 'static>,
    position: u64,
    remaining: u64,
    chunk: Bytes,
    pending: Option<ChunkFuture>,
    _guard: StreamGuard,
}

impl RegionStream {
    fn spawn_chunk(&mut self) {
        let length = STREAM_CHUNK_LENGTH.min(self.remaining as usize);
        let source = Arc::clone(&self.source);
        let position = self.position;
        self.pending = Some(Box::pin(async move {
            let mut buf = vec![0u8; length];
            let mut filled = 0;
            while filled < length {
                let n = source.read_at(position + filled as u64, &mut buf[filled..]).await?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "Unexpected end of file",
                    ));
                }
                filled += n;
            }
            Ok(Bytes::from(buf))
        }));
    }
}

impl AsyncRead for RegionStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let s = self.get_mut();
        loop {
            if !s.chunk.is_empty() {
                let n = s.chunk.len().min(buf.remaining());
                buf.put_slice(&s.chunk.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if s.remaining == 0 {
                // End of region
                return Poll::Ready(Ok(()));
            }
            if s.pending.is_none() {
                s.spawn_chunk();
            }
            match s.pending.as_mut().unwrap().as_mut().poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => {
                    s.pending = None;
                    return Poll::Ready(Err(e));
                }
                Poll::Ready(Ok(chunk)) => {
                    s.pending = None;
                    s.position += chunk.len() as u64;
                    s.remaining -= chunk.len() as u64;
                    s.chunk = chunk;
                }
            }
        }
    }
}
