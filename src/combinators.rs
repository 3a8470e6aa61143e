//! Stream adaptors that make up the entry read pipeline.
//!
//! `open_read_stream` composes a chain of `AsyncRead` transforms over
//! the raw byte region of an entry: raw inflate, then the
//! uncompressed-size validator, then CRC32 validation. Each link reads
//! from the previous one, so backpressure propagates end-to-end and
//! every failure travels the one error channel `poll_read` provides.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use async_compression::tokio::bufread::DeflateDecoder;
use log::debug;
use tokio::io::{AsyncRead, BufReader, ReadBuf};

use crate::crc32::Crc32Reader;
use crate::read::ArchiveInner;
use crate::reader::RegionStream;
use crate::types::UncertainSize;

/// Counts post-inflate bytes against the entry's expected size.
///
/// For a (possibly) Mac archive the expected size may be a truncated
/// value: overrunning it by up to 2^32 means the Archive Utility wrote
/// `size mod 2^32`, so the expectation is enlarged in place and the
/// archive promoted to definitely-Mac. Overrunning a certain size is
/// plain corruption.
pub(crate) struct SizeValidatingReader<R> {
    inner: R,
    count: u64,
    expected: Arc<UncertainSize>,
    archive: Weak<ArchiveInner>,
    entry_id: u64,
}

impl<R> SizeValidatingReader<R> {
    pub(crate) fn new(
        inner: R,
        expected: Arc<UncertainSize>,
        archive: Weak<ArchiveInner>,
        entry_id: u64,
    ) -> Self {
        Self {
            inner,
            count: 0,
            expected,
            archive,
            entry_id,
        }
    }

    fn finish(&self) -> io::Result<()> {
        let expected = self.expected.get();
        if self.count < expected {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Too few bytes during inflation",
            ));
        }
        // count > expected is handled as it happens; equality confirms
        // the stored size.
        self.expected.mark_certain();
        if let Some(archive) = self.archive.upgrade() {
            archive.remove_uncertain(self.entry_id);
        }
        Ok(())
    }

    fn overflowed(&mut self) -> io::Result<()> {
        while self.count > self.expected.get() {
            if self.expected.is_certain() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "Too many bytes during inflation",
                ));
            }
            // The stored size was truncated modulo 2^32 by the Archive
            // Utility; this is the decisive evidence.
            let enlarged = self.expected.enlarge();
            debug!(
                "entry {} inflated past its stored size, enlarging to {}",
                self.entry_id, enlarged
            );
            if let Some(archive) = self.archive.upgrade() {
                archive.promote_to_mac_if_maybe();
            }
        }
        Ok(())
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for SizeValidatingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let s = self.get_mut();
        let start = buf.filled().len();

        match Pin::new(&mut s.inner).poll_read(cx, buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {
                let written = buf.filled().len() - start;
                if written == 0 {
                    if buf.remaining() > 0 {
                        if let Err(e) = s.finish() {
                            return Poll::Ready(Err(e));
                        }
                    }
                } else {
                    s.count += written as u64;
                    if s.count > s.expected.get() {
                        if let Err(e) = s.overflowed() {
                            return Poll::Ready(Err(e));
                        }
                    }
                }
                Poll::Ready(Ok(()))
            }
        }
    }
}

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;

/// A stream over one entry's (optionally inflated and validated) file
/// data, obtained from
/// [`ZipArchive::open_read_stream`][crate::ZipArchive::open_read_stream].
///
/// Dropping the stream cancels it without affecting other streams or the
/// archive's underlying descriptor.
pub struct EntryStream {
    inner: BoxedRead,
}

impl std::fmt::Debug for EntryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryStream").finish_non_exhaustive()
    }
}

impl EntryStream {
    /// Compose the transform chain for one entry stream.
    pub(crate) fn build(
        region: RegionStream,
        decompress: bool,
        size_check: Option<(Arc<UncertainSize>, Weak<ArchiveInner>, u64)>,
        validate_crc32: Option<u32>,
    ) -> EntryStream {
        let mut inner: BoxedRead = Box::new(region);
        if decompress {
            inner = Box::new(DeflateDecoder::new(BufReader::new(inner)));
            if let Some((expected, archive, entry_id)) = size_check {
                inner = Box::new(SizeValidatingReader::new(inner, expected, archive, entry_id));
            }
        }
        if let Some(checksum) = validate_crc32 {
            inner = Box::new(Crc32Reader::new(inner, checksum));
        }
        EntryStream { inner }
    }
}

impl AsyncRead for EntryStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}
