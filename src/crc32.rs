//! Helper module to compute a CRC32 checksum

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use crc32fast::Hasher;
use tokio::io::{AsyncRead, ReadBuf};

/// Reader that validates the CRC32 when it reaches the end of the stream.
pub(crate) struct Crc32Reader<R> {
    inner: R,
    hasher: Hasher,
    check: u32,
}

impl<R> Crc32Reader<R> {
    /// Get a new Crc32Reader which checks the inner reader against checksum.
    pub(crate) fn new(inner: R, checksum: u32) -> Crc32Reader<R> {
        Crc32Reader {
            inner,
            hasher: Hasher::new(),
            check: checksum,
        }
    }

    fn check_matches(&self) -> bool {
        self.check == self.hasher.clone().finalize()
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for Crc32Reader<R> {
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
                    // End of stream: the digest must agree now.
                    if buf.remaining() > 0 && !s.check_matches() {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "Invalid checksum",
                        )));
                    }
                } else {
                    s.hasher.update(&buf.filled()[start..]);
                }
                Poll::Ready(Ok(()))
            }
        }
    }
}
