//! Bounded views over the shared connection stream.
//!
//! Stream-typed parameters and results travel inline: the stream frame's
//! header declares a length, and exactly that many raw bytes follow before
//! the next frame header. [`StreamSlice`] exposes only those bytes to the
//! consumer; [`OutboundStream`] is the sending-side counterpart.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, ready};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::bytes::Bytes;

use super::codec::{FrameHeader, write_frame_header};
use super::protocol::FrameKind;
use crate::error::{FramingError, RpcError};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The read half of a connection, shared between the receive pump and at
/// most one live [`StreamSlice`].
pub type SharedReader = Arc<Mutex<BoxedReader>>;

/// Read-only view of the next `len` bytes of the connection stream.
///
/// The slice holds the connection's reader while it is alive, so the receive
/// pump cannot read the next frame until the slice is dropped. Bytes left
/// unread on drop are drained by the pump before it continues. Connection
/// streams are not seekable; skipping is always done by draining.
pub struct StreamSlice {
    reader: Option<OwnedMutexGuard<BoxedReader>>,
    len: u64,
    remaining: Arc<AtomicU64>,
}

impl StreamSlice {
    /// Take the shared reader for the next `len` bytes.
    pub(crate) fn open(reader: OwnedMutexGuard<BoxedReader>, len: u64) -> (Self, SliceTracker) {
        let remaining = Arc::new(AtomicU64::new(len));
        let slice = Self {
            reader: Some(reader),
            len,
            remaining: Arc::clone(&remaining),
        };
        (slice, SliceTracker { remaining })
    }

    /// Total number of bytes declared by the stream frame.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes not yet read.
    pub fn remaining(&self) -> u64 {
        self.remaining.load(Ordering::Acquire)
    }

    /// Read the whole slice into memory.
    pub async fn read_to_vec(&mut self) -> io::Result<Vec<u8>> {
        let hint = usize::try_from(self.remaining()).unwrap_or(usize::MAX);
        let mut out = Vec::with_capacity(hint.min(64 * 1024));
        self.read_to_end(&mut out).await?;
        Ok(out)
    }

    /// Skip whatever is left and release the connection reader.
    pub async fn drain(mut self) -> io::Result<u64> {
        tokio::io::copy(&mut self, &mut tokio::io::sink()).await
    }
}

impl AsyncRead for StreamSlice {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let remaining = this.remaining.load(Ordering::Acquire);
        if remaining == 0 || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        let Some(reader) = this.reader.as_mut() else {
            return Poll::Ready(Ok(()));
        };

        let max = usize::try_from(remaining)
            .unwrap_or(usize::MAX)
            .min(buf.remaining());
        let n = {
            let dst = buf.initialize_unfilled_to(max);
            let mut limited = ReadBuf::new(dst);
            ready!(Pin::new(&mut **reader).poll_read(cx, &mut limited))?;
            limited.filled().len()
        };
        if n == 0 {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "connection ended with {remaining} of {} stream bytes unread",
                    this.len
                ),
            )));
        }
        buf.advance(n);
        this.remaining.fetch_sub(n as u64, Ordering::AcqRel);
        Poll::Ready(Ok(()))
    }
}

impl fmt::Debug for StreamSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSlice")
            .field("len", &self.len)
            .field("remaining", &self.remaining())
            .finish()
    }
}

/// Pump-side handle used to take the reader back once a slice is released.
#[derive(Debug)]
pub(crate) struct SliceTracker {
    remaining: Arc<AtomicU64>,
}

impl SliceTracker {
    /// Wait for the slice to be dropped, then skip its unread bytes so the
    /// reader is positioned at the next frame header.
    pub(crate) async fn reclaim(
        self,
        shared: &SharedReader,
    ) -> io::Result<OwnedMutexGuard<BoxedReader>> {
        let mut guard = Arc::clone(shared).lock_owned().await;
        let left = self.remaining.load(Ordering::Acquire);
        if left > 0 {
            tracing::debug!(unread = left, "Draining unread stream bytes");
            let skipped = tokio::io::copy(&mut (&mut *guard).take(left), &mut tokio::io::sink()).await?;
            if skipped < left {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection ended inside a stream body",
                ));
            }
        }
        Ok(guard)
    }
}

/// A stream body to send after a Request or Response frame.
pub struct OutboundStream {
    reader: BoxedReader,
    len: u64,
}

impl OutboundStream {
    /// Send exactly `len` bytes read from `reader`.
    ///
    /// If `reader` ends early the connection is torn down, because the peer
    /// can no longer find the next frame boundary.
    pub fn new(reader: impl AsyncRead + Send + Unpin + 'static, len: u64) -> Self {
        Self {
            reader: Box::new(reader),
            len,
        }
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        let len = bytes.len() as u64;
        Self::new(io::Cursor::new(bytes), len)
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Write the stream frame header and body. Caller holds the send lock.
    pub(crate) async fn write_to<W>(mut self, writer: &mut W, kind: FrameKind) -> Result<(), RpcError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let len = usize::try_from(self.len).unwrap_or(usize::MAX);
        write_frame_header(writer, FrameHeader::new(kind, len)?).await?;
        let written = tokio::io::copy(&mut (&mut self.reader).take(self.len), writer).await?;
        if written < self.len {
            return Err(FramingError::ShortStreamBody {
                declared: self.len,
                written,
            }
            .into());
        }
        writer.flush().await?;
        tracing::trace!(?kind, len = self.len, "Stream body written");
        Ok(())
    }
}

impl fmt::Debug for OutboundStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundStream")
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}
