//! Length-prefixed frame codec.
//!
//! Wire layout: `[kind: u8][len: i32 little-endian][payload: len bytes]`.
//! Works over any AsyncRead/AsyncWrite (pipes, sockets, WebSocket adapters).
//!
//! Reading is done by hand instead of through `FramedRead`: stream-bearing
//! frames hand the raw reader to a [`StreamSlice`](super::slice::StreamSlice),
//! so nothing may be buffered past the current frame header.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::Encoder;

use super::protocol::FrameKind;
use crate::error::{FramingError, RpcError};

/// Size of `[kind][len]`.
pub const HEADER_LEN: usize = 5;

/// Largest payload the length field can describe.
pub const MAX_FRAME_LEN: usize = i32::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub len: usize,
}

impl FrameHeader {
    pub fn new(kind: FrameKind, len: usize) -> Result<Self, FramingError> {
        if len > MAX_FRAME_LEN {
            return Err(FramingError::MessageTooLarge {
                len,
                max: MAX_FRAME_LEN,
            });
        }
        Ok(Self { kind, len })
    }

    pub fn parse(raw: [u8; HEADER_LEN]) -> Result<Self, FramingError> {
        let kind = FrameKind::try_from(raw[0])?;
        let len = i32::from_le_bytes([raw[1], raw[2], raw[3], raw[4]]);
        let len = usize::try_from(len).map_err(|_| FramingError::NegativeLength(len))?;
        Ok(Self { kind, len })
    }

    fn put(&self, dst: &mut BytesMut) {
        dst.put_u8(self.kind as u8);
        // new() guarantees len fits
        dst.put_i32_le(self.len as i32);
    }
}

/// Encodes whole frames into one contiguous buffer so a frame is a single write.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = RpcError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let header = FrameHeader::new(item.kind, item.payload.len())?;
        dst.reserve(HEADER_LEN + header.len);
        header.put(dst);
        dst.extend_from_slice(&item.payload);
        tracing::trace!(kind = ?item.kind, len = header.len, "Encoding frame");
        if header.len > 100_000 {
            tracing::debug!(
                kind = ?item.kind,
                size_kb = header.len / 1024,
                "Large frame being encoded"
            );
        }
        Ok(())
    }
}

/// Write one complete frame. The caller holds the connection's send lock.
pub async fn write_frame<W>(writer: &mut W, kind: FrameKind, payload: &[u8]) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = BytesMut::new();
    FrameCodec.encode(Frame::new(kind, Bytes::copy_from_slice(payload)), &mut buf)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Write only the header of a stream-bearing frame; the body follows separately.
pub async fn write_frame_header<W>(writer: &mut W, header: FrameHeader) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = BytesMut::with_capacity(HEADER_LEN);
    header.put(&mut buf);
    writer.write_all(&buf).await?;
    Ok(())
}

/// Read one frame header.
///
/// Returns `Ok(None)` when the stream ends exactly at a frame boundary. A
/// stream that ends inside the header is [`FramingError::Truncated`].
pub async fn read_frame_header<R>(reader: &mut R) -> Result<Option<FrameHeader>, RpcError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut raw = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut raw[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FramingError::Truncated.into());
        }
        filled += n;
    }
    Ok(Some(FrameHeader::parse(raw)?))
}

/// Read the payload that belongs to `header`, enforcing `max_payload`.
///
/// The limit is checked before any payload byte is read, so an oversized
/// frame never delivers partial data.
pub async fn read_payload<R>(
    reader: &mut R,
    header: FrameHeader,
    max_payload: usize,
) -> Result<Bytes, RpcError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    if header.len > max_payload {
        return Err(FramingError::MessageTooLarge {
            len: header.len,
            max: max_payload,
        }
        .into());
    }
    let mut payload = vec![0u8; header.len];
    match reader.read_exact(&mut payload).await {
        Ok(_) => Ok(Bytes::from(payload)),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(FramingError::Truncated.into())
        }
        Err(e) => Err(e.into()),
    }
}

/// Read one complete frame, or `Ok(None)` on orderly end of stream.
pub async fn read_frame<R>(reader: &mut R, max_payload: usize) -> Result<Option<Frame>, RpcError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let Some(header) = read_frame_header(reader).await? else {
        return Ok(None);
    };
    let payload = read_payload(reader, header, max_payload).await?;
    Ok(Some(Frame {
        kind: header.kind,
        payload,
    }))
}
