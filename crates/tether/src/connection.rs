//! One live duplex stream and its receive pump.
//!
//! A [`Connection`] exclusively owns the stream. Outbound frames go through a
//! single send mutex so frames (and a frame plus its stream body) never
//! interleave. One pump task reads frames in wire order and hands each one to
//! the [`ConnectionHandler`].
//!
//! Lifecycle: `Created -> Listening -> Closed`. Closed is terminal; a closed
//! connection is never restarted.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::{FrameHeader, read_frame_header, read_payload, write_frame};
use crate::bridge::protocol::{CancellationRequest, FrameKind, Request, Response};
use crate::bridge::slice::{
    BoxedReader, BoxedWriter, OutboundStream, SharedReader, SliceTracker, StreamSlice,
};
use crate::config::EngineConfig;
use crate::error::{FramingError, RpcError};
use crate::serializer::{self, Serializer};

const CREATED: u8 = 0;
const LISTENING: u8 = 1;
const CLOSED: u8 = 2;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Why a connection stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the stream at a frame boundary.
    EndOfStream,
    Io(String),
    Framing(FramingError),
    /// [`Connection::close`] was called.
    Local,
}

impl CloseReason {
    fn from_error(err: RpcError) -> Self {
        match err {
            RpcError::Framing(e) => Self::Framing(e),
            other => Self::Io(other.to_string()),
        }
    }

    /// The fault handed to every call still waiting on this connection.
    pub fn to_error(&self) -> RpcError {
        RpcError::connection_broken(self.to_string())
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EndOfStream => f.write_str("peer closed the connection"),
            Self::Io(e) => write!(f, "i/o error: {e}"),
            Self::Framing(e) => write!(f, "framing error: {e}"),
            Self::Local => f.write_str("connection closed locally"),
        }
    }
}

/// How far a send raced against an abort token got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendProgress {
    /// The frame and its stream body were written.
    Written,
    /// The token fired before the send lock was taken. Nothing was written.
    Skipped,
    /// The token fired mid-write. The frame finishes in the background so the
    /// stream is never left inside a frame.
    Detached,
}

/// Receives the frames a connection reads.
///
/// Callbacks are awaited by the receive pump in wire order, so bookkeeping done
/// in a callback is visible before the next frame is handled. Implementations
/// must hand long-running work to a spawned task. Stream slices passed to
/// `on_request`/`on_response` hold the connection's reader: the next frame is
/// not read until the slice is dropped.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    async fn on_request(&self, request: Request, upload: Option<StreamSlice>);

    async fn on_response(&self, response: Response, download: Option<StreamSlice>);

    async fn on_cancellation(&self, request: CancellationRequest);

    /// Called exactly once, after the pump has stopped.
    async fn on_closed(&self, reason: CloseReason);
}

pub struct Connection {
    id: u64,
    reader: SharedReader,
    writer: Arc<Mutex<BoxedWriter>>,
    state: AtomicU8,
    handler: Weak<dyn ConnectionHandler>,
    serializer: Arc<dyn Serializer>,
    config: EngineConfig,
    shutdown: CancellationToken,
    close_reason: OnceLock<CloseReason>,
    closed_notified: AtomicBool,
    closed: CancellationToken,
}

impl Connection {
    /// Take ownership of a duplex stream. Nothing is read until [`listen`](Self::listen).
    pub fn new<S>(
        stream: S,
        handler: Weak<dyn ConnectionHandler>,
        serializer: Arc<dyn Serializer>,
        config: EngineConfig,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_parts(Box::new(reader), Box::new(writer), handler, serializer, config)
    }

    pub fn from_parts(
        reader: BoxedReader,
        writer: BoxedWriter,
        handler: Weak<dyn ConnectionHandler>,
        serializer: Arc<dyn Serializer>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(connection = id, "Connection created");
        Arc::new(Self {
            id,
            reader: Arc::new(Mutex::new(reader)),
            writer: Arc::new(Mutex::new(writer)),
            state: AtomicU8::new(CREATED),
            handler,
            serializer,
            config,
            shutdown: CancellationToken::new(),
            close_reason: OnceLock::new(),
            closed_notified: AtomicBool::new(false),
            closed: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn serializer(&self) -> &dyn Serializer {
        &*self.serializer
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start the receive pump. Idempotent.
    pub fn listen(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(CREATED, LISTENING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::debug!(connection = self.id, "Receive pump starting");
            tokio::spawn(Arc::clone(self).run_pump());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == CLOSED
    }

    /// Resolves once the connection has closed and `on_closed` has run.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Token that fires as soon as the connection starts shutting down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.close_reason.get()
    }

    /// Stop the pump and shut down the write half.
    pub fn close(self: &Arc<Self>) {
        self.close_with(CloseReason::Local);
    }

    fn close_with(self: &Arc<Self>, reason: CloseReason) {
        let _ = self.close_reason.set(reason);
        let previous = self.state.swap(CLOSED, Ordering::AcqRel);
        self.shutdown.cancel();
        if previous == CREATED {
            // No pump to observe the shutdown token.
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let this = Arc::clone(self);
                runtime.spawn(async move { this.finish(CloseReason::Local).await });
            }
        }
    }

    pub async fn send_request(
        self: &Arc<Self>,
        request: &Request,
        upload: Option<OutboundStream>,
    ) -> Result<(), RpcError> {
        let payload = self.encode_request(request, upload.is_some())?;
        self.send(
            FrameKind::Request,
            payload,
            upload.map(|s| (FrameKind::UploadStream, s)),
            None,
        )
        .await
        .map(|_| ())
    }

    /// Send a request unless `abort` fires first.
    ///
    /// Waiting for the send lock stops as soon as `abort` fires. Once writing
    /// has begun the frame is always completed, in a detached task if `abort`
    /// fires meanwhile. `started` is set when the lock is taken, before any
    /// byte is written.
    pub async fn send_request_until(
        self: &Arc<Self>,
        request: &Request,
        upload: Option<OutboundStream>,
        abort: &CancellationToken,
        started: &AtomicBool,
    ) -> Result<SendProgress, RpcError> {
        let payload = self.encode_request(request, upload.is_some())?;
        self.send(
            FrameKind::Request,
            payload,
            upload.map(|s| (FrameKind::UploadStream, s)),
            Some((abort, started)),
        )
        .await
    }

    fn encode_request(&self, request: &Request, has_upload: bool) -> Result<Bytes, RpcError> {
        debug_assert_eq!(request.upload, has_upload);
        let payload = serializer::encode(&*self.serializer, request)?;
        tracing::trace!(
            connection = self.id,
            request_id = %request.id,
            endpoint = %request.endpoint,
            method = %request.method,
            "Sending request"
        );
        Ok(payload)
    }

    pub async fn send_response(
        self: &Arc<Self>,
        response: &Response,
        download: Option<OutboundStream>,
    ) -> Result<(), RpcError> {
        debug_assert_eq!(response.download_stream, download.is_some());
        let payload = serializer::encode(&*self.serializer, response)?;
        tracing::trace!(
            connection = self.id,
            request_id = %response.request_id,
            is_error = response.error.is_some(),
            "Sending response"
        );
        self.send(
            FrameKind::Response,
            payload,
            download.map(|s| (FrameKind::DownloadStream, s)),
            None,
        )
        .await
        .map(|_| ())
    }

    pub async fn send_cancellation(
        self: &Arc<Self>,
        request: &CancellationRequest,
    ) -> Result<(), RpcError> {
        let payload = serializer::encode(&*self.serializer, request)?;
        tracing::trace!(connection = self.id, request_id = %request.request_id, "Sending cancellation");
        self.send(FrameKind::CancellationRequest, payload, None, None)
            .await
            .map(|_| ())
    }

    async fn send(
        self: &Arc<Self>,
        kind: FrameKind,
        payload: Bytes,
        stream: Option<(FrameKind, OutboundStream)>,
        abort: Option<(&CancellationToken, &AtomicBool)>,
    ) -> Result<SendProgress, RpcError> {
        // Local limit violations fail the call, not the connection.
        if payload.len() > self.config.max_payload_size {
            return Err(FramingError::MessageTooLarge {
                len: payload.len(),
                max: self.config.max_payload_size,
            }
            .into());
        }
        if let Some((_, body)) = &stream
            && body.len() > self.config.max_stream_length
        {
            return Err(FramingError::MessageTooLarge {
                len: usize::try_from(body.len()).unwrap_or(usize::MAX),
                max: usize::try_from(self.config.max_stream_length).unwrap_or(usize::MAX),
            }
            .into());
        }

        self.listen();

        let lock = Arc::clone(&self.writer).lock_owned();
        let Some((abort, started)) = abort else {
            let writer = lock.await;
            if self.is_closed() {
                return Err(self.broken());
            }
            self.write_locked(writer, kind, payload, stream).await?;
            return Ok(SendProgress::Written);
        };

        let writer = tokio::select! {
            biased;
            _ = abort.cancelled() => return Ok(SendProgress::Skipped),
            writer = lock => writer,
        };
        if self.is_closed() {
            return Err(self.broken());
        }
        started.store(true, Ordering::Release);

        let this = Arc::clone(self);
        let mut write =
            tokio::spawn(async move { this.write_locked(writer, kind, payload, stream).await });
        tokio::select! {
            biased;
            written = &mut write => match written {
                Ok(result) => result.map(|()| SendProgress::Written),
                Err(e) => Err(RpcError::connection_broken(format!("send task failed: {e}"))),
            },
            _ = abort.cancelled() => {
                tracing::debug!(connection = self.id, ?kind, "Send abandoned mid-write, finishing in background");
                Ok(SendProgress::Detached)
            }
        }
    }

    /// Write one frame while holding the send lock. A write stuck on a peer
    /// that stopped reading gives up when the connection shuts down.
    async fn write_locked(
        self: &Arc<Self>,
        mut writer: OwnedMutexGuard<BoxedWriter>,
        kind: FrameKind,
        payload: Bytes,
        stream: Option<(FrameKind, OutboundStream)>,
    ) -> Result<(), RpcError> {
        let write = async {
            write_frame(&mut **writer, kind, &payload).await?;
            if let Some((stream_kind, body)) = stream {
                body.write_to(&mut **writer, stream_kind).await?;
            }
            Ok::<_, RpcError>(())
        };
        let result = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                tracing::trace!(connection = self.id, ?kind, "Write interrupted by shutdown");
                return Err(self.broken());
            }
            result = write => result,
        };
        drop(writer);

        if let Err(e) = result {
            tracing::error!(connection = self.id, ?kind, error = %e, "Write failed, closing connection");
            let reason = CloseReason::from_error(e);
            let err = reason.to_error();
            self.close_with(reason);
            return Err(err);
        }
        Ok(())
    }

    fn broken(&self) -> RpcError {
        self.close_reason
            .get()
            .map(CloseReason::to_error)
            .unwrap_or_else(|| RpcError::connection_broken("connection closed"))
    }

    async fn run_pump(self: Arc<Self>) {
        let mut reader = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                self.finish(CloseReason::Local).await;
                return;
            }
            guard = Arc::clone(&self.reader).lock_owned() => guard,
        };

        let reason = loop {
            let header = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break CloseReason::Local,
                header = read_frame_header(&mut *reader) => header,
            };
            let header = match header {
                Ok(Some(header)) => header,
                Ok(None) => {
                    tracing::debug!(connection = self.id, "Peer closed the stream");
                    break CloseReason::EndOfStream;
                }
                Err(e) => break CloseReason::from_error(e),
            };
            tracing::trace!(connection = self.id, kind = ?header.kind, len = header.len, "Frame received");

            reader = match self.on_frame(header, reader).await {
                Ok(reader) => reader,
                Err(reason) => break reason,
            };
        };

        self.finish(reason).await;
    }

    /// Route one frame. Returns the reader positioned at the next frame header.
    async fn on_frame(
        &self,
        header: FrameHeader,
        mut reader: OwnedMutexGuard<BoxedReader>,
    ) -> Result<OwnedMutexGuard<BoxedReader>, CloseReason> {
        match header.kind {
            FrameKind::Request => {
                let payload = self.read_envelope(&mut reader, header).await?;
                let request: Request = match serializer::decode(&*self.serializer, &payload) {
                    Ok(request) => request,
                    Err(e) => {
                        tracing::warn!(connection = self.id, error = %e, "Dropping undecodable request");
                        return Ok(reader);
                    }
                };
                let Some(handler) = self.handler.upgrade() else {
                    return Err(CloseReason::Local);
                };
                if !request.upload {
                    handler.on_request(request, None).await;
                    return Ok(reader);
                }
                let (slice, tracker) =
                    self.open_stream(reader, FrameKind::UploadStream).await?;
                handler.on_request(request, Some(slice)).await;
                self.reclaim(tracker).await
            }
            FrameKind::Response => {
                let payload = self.read_envelope(&mut reader, header).await?;
                let response: Response = match serializer::decode(&*self.serializer, &payload) {
                    Ok(response) => response,
                    Err(e) => {
                        tracing::warn!(connection = self.id, error = %e, "Dropping undecodable response");
                        return Ok(reader);
                    }
                };
                let Some(handler) = self.handler.upgrade() else {
                    return Err(CloseReason::Local);
                };
                if !response.download_stream {
                    handler.on_response(response, None).await;
                    return Ok(reader);
                }
                let (slice, tracker) =
                    self.open_stream(reader, FrameKind::DownloadStream).await?;
                handler.on_response(response, Some(slice)).await;
                self.reclaim(tracker).await
            }
            FrameKind::CancellationRequest => {
                let payload = self.read_envelope(&mut reader, header).await?;
                match serializer::decode::<CancellationRequest>(&*self.serializer, &payload) {
                    Ok(cancel) => {
                        let Some(handler) = self.handler.upgrade() else {
                            return Err(CloseReason::Local);
                        };
                        handler.on_cancellation(cancel).await;
                    }
                    Err(e) => {
                        tracing::warn!(connection = self.id, error = %e, "Dropping undecodable cancellation");
                    }
                }
                Ok(reader)
            }
            FrameKind::UploadStream | FrameKind::DownloadStream => {
                self.check_stream_len(header)?;
                tracing::warn!(
                    connection = self.id,
                    kind = ?header.kind,
                    len = header.len,
                    "Unannounced stream frame, draining"
                );
                let len = header.len as u64;
                let mut limited = (&mut *reader).take(len);
                let mut sink = tokio::io::sink();
                let drained = tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => return Err(CloseReason::Local),
                    drained = tokio::io::copy(&mut limited, &mut sink) => drained,
                };
                let skipped = drained.map_err(|e| CloseReason::Io(e.to_string()))?;
                if skipped < len {
                    return Err(CloseReason::Framing(FramingError::Truncated));
                }
                Ok(reader)
            }
        }
    }

    async fn read_envelope(
        &self,
        reader: &mut OwnedMutexGuard<BoxedReader>,
        header: FrameHeader,
    ) -> Result<Bytes, CloseReason> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(CloseReason::Local),
            payload = read_payload(&mut **reader, header, self.config.max_payload_size) => {
                payload.map_err(CloseReason::from_error)
            }
        }
    }

    /// Read the stream frame header that must follow an announcing envelope.
    async fn open_stream(
        &self,
        mut reader: OwnedMutexGuard<BoxedReader>,
        expected: FrameKind,
    ) -> Result<(StreamSlice, SliceTracker), CloseReason> {
        let header = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(CloseReason::Local),
            header = read_frame_header(&mut *reader) => header,
        };
        let header = match header {
            Ok(Some(header)) => header,
            Ok(None) => return Err(CloseReason::Framing(FramingError::Truncated)),
            Err(e) => return Err(CloseReason::from_error(e)),
        };
        if header.kind != expected {
            return Err(CloseReason::Framing(FramingError::UnexpectedKind {
                expected: if expected == FrameKind::UploadStream {
                    "UploadStream"
                } else {
                    "DownloadStream"
                },
                actual: format!("{:?}", header.kind),
            }));
        }
        self.check_stream_len(header)?;
        Ok(StreamSlice::open(reader, header.len as u64))
    }

    fn check_stream_len(&self, header: FrameHeader) -> Result<(), CloseReason> {
        if header.len as u64 > self.config.max_stream_length {
            return Err(CloseReason::Framing(FramingError::MessageTooLarge {
                len: header.len,
                max: usize::try_from(self.config.max_stream_length).unwrap_or(usize::MAX),
            }));
        }
        Ok(())
    }

    async fn reclaim(
        &self,
        tracker: SliceTracker,
    ) -> Result<OwnedMutexGuard<BoxedReader>, CloseReason> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(CloseReason::Local),
            reader = tracker.reclaim(&self.reader) => reader.map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    CloseReason::Framing(FramingError::Truncated)
                } else {
                    CloseReason::Io(e.to_string())
                }
            }),
        }
    }

    async fn finish(&self, reason: CloseReason) {
        // A reason recorded by close_with() beats the pump's view of it.
        let reason = self.close_reason.get_or_init(|| reason).clone();
        self.state.store(CLOSED, Ordering::Release);
        self.shutdown.cancel();

        if self.closed_notified.swap(true, Ordering::AcqRel) {
            return;
        }

        match &reason {
            CloseReason::EndOfStream | CloseReason::Local => {
                tracing::debug!(connection = self.id, %reason, "Connection closed");
            }
            CloseReason::Io(_) | CloseReason::Framing(_) => {
                tracing::error!(connection = self.id, %reason, "Connection failed");
            }
        }

        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                tracing::trace!(connection = self.id, error = %e, "Write half shutdown failed");
            }
        }

        if let Some(handler) = self.handler.upgrade() {
            handler.on_closed(reason).await;
        }
        self.closed.cancel();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::codec::write_frame as raw_write;
    use crate::bridge::protocol::RequestId;
    use crate::serializer::JsonSerializer;
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;

    #[derive(Debug)]
    enum Event {
        Request(Request, Option<Vec<u8>>),
        Response(Response, Option<Vec<u8>>),
        Cancel(CancellationRequest),
        Closed(CloseReason),
    }

    struct Recorder {
        tx: mpsc::UnboundedSender<Event>,
    }

    #[async_trait]
    impl ConnectionHandler for Recorder {
        async fn on_request(&self, request: Request, upload: Option<StreamSlice>) {
            let body = match upload {
                Some(mut slice) => Some(slice.read_to_vec().await.unwrap()),
                None => None,
            };
            let _ = self.tx.send(Event::Request(request, body));
        }

        async fn on_response(&self, response: Response, download: Option<StreamSlice>) {
            let body = match download {
                Some(mut slice) => Some(slice.read_to_vec().await.unwrap()),
                None => None,
            };
            let _ = self.tx.send(Event::Response(response, body));
        }

        async fn on_cancellation(&self, request: CancellationRequest) {
            let _ = self.tx.send(Event::Cancel(request));
        }

        async fn on_closed(&self, reason: CloseReason) {
            let _ = self.tx.send(Event::Closed(reason));
        }
    }

    fn setup(
        config: EngineConfig,
    ) -> (
        Arc<Connection>,
        Arc<Recorder>,
        mpsc::UnboundedReceiver<Event>,
        DuplexStream,
    ) {
        let (local, peer) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = mpsc::unbounded_channel();
        let recorder = Arc::new(Recorder { tx });
        let handler: Weak<dyn ConnectionHandler> = Arc::downgrade(&recorder) as Weak<dyn ConnectionHandler>;
        let conn = Connection::new(local, handler, Arc::new(JsonSerializer), config);
        (conn, recorder, rx, peer)
    }

    fn json_bytes<T: serde::Serialize>(value: &T) -> Vec<u8> {
        serde_json::to_vec(value).unwrap()
    }

    #[tokio::test]
    async fn dispatches_request_and_cancellation() {
        let (conn, _recorder, mut rx, mut peer) = setup(EngineConfig::default());
        conn.listen();

        let req = Request::new("svc", "Add").with_id(RequestId::from("r1"));
        raw_write(&mut peer, FrameKind::Request, &json_bytes(&req)).await.unwrap();
        match rx.recv().await.unwrap() {
            Event::Request(got, None) => assert_eq!(got.id, RequestId::from("r1")),
            other => panic!("unexpected {other:?}"),
        }

        let cancel = CancellationRequest {
            request_id: RequestId::from("r1"),
        };
        raw_write(&mut peer, FrameKind::CancellationRequest, &json_bytes(&cancel))
            .await
            .unwrap();
        assert!(matches!(rx.recv().await.unwrap(), Event::Cancel(c) if c == cancel));
    }

    #[tokio::test]
    async fn upload_body_is_bounded_and_next_frame_follows() {
        let (conn, _recorder, mut rx, mut peer) = setup(EngineConfig::default());
        conn.listen();

        let mut req = Request::new("svc", "Upload").with_id(RequestId::from("up"));
        req.upload = true;
        raw_write(&mut peer, FrameKind::Request, &json_bytes(&req)).await.unwrap();
        OutboundStream::from_bytes(vec![7u8; 100])
            .write_to(&mut peer, FrameKind::UploadStream)
            .await
            .unwrap();
        let resp = Response::data(RequestId::from("other"), serde_json::json!(1));
        raw_write(&mut peer, FrameKind::Response, &json_bytes(&resp)).await.unwrap();

        match rx.recv().await.unwrap() {
            Event::Request(got, Some(body)) => {
                assert_eq!(got.id, RequestId::from("up"));
                assert_eq!(body, vec![7u8; 100]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(rx.recv().await.unwrap(), Event::Response(r, None) if r == resp));
    }

    #[tokio::test]
    async fn unannounced_stream_frame_is_drained() {
        let (conn, _recorder, mut rx, mut peer) = setup(EngineConfig::default());
        conn.listen();

        OutboundStream::from_bytes(vec![1u8; 32])
            .write_to(&mut peer, FrameKind::DownloadStream)
            .await
            .unwrap();
        let req = Request::new("svc", "Ping");
        raw_write(&mut peer, FrameKind::Request, &json_bytes(&req)).await.unwrap();

        assert!(matches!(rx.recv().await.unwrap(), Event::Request(got, None) if got == req));
    }

    #[tokio::test]
    async fn end_of_stream_closes_once() {
        let (conn, _recorder, mut rx, peer) = setup(EngineConfig::default());
        conn.listen();
        drop(peer);

        assert!(matches!(
            rx.recv().await.unwrap(),
            Event::Closed(CloseReason::EndOfStream)
        ));
        conn.closed().await;
        assert!(conn.is_closed());
        conn.close();
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn oversized_frame_is_fatal() {
        let (conn, _recorder, mut rx, mut peer) =
            setup(EngineConfig::default().with_max_payload_size(16));
        conn.listen();

        raw_write(&mut peer, FrameKind::Request, &[b'x'; 17]).await.unwrap();
        assert!(matches!(
            rx.recv().await.unwrap(),
            Event::Closed(CloseReason::Framing(FramingError::MessageTooLarge { len: 17, max: 16 }))
        ));
    }

    #[tokio::test]
    async fn local_close_is_reported_and_blocks_sends() {
        let (conn, _recorder, mut rx, _peer) = setup(EngineConfig::default());
        conn.listen();
        conn.close();

        assert!(matches!(rx.recv().await.unwrap(), Event::Closed(CloseReason::Local)));
        let err = conn
            .send_cancellation(&CancellationRequest {
                request_id: RequestId::new(),
            })
            .await
            .unwrap_err();
        assert!(err.is_connection_broken());
    }

    #[tokio::test]
    async fn close_before_listen_still_notifies() {
        let (conn, _recorder, mut rx, _peer) = setup(EngineConfig::default());
        conn.close();
        assert!(matches!(rx.recv().await.unwrap(), Event::Closed(CloseReason::Local)));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn response_with_download_reaches_handler() {
        let (conn, _recorder, mut rx, peer) = setup(EngineConfig::default());
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let peer_recorder = Arc::new(Recorder { tx: peer_tx });
        let peer_handler: Weak<dyn ConnectionHandler> = Arc::downgrade(&peer_recorder) as Weak<dyn ConnectionHandler>;
        let peer_conn = Connection::new(peer, peer_handler, Arc::new(JsonSerializer), EngineConfig::default());
        drop(peer_rx);
        conn.listen();

        let resp = Response::stream(RequestId::from("dl"));
        peer_conn
            .send_response(&resp, Some(OutboundStream::from_bytes(&b"hello"[..])))
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            Event::Response(got, Some(body)) => {
                assert_eq!(got.request_id, RequestId::from("dl"));
                assert_eq!(body, b"hello");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn local_payload_limit_fails_send_only() {
        let (conn, _recorder, _rx, _peer) = setup(EngineConfig::default().with_max_payload_size(8));
        let req = Request::new("svc", "TooBig");
        let err = conn.send_request(&req, None).await.unwrap_err();
        assert!(matches!(err, RpcError::Framing(FramingError::MessageTooLarge { .. })));
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn abort_while_waiting_for_send_lock_writes_nothing() {
        let (conn, _recorder, _rx, _peer) = setup(EngineConfig::default());
        let held = Arc::clone(&conn.writer).lock_owned().await;

        let abort = CancellationToken::new();
        abort.cancel();
        let started = AtomicBool::new(false);
        let req = Request::new("svc", "Ping");
        let progress = conn
            .send_request_until(&req, None, &abort, &started)
            .await
            .unwrap();
        assert_eq!(progress, SendProgress::Skipped);
        assert!(!started.load(Ordering::Acquire));
        drop(held);
    }

    #[tokio::test]
    async fn abort_mid_write_finishes_frame_in_background() {
        let (local, mut peer) = tokio::io::duplex(64);
        let (tx, _rx) = mpsc::unbounded_channel();
        let recorder = Arc::new(Recorder { tx });
        let handler: Weak<dyn ConnectionHandler> = Arc::downgrade(&recorder) as Weak<dyn ConnectionHandler>;
        let conn = Connection::new(local, handler, Arc::new(JsonSerializer), EngineConfig::default());

        let abort = CancellationToken::new();
        let started = AtomicBool::new(false);
        let mut req = Request::new("svc", "Put").with_id(RequestId::from("up"));
        req.upload = true;
        let body = OutboundStream::from_bytes(vec![7u8; 4096]);

        let send = conn.send_request_until(&req, Some(body), &abort, &started);
        let cancel_soon = async {
            tokio::task::yield_now().await;
            abort.cancel();
        };
        let (progress, ()) = tokio::join!(send, cancel_soon);
        assert_eq!(progress.unwrap(), SendProgress::Detached);
        assert!(started.load(Ordering::Acquire));

        let frame = crate::bridge::codec::read_frame(&mut peer, 1 << 20).await.unwrap().unwrap();
        assert_eq!(frame.kind, FrameKind::Request);
        let header = read_frame_header(&mut peer).await.unwrap().unwrap();
        assert_eq!((header.kind, header.len), (FrameKind::UploadStream, 4096));
        let mut rest = vec![0u8; 4096];
        peer.read_exact(&mut rest).await.unwrap();
        assert!(rest.iter().all(|b| *b == 7));
        assert!(!conn.is_closed());
    }
}
