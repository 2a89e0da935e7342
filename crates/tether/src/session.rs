//! One side of a live connection.
//!
//! A [`Session`] ties a [`Connection`] to the calls this side has sent (its
//! own outbound [`PendingCallTable`]) and, when it serves calls, to a
//! [`Dispatcher`]. Clients and hosts use the same type: a client session
//! serving callbacks and a host session serving services differ only in the
//! dispatcher they carry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{
    CancellationRequest, RemoteErrorInfo, Request, RequestId, Response,
};
use crate::bridge::slice::{OutboundStream, StreamSlice};
use crate::config::EngineConfig;
use crate::connection::{CloseReason, Connection, ConnectionHandler, SendProgress};
use crate::dispatcher::{Dispatcher, InFlightCalls, remote_from_rpc};
use crate::error::RpcError;
use crate::pending::{CallOutcome, PendingCallTable};
use crate::proxy::Method;
use crate::serializer::{self, Serializer};
use crate::timeout::TimeoutRace;

/// Per-call knobs for an outbound call.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Overrides the engine's default timeout.
    pub timeout: Option<Duration>,
    /// Cancelling this token stops the wait and notifies the peer.
    pub cancel: Option<CancellationToken>,
    pub parent_id: Option<RequestId>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_parent(mut self, parent: RequestId) -> Self {
        self.parent_id = Some(parent);
        self
    }
}

/// Untyped answer to an outbound call.
#[derive(Debug)]
pub enum CallReply {
    Value(serde_json::Value),
    Stream(StreamSlice),
}

impl CallReply {
    pub fn into_value<R: DeserializeOwned>(self) -> Result<R, RpcError> {
        match self {
            Self::Value(value) => serializer::from_value(value),
            Self::Stream(_) => Err(RpcError::serialization(
                "expected a value but the peer answered with a stream",
            )),
        }
    }

    pub fn into_stream(self) -> Result<StreamSlice, RpcError> {
        match self {
            Self::Stream(slice) => Ok(slice),
            Self::Value(_) => Err(RpcError::serialization(
                "expected a stream but the peer answered with a value",
            )),
        }
    }
}

pub struct Session {
    me: Weak<Session>,
    connection: Arc<Connection>,
    outbound: PendingCallTable,
    inflight: Arc<InFlightCalls>,
    dispatcher: Option<Arc<Dispatcher>>,
    config: EngineConfig,
}

impl Session {
    /// Wrap `stream` and start reading from it.
    pub fn new<S>(
        stream: S,
        dispatcher: Option<Arc<Dispatcher>>,
        serializer: Arc<dyn Serializer>,
        config: EngineConfig,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let session = Arc::new_cyclic(|me: &Weak<Session>| {
            let handler: Weak<dyn ConnectionHandler> = me.clone();
            Session {
                me: me.clone(),
                connection: Connection::new(stream, handler, serializer, config.clone()),
                outbound: PendingCallTable::new(),
                inflight: Arc::new(InFlightCalls::default()),
                dispatcher,
                config,
            }
        });
        session.connection.listen();
        session
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn dispatcher(&self) -> Option<&Arc<Dispatcher>> {
        self.dispatcher.as_ref()
    }

    pub(crate) fn inflight(&self) -> &Arc<InFlightCalls> {
        &self.inflight
    }

    /// Outbound calls still holding a table entry, abandoned ones included.
    pub fn pending_calls(&self) -> usize {
        self.outbound.len()
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    pub fn close(&self) {
        self.connection.close();
    }

    pub async fn closed(&self) {
        self.connection.closed().await
    }

    /// Send one call and wait for its outcome.
    ///
    /// Timeout and cancellation only stop the local wait, including the wait
    /// for the send lock. Bytes already being written are never interrupted:
    /// the frame is finished in the background, a CancellationRequest is sent
    /// to the peer on a best-effort basis, and the call's table entry stays
    /// until the real Response arrives or the connection goes away. Dropping
    /// the returned future has the same effect as cancelling it.
    pub async fn call(
        &self,
        endpoint: &str,
        method: &str,
        args: Vec<serde_json::Value>,
        upload: Option<OutboundStream>,
        options: CallOptions,
    ) -> Result<CallReply, RpcError> {
        let timeout = options.timeout.or(self.config.default_timeout);
        let mut request = Request::new(endpoint, method)
            .with_args(args)
            .with_timeout(timeout)
            .with_parent(options.parent_id);
        request.upload = upload.is_some();
        let id = request.id.clone();

        let handle = self.outbound.register(id.clone())?;
        if self.connection.is_closed() {
            let err = self.broken();
            self.outbound
                .try_complete(&id, CallOutcome::Fault(err.duplicate()));
            return Err(err);
        }
        let guard = OutboundGuard::new(self, id.clone());

        let external = options.cancel.unwrap_or_default();
        let race = TimeoutRace::new(timeout, &external);

        let sent = self
            .connection
            .send_request_until(&request, upload, &race.token(), &guard.started)
            .await;
        match sent {
            Ok(SendProgress::Written | SendProgress::Detached) => {}
            Ok(SendProgress::Skipped) => {
                guard.settle();
                self.outbound.try_complete(&id, CallOutcome::Canceled);
                let err = race.classify_error(RpcError::Aborted);
                tracing::debug!(request_id = %id, endpoint, method, error = %err, "Call gave up before sending");
                return Err(err);
            }
            Err(e) => {
                guard.settle();
                tracing::debug!(request_id = %id, error = %e, "Request could not be sent");
                self.outbound
                    .try_complete(&id, CallOutcome::Fault(e.duplicate()));
                return Err(e);
            }
        }

        let outcome = race.run(async { Ok(handle.wait().await) }).await;
        match outcome {
            Ok(outcome) => {
                guard.settle();
                match outcome {
                    CallOutcome::Success(value) => Ok(CallReply::Value(value)),
                    CallOutcome::Stream(slice) => Ok(CallReply::Stream(slice)),
                    CallOutcome::Fault(RpcError::Remote(info)) => {
                        Err(peer_verdict(info, timeout.is_some()))
                    }
                    CallOutcome::Fault(e) => Err(e),
                    CallOutcome::Canceled => Err(RpcError::Canceled),
                }
            }
            Err(e) => {
                tracing::debug!(request_id = %id, endpoint, method, error = %e, "Call abandoned");
                drop(guard);
                Err(e)
            }
        }
    }

    /// Typed call answered with a value.
    pub async fn call_typed<A, R>(
        &self,
        endpoint: &str,
        method: Method<A, R>,
        args: &A,
        upload: Option<OutboundStream>,
        options: CallOptions,
    ) -> Result<R, RpcError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let args = serializer::positional_args(args)?;
        self.call(endpoint, method.name(), args, upload, options)
            .await?
            .into_value()
    }

    /// Typed call answered with a download stream.
    pub async fn call_download<A>(
        &self,
        endpoint: &str,
        method: Method<A, StreamSlice>,
        args: &A,
        options: CallOptions,
    ) -> Result<StreamSlice, RpcError>
    where
        A: Serialize,
    {
        let args = serializer::positional_args(args)?;
        self.call(endpoint, method.name(), args, None, options)
            .await?
            .into_stream()
    }

    fn notify_cancel(&self, id: RequestId) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let connection = Arc::clone(&self.connection);
        runtime.spawn(async move {
            let request = CancellationRequest { request_id: id };
            if let Err(e) = connection.send_cancellation(&request).await {
                tracing::trace!(request_id = %request.request_id, error = %e, "CancellationRequest not delivered");
            }
        });
    }

    fn broken(&self) -> RpcError {
        self.connection
            .close_reason()
            .map(CloseReason::to_error)
            .unwrap_or_else(|| RpcError::connection_broken("connection closed"))
    }
}

/// The peer races the same deadline as the caller and answers a call it gave
/// up on with a bare `TimeoutError`/`CanceledError`. Report that the same way
/// as when the local timer wins.
fn peer_verdict(info: RemoteErrorInfo, had_deadline: bool) -> RpcError {
    if info.inner.is_none() {
        if had_deadline && info.type_name == RpcError::Timeout.kind_name() {
            return RpcError::Timeout;
        }
        if info.type_name == RpcError::Canceled.kind_name() {
            return RpcError::Canceled;
        }
    }
    RpcError::Remote(info)
}

/// Abandons an outbound call whose future ends without an outcome.
struct OutboundGuard<'a> {
    session: &'a Session,
    id: RequestId,
    started: AtomicBool,
    settled: AtomicBool,
}

impl<'a> OutboundGuard<'a> {
    fn new(session: &'a Session, id: RequestId) -> Self {
        Self {
            session,
            id,
            started: AtomicBool::new(false),
            settled: AtomicBool::new(false),
        }
    }

    fn settle(&self) {
        self.settled.store(true, Ordering::Release);
    }
}

impl Drop for OutboundGuard<'_> {
    fn drop(&mut self) {
        if *self.settled.get_mut() {
            return;
        }
        if *self.started.get_mut() {
            self.session.outbound.abandon(&self.id);
            self.session.notify_cancel(self.id.clone());
        } else {
            // Nothing reached the wire.
            self.session.outbound.try_complete(&self.id, CallOutcome::Canceled);
        }
    }
}

#[async_trait]
impl ConnectionHandler for Session {
    async fn on_request(&self, request: Request, upload: Option<StreamSlice>) {
        let Some(session) = self.me.upgrade() else {
            return;
        };
        match &self.dispatcher {
            Some(dispatcher) => {
                tokio::spawn(dispatcher.handle_request(&session, request, upload));
            }
            None => {
                drop(upload);
                tracing::warn!(endpoint = %request.endpoint, method = %request.method, "No dispatcher for inbound request");
                let error = remote_from_rpc(&RpcError::EndpointNotFound(request.endpoint));
                let response = Response::error(request.id, error);
                let connection = Arc::clone(&self.connection);
                tokio::spawn(async move {
                    if let Err(e) = connection.send_response(&response, None).await {
                        tracing::warn!(error = %e, "Failed to send response");
                    }
                });
            }
        }
    }

    async fn on_response(&self, response: Response, download: Option<StreamSlice>) {
        let id = response.request_id;
        let outcome = match (response.error, download) {
            (Some(error), _) => CallOutcome::Fault(RpcError::Remote(error)),
            (None, Some(slice)) => CallOutcome::Stream(slice),
            (None, None) => {
                CallOutcome::Success(response.data.unwrap_or(serde_json::Value::Null))
            }
        };
        if !self.outbound.try_complete(&id, outcome) {
            tracing::debug!(request_id = %id, "Response for unknown request dropped");
        }
    }

    async fn on_cancellation(&self, request: CancellationRequest) {
        if self.inflight.cancel(&request.request_id) {
            tracing::debug!(request_id = %request.request_id, "Canceling in-flight call");
        } else {
            tracing::trace!(request_id = %request.request_id, "Cancellation for unknown call ignored");
        }
    }

    async fn on_closed(&self, reason: CloseReason) {
        let faulted = self.outbound.complete_all(&reason.to_error());
        tracing::debug!(connection = self.connection.id(), %reason, faulted, "Session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.connection.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::JsonSerializer;

    #[test]
    fn reply_conversions() {
        let reply = CallReply::Value(serde_json::json!(5));
        assert_eq!(reply.into_value::<i32>().unwrap(), 5);

        let reply = CallReply::Value(serde_json::json!("x"));
        assert!(matches!(reply.into_stream(), Err(RpcError::Serialization(_))));
    }

    #[test]
    fn peer_abort_reads_like_local_abort() {
        let timed_out = RemoteErrorInfo::new("TimeoutError", "call timed out");
        assert!(peer_verdict(timed_out.clone(), true).is_timeout());
        assert!(peer_verdict(timed_out.clone(), false).remote().is_some());
        assert!(peer_verdict(RemoteErrorInfo::new("CanceledError", "call was canceled"), false).is_canceled());

        let chained = RemoteErrorInfo::new("Error", "fetching quote").with_inner(timed_out);
        let err = peer_verdict(chained, true);
        assert_eq!(err.remote().unwrap().root_cause().type_name, "TimeoutError");
    }

    #[test]
    fn call_options_builder() {
        let token = CancellationToken::new();
        let options = CallOptions::new()
            .with_timeout(Duration::from_secs(2))
            .with_cancellation(token.clone())
            .with_parent(RequestId::from("p"));
        assert_eq!(options.timeout, Some(Duration::from_secs(2)));
        assert_eq!(options.parent_id, Some(RequestId::from("p")));
        token.cancel();
        assert!(options.cancel.unwrap().is_cancelled());
    }

    #[tokio::test]
    async fn call_on_closed_session_is_broken() {
        let (local, _peer) = tokio::io::duplex(1024);
        let session = Session::new(local, None, Arc::new(JsonSerializer), EngineConfig::default());
        session.close();
        session.closed().await;

        let err = session
            .call("svc", "Ping", vec![], None, CallOptions::new())
            .await
            .unwrap_err();
        assert!(err.is_connection_broken());
        assert_eq!(session.pending_calls(), 0);
    }

    #[tokio::test]
    async fn request_without_dispatcher_gets_endpoint_not_found() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let caller = Session::new(a, None, Arc::new(JsonSerializer), EngineConfig::default());
        let _callee = Session::new(b, None, Arc::new(JsonSerializer), EngineConfig::default());

        let err = caller
            .call("Nope", "Ping", vec![], None, CallOptions::new())
            .await
            .unwrap_err();
        let remote = err.remote().unwrap();
        assert_eq!(remote.type_name, "EndpointNotFound");
        assert_eq!(caller.pending_calls(), 0);
    }
}
