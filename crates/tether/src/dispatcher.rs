//! Inbound call dispatch.
//!
//! A [`Dispatcher`] maps endpoint names to [`Endpoint`]s, each with an
//! explicit method table built once at registration time. Every inbound
//! Request gets exactly one Response: a value, a download stream or an error
//! chain, including when the call is canceled or times out on this side.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{RemoteErrorInfo, Request, RequestId, Response};
use crate::bridge::slice::{OutboundStream, StreamSlice};
use crate::callback::CallbackBroker;
use crate::error::{RpcError, ServiceFault};
use crate::scheduler::{Scheduler, TokioScheduler};
use crate::session::Session;
use crate::timeout::TimeoutRace;

/// Positional argument list of a registered method.
///
/// Implemented for `()` and tuples of up to eight elements; a one-argument
/// method takes `(T,)`.
pub trait MethodArgs: DeserializeOwned + Send + 'static {
    const ARITY: usize;

    fn from_positional(method: &str, args: Vec<serde_json::Value>) -> Result<Self, RpcError> {
        if args.len() != Self::ARITY {
            return Err(RpcError::InvalidArguments {
                method: method.to_string(),
                reason: format!("expected {} arguments, got {}", Self::ARITY, args.len()),
            });
        }
        serde_json::from_value(serde_json::Value::Array(args)).map_err(|e| {
            RpcError::InvalidArguments {
                method: method.to_string(),
                reason: e.to_string(),
            }
        })
    }
}

impl MethodArgs for () {
    const ARITY: usize = 0;

    fn from_positional(method: &str, args: Vec<serde_json::Value>) -> Result<Self, RpcError> {
        if !args.is_empty() {
            return Err(RpcError::InvalidArguments {
                method: method.to_string(),
                reason: format!("expected 0 arguments, got {}", args.len()),
            });
        }
        Ok(())
    }
}

macro_rules! impl_method_args {
    ($arity:expr; $($name:ident),+) => {
        impl<$($name: DeserializeOwned + Send + 'static),+> MethodArgs for ($($name,)+) {
            const ARITY: usize = $arity;
        }
    };
}

impl_method_args!(1; A1);
impl_method_args!(2; A1, A2);
impl_method_args!(3; A1, A2, A3);
impl_method_args!(4; A1, A2, A3, A4);
impl_method_args!(5; A1, A2, A3, A4, A5);
impl_method_args!(6; A1, A2, A3, A4, A5, A6);
impl_method_args!(7; A1, A2, A3, A4, A5, A6, A7);
impl_method_args!(8; A1, A2, A3, A4, A5, A6, A7, A8);

/// What a handler produced.
pub enum Reply {
    Value(serde_json::Value),
    Stream(OutboundStream),
}

type Invoker = Arc<
    dyn Fn(
            CallContext,
            Vec<serde_json::Value>,
            Option<StreamSlice>,
        ) -> Result<BoxFuture<'static, anyhow::Result<Reply>>, RpcError>
        + Send
        + Sync,
>;

type BeforeCall = Arc<
    dyn Fn(CallInfo, CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync,
>;

#[derive(Clone)]
pub struct MethodDescriptor {
    pub name: String,
    pub arity: usize,
    /// Takes an upload stream as its last parameter.
    pub accepts_stream: bool,
    /// Answers with a download stream.
    pub returns_stream: bool,
    invoker: Invoker,
}

impl fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("accepts_stream", &self.accepts_stream)
            .field("returns_stream", &self.returns_stream)
            .finish_non_exhaustive()
    }
}

pub struct Endpoint {
    name: String,
    methods: HashMap<String, MethodDescriptor>,
    scheduler: Arc<dyn Scheduler>,
    before_call: Option<BeforeCall>,
}

impl Endpoint {
    /// Start building an endpoint. `factory` supplies the service instance
    /// for each invocation; return a shared `Arc` for a singleton service.
    pub fn builder<T, F>(name: impl Into<String>, factory: F) -> EndpointBuilder<T>
    where
        T: Send + Sync + 'static,
        F: Fn() -> Arc<T> + Send + Sync + 'static,
    {
        EndpointBuilder {
            name: name.into(),
            factory: Arc::new(factory),
            methods: HashMap::new(),
            scheduler: None,
            before_call: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method(&self, name: &str) -> Result<&MethodDescriptor, RpcError> {
        self.methods
            .get(name)
            .ok_or_else(|| RpcError::MethodNotFound {
                endpoint: self.name.clone(),
                method: name.to_string(),
            })
    }

    pub fn methods(&self) -> impl Iterator<Item = &MethodDescriptor> {
        self.methods.values()
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut methods: Vec<_> = self.methods.keys().collect();
        methods.sort();
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("methods", &methods)
            .field("before_call", &self.before_call.is_some())
            .finish_non_exhaustive()
    }
}

pub struct EndpointBuilder<T> {
    name: String,
    factory: Arc<dyn Fn() -> Arc<T> + Send + Sync>,
    methods: HashMap<String, MethodDescriptor>,
    scheduler: Option<Arc<dyn Scheduler>>,
    before_call: Option<BeforeCall>,
}

impl<T: Send + Sync + 'static> EndpointBuilder<T> {
    /// Register a method that returns a serializable value.
    pub fn method<A, R, F, Fut>(self, name: &str, handler: F) -> Self
    where
        A: MethodArgs,
        R: Serialize + Send + 'static,
        F: Fn(Arc<T>, CallContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let factory = Arc::clone(&self.factory);
        let method = name.to_string();
        let invoker: Invoker = Arc::new(move |ctx, args, _upload| {
            let args = A::from_positional(&method, args)?;
            let fut = handler(factory(), ctx, args);
            Ok(Box::pin(async move {
                let value = fut.await?;
                Ok(Reply::Value(serde_json::to_value(value)?))
            }))
        });
        self.register(name, A::ARITY, false, false, invoker)
    }

    /// Register a method whose last parameter is an upload stream.
    pub fn upload_method<A, R, F, Fut>(self, name: &str, handler: F) -> Self
    where
        A: MethodArgs,
        R: Serialize + Send + 'static,
        F: Fn(Arc<T>, CallContext, A, StreamSlice) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let factory = Arc::clone(&self.factory);
        let method = name.to_string();
        let invoker: Invoker = Arc::new(move |ctx, args, upload| {
            let args = A::from_positional(&method, args)?;
            let upload = upload.ok_or_else(|| RpcError::InvalidArguments {
                method: method.clone(),
                reason: "missing upload stream".to_string(),
            })?;
            let fut = handler(factory(), ctx, args, upload);
            Ok(Box::pin(async move {
                let value = fut.await?;
                Ok(Reply::Value(serde_json::to_value(value)?))
            }))
        });
        self.register(name, A::ARITY, true, false, invoker)
    }

    /// Register a method that answers with a download stream.
    pub fn download_method<A, F, Fut>(self, name: &str, handler: F) -> Self
    where
        A: MethodArgs,
        F: Fn(Arc<T>, CallContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<OutboundStream>> + Send + 'static,
    {
        let factory = Arc::clone(&self.factory);
        let method = name.to_string();
        let invoker: Invoker = Arc::new(move |ctx, args, _upload| {
            let args = A::from_positional(&method, args)?;
            let fut = handler(factory(), ctx, args);
            Ok(Box::pin(async move { Ok(Reply::Stream(fut.await?)) }))
        });
        self.register(name, A::ARITY, false, true, invoker)
    }

    /// Run invocations on `scheduler` instead of the ambient runtime.
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Hook run before every invocation, raced against the call's timeout
    /// and cancellation. The token it receives is the call's combined token.
    /// An error rejects the call and is returned to the caller as its error
    /// chain.
    pub fn before_call<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(CallInfo, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.before_call = Some(Arc::new(move |info, token| Box::pin(hook(info, token))));
        self
    }

    pub fn build(self) -> Endpoint {
        Endpoint {
            name: self.name,
            methods: self.methods,
            scheduler: self
                .scheduler
                .unwrap_or_else(|| Arc::new(TokioScheduler)),
            before_call: self.before_call,
        }
    }

    fn register(
        mut self,
        name: &str,
        arity: usize,
        accepts_stream: bool,
        returns_stream: bool,
        invoker: Invoker,
    ) -> Self {
        let descriptor = MethodDescriptor {
            name: name.to_string(),
            arity,
            accepts_stream,
            returns_stream,
            invoker,
        };
        if self.methods.insert(name.to_string(), descriptor).is_some() {
            tracing::warn!(endpoint = %self.name, method = name, "Method registered twice, keeping the last one");
        }
        self
    }
}

/// Who is being called, visible to handlers and `before_call` hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallInfo {
    pub endpoint: String,
    pub method: String,
    pub request_id: RequestId,
    /// Set when this call is a callback made from inside another call.
    pub parent_id: Option<RequestId>,
}

/// Per-invocation context handed to every handler.
#[derive(Clone)]
pub struct CallContext {
    info: Arc<CallInfo>,
    token: CancellationToken,
    session: Arc<Session>,
}

impl CallContext {
    pub(crate) fn new(info: CallInfo, token: CancellationToken, session: Arc<Session>) -> Self {
        Self {
            info: Arc::new(info),
            token,
            session,
        }
    }

    pub fn info(&self) -> &CallInfo {
        &self.info
    }

    pub fn request_id(&self) -> &RequestId {
        &self.info.request_id
    }

    /// Fires when the caller cancels, the request's timeout elapses or the
    /// connection goes away.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Call back into `contract` on the peer. Calls made through the broker
    /// carry this request's id as their parent.
    pub fn callback(&self, contract: impl Into<String>) -> CallbackBroker {
        CallbackBroker::new(Arc::clone(&self.session), contract)
            .with_parent(self.info.request_id.clone())
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("info", &self.info)
            .field("cancelled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Inbound invocations in progress on one session, by request id.
#[derive(Debug, Default)]
pub(crate) struct InFlightCalls {
    calls: DashMap<RequestId, CancellationToken>,
}

impl InFlightCalls {
    /// Track `id` with a token derived from `parent`.
    pub(crate) fn track(
        self: &Arc<Self>,
        id: RequestId,
        parent: &CancellationToken,
    ) -> Result<InFlightGuard, RpcError> {
        match self.calls.entry(id.clone()) {
            Entry::Occupied(_) => Err(RpcError::DuplicateRequestId(id.to_string())),
            Entry::Vacant(vacant) => {
                let token = parent.child_token();
                vacant.insert(token.clone());
                Ok(InFlightGuard {
                    calls: Arc::clone(self),
                    id,
                    token,
                })
            }
        }
    }

    /// Fire the token of an in-flight invocation. Unknown ids are ignored.
    pub(crate) fn cancel(&self, id: &RequestId) -> bool {
        match self.calls.get(id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.calls.len()
    }
}

pub(crate) struct InFlightGuard {
    calls: Arc<InFlightCalls>,
    id: RequestId,
    token: CancellationToken,
}

impl InFlightGuard {
    fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.calls.calls.remove(&self.id);
    }
}

/// Endpoint registry shared by every session that serves calls.
#[derive(Default)]
pub struct Dispatcher {
    endpoints: HashMap<String, Arc<Endpoint>>,
}

#[derive(Default)]
pub struct DispatcherBuilder {
    endpoints: HashMap<String, Arc<Endpoint>>,
}

impl DispatcherBuilder {
    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        let name = endpoint.name.clone();
        if self.endpoints.insert(name.clone(), Arc::new(endpoint)).is_some() {
            tracing::warn!(endpoint = %name, "Endpoint registered twice, keeping the last one");
        }
        self
    }

    pub fn build(self) -> Dispatcher {
        Dispatcher {
            endpoints: self.endpoints,
        }
    }
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    pub fn resolve(&self, name: &str) -> Result<&Arc<Endpoint>, RpcError> {
        self.endpoints
            .get(name)
            .ok_or_else(|| RpcError::EndpointNotFound(name.to_string()))
    }

    pub fn endpoint_names(&self) -> impl Iterator<Item = &str> {
        self.endpoints.keys().map(String::as_str)
    }

    /// Serve one inbound request on `session`.
    ///
    /// The invocation is registered as in flight before this returns, so a
    /// CancellationRequest read right after the Request always finds it. The
    /// returned future runs the invocation and sends exactly one Response.
    pub fn handle_request(
        self: &Arc<Self>,
        session: &Arc<Session>,
        request: Request,
        upload: Option<StreamSlice>,
    ) -> impl Future<Output = ()> + Send + 'static {
        let dispatcher = Arc::clone(self);
        let session = Arc::clone(session);
        let tracked = session
            .inflight()
            .track(request.id.clone(), &session.connection().shutdown_token());

        async move {
            let id = request.id.clone();
            let reply = match tracked {
                Ok(guard) => {
                    let reply = dispatcher
                        .invoke(&session, request, upload, guard.token())
                        .await;
                    drop(guard);
                    reply
                }
                Err(e) => {
                    tracing::warn!(request_id = %id, "Inbound request id already in flight");
                    Err(remote_from_rpc(&e))
                }
            };

            let (response, download) = match reply {
                Ok(Reply::Value(data)) => (Response::data(id, data), None),
                Ok(Reply::Stream(body)) => (Response::stream(id), Some(body)),
                Err(error) => (Response::error(id, error), None),
            };
            if let Err(e) = session.connection().send_response(&response, download).await {
                tracing::warn!(request_id = %response.request_id, error = %e, "Failed to send response");
            }
        }
    }

    async fn invoke(
        &self,
        session: &Arc<Session>,
        request: Request,
        upload: Option<StreamSlice>,
        cancel: &CancellationToken,
    ) -> Result<Reply, RemoteErrorInfo> {
        let endpoint = self.resolve(&request.endpoint).map_err(|e| remote_from_rpc(&e))?;
        let method = endpoint.method(&request.method).map_err(|e| remote_from_rpc(&e))?;

        if method.accepts_stream != upload.is_some() {
            let reason = if method.accepts_stream {
                "method expects an upload stream"
            } else {
                "method does not accept an upload stream"
            };
            return Err(remote_from_rpc(&RpcError::InvalidArguments {
                method: method.name.clone(),
                reason: reason.to_string(),
            }));
        }

        let info = CallInfo {
            endpoint: endpoint.name.clone(),
            method: method.name.clone(),
            request_id: request.id.clone(),
            parent_id: request.parent_id.clone(),
        };
        let race = TimeoutRace::new(request.timeout(), cancel);
        if let Some(hook) = &endpoint.before_call {
            let verdict = race
                .run(async { Ok(hook(info.clone(), race.token()).await) })
                .await;
            match verdict {
                Ok(Ok(())) => {}
                Ok(Err(_)) if race.is_aborted() => {
                    return Err(remote_from_rpc(&race.classify_error(RpcError::Aborted)));
                }
                Ok(Err(e)) => {
                    tracing::debug!(endpoint = %info.endpoint, method = %info.method, error = %e, "Call rejected by before_call hook");
                    return Err(remote_from_anyhow(&e));
                }
                Err(e) => {
                    tracing::debug!(endpoint = %info.endpoint, method = %info.method, error = %e, "Call aborted in before_call hook");
                    return Err(remote_from_rpc(&e));
                }
            }
        }

        tracing::debug!(
            endpoint = %info.endpoint,
            method = %info.method,
            request_id = %info.request_id,
            parent_id = ?info.parent_id,
            "Dispatching call"
        );
        let started = Instant::now();

        let ctx = CallContext::new(info, race.token(), Arc::clone(session));
        let request_id = request.id;
        let fut = (method.invoker)(ctx, request.args, upload).map_err(|e| remote_from_rpc(&e))?;

        let (tx, rx) = oneshot::channel();
        endpoint.scheduler.spawn(Box::pin(async move {
            let _ = tx.send(fut.await);
        }));

        let result = race
            .run(async {
                rx.await.map_err(|_| {
                    RpcError::Remote(RemoteErrorInfo::new(
                        "InvocationFailed",
                        "handler terminated without producing a result",
                    ))
                })
            })
            .await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(Ok(reply)) => {
                tracing::trace!(%request_id, elapsed_ms, "Call completed");
                Ok(reply)
            }
            // A handler that gave up because its token fired reports the abort.
            Ok(Err(e)) if race.is_aborted() => {
                tracing::debug!(%request_id, elapsed_ms, error = %e, "Call aborted");
                Err(remote_from_rpc(&race.classify_error(RpcError::Aborted)))
            }
            Ok(Err(e)) => {
                tracing::debug!(%request_id, elapsed_ms, error = %e, "Call failed");
                Err(remote_from_anyhow(&e))
            }
            Err(e) => {
                tracing::debug!(%request_id, elapsed_ms, error = %e, "Call aborted");
                Err(remote_from_rpc(&e))
            }
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.endpoints.keys().collect();
        names.sort();
        f.debug_struct("Dispatcher").field("endpoints", &names).finish()
    }
}

/// Convert an engine error into the chain sent to the caller.
pub fn remote_from_rpc(err: &RpcError) -> RemoteErrorInfo {
    match err {
        RpcError::Remote(info) => info.clone(),
        other => RemoteErrorInfo::new(other.kind_name(), other.to_string()),
    }
}

/// Convert a handler error into the chain sent to the caller, outermost first.
///
/// [`ServiceFault`] and [`RpcError`] keep their type names; anything else is
/// reported as `Error`. The outermost entry carries the backtrace when one was
/// captured.
pub fn remote_from_anyhow(err: &anyhow::Error) -> RemoteErrorInfo {
    let mut chain: Vec<RemoteErrorInfo> = err
        .chain()
        .map(|cause| {
            if let Some(RpcError::Remote(info)) = cause.downcast_ref::<RpcError>() {
                return info.clone();
            }
            RemoteErrorInfo::new(type_name_of(cause), cause.to_string())
        })
        .collect();

    let mut inner: Option<RemoteErrorInfo> = None;
    while let Some(mut info) = chain.pop() {
        if let Some(inner) = inner.take() {
            info = info.with_inner(inner);
        }
        inner = Some(info);
    }
    let info = inner.unwrap_or_else(|| RemoteErrorInfo::new("Error", err.to_string()));

    let backtrace = err.backtrace();
    if backtrace.status() == std::backtrace::BacktraceStatus::Captured {
        info.with_stack_trace(backtrace.to_string())
    } else {
        info
    }
}

fn type_name_of(cause: &(dyn std::error::Error + 'static)) -> String {
    if let Some(fault) = cause.downcast_ref::<ServiceFault>() {
        fault.type_name.clone()
    } else if let Some(rpc) = cause.downcast_ref::<RpcError>() {
        rpc.kind_name().to_string()
    } else if cause.downcast_ref::<std::io::Error>().is_some() {
        "IoError".to_string()
    } else if cause.downcast_ref::<serde_json::Error>().is_some() {
        "SerializationError".to_string()
    } else {
        "Error".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;
    use serde_json::json;

    struct Nothing;

    #[test]
    fn tuple_args_check_arity() {
        let (a, b) = <(i32, String)>::from_positional("M", vec![json!(1), json!("x")]).unwrap();
        assert_eq!((a, b.as_str()), (1, "x"));

        let err = <(i32, i32)>::from_positional("M", vec![json!(1)]).unwrap_err();
        assert!(matches!(err, RpcError::InvalidArguments { reason, .. } if reason == "expected 2 arguments, got 1"));

        let err = <(i32,)>::from_positional("M", vec![json!("nope")]).unwrap_err();
        assert!(matches!(err, RpcError::InvalidArguments { .. }));
    }

    #[test]
    fn unit_args_accept_only_empty_list() {
        assert!(<()>::from_positional("M", vec![]).is_ok());
        assert!(<()>::from_positional("M", vec![json!(1)]).is_err());
    }

    #[test]
    fn endpoint_builds_method_table() {
        let endpoint = Endpoint::builder("Calc", || Arc::new(Nothing))
            .method("Add", |_svc, _ctx, (a, b): (i64, i64)| async move { Ok(a + b) })
            .upload_method("Count", |_svc, _ctx, (): (), slice: StreamSlice| async move {
                Ok(slice.len())
            })
            .download_method("Fetch", |_svc, _ctx, (n,): (usize,)| async move {
                Ok(OutboundStream::from_bytes(vec![0u8; n]))
            })
            .build();

        let add = endpoint.method("Add").unwrap();
        assert_eq!((add.arity, add.accepts_stream, add.returns_stream), (2, false, false));
        let count = endpoint.method("Count").unwrap();
        assert_eq!((count.arity, count.accepts_stream, count.returns_stream), (0, true, false));
        let fetch = endpoint.method("Fetch").unwrap();
        assert_eq!((fetch.arity, fetch.accepts_stream, fetch.returns_stream), (1, false, true));

        let err = endpoint.method("Missing").unwrap_err();
        assert!(matches!(err, RpcError::MethodNotFound { endpoint, method } if endpoint == "Calc" && method == "Missing"));
    }

    #[test]
    fn dispatcher_resolves_endpoints() {
        let dispatcher = Dispatcher::builder()
            .endpoint(Endpoint::builder("A", || Arc::new(Nothing)).build())
            .build();
        assert_eq!(dispatcher.resolve("A").unwrap().name(), "A");
        assert!(matches!(
            dispatcher.resolve("B").unwrap_err(),
            RpcError::EndpointNotFound(name) if name == "B"
        ));
    }

    #[test]
    fn anyhow_chain_becomes_nested_remote_errors() {
        let err = Err::<(), _>(ServiceFault::new("InvalidOperation", "disk full"))
            .context("saving report")
            .unwrap_err();
        let info = remote_from_anyhow(&err);
        assert_eq!(info.type_name, "Error");
        assert_eq!(info.message, "saving report");
        let inner = info.inner.as_deref().unwrap();
        assert_eq!(inner.type_name, "InvalidOperation");
        assert_eq!(inner.message, "disk full");
        assert!(inner.inner.is_none());
    }

    #[test]
    fn rpc_errors_keep_kind_names() {
        let info = remote_from_rpc(&RpcError::Timeout);
        assert_eq!(info.type_name, "TimeoutError");
        let info = remote_from_rpc(&RpcError::EndpointNotFound("X".into()));
        assert_eq!(info.type_name, "EndpointNotFound");
        assert_eq!(info.message, "endpoint not found: X");
        let remote = RemoteErrorInfo::new("Custom", "boom");
        assert_eq!(remote_from_rpc(&RpcError::Remote(remote.clone())), remote);
    }

    #[test]
    fn inflight_tracking_and_cancel() {
        let calls = Arc::new(InFlightCalls::default());
        let parent = CancellationToken::new();
        let guard = calls.track(RequestId::from("a"), &parent).unwrap();
        assert!(calls.track(RequestId::from("a"), &parent).is_err());
        assert!(calls.cancel(&RequestId::from("a")));
        assert!(guard.token().is_cancelled());
        assert!(!parent.is_cancelled());
        drop(guard);
        assert_eq!(calls.len(), 0);
        assert!(!calls.cancel(&RequestId::from("a")));
    }
}
