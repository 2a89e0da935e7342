//! Client-side call surface.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;

pub use crate::config::ReconnectPolicy;

use crate::bridge::slice::{OutboundStream, StreamSlice};
use crate::config::EngineConfig;
use crate::dispatcher::Dispatcher;
use crate::error::RpcError;
use crate::serializer::{JsonSerializer, Serializer};
use crate::session::{CallOptions, CallReply, Session};
use crate::timeout::TimeoutRace;

/// A duplex byte stream a connection can run on.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Opens new client-side streams (named pipe, TCP, WebSocket adapter).
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> std::io::Result<Box<dyn Transport>>;
}

/// Typed handle for one remote method: `A` is the positional argument tuple,
/// `R` the result (use [`StreamSlice`] for methods answering with a download).
pub struct Method<A, R> {
    name: &'static str,
    _marker: PhantomData<fn(A) -> R>,
}

impl<A, R> Method<A, R> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<A, R> Clone for Method<A, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<A, R> Copy for Method<A, R> {}

impl<A, R> fmt::Debug for Method<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Method").field(&self.name).finish()
    }
}

/// Calls one remote endpoint through a lazily opened connection.
pub struct ServiceProxy {
    endpoint: String,
    connector: Arc<dyn Connector>,
    config: EngineConfig,
    serializer: Arc<dyn Serializer>,
    callbacks: Option<Arc<Dispatcher>>,
    session: Mutex<Option<Arc<Session>>>,
}

impl ServiceProxy {
    pub fn new(endpoint: impl Into<String>, connector: Arc<dyn Connector>, config: EngineConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            connector,
            config,
            serializer: Arc::new(JsonSerializer),
            callbacks: None,
            session: Mutex::new(None),
        }
    }

    /// Serve callback contracts registered in `dispatcher` on every
    /// connection this proxy opens.
    pub fn with_callbacks(mut self, dispatcher: Arc<Dispatcher>) -> Self {
        self.callbacks = Some(dispatcher);
        self
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.config.reconnect = policy;
        self
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Call `method` and deserialize its value.
    ///
    /// On timeout or cancellation the call stops waiting and returns
    /// `Timeout`/`Canceled`; the remote invocation is only asked to stop.
    pub async fn call<A, R>(
        &self,
        method: Method<A, R>,
        args: A,
        mut options: CallOptions,
    ) -> Result<R, RpcError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let session = self.connected(&mut options).await?;
        session
            .call_typed(&self.endpoint, method, &args, None, options)
            .await
    }

    /// Call `method` with `upload` sent as its stream parameter.
    pub async fn call_with_upload<A, R>(
        &self,
        method: Method<A, R>,
        args: A,
        upload: OutboundStream,
        mut options: CallOptions,
    ) -> Result<R, RpcError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let session = self.connected(&mut options).await?;
        session
            .call_typed(&self.endpoint, method, &args, Some(upload), options)
            .await
    }

    /// Call a method that answers with a download stream.
    ///
    /// The connection does not read further frames until the returned slice
    /// is dropped.
    pub async fn call_download<A>(
        &self,
        method: Method<A, StreamSlice>,
        args: A,
        mut options: CallOptions,
    ) -> Result<StreamSlice, RpcError>
    where
        A: Serialize,
    {
        let session = self.connected(&mut options).await?;
        session
            .call_download(&self.endpoint, method, &args, options)
            .await
    }

    /// Untyped call.
    pub async fn invoke(
        &self,
        method: &str,
        args: Vec<serde_json::Value>,
        upload: Option<OutboundStream>,
        mut options: CallOptions,
    ) -> Result<CallReply, RpcError> {
        let session = self.connected(&mut options).await?;
        session
            .call(&self.endpoint, method, args, upload, options)
            .await
    }

    /// Close the current connection. Under [`ReconnectPolicy::Reconnect`] the
    /// next call opens a new one.
    pub async fn disconnect(&self) {
        if let Some(session) = self.session.lock().await.as_ref() {
            tracing::debug!(endpoint = %self.endpoint, "Disconnecting");
            session.close();
            session.closed().await;
        }
    }

    /// Whether a live connection is currently open.
    pub async fn is_connected(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| !s.is_closed())
    }

    /// Get a live session within the call's timeout and cancellation, then
    /// shrink the timeout by the time spent connecting.
    async fn connected(&self, options: &mut CallOptions) -> Result<Arc<Session>, RpcError> {
        let timeout = options.timeout.or(self.config.default_timeout);
        let cancel = options.cancel.clone().unwrap_or_default();
        let started = Instant::now();
        let race = TimeoutRace::new(timeout, &cancel);
        let session = race.run(self.session()).await.inspect_err(|e| {
            if e.is_timeout() || e.is_canceled() {
                tracing::debug!(endpoint = %self.endpoint, error = %e, "Gave up waiting for a connection");
            }
        })?;
        if let Some(timeout) = timeout {
            // A zero timeout would mean "no deadline" on the wire.
            let remaining = timeout.saturating_sub(started.elapsed());
            options.timeout = Some(remaining.max(Duration::from_millis(1)));
        }
        Ok(session)
    }

    async fn session(&self) -> Result<Arc<Session>, RpcError> {
        let mut current = self.session.lock().await;
        if let Some(session) = current.as_ref() {
            if !session.is_closed() {
                return Ok(Arc::clone(session));
            }
            if self.config.reconnect == ReconnectPolicy::DontReconnect {
                let reason = session
                    .connection()
                    .close_reason()
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "connection closed".to_string());
                return Err(RpcError::connection_broken(reason));
            }
            tracing::info!(endpoint = %self.endpoint, "Connection lost, reconnecting");
        }

        let stream = self.connector.connect().await.map_err(|e| {
            tracing::warn!(endpoint = %self.endpoint, error = %e, "Connect failed");
            RpcError::connection_broken(format!("connect failed: {e}"))
        })?;
        let session = Session::new(
            stream,
            self.callbacks.clone(),
            Arc::clone(&self.serializer),
            self.config.clone(),
        );
        tracing::debug!(
            endpoint = %self.endpoint,
            connection = session.connection().id(),
            "Connected"
        );
        *current = Some(Arc::clone(&session));
        Ok(session)
    }
}

impl fmt::Debug for ServiceProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceProxy")
            .field("endpoint", &self.endpoint)
            .field("reconnect", &self.config.reconnect)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Refusing {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Connector for Refusing {
        async fn connect(&self) -> std::io::Result<Box<dyn Transport>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "nobody home",
            ))
        }
    }

    struct Hanging;

    #[async_trait]
    impl Connector for Hanging {
        async fn connect(&self) -> std::io::Result<Box<dyn Transport>> {
            std::future::pending().await
        }
    }

    const PING: Method<(), String> = Method::new("Ping");

    #[test]
    fn method_handle_is_const_and_copy() {
        let copy = PING;
        assert_eq!(copy.name(), "Ping");
        assert_eq!(format!("{PING:?}"), "Method(\"Ping\")");
    }

    #[tokio::test]
    async fn connect_failure_is_connection_broken() {
        let connector = Arc::new(Refusing {
            attempts: AtomicUsize::new(0),
        });
        let proxy = ServiceProxy::new("svc", connector.clone(), EngineConfig::default());

        let err = proxy.call(PING, (), CallOptions::new()).await.unwrap_err();
        assert!(err.is_connection_broken());
        assert!(err.to_string().contains("nobody home"));
        assert!(!proxy.is_connected().await);

        let _ = proxy.call(PING, (), CallOptions::new()).await;
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_connect_honours_timeout_and_cancel() {
        let proxy = ServiceProxy::new("svc", Arc::new(Hanging), EngineConfig::default());

        let options = CallOptions::new().with_timeout(Duration::from_millis(50));
        let err = proxy.call(PING, (), options).await.unwrap_err();
        assert!(err.is_timeout());

        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();
        let options = CallOptions::new().with_cancellation(token);
        let err = proxy.call(PING, (), options).await.unwrap_err();
        assert!(err.is_canceled());
        assert!(!proxy.is_connected().await);
    }
}
