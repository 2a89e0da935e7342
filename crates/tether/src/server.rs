//! Host side: serves a shared dispatcher on every accepted stream.

use std::sync::Arc;

use dashmap::DashMap;
use futures::{Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::dispatcher::Dispatcher;
use crate::serializer::{JsonSerializer, Serializer};
use crate::session::Session;

/// Attaches accepted streams to one [`Dispatcher`] and tracks the live
/// sessions. Listening for connections is left to the caller; feed accepted
/// streams to [`attach`](Self::attach) or [`serve`](Self::serve).
pub struct RpcServer {
    dispatcher: Arc<Dispatcher>,
    serializer: Arc<dyn Serializer>,
    config: EngineConfig,
    sessions: Arc<DashMap<u64, Arc<Session>>>,
    shutdown: CancellationToken,
}

impl RpcServer {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            serializer: Arc::new(JsonSerializer),
            config: EngineConfig::default(),
            sessions: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Start serving calls on `stream`.
    pub fn attach<S>(&self, stream: S) -> Arc<Session>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let session = Session::new(
            stream,
            Some(Arc::clone(&self.dispatcher)),
            Arc::clone(&self.serializer),
            self.config.clone(),
        );
        let id = session.connection().id();
        self.sessions.insert(id, Arc::clone(&session));
        tracing::debug!(connection = id, sessions = self.sessions.len(), "Session attached");

        let sessions = Arc::clone(&self.sessions);
        let watched = Arc::clone(&session);
        tokio::spawn(async move {
            watched.closed().await;
            drop(watched);
            sessions.remove(&id);
            tracing::debug!(connection = id, "Session detached");
        });
        session
    }

    /// Attach every stream yielded by `incoming` until it ends or
    /// [`shutdown`](Self::shutdown) is called. Accept errors are logged and
    /// skipped.
    pub async fn serve<I, S, E>(&self, incoming: I)
    where
        I: Stream<Item = Result<S, E>> + Send,
        S: AsyncRead + AsyncWrite + Send + 'static,
        E: std::fmt::Display,
    {
        let mut incoming = std::pin::pin!(incoming);
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                next = incoming.next() => match next {
                    Some(Ok(stream)) => {
                        self.attach(stream);
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Accept failed");
                    }
                    None => break,
                },
            }
        }
        tracing::debug!("Accept loop finished");
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Stop accepting, close every session and wait for them to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        tracing::info!(sessions = sessions.len(), "Shutting down server");
        for session in &sessions {
            session.close();
        }
        for session in sessions {
            session.closed().await;
        }
    }
}
