//! tether: bidirectional, transport-agnostic RPC engine.
//!
//! Two processes exchange typed calls over one duplex byte stream. The client
//! calls service endpoints through a [`ServiceProxy`]; the host calls back into
//! contracts the client registered through a [`CallbackBroker`]. Both
//! directions share one connection, with per-call timeouts, cancellation and
//! inline stream transfer.

pub mod bridge;
pub mod callback;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod pending;
pub mod pool;
pub mod proxy;
pub mod scheduler;
pub mod serializer;
pub mod server;
pub mod session;
pub mod timeout;

pub use bridge::protocol::{
    CancellationRequest, FrameKind, RemoteErrorInfo, Request, RequestId, Response,
};
pub use bridge::slice::{OutboundStream, StreamSlice};
pub use callback::CallbackBroker;
pub use config::{EngineConfig, ReconnectPolicy};
pub use connection::{CloseReason, Connection, ConnectionHandler, SendProgress};
pub use dispatcher::{
    CallContext, CallInfo, Dispatcher, DispatcherBuilder, Endpoint, EndpointBuilder,
    MethodArgs, MethodDescriptor,
};
pub use error::{FramingError, RpcError, ServiceFault};
pub use logging::init_tracing;
pub use pending::{CallOutcome, PendingCallTable};
pub use proxy::{Connector, Method, ServiceProxy, Transport};
pub use scheduler::{DedicatedThreadScheduler, Scheduler, TokioScheduler};
pub use serializer::{JsonSerializer, Serializer};
pub use server::RpcServer;
pub use session::{CallOptions, CallReply, Session};
pub use timeout::{AbortReason, TimeoutRace};
