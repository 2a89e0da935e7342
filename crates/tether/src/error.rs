//! Error taxonomy for the RPC engine.
//!
//! Callers always get a typed failure that tells a remote business error
//! apart from a timeout, a cancellation and a transport failure.

use crate::bridge::protocol::RemoteErrorInfo;

/// Malformed or oversized input on the wire. Always fatal to the connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    #[error("frame payload of {len} bytes exceeds limit of {max} bytes")]
    MessageTooLarge { len: usize, max: usize },

    #[error("negative frame length {0}")]
    NegativeLength(i32),

    #[error("unknown frame kind {0}")]
    UnknownKind(u8),

    #[error("stream ended in the middle of a frame")]
    Truncated,

    #[error("expected {expected} frame, got {actual}")]
    UnexpectedKind {
        expected: &'static str,
        actual: String,
    },

    #[error("stream body ended after {written} of {declared} declared bytes")]
    ShortStreamBody { declared: u64, written: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("endpoint not found: {0}")]
    EndpointNotFound(String),

    #[error("method {method} not found on endpoint {endpoint}")]
    MethodNotFound { endpoint: String, method: String },

    #[error("invalid arguments for {method}: {reason}")]
    InvalidArguments { method: String, reason: String },

    /// The peer raised an error while handling the call.
    #[error("remote error: {0}")]
    Remote(RemoteErrorInfo),

    #[error("call timed out")]
    Timeout,

    #[error("call was canceled")]
    Canceled,

    /// Generic abort before classification by [`TimeoutRace`](crate::TimeoutRace).
    #[error("operation aborted")]
    Aborted,

    #[error("connection broken: {0}")]
    ConnectionBroken(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("request id {0} is already outstanding")]
    DuplicateRequestId(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl RpcError {
    pub fn connection_broken(reason: impl Into<String>) -> Self {
        Self::ConnectionBroken(reason.into())
    }

    pub fn serialization(err: impl std::fmt::Display) -> Self {
        Self::Serialization(err.to_string())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    pub fn is_connection_broken(&self) -> bool {
        matches!(self, Self::ConnectionBroken(_))
    }

    /// The remote error chain, if the peer raised one.
    pub fn remote(&self) -> Option<&RemoteErrorInfo> {
        match self {
            Self::Remote(info) => Some(info),
            _ => None,
        }
    }

    /// Short, stable name used as `type_name` when this error crosses the wire.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Framing(_) => "FramingError",
            Self::EndpointNotFound(_) => "EndpointNotFound",
            Self::MethodNotFound { .. } => "MethodNotFound",
            Self::InvalidArguments { .. } => "InvalidArguments",
            Self::Remote(_) => "RemoteError",
            Self::Timeout => "TimeoutError",
            Self::Canceled => "CanceledError",
            Self::Aborted => "Aborted",
            Self::ConnectionBroken(_) => "ConnectionBroken",
            Self::Serialization(_) => "SerializationError",
            Self::DuplicateRequestId(_) => "DuplicateRequestId",
            Self::Io(_) => "IoError",
        }
    }

    /// Cheap copy for fanning one fault out to many waiters.
    ///
    /// `Io` errors are not `Clone`, so they are rebuilt from kind and message.
    pub fn duplicate(&self) -> Self {
        match self {
            Self::Framing(e) => Self::Framing(e.clone()),
            Self::EndpointNotFound(e) => Self::EndpointNotFound(e.clone()),
            Self::MethodNotFound { endpoint, method } => Self::MethodNotFound {
                endpoint: endpoint.clone(),
                method: method.clone(),
            },
            Self::InvalidArguments { method, reason } => Self::InvalidArguments {
                method: method.clone(),
                reason: reason.clone(),
            },
            Self::Remote(info) => Self::Remote(info.clone()),
            Self::Timeout => Self::Timeout,
            Self::Canceled => Self::Canceled,
            Self::Aborted => Self::Aborted,
            Self::ConnectionBroken(e) => Self::ConnectionBroken(e.clone()),
            Self::Serialization(e) => Self::Serialization(e.clone()),
            Self::DuplicateRequestId(e) => Self::DuplicateRequestId(e.clone()),
            Self::Io(e) => Self::Io(std::io::Error::new(e.kind(), e.to_string())),
        }
    }
}

/// An error a service handler raises when it wants to pick the `type_name`
/// the caller sees.
///
/// Any other `anyhow::Error` crosses the wire with a generic type name.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ServiceFault {
    pub type_name: String,
    pub message: String,
}

impl ServiceFault {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        let err = RpcError::EndpointNotFound("svc".to_string());
        assert_eq!(err.to_string(), "endpoint not found: svc");

        let err = RpcError::from(FramingError::MessageTooLarge { len: 10, max: 4 });
        assert_eq!(
            err.to_string(),
            "framing error: frame payload of 10 bytes exceeds limit of 4 bytes"
        );

        let err = RpcError::Remote(RemoteErrorInfo::new("Boom", "it broke"));
        assert_eq!(err.to_string(), "remote error: Boom: it broke");
    }

    #[test]
    fn duplicate_preserves_variant() {
        let io = RpcError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "pipe gone",
        ));
        match io.duplicate() {
            RpcError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::BrokenPipe),
            other => panic!("unexpected {other:?}"),
        }
        assert!(RpcError::Timeout.duplicate().is_timeout());
        assert!(RpcError::connection_broken("x").duplicate().is_connection_broken());
    }

    #[test]
    fn remote_accessor() {
        let err = RpcError::Remote(RemoteErrorInfo::new("A", "b"));
        assert_eq!(err.remote().map(|r| r.type_name.as_str()), Some("A"));
        assert!(RpcError::Canceled.remote().is_none());
    }
}
