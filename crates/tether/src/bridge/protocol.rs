//! Wire protocol types shared by both ends of a connection.
//!
//! Every frame carries one of five kinds. Request, Response and
//! CancellationRequest frames carry a serialized envelope; UploadStream and
//! DownloadStream frames carry raw bytes that are read through a
//! [`StreamSlice`](super::slice::StreamSlice).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::FramingError;

/// Correlation key for one request/response pair.
///
/// Locally generated ids are random 128-bit UUIDs, so ids minted by the two
/// sides of a connection never collide. Ids received from the peer are kept
/// verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Frame discriminator. The numeric values are part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    Request = 0,
    Response = 1,
    CancellationRequest = 2,
    UploadStream = 3,
    DownloadStream = 4,
}

impl FrameKind {
    /// Stream-bearing frames are followed by raw body bytes instead of an envelope.
    pub fn is_stream(self) -> bool {
        matches!(self, Self::UploadStream | Self::DownloadStream)
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = FramingError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Request),
            1 => Ok(Self::Response),
            2 => Ok(Self::CancellationRequest),
            3 => Ok(Self::UploadStream),
            4 => Ok(Self::DownloadStream),
            other => Err(FramingError::UnknownKind(other)),
        }
    }
}

/// A method invocation sent by whichever side initiates the call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub endpoint: String,
    pub id: RequestId,
    pub method: String,
    /// Positional arguments, each converted independently.
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    /// Zero or negative means "no timeout".
    #[serde(default)]
    pub timeout_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<RequestId>,
    /// An UploadStream frame immediately follows this request.
    #[serde(default, skip_serializing_if = "is_false")]
    pub upload: bool,
}

impl Request {
    pub fn new(endpoint: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            id: RequestId::new(),
            method: method.into(),
            args: Vec::new(),
            timeout_seconds: 0.0,
            parent_id: None,
            upload: false,
        }
    }

    pub fn with_id(mut self, id: RequestId) -> Self {
        self.id = id;
        self
    }

    pub fn with_args(mut self, args: Vec<serde_json::Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<std::time::Duration>) -> Self {
        self.timeout_seconds = timeout.map(|t| t.as_secs_f64()).unwrap_or(0.0);
        self
    }

    pub fn with_parent(mut self, parent: Option<RequestId>) -> Self {
        self.parent_id = parent;
        self
    }

    /// The timeout requested by the caller, if any.
    pub fn timeout(&self) -> Option<std::time::Duration> {
        if self.timeout_seconds.is_finite() && self.timeout_seconds > 0.0 {
            Some(std::time::Duration::from_secs_f64(self.timeout_seconds))
        } else {
            None
        }
    }
}

/// The single terminal answer to a [`Request`].
///
/// `error` wins over everything else when present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteErrorInfo>,
    /// A DownloadStream frame immediately follows this response.
    #[serde(default, skip_serializing_if = "is_false")]
    pub download_stream: bool,
}

impl Response {
    pub fn data(request_id: RequestId, data: serde_json::Value) -> Self {
        Self {
            request_id,
            data: Some(data),
            error: None,
            download_stream: false,
        }
    }

    pub fn error(request_id: RequestId, error: RemoteErrorInfo) -> Self {
        Self {
            request_id,
            data: None,
            error: Some(error),
            download_stream: false,
        }
    }

    pub fn stream(request_id: RequestId) -> Self {
        Self {
            request_id,
            data: None,
            error: None,
            download_stream: true,
        }
    }
}

/// Best-effort request to stop an in-flight invocation. Never acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancellationRequest {
    pub request_id: RequestId,
}

/// Serializable stand-in for an error chain raised on the peer.
///
/// The receiving side never tries to rebuild the original error type; the
/// chain surfaces as [`RpcError::Remote`](crate::RpcError::Remote).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteErrorInfo {
    pub message: String,
    #[serde(default)]
    pub stack_trace: String,
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inner: Option<Box<RemoteErrorInfo>>,
}

impl RemoteErrorInfo {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack_trace: String::new(),
            type_name: type_name.into(),
            inner: None,
        }
    }

    pub fn with_inner(mut self, inner: RemoteErrorInfo) -> Self {
        self.inner = Some(Box::new(inner));
        self
    }

    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = stack_trace.into();
        self
    }

    /// Iterate the chain, outermost first.
    pub fn chain(&self) -> impl Iterator<Item = &RemoteErrorInfo> {
        std::iter::successors(Some(self), |e| e.inner.as_deref())
    }

    /// The innermost error of the chain.
    pub fn root_cause(&self) -> &RemoteErrorInfo {
        self.chain().last().unwrap_or(self)
    }
}

impl fmt::Display for RemoteErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frame_kind_values_are_fixed() {
        assert_eq!(FrameKind::Request as u8, 0);
        assert_eq!(FrameKind::Response as u8, 1);
        assert_eq!(FrameKind::CancellationRequest as u8, 2);
        assert_eq!(FrameKind::UploadStream as u8, 3);
        assert_eq!(FrameKind::DownloadStream as u8, 4);
        assert!(matches!(
            FrameKind::try_from(5),
            Err(FramingError::UnknownKind(5))
        ));
    }

    #[test]
    fn request_serializes() {
        let req = Request::new("svc", "Add")
            .with_id(RequestId::from("r1"))
            .with_args(vec![json!(1), json!(2)])
            .with_timeout(Some(std::time::Duration::from_millis(2500)));
        insta::assert_json_snapshot!(req, @r#"
        {
          "endpoint": "svc",
          "id": "r1",
          "method": "Add",
          "args": [
            1,
            2
          ],
          "timeoutSeconds": 2.5
        }
        "#);
    }

    #[test]
    fn response_with_data_serializes() {
        let resp = Response::data(RequestId::from("r1"), json!(3));
        insta::assert_json_snapshot!(resp, @r#"
        {
          "requestId": "r1",
          "data": 3
        }
        "#);
    }

    #[test]
    fn response_with_error_chain_serializes() {
        let error = RemoteErrorInfo::new("InvalidOperation", "outer")
            .with_inner(RemoteErrorInfo::new("Io", "disk full"));
        let resp = Response::error(RequestId::from("r2"), error);
        insta::assert_json_snapshot!(resp, @r#"
        {
          "requestId": "r2",
          "error": {
            "message": "outer",
            "stackTrace": "",
            "typeName": "InvalidOperation",
            "inner": {
              "message": "disk full",
              "stackTrace": "",
              "typeName": "Io"
            }
          }
        }
        "#);
    }

    #[test]
    fn cancellation_request_serializes() {
        let req = CancellationRequest {
            request_id: RequestId::from("r1"),
        };
        insta::assert_json_snapshot!(req, @r#"
        {
          "requestId": "r1"
        }
        "#);
    }

    #[test]
    fn request_timeout_ignores_non_positive_values() {
        let mut req = Request::new("svc", "Slow");
        assert_eq!(req.timeout(), None);
        req.timeout_seconds = -1.0;
        assert_eq!(req.timeout(), None);
        req.timeout_seconds = 0.25;
        assert_eq!(req.timeout(), Some(std::time::Duration::from_millis(250)));
    }

    #[test]
    fn request_defaults_missing_optional_fields() {
        let req: Request = serde_json::from_value(json!({
            "endpoint": "svc",
            "id": "r9",
            "method": "Ping"
        }))
        .unwrap();
        assert!(req.args.is_empty());
        assert!(!req.upload);
        assert_eq!(req.parent_id, None);
    }

    #[test]
    fn error_chain_walks_to_root() {
        let error = RemoteErrorInfo::new("A", "a")
            .with_inner(RemoteErrorInfo::new("B", "b").with_inner(RemoteErrorInfo::new("C", "c")));
        let names: Vec<_> = error.chain().map(|e| e.type_name.as_str()).collect();
        assert_eq!(names, ["A", "B", "C"]);
        assert_eq!(error.root_cause().message, "c");
        assert_eq!(error.to_string(), "A: a");
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = RequestId::new();
        let b = RequestId::new();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }
}
