//! Host-to-client calls over an existing connection.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::bridge::protocol::RequestId;
use crate::bridge::slice::{OutboundStream, StreamSlice};
use crate::error::RpcError;
use crate::proxy::Method;
use crate::session::{CallOptions, Session};

/// Calls a callback contract the peer registered in its own dispatcher.
///
/// Uses the same request/response machinery as
/// [`ServiceProxy`](crate::ServiceProxy), on the connection the host is
/// already serving. Obtain one inside a handler through
/// [`CallContext::callback`](crate::CallContext::callback) so nested calls
/// carry the inbound request id as their parent.
#[derive(Clone)]
pub struct CallbackBroker {
    session: Arc<Session>,
    contract: String,
    parent_id: Option<RequestId>,
}

impl CallbackBroker {
    pub fn new(session: Arc<Session>, contract: impl Into<String>) -> Self {
        Self {
            session,
            contract: contract.into(),
            parent_id: None,
        }
    }

    pub fn with_parent(mut self, parent: RequestId) -> Self {
        self.parent_id = Some(parent);
        self
    }

    pub fn contract(&self) -> &str {
        &self.contract
    }

    pub fn parent_id(&self) -> Option<&RequestId> {
        self.parent_id.as_ref()
    }

    pub async fn call<A, R>(
        &self,
        method: Method<A, R>,
        args: A,
        options: CallOptions,
    ) -> Result<R, RpcError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.session
            .call_typed(&self.contract, method, &args, None, self.options(options))
            .await
    }

    pub async fn call_with_upload<A, R>(
        &self,
        method: Method<A, R>,
        args: A,
        upload: OutboundStream,
        options: CallOptions,
    ) -> Result<R, RpcError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.session
            .call_typed(&self.contract, method, &args, Some(upload), self.options(options))
            .await
    }

    pub async fn call_download<A>(
        &self,
        method: Method<A, StreamSlice>,
        args: A,
        options: CallOptions,
    ) -> Result<StreamSlice, RpcError>
    where
        A: Serialize,
    {
        self.session
            .call_download(&self.contract, method, &args, self.options(options))
            .await
    }

    fn options(&self, mut options: CallOptions) -> CallOptions {
        if options.parent_id.is_none() {
            options.parent_id = self.parent_id.clone();
        }
        options
    }
}

impl std::fmt::Debug for CallbackBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackBroker")
            .field("contract", &self.contract)
            .field("parent_id", &self.parent_id)
            .finish_non_exhaustive()
    }
}
