//! Outstanding-call bookkeeping.
//!
//! Each side of a connection owns one [`PendingCallTable`] for the calls it
//! initiated. The receive pump completes entries as Responses arrive;
//! timeouts, cancellation and connection loss complete them from other tasks.
//! Whatever path gets there first wins; every later attempt is a no-op.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Notify;

use crate::bridge::protocol::RequestId;
use crate::bridge::slice::StreamSlice;
use crate::error::RpcError;
use crate::pool::{CompletionSourcePool, Poolable};

/// How an outstanding call ended.
#[derive(Debug)]
pub enum CallOutcome {
    Success(serde_json::Value),
    /// The peer answered with a download stream.
    Stream(StreamSlice),
    Fault(RpcError),
    Canceled,
}

/// Single-assignment result slot.
///
/// The first [`try_complete`](Self::try_complete) wins. Reusable through
/// [`CompletionSourcePool`] once no other handle refers to it.
pub struct CompletionSource<T> {
    inner: Arc<CompletionInner<T>>,
}

struct CompletionInner<T> {
    completed: AtomicBool,
    value: StdMutex<Option<T>>,
    notify: Notify,
}

impl<T> CompletionSource<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CompletionInner {
                completed: AtomicBool::new(false),
                value: StdMutex::new(None),
                notify: Notify::new(),
            }),
        }
    }

    /// Store `value` unless the source was already completed.
    pub fn try_complete(&self, value: T) -> bool {
        if self.inner.completed.swap(true, Ordering::AcqRel) {
            return false;
        }
        match self.inner.value.lock() {
            Ok(mut slot) => *slot = Some(value),
            Err(poisoned) => *poisoned.into_inner() = Some(value),
        }
        self.inner.notify.notify_one();
        true
    }

    pub fn is_completed(&self) -> bool {
        self.inner.completed.load(Ordering::Acquire)
    }

    /// Wait for the value. Intended for a single waiter.
    pub async fn wait(&self) -> T {
        loop {
            let notified = self.inner.notify.notified();
            if let Some(value) = self.take() {
                return value;
            }
            notified.await;
        }
    }

    fn take(&self) -> Option<T> {
        match self.inner.value.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

impl<T> Clone for CompletionSource<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for CompletionSource<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> Poolable for CompletionSource<T> {
    fn create() -> Self {
        Self::new()
    }

    fn reset(&mut self) -> bool {
        // Someone else still holds a handle (e.g. an abandoned table entry).
        if Arc::strong_count(&self.inner) != 1 {
            return false;
        }
        self.take();
        self.inner.completed.store(false, Ordering::Release);
        true
    }
}

struct PendingCall {
    slot: CompletionSource<CallOutcome>,
    created_at: Instant,
    abandoned: bool,
}

/// Concurrent map from request id to the waiting caller.
#[derive(Default)]
pub struct PendingCallTable {
    calls: DashMap<RequestId, PendingCall>,
}

impl PendingCallTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `id`. Fails if `id` is already outstanding.
    pub fn register(&self, id: RequestId) -> Result<PendingCallHandle, RpcError> {
        match self.calls.entry(id.clone()) {
            Entry::Occupied(_) => Err(RpcError::DuplicateRequestId(id.to_string())),
            Entry::Vacant(vacant) => {
                let slot = CompletionSourcePool::shared().rent();
                vacant.insert(PendingCall {
                    slot: slot.clone(),
                    created_at: Instant::now(),
                    abandoned: false,
                });
                Ok(PendingCallHandle { id, slot })
            }
        }
    }

    /// Complete `id` with `outcome`. Only the first completion per id takes
    /// effect; the entry is removed at the same moment.
    pub fn try_complete(&self, id: &RequestId, outcome: CallOutcome) -> bool {
        let Some((_, call)) = self.calls.remove(id) else {
            tracing::trace!(request_id = %id, "Completion for unknown or finished call ignored");
            return false;
        };
        if call.abandoned {
            // Nobody is waiting; dropping the outcome releases any stream slice.
            tracing::debug!(request_id = %id, "Late outcome for abandoned call discarded");
            return true;
        }
        tracing::trace!(
            request_id = %id,
            elapsed_ms = call.created_at.elapsed().as_millis() as u64,
            "Completing pending call"
        );
        call.slot.try_complete(outcome)
    }

    /// Fault every outstanding call. Returns how many were completed.
    pub fn complete_all(&self, fault: &RpcError) -> usize {
        let ids: Vec<RequestId> = self.calls.iter().map(|entry| entry.key().clone()).collect();
        let completed = ids
            .into_iter()
            .filter(|id| self.try_complete(id, CallOutcome::Fault(fault.duplicate())))
            .count();
        if completed > 0 {
            tracing::debug!(completed, %fault, "Faulted all pending calls");
        }
        completed
    }

    /// Mark `id` as no longer awaited. The entry stays until its real outcome
    /// arrives or [`complete_all`](Self::complete_all) runs, and that outcome
    /// is then discarded.
    pub fn abandon(&self, id: &RequestId) -> bool {
        match self.calls.get_mut(id) {
            Some(mut call) => {
                call.abandoned = true;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.calls.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

/// The caller's side of a registered call.
pub struct PendingCallHandle {
    id: RequestId,
    slot: CompletionSource<CallOutcome>,
}

impl PendingCallHandle {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Wait for the call's outcome.
    ///
    /// Dropping the returned future abandons the wait; the table entry stays
    /// until the real outcome arrives or the connection is torn down.
    pub async fn wait(self) -> CallOutcome {
        let outcome = self.slot.wait().await;
        CompletionSourcePool::shared().give_back(self.slot);
        outcome
    }
}
