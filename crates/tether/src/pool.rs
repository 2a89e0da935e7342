//! Bounded object pools for per-call primitives.
//!
//! Every in-flight call rents one cancellation source and one completion
//! source. Pools keep steady-state allocation flat under high call rates.
//! They are bounded free lists: renting never blocks, and returning an item
//! to a full pool (or one that cannot be reset) simply drops it.

use std::sync::Mutex as StdMutex;
use std::sync::OnceLock;

use tokio_util::sync::CancellationToken;

use crate::pending::{CallOutcome, CompletionSource};

pub const DEFAULT_POOL_CAPACITY: usize = 1024;

/// An item that can be recycled through a [`BoundedPool`].
pub trait Poolable: Sized + Send {
    fn create() -> Self;

    /// Prepare the item for its next user. Returning `false` discards it.
    fn reset(&mut self) -> bool;
}

pub struct BoundedPool<T> {
    items: StdMutex<Vec<T>>,
    capacity: usize,
}

impl<T: Poolable> BoundedPool<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: StdMutex::new(Vec::with_capacity(capacity.min(64))),
            capacity,
        }
    }

    pub fn rent(&self) -> T {
        let pooled = match self.items.lock() {
            Ok(mut items) => items.pop(),
            Err(_) => {
                tracing::error!("Pool mutex poisoned - allocating fresh item");
                None
            }
        };
        pooled.unwrap_or_else(T::create)
    }

    /// Return an item. Returns `true` if the pool kept it.
    pub fn give_back(&self, mut item: T) -> bool {
        if !item.reset() {
            return false;
        }
        let Ok(mut items) = self.items.lock() else {
            return false;
        };
        if items.len() >= self.capacity {
            return false;
        }
        items.push(item);
        true
    }

    /// Number of idle items currently pooled.
    pub fn idle(&self) -> usize {
        self.items.lock().map(|items| items.len()).unwrap_or(0)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Root cancellation token for one call.
///
/// Consumers only ever see child tokens, so cancelling a handed-out token
/// never cancels the root. Child tokens can outlive the call, so every reset
/// installs a fresh root: a recycled source never fires tokens handed to its
/// previous user.
#[derive(Debug, Clone)]
pub struct CancellationSource {
    token: CancellationToken,
}

impl CancellationSource {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// A token that fires when this source fires.
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub(crate) fn root(&self) -> &CancellationToken {
        &self.token
    }
}

impl Poolable for CancellationSource {
    fn create() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    fn reset(&mut self) -> bool {
        self.token = CancellationToken::new();
        true
    }
}

pub struct CancellationSourcePool(BoundedPool<CancellationSource>);

impl CancellationSourcePool {
    pub fn new(capacity: usize) -> Self {
        Self(BoundedPool::new(capacity))
    }

    /// Process-wide pool shared by every connection.
    pub fn shared() -> &'static Self {
        static POOL: OnceLock<CancellationSourcePool> = OnceLock::new();
        POOL.get_or_init(|| Self::new(DEFAULT_POOL_CAPACITY))
    }

    pub fn rent(&self) -> CancellationSource {
        self.0.rent()
    }

    pub fn give_back(&self, source: CancellationSource) -> bool {
        self.0.give_back(source)
    }

    pub fn idle(&self) -> usize {
        self.0.idle()
    }
}

pub struct CompletionSourcePool(BoundedPool<CompletionSource<CallOutcome>>);

impl CompletionSourcePool {
    pub fn new(capacity: usize) -> Self {
        Self(BoundedPool::new(capacity))
    }

    /// Process-wide pool shared by every connection.
    pub fn shared() -> &'static Self {
        static POOL: OnceLock<CompletionSourcePool> = OnceLock::new();
        POOL.get_or_init(|| Self::new(DEFAULT_POOL_CAPACITY))
    }

    pub fn rent(&self) -> CompletionSource<CallOutcome> {
        self.0.rent()
    }

    /// Only sources nobody else references are recycled.
    pub fn give_back(&self, source: CompletionSource<CallOutcome>) -> bool {
        self.0.give_back(source)
    }

    pub fn idle(&self) -> usize {
        self.0.idle()
    }
}
