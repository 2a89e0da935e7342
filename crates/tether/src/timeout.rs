//! Timeout racing with cancellation precedence.
//!
//! A [`TimeoutRace`] merges an optional deadline and an external cancellation
//! token into one combined token. When the combined token fires, the abort is
//! classified after the fact: if the external token was cancelled the result
//! is always [`AbortReason::Canceled`], even when the timer fired as well.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::RpcError;
use crate::pool::{CancellationSource, CancellationSourcePool};

const ARMED: u8 = 0;
const TIMED_OUT: u8 = 1;
const EXTERNAL: u8 = 2;
const DISARMED: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    TimedOut,
    Canceled,
    /// Aborted locally through [`TimeoutRace::cancel`] or not aborted at all.
    Other,
}

pub struct TimeoutRace {
    source: Option<CancellationSource>,
    external: CancellationToken,
    state: Arc<AtomicU8>,
    watcher: Option<JoinHandle<()>>,
    pool: &'static CancellationSourcePool,
}

impl TimeoutRace {
    /// Start racing `timeout` (if any) against `external`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(timeout: Option<Duration>, external: &CancellationToken) -> Self {
        Self::with_pool(timeout, external, CancellationSourcePool::shared())
    }

    pub(crate) fn with_pool(
        timeout: Option<Duration>,
        external: &CancellationToken,
        pool: &'static CancellationSourcePool,
    ) -> Self {
        let source = pool.rent();
        let state = Arc::new(AtomicU8::new(ARMED));

        let watcher = if external.is_cancelled() {
            state.store(EXTERNAL, Ordering::Release);
            source.cancel();
            None
        } else {
            let root = source.root().clone();
            let external = external.clone();
            let state = Arc::clone(&state);
            Some(tokio::spawn(async move {
                let fired = tokio::select! {
                    _ = external.cancelled() => EXTERNAL,
                    _ = sleep_or_pending(timeout) => TIMED_OUT,
                };
                if state
                    .compare_exchange(ARMED, fired, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    root.cancel();
                }
            }))
        };

        Self {
            source: Some(source),
            external: external.clone(),
            state,
            watcher,
            pool,
        }
    }

    /// Combined token: fires on timeout, external cancellation or [`cancel`](Self::cancel).
    pub fn token(&self) -> CancellationToken {
        match &self.source {
            Some(source) => source.token(),
            None => CancellationToken::new(),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.source.as_ref().is_some_and(|s| s.is_cancelled())
    }

    /// Abort locally. Classified as [`AbortReason::Other`] unless the external
    /// token is also cancelled.
    pub fn cancel(&self) {
        if let Some(source) = &self.source {
            source.cancel();
        }
    }

    pub fn classify(&self) -> AbortReason {
        if self.external.is_cancelled() {
            return AbortReason::Canceled;
        }
        match self.state.load(Ordering::Acquire) {
            TIMED_OUT => AbortReason::TimedOut,
            EXTERNAL => AbortReason::Canceled,
            _ => AbortReason::Other,
        }
    }

    /// Turn a generic [`RpcError::Aborted`] into `Timeout` or `Canceled`.
    pub fn classify_error(&self, err: RpcError) -> RpcError {
        match err {
            RpcError::Aborted => match self.classify() {
                AbortReason::TimedOut => RpcError::Timeout,
                AbortReason::Canceled => RpcError::Canceled,
                AbortReason::Other => RpcError::Aborted,
            },
            other => other,
        }
    }

    /// Drive `fut` until it finishes or the combined token fires.
    pub async fn run<T, F>(&self, fut: F) -> Result<T, RpcError>
    where
        F: Future<Output = Result<T, RpcError>>,
    {
        let token = self.token();
        tokio::select! {
            biased;
            result = fut => result.map_err(|e| self.classify_error(e)),
            _ = token.cancelled() => Err(self.classify_error(RpcError::Aborted)),
        }
    }
}

impl Drop for TimeoutRace {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        let Some(source) = self.source.take() else {
            return;
        };
        // Only reuse the source if the watcher can no longer fire it.
        let disarmed = self
            .state
            .compare_exchange(ARMED, DISARMED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if disarmed && !source.is_cancelled() {
            self.pool.give_back(source);
        }
    }
}

async fn sleep_or_pending(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaked_pool() -> &'static CancellationSourcePool {
        Box::leak(Box::new(CancellationSourcePool::new(8)))
    }

    #[tokio::test(start_paused = true)]
    async fn timer_fires_as_timed_out() {
        let external = CancellationToken::new();
        let race = TimeoutRace::new(Some(Duration::from_millis(50)), &external);
        race.token().cancelled().await;
        assert_eq!(race.classify(), AbortReason::TimedOut);
        assert!(race.classify_error(RpcError::Aborted).is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn external_cancel_is_canceled() {
        let external = CancellationToken::new();
        let race = TimeoutRace::new(Some(Duration::from_secs(60)), &external);
        external.cancel();
        race.token().cancelled().await;
        assert_eq!(race.classify(), AbortReason::Canceled);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_wins_when_both_fire() {
        let external = CancellationToken::new();
        let race = TimeoutRace::new(Some(Duration::from_millis(10)), &external);
        race.token().cancelled().await;
        external.cancel();
        assert_eq!(race.classify(), AbortReason::Canceled);
        assert!(race.classify_error(RpcError::Aborted).is_canceled());
    }

    #[tokio::test]
    async fn already_cancelled_external_aborts_immediately() {
        let external = CancellationToken::new();
        external.cancel();
        let race = TimeoutRace::new(None, &external);
        assert!(race.is_aborted());
        assert_eq!(race.classify(), AbortReason::Canceled);
    }

    #[tokio::test]
    async fn local_cancel_is_other() {
        let external = CancellationToken::new();
        let race = TimeoutRace::new(None, &external);
        race.cancel();
        assert!(race.token().is_cancelled());
        assert_eq!(race.classify(), AbortReason::Other);
        assert!(matches!(race.classify_error(RpcError::Aborted), RpcError::Aborted));
    }

    #[tokio::test(start_paused = true)]
    async fn run_returns_future_result_or_classified_abort() {
        let external = CancellationToken::new();
        let race = TimeoutRace::new(Some(Duration::from_millis(100)), &external);
        let ok = race.run(async { Ok::<_, RpcError>(7) }).await.unwrap();
        assert_eq!(ok, 7);

        let err = race
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, RpcError>(())
            })
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn non_abort_errors_pass_through() {
        let race = TimeoutRace::new(None, &CancellationToken::new());
        let err = race
            .run(async { Err::<(), _>(RpcError::connection_broken("gone")) })
            .await
            .unwrap_err();
        assert!(err.is_connection_broken());
    }

    #[tokio::test]
    async fn unfired_source_returns_to_pool() {
        let pool = leaked_pool();
        let race = TimeoutRace::with_pool(None, &CancellationToken::new(), pool);
        drop(race);
        assert_eq!(pool.idle(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fired_source_is_discarded() {
        let pool = leaked_pool();
        let race = TimeoutRace::with_pool(Some(Duration::from_millis(1)), &CancellationToken::new(), pool);
        race.token().cancelled().await;
        drop(race);
        assert_eq!(pool.idle(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_race_token_survives_next_rental() {
        let pool = leaked_pool();
        let first = TimeoutRace::with_pool(None, &CancellationToken::new(), pool);
        let kept = first.token();
        drop(first);
        assert_eq!(pool.idle(), 1);

        let second = TimeoutRace::with_pool(Some(Duration::from_millis(5)), &CancellationToken::new(), pool);
        assert_eq!(pool.idle(), 0);
        second.token().cancelled().await;
        assert_eq!(second.classify(), AbortReason::TimedOut);
        assert!(!kept.is_cancelled());
    }
}
