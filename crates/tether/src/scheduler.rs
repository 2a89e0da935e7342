//! Where dispatched invocations run.
//!
//! By default every invocation is spawned on the ambient tokio runtime. An
//! endpoint can pin its invocations to a dedicated thread instead, e.g. for
//! services that are not `Sync`-friendly or must not compete with I/O.

use std::future::Future;
use std::io;
use std::pin::Pin;

use tokio::sync::mpsc;

pub type BoxTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub trait Scheduler: Send + Sync + 'static {
    fn spawn(&self, task: BoxTask);
}

/// Spawn on the current tokio runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn spawn(&self, task: BoxTask) {
        tokio::spawn(task);
    }
}

/// Runs invocations on one OS thread with its own current-thread runtime.
///
/// In serial mode each invocation finishes before the next one starts.
/// The thread exits when the scheduler is dropped.
pub struct DedicatedThreadScheduler {
    tx: mpsc::UnboundedSender<BoxTask>,
    name: String,
}

impl DedicatedThreadScheduler {
    /// Invocations interleave on the dedicated thread.
    pub fn new(name: impl Into<String>) -> io::Result<Self> {
        Self::start(name.into(), false)
    }

    /// Invocations run one at a time, in arrival order.
    pub fn serial(name: impl Into<String>) -> io::Result<Self> {
        Self::start(name.into(), true)
    }

    fn start(name: String, serial: bool) -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (tx, mut rx) = mpsc::unbounded_channel::<BoxTask>();

        let thread_name = name.clone();
        std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                tracing::debug!(scheduler = %thread_name, serial, "Scheduler thread started");
                runtime.block_on(async move {
                    while let Some(task) = rx.recv().await {
                        if serial {
                            task.await;
                        } else {
                            tokio::spawn(task);
                        }
                    }
                });
                tracing::debug!(scheduler = %thread_name, "Scheduler thread exiting");
            })?;

        Ok(Self { tx, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Scheduler for DedicatedThreadScheduler {
    fn spawn(&self, task: BoxTask) {
        if self.tx.send(task).is_err() {
            tracing::error!(scheduler = %self.name, "Scheduler thread is gone, dropping invocation");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn tokio_scheduler_runs_task() {
        let (tx, rx) = oneshot::channel();
        TokioScheduler.spawn(Box::pin(async move {
            let _ = tx.send(42);
        }));
        assert_eq!(rx.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn dedicated_thread_runs_off_caller_thread() {
        let scheduler = DedicatedThreadScheduler::new("tether-test").unwrap();
        let (tx, rx) = oneshot::channel();
        scheduler.spawn(Box::pin(async move {
            let name = std::thread::current().name().map(str::to_string);
            let _ = tx.send(name);
        }));
        assert_eq!(rx.await.unwrap().as_deref(), Some("tether-test"));
    }

    #[tokio::test]
    async fn serial_scheduler_preserves_order() {
        let scheduler = DedicatedThreadScheduler::serial("tether-serial").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = oneshot::channel();

        for n in 0..3u64 {
            let seen = Arc::clone(&seen);
            scheduler.spawn(Box::pin(async move {
                // Earlier tasks sleep longer; serial mode still finishes them first.
                tokio::time::sleep(Duration::from_millis(30 - n * 10)).await;
                seen.lock().unwrap().push(n);
            }));
        }
        scheduler.spawn(Box::pin(async move {
            let _ = done_tx.send(());
        }));

        done_rx.await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }
}
