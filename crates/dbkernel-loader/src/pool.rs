//! Shared worker pool.
//!
//! Backs plugin start sequences and asynchronous package loads. Blocking work
//! goes to tokio's blocking pool, whose threads are created lazily, reused and
//! retired when idle. Every task is tracked so shutdown can wait for it and
//! then abort whatever is left.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::task::TaskTracker;

/// Handle to a tokio runtime with tracked, abortable tasks.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    handle: Handle,
    tracker: TaskTracker,
    tasks: DashMap<u64, AbortHandle>,
    next_id: AtomicU64,
}

/// Outcome of [`WorkerPool::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolShutdown {
    /// Whether every task finished within the timeout.
    pub drained: bool,
    /// Tasks aborted after the timeout.
    pub aborted: usize,
}

impl WorkerPool {
    /// Create a pool on `handle`.
    pub fn new(handle: Handle) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                handle,
                tracker: TaskTracker::new(),
                tasks: DashMap::new(),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Create a pool on the runtime this is called from.
    ///
    /// # Panics
    ///
    /// Panics outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    /// Spawn an async task.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let inner = self.inner.clone();
        let task = self.inner.tracker.spawn_on(
            async move {
                let out = future.await;
                inner.tasks.remove(&id);
                out
            },
            &self.inner.handle,
        );
        self.track(id, &task);
        task
    }

    /// Run blocking work on the blocking pool.
    ///
    /// Blocking work cannot be aborted once it runs; shutdown only stops
    /// waiting for it.
    pub fn spawn_blocking<F, R>(&self, work: F) -> JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let inner = self.inner.clone();
        let token = self.inner.tracker.token();
        let task = self.inner.handle.spawn_blocking(move || {
            let _token = token;
            let out = work();
            inner.tasks.remove(&id);
            out
        });
        self.track(id, &task);
        task
    }

    /// A task may finish between its own removal and this insert, so
    /// finished handles are swept here as well.
    fn track<T>(&self, id: u64, task: &JoinHandle<T>) {
        self.inner.tasks.insert(id, task.abort_handle());
        self.prune();
    }

    fn prune(&self) {
        self.inner.tasks.retain(|_, handle| !handle.is_finished());
    }

    /// Number of tasks still running.
    pub fn active(&self) -> usize {
        self.inner.tracker.len()
    }

    /// Number of abortable handles held for unfinished tasks.
    pub fn tracked(&self) -> usize {
        self.prune();
        self.inner.tasks.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.tracker.is_closed()
    }

    /// Stop accepting work, wait up to `timeout` for running tasks, then
    /// abort the rest.
    pub async fn shutdown(&self, timeout: Duration) -> PoolShutdown {
        self.inner.tracker.close();

        if tokio::time::timeout(timeout, self.inner.tracker.wait())
            .await
            .is_ok()
        {
            tracing::debug!("worker pool drained");
            self.inner.tasks.clear();
            return PoolShutdown {
                drained: true,
                aborted: 0,
            };
        }

        let mut aborted = 0;
        self.inner.tasks.retain(|_, handle| {
            if !handle.is_finished() {
                handle.abort();
                aborted += 1;
            }
            false
        });
        tracing::warn!(
            aborted,
            timeout_ms = timeout.as_millis() as u64,
            "worker pool did not drain in time, aborted remaining tasks"
        );
        PoolShutdown {
            drained: false,
            aborted,
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("active", &self.active())
            .field("closed", &self.is_closed())
            .finish()
    }
}
