//! Dedicated per-plugin worker threads.
//!
//! A plugin's start path may run for as long as the plugin lives, so each
//! started plugin gets its own named OS thread rather than a pool slot.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use dbkernel_core::{PluginError, PluginResult, RunContext};
use tokio_util::sync::CancellationToken;

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A running plugin's dedicated thread.
#[derive(Debug)]
pub struct PluginWorker {
    id: String,
    cancel: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl PluginWorker {
    /// Spawn a worker for plugin `id`.
    ///
    /// `run` executes on the new thread with a [`RunContext`] whose token is
    /// cancelled by [`cancel`](Self::cancel). Its result, with panics turned
    /// into [`PluginError::Panicked`], goes to `report` on the same thread.
    pub fn spawn<R, F>(id: &str, run: R, report: F) -> PluginResult<Self>
    where
        R: FnOnce(&RunContext) -> PluginResult<()> + Send + 'static,
        F: FnOnce(PluginResult<()>) + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let ctx = RunContext::new(id, cancel.clone());

        let thread = std::thread::Builder::new()
            .name(format!("plugin-{id}"))
            .spawn(move || {
                let result = catch_unwind(AssertUnwindSafe(|| run(&ctx)))
                    .unwrap_or_else(|payload| Err(PluginError::from_panic(payload)));
                report(result);
            })
            .map_err(|e| PluginError::failed(format!("failed to spawn worker: {e}")))?;

        tracing::debug!(plugin = id, "spawned plugin worker");
        Ok(Self {
            id: id.to_string(),
            cancel,
            thread: Some(thread),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Signal the plugin to stop.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Wait up to `timeout` for the thread to exit.
    ///
    /// Returns `false` if it is still running; the thread is then detached
    /// and left to notice its cancellation on its own.
    pub fn join(mut self, timeout: Duration) -> bool {
        let Some(thread) = self.thread.take() else {
            return true;
        };

        let deadline = Instant::now() + timeout;
        while !thread.is_finished() {
            if Instant::now() >= deadline {
                tracing::warn!(
                    plugin = %self.id,
                    timeout_ms = timeout.as_millis() as u64,
                    "plugin worker did not stop in time, detaching"
                );
                return false;
            }
            std::thread::sleep(JOIN_POLL_INTERVAL);
        }

        // The body never unwinds past catch_unwind.
        let _ = thread.join();
        true
    }
}

impl Drop for PluginWorker {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.cancel.cancel();
        }
    }
}
