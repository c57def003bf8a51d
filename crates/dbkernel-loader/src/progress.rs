//! Load progress reporting and callback dispatch.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use dbkernel_core::UnitFailure;
use serde::Serialize;
use tokio::sync::mpsc;

/// Progress of a directory load, reported once per package before it loads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadProgress {
    /// One-based index of the package being loaded.
    pub current_index: usize,
    /// Number of packages found.
    pub total: usize,
    /// Package being loaded.
    pub current_file: PathBuf,
}

impl LoadProgress {
    /// Completion ratio in `0.0..=1.0`.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.current_index as f64 / self.total as f64
        }
    }
}

/// Summary of a directory load.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DriverLoadResult {
    /// Packages that registered at least one driver.
    pub success_count: usize,
    /// Packages that failed plus units skipped inside loaded packages.
    pub failure_count: usize,
    /// Human-readable summary.
    pub message: String,
    /// Names of the drivers that were registered.
    pub loaded_identifiers: Vec<String>,
    /// Packages that failed outright or yielded no driver.
    pub failed_packages: Vec<PathBuf>,
    /// Units skipped inside otherwise readable packages.
    pub unit_failures: Vec<UnitFailure>,
    /// Wall time spent loading.
    pub elapsed: Duration,
}

impl DriverLoadResult {
    /// Check if nothing failed.
    pub fn is_clean(&self) -> bool {
        self.failure_count == 0
    }
}

/// Accumulates a [`DriverLoadResult`] while a directory loads.
#[derive(Debug)]
pub(crate) struct LoadTracker {
    start_time: Instant,
    total: usize,
    result: DriverLoadResult,
}

impl LoadTracker {
    pub fn new(total: usize) -> Self {
        Self {
            start_time: Instant::now(),
            total,
            result: DriverLoadResult::default(),
        }
    }

    pub fn progress(&self, index: usize, file: PathBuf) -> LoadProgress {
        LoadProgress {
            current_index: index + 1,
            total: self.total,
            current_file: file,
        }
    }

    pub fn record_success(&mut self, drivers: impl IntoIterator<Item = String>) {
        self.result.success_count += 1;
        self.result.loaded_identifiers.extend(drivers);
    }

    pub fn record_package_failure(&mut self, package: PathBuf) {
        self.result.failure_count += 1;
        self.result.failed_packages.push(package);
    }

    pub fn record_unit_failures(&mut self, failures: impl IntoIterator<Item = UnitFailure>) {
        for failure in failures {
            self.result.failure_count += 1;
            self.result.unit_failures.push(failure);
        }
    }

    pub fn finish(mut self) -> DriverLoadResult {
        self.result.elapsed = self.start_time.elapsed();
        self.result.message = if self.total == 0 {
            "No driver packages found".to_string()
        } else {
            format!(
                "Loaded {} driver(s) from {} of {} package(s), {} failure(s)",
                self.result.loaded_identifiers.len(),
                self.result.success_count,
                self.total,
                self.result.failure_count
            )
        };
        self.result
    }
}

/// A callback bound for the caller's execution context.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Where progress and completion callbacks run.
///
/// The loader only guarantees that callbacks are handed over one at a time,
/// in order; the executor decides which thread actually runs them.
pub trait CallbackExecutor: Send + Sync + 'static {
    fn execute(&self, callback: Callback);
}

/// Runs callbacks immediately on the loading worker.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl CallbackExecutor for InlineExecutor {
    fn execute(&self, callback: Callback) {
        callback();
    }
}

/// Hands callbacks to a [`CallbackQueue`] drained by the owning thread
/// (a UI loop, the CLI main thread, a test).
#[derive(Debug, Clone)]
pub struct QueuedExecutor {
    tx: mpsc::UnboundedSender<Callback>,
}

/// Receiving side of a [`QueuedExecutor`].
#[derive(Debug)]
pub struct CallbackQueue {
    rx: mpsc::UnboundedReceiver<Callback>,
}

impl QueuedExecutor {
    pub fn new() -> (Self, CallbackQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, CallbackQueue { rx })
    }
}

impl CallbackExecutor for QueuedExecutor {
    fn execute(&self, callback: Callback) {
        if self.tx.send(callback).is_err() {
            tracing::debug!("callback queue closed, dropping callback");
        }
    }
}

impl CallbackQueue {
    /// Run every callback already queued. Returns how many ran.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(callback) = self.rx.try_recv() {
            callback();
            ran += 1;
        }
        ran
    }

    /// Wait for the next callback and run it. Returns `false` once every
    /// executor handle is gone and the queue is empty.
    pub async fn run_next(&mut self) -> bool {
        match self.rx.recv().await {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }

    /// Blocking variant of [`run_next`](Self::run_next) for non-async
    /// threads. Must not be called from inside a runtime.
    pub fn blocking_run_next(&mut self) -> bool {
        match self.rx.blocking_recv() {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }
}
