//! Periodic background tasks
//!
//! Each maintenance job (phase refresh, invalidation check, warming cycle,
//! health refresh) runs in its own [`PeriodicTask`]: a sleep loop that
//! stops on a [`CancellationToken`] and bounds every run with a hard
//! timeout. Job failures and timeouts are logged and counted; the loop
//! keeps going.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

/// Returns the delay before the next run; evaluated after every run
pub type IntervalFn = Arc<dyn Fn() -> Duration + Send + Sync>;

/// Schedule for one periodic task
#[derive(Clone)]
pub struct TaskSpec {
    pub name: String,
    pub interval: IntervalFn,
    /// Hard limit per run
    pub timeout: Duration,
    /// Delay before the first run
    pub initial_delay: Duration,
}

impl TaskSpec {
    /// Fixed interval, first run after one interval
    pub fn every(name: impl Into<String>, interval: Duration, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            interval: Arc::new(move || interval),
            timeout,
            initial_delay: interval,
        }
    }

    /// Interval recomputed after every run
    pub fn dynamic(name: impl Into<String>, interval: IntervalFn, timeout: Duration) -> Self {
        let initial_delay = interval();
        Self {
            name: name.into(),
            interval,
            timeout,
            initial_delay,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }
}

impl std::fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSpec")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("initial_delay", &self.initial_delay)
            .finish()
    }
}

/// Run counters for one task
#[derive(Debug, Default)]
pub struct TaskStats {
    runs: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl TaskStats {
    /// Completed runs, including failed ones
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    /// Message of the most recent failed or timed-out run
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    fn record_error(&self, error: &Error) {
        match error {
            Error::Timeout { .. } => self.timeouts.fetch_add(1, Ordering::Relaxed),
            _ => self.failures.fetch_add(1, Ordering::Relaxed),
        };
        *self.last_error.lock() = Some(error.to_string());
    }
}

/// A running periodic task
pub struct PeriodicTask {
    name: String,
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<TaskStats>,
}

impl PeriodicTask {
    /// Spawn the loop. It stops when `parent` or this task is cancelled.
    pub fn start<F, Fut>(spec: TaskSpec, parent: &CancellationToken, job: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let token = parent.child_token();
        let stats = Arc::new(TaskStats::default());
        let name = spec.name.clone();

        let handle = tokio::spawn(run_loop(spec, token.clone(), stats.clone(), job));
        info!(task = %name, "Started periodic task");

        Self {
            name,
            token,
            handle: Mutex::new(Some(handle)),
            stats,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> &TaskStats {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Cancel and wait for the loop to exit
    pub async fn stop(&self) {
        self.token.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(task = %self.name, error = %e, "Periodic task ended abnormally");
            }
        }
        info!(task = %self.name, "Stopped periodic task");
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn run_loop<F, Fut>(spec: TaskSpec, token: CancellationToken, stats: Arc<TaskStats>, job: F)
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let mut delay = spec.initial_delay;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        let outcome = tokio::select! {
            _ = token.cancelled() => break,
            outcome = tokio::time::timeout(spec.timeout, job()) => outcome,
        };
        let outcome = outcome.unwrap_or_else(|_| {
            Err(Error::Timeout {
                task: spec.name.clone(),
                duration: spec.timeout,
            })
        });

        stats.runs.fetch_add(1, Ordering::Relaxed);
        match outcome {
            Ok(()) => debug!(task = %spec.name, "Periodic task run complete"),
            Err(e) => {
                stats.record_error(&e);
                error!(task = %spec.name, error = %e, "Periodic task failed");
            }
        }

        delay = (spec.interval)();
    }

    debug!(task = %spec.name, "Periodic task loop exited");
}

// =============================================================================
// Tests
// =============================================================================
