//! Isolation primitives: resource limits, isolation results and the
//! thread-backed executor with a hard wall-clock timeout.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Caps applied to one isolated unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum wall-clock time (milliseconds). `0` disables the timeout.
    pub timeout_ms: u64,
    /// Maximum resident-memory growth during the run (bytes). `0` disables the check.
    pub max_memory_bytes: u64,
    /// Maximum size of the produced output (bytes). `0` disables the check.
    pub max_output_bytes: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_memory_bytes: 512 * 1024 * 1024,
            max_output_bytes: 1024 * 1024,
        }
    }
}

impl ResourceLimits {
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_memory_bytes(mut self, bytes: u64) -> Self {
        self.max_memory_bytes = bytes;
        self
    }

    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }
}

/// Coarse outcome of an isolated execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationStatus {
    Success,
    Timeout,
    Violation,
    Error,
}

impl std::fmt::Display for IsolationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IsolationStatus::Success => write!(f, "success"),
            IsolationStatus::Timeout => write!(f, "timeout"),
            IsolationStatus::Violation => write!(f, "violation"),
            IsolationStatus::Error => write!(f, "error"),
        }
    }
}

/// Measurements taken around an isolated execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationMetrics {
    pub duration_ms: u64,
    pub memory_bytes: u64,
    pub output_bytes: u64,
}

/// Value or failure of an isolated execution, disjoint by status.
#[derive(Debug, Clone, PartialEq)]
pub enum IsolationOutcome<T> {
    Success(T),
    Timeout { limit_ms: u64 },
    Violation { reason: String },
    Error { message: String },
}

/// Outcome plus metrics of one isolated execution.
#[derive(Debug, Clone, PartialEq)]
pub struct IsolationResult<T> {
    pub outcome: IsolationOutcome<T>,
    pub metrics: IsolationMetrics,
}

impl<T> IsolationResult<T> {
    pub fn status(&self) -> IsolationStatus {
        match self.outcome {
            IsolationOutcome::Success(_) => IsolationStatus::Success,
            IsolationOutcome::Timeout { .. } => IsolationStatus::Timeout,
            IsolationOutcome::Violation { .. } => IsolationStatus::Violation,
            IsolationOutcome::Error { .. } => IsolationStatus::Error,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status() == IsolationStatus::Success
    }

    pub fn value(&self) -> Option<&T> {
        match &self.outcome {
            IsolationOutcome::Success(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self.outcome {
            IsolationOutcome::Success(v) => Some(v),
            _ => None,
        }
    }

    /// Human-readable failure description, `None` on success.
    pub fn error(&self) -> Option<String> {
        match &self.outcome {
            IsolationOutcome::Success(_) => None,
            IsolationOutcome::Timeout { limit_ms } => {
                Some(format!("execution timed out after {limit_ms}ms"))
            }
            IsolationOutcome::Violation { reason } => Some(format!("resource violation: {reason}")),
            IsolationOutcome::Error { message } => Some(message.clone()),
        }
    }
}

/// Output whose size counts against `ResourceLimits::max_output_bytes`.
pub trait MeasuredOutput {
    fn output_bytes(&self) -> usize;
}

impl MeasuredOutput for String {
    fn output_bytes(&self) -> usize {
        self.len()
    }
}

impl MeasuredOutput for Vec<u8> {
    fn output_bytes(&self) -> usize {
        self.len()
    }
}

impl MeasuredOutput for serde_json::Value {
    fn output_bytes(&self) -> usize {
        match self {
            serde_json::Value::String(s) => s.len(),
            other => other.to_string().len(),
        }
    }
}

impl MeasuredOutput for () {
    fn output_bytes(&self) -> usize {
        0
    }
}

/// Cancellation flag shared with an isolated worker.
///
/// Raised when the wall-clock budget expires. Interpreted code observes it on
/// every operation; arbitrary closures may ignore it and are abandoned.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Runs a unit of work on a dedicated OS thread with a hard timeout.
///
/// The calling thread blocks until the worker reports back or the budget
/// expires. On timeout the worker is cancelled and detached; its eventual
/// result is discarded and the caller always sees `Timeout`.
#[derive(Debug, Clone)]
pub struct ThreadExecutor {
    limits: ResourceLimits,
    thread_name: String,
}

impl ThreadExecutor {
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            thread_name: "ravel-isolated".to_string(),
        }
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Execute `work` in isolation.
    pub fn execute<T, F>(&self, work: F) -> IsolationResult<T>
    where
        F: FnOnce(CancelToken) -> Result<T, String> + Send + 'static,
        T: MeasuredOutput + Send + 'static,
    {
        let token = CancelToken::new();
        let worker_token = token.clone();
        let (tx, rx) = mpsc::channel();
        let started = Instant::now();
        let rss_before = resident_memory_bytes();

        let spawned = std::thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(worker_token)));
                // Receiver is gone after a timeout; nothing left to report to.
                let _ = tx.send(outcome);
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                return IsolationResult {
                    outcome: IsolationOutcome::Error {
                        message: format!("failed to spawn isolated worker: {e}"),
                    },
                    metrics: IsolationMetrics::default(),
                }
            }
        };

        let received = if self.limits.timeout_ms == 0 {
            rx.recv().map_err(|_| RecvTimeoutError::Disconnected)
        } else {
            rx.recv_timeout(Duration::from_millis(self.limits.timeout_ms))
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let memory_bytes = match (rss_before, resident_memory_bytes()) {
            (Some(before), Some(after)) => after.saturating_sub(before),
            _ => 0,
        };
        let mut metrics = IsolationMetrics {
            duration_ms,
            memory_bytes,
            output_bytes: 0,
        };

        let outcome = match received {
            Ok(Ok(Ok(value))) => {
                let _ = handle.join();
                metrics.output_bytes = value.output_bytes() as u64;
                self.check_limits(value, &metrics)
            }
            Ok(Ok(Err(message))) => {
                let _ = handle.join();
                IsolationOutcome::Error { message }
            }
            Ok(Err(payload)) => {
                let _ = handle.join();
                IsolationOutcome::Error {
                    message: format!("isolated worker panicked: {}", panic_message(&payload)),
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                token.cancel();
                warn!(
                    thread = %self.thread_name,
                    limit_ms = self.limits.timeout_ms,
                    "isolated worker exceeded wall-clock limit; cancelling and detaching"
                );
                drop(handle);
                IsolationOutcome::Timeout {
                    limit_ms: self.limits.timeout_ms,
                }
            }
            Err(RecvTimeoutError::Disconnected) => IsolationOutcome::Error {
                message: "isolated worker exited without reporting a result".to_string(),
            },
        };

        debug!(
            thread = %self.thread_name,
            duration_ms = metrics.duration_ms,
            memory_bytes = metrics.memory_bytes,
            output_bytes = metrics.output_bytes,
            "isolated execution finished"
        );

        IsolationResult { outcome, metrics }
    }

    fn check_limits<T>(&self, value: T, metrics: &IsolationMetrics) -> IsolationOutcome<T> {
        let limits = &self.limits;
        if limits.max_output_bytes > 0 && metrics.output_bytes > limits.max_output_bytes as u64 {
            return IsolationOutcome::Violation {
                reason: format!(
                    "output of {} bytes exceeds limit of {} bytes",
                    metrics.output_bytes, limits.max_output_bytes
                ),
            };
        }
        if limits.max_memory_bytes > 0 && metrics.memory_bytes > limits.max_memory_bytes {
            return IsolationOutcome::Violation {
                reason: format!(
                    "memory growth of {} bytes exceeds limit of {} bytes",
                    metrics.memory_bytes, limits.max_memory_bytes
                ),
            };
        }
        IsolationOutcome::Success(value)
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Resident set size of this process, where the platform exposes it.
fn resident_memory_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(pages * 4096)
}
