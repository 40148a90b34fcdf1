//! Global atomic counters for the execution core.
//!
//! Counters are bumped silently by the step loop. Call [`Metrics::flush`]
//! to emit the current values as one `tracing::info!` event.

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters.
pub static METRICS: Metrics = Metrics::new();

/// Lock-free counters.
pub struct Metrics {
    runs_completed: AtomicU64,
    steps_executed: AtomicU64,
    tool_calls: AtomicU64,
    code_executions: AtomicU64,
    reflections_recorded: AtomicU64,
    refinements_run: AtomicU64,
    divergence_signals: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            runs_completed: AtomicU64::new(0),
            steps_executed: AtomicU64::new(0),
            tool_calls: AtomicU64::new(0),
            code_executions: AtomicU64::new(0),
            reflections_recorded: AtomicU64::new(0),
            refinements_run: AtomicU64::new(0),
            divergence_signals: AtomicU64::new(0),
        }
    }

    pub fn inc_runs(&self) {
        self.runs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_steps(&self) {
        self.steps_executed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "steps_executed", "counter incremented");
    }

    pub fn add_tool_calls(&self, n: u64) {
        self.tool_calls.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_code_executions(&self) {
        self.code_executions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reflections(&self) {
        self.reflections_recorded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_refinements(&self) {
        self.refinements_run.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_divergence_signals(&self) {
        self.divergence_signals.fetch_add(1, Ordering::Relaxed);
    }

    /// Emit all counters as a single `info!` event, typically at the end of a run.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            runs_completed = self.runs_completed(),
            steps_executed = self.steps_executed(),
            tool_calls = self.tool_calls(),
            code_executions = self.code_executions(),
            reflections_recorded = self.reflections_recorded(),
            refinements_run = self.refinements_run(),
            divergence_signals = self.divergence_signals(),
        );
    }

    pub fn runs_completed(&self) -> u64 {
        self.runs_completed.load(Ordering::Relaxed)
    }

    pub fn steps_executed(&self) -> u64 {
        self.steps_executed.load(Ordering::Relaxed)
    }

    pub fn tool_calls(&self) -> u64 {
        self.tool_calls.load(Ordering::Relaxed)
    }

    pub fn code_executions(&self) -> u64 {
        self.code_executions.load(Ordering::Relaxed)
    }

    pub fn reflections_recorded(&self) -> u64 {
        self.reflections_recorded.load(Ordering::Relaxed)
    }

    pub fn refinements_run(&self) -> u64 {
        self.refinements_run.load(Ordering::Relaxed)
    }

    pub fn divergence_signals(&self) -> u64 {
        self.divergence_signals.load(Ordering::Relaxed)
    }

    /// Zero every counter (tests).
    pub fn reset(&self) {
        for counter in [
            &self.runs_completed,
            &self.steps_executed,
            &self.tool_calls,
            &self.code_executions,
            &self.reflections_recorded,
            &self.refinements_run,
            &self.divergence_signals,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
