//! Structured tracing hooks for the run lifecycle.
//!
//! Every agent run executes inside a `ravel.run` span tagged with its
//! `run_id`; the `emit_*` helpers log one event per lifecycle milestone.
//! Set `RUST_LOG=ravel_core=debug` for per-step detail.

use tracing::{info, warn, Span};

/// Span that scopes all events of one run.
pub fn run_span(run_id: &str, model_id: &str) -> Span {
    tracing::info_span!("ravel.run", run_id = %run_id, model = %model_id)
}

pub fn emit_run_started(run_id: &str, model_id: &str, max_steps: usize) {
    info!(event = "run.started", run_id = %run_id, model = %model_id, max_steps = max_steps);
}

pub fn emit_run_finished(run_id: &str, state: &str, steps: usize, duration_ms: u64) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        state = %state,
        steps = steps,
        duration_ms = duration_ms,
    );
}

pub fn emit_planning(run_id: &str, step_number: usize, plan_chars: usize) {
    info!(event = "step.planned", run_id = %run_id, step = step_number, plan_chars = plan_chars);
}

pub fn emit_step_completed(
    run_id: &str,
    step_number: usize,
    tool_calls: usize,
    duration_ms: u64,
    error: Option<&str>,
) {
    match error {
        Some(error) => warn!(
            event = "step.completed",
            run_id = %run_id,
            step = step_number,
            tool_calls = tool_calls,
            duration_ms = duration_ms,
            error = %error,
        ),
        None => info!(
            event = "step.completed",
            run_id = %run_id,
            step = step_number,
            tool_calls = tool_calls,
            duration_ms = duration_ms,
        ),
    }
}

pub fn emit_divergence(run_id: &str, step_number: usize, level: &str, off_topic: u32) {
    warn!(
        event = "divergence.detected",
        run_id = %run_id,
        step = step_number,
        level = %level,
        off_topic = off_topic,
    );
}

pub fn emit_evaluation(run_id: &str, step_number: usize, status: &str, confidence: Option<f32>) {
    info!(
        event = "evaluation.completed",
        run_id = %run_id,
        step = step_number,
        status = %status,
        confidence = ?confidence,
    );
}

pub fn emit_reflection_recorded(run_id: &str, step_number: usize, outcome: &str) {
    info!(event = "reflection.recorded", run_id = %run_id, step = step_number, outcome = %outcome);
}

pub fn emit_refinement_completed(run_id: &str, step_number: usize, iterations: u32, improved: bool) {
    info!(
        event = "refinement.completed",
        run_id = %run_id,
        step = step_number,
        iterations = iterations,
        improved = improved,
    );
}

/// A recoverable failure in an advisory sub-call (planning, evaluation, refinement).
pub fn emit_phase_failed(run_id: &str, phase: &str, error: &dyn std::fmt::Display) {
    warn!(event = "phase.failed", run_id = %run_id, phase = %phase, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emitters_do_not_panic_without_subscriber() {
        let span = run_span("run-1", "scripted");
        let _guard = span.enter();
        emit_run_started("run-1", "scripted", 3);
        emit_step_completed("run-1", 1, 2, 10, Some("tool x failed"));
        emit_evaluation("run-1", 1, "continue", None);
        emit_run_finished("run-1", "success", 1, 12);
    }
}
