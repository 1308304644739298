//! Structured lifecycle events for grading runs.
//!
//! This module provides:
//! - Submission-scoped tracing spans via the [`GradingSpan`] RAII guard
//! - Emission functions for run, unit, trial and submission events
//!
//! Every event carries an `event` field so log pipelines can filter on it.
//! Per-unit events are emitted inside a submission span, which tags them with
//! the run and submission ids. Levels follow `RUST_LOG`; JSON output is
//! selected through [`init_tracing`](crate::telemetry::init_tracing).

use tracing::{info, warn};

/// RAII guard entering a span for one submission of one run.
///
/// # Example
///
/// ```ignore
/// let _span = GradingSpan::enter(&run_id, "alice");
/// // events logged here carry run_id and submission_id = "alice"
/// ```
pub struct GradingSpan {
    _span: tracing::span::EnteredSpan,
}

impl GradingSpan {
    /// Create and enter a span tagged with the run and submission ids.
    pub fn enter(run_id: &str, submission_id: &str) -> Self {
        Self {
            _span: submission_span(run_id, submission_id).entered(),
        }
    }
}

/// Span for a submission, for use with `Instrument` across await points.
///
/// The entered guard is not `Send`, so async code instruments its futures
/// with this span instead of holding a [`GradingSpan`].
pub fn submission_span(run_id: &str, submission_id: &str) -> tracing::Span {
    tracing::info_span!("grader.submission", run_id = %run_id, submission_id = %submission_id)
}

/// Emit event: a grading run started.
///
/// # Example
///
/// ```ignore
/// emit_grading_started("run-1", 12, 5, 4);
/// // logs: event=grading.started run_id=run-1 submissions=12 units=5 workers=4
/// ```
pub fn emit_grading_started(run_id: &str, submissions: usize, units: usize, workers: usize) {
    info!(
        event = "grading.started",
        run_id = %run_id,
        submissions,
        units,
        workers,
    );
}

/// Emit event: a unit's trials are about to run.
pub fn emit_unit_started(unit: &str, trials: usize) {
    info!(event = "unit.started", unit = %unit, trials);
}

/// Emit event: a unit finished with its pass count and score in `[0, 1]`.
pub fn emit_unit_finished(unit: &str, passed: usize, attempted: usize, score: f64) {
    info!(event = "unit.finished", unit = %unit, passed, attempted, score);
}

/// Emit event: one trial failed on the candidate side (warning level).
///
/// `kind` is one of `raised`, `timeout`, `construction` and `comparison`.
pub fn emit_candidate_fault(unit: &str, trial: usize, kind: &str, detail: &dyn std::fmt::Display) {
    warn!(event = "trial.candidate_fault", unit = %unit, trial, kind = %kind, detail = %detail);
}

/// Emit event: exception patience ran out (warning level).
pub fn emit_unit_aborted(unit: &str, attempted: usize) {
    warn!(event = "unit.aborted", unit = %unit, attempted);
}

/// Emit event: a unit could not be graded because of the harness (warning level).
pub fn emit_harness_defect(unit: &str, error: &dyn std::fmt::Display) {
    warn!(event = "unit.harness_defect", unit = %unit, error = %error);
}

/// Emit event: a submission's report is complete.
pub fn emit_submission_finished(submission_id: &str, final_grade: f64, duration_ms: u64) {
    info!(
        event = "submission.finished",
        submission_id = %submission_id,
        final_grade,
        duration_ms,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_and_events_do_not_panic() {
        let _span = GradingSpan::enter("run-1", "alice");
        emit_unit_started("has_k", 4);
        emit_candidate_fault("has_k", 0, "timeout", &"10s");
        emit_unit_finished("has_k", 3, 4, 0.75);
    }
}
