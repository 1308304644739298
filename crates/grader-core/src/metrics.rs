//! Process-wide grading counters.
//!
//! Incremented by the sequencer as trials complete. Call [`Metrics::flush`]
//! to emit current values as a single `tracing::info!` event, typically when
//! a grading run ends.
//!
//! # Example
//!
//! ```ignore
//! METRICS.inc_trials_executed();
//! METRICS.flush();
//! // logs: metric=flush trials_executed=1 trials_passed=0 ...
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lock-free trial counters.
pub struct Metrics {
    trials_executed: AtomicU64,
    trials_passed: AtomicU64,
    candidate_faults: AtomicU64,
    candidate_timeouts: AtomicU64,
    units_aborted: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn bump(counter: &AtomicU64, metric: &'static str) {
    counter.fetch_add(1, Ordering::Relaxed);
    tracing::trace!(metric, "counter incremented");
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            trials_executed: AtomicU64::new(0),
            trials_passed: AtomicU64::new(0),
            candidate_faults: AtomicU64::new(0),
            candidate_timeouts: AtomicU64::new(0),
            units_aborted: AtomicU64::new(0),
        }
    }

    /// Count one recorded trial, whatever its status.
    pub fn inc_trials_executed(&self) {
        bump(&self.trials_executed, "trials_executed");
    }

    /// Count one passing trial.
    pub fn inc_trials_passed(&self) {
        bump(&self.trials_passed, "trials_passed");
    }

    /// Count one candidate fault or failed construction.
    pub fn inc_candidate_faults(&self) {
        bump(&self.candidate_faults, "candidate_faults");
    }

    /// Count one candidate call stopped at its deadline.
    pub fn inc_candidate_timeouts(&self) {
        bump(&self.candidate_timeouts, "candidate_timeouts");
    }

    /// Count one unit stopped early on exception patience.
    pub fn inc_units_aborted(&self) {
        bump(&self.units_aborted, "units_aborted");
    }

    /// Read the current trials-executed count.
    pub fn trials_executed(&self) -> u64 {
        self.trials_executed.load(Ordering::Relaxed)
    }

    /// Read the current trials-passed count.
    pub fn trials_passed(&self) -> u64 {
        self.trials_passed.load(Ordering::Relaxed)
    }

    /// Read the current candidate-faults count.
    pub fn candidate_faults(&self) -> u64 {
        self.candidate_faults.load(Ordering::Relaxed)
    }

    /// Read the current candidate-timeouts count.
    pub fn candidate_timeouts(&self) -> u64 {
        self.candidate_timeouts.load(Ordering::Relaxed)
    }

    /// Read the current units-aborted count.
    pub fn units_aborted(&self) -> u64 {
        self.units_aborted.load(Ordering::Relaxed)
    }

    /// Log every counter in a single `info!` event.
    ///
    /// Call at natural boundaries such as the end of a run, not per trial.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            trials_executed = self.trials_executed(),
            trials_passed = self.trials_passed(),
            candidate_faults = self.candidate_faults(),
            candidate_timeouts = self.candidate_timeouts(),
            units_aborted = self.units_aborted(),
        );
    }

    /// Zero all counters (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.trials_executed,
            &self.trials_passed,
            &self.candidate_faults,
            &self.candidate_timeouts,
            &self.units_aborted,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
