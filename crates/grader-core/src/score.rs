//! Score aggregation and submission reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sequencer::TrialRecord;

/// How a unit's trial sequence ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    Completed,
    AbortedOnExceptionPatience,
}

/// Per-unit result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub unit: String,
    pub passed: usize,
    /// Trials actually attempted; the score denominator.
    pub attempted: usize,
    /// Trials the unit declared.
    pub requested: usize,
    /// `passed / attempted`, in `[0, 1]`.
    pub score: f64,
    /// Zero-based indices of failed trials.
    pub failed_trials: Vec<usize>,
    pub terminal: TerminalState,
    pub extra_credit: bool,
}

/// Reduce trial records into a [`ScoreRecord`].
pub fn aggregate(
    unit: &str,
    requested: usize,
    records: &[TrialRecord],
    terminal: TerminalState,
    extra_credit: bool,
) -> ScoreRecord {
    let attempted = records.len();
    let passed = records.iter().filter(|r| r.status.passed()).count();
    let failed_trials = records
        .iter()
        .filter(|r| !r.status.passed())
        .map(|r| r.index)
        .collect();
    let score = if attempted == 0 {
        0.0
    } else {
        passed as f64 / attempted as f64
    };
    ScoreRecord {
        unit: unit.to_string(),
        passed,
        attempted,
        requested,
        score,
        failed_trials,
        terminal,
        extra_credit,
    }
}

/// Decides which failed trials get a detailed write-up.
///
/// The run is cut into windows of `ceil(trials / 3)` trials; the first
/// failure in each window is detailed.
#[derive(Debug, Clone)]
pub struct FailureSampler {
    every: usize,
    armed: bool,
}

impl FailureSampler {
    pub fn new(trials: usize) -> Self {
        Self {
            every: trials.div_ceil(3).max(1),
            armed: true,
        }
    }

    pub fn window(&self) -> usize {
        self.every
    }

    /// Call at the start of every trial.
    pub fn begin_trial(&mut self, trial_index: usize) {
        if trial_index % self.every == 0 {
            self.armed = true;
        }
    }

    /// Whether the current failure should be detailed. Disarms until the next window.
    pub fn take(&mut self) -> bool {
        std::mem::replace(&mut self.armed, false)
    }
}

// ---------------------------------------------------------------------------
// Submission level
// ---------------------------------------------------------------------------

/// Result of one unit for one submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UnitOutcome {
    Scored(ScoreRecord),
    /// The candidate does not define the unit.
    Missing { unit: String, extra_credit: bool },
    /// The harness is broken for this unit; it does not count toward the grade.
    HarnessDefect { unit: String, reason: String },
}

impl UnitOutcome {
    pub fn unit(&self) -> &str {
        match self {
            UnitOutcome::Scored(record) => &record.unit,
            UnitOutcome::Missing { unit, .. } | UnitOutcome::HarnessDefect { unit, .. } => unit,
        }
    }

    /// Score in `[0, 1]`; `None` for harness defects.
    pub fn score(&self) -> Option<f64> {
        match self {
            UnitOutcome::Scored(record) => Some(record.score),
            UnitOutcome::Missing { .. } => Some(0.0),
            UnitOutcome::HarnessDefect { .. } => None,
        }
    }

    pub fn is_extra_credit(&self) -> bool {
        match self {
            UnitOutcome::Scored(record) => record.extra_credit,
            UnitOutcome::Missing { extra_credit, .. } => *extra_credit,
            UnitOutcome::HarnessDefect { .. } => false,
        }
    }
}

/// `sum(scores) / (graded units - extra-credit units) * max_grade`.
///
/// Harness defects are excluded from both sums.
pub fn final_grade(units: &[UnitOutcome], max_grade: f64) -> f64 {
    let graded: Vec<&UnitOutcome> = units.iter().filter(|u| u.score().is_some()).collect();
    let extra = graded.iter().filter(|u| u.is_extra_credit()).count();
    let denominator = graded.len().saturating_sub(extra);
    if denominator == 0 {
        return 0.0;
    }
    let total: f64 = graded.iter().filter_map(|u| u.score()).sum();
    total / denominator as f64 * max_grade
}

/// Everything graded for one submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionReport {
    pub run_id: Uuid,
    pub submission_id: String,
    pub graded_at: DateTime<Utc>,
    pub units: Vec<UnitOutcome>,
    pub final_grade: f64,
    pub max_grade: f64,
}

impl SubmissionReport {
    pub fn new(run_id: Uuid, submission_id: impl Into<String>, units: Vec<UnitOutcome>, max_grade: f64) -> Self {
        let final_grade = final_grade(&units, max_grade);
        Self {
            run_id,
            submission_id: submission_id.into(),
            graded_at: Utc::now(),
            units,
            final_grade,
            max_grade,
        }
    }

    pub fn harness_defects(&self) -> impl Iterator<Item = &UnitOutcome> {
        self.units
            .iter()
            .filter(|u| matches!(u, UnitOutcome::HarnessDefect { .. }))
    }

    /// Closing feedback lines: per-unit score table and the final grade.
    pub fn summary_lines(&self) -> Vec<String> {
        let scores = self
            .units
            .iter()
            .map(|u| match u.score() {
                Some(score) => format!("'{}': {}", u.unit(), score),
                None => format!("'{}': harness defect", u.unit()),
            })
            .collect::<Vec<_>>()
            .join(", ");
        vec![
            String::new(),
            " ** Summary of all problem scores = ".to_string(),
            String::new(),
            format!(" \t{{{scores}}}"),
            String::new(),
            format!("Final grade = {:.2}/{}", self.final_grade, self.max_grade),
        ]
    }
}

// ---------------------------------------------------------------------------
// TA fixed test cases
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaCaseScore {
    pub points: f64,
    pub max_points: f64,
    pub passed: usize,
    pub total: usize,
    /// One-based numbers of failed cases.
    pub failed_cases: Vec<usize>,
}

impl TaCaseScore {
    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "=> TA Test Cases: {:.2}/{}, passed {} out of {} test cases.",
            self.points, self.max_points, self.passed, self.total
        )];
        if !self.failed_cases.is_empty() {
            lines.push(format!(
                "Failed Test Cases: {:?}. Ask the course staff for the inputs of these case numbers.",
                self.failed_cases
            ));
        }
        lines
    }
}

/// Points split equally across fixed pass/fail cases. No cases scores 0.
pub fn score_ta_cases(results: &[bool], max_points: f64) -> TaCaseScore {
    let failed_cases: Vec<usize> = results
        .iter()
        .enumerate()
        .filter(|(_, passed)| !**passed)
        .map(|(i, _)| i + 1)
        .collect();
    let passed = results.len() - failed_cases.len();
    let points = if results.is_empty() {
        0.0
    } else {
        max_points / results.len() as f64 * passed as f64
    };
    TaCaseScore {
        points,
        max_points,
        passed,
        total: results.len(),
        failed_cases,
    }
}
