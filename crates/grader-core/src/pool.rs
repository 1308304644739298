//! Submission-level grading and the worker pool.
//!
//! Units of one submission are graded in plan order, so its feedback trail is
//! the same whatever the pool size. Submissions are independent and run
//! concurrently, bounded by a semaphore; reports come back in input order.

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, Instrument};
use uuid::Uuid;

use crate::config::GradingConfig;
use crate::error::{GraderError, Result};
use crate::executor::TrialExecutor;
use crate::feedback::{self, FeedbackLog, FeedbackSink};
use crate::metrics::METRICS;
use crate::obs;
use crate::registry::Registry;
use crate::score::{aggregate, SubmissionReport, UnitOutcome};
use crate::sequencer::TrialSequencer;
use crate::spec::{GradingPlan, PlanEntry};
use crate::worker::WorkerLauncher;

/// One candidate implementation to grade.
#[derive(Debug, Clone)]
pub struct Submission {
    pub id: String,
    pub implementation: Arc<Registry>,
}

impl Submission {
    pub fn new(id: impl Into<String>, implementation: Registry) -> Self {
        Self {
            id: id.into(),
            implementation: Arc::new(implementation),
        }
    }
}

/// Grades submissions against one plan. Cheap to clone.
#[derive(Clone)]
pub struct Grader {
    plan: Arc<GradingPlan>,
    config: GradingConfig,
    sink: Arc<dyn FeedbackSink>,
    run_id: Uuid,
    worker: Option<WorkerLauncher>,
}

impl Grader {
    pub fn new(plan: GradingPlan, config: GradingConfig, sink: Arc<dyn FeedbackSink>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            plan: Arc::new(plan),
            config,
            sink,
            run_id: Uuid::new_v4(),
            worker: None,
        })
    }

    /// Host native candidate code in trial worker processes started by `launcher`.
    pub fn with_worker(mut self, launcher: WorkerLauncher) -> Self {
        self.worker = Some(launcher);
        self
    }

    /// Executor for one submission's candidate calls.
    pub fn executor_for(&self, submission: &Submission) -> TrialExecutor {
        let executor = TrialExecutor::new(self.config.timeout());
        match &self.worker {
            Some(launcher) => executor.hosted(launcher.clone(), submission.id.clone()),
            None => executor,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn plan(&self) -> &GradingPlan {
        &self.plan
    }

    pub fn config(&self) -> &GradingConfig {
        &self.config
    }

    /// Grade one unit, appending its trail to `log`.
    ///
    /// Harness defects are folded into the outcome rather than returned, so a
    /// broken unit never stops the rest of the submission.
    pub async fn grade_unit(
        &self,
        entry: &PlanEntry,
        candidate: &Registry,
        executor: &TrialExecutor,
        log: &mut FeedbackLog,
    ) -> UnitOutcome {
        log.push(feedback::unit_header(entry.name()));

        let spec = match entry {
            PlanEntry::Defective { name, reason } => {
                log.push(feedback::harness_defect_line(name, reason));
                obs::emit_harness_defect(name, reason);
                return UnitOutcome::HarnessDefect {
                    unit: name.clone(),
                    reason: reason.clone(),
                };
            }
            PlanEntry::Ready(spec) => spec,
        };
        let name = spec.name();

        let Some(candidate_entry) = candidate.get(name) else {
            log.push(feedback::missing_unit_line(name));
            return UnitOutcome::Missing {
                unit: name.to_string(),
                extra_credit: spec.is_extra_credit(),
            };
        };
        let Some(reference_entry) = self.plan.reference().get(name) else {
            let err = GraderError::MissingReferenceEntry {
                unit: name.to_string(),
            };
            log.push(feedback::harness_defect_line(name, &err.to_string()));
            obs::emit_harness_defect(name, &err);
            return UnitOutcome::HarnessDefect {
                unit: name.to_string(),
                reason: err.to_string(),
            };
        };

        obs::emit_unit_started(name, spec.trial_count());
        let run = TrialSequencer::new(spec, reference_entry, candidate_entry, executor)
            .with_patience(self.config.exception_patience)
            .with_failure_details(self.config.log_failed_details)
            .run()
            .await;

        match run {
            Ok(run) => {
                log.extend(run.feedback.into_lines());
                let score = aggregate(
                    name,
                    spec.trial_count(),
                    &run.records,
                    run.terminal,
                    spec.is_extra_credit(),
                );
                log.push(feedback::passed_line(score.passed, score.attempted));
                log.push(feedback::grade_line(name, score.score));
                obs::emit_unit_finished(name, score.passed, score.attempted, score.score);
                UnitOutcome::Scored(score)
            }
            Err(err) => {
                log.push(feedback::harness_defect_line(name, &err.to_string()));
                obs::emit_harness_defect(name, &err);
                UnitOutcome::HarnessDefect {
                    unit: name.to_string(),
                    reason: err.to_string(),
                }
            }
        }
    }

    /// Grade every planned unit for one submission and flush its trail.
    pub async fn grade_submission(&self, submission: &Submission) -> Result<SubmissionReport> {
        let started = Instant::now();
        let mut outcomes = Vec::with_capacity(self.plan.len());
        let executor = self.executor_for(submission);

        for entry in self.plan.entries() {
            let mut log = FeedbackLog::new();
            let outcome = self
                .grade_unit(entry, &submission.implementation, &executor, &mut log)
                .await;
            self.sink.write(&submission.id, log.lines()).await?;
            outcomes.push(outcome);
        }

        let report = SubmissionReport::new(
            self.run_id,
            submission.id.clone(),
            outcomes,
            self.config.max_grade,
        );
        self.sink
            .write(&submission.id, &report.summary_lines())
            .await?;
        obs::emit_submission_finished(
            &submission.id,
            report.final_grade,
            started.elapsed().as_millis() as u64,
        );
        Ok(report)
    }

    /// Grade all submissions with at most `config.workers` in flight.
    pub async fn grade_all(&self, submissions: Vec<Submission>) -> Result<Vec<SubmissionReport>> {
        let run_id = self.run_id.to_string();
        obs::emit_grading_started(&run_id, submissions.len(), self.plan.len(), self.config.workers);

        let reports = if self.config.workers <= 1 {
            let mut reports = Vec::with_capacity(submissions.len());
            for submission in &submissions {
                let span = obs::submission_span(&run_id, &submission.id);
                reports.push(self.grade_submission(submission).instrument(span).await?);
            }
            reports
        } else {
            self.grade_parallel(&run_id, submissions).await?
        };

        METRICS.flush();
        Ok(reports)
    }

    async fn grade_parallel(&self, run_id: &str, submissions: Vec<Submission>) -> Result<Vec<SubmissionReport>> {
        let sem = Arc::new(Semaphore::new(self.config.workers));
        let mut tasks = Vec::with_capacity(submissions.len());

        for submission in submissions {
            let grader = self.clone();
            let sem = Arc::clone(&sem);
            let span = obs::submission_span(run_id, &submission.id);

            let task = tokio::spawn(
                async move {
                    let _permit = sem
                        .acquire_owned()
                        .await
                        .map_err(|e| GraderError::Join(e.to_string()))?;
                    debug!(submission = %submission.id, "worker acquired");
                    grader.grade_submission(&submission).await
                }
                .instrument(span),
            );
            tasks.push(task);
        }

        join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.map_err(|e| GraderError::Join(e.to_string()))?)
            .collect()
    }
}

impl std::fmt::Debug for Grader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Grader")
            .field("run_id", &self.run_id)
            .field("units", &self.plan.len())
            .field("config", &self.config)
            .field("worker", &self.worker)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Fault;
    use crate::feedback::MemorySink;
    use crate::spec::{Declaration, FunctionSpec};
    use crate::value::Value;

    fn negate_registry(correct: bool) -> Registry {
        let mut registry = Registry::new();
        registry.register_fn("negate", move |params, _| {
            let n = params.get("n").and_then(Value::as_i64).unwrap_or(0);
            Ok(Value::Int(if correct { -n } else { n }))
        });
        registry
    }

    fn plan() -> GradingPlan {
        GradingPlan::new(
            negate_registry(true),
            vec![
                FunctionSpec::fixed("negate").domain("n", [1i64, 2, 3, 4]).into(),
                Declaration::NotGraded("helper".to_string()),
            ],
        )
    }

    #[tokio::test]
    async fn test_grade_submission_writes_trail_and_report() {
        let sink = Arc::new(MemorySink::new());
        let grader = Grader::new(plan(), GradingConfig::default(), sink.clone()).unwrap();

        let report = grader
            .grade_submission(&Submission::new("alice", negate_registry(true)))
            .await
            .unwrap();
        assert_eq!(report.final_grade, 100.0);
        assert_eq!(report.run_id, grader.run_id());

        let trail = sink.trail("alice").await;
        assert!(trail[0].contains("Grading fn=\"negate\""));
        assert!(trail.iter().any(|l| l == "###>>> Passed 4/4 test cases"));
        assert!(trail.last().unwrap().starts_with("Final grade = 100.00/"));
    }

    #[tokio::test]
    async fn test_missing_unit_scores_zero() {
        let sink = Arc::new(MemorySink::new());
        let grader = Grader::new(plan(), GradingConfig::default(), sink.clone()).unwrap();

        let report = grader
            .grade_submission(&Submission::new("bob", Registry::new()))
            .await
            .unwrap();
        assert!(matches!(report.units[0], UnitOutcome::Missing { .. }));
        assert_eq!(report.final_grade, 0.0);
        assert!(sink
            .trail("bob")
            .await
            .iter()
            .any(|l| l.starts_with("Did not find negate in the student code")));
    }

    #[tokio::test]
    async fn test_reference_fault_is_reported_as_harness_defect() {
        let mut reference = Registry::new();
        reference.register_fn("negate", |_, _| Err(Fault::new("broken solution")));
        let plan = GradingPlan::new(
            reference,
            vec![FunctionSpec::fixed("negate").domain("n", [1i64, 2]).into()],
        );
        let grader = Grader::new(plan, GradingConfig::default(), Arc::new(MemorySink::new())).unwrap();

        let report = grader
            .grade_submission(&Submission::new("carol", negate_registry(true)))
            .await
            .unwrap();
        assert_eq!(report.harness_defects().count(), 1);
        assert_eq!(report.final_grade, 0.0);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = GradingConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(Grader::new(plan(), config, Arc::new(MemorySink::new())).is_err());
    }
}
