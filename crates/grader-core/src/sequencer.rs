//! The trial state machine.
//!
//! ```text
//! Init → (ConstructInstances)? → GenerateParams → RunBoth → Compare → Record
//!                                                                      │
//!            ┌─────────────────────────────────────────────────────────┤
//!            ▼                                                         ▼
//!   next trial (ConstructInstances | GenerateParams)           Done | Aborted
//! ```
//!
//! Any state may short-circuit to `Record` with a failed status: a generator
//! failure, a candidate construction failure, a candidate fault or timeout.
//! Candidate failures and comparison errors consume exception patience; when
//! it reaches zero the unit is `Aborted`. Reference faults are returned as
//! [`GraderError::ReferenceFault`] immediately.

use std::time::Duration;

use tracing::{debug, trace};

use crate::compare::{judge, EqualityContext, Verdict};
use crate::error::{ComparisonError, Fault, GenerationError, GraderError, Result};
use crate::executor::{LiveInstance, Outcome, TrialExecutor};
use crate::feedback::{self, FailureDetail, FeedbackLog};
use crate::metrics::METRICS;
use crate::obs;
use crate::params::ParameterBinding;
use crate::registry::EntryPoint;
use crate::score::{FailureSampler, TerminalState};
use crate::spec::FunctionSpec;
use crate::value::Value;

/// Candidate failures tolerated per unit by default.
pub const DEFAULT_EXCEPTION_PATIENCE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    Init,
    ConstructInstances,
    GenerateParams,
    RunBoth,
    Compare,
    Record,
    Done,
    Aborted,
}

/// Result of one trial.
#[derive(Debug, Clone, PartialEq)]
pub enum TrialStatus {
    Passed,
    Failed,
    ComparisonError(ComparisonError),
    CandidateFault(Fault),
    CandidateTimeout { limit: Duration },
    /// The candidate constructor raised or timed out.
    ConstructionFailed(Fault),
    GenerationFailed(GenerationError),
}

impl TrialStatus {
    pub fn passed(&self) -> bool {
        matches!(self, TrialStatus::Passed)
    }

    /// Whether this status decrements exception patience.
    pub fn consumes_patience(&self) -> bool {
        matches!(
            self,
            TrialStatus::ComparisonError(_)
                | TrialStatus::CandidateFault(_)
                | TrialStatus::CandidateTimeout { .. }
                | TrialStatus::ConstructionFailed(_)
        )
    }
}

/// One executed trial.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialRecord {
    pub index: usize,
    /// The generated binding, before either side ran. Empty when generation
    /// never happened.
    pub params: ParameterBinding,
    pub reference_output: Option<Value>,
    pub reference_duration: Option<Duration>,
    pub candidate_output: Option<Value>,
    pub candidate_duration: Option<Duration>,
    pub status: TrialStatus,
}

/// Reference and candidate instances shared by one window of trials.
#[derive(Debug)]
pub struct InstanceBinding {
    pub reference: LiveInstance,
    /// Taken out while the candidate call runs.
    pub candidate: Option<LiveInstance>,
    pub opened_at: usize,
}

/// What a finished sequence hands to the aggregator.
#[derive(Debug)]
pub struct UnitRun {
    pub records: Vec<TrialRecord>,
    pub terminal: TerminalState,
    pub feedback: FeedbackLog,
}

#[derive(Debug, Default)]
struct TrialInProgress {
    generated: ParameterBinding,
    reference_params: ParameterBinding,
    candidate_params: ParameterBinding,
    reference: Option<(Value, Duration)>,
    candidate: Option<(Value, Duration)>,
    status: Option<TrialStatus>,
}

/// Drives all trials of one unit for one candidate.
pub struct TrialSequencer<'a> {
    spec: &'a FunctionSpec,
    reference: &'a EntryPoint,
    candidate: &'a EntryPoint,
    executor: &'a TrialExecutor,
    log_failed_details: bool,

    state: SequencerState,
    trial: usize,
    patience: usize,
    window: Option<InstanceBinding>,
    sampler: FailureSampler,
    current: TrialInProgress,
    records: Vec<TrialRecord>,
    feedback: FeedbackLog,
}

impl<'a> TrialSequencer<'a> {
    pub fn new(
        spec: &'a FunctionSpec,
        reference: &'a EntryPoint,
        candidate: &'a EntryPoint,
        executor: &'a TrialExecutor,
    ) -> Self {
        Self {
            spec,
            reference,
            candidate,
            executor,
            log_failed_details: true,
            state: SequencerState::Init,
            trial: 0,
            patience: DEFAULT_EXCEPTION_PATIENCE,
            window: None,
            sampler: FailureSampler::new(spec.trial_count()),
            current: TrialInProgress::default(),
            records: Vec::with_capacity(spec.trial_count()),
            feedback: FeedbackLog::new(),
        }
    }

    /// Failures tolerated before aborting. Zero is treated as one.
    pub fn with_patience(mut self, patience: usize) -> Self {
        self.patience = patience.max(1);
        self
    }

    pub fn with_failure_details(mut self, enabled: bool) -> Self {
        self.log_failed_details = enabled;
        self
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    /// Run every state until `Done` or `Aborted`.
    pub async fn run(mut self) -> Result<UnitRun> {
        loop {
            let next = match self.state {
                SequencerState::Init => self.start_trial(),
                SequencerState::ConstructInstances => self.construct_instances().await?,
                SequencerState::GenerateParams => self.generate_params(),
                SequencerState::RunBoth => self.run_both().await?,
                SequencerState::Compare => self.compare(),
                SequencerState::Record => self.record(),
                SequencerState::Done | SequencerState::Aborted => break,
            };
            trace!(unit = self.spec.name(), trial = self.trial, from = ?self.state, to = ?next, "transition");
            self.state = next;
        }

        let terminal = match self.state {
            SequencerState::Aborted => TerminalState::AbortedOnExceptionPatience,
            _ => TerminalState::Completed,
        };
        Ok(UnitRun {
            records: self.records,
            terminal,
            feedback: self.feedback,
        })
    }

    fn reference_fault(&self, fault: Fault) -> GraderError {
        GraderError::ReferenceFault {
            unit: self.spec.name().to_string(),
            trial: self.trial,
            message: fault.message,
        }
    }

    fn fail_trial(&mut self, status: TrialStatus) -> SequencerState {
        self.current.status = Some(status);
        SequencerState::Record
    }

    fn start_trial(&mut self) -> SequencerState {
        self.current = TrialInProgress::default();
        self.sampler.begin_trial(self.trial);
        match self.spec.class() {
            Some(class) if self.trial % class.trials_per_instance == 0 || self.window.is_none() => {
                SequencerState::ConstructInstances
            }
            _ => SequencerState::GenerateParams,
        }
    }

    async fn construct_instances(&mut self) -> Result<SequencerState> {
        let spec = self.spec;
        let Some(class) = spec.class() else {
            return Ok(SequencerState::GenerateParams);
        };
        let name = spec.name();
        self.window = None;

        let constructor_params = match class.construct_params() {
            Ok(params) => params,
            Err(err) => return Ok(self.fail_trial(TrialStatus::GenerationFailed(err))),
        };

        let reference = self
            .executor
            .construct_trusted(self.reference, name, &constructor_params)
            .await
            .map_err(|fault| self.reference_fault(fault))?;

        // The candidate gets its own deep copy of the constructor arguments.
        let built = self
            .executor
            .construct(self.candidate, name, constructor_params.clone())
            .await;

        let fault = match (built.outcome, built.instance) {
            (Outcome::Returned { .. }, Some(candidate)) => {
                debug!(unit = name, trial = self.trial, "instance window opened");
                self.window = Some(InstanceBinding {
                    reference,
                    candidate: Some(candidate),
                    opened_at: self.trial,
                });
                return Ok(SequencerState::GenerateParams);
            }
            (Outcome::Returned { .. }, None) => Fault::new("constructor produced no instance"),
            (Outcome::TimedOut { limit }, _) => {
                Fault::new(format!("constructor timed out after {}s", limit.as_secs_f64()))
            }
            (Outcome::Raised(fault), _) => fault,
        };

        self.feedback
            .push(feedback::construction_fault_line(name, &fault.message));
        obs::emit_candidate_fault(name, self.trial, "construction", &fault);
        Ok(self.fail_trial(TrialStatus::ConstructionFailed(fault)))
    }

    fn generate_params(&mut self) -> SequencerState {
        match self.spec.strategy().generate(self.trial) {
            Ok(binding) => {
                self.current.candidate_params = binding.clone();
                self.current.reference_params = binding.clone();
                self.current.generated = binding;
                SequencerState::RunBoth
            }
            Err(err) => {
                debug!(unit = self.spec.name(), trial = self.trial, error = %err, "parameter generation failed");
                self.fail_trial(TrialStatus::GenerationFailed(err))
            }
        }
    }

    async fn run_both(&mut self) -> Result<SequencerState> {
        let spec = self.spec;
        let name = spec.name();

        let reference_instance = self.window.as_mut().map(|w| &mut w.reference);
        let reference = self
            .executor
            .execute_trusted(
                self.reference,
                name,
                reference_instance,
                &mut self.current.reference_params,
            )
            .await;
        let (reference_output, reference_duration) =
            reference.map_err(|fault| self.reference_fault(fault))?;
        self.current.reference = Some((reference_output, reference_duration));

        let candidate_instance = self.window.as_mut().and_then(|w| w.candidate.take());
        let shown_params = self.current.candidate_params.clone();
        let params = std::mem::take(&mut self.current.candidate_params);
        let result = self
            .executor
            .execute(self.candidate, name, candidate_instance, params)
            .await;

        let lost_instance = match (self.window.as_mut(), result.instance) {
            (Some(window), Some(instance)) => {
                window.candidate = Some(instance);
                false
            }
            (Some(_), None) => true,
            (None, _) => false,
        };
        if lost_instance {
            debug!(unit = name, trial = self.trial, "candidate instance lost, closing window");
            self.window = None;
        }
        self.current.candidate_params = result.params.unwrap_or_else(|| shown_params.clone());

        match result.outcome {
            Outcome::Returned { value, duration } => {
                self.current.candidate = Some((value, duration));
                Ok(SequencerState::Compare)
            }
            Outcome::TimedOut { limit } => {
                self.feedback
                    .extend(feedback::timeout_lines(reference_duration, limit));
                obs::emit_candidate_fault(name, self.trial, "timeout", &format!("{limit:?}"));
                Ok(self.fail_trial(TrialStatus::CandidateTimeout { limit }))
            }
            Outcome::Raised(fault) => {
                self.feedback
                    .push(feedback::fault_line(name, &shown_params, &fault.message));
                obs::emit_candidate_fault(name, self.trial, "raised", &fault);
                Ok(self.fail_trial(TrialStatus::CandidateFault(fault)))
            }
        }
    }

    fn compare(&mut self) -> SequencerState {
        let spec = self.spec;
        let name = spec.name();
        let (Some((reference_output, _)), Some((candidate_output, _))) =
            (&self.current.reference, &self.current.candidate)
        else {
            return self.fail_trial(TrialStatus::Failed);
        };

        let reference_instance = self.window.as_ref().map(|w| w.reference.snapshot());
        let candidate_instance = self
            .window
            .as_ref()
            .and_then(|w| w.candidate.as_ref())
            .map(LiveInstance::snapshot);

        let ctx = EqualityContext {
            reference_output,
            candidate_output,
            reference_params: &self.current.reference_params,
            candidate_params: &self.current.candidate_params,
            reference_instance: reference_instance.as_ref(),
            candidate_instance: candidate_instance.as_ref(),
        };

        let status = match judge(&ctx, spec.equality()) {
            Verdict::Pass => TrialStatus::Passed,
            Verdict::Fail => {
                if self.log_failed_details && self.sampler.take() {
                    let detail = FailureDetail {
                        unit: name,
                        trial_index: self.trial,
                        custom_equality: spec.has_custom_equality(),
                        reference_output,
                        candidate_output,
                        reference_params: &self.current.reference_params,
                        candidate_params: &self.current.candidate_params,
                        reference_instance: reference_instance.as_ref(),
                        candidate_instance: candidate_instance.as_ref(),
                    };
                    self.feedback.extend(detail.lines());
                }
                TrialStatus::Failed
            }
            Verdict::Error(err) => {
                self.feedback
                    .push(feedback::comparison_error_line(name, &err.to_string()));
                obs::emit_candidate_fault(name, self.trial, "comparison", &err);
                TrialStatus::ComparisonError(err)
            }
        };
        self.current.status = Some(status);
        SequencerState::Record
    }

    fn record(&mut self) -> SequencerState {
        let current = std::mem::take(&mut self.current);
        let status = current.status.unwrap_or(TrialStatus::Failed);

        METRICS.inc_trials_executed();
        match &status {
            TrialStatus::Passed => METRICS.inc_trials_passed(),
            TrialStatus::CandidateFault(_) | TrialStatus::ConstructionFailed(_) => {
                METRICS.inc_candidate_faults()
            }
            TrialStatus::CandidateTimeout { .. } => METRICS.inc_candidate_timeouts(),
            _ => {}
        }

        let consumes_patience = status.consumes_patience();
        let (reference_output, reference_duration) = current.reference.unzip();
        let (candidate_output, candidate_duration) = current.candidate.unzip();
        self.records.push(TrialRecord {
            index: self.trial,
            params: current.generated,
            reference_output,
            reference_duration,
            candidate_output,
            candidate_duration,
            status,
        });
        self.trial += 1;

        if consumes_patience {
            self.patience = self.patience.saturating_sub(1);
            if self.patience == 0 {
                self.feedback.push(feedback::PATIENCE_EXHAUSTED_LINE);
                obs::emit_unit_aborted(self.spec.name(), self.records.len());
                METRICS.inc_units_aborted();
                return SequencerState::Aborted;
            }
            self.feedback
                .push(feedback::remaining_patience_line(self.patience));
        }

        if self.trial >= self.spec.trial_count() {
            SequencerState::Done
        } else {
            self.start_trial()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::generators;
    use crate::registry::Registry;

    fn executor() -> TrialExecutor {
        TrialExecutor::new(Duration::from_secs(5))
    }

    fn doubler() -> Registry {
        let mut registry = Registry::new();
        registry.register_fn("double", |params, _| {
            let n = params.get("n").and_then(Value::as_i64).unwrap_or(0);
            Ok(Value::Int(n * 2))
        });
        registry
    }

    #[tokio::test]
    async fn test_all_pass_completes() {
        let spec = FunctionSpec::fixed("double")
            .domain("n", [1i64, 2, 3])
            .build()
            .unwrap();
        let registry = doubler();
        let entry = registry.get("double").unwrap();
        let exec = executor();

        let run = TrialSequencer::new(&spec, entry, entry, &exec).run().await.unwrap();
        assert_eq!(run.terminal, TerminalState::Completed);
        assert_eq!(run.records.len(), 3);
        assert!(run.records.iter().all(|r| r.status.passed()));
        assert_eq!(run.records[1].params.get("n"), Some(&Value::Int(2)));
    }

    #[tokio::test]
    async fn test_always_raising_candidate_aborts_after_patience() {
        let spec = FunctionSpec::randomized("double", 20)
            .param("n", generators::int_range(0..=9))
            .build()
            .unwrap();
        let reference = doubler();
        let mut candidate = Registry::new();
        candidate.register_fn("double", |_, _| Err(Fault::new("not implemented")));
        let exec = executor();

        let run = TrialSequencer::new(
            &spec,
            reference.get("double").unwrap(),
            candidate.get("double").unwrap(),
            &exec,
        )
        .run()
        .await
        .unwrap();

        assert_eq!(run.terminal, TerminalState::AbortedOnExceptionPatience);
        assert_eq!(run.records.len(), 5);
        assert!(run.feedback.contains("# Remaining Exceptions Allowed = 1"));
        assert!(run.feedback.contains(feedback::PATIENCE_EXHAUSTED_LINE));
        assert!(run.feedback.contains("Got exception [not implemented] when running function double(n: "));
    }

    #[tokio::test]
    async fn test_reference_fault_propagates() {
        let spec = FunctionSpec::fixed("double")
            .domain("n", [1i64, 2])
            .build()
            .unwrap();
        let mut reference = Registry::new();
        reference.register_fn("double", |_, _| Err(Fault::new("reference bug")));
        let candidate = doubler();
        let exec = executor();

        let err = TrialSequencer::new(
            &spec,
            reference.get("double").unwrap(),
            candidate.get("double").unwrap(),
            &exec,
        )
        .run()
        .await
        .unwrap_err();
        assert!(matches!(err, GraderError::ReferenceFault { trial: 0, .. }));
    }

    #[tokio::test]
    async fn test_generation_failure_fails_trial_without_patience() {
        let spec = FunctionSpec::randomized("double", 6)
            .param("n", crate::params::generator(|| Err(Fault::new("rng broke"))))
            .build()
            .unwrap();
        let registry = doubler();
        let entry = registry.get("double").unwrap();
        let exec = executor();

        let run = TrialSequencer::new(&spec, entry, entry, &exec).run().await.unwrap();
        assert_eq!(run.terminal, TerminalState::Completed);
        assert_eq!(run.records.len(), 6);
        assert!(run
            .records
            .iter()
            .all(|r| matches!(r.status, TrialStatus::GenerationFailed(_))));
    }

    #[tokio::test]
    async fn test_failure_details_are_sampled() {
        let spec = FunctionSpec::fixed("double")
            .domain("n", (0..9i64).collect::<Vec<_>>())
            .build()
            .unwrap();
        let reference = doubler();
        let mut candidate = Registry::new();
        candidate.register_fn("double", |_, _| Ok(Value::Int(-1)));
        let exec = executor();

        let run = TrialSequencer::new(
            &spec,
            reference.get("double").unwrap(),
            candidate.get("double").unwrap(),
            &exec,
        )
        .run()
        .await
        .unwrap();

        let headers: Vec<_> = run
            .feedback
            .lines()
            .iter()
            .filter(|l| l.starts_with("Test Case #"))
            .cloned()
            .collect();
        assert_eq!(headers.len(), 3);
        assert!(headers[0].starts_with("Test Case #1 failed"));
        assert!(headers[1].starts_with("Test Case #4 failed"));
        assert!(headers[2].starts_with("Test Case #7 failed"));

        let quiet = TrialSequencer::new(
            &spec,
            reference.get("double").unwrap(),
            candidate.get("double").unwrap(),
            &exec,
        )
        .with_failure_details(false)
        .run()
        .await
        .unwrap();
        assert!(!quiet.feedback.contains("Test Case #"));
    }
}
