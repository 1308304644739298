//! End-to-end trial sequencing: scoring, patience, isolation, instance windows and deadlines.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use grader_core::catalog::RunningTotal;
use grader_core::score::aggregate;
use grader_core::sequencer::TrialStatus;
use grader_core::{
    generators, ComparisonError, Fault, FunctionSpec, Registry, TerminalState, TrialExecutor,
    TrialSequencer, UnitInstance, Value,
};

fn executor() -> TrialExecutor {
    TrialExecutor::new(Duration::from_secs(5))
}

fn squarer(wrong_on: &'static [i64], raise_on: &'static [i64]) -> Registry {
    let mut registry = Registry::new();
    registry.register_fn("square", move |params, _| {
        let n = params.get("n").and_then(Value::as_i64).unwrap_or(0);
        if raise_on.contains(&n) {
            return Err(Fault::new(format!("cannot square {n}")));
        }
        let out = if wrong_on.contains(&n) { n * n + 1 } else { n * n };
        Ok(Value::Int(out))
    });
    registry
}

fn square_spec() -> FunctionSpec {
    FunctionSpec::fixed("square")
        .domain("n", 0i64..10)
        .build()
        .unwrap()
}

#[tokio::test]
async fn seven_of_ten_scores_point_seven() {
    let spec = square_spec();
    let reference = squarer(&[], &[]);
    let candidate = squarer(&[2, 5, 8], &[]);
    let exec = executor();

    let run = TrialSequencer::new(
        &spec,
        reference.get("square").unwrap(),
        candidate.get("square").unwrap(),
        &exec,
    )
    .run()
    .await
    .unwrap();

    let score = aggregate("square", spec.trial_count(), &run.records, run.terminal, false);
    assert_eq!(score.terminal, TerminalState::Completed);
    assert_eq!((score.passed, score.attempted), (7, 10));
    assert!((score.score - 0.7).abs() < 1e-12);
    assert_eq!(score.failed_trials, vec![2, 5, 8]);
}

#[tokio::test]
async fn abort_keeps_partial_score_over_attempted_trials() {
    let spec = square_spec();
    let reference = squarer(&[], &[]);
    let candidate = squarer(&[], &[1, 4]);
    let exec = executor();

    let run = TrialSequencer::new(
        &spec,
        reference.get("square").unwrap(),
        candidate.get("square").unwrap(),
        &exec,
    )
    .with_patience(2)
    .run()
    .await
    .unwrap();

    assert_eq!(run.terminal, TerminalState::AbortedOnExceptionPatience);
    let score = aggregate("square", spec.trial_count(), &run.records, run.terminal, false);
    assert_eq!((score.passed, score.attempted, score.requested), (3, 5, 10));
    assert!((score.score - 0.6).abs() < 1e-12);
    assert!(matches!(run.records[4].status, TrialStatus::CandidateFault(_)));
}

#[tokio::test]
async fn raising_candidate_aborts_after_five_failures() {
    let spec = FunctionSpec::randomized("square", 40)
        .param("n", generators::int_range(0..=100))
        .build()
        .unwrap();
    let reference = squarer(&[], &[]);
    let mut candidate = Registry::new();
    candidate.register_fn("square", |_, _| Err(Fault::new("boom")));
    let exec = executor();

    let run = TrialSequencer::new(
        &spec,
        reference.get("square").unwrap(),
        candidate.get("square").unwrap(),
        &exec,
    )
    .run()
    .await
    .unwrap();

    assert_eq!(run.records.len(), 5);
    assert_eq!(run.terminal, TerminalState::AbortedOnExceptionPatience);
}

#[tokio::test]
async fn in_place_mutations_stay_on_their_own_side() {
    fn appender(marker: i64) -> Registry {
        let mut registry = Registry::new();
        registry.register_fn("append", move |params, _| {
            if let Some(Value::List(items)) = params.get_mut("L") {
                items.push(Value::Int(marker));
            }
            Ok(Value::Null)
        });
        registry
    }

    let spec = FunctionSpec::fixed("append")
        .domain("L", [Value::list([1i64, 2]), Value::list([3i64])])
        .equality(|ctx| {
            let last = |binding: &grader_core::ParameterBinding| match binding.get("L") {
                Some(Value::List(items)) => items.last().cloned(),
                _ => None,
            };
            Ok(last(ctx.reference_params) == Some(Value::Int(1))
                && last(ctx.candidate_params) == Some(Value::Int(2)))
        })
        .build()
        .unwrap();
    let reference = appender(1);
    let candidate = appender(2);
    let exec = executor();

    let run = TrialSequencer::new(
        &spec,
        reference.get("append").unwrap(),
        candidate.get("append").unwrap(),
        &exec,
    )
    .run()
    .await
    .unwrap();

    assert!(run.records.iter().all(|r| r.status.passed()));
    assert_eq!(run.records[0].params.get("L"), Some(&Value::list([1i64, 2])));
    assert_eq!(run.records[1].params.get("L"), Some(&Value::list([3i64])));
}

#[tokio::test]
async fn class_units_rebuild_instances_per_window() {
    let built = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&built);

    let mut reference = Registry::new();
    reference.register_method("add", |params| {
        let start = params.get("start").and_then(Value::as_i64).unwrap_or(0);
        Ok(Box::new(RunningTotal::new(start)) as Box<dyn UnitInstance>)
    });
    let mut candidate = Registry::new();
    candidate.register_method("add", move |params| {
        counter.fetch_add(1, Ordering::SeqCst);
        let start = params.get("start").and_then(Value::as_i64).unwrap_or(0);
        Ok(Box::new(RunningTotal::new(start)) as Box<dyn UnitInstance>)
    });

    let spec = FunctionSpec::randomized("add", 12)
        .class(5)
        .constructor_param("start", generators::int_range(0..=3))
        .param("x", generators::int_range(1..=9))
        .build()
        .unwrap();
    let exec = executor();

    let run = TrialSequencer::new(
        &spec,
        reference.get("add").unwrap(),
        candidate.get("add").unwrap(),
        &exec,
    )
    .run()
    .await
    .unwrap();

    assert_eq!(run.records.len(), 12);
    assert!(run.records.iter().all(|r| r.status.passed()));
    assert_eq!(built.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn failed_construction_retries_on_next_trial() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);

    let mut reference = Registry::new();
    reference.register_method("add", |_| {
        Ok(Box::new(RunningTotal::new(0)) as Box<dyn UnitInstance>)
    });
    let mut candidate = Registry::new();
    candidate.register_method("add", move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(Fault::new("constructor exploded"))
        } else {
            Ok(Box::new(RunningTotal::new(0)) as Box<dyn UnitInstance>)
        }
    });

    let spec = FunctionSpec::randomized("add", 4)
        .class(10)
        .param("x", generators::int_range(1..=9))
        .build()
        .unwrap();
    let exec = executor();

    let run = TrialSequencer::new(
        &spec,
        reference.get("add").unwrap(),
        candidate.get("add").unwrap(),
        &exec,
    )
    .run()
    .await
    .unwrap();

    assert!(matches!(run.records[0].status, TrialStatus::ConstructionFailed(_)));
    assert!(run.records[1..].iter().all(|r| r.status.passed()));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn slow_candidate_is_timed_out() {
    let spec = FunctionSpec::fixed("square")
        .domain("n", [1i64, 2])
        .build()
        .unwrap();
    let reference = squarer(&[], &[]);
    let mut candidate = Registry::new();
    candidate.register_fn("square", |_, cancel| {
        while !cancel.is_cancelled() {
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(Value::Int(0))
    });
    let exec = TrialExecutor::new(Duration::from_millis(100));

    let run = TrialSequencer::new(
        &spec,
        reference.get("square").unwrap(),
        candidate.get("square").unwrap(),
        &exec,
    )
    .run()
    .await
    .unwrap();

    assert_eq!(run.records.len(), 2);
    assert!(run
        .records
        .iter()
        .all(|r| matches!(r.status, TrialStatus::CandidateTimeout { .. })));
    assert!(run
        .feedback
        .contains("Your code took too long to run so it was timed out and stopped."));
}

#[tokio::test]
async fn uncomparable_outputs_consume_patience_until_abort() {
    let spec = FunctionSpec::fixed("widget")
        .domain("n", 0i64..10)
        .build()
        .unwrap();
    let mut registry = Registry::new();
    registry.register_fn("widget", |_, _| Ok(Value::opaque("Widget", "<Widget>")));
    let exec = executor();

    let run = TrialSequencer::new(
        &spec,
        registry.get("widget").unwrap(),
        registry.get("widget").unwrap(),
        &exec,
    )
    .run()
    .await
    .unwrap();

    assert_eq!(run.terminal, TerminalState::AbortedOnExceptionPatience);
    assert_eq!(run.records.len(), 5);
    assert!(run.records.iter().all(|r| matches!(
        &r.status,
        TrialStatus::ComparisonError(ComparisonError::UncomparableType { type_name }) if type_name == "Widget"
    )));
    assert!(run.feedback.contains(
        "### Got exception cannot grade values of type Widget when grading widget when trying to compare outputs."
    ));
    assert!(run
        .feedback
        .contains("# Stopping grading function early due to repeated exceptions."));

    let score = aggregate("widget", spec.trial_count(), &run.records, run.terminal, false);
    assert_eq!((score.passed, score.attempted), (0, 5));
}

#[tokio::test]
async fn panicking_equality_predicate_fails_trials() {
    let spec = FunctionSpec::fixed("square")
        .domain("n", 0i64..10)
        .equality(|_| panic!("predicate bug"))
        .build()
        .unwrap();
    let reference = squarer(&[], &[]);
    let exec = executor();

    let run = TrialSequencer::new(
        &spec,
        reference.get("square").unwrap(),
        reference.get("square").unwrap(),
        &exec,
    )
    .run()
    .await
    .unwrap();

    assert_eq!(run.terminal, TerminalState::AbortedOnExceptionPatience);
    assert_eq!(run.records.len(), 5);
    assert!(run
        .records
        .iter()
        .all(|r| matches!(r.status, TrialStatus::ComparisonError(ComparisonError::Predicate { .. }))));
    assert!(run
        .feedback
        .contains("### Got exception equality predicate failed: equality predicate panicked when grading square when trying to compare outputs."));
}
