//! Timing and space analysis driven through the executor.

use std::time::Duration;

use grader_core::complexity::{measure, Credit};
use grader_core::{
    auto_grade_space, auto_grade_time, catalog, ComplexityError, Fault, ParameterBinding,
    Registry, TimingPlan, TrialExecutor, Value,
};

#[tokio::test]
async fn catalog_timing_cases_never_score_zero() {
    let reference = catalog::reference();
    let exec = TrialExecutor::new(Duration::from_secs(5));
    let plan = TimingPlan {
        max_n: 500,
        n_measures: 5,
        ..TimingPlan::default()
    };

    for case in catalog::timing_cases() {
        let entry = reference.get(case.unit).unwrap();
        let grade = auto_grade_time(&exec, entry, case.unit, &plan, case.expected, 4.0, case.make_input)
            .await
            .unwrap();
        assert_eq!(grade.expected, case.expected);
        match grade.credit {
            Credit::Full => assert_eq!(grade.points, 4.0),
            Credit::Half => assert_eq!(grade.points, 2.0),
        }
    }
}

#[tokio::test]
async fn measure_collects_one_sample_per_size() {
    let reference = catalog::reference();
    let exec = TrialExecutor::new(Duration::from_secs(5));
    let plan = TimingPlan::default();
    let case = catalog::timing_cases()[0];

    let samples = measure(
        &exec,
        reference.get(case.unit).unwrap(),
        case.unit,
        &plan,
        case.make_input,
    )
    .await
    .unwrap();

    let sizes: Vec<usize> = samples.iter().map(|s| s.size).collect();
    assert_eq!(sizes, plan.sizes());
}

#[tokio::test]
async fn failing_candidate_aborts_measurement() {
    let mut registry = Registry::new();
    registry.register_fn("scan", |params, _| {
        let n = params.get("n").and_then(Value::as_i64).unwrap_or(0);
        if n > 100 {
            return Err(Fault::new("too big"));
        }
        Ok(Value::Null)
    });
    let exec = TrialExecutor::new(Duration::from_secs(5));

    let err = measure(
        &exec,
        registry.get("scan").unwrap(),
        "scan",
        &TimingPlan::default(),
        |n| ParameterBinding::new().with("n", n),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, ComplexityError::Execution { reason, .. } if reason == "too big"));
}

#[tokio::test]
async fn space_probe_grades_declared_containers() {
    let mut registry = Registry::new();
    registry
        .register_fn("in_place", |_, _| Ok(Value::Int(1)))
        .register_fn("copies", |_, _| Ok(Value::Int(2)))
        .register_fn("broken", |_, _| Ok(Value::Str("lots".into())));
    let exec = TrialExecutor::new(Duration::from_secs(5));
    let params = || ParameterBinding::new().with("L", Value::list([3i64, 1, 2]));

    let constant = auto_grade_space(&exec, registry.get("in_place").unwrap(), "in_place", params(), 6.0)
        .await
        .unwrap();
    assert_eq!(constant.points, 6.0);
    assert!(constant.observation.is_constant_space());

    let extra = auto_grade_space(&exec, registry.get("copies").unwrap(), "copies", params(), 6.0)
        .await
        .unwrap();
    assert_eq!(extra.points, 3.0);

    assert!(auto_grade_space(&exec, registry.get("broken").unwrap(), "broken", params(), 6.0)
        .await
        .is_err());
}
