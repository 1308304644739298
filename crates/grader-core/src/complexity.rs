//! Empirical complexity classification.
//!
//! Timing samples are fitted against a family of growth models by ordinary
//! least squares on `t = a + b·g(n)`. The exponential model is fitted in log
//! space (`ln t = a + b·n`) and scored by its residual in time space. The
//! model with the smallest residual wins; ties keep the earlier model.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ComplexityError;
use crate::executor::{Outcome, TrialExecutor};
use crate::params::ParameterBinding;
use crate::registry::EntryPoint;
use crate::value::Value;

/// Coefficients closer than this count as the same model.
pub const COEFFICIENT_TOLERANCE: f64 = 0.01;

/// Minimum ratio between the largest and smallest sampled size.
pub const MIN_SIZE_SPAN: usize = 10;

/// Growth-rate model families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComplexityModel {
    Constant,
    Logarithmic,
    Linear,
    Linearithmic,
    Quadratic,
    Cubic,
    Exponential,
}

/// Model family used when the caller supplies none.
pub const DEFAULT_MODELS: [ComplexityModel; 4] = [
    ComplexityModel::Constant,
    ComplexityModel::Linear,
    ComplexityModel::Quadratic,
    ComplexityModel::Exponential,
];

impl ComplexityModel {
    pub fn name(self) -> &'static str {
        match self {
            ComplexityModel::Constant => "Constant",
            ComplexityModel::Logarithmic => "Logarithmic",
            ComplexityModel::Linear => "Linear",
            ComplexityModel::Linearithmic => "Linearithmic",
            ComplexityModel::Quadratic => "Quadratic",
            ComplexityModel::Cubic => "Cubic",
            ComplexityModel::Exponential => "Exponential",
        }
    }

    fn basis(self, n: f64) -> f64 {
        match self {
            ComplexityModel::Constant => 0.0,
            ComplexityModel::Logarithmic => n.ln(),
            ComplexityModel::Linear | ComplexityModel::Exponential => n,
            ComplexityModel::Linearithmic => n * n.ln(),
            ComplexityModel::Quadratic => n * n,
            ComplexityModel::Cubic => n * n * n,
        }
    }
}

impl fmt::Display for ComplexityModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One `(input size, duration)` measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComplexitySample {
    pub size: usize,
    /// Wall-clock seconds.
    pub seconds: f64,
}

impl ComplexitySample {
    pub fn new(size: usize, duration: Duration) -> Self {
        Self {
            size,
            seconds: duration.as_secs_f64(),
        }
    }
}

/// Least-squares fit of one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelFit {
    pub model: ComplexityModel,
    pub intercept: f64,
    /// Scale coefficient. For [`ComplexityModel::Constant`] this is the fitted level.
    pub coefficient: f64,
    /// Sum of squared residuals in time space. Infinite when the fit overflows.
    pub residual: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub best: ComplexityModel,
    pub fits: Vec<ModelFit>,
}

impl Classification {
    pub fn fit_for(&self, model: ComplexityModel) -> Option<&ModelFit> {
        self.fits.iter().find(|fit| fit.model == model)
    }
}

/// Check the sample invariants: enough points, strictly increasing positive
/// sizes, non-negative durations, and at least one order of magnitude of span.
pub fn validate_samples(samples: &[ComplexitySample]) -> Result<(), ComplexityError> {
    if samples.len() < 2 {
        return Err(ComplexityError::TooFewSamples {
            required: 2,
            actual: samples.len(),
        });
    }
    for (index, pair) in samples.windows(2).enumerate() {
        if pair[1].size <= pair[0].size {
            return Err(ComplexityError::NonIncreasingSizes {
                index: index + 1,
                size: pair[1].size,
            });
        }
    }
    if let Some(bad) = samples.iter().find(|s| !(s.seconds >= 0.0)) {
        return Err(ComplexityError::NegativeDuration { size: bad.size });
    }
    let min = samples[0].size;
    let max = samples[samples.len() - 1].size;
    if min == 0 || max < min.saturating_mul(MIN_SIZE_SPAN) {
        return Err(ComplexityError::InsufficientSpan { min, max });
    }
    Ok(())
}

fn least_squares(xs: &[f64], ys: &[f64]) -> Option<(f64, f64)> {
    let n = xs.len() as f64;
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;
    let sxx: f64 = xs.iter().map(|x| (x - mean_x).powi(2)).sum();
    if sxx == 0.0 || !sxx.is_finite() {
        return None;
    }
    let sxy: f64 = xs
        .iter()
        .zip(ys)
        .map(|(x, y)| (x - mean_x) * (y - mean_y))
        .sum();
    let slope = sxy / sxx;
    Some((mean_y - slope * mean_x, slope))
}

fn predict(model: ComplexityModel, intercept: f64, coefficient: f64, n: f64) -> f64 {
    match model {
        ComplexityModel::Constant => intercept,
        ComplexityModel::Exponential => (intercept + coefficient * n).exp(),
        _ => intercept + coefficient * model.basis(n),
    }
}

/// Fit one model to already-validated samples.
pub fn fit(model: ComplexityModel, samples: &[ComplexitySample]) -> Result<ModelFit, ComplexityError> {
    let sizes: Vec<f64> = samples.iter().map(|s| s.size as f64).collect();
    let times: Vec<f64> = samples.iter().map(|s| s.seconds).collect();

    let (intercept, coefficient) = match model {
        ComplexityModel::Constant => {
            let level = times.iter().sum::<f64>() / times.len() as f64;
            (level, level)
        }
        ComplexityModel::Exponential => {
            let logs: Vec<f64> = times.iter().map(|t| t.max(1e-12).ln()).collect();
            least_squares(&sizes, &logs).ok_or_else(|| ComplexityError::Fit {
                model: model.to_string(),
                reason: "degenerate sizes".to_string(),
            })?
        }
        _ => {
            let xs: Vec<f64> = sizes.iter().map(|&n| model.basis(n)).collect();
            least_squares(&xs, &times).ok_or_else(|| ComplexityError::Fit {
                model: model.to_string(),
                reason: "degenerate basis values".to_string(),
            })?
        }
    };

    let residual: f64 = sizes
        .iter()
        .zip(&times)
        .map(|(&n, &t)| (t - predict(model, intercept, coefficient, n)).powi(2))
        .sum();
    let residual = if residual.is_finite() { residual } else { f64::INFINITY };

    Ok(ModelFit {
        model,
        intercept,
        coefficient,
        residual,
    })
}

/// Fit every model and pick the one with the smallest residual.
pub fn classify(
    samples: &[ComplexitySample],
    models: &[ComplexityModel],
) -> Result<Classification, ComplexityError> {
    validate_samples(samples)?;
    if models.is_empty() {
        return Err(ComplexityError::NoModels);
    }

    let fits = models
        .iter()
        .map(|&model| fit(model, samples))
        .collect::<Result<Vec<_>, _>>()?;

    let mut best = &fits[0];
    for candidate in &fits[1..] {
        if candidate.residual < best.residual {
            best = candidate;
        }
    }

    Ok(Classification {
        best: best.model,
        fits,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Credit {
    Full,
    Half,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeGrade {
    pub expected: ComplexityModel,
    pub measured: ComplexityModel,
    /// Whether the measured model was accepted as the expected one.
    pub lenient: bool,
    pub credit: Credit,
    pub points: f64,
    pub max_points: f64,
}

impl TimeGrade {
    pub fn summary(&self) -> String {
        let measured = if self.lenient { self.expected } else { self.measured };
        format!(
            "=> Automatic Time Analysis = {}/{}pts [Expected='{}', Measured='{}']",
            self.points, self.max_points, self.expected, measured
        )
    }
}

/// Award full or half credit against an expected model.
///
/// A different best model is still accepted when its fitted coefficient is
/// within [`COEFFICIENT_TOLERANCE`] of the expected model's coefficient.
pub fn grade_time_complexity(
    classification: &Classification,
    expected: ComplexityModel,
    max_points: f64,
) -> TimeGrade {
    let measured = classification.best;
    let lenient = measured != expected
        && match (
            classification.fit_for(measured),
            classification.fit_for(expected),
        ) {
            (Some(best), Some(wanted)) => {
                (best.coefficient - wanted.coefficient).abs() < COEFFICIENT_TOLERANCE
            }
            _ => false,
        };
    let credit = if measured == expected || lenient {
        Credit::Full
    } else {
        Credit::Half
    };
    TimeGrade {
        expected,
        measured,
        lenient,
        credit,
        points: match credit {
            Credit::Full => max_points,
            Credit::Half => max_points / 2.0,
        },
        max_points,
    }
}

// ---------------------------------------------------------------------------
// Timing harness
// ---------------------------------------------------------------------------

/// Sizes and models for one timing run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingPlan {
    pub min_n: usize,
    pub max_n: usize,
    pub n_measures: usize,
    pub models: Vec<ComplexityModel>,
}

impl Default for TimingPlan {
    fn default() -> Self {
        Self {
            min_n: 10,
            max_n: 2500,
            n_measures: 10,
            models: DEFAULT_MODELS.to_vec(),
        }
    }
}

impl TimingPlan {
    /// `n_measures` evenly spaced integer sizes from `min_n` to `max_n`,
    /// truncated and deduplicated.
    pub fn sizes(&self) -> Vec<usize> {
        let mut sizes = match self.n_measures {
            0 => Vec::new(),
            1 => vec![self.min_n],
            k => {
                let span = self.max_n.saturating_sub(self.min_n) as f64;
                (0..k)
                    .map(|i| self.min_n + (span * i as f64 / (k - 1) as f64) as usize)
                    .collect()
            }
        };
        sizes.dedup();
        sizes
    }
}

/// Call `entry` once per planned size and collect timing samples.
///
/// `make_input` builds the parameter binding for a size. A candidate failure
/// at any size aborts the measurement.
pub async fn measure<F>(
    executor: &TrialExecutor,
    entry: &EntryPoint,
    name: &str,
    plan: &TimingPlan,
    mut make_input: F,
) -> Result<Vec<ComplexitySample>, ComplexityError>
where
    F: FnMut(usize) -> ParameterBinding,
{
    let mut samples = Vec::with_capacity(plan.n_measures);
    for size in plan.sizes() {
        let result = executor.execute(entry, name, None, make_input(size)).await;
        match result.outcome {
            Outcome::Returned { duration, .. } => samples.push(ComplexitySample::new(size, duration)),
            Outcome::TimedOut { limit } => {
                return Err(ComplexityError::Execution {
                    size,
                    reason: format!("timed out after {:.3}s", limit.as_secs_f64()),
                })
            }
            Outcome::Raised(fault) => {
                return Err(ComplexityError::Execution {
                    size,
                    reason: fault.message,
                })
            }
        }
    }
    Ok(samples)
}

/// Measure, classify and grade in one step.
pub async fn auto_grade_time<F>(
    executor: &TrialExecutor,
    entry: &EntryPoint,
    name: &str,
    plan: &TimingPlan,
    expected: ComplexityModel,
    max_points: f64,
    make_input: F,
) -> Result<TimeGrade, ComplexityError>
where
    F: FnMut(usize) -> ParameterBinding,
{
    let samples = measure(executor, entry, name, plan, make_input).await?;
    let classification = classify(&samples, &plan.models)?;
    tracing::debug!(
        unit = name,
        best = %classification.best,
        samples = samples.len(),
        "complexity classified"
    );
    Ok(grade_time_complexity(&classification, expected, max_points))
}

// ---------------------------------------------------------------------------
// Declared space usage
// ---------------------------------------------------------------------------

/// Container counts reported for one call.
///
/// `local_containers` is what the unit declares it holds at return, inputs
/// included. Equal counts mean no auxiliary container was allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceObservation {
    pub input_containers: usize,
    pub local_containers: usize,
}

impl SpaceObservation {
    pub fn new(params: &ParameterBinding, local_containers: usize) -> Self {
        Self {
            input_containers: count_containers(params),
            local_containers,
        }
    }

    pub fn is_constant_space(&self) -> bool {
        self.local_containers == self.input_containers
    }
}

/// Number of container-valued parameters.
pub fn count_containers(params: &ParameterBinding) -> usize {
    params.iter().filter(|(_, value)| value.is_container()).count()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceGrade {
    pub observation: SpaceObservation,
    pub points: f64,
    pub max_points: f64,
}

impl SpaceGrade {
    pub fn summary(&self) -> String {
        let obs = &self.observation;
        let verdict = if obs.is_constant_space() {
            "Constant Space"
        } else {
            "NOT Constant Space"
        };
        format!(
            "=> Automatic Space Analysis = {}/{}pts, {} [{} lists in the input, {} lists in the function]",
            self.points, self.max_points, verdict, obs.input_containers, obs.local_containers
        )
    }
}

/// Full points for constant space, half otherwise.
pub fn grade_space(observation: SpaceObservation, max_points: f64) -> SpaceGrade {
    let points = if observation.is_constant_space() {
        max_points
    } else {
        max_points / 2.0
    };
    SpaceGrade {
        observation,
        points,
        max_points,
    }
}

/// Run a space probe and grade its declared container count.
///
/// The probe receives `params` and returns the number of containers it holds
/// at return as an integer.
pub async fn auto_grade_space(
    executor: &TrialExecutor,
    probe: &EntryPoint,
    name: &str,
    params: ParameterBinding,
    max_points: f64,
) -> Result<SpaceGrade, ComplexityError> {
    let inputs = count_containers(&params);
    let result = executor.execute(probe, name, None, params).await;
    let declared = match result.outcome {
        Outcome::Returned { value, .. } => match value {
            Value::Int(n) if n >= 0 => n as usize,
            other => {
                return Err(ComplexityError::Execution {
                    size: 0,
                    reason: format!("space probe returned {other}, expected a container count"),
                })
            }
        },
        Outcome::TimedOut { .. } => {
            return Err(ComplexityError::Execution {
                size: 0,
                reason: "space probe timed out".to_string(),
            })
        }
        Outcome::Raised(fault) => {
            return Err(ComplexityError::Execution {
                size: 0,
                reason: fault.message,
            })
        }
    };
    Ok(grade_space(
        SpaceObservation {
            input_containers: inputs,
            local_containers: declared,
        },
        max_points,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(f: impl Fn(f64) -> f64) -> Vec<ComplexitySample> {
        [10usize, 100, 1000, 10_000]
            .iter()
            .map(|&n| ComplexitySample {
                size: n,
                seconds: f(n as f64),
            })
            .collect()
    }

    #[test]
    fn test_linear_profile_classifies_linear() {
        let data = samples(|n| 1e-6 * n + 1e-4);
        let c = classify(&data, &DEFAULT_MODELS).unwrap();
        assert_eq!(c.best, ComplexityModel::Linear);
    }

    #[test]
    fn test_quadratic_profile_classifies_quadratic() {
        let data = samples(|n| 1e-9 * n * n);
        let c = classify(&data, &DEFAULT_MODELS).unwrap();
        assert_eq!(c.best, ComplexityModel::Quadratic);
    }

    #[test]
    fn test_constant_profile_classifies_constant() {
        let data = samples(|_| 0.0078125);
        let c = classify(&data, &DEFAULT_MODELS).unwrap();
        assert_eq!(c.best, ComplexityModel::Constant);
    }

    #[test]
    fn test_half_credit_when_coefficients_differ() {
        let data = samples(|n| 0.5 * n);
        let c = classify(&data, &DEFAULT_MODELS).unwrap();
        assert_eq!(c.best, ComplexityModel::Linear);
        let grade = grade_time_complexity(&c, ComplexityModel::Quadratic, 10.0);
        assert_eq!(grade.credit, Credit::Half);
        assert_eq!(grade.points, 5.0);
        assert!(grade.summary().contains("Measured='Linear'"));
    }

    #[test]
    fn test_lenient_full_credit_for_tiny_coefficients() {
        let data = samples(|n| 1e-7 * n);
        let c = classify(&data, &DEFAULT_MODELS).unwrap();
        assert_eq!(c.best, ComplexityModel::Linear);
        let grade = grade_time_complexity(&c, ComplexityModel::Quadratic, 10.0);
        assert!(grade.lenient);
        assert_eq!(grade.credit, Credit::Full);
        assert_eq!(grade.points, 10.0);
    }

    #[test]
    fn test_exact_match_is_full_credit() {
        let data = samples(|n| 1e-6 * n);
        let c = classify(&data, &DEFAULT_MODELS).unwrap();
        let grade = grade_time_complexity(&c, ComplexityModel::Linear, 4.0);
        assert_eq!(grade.credit, Credit::Full);
        assert!(!grade.lenient);
    }

    #[test]
    fn test_validation_errors() {
        let one = vec![ComplexitySample { size: 10, seconds: 0.1 }];
        assert!(matches!(
            classify(&one, &DEFAULT_MODELS),
            Err(ComplexityError::TooFewSamples { .. })
        ));

        let unordered = vec![
            ComplexitySample { size: 100, seconds: 0.1 },
            ComplexitySample { size: 10, seconds: 0.1 },
        ];
        assert!(matches!(
            validate_samples(&unordered),
            Err(ComplexityError::NonIncreasingSizes { index: 1, size: 10 })
        ));

        let negative = vec![
            ComplexitySample { size: 10, seconds: 0.1 },
            ComplexitySample { size: 100, seconds: -0.1 },
        ];
        assert!(matches!(
            validate_samples(&negative),
            Err(ComplexityError::NegativeDuration { size: 100 })
        ));

        let narrow = vec![
            ComplexitySample { size: 10, seconds: 0.1 },
            ComplexitySample { size: 50, seconds: 0.2 },
        ];
        assert!(matches!(
            validate_samples(&narrow),
            Err(ComplexityError::InsufficientSpan { min: 10, max: 50 })
        ));
    }

    #[test]
    fn test_no_models() {
        let data = samples(|n| n);
        assert_eq!(classify(&data, &[]), Err(ComplexityError::NoModels));
    }

    #[test]
    fn test_default_plan_sizes() {
        let sizes = TimingPlan::default().sizes();
        assert_eq!(sizes.len(), 10);
        assert_eq!(sizes[0], 10);
        assert_eq!(sizes[9], 2500);
        assert!(sizes.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_grade_space() {
        let params = ParameterBinding::new()
            .with("L", Value::list([1i64, 2]))
            .with("k", 3i64);
        let constant = grade_space(SpaceObservation::new(&params, 1), 6.0);
        assert_eq!(constant.points, 6.0);
        assert!(constant.summary().contains("Constant Space"));

        let extra = grade_space(SpaceObservation::new(&params, 3), 6.0);
        assert_eq!(extra.points, 3.0);
        assert!(extra.summary().contains("NOT Constant Space"));
    }
}
