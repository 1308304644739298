//! Parameter generation.
//!
//! A [`ParamStrategy`] produces one [`ParameterBinding`] per trial, either by
//! calling a caller-supplied generator per named parameter (`Randomized`) or
//! by indexing a precomputed cartesian product (`FixedSet`).
//!
//! Bindings own their values outright, so `clone()` is a deep copy: the
//! candidate's copy shares no mutable state with the reference's.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Fault, GenerationError, SpecError};
use crate::value::Value;

/// Ordered mapping of parameter name to value, in declaration order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterBinding {
    entries: Vec<(String, Value)>,
}

impl ParameterBinding {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a parameter, keeping its original position on replace.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.entries
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// JSON object form used on the external process wire.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.entries
                .iter()
                .map(|(n, v)| (n.clone(), v.to_json()))
                .collect(),
        )
    }

    /// Parse a JSON object. Returns `None` for any other JSON shape.
    pub fn from_json(json: serde_json::Value) -> Option<Self> {
        match json {
            serde_json::Value::Object(fields) => Some(Self {
                entries: fields
                    .into_iter()
                    .map(|(n, v)| (n, Value::from_json(v)))
                    .collect(),
            }),
            _ => None,
        }
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for ParameterBinding {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut binding = ParameterBinding::new();
        for (k, v) in iter {
            binding.insert(k, v);
        }
        binding
    }
}

/// Zero-argument value generator, invoked once per parameter per trial.
pub type ValueGenerator = Arc<dyn Fn() -> Result<Value, Fault> + Send + Sync>;

/// A generator, or the reason it could not be built.
///
/// Builder methods accept either, so an invalid stock generator is rejected
/// when the unit is declared instead of when a trial draws from it.
pub trait IntoGenerator {
    fn into_generator(self) -> Result<ValueGenerator, SpecError>;
}

impl IntoGenerator for ValueGenerator {
    fn into_generator(self) -> Result<ValueGenerator, SpecError> {
        Ok(self)
    }
}

impl IntoGenerator for Result<ValueGenerator, SpecError> {
    fn into_generator(self) -> Result<ValueGenerator, SpecError> {
        self
    }
}

/// Wrap a closure as a [`ValueGenerator`].
pub fn generator<F>(f: F) -> ValueGenerator
where
    F: Fn() -> Result<Value, Fault> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Call every generator once, independently, in declaration order.
pub fn generate_binding(
    generators: &[(String, ValueGenerator)],
) -> Result<ParameterBinding, GenerationError> {
    let mut binding = ParameterBinding::new();
    for (name, generate) in generators {
        let value = generate().map_err(|fault| GenerationError {
            parameter: name.clone(),
            message: fault.message,
        })?;
        binding.insert(name.clone(), value);
    }
    Ok(binding)
}

/// How a unit obtains the parameters for each trial.
#[derive(Clone)]
pub enum ParamStrategy {
    Randomized {
        trials: usize,
        generators: Vec<(String, ValueGenerator)>,
    },
    FixedSet {
        combinations: Vec<ParameterBinding>,
    },
}

impl ParamStrategy {
    /// Randomized strategy. `trials` must be at least 1.
    pub fn randomized(
        trials: usize,
        generators: Vec<(String, ValueGenerator)>,
    ) -> Result<Self, SpecError> {
        if trials == 0 {
            return Err(SpecError::InvalidSpec {
                reason: "trial count must be greater than 0".to_string(),
            });
        }
        Ok(ParamStrategy::Randomized { trials, generators })
    }

    /// Fixed cartesian-product strategy over per-parameter value domains.
    ///
    /// The last declared parameter varies fastest. An empty domain is an
    /// [`SpecError::EmptyDomain`]; a product with a single combination is
    /// rejected as well, since a fixed set is meant to enumerate cases.
    pub fn fixed_set(domains: Vec<(String, Vec<Value>)>) -> Result<Self, SpecError> {
        if let Some((name, _)) = domains.iter().find(|(_, values)| values.is_empty()) {
            return Err(SpecError::EmptyDomain {
                parameter: name.clone(),
            });
        }

        let mut combinations = vec![ParameterBinding::new()];
        for (name, values) in &domains {
            combinations = combinations
                .iter()
                .flat_map(|partial| {
                    values
                        .iter()
                        .map(move |value| partial.clone().with(name.clone(), value.clone()))
                })
                .collect();
        }

        if combinations.len() < 2 {
            return Err(SpecError::InvalidSpec {
                reason: format!(
                    "fixed parameter set must enumerate at least 2 combinations, got {}",
                    combinations.len()
                ),
            });
        }
        Ok(ParamStrategy::FixedSet { combinations })
    }

    /// Number of trials this strategy yields.
    pub fn trial_count(&self) -> usize {
        match self {
            ParamStrategy::Randomized { trials, .. } => *trials,
            ParamStrategy::FixedSet { combinations } => combinations.len(),
        }
    }

    /// Produce the binding for trial `trial_index`.
    pub fn generate(&self, trial_index: usize) -> Result<ParameterBinding, GenerationError> {
        match self {
            ParamStrategy::Randomized { generators, .. } => generate_binding(generators),
            ParamStrategy::FixedSet { combinations } => combinations
                .get(trial_index)
                .cloned()
                .ok_or_else(|| GenerationError {
                    parameter: "<fixed set>".to_string(),
                    message: format!(
                        "trial {trial_index} is past the {} fixed combinations",
                        combinations.len()
                    ),
                }),
        }
    }
}

impl fmt::Debug for ParamStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamStrategy::Randomized { trials, generators } => f
                .debug_struct("Randomized")
                .field("trials", trials)
                .field(
                    "parameters",
                    &generators.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
                )
                .finish(),
            ParamStrategy::FixedSet { combinations } => f
                .debug_struct("FixedSet")
                .field("combinations", &combinations.len())
                .finish(),
        }
    }
}

/// Ready-made generators backed by `rand`.
///
/// Each generator owns its own RNG, so parameters never share random state.
pub mod generators {
    use std::ops::RangeInclusive;
    use std::sync::{Arc, Mutex};

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::ValueGenerator;
    use crate::error::{Fault, SpecError};
    use crate::value::Value;

    fn invalid(reason: String) -> SpecError {
        SpecError::InvalidSpec { reason }
    }

    fn check_int_range(what: &str, range: &RangeInclusive<i64>) -> Result<(), SpecError> {
        if range.is_empty() {
            return Err(invalid(format!("{what} range {range:?} is empty")));
        }
        Ok(())
    }

    fn with_rng<F>(f: F) -> ValueGenerator
    where
        F: Fn(&mut StdRng) -> Value + Send + Sync + 'static,
    {
        let rng = Mutex::new(StdRng::from_rng(&mut rand::rng()));
        Arc::new(move || {
            let mut guard = rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            Ok(f(&mut *guard))
        })
    }

    /// Always yields a clone of `value`.
    pub fn constant(value: impl Into<Value>) -> ValueGenerator {
        let value = value.into();
        Arc::new(move || Ok(value.clone()))
    }

    /// Uniform integer in `range`.
    pub fn int_range(range: RangeInclusive<i64>) -> Result<ValueGenerator, SpecError> {
        check_int_range("integer", &range)?;
        Ok(with_rng(move |rng| Value::Int(rng.random_range(range.clone()))))
    }

    /// Uniform float in `range`. Both bounds must be finite.
    pub fn float_range(range: RangeInclusive<f64>) -> Result<ValueGenerator, SpecError> {
        if range.is_empty() || !range.start().is_finite() || !range.end().is_finite() {
            return Err(invalid(format!("float range {range:?} is empty or unbounded")));
        }
        Ok(with_rng(move |rng| Value::Float(rng.random_range(range.clone()))))
    }

    /// `true` with probability `p`.
    pub fn boolean(p: f64) -> Result<ValueGenerator, SpecError> {
        if !(0.0..=1.0).contains(&p) {
            return Err(invalid(format!("probability {p} is outside [0, 1]")));
        }
        Ok(with_rng(move |rng| Value::Bool(rng.random_bool(p))))
    }

    /// List of uniform integers with a uniformly drawn length.
    pub fn int_list(
        len: RangeInclusive<usize>,
        values: RangeInclusive<i64>,
    ) -> Result<ValueGenerator, SpecError> {
        if len.is_empty() {
            return Err(invalid(format!("list length range {len:?} is empty")));
        }
        check_int_range("element", &values)?;
        Ok(with_rng(move |rng| {
            let n = rng.random_range(len.clone());
            Value::List(
                (0..n)
                    .map(|_| Value::Int(rng.random_range(values.clone())))
                    .collect(),
            )
        }))
    }

    /// One of `choices`, uniformly.
    pub fn choice(choices: Vec<Value>) -> Result<ValueGenerator, SpecError> {
        if choices.is_empty() {
            return Err(invalid("no choices to pick from".to_string()));
        }
        let rng = Mutex::new(StdRng::from_rng(&mut rand::rng()));
        Ok(Arc::new(move || {
            let mut guard = rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let idx = guard.random_range(0..choices.len());
            choices
                .get(idx)
                .cloned()
                .ok_or_else(|| Fault::new("choice index out of range"))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    #[test]
    fn test_fixed_set_enumerates_cartesian_product() {
        let strategy = ParamStrategy::fixed_set(vec![
            ("x".to_string(), vec![Value::Int(1), Value::Int(2)]),
            ("y".to_string(), vec![Value::Int(3), Value::Int(4)]),
        ])
        .unwrap();

        assert_eq!(strategy.trial_count(), 4);
        let seen: Vec<(i64, i64)> = (0..4)
            .map(|i| {
                let b = strategy.generate(i).unwrap();
                (
                    b.get("x").and_then(Value::as_i64).unwrap(),
                    b.get("y").and_then(Value::as_i64).unwrap(),
                )
            })
            .collect();
        assert_eq!(seen, vec![(1, 3), (1, 4), (2, 3), (2, 4)]);
    }

    #[test]
    fn test_fixed_set_empty_domain_is_rejected() {
        let err = ParamStrategy::fixed_set(vec![("x".to_string(), vec![])]).unwrap_err();
        assert_eq!(
            err,
            SpecError::EmptyDomain {
                parameter: "x".to_string()
            }
        );
    }

    #[test]
    fn test_fixed_set_single_combination_is_rejected() {
        let err = ParamStrategy::fixed_set(vec![("x".to_string(), vec![Value::Int(1)])]);
        assert!(matches!(err, Err(SpecError::InvalidSpec { .. })));
    }

    #[test]
    fn test_randomized_rejects_zero_trials() {
        assert!(ParamStrategy::randomized(0, vec![]).is_err());
    }

    #[test]
    fn test_randomized_calls_each_generator_every_trial() {
        let counter = Arc::new(AtomicI64::new(0));
        let c = counter.clone();
        let strategy = ParamStrategy::randomized(
            3,
            vec![
                (
                    "n".to_string(),
                    generator(move || Ok(Value::Int(c.fetch_add(1, Ordering::Relaxed)))),
                ),
                ("k".to_string(), generators::constant(7i64)),
            ],
        )
        .unwrap();

        for expected in 0..3 {
            let binding = strategy.generate(expected as usize).unwrap();
            assert_eq!(binding.get("n"), Some(&Value::Int(expected)));
            assert_eq!(binding.get("k"), Some(&Value::Int(7)));
        }
    }

    #[test]
    fn test_generator_failure_names_parameter() {
        let strategy = ParamStrategy::randomized(
            1,
            vec![("bad".to_string(), generator(|| Err(Fault::new("nope"))))],
        )
        .unwrap();
        let err = strategy.generate(0).unwrap_err();
        assert_eq!(err.parameter, "bad");
        assert_eq!(err.message, "nope");
    }

    #[test]
    fn test_binding_clone_is_isolated() {
        let original = ParameterBinding::new().with("xs", Value::list([1i64, 2, 3]));
        let mut copy = original.clone();
        if let Some(Value::List(items)) = copy.get_mut("xs") {
            items.push(Value::Int(4));
        }
        assert_eq!(original.get("xs"), Some(&Value::list([1i64, 2, 3])));
        assert_eq!(copy.get("xs"), Some(&Value::list([1i64, 2, 3, 4])));
    }

    #[test]
    fn test_binding_insert_replaces_in_place() {
        let mut b = ParameterBinding::new().with("a", 1i64).with("b", 2i64);
        b.insert("a", 9i64);
        assert_eq!(b.names().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(b.get("a"), Some(&Value::Int(9)));
    }

    #[test]
    fn test_gen_ranges_stay_in_bounds() {
        let ints = generators::int_range(-3..=3).unwrap();
        let lists = generators::int_list(0..=4, 0..=9).unwrap();
        for _ in 0..100 {
            let v = ints().unwrap().as_i64().unwrap();
            assert!((-3..=3).contains(&v));
            match lists().unwrap() {
                Value::List(items) => assert!(items.len() <= 4),
                other => panic!("expected list, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_gen_choice_empty_fails() {
        assert!(generators::choice(vec![]).is_err());
        let pick = generators::choice(vec![Value::Int(4)]).unwrap();
        assert_eq!(pick().unwrap(), Value::Int(4));
    }

    #[test]
    fn test_gen_invalid_arguments_rejected_up_front() {
        let (lo, hi) = (5, 1);
        assert!(generators::int_range(lo..=hi).is_err());
        let (long, short): (usize, usize) = (3, 2);
        assert!(generators::int_list(long..=short, 0..=9).is_err());
        assert!(generators::float_range(0.0..=f64::INFINITY).is_err());
        assert!(generators::boolean(f64::NAN).is_err());
        assert!(generators::boolean(1.5).is_err());

        let coin = generators::boolean(1.0).unwrap();
        assert_eq!(coin().unwrap(), Value::Bool(true));
    }
}
