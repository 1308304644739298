//! Built-in reference exercise: list basics.
//!
//! Used by the `grader` binary and by integration tests. Each unit is a small
//! list problem; `running_total` is class-style and `count_evens` is extra
//! credit.

use crate::complexity::ComplexityModel;
use crate::error::Fault;
use crate::executor::CancelToken;
use crate::params::{generators, ParameterBinding};
use crate::registry::{Registry, UnitInstance};
use crate::spec::{Declaration, FunctionSpec, GradingPlan};
use crate::value::Value;

pub const NAME: &str = "list_basics";

fn list_param<'a>(params: &'a ParameterBinding, name: &str) -> Result<&'a [Value], Fault> {
    match params.get(name) {
        Some(Value::List(items)) => Ok(items),
        Some(other) => Err(Fault::new(format!(
            "{name} must be a list, got {}",
            other.type_name()
        ))),
        None => Err(Fault::new(format!("missing argument '{name}'"))),
    }
}

fn int_param(params: &ParameterBinding, name: &str) -> Result<i64, Fault> {
    params
        .get(name)
        .and_then(Value::as_i64)
        .ok_or_else(|| Fault::new(format!("argument '{name}' must be an int")))
}

/// Running sum with a configurable start. `add(x)` returns the new total.
#[derive(Debug, Clone, PartialEq)]
pub struct RunningTotal {
    total: i64,
}

impl RunningTotal {
    pub fn new(start: i64) -> Self {
        Self { total: start }
    }
}

impl UnitInstance for RunningTotal {
    fn call(
        &mut self,
        _method: &str,
        params: &mut ParameterBinding,
        _cancel: &CancelToken,
    ) -> Result<Value, Fault> {
        self.total += int_param(params, "x")?;
        Ok(Value::Int(self.total))
    }

    fn snapshot(&self) -> Value {
        Value::map([("total", self.total)])
    }
}

/// The reference implementation.
pub fn reference() -> Registry {
    let mut registry = Registry::new();
    registry
        .register_fn("are_lists_ints", |_, _| Ok(Value::Bool(true)))
        .register_fn("has_items", |params, _| {
            Ok(Value::Bool(!list_param(params, "L")?.is_empty()))
        })
        .register_fn("has_k", |params, _| {
            let k = int_param(params, "k")?;
            let found = list_param(params, "L")?
                .iter()
                .any(|item| item.as_i64() == Some(k));
            Ok(Value::Bool(found))
        })
        .register_fn("generate_list_with_million_items", |_, _| {
            Ok(Value::List((0..1_000_000i64).map(Value::Int).collect()))
        })
        .register_fn("count_evens", |params, _| {
            let evens = list_param(params, "L")?
                .iter()
                .filter(|item| item.as_i64().is_some_and(|n| n % 2 == 0))
                .count();
            Ok(Value::from(evens))
        })
        .register_method("running_total", |params| {
            let start = int_param(params, "start")?;
            Ok(Box::new(RunningTotal::new(start)) as Box<dyn UnitInstance>)
        });
    registry
}

/// How each unit is graded.
pub fn declarations() -> Vec<Declaration> {
    vec![
        FunctionSpec::randomized("are_lists_ints", 1).into(),
        FunctionSpec::randomized("has_items", 50)
            .param("L", generators::int_list(0..=10, -50..=50))
            .into(),
        FunctionSpec::fixed("has_k")
            .domain(
                "L",
                [
                    Value::list(Vec::<i64>::new()),
                    Value::list([1i64, 2, 3]),
                    Value::list([5i64, 5, 7, 9]),
                ],
            )
            .domain("k", [1i64, 5, 9])
            .into(),
        Declaration::NotGraded("generate_list_with_million_items".to_string()),
        FunctionSpec::randomized("running_total", 20)
            .class(5)
            .constructor_param("start", generators::int_range(-10..=10))
            .param("x", generators::int_range(0..=9))
            .into(),
        FunctionSpec::randomized("count_evens", 30)
            .param("L", generators::int_list(0..=15, 0..=100))
            .extra_credit()
            .into(),
    ]
}

pub fn plan() -> GradingPlan {
    GradingPlan::new(reference(), declarations())
}

/// A unit with a known growth rate, and how to build an input of size `n`.
#[derive(Debug, Clone, Copy)]
pub struct TimingCase {
    pub unit: &'static str,
    pub expected: ComplexityModel,
    pub make_input: fn(usize) -> ParameterBinding,
}

fn scan_input(n: usize) -> ParameterBinding {
    ParameterBinding::new()
        .with("L", Value::List((0..n as i64).map(Value::Int).collect()))
        .with("k", -1i64)
}

fn items_input(n: usize) -> ParameterBinding {
    ParameterBinding::new().with("L", Value::List((0..n as i64).map(Value::Int).collect()))
}

pub fn timing_cases() -> Vec<TimingCase> {
    vec![
        TimingCase {
            unit: "has_k",
            expected: ComplexityModel::Linear,
            make_input: scan_input,
        },
        TimingCase {
            unit: "has_items",
            expected: ComplexityModel::Constant,
            make_input: items_input,
        },
    ]
}
