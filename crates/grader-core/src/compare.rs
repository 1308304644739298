//! Output equivalence.
//!
//! The default rule is structural and recursive. Values are normalized first
//! (library scalars become plain ints/floats) and must then belong to the same
//! type family. Integers and floats form one numeric family compared with an
//! absolute tolerance, inside containers too. Sets and maps match by
//! membership under the same rule. A flat list facing a one-dimensional array
//! is coerced to the array's element type before comparing.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::error::{ComparisonError, Fault};
use crate::params::ParameterBinding;
use crate::value::{NdArray, Value};

/// Absolute tolerance for numeric scalars.
pub const NUMERIC_TOLERANCE: f64 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Null,
    Bool,
    Numeric,
    Str,
    List,
    Tuple,
    Set,
    Map,
    Array,
    Opaque,
}

fn family(value: &Value) -> Family {
    match value {
        Value::Null => Family::Null,
        Value::Bool(_) => Family::Bool,
        Value::Int(_) | Value::Float(_) | Value::Scalar(_) => Family::Numeric,
        Value::Str(_) => Family::Str,
        Value::List(_) => Family::List,
        Value::Tuple(_) => Family::Tuple,
        Value::Set(_) => Family::Set,
        Value::Map(_) => Family::Map,
        Value::Array(_) => Family::Array,
        Value::Opaque { .. } => Family::Opaque,
    }
}

/// Compare a reference output against a candidate output.
///
/// Returns `Err` when the values cannot be judged: an opaque type, or a list
/// that cannot be coerced into the facing array's element type.
pub fn compare(reference: &Value, candidate: &Value) -> Result<bool, ComparisonError> {
    let reference = reference.clone().normalize();
    let candidate = candidate.clone().normalize();
    compare_normalized(&reference, &candidate)
}

fn compare_normalized(reference: &Value, candidate: &Value) -> Result<bool, ComparisonError> {
    if let Some(coerced) = coerce_flat_list(reference, candidate)? {
        return compare_normalized(reference, &coerced);
    }
    if let Some(coerced) = coerce_flat_list(candidate, reference)? {
        return compare_normalized(&coerced, candidate);
    }

    // A family mismatch is unequal even when one side is opaque; only two
    // opaque values reach the uncomparable arm below.
    let (fr, fc) = (family(reference), family(candidate));
    if fr != fc {
        return Ok(false);
    }

    match (reference, candidate) {
        (Value::Null, Value::Null) => Ok(true),
        (Value::Bool(a), Value::Bool(b)) => Ok(a == b),
        (Value::Str(a), Value::Str(b)) => Ok(a == b),
        (Value::List(a), Value::List(b)) => compare_sequences(a, b),
        (Value::Tuple(a), Value::Tuple(b)) => compare_sequences(a, b),
        (Value::Set(a), Value::Set(b)) => same_members(a, b),
        (Value::Map(a), Value::Map(b)) => same_pairs(a, b),
        (Value::Array(a), Value::Array(b)) => {
            if a.shape() != b.shape() {
                return Ok(false);
            }
            compare_sequences(a.data(), b.data())
        }
        (Value::Opaque { type_name, .. }, _) => Err(ComparisonError::UncomparableType {
            type_name: type_name.clone(),
        }),
        _ => Ok(numbers_match(reference, candidate)),
    }
}

fn numbers_match(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x == y;
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => (x - y).abs() < NUMERIC_TOLERANCE,
        _ => false,
    }
}

/// Element-wise AND; a length mismatch is unequal.
fn compare_sequences(a: &[Value], b: &[Value]) -> Result<bool, ComparisonError> {
    if a.len() != b.len() {
        return Ok(false);
    }
    for (x, y) in a.iter().zip(b) {
        if !compare_normalized(x, y)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Every member of `left` matches some member of `right`.
fn covers(left: &[Value], right: &[Value]) -> Result<bool, ComparisonError> {
    'outer: for x in left {
        for y in right {
            if compare_normalized(x, y)? {
                continue 'outer;
            }
        }
        return Ok(false);
    }
    Ok(true)
}

fn same_members(a: &[Value], b: &[Value]) -> Result<bool, ComparisonError> {
    Ok(a.len() == b.len() && covers(a, b)? && covers(b, a)?)
}

fn covers_pairs(left: &[(Value, Value)], right: &[(Value, Value)]) -> Result<bool, ComparisonError> {
    'outer: for (k, v) in left {
        for (rk, rv) in right {
            if compare_normalized(k, rk)? && compare_normalized(v, rv)? {
                continue 'outer;
            }
        }
        return Ok(false);
    }
    Ok(true)
}

fn same_pairs(a: &[(Value, Value)], b: &[(Value, Value)]) -> Result<bool, ComparisonError> {
    Ok(a.len() == b.len() && covers_pairs(a, b)? && covers_pairs(b, a)?)
}

/// When `array` is a 1-D array and `other` a flat list, convert the list.
fn coerce_flat_list(array: &Value, other: &Value) -> Result<Option<Value>, ComparisonError> {
    let (Value::Array(array), Value::List(items)) = (array, other) else {
        return Ok(None);
    };
    if array.ndim() != 1 || items.iter().any(Value::is_container) {
        return Ok(None);
    }
    let dtype = array.dtype();
    let data = items
        .iter()
        .map(|item| dtype.coerce(item))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(Value::Array(NdArray::from_vec(dtype, data))))
}

// ---------------------------------------------------------------------------
// Custom equality predicates
// ---------------------------------------------------------------------------

/// Everything a custom equality predicate may inspect.
///
/// Parameters are the post-call bindings of each side, so predicates can
/// check in-place mutations. Instances are snapshots and are present only for
/// class-style units.
#[derive(Debug, Clone, Copy)]
pub struct EqualityContext<'a> {
    pub reference_output: &'a Value,
    pub candidate_output: &'a Value,
    pub reference_params: &'a ParameterBinding,
    pub candidate_params: &'a ParameterBinding,
    pub reference_instance: Option<&'a Value>,
    pub candidate_instance: Option<&'a Value>,
}

/// Caller-supplied equivalence predicate replacing the default rule.
pub type EqualityFn = Arc<dyn Fn(&EqualityContext<'_>) -> Result<bool, Fault> + Send + Sync>;

/// Verdict for one trial.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Pass,
    Fail,
    Error(ComparisonError),
}

impl Verdict {
    pub fn passed(&self) -> bool {
        matches!(self, Verdict::Pass)
    }

    fn from_result(result: Result<bool, ComparisonError>) -> Self {
        match result {
            Ok(true) => Verdict::Pass,
            Ok(false) => Verdict::Fail,
            Err(e) => Verdict::Error(e),
        }
    }
}

/// Judge one trial with the unit's predicate, or the default rule.
pub fn judge(ctx: &EqualityContext<'_>, predicate: Option<&EqualityFn>) -> Verdict {
    let Some(predicate) = predicate else {
        return Verdict::from_result(compare(ctx.reference_output, ctx.candidate_output));
    };
    let result = match catch_unwind(AssertUnwindSafe(|| predicate(ctx))) {
        Ok(Ok(equal)) => Ok(equal),
        Ok(Err(fault)) => Err(ComparisonError::Predicate {
            reason: fault.message,
        }),
        Err(_) => Err(ComparisonError::Predicate {
            reason: "equality predicate panicked".to_string(),
        }),
    };
    Verdict::from_result(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{ElementType, Scalar};

    #[test]
    fn test_numeric_tolerance_boundary() {
        assert!(compare(&Value::Float(1.0), &Value::Float(1.0009)).unwrap());
        assert!(!compare(&Value::Float(1.0), &Value::Float(1.0011)).unwrap());
    }

    #[test]
    fn test_int_and_float_share_a_family() {
        assert!(compare(&Value::Int(2), &Value::Float(2.0)).unwrap());
        assert!(!compare(&Value::Int(2), &Value::Int(3)).unwrap());
    }

    #[test]
    fn test_bool_is_not_numeric() {
        assert!(!compare(&Value::Bool(true), &Value::Int(1)).unwrap());
    }

    #[test]
    fn test_library_scalars_normalize() {
        let reference = Value::Scalar(Scalar::I32(4));
        assert!(compare(&reference, &Value::Int(4)).unwrap());
        let reference = Value::Scalar(Scalar::F32(0.5));
        assert!(compare(&reference, &Value::Float(0.5004)).unwrap());
    }

    #[test]
    fn test_list_length_mismatch_is_unequal() {
        let a = Value::list([1i64, 2, 3]);
        let b = Value::list([1i64, 2]);
        assert!(!compare(&a, &b).unwrap());
        assert!(!compare(&b, &a).unwrap());
    }

    #[test]
    fn test_nested_lists_use_tolerance() {
        let a = Value::list([Value::list([1.0, 2.0])]);
        let b = Value::list([Value::list([1.0, 2.0005])]);
        assert!(compare(&a, &b).unwrap());
    }

    #[test]
    fn test_tuple_positional_and() {
        let a = Value::tuple([Value::Int(1), Value::Str("x".into())]);
        let b = Value::tuple([Value::Int(1), Value::Str("y".into())]);
        assert!(compare(&a, &a).unwrap());
        assert!(!compare(&a, &b).unwrap());
        assert!(!compare(&a, &Value::tuple([1i64])).unwrap());
    }

    #[test]
    fn test_sets_ignore_order() {
        let a = Value::set([1i64, 2, 3]);
        let b = Value::set([3i64, 1, 2]);
        assert!(compare(&a, &b).unwrap());
        assert!(!compare(&a, &Value::set([1i64, 2])).unwrap());
    }

    #[test]
    fn test_maps_compare_pairs() {
        let a = Value::map([("a", 1i64), ("b", 2)]);
        let b = Value::map([("b", 2i64), ("a", 1)]);
        let c = Value::map([("a", 1i64), ("b", 3)]);
        assert!(compare(&a, &b).unwrap());
        assert!(!compare(&a, &c).unwrap());
    }

    #[test]
    fn test_set_members_share_numeric_rule() {
        let ints = Value::set([1i64, 2]);
        let floats = Value::set([Value::Float(2.0), Value::Float(1.0)]);
        assert!(compare(&ints, &floats).unwrap());
        assert!(compare(&floats, &ints).unwrap());
        assert!(!compare(&ints, &Value::set([Value::Float(1.5), Value::Float(2.0)])).unwrap());
    }

    #[test]
    fn test_sets_of_different_size_are_unequal() {
        let pair = Value::set([Value::Float(1.0), Value::Float(1.0005)]);
        let single = Value::set([Value::Float(1.0)]);
        assert!(!compare(&pair, &single).unwrap());
        assert!(!compare(&single, &pair).unwrap());
    }

    #[test]
    fn test_map_values_use_tolerance() {
        let a = Value::map([("a", 1.0)]);
        let b = Value::map([("a", 1.0001)]);
        assert!(compare(&a, &b).unwrap());
        assert!(!compare(&a, &Value::map([("a", 1.01)])).unwrap());

        let int_keys = Value::map([(1i64, "x")]);
        let float_keys = Value::map([(1.0, "x")]);
        assert!(compare(&int_keys, &float_keys).unwrap());
    }

    #[test]
    fn test_opaque_member_is_uncomparable() {
        let a = Value::set([Value::opaque("Widget", "<w>")]);
        assert!(matches!(
            compare(&a, &a),
            Err(ComparisonError::UncomparableType { .. })
        ));
    }

    #[test]
    fn test_null_equals_only_null() {
        assert!(compare(&Value::Null, &Value::Null).unwrap());
        assert!(!compare(&Value::Null, &Value::Int(0)).unwrap());
    }

    #[test]
    fn test_flat_list_is_coerced_to_array_dtype() {
        let reference = Value::Array(NdArray::from_vec(
            ElementType::Float,
            vec![Value::Float(1.0), Value::Float(2.0)],
        ));
        let candidate = Value::list([1i64, 2]);
        assert!(compare(&reference, &candidate).unwrap());
        assert!(compare(&candidate, &reference).unwrap());
    }

    #[test]
    fn test_uncoercible_list_is_comparison_error() {
        let reference = Value::Array(NdArray::from_vec(ElementType::Int, vec![Value::Int(1)]));
        let candidate = Value::list(["abc"]);
        assert!(matches!(
            compare(&reference, &candidate),
            Err(ComparisonError::Coercion { .. })
        ));
    }

    #[test]
    fn test_array_shape_mismatch() {
        let a = NdArray::with_shape(ElementType::Int, vec![2, 2], (0..4i64).map(Value::Int).collect());
        let b = NdArray::with_shape(ElementType::Int, vec![4, 1], (0..4i64).map(Value::Int).collect());
        let (a, b) = (Value::Array(a.unwrap()), Value::Array(b.unwrap()));
        assert!(compare(&a, &a).unwrap());
        assert!(!compare(&a, &b).unwrap());
    }

    #[test]
    fn test_opaque_is_uncomparable() {
        let thing = Value::opaque("Widget", "<Widget>");
        assert_eq!(
            compare(&thing, &thing),
            Err(ComparisonError::UncomparableType {
                type_name: "Widget".to_string()
            })
        );
    }

    #[test]
    fn test_opaque_against_other_family_is_unequal() {
        let thing = Value::opaque("Widget", "<Widget>");
        assert_eq!(compare(&thing, &Value::Int(1)), Ok(false));
        assert_eq!(compare(&Value::Int(1), &thing), Ok(false));
    }

    #[test]
    fn test_reflexive_and_symmetric_over_samples() {
        let samples = vec![
            Value::Null,
            Value::Bool(false),
            Value::Int(3),
            Value::Float(3.0004),
            Value::Str("s".into()),
            Value::list([1i64, 2]),
            Value::tuple([Value::Int(1), Value::Null]),
            Value::set(["a", "b"]),
            Value::map([("k", 1i64)]),
        ];
        for a in &samples {
            assert!(compare(a, a).unwrap(), "{a} should equal itself");
            for b in &samples {
                assert_eq!(compare(a, b).unwrap(), compare(b, a).unwrap(), "{a} vs {b}");
            }
        }
    }

    fn ctx<'a>(
        r: &'a Value,
        c: &'a Value,
        p: &'a ParameterBinding,
    ) -> EqualityContext<'a> {
        EqualityContext {
            reference_output: r,
            candidate_output: c,
            reference_params: p,
            candidate_params: p,
            reference_instance: None,
            candidate_instance: None,
        }
    }

    #[test]
    fn test_judge_uses_predicate() {
        let params = ParameterBinding::new();
        let (r, c) = (Value::list([1i64, 2]), Value::list([2i64, 1]));
        let sorted_eq: EqualityFn = Arc::new(|ctx| {
            let sort = |v: &Value| match v {
                Value::List(items) => {
                    let mut ints: Vec<i64> = items.iter().filter_map(Value::as_i64).collect();
                    ints.sort_unstable();
                    ints
                }
                _ => Vec::new(),
            };
            Ok(sort(ctx.reference_output) == sort(ctx.candidate_output))
        });
        assert_eq!(judge(&ctx(&r, &c, &params), None), Verdict::Fail);
        assert_eq!(judge(&ctx(&r, &c, &params), Some(&sorted_eq)), Verdict::Pass);
    }

    #[test]
    fn test_judge_predicate_fault_is_error() {
        let params = ParameterBinding::new();
        let v = Value::Null;
        let broken: EqualityFn = Arc::new(|_| Err(Fault::new("bad state")));
        assert!(matches!(
            judge(&ctx(&v, &v, &params), Some(&broken)),
            Verdict::Error(ComparisonError::Predicate { .. })
        ));
    }
}
