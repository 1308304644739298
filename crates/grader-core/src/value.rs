//! Dynamic values exchanged with implementations under test.
//!
//! Reference and candidate entry points receive and return [`Value`]s. The
//! model covers the shapes a grading exercise produces: scalars, ordered
//! sequences, tuples, sets, keyed maps, n-dimensional arrays and fixed-width
//! library scalars. Anything else is carried as [`Value::Opaque`] and is
//! rejected by the default comparator.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ComparisonError;

/// Fixed-width numeric scalars as produced by numeric libraries.
///
/// These normalize to [`Value::Int`] / [`Value::Float`] before comparison.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    /// Arbitrary-width integer narrowed to 128 bits.
    Wide(i128),
    F32(f32),
    F64(f64),
}

impl Scalar {
    /// Canonical [`Value`] for this scalar.
    ///
    /// Integers that do not fit an `i64` become floats.
    pub fn normalize(self) -> Value {
        match self {
            Scalar::I32(v) => Value::Int(i64::from(v)),
            Scalar::I64(v) => Value::Int(v),
            Scalar::U32(v) => Value::Int(i64::from(v)),
            Scalar::U64(v) => i64::try_from(v)
                .map(Value::Int)
                .unwrap_or(Value::Float(v as f64)),
            Scalar::Wide(v) => i64::try_from(v)
                .map(Value::Int)
                .unwrap_or(Value::Float(v as f64)),
            Scalar::F32(v) => Value::Float(f64::from(v)),
            Scalar::F64(v) => Value::Float(v),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Scalar::I32(_) => "int32",
            Scalar::I64(_) => "int64",
            Scalar::U32(_) => "uint32",
            Scalar::U64(_) => "uint64",
            Scalar::Wide(_) => "bigint",
            Scalar::F32(_) => "float32",
            Scalar::F64(_) => "float64",
        }
    }
}

/// Element type of an [`NdArray`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementType {
    Bool,
    Int,
    Float,
    Str,
}

impl ElementType {
    /// Convert a scalar value into this element type.
    pub fn coerce(self, value: &Value) -> Result<Value, ComparisonError> {
        let value = value.clone().normalize();
        let fail = |value: &Value| ComparisonError::Coercion {
            reason: format!("cannot convert {} to {:?}", value.type_name(), self),
        };
        match (self, &value) {
            (ElementType::Bool, Value::Bool(b)) => Ok(Value::Bool(*b)),
            (ElementType::Bool, Value::Int(i)) => Ok(Value::Bool(*i != 0)),
            (ElementType::Bool, Value::Float(f)) => Ok(Value::Bool(*f != 0.0)),
            (ElementType::Int, Value::Bool(b)) => Ok(Value::Int(i64::from(*b))),
            (ElementType::Int, Value::Int(i)) => Ok(Value::Int(*i)),
            (ElementType::Int, Value::Float(f)) if f.is_finite() => Ok(Value::Int(f.trunc() as i64)),
            (ElementType::Int, Value::Str(s)) => s
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| fail(&value)),
            (ElementType::Float, Value::Bool(b)) => Ok(Value::Float(if *b { 1.0 } else { 0.0 })),
            (ElementType::Float, Value::Int(i)) => Ok(Value::Float(*i as f64)),
            (ElementType::Float, Value::Float(f)) => Ok(Value::Float(*f)),
            (ElementType::Float, Value::Str(s)) => s
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| fail(&value)),
            (ElementType::Str, Value::Str(s)) => Ok(Value::Str(s.clone())),
            (ElementType::Str, Value::Bool(_) | Value::Int(_) | Value::Float(_)) => {
                Ok(Value::Str(value.to_string()))
            }
            _ => Err(fail(&value)),
        }
    }
}

/// A dense n-dimensional array stored in row-major order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NdArray {
    dtype: ElementType,
    shape: Vec<usize>,
    data: Vec<Value>,
}

impl NdArray {
    /// One-dimensional array.
    pub fn from_vec(dtype: ElementType, data: Vec<Value>) -> Self {
        Self {
            dtype,
            shape: vec![data.len()],
            data,
        }
    }

    /// Array with an explicit shape. Returns `None` when the shape does not
    /// account for exactly `data.len()` elements.
    pub fn with_shape(dtype: ElementType, shape: Vec<usize>, data: Vec<Value>) -> Option<Self> {
        let expected: usize = shape.iter().product();
        (expected == data.len()).then_some(Self { dtype, shape, data })
    }

    pub fn dtype(&self) -> ElementType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[Value] {
        &self.data
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }
}

/// A dynamically typed value.
///
/// The serde form is lossless and tagged; [`Value::to_json`] is the plain
/// form spoken to external processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    /// Unordered collection; element order carries no meaning.
    Set(Vec<Value>),
    /// Keyed mapping; pair order carries no meaning.
    Map(Vec<(Value, Value)>),
    Array(NdArray),
    Scalar(Scalar),
    /// A value the engine can display but not structurally compare.
    Opaque { type_name: String, repr: String },
}

impl Value {
    pub fn list<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        Value::List(items.into_iter().map(Into::into).collect())
    }

    pub fn tuple<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        Value::Tuple(items.into_iter().map(Into::into).collect())
    }

    /// Build a set, dropping structurally duplicate elements.
    pub fn set<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        let mut unique: Vec<Value> = Vec::new();
        for item in items {
            let item = item.into().normalize();
            if !unique.contains(&item) {
                unique.push(item);
            }
        }
        Value::Set(unique)
    }

    pub fn map<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<Value>,
        V: Into<Value>,
    {
        Value::Map(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn opaque(type_name: impl Into<String>, repr: impl Into<String>) -> Self {
        Value::Opaque {
            type_name: type_name.into(),
            repr: repr.into(),
        }
    }

    /// Short type label used in feedback and error messages.
    pub fn type_name(&self) -> &str {
        match self {
            Value::Null => "None",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Set(_) => "set",
            Value::Map(_) => "dict",
            Value::Array(_) => "ndarray",
            Value::Scalar(s) => s.type_name(),
            Value::Opaque { type_name, .. } => type_name,
        }
    }

    /// Whether this value is a collection (counts toward container usage).
    pub fn is_container(&self) -> bool {
        matches!(
            self,
            Value::List(_) | Value::Tuple(_) | Value::Set(_) | Value::Map(_) | Value::Array(_)
        )
    }

    /// Numeric view of an integer, float or library scalar.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Scalar(s) => s.normalize().as_f64(),
            _ => None,
        }
    }

    /// Integer view, for exact comparison of integral values.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Scalar(s) => match s.normalize() {
                Value::Int(i) => Some(i),
                _ => None,
            },
            _ => None,
        }
    }

    /// Replace library scalars with canonical ints/floats, recursively.
    pub fn normalize(self) -> Value {
        match self {
            Value::Scalar(s) => s.normalize(),
            Value::List(items) => Value::List(items.into_iter().map(Value::normalize).collect()),
            Value::Tuple(items) => Value::Tuple(items.into_iter().map(Value::normalize).collect()),
            Value::Set(items) => Value::Set(items.into_iter().map(Value::normalize).collect()),
            Value::Map(pairs) => Value::Map(
                pairs
                    .into_iter()
                    .map(|(k, v)| (k.normalize(), v.normalize()))
                    .collect(),
            ),
            Value::Array(array) => Value::Array(NdArray {
                data: array.data.into_iter().map(Value::normalize).collect(),
                ..array
            }),
            other => other,
        }
    }

    /// Convert from plain JSON (the external process wire format).
    ///
    /// Integral numbers become [`Value::Int`]; objects become string-keyed maps.
    pub fn from_json(json: serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => match n.as_u64() {
                    Some(u) => Scalar::U64(u).normalize(),
                    None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
                },
            },
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(fields) => Value::Map(
                fields
                    .into_iter()
                    .map(|(k, v)| (Value::Str(k), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert to plain JSON. Tuples, sets and arrays flatten to JSON arrays;
    /// maps with non-string keys become arrays of `[key, value]` pairs.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Str(s) => Json::String(s.clone()),
            Value::List(items) | Value::Tuple(items) | Value::Set(items) => {
                Json::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(pairs) => {
                if pairs.iter().all(|(k, _)| matches!(k, Value::Str(_))) {
                    Json::Object(
                        pairs
                            .iter()
                            .filter_map(|(k, v)| match k {
                                Value::Str(key) => Some((key.clone(), v.to_json())),
                                _ => None,
                            })
                            .collect(),
                    )
                } else {
                    Json::Array(
                        pairs
                            .iter()
                            .map(|(k, v)| Json::Array(vec![k.to_json(), v.to_json()]))
                            .collect(),
                    )
                }
            }
            Value::Array(array) => nested_json(array.shape(), array.data()),
            Value::Scalar(s) => s.normalize().to_json(),
            Value::Opaque { repr, .. } => Json::String(repr.clone()),
        }
    }
}

fn nested_json(shape: &[usize], data: &[Value]) -> serde_json::Value {
    match shape.split_first() {
        None => data
            .first()
            .map(Value::to_json)
            .unwrap_or(serde_json::Value::Null),
        Some((_, [])) => serde_json::Value::Array(data.iter().map(Value::to_json).collect()),
        Some((&outer, rest)) => {
            let stride: usize = rest.iter().product();
            serde_json::Value::Array(
                (0..outer)
                    .map(|i| nested_json(rest, &data[i * stride..(i + 1) * stride]))
                    .collect(),
            )
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        i64::try_from(v)
            .map(Value::Int)
            .unwrap_or(Value::Float(v as f64))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::list(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, items: &[Value]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("None"),
            Value::Bool(true) => f.write_str("True"),
            Value::Bool(false) => f.write_str("False"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v:?}"),
            Value::Str(s) => write!(f, "'{s}'"),
            Value::List(items) => {
                f.write_str("[")?;
                write_joined(f, items)?;
                f.write_str("]")
            }
            Value::Tuple(items) => {
                f.write_str("(")?;
                write_joined(f, items)?;
                if items.len() == 1 {
                    f.write_str(",")?;
                }
                f.write_str(")")
            }
            Value::Set(items) if items.is_empty() => f.write_str("set()"),
            Value::Set(items) => {
                f.write_str("{")?;
                write_joined(f, items)?;
                f.write_str("}")
            }
            Value::Map(pairs) => {
                f.write_str("{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str("}")
            }
            Value::Array(array) => {
                f.write_str("array([")?;
                write_joined(f, array.data())?;
                if array.ndim() == 1 {
                    f.write_str("])")
                } else {
                    write!(f, "], shape={:?})", array.shape())
                }
            }
            Value::Scalar(s) => write!(f, "{}", s.normalize()),
            Value::Opaque { repr, .. } => f.write_str(repr),
        }
    }
}
