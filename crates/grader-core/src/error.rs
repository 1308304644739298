//! Error taxonomy for the grading engine.
//!
//! Candidate misbehaviour is never an `Err` in this crate: it travels as a
//! tagged [`Outcome`](crate::executor::Outcome) or a failed trial record.
//! Only defects in trusted harness input (reference code, unit declarations,
//! configuration) surface as [`GraderError`].

use serde::{Deserialize, Serialize};

/// A fault raised by an untrusted callable: a returned error or a caught panic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct Fault {
    pub message: String,
}

impl Fault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<&str> for Fault {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for Fault {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

/// Errors detected while validating a unit declaration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpecError {
    #[error("fixed parameter domain '{parameter}' has no values")]
    EmptyDomain { parameter: String },

    #[error("invalid unit declaration: {reason}")]
    InvalidSpec { reason: String },
}

/// A parameter or constructor-argument generator failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("generator for '{parameter}' failed: {message}")]
pub struct GenerationError {
    pub parameter: String,
    pub message: String,
}

/// The comparator could not decide equivalence.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ComparisonError {
    #[error("cannot grade values of type {type_name}")]
    UncomparableType { type_name: String },

    #[error("cannot coerce candidate output: {reason}")]
    Coercion { reason: String },

    #[error("equality predicate failed: {reason}")]
    Predicate { reason: String },
}

/// Errors produced by complexity measurement and classification.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ComplexityError {
    #[error("need at least {required} timing samples, got {actual}")]
    TooFewSamples { required: usize, actual: usize },

    #[error("sample sizes must be strictly increasing (size {size} at position {index})")]
    NonIncreasingSizes { index: usize, size: usize },

    #[error("sample at size {size} has a negative duration")]
    NegativeDuration { size: usize },

    #[error("sample sizes span {min}..{max}; at least one order of magnitude is required")]
    InsufficientSpan { min: usize, max: usize },

    #[error("no candidate models supplied")]
    NoModels,

    #[error("execution at size {size} failed: {reason}")]
    Execution { size: usize, reason: String },

    #[error("could not fit model {model}: {reason}")]
    Fit { model: String, reason: String },
}

/// Unit- and submission-level grading errors.
#[derive(Debug, thiserror::Error)]
pub enum GraderError {
    #[error("reference implementation of {unit} raised on trial {trial}: {message}")]
    ReferenceFault {
        unit: String,
        trial: usize,
        message: String,
    },

    #[error("unit {unit}: {source}")]
    Spec {
        unit: String,
        #[source]
        source: SpecError,
    },

    #[error("reference registry has no entry point named {unit}")]
    MissingReferenceEntry { unit: String },

    #[error("invalid grading configuration: {0}")]
    InvalidConfig(String),

    #[error("complexity error: {0}")]
    Complexity(#[from] ComplexityError),

    #[error("feedback sink error: {0}")]
    Sink(String),

    #[error("grading task failed: {0}")]
    Join(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GraderError {
    /// Whether this error indicates a broken harness rather than a bad candidate.
    pub fn is_harness_defect(&self) -> bool {
        matches!(
            self,
            GraderError::ReferenceFault { .. }
                | GraderError::Spec { .. }
                | GraderError::MissingReferenceEntry { .. }
        )
    }
}

/// Result type for grading operations.
pub type Result<T> = std::result::Result<T, GraderError>;
