//! Differential grading engine.
//!
//! Runs a reference implementation and a candidate side by side on generated
//! inputs, compares their outputs, and turns the results into per-unit scores,
//! a feedback trail, and a final grade. Also classifies empirical time and
//! space complexity.

pub mod catalog;
pub mod compare;
pub mod complexity;
pub mod config;
pub mod error;
pub mod executor;
pub mod feedback;
pub mod metrics;
pub mod obs;
pub mod params;
pub mod pool;
pub mod registry;
pub mod score;
pub mod sequencer;
pub mod spec;
pub mod telemetry;
pub mod value;
pub mod worker;

pub use compare::{compare, judge, EqualityContext, EqualityFn, Verdict, NUMERIC_TOLERANCE};
pub use complexity::{
    auto_grade_space, auto_grade_time, classify, grade_space, grade_time_complexity,
    Classification, ComplexityModel, ComplexitySample, SpaceGrade, TimeGrade, TimingPlan,
};
pub use config::GradingConfig;
pub use error::{
    ComparisonError, ComplexityError, Fault, GenerationError, GraderError, Result, SpecError,
};
pub use executor::{CallResult, CancelToken, LiveInstance, Outcome, TrialExecutor};
pub use feedback::{FeedbackLog, FeedbackSink, MemorySink};
pub use params::{generators, IntoGenerator, ParamStrategy, ParameterBinding, ValueGenerator};
pub use pool::{Grader, Submission};
pub use registry::{EntryPoint, ProcessCommand, Registry, UnitInstance};
pub use score::{
    final_grade, score_ta_cases, ScoreRecord, SubmissionReport, TaCaseScore, TerminalState,
    UnitOutcome,
};
pub use sequencer::{TrialRecord, TrialSequencer, TrialStatus, UnitRun, DEFAULT_EXCEPTION_PATIENCE};
pub use spec::{Declaration, FunctionSpec, FunctionSpecBuilder, GradingPlan, PlanEntry};
pub use telemetry::init_tracing;
pub use value::{ElementType, NdArray, Value};
pub use worker::WorkerLauncher;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
