//! Student-facing feedback.
//!
//! Rendering helpers turn values, parameters and differences into the text
//! lines of a unit's feedback trail. A [`FeedbackSink`] receives the trail;
//! where it ends up (file, database, terminal) is the sink's business.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::compare::compare;
use crate::error::Result;
use crate::params::ParameterBinding;
use crate::value::Value;

/// Containers longer than this are abbreviated.
pub const ABBREVIATE_OVER: usize = 20;

/// Ordered feedback lines for one unit or one submission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedbackLog {
    lines: Vec<String>,
}

impl FeedbackLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    pub fn extend<I: IntoIterator<Item = String>>(&mut self, lines: I) {
        self.lines.extend(lines);
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines.iter().any(|line| line.contains(needle))
    }

    pub fn text(&self) -> String {
        let mut text = self.lines.join("\n");
        text.push('\n');
        text
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Readable form of a value, abbreviating large containers.
pub fn type_to_str(value: &Value) -> String {
    match value {
        Value::List(items) if items.len() > ABBREVIATE_OVER => format!(
            "[{}, {}, ... ({} more items), {}, {}]",
            items[0],
            items[1],
            items.len() - 4,
            items[items.len() - 2],
            items[items.len() - 1]
        ),
        Value::Map(pairs) if pairs.len() > ABBREVIATE_OVER => {
            format!("{{{} dict items...}}", pairs.len())
        }
        Value::Set(items) if items.len() > ABBREVIATE_OVER => {
            format!("{{{} set items...}}", items.len())
        }
        other => other.to_string(),
    }
}

/// `name: value, name: value`
pub fn params_to_str(params: &ParameterBinding) -> String {
    params
        .iter()
        .map(|(name, value)| format!("{name}: {}", type_to_str(value)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Like [`type_to_str`], but abbreviates each member of a returned tuple.
pub fn output_to_str(output: &Value) -> String {
    match output {
        Value::Tuple(items) => format!(
            "({})",
            items.iter().map(type_to_str).collect::<Vec<_>>().join(", ")
        ),
        other => type_to_str(other),
    }
}

fn set_difference<'a>(a: &'a [Value], b: &[Value]) -> Vec<&'a Value> {
    a.iter().filter(|x| !b.contains(x)).collect()
}

fn render_set(items: &[&Value]) -> String {
    if items.is_empty() {
        return "set()".to_string();
    }
    format!(
        "{{{}}}",
        items.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ")
    )
}

/// Explain how two outputs differ. Empty when there is nothing specific to say.
pub fn diff_to_str(reference: &Value, candidate: &Value) -> String {
    if reference.type_name() != candidate.type_name() {
        return format!(
            "Difference: Types are different (Solution={} vs Student={})",
            reference.type_name(),
            candidate.type_name()
        );
    }
    match (reference, candidate) {
        (Value::Set(r), Value::Set(c)) => format!(
            "Difference: Items in solution but not in student = {}, item in student but not in solution = {}",
            render_set(&set_difference(r, c)),
            render_set(&set_difference(c, r))
        ),
        (Value::List(r), Value::List(c)) => {
            if r.len() != c.len() {
                return format!(
                    "Difference: Lists are not the same length (Solution={} vs Student={})",
                    r.len(),
                    c.len()
                );
            }
            let mismatched: Vec<usize> = r
                .iter()
                .zip(c)
                .enumerate()
                .filter(|(_, (x, y))| !matches!(compare(x, y), Ok(true)))
                .map(|(i, _)| i)
                .collect();
            match mismatched.first() {
                Some(&idx) => format!(
                    "Difference: There are [{}] indices that do not match. Let us see the first one -> IDX={idx}, Solution[IDX] = {}, Student[IDX] = {}",
                    mismatched.len(),
                    r[idx],
                    c[idx]
                ),
                None => String::new(),
            }
        }
        _ => String::new(),
    }
}

/// Banner opening a unit's trail.
pub fn unit_header(unit: &str) -> String {
    format!("******************** [AutoGrader] Grading fn=\"{unit}\" ********************")
}

pub fn missing_unit_line(unit: &str) -> String {
    format!("Did not find {unit} in the student code, assigning a grade of 0 to this problem")
}

pub fn harness_defect_line(unit: &str, reason: &str) -> String {
    format!("### The grading harness for {unit} is broken, this problem was not graded: {reason}")
}

pub fn fault_line(unit: &str, params: &ParameterBinding, message: &str) -> String {
    format!(
        "Got exception [{message}] when running function {unit}({}).",
        params_to_str(params)
    )
}

pub fn construction_fault_line(unit: &str, message: &str) -> String {
    format!("Got exception [{message}] when creating class for {unit}")
}

pub fn timeout_lines(reference_duration: Duration, limit: Duration) -> [String; 2] {
    [
        "Your code took too long to run so it was timed out and stopped.".to_string(),
        format!(
            "\tAs a reference, the solution took {:.6}s to run. The time limit is {}s \n",
            reference_duration.as_secs_f64(),
            limit.as_secs_f64()
        ),
    ]
}

pub fn comparison_error_line(unit: &str, message: &str) -> String {
    format!("### Got exception {message} when grading {unit} when trying to compare outputs.")
}

pub fn remaining_patience_line(remaining: usize) -> String {
    format!("# Remaining Exceptions Allowed = {remaining}")
}

pub const PATIENCE_EXHAUSTED_LINE: &str =
    "# Stopping grading function early due to repeated exceptions.";

/// Detailed write-up of one failed trial.
pub struct FailureDetail<'a> {
    pub unit: &'a str,
    pub trial_index: usize,
    pub custom_equality: bool,
    pub reference_output: &'a Value,
    pub candidate_output: &'a Value,
    pub reference_params: &'a ParameterBinding,
    pub candidate_params: &'a ParameterBinding,
    pub reference_instance: Option<&'a Value>,
    pub candidate_instance: Option<&'a Value>,
}

impl FailureDetail<'_> {
    pub fn lines(&self) -> Vec<String> {
        let case = self.trial_index + 1;
        let mut lines = if self.custom_equality {
            vec![format!("Test Case #{case} failed")]
        } else {
            vec![
                format!(
                    "Test Case #{case} failed | Reason => {}",
                    diff_to_str(self.reference_output, self.candidate_output)
                ),
                format!(
                    "\t The Solution Outputs -> {}({})={}",
                    self.unit,
                    params_to_str(self.reference_params),
                    output_to_str(self.reference_output)
                ),
                format!(
                    "\tYour Solution Outputs -> {}({})={}",
                    self.unit,
                    params_to_str(self.candidate_params),
                    output_to_str(self.candidate_output)
                ),
                String::new(),
            ]
        };
        if let (Some(reference), Some(candidate)) = (self.reference_instance, self.candidate_instance) {
            lines.push(format!("\tSolution Class = \n{reference}"));
            lines.push(format!("\tYour Class = \n{candidate}\n"));
        }
        lines
    }
}

pub fn passed_line(passed: usize, attempted: usize) -> String {
    format!("###>>> Passed {passed}/{attempted} test cases")
}

pub fn grade_line(unit: &str, score: f64) -> String {
    format!("###>>> Grade for function \"{unit}\" = {:.0} / 100\n", score * 100.0)
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Destination of feedback trails.
#[async_trait]
pub trait FeedbackSink: Send + Sync {
    /// Append lines to a submission's trail. Called in unit order.
    async fn write(&self, submission_id: &str, lines: &[String]) -> Result<()>;
}

/// Keeps every trail in memory, keyed by submission id.
#[derive(Debug, Default)]
pub struct MemorySink {
    trails: Mutex<BTreeMap<String, Vec<String>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn trail(&self, submission_id: &str) -> Vec<String> {
        self.trails
            .lock()
            .await
            .get(submission_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn submissions(&self) -> Vec<String> {
        self.trails.lock().await.keys().cloned().collect()
    }
}

#[async_trait]
impl FeedbackSink for MemorySink {
    async fn write(&self, submission_id: &str, lines: &[String]) -> Result<()> {
        self.trails
            .lock()
            .await
            .entry(submission_id.to_string())
            .or_default()
            .extend_from_slice(lines);
        Ok(())
    }
}
