//! Gradable-unit declarations.
//!
//! A reference module declares each entry point as graded (with a parameter
//! strategy and optional equality predicate, class metadata and extra-credit
//! flag) or not graded. Declarations are validated eagerly when the
//! [`GradingPlan`] is built; a defective declaration disables only its unit.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::compare::{EqualityContext, EqualityFn};
use crate::error::{Fault, GenerationError, GraderError, SpecError};
use crate::params::{
    generate_binding, IntoGenerator, ParamStrategy, ParameterBinding, ValueGenerator,
};
use crate::registry::Registry;
use crate::value::Value;

/// Class-style metadata: how instances are built and how long they live.
#[derive(Clone)]
pub struct ClassSpec {
    pub trials_per_instance: usize,
    pub constructor_params: Vec<(String, ValueGenerator)>,
}

impl ClassSpec {
    /// Fresh constructor arguments for a new instance window.
    pub fn construct_params(&self) -> Result<ParameterBinding, GenerationError> {
        generate_binding(&self.constructor_params)
    }
}

impl fmt::Debug for ClassSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassSpec")
            .field("trials_per_instance", &self.trials_per_instance)
            .field(
                "constructor_params",
                &self.constructor_params.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Immutable descriptor of one gradable unit.
#[derive(Clone)]
pub struct FunctionSpec {
    name: String,
    strategy: ParamStrategy,
    equality: Option<EqualityFn>,
    class: Option<ClassSpec>,
    extra_credit: bool,
}

impl FunctionSpec {
    /// Start a randomized declaration running `trials` trials.
    pub fn randomized(name: impl Into<String>, trials: usize) -> FunctionSpecBuilder {
        FunctionSpecBuilder::new(name.into(), Mode::Randomized { trials })
    }

    /// Start a fixed cartesian-product declaration.
    pub fn fixed(name: impl Into<String>) -> FunctionSpecBuilder {
        FunctionSpecBuilder::new(name.into(), Mode::Fixed)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn trial_count(&self) -> usize {
        self.strategy.trial_count()
    }

    pub fn strategy(&self) -> &ParamStrategy {
        &self.strategy
    }

    pub fn equality(&self) -> Option<&EqualityFn> {
        self.equality.as_ref()
    }

    pub fn has_custom_equality(&self) -> bool {
        self.equality.is_some()
    }

    pub fn class(&self) -> Option<&ClassSpec> {
        self.class.as_ref()
    }

    pub fn is_class_style(&self) -> bool {
        self.class.is_some()
    }

    pub fn is_extra_credit(&self) -> bool {
        self.extra_credit
    }
}

impl fmt::Debug for FunctionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionSpec")
            .field("name", &self.name)
            .field("strategy", &self.strategy)
            .field("custom_equality", &self.equality.is_some())
            .field("class", &self.class)
            .field("extra_credit", &self.extra_credit)
            .finish()
    }
}

enum Mode {
    Randomized { trials: usize },
    Fixed,
}

/// Builder for [`FunctionSpec`]. Validation happens in [`build`](Self::build).
pub struct FunctionSpecBuilder {
    name: String,
    mode: Mode,
    generators: Vec<(String, ValueGenerator)>,
    domains: Vec<(String, Vec<Value>)>,
    equality: Option<EqualityFn>,
    trials_per_instance: Option<usize>,
    constructor_params: Vec<(String, ValueGenerator)>,
    extra_credit: bool,
    misuse: Option<String>,
}

fn rejection(err: SpecError) -> String {
    match err {
        SpecError::InvalidSpec { reason } => reason,
        other => other.to_string(),
    }
}

impl FunctionSpecBuilder {
    fn new(name: String, mode: Mode) -> Self {
        Self {
            name,
            mode,
            generators: Vec::new(),
            domains: Vec::new(),
            equality: None,
            trials_per_instance: None,
            constructor_params: Vec::new(),
            extra_credit: false,
            misuse: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn reject(&mut self, reason: String) {
        self.misuse.get_or_insert(reason);
    }

    /// Randomized parameter with its generator.
    pub fn param(mut self, name: impl Into<String>, generator: impl IntoGenerator) -> Self {
        let name = name.into();
        if matches!(self.mode, Mode::Fixed) {
            self.reject(format!("parameter '{name}' needs a value domain in a fixed declaration"));
        }
        match generator.into_generator() {
            Ok(generator) => self.generators.push((name, generator)),
            Err(err) => self.reject(format!("parameter '{name}': {}", rejection(err))),
        }
        self
    }

    /// Fixed parameter with its value domain.
    pub fn domain<I, T>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        let name = name.into();
        if matches!(self.mode, Mode::Randomized { .. }) {
            self.reject(format!("parameter '{name}' needs a generator in a randomized declaration"));
        }
        self.domains
            .push((name, values.into_iter().map(Into::into).collect()));
        self
    }

    /// Replace the default structural comparison.
    pub fn equality<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&EqualityContext<'_>) -> Result<bool, Fault> + Send + Sync + 'static,
    {
        self.equality = Some(Arc::new(predicate));
        self
    }

    /// Mark the unit as a method on a class-style instance rebuilt every
    /// `trials_per_instance` trials.
    pub fn class(mut self, trials_per_instance: usize) -> Self {
        self.trials_per_instance = Some(trials_per_instance);
        self
    }

    /// Constructor argument for class-style units.
    pub fn constructor_param(mut self, name: impl Into<String>, generator: impl IntoGenerator) -> Self {
        let name = name.into();
        match generator.into_generator() {
            Ok(generator) => self.constructor_params.push((name, generator)),
            Err(err) => self.reject(format!("constructor parameter '{name}': {}", rejection(err))),
        }
        self
    }

    pub fn extra_credit(mut self) -> Self {
        self.extra_credit = true;
        self
    }

    pub fn build(self) -> Result<FunctionSpec, GraderError> {
        let unit = self.name.clone();
        self.try_build().map_err(|source| GraderError::Spec { unit, source })
    }

    fn try_build(self) -> Result<FunctionSpec, SpecError> {
        if let Some(reason) = self.misuse {
            return Err(SpecError::InvalidSpec { reason });
        }
        if self.name.trim().is_empty() {
            return Err(SpecError::InvalidSpec {
                reason: "unit name is empty".to_string(),
            });
        }

        let mut seen = HashSet::new();
        let names = self
            .generators
            .iter()
            .map(|(n, _)| n)
            .chain(self.domains.iter().map(|(n, _)| n));
        for name in names {
            if !seen.insert(name.as_str()) {
                return Err(SpecError::InvalidSpec {
                    reason: format!("parameter '{name}' declared twice"),
                });
            }
        }

        let strategy = match self.mode {
            Mode::Randomized { trials } => ParamStrategy::randomized(trials, self.generators)?,
            Mode::Fixed => ParamStrategy::fixed_set(self.domains)?,
        };

        let class = match (self.trials_per_instance, self.constructor_params.is_empty()) {
            (Some(0), _) => {
                return Err(SpecError::InvalidSpec {
                    reason: "trials per instance must be greater than 0".to_string(),
                })
            }
            (Some(trials_per_instance), _) => Some(ClassSpec {
                trials_per_instance,
                constructor_params: self.constructor_params,
            }),
            (None, true) => None,
            (None, false) => {
                return Err(SpecError::InvalidSpec {
                    reason: "constructor parameters declared on a non-class unit".to_string(),
                })
            }
        };

        Ok(FunctionSpec {
            name: self.name,
            strategy,
            equality: self.equality,
            class,
            extra_credit: self.extra_credit,
        })
    }
}

/// What a reference module says about one of its entry points.
pub enum Declaration {
    Graded(FunctionSpecBuilder),
    NotGraded(String),
}

impl From<FunctionSpecBuilder> for Declaration {
    fn from(builder: FunctionSpecBuilder) -> Self {
        Declaration::Graded(builder)
    }
}

/// A unit in the plan: ready to grade, or disabled by a harness defect.
#[derive(Debug, Clone)]
pub enum PlanEntry {
    Ready(Arc<FunctionSpec>),
    Defective { name: String, reason: String },
}

impl PlanEntry {
    pub fn name(&self) -> &str {
        match self {
            PlanEntry::Ready(spec) => spec.name(),
            PlanEntry::Defective { name, .. } => name,
        }
    }
}

/// The reference registry plus the validated units to grade, in declaration order.
#[derive(Debug, Clone)]
pub struct GradingPlan {
    reference: Arc<Registry>,
    entries: Vec<PlanEntry>,
}

impl GradingPlan {
    pub fn new(reference: Registry, declarations: Vec<Declaration>) -> Self {
        let mut entries = Vec::new();
        for declaration in declarations {
            let builder = match declaration {
                Declaration::NotGraded(name) => {
                    debug!(unit = %name, "skipping unit marked as not graded");
                    continue;
                }
                Declaration::Graded(builder) => builder,
            };
            let name = builder.name().to_string();
            let entry = match builder.build() {
                Ok(spec) if !reference.contains(spec.name()) => PlanEntry::Defective {
                    reason: GraderError::MissingReferenceEntry { unit: name.clone() }.to_string(),
                    name,
                },
                Ok(spec) => PlanEntry::Ready(Arc::new(spec)),
                Err(err) => PlanEntry::Defective {
                    name,
                    reason: err.to_string(),
                },
            };
            entries.push(entry);
        }
        Self {
            reference: Arc::new(reference),
            entries,
        }
    }

    pub fn reference(&self) -> &Arc<Registry> {
        &self.reference
    }

    pub fn entries(&self) -> &[PlanEntry] {
        &self.entries
    }

    pub fn ready(&self) -> impl Iterator<Item = &Arc<FunctionSpec>> {
        self.entries.iter().filter_map(|entry| match entry {
            PlanEntry::Ready(spec) => Some(spec),
            PlanEntry::Defective { .. } => None,
        })
    }

    pub fn extra_credit_count(&self) -> usize {
        self.ready().filter(|spec| spec.is_extra_credit()).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
