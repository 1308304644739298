//! Entry-point registry.
//!
//! The engine never loads code itself. Trusted loading code builds a
//! [`Registry`] mapping unit names to callables, and the sequencer resolves
//! both the reference and the candidate side through it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Fault;
use crate::executor::CancelToken;
use crate::params::ParameterBinding;
use crate::value::Value;

/// A stateful object constructed for class-style units.
///
/// `call` receives the unit name as `method` and may mutate both the
/// instance and the bound parameters.
pub trait UnitInstance: Send {
    fn call(
        &mut self,
        method: &str,
        params: &mut ParameterBinding,
        cancel: &CancelToken,
    ) -> Result<Value, Fault>;

    /// Current state, shown in feedback and passed to equality predicates.
    fn snapshot(&self) -> Value;
}

/// Native function entry point. May mutate its parameters in place.
pub type NativeFn =
    Arc<dyn Fn(&mut ParameterBinding, &CancelToken) -> Result<Value, Fault> + Send + Sync>;

/// Constructor for a class-style unit.
pub type Constructor =
    Arc<dyn Fn(&ParameterBinding) -> Result<Box<dyn UnitInstance>, Fault> + Send + Sync>;

/// An external command speaking the line-delimited JSON entry protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ProcessCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split a shell-like command line on whitespace. Returns `None` when empty.
    pub fn parse(command_line: &str) -> Option<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }
}

/// A resolvable callable.
#[derive(Clone)]
pub enum EntryPoint {
    Function(NativeFn),
    /// Class-style unit: the constructor builds the instance the method runs on.
    Method(Constructor),
    /// External process. Stateless from the engine's point of view; class-style
    /// state is carried through the protocol as JSON.
    Process(ProcessCommand),
}

impl EntryPoint {
    pub fn kind(&self) -> &'static str {
        match self {
            EntryPoint::Function(_) => "function",
            EntryPoint::Method(_) => "method",
            EntryPoint::Process(_) => "process",
        }
    }
}

impl fmt::Debug for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryPoint::Process(cmd) => f.debug_tuple("Process").field(cmd).finish(),
            other => f.write_str(other.kind()),
        }
    }
}

/// Name → entry-point table for one implementation (reference or candidate).
#[derive(Debug, Clone, Default)]
pub struct Registry {
    entries: BTreeMap<String, EntryPoint>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, entry: EntryPoint) -> &mut Self {
        self.entries.insert(name.into(), entry);
        self
    }

    pub fn register_fn<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&mut ParameterBinding, &CancelToken) -> Result<Value, Fault> + Send + Sync + 'static,
    {
        self.register(name, EntryPoint::Function(Arc::new(f)))
    }

    pub fn register_method<F>(&mut self, name: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(&ParameterBinding) -> Result<Box<dyn UnitInstance>, Fault> + Send + Sync + 'static,
    {
        self.register(name, EntryPoint::Method(Arc::new(constructor)))
    }

    pub fn register_process(
        &mut self,
        name: impl Into<String>,
        command: ProcessCommand,
    ) -> &mut Self {
        self.register(name, EntryPoint::Process(command))
    }

    pub fn get(&self, name: &str) -> Option<&EntryPoint> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_resolve() {
        let mut registry = Registry::new();
        registry
            .register_fn("double", |params, _| {
                let n = params.get("n").and_then(Value::as_i64).unwrap_or(0);
                Ok(Value::Int(n * 2))
            })
            .register_process("ext", ProcessCommand::new("cat", vec![]));

        assert!(registry.contains("double"));
        assert_eq!(registry.get("ext").map(EntryPoint::kind), Some("process"));
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["double", "ext"]);
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_process_command_parse() {
        let cmd = ProcessCommand::parse("python3  solver.py --fast").unwrap();
        assert_eq!(cmd.program, "python3");
        assert_eq!(cmd.args, vec!["solver.py", "--fast"]);
        assert!(ProcessCommand::parse("   ").is_none());
    }
}
