//! Out-of-process hosting for native candidate code.
//!
//! A native callable running on a thread cannot be stopped from outside. To
//! bound untrusted native code, the host binary re-executes itself as a trial
//! worker: the child serves the candidate [`Registry`] over line-delimited
//! JSON on stdin/stdout, and the parent kills it when a call overruns its
//! deadline. The next call starts a fresh worker.
//!
//! Candidate code shares the worker's stdout, so every reply starts on a
//! fresh line behind [`REPLY_MARKER`]. Anything else the worker prints,
//! including a partial line left by `print!`, is skipped by the parent.
//!
//! A binary opts in by checking [`requested`] before anything else:
//!
//! ```ignore
//! if let Some(submission) = grader_core::worker::requested() {
//!     return grader_core::worker::serve(&registry_for(&submission));
//! }
//! ```
//!
//! Class-style instances live inside the worker and are addressed by handle.
//! Killing the worker drops them; the sequencer then rebuilds on the next trial.

use std::collections::HashMap;
use std::ffi::OsString;
use std::io::{BufRead, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::Fault;
use crate::executor::{panic_message, CancelToken};
use crate::params::ParameterBinding;
use crate::registry::{EntryPoint, Registry, UnitInstance};
use crate::value::Value;

/// Environment variable carrying the submission id a worker should host.
pub const WORKER_ENV: &str = "GRADER_TRIAL_WORKER";

/// Prefix that frames every reply line the worker sends.
pub const REPLY_MARKER: &str = "@@grader-reply@@";

/// Time a freshly spawned worker gets to announce itself.
pub const WORKER_STARTUP: Duration = Duration::from_secs(30);

/// Submission id this process was launched to host, if it is a trial worker.
pub fn requested() -> Option<String> {
    std::env::var(WORKER_ENV).ok().filter(|id| !id.is_empty())
}

/// How to start a trial worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerLauncher {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl WorkerLauncher {
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Re-execute the running binary with `args`.
    pub fn current_exe<I, S>(args: I) -> std::io::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Ok(Self::new(std::env::current_exe()?, args))
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Action {
    Construct,
    Call { instance: Option<u64> },
}

#[derive(Debug, Serialize, Deserialize)]
struct Request {
    seq: u64,
    unit: String,
    params: ParameterBinding,
    action: Action,
}

/// What the worker answered for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum HostedOutcome {
    Ready,
    Returned {
        value: Value,
        params: Option<ParameterBinding>,
        /// Handle and snapshot of the instance the call ran on or built.
        instance: Option<(u64, Value)>,
        duration_ns: u64,
    },
    Raised {
        message: String,
        /// Handle of an instance that survived the fault.
        instance: Option<u64>,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct Reply {
    seq: u64,
    outcome: HostedOutcome,
}

// ---------------------------------------------------------------------------
// Worker side
// ---------------------------------------------------------------------------

struct HostedUnits<'a> {
    registry: &'a Registry,
    /// One live instance per class-style unit, with its handle.
    instances: HashMap<String, (u64, Box<dyn UnitInstance>)>,
    next_handle: u64,
}

impl HostedUnits<'_> {
    fn handle(&mut self, request: Request) -> HostedOutcome {
        let Request {
            unit,
            mut params,
            action,
            ..
        } = request;
        match (self.registry.get(&unit), action) {
            (Some(EntryPoint::Method(constructor)), Action::Construct) => {
                let start = Instant::now();
                match catch_unwind(AssertUnwindSafe(|| constructor(&params))) {
                    Ok(Ok(instance)) => {
                        let duration_ns = start.elapsed().as_nanos() as u64;
                        self.next_handle += 1;
                        let handle = self.next_handle;
                        let snapshot = instance.snapshot();
                        self.instances.insert(unit, (handle, instance));
                        HostedOutcome::Returned {
                            value: snapshot.clone(),
                            params: None,
                            instance: Some((handle, snapshot)),
                            duration_ns,
                        }
                    }
                    Ok(Err(fault)) => raised(fault.message, None),
                    Err(payload) => raised(format!("panicked: {}", panic_message(payload.as_ref())), None),
                }
            }
            (Some(EntryPoint::Function(f)), Action::Call { .. }) => {
                let cancel = CancelToken::new();
                let start = Instant::now();
                let result = catch_unwind(AssertUnwindSafe(|| f(&mut params, &cancel)));
                let duration_ns = start.elapsed().as_nanos() as u64;
                match result {
                    Ok(Ok(value)) => HostedOutcome::Returned {
                        value,
                        params: Some(params),
                        instance: None,
                        duration_ns,
                    },
                    Ok(Err(fault)) => raised(fault.message, None),
                    Err(payload) => raised(format!("panicked: {}", panic_message(payload.as_ref())), None),
                }
            }
            (Some(EntryPoint::Method(_)), Action::Call { instance: Some(handle) }) => {
                let Some((live, mut instance)) = self.instances.remove(&unit) else {
                    return raised(format!("no live instance to call {unit} on"), None);
                };
                if live != handle {
                    self.instances.insert(unit.clone(), (live, instance));
                    return raised(format!("instance {handle} of {unit} is no longer live"), None);
                }
                let cancel = CancelToken::new();
                let start = Instant::now();
                let result =
                    catch_unwind(AssertUnwindSafe(|| instance.call(&unit, &mut params, &cancel)));
                let duration_ns = start.elapsed().as_nanos() as u64;
                match result {
                    Ok(Ok(value)) => {
                        let snapshot = instance.snapshot();
                        self.instances.insert(unit, (handle, instance));
                        HostedOutcome::Returned {
                            value,
                            params: Some(params),
                            instance: Some((handle, snapshot)),
                            duration_ns,
                        }
                    }
                    Ok(Err(fault)) => {
                        self.instances.insert(unit, (handle, instance));
                        raised(fault.message, Some(handle))
                    }
                    // A panicking instance is discarded.
                    Err(payload) => raised(format!("panicked: {}", panic_message(payload.as_ref())), None),
                }
            }
            (Some(EntryPoint::Method(_)), Action::Call { instance: None }) => {
                raised(format!("no live instance to call {unit} on"), None)
            }
            (Some(EntryPoint::Function(_)), Action::Construct) => raised(
                format!("{unit} is a plain function, not a class-style unit"),
                None,
            ),
            (Some(EntryPoint::Process(_)), _) => {
                raised(format!("{unit} is a process entry point and cannot be hosted"), None)
            }
            (None, _) => raised(format!("{unit} is not registered in this worker"), None),
        }
    }
}

fn raised(message: impl Into<String>, instance: Option<u64>) -> HostedOutcome {
    HostedOutcome::Raised {
        message: message.into(),
        instance,
    }
}

fn send(out: &mut impl Write, reply: &Reply) -> std::io::Result<()> {
    let json = serde_json::to_string(reply).map_err(std::io::Error::other)?;
    // The leading newline ends whatever partial line the candidate left behind.
    let line = format!("\n{REPLY_MARKER}{json}\n");
    out.write_all(line.as_bytes())?;
    out.flush()
}

/// The framed reply carried by `line`, if any.
fn framed(line: &str) -> Option<&str> {
    line.find(REPLY_MARKER)
        .map(|at| &line[at + REPLY_MARKER.len()..])
}

/// Serve requests for `registry` on stdin/stdout until stdin closes.
pub fn serve(registry: &Registry) -> std::io::Result<()> {
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    let mut units = HostedUnits {
        registry,
        instances: HashMap::new(),
        next_handle: 0,
    };

    send(
        &mut stdout,
        &Reply {
            seq: 0,
            outcome: HostedOutcome::Ready,
        },
    )?;

    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                let seq = request.seq;
                Reply {
                    seq,
                    outcome: units.handle(request),
                }
            }
            Err(e) => Reply {
                seq: 0,
                outcome: raised(format!("malformed worker request: {e}"), None),
            },
        };
        send(&mut stdout, &reply)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Parent side
// ---------------------------------------------------------------------------

pub(crate) enum HostFailure {
    TimedOut,
    Fault(Fault),
}

struct RunningWorker {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    line: Vec<u8>,
    next_seq: u64,
}

impl RunningWorker {
    /// Next protocol reply. Output the worker's own code printed is skipped.
    async fn next_reply(&mut self) -> Result<Reply, Fault> {
        loop {
            self.line.clear();
            match self.stdout.read_until(b'\n', &mut self.line).await {
                Ok(0) => return Err(Fault::new("trial worker exited")),
                Ok(_) => {}
                Err(e) => return Err(Fault::new(format!("trial worker i/o failed: {e}"))),
            }
            // Candidates may print arbitrary bytes; replies are always UTF-8.
            let line = String::from_utf8_lossy(&self.line);
            let line = line.trim_end_matches(['\n', '\r']);
            let Some(json) = framed(line) else {
                if !line.is_empty() {
                    debug!(line = %line, "skipping non-protocol worker output");
                }
                continue;
            };
            return serde_json::from_str::<Reply>(json)
                .map_err(|e| Fault::new(format!("malformed trial worker reply: {e}")));
        }
    }

    async fn round_trip(&mut self, mut request: Request) -> Result<HostedOutcome, Fault> {
        self.next_seq += 1;
        request.seq = self.next_seq;
        let mut line = serde_json::to_string(&request)
            .map_err(|e| Fault::new(format!("cannot encode worker request: {e}")))?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Fault::new(format!("trial worker i/o failed: {e}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| Fault::new(format!("trial worker i/o failed: {e}")))?;

        loop {
            let reply = self.next_reply().await?;
            if reply.seq == request.seq {
                return Ok(reply.outcome);
            }
            debug!(expected = request.seq, got = reply.seq, "discarding stale worker reply");
        }
    }

    async fn kill(mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

/// A lazily started worker for one submission, replaced after every kill.
pub struct WorkerHost {
    launcher: WorkerLauncher,
    submission: String,
    slot: Mutex<Option<RunningWorker>>,
}

impl WorkerHost {
    pub fn new(launcher: WorkerLauncher, submission: impl Into<String>) -> Self {
        Self {
            launcher,
            submission: submission.into(),
            slot: Mutex::new(None),
        }
    }

    pub fn submission(&self) -> &str {
        &self.submission
    }

    async fn launch(&self) -> Result<RunningWorker, Fault> {
        let mut child = Command::new(&self.launcher.program)
            .args(&self.launcher.args)
            .env(WORKER_ENV, &self.submission)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Fault::new(format!(
                    "cannot start trial worker {}: {e}",
                    self.launcher.program.display()
                ))
            })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(Fault::new("trial worker pipes unavailable"));
        };
        let mut worker = RunningWorker {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            line: Vec::new(),
            next_seq: 0,
        };

        match tokio::time::timeout(WORKER_STARTUP, worker.next_reply()).await {
            Ok(Ok(Reply {
                outcome: HostedOutcome::Ready,
                ..
            })) => {
                debug!(submission = %self.submission, pid = ?worker.child.id(), "trial worker ready");
                Ok(worker)
            }
            Ok(Ok(other)) => {
                worker.kill().await;
                Err(Fault::new(format!("unexpected trial worker greeting: {:?}", other.outcome)))
            }
            Ok(Err(fault)) => {
                worker.kill().await;
                Err(fault)
            }
            Err(_elapsed) => {
                worker.kill().await;
                Err(Fault::new("trial worker did not start in time"))
            }
        }
    }

    async fn request(
        &self,
        unit: &str,
        params: ParameterBinding,
        action: Action,
        deadline: Duration,
    ) -> Result<HostedOutcome, HostFailure> {
        let mut slot = self.slot.lock().await;
        if slot.is_none() {
            *slot = Some(self.launch().await.map_err(HostFailure::Fault)?);
        }
        let worker = slot
            .as_mut()
            .ok_or_else(|| HostFailure::Fault(Fault::new("trial worker unavailable")))?;

        let request = Request {
            seq: 0,
            unit: unit.to_string(),
            params,
            action,
        };
        let answered = tokio::time::timeout(deadline, worker.round_trip(request)).await;
        match answered {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(fault)) => {
                if let Some(broken) = slot.take() {
                    broken.kill().await;
                }
                Err(HostFailure::Fault(fault))
            }
            Err(_elapsed) => {
                if let Some(hung) = slot.take() {
                    hung.kill().await;
                }
                warn!(
                    submission = %self.submission,
                    unit,
                    limit_ms = deadline.as_millis() as u64,
                    "trial worker killed after deadline"
                );
                Err(HostFailure::TimedOut)
            }
        }
    }

    pub(crate) async fn construct(
        &self,
        unit: &str,
        params: ParameterBinding,
        deadline: Duration,
    ) -> Result<HostedOutcome, HostFailure> {
        self.request(unit, params, Action::Construct, deadline).await
    }

    pub(crate) async fn call(
        &self,
        unit: &str,
        params: ParameterBinding,
        instance: Option<u64>,
        deadline: Duration,
    ) -> Result<HostedOutcome, HostFailure> {
        self.request(unit, params, Action::Call { instance }, deadline)
            .await
    }
}

impl std::fmt::Debug for WorkerHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHost")
            .field("launcher", &self.launcher)
            .field("submission", &self.submission)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::RunningTotal;

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .register_fn("double", |params, _| {
                let n = params.get("n").and_then(Value::as_i64).unwrap_or(0);
                Ok(Value::Int(n * 2))
            })
            .register_fn("explode", |_, _| panic!("kaboom"))
            .register_method("add", |_| Ok(Box::new(RunningTotal::new(0)) as Box<dyn UnitInstance>));
        registry
    }

    fn request(unit: &str, params: ParameterBinding, action: Action) -> Request {
        Request {
            seq: 1,
            unit: unit.to_string(),
            params,
            action,
        }
    }

    #[test]
    fn test_hosted_function_returns_value_and_params() {
        let registry = registry();
        let mut units = HostedUnits {
            registry: &registry,
            instances: HashMap::new(),
            next_handle: 0,
        };
        let outcome = units.handle(request(
            "double",
            ParameterBinding::new().with("n", 21i64),
            Action::Call { instance: None },
        ));
        match outcome {
            HostedOutcome::Returned { value, params, .. } => {
                assert_eq!(value, Value::Int(42));
                assert_eq!(params.unwrap().get("n"), Some(&Value::Int(21)));
            }
            other => panic!("expected Returned, got {other:?}"),
        }
    }

    #[test]
    fn test_hosted_panic_is_raised() {
        let registry = registry();
        let mut units = HostedUnits {
            registry: &registry,
            instances: HashMap::new(),
            next_handle: 0,
        };
        let outcome = units.handle(request(
            "explode",
            ParameterBinding::new(),
            Action::Call { instance: None },
        ));
        assert!(matches!(outcome, HostedOutcome::Raised { message, .. } if message.contains("kaboom")));
    }

    #[test]
    fn test_hosted_instance_is_addressed_by_handle() {
        let registry = registry();
        let mut units = HostedUnits {
            registry: &registry,
            instances: HashMap::new(),
            next_handle: 0,
        };
        let HostedOutcome::Returned {
            instance: Some((handle, _)),
            ..
        } = units.handle(request("add", ParameterBinding::new(), Action::Construct))
        else {
            panic!("construction should succeed");
        };

        fn add(units: &mut HostedUnits<'_>, handle: u64) -> HostedOutcome {
            units.handle(request(
                "add",
                ParameterBinding::new().with("x", 4i64),
                Action::Call {
                    instance: Some(handle),
                },
            ))
        }
        add(&mut units, handle);
        match add(&mut units, handle) {
            HostedOutcome::Returned { value, .. } => assert_eq!(value, Value::Int(8)),
            other => panic!("expected Returned, got {other:?}"),
        }
        assert!(matches!(add(&mut units, handle + 1), HostedOutcome::Raised { .. }));
    }

    #[test]
    fn test_reply_is_framed_on_its_own_line() {
        let mut out = b"partial candidate output".to_vec();
        send(
            &mut out,
            &Reply {
                seq: 3,
                outcome: HostedOutcome::Ready,
            },
        )
        .unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "partial candidate output");
        let reply: Reply = serde_json::from_str(framed(lines[1]).unwrap()).unwrap();
        assert_eq!(reply.seq, 3);
        assert_eq!(reply.outcome, HostedOutcome::Ready);
    }

    #[test]
    fn test_framed_reply_found_behind_foreign_prefix() {
        let line = format!("test trial_worker_entry ... {REPLY_MARKER}{{\"seq\":0,\"outcome\":\"ready\"}}");
        let reply: Reply = serde_json::from_str(framed(&line).unwrap()).unwrap();
        assert_eq!(reply.outcome, HostedOutcome::Ready);
        assert!(framed(r#"{"seq":0,"outcome":"ready"}"#).is_none());
    }

    #[test]
    fn test_reply_round_trips_tagged_values() {
        let reply = Reply {
            seq: 7,
            outcome: HostedOutcome::Returned {
                value: Value::tuple([Value::set([1i64, 2]), Value::Float(0.5)]),
                params: None,
                instance: None,
                duration_ns: 12,
            },
        };
        let line = serde_json::to_string(&reply).unwrap();
        let back: Reply = serde_json::from_str(&line).unwrap();
        assert_eq!(back.seq, 7);
        assert_eq!(back.outcome, reply.outcome);
    }
}
