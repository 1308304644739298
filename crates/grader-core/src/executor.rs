//! Trial execution with deadline enforcement and fault isolation.
//!
//! Candidate calls run off the orchestrating task and are raced against a
//! deadline with `tokio::time::timeout`:
//!
//! - with a [`WorkerHost`] attached, native callables run inside a trial worker
//!   process; on timeout the worker is killed and reaped, and the next call
//!   starts a fresh one.
//! - without one, native callables run on a dedicated OS thread; a panic is
//!   caught and reported as [`Outcome::Raised`]. On timeout the thread's
//!   [`CancelToken`] is tripped and its result is discarded. A thread cannot
//!   be killed, so this mode is for code that honours its token.
//! - process callables are spawned with `kill_on_drop`; on timeout the child
//!   is killed and reaped.
//!
//! Reference calls are trusted: they run inline, without a deadline.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::Fault;
use crate::params::ParameterBinding;
use crate::registry::{EntryPoint, ProcessCommand, UnitInstance};
use crate::value::Value;
use crate::worker::{HostFailure, HostedOutcome, WorkerHost, WorkerLauncher};

/// Cooperative cancellation flag handed to native callables.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Result of one bounded call.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Returned { value: Value, duration: Duration },
    TimedOut { limit: Duration },
    Raised(Fault),
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        !matches!(self, Outcome::Returned { .. })
    }

    pub fn duration(&self) -> Option<Duration> {
        match self {
            Outcome::Returned { duration, .. } => Some(*duration),
            _ => None,
        }
    }
}

/// A constructed class-style instance.
pub enum LiveInstance {
    Native(Box<dyn UnitInstance>),
    /// State of a process-backed instance, round-tripped through the protocol.
    Remote(Value),
    /// Instance living in a trial worker, with its last snapshot.
    Hosted { handle: u64, state: Value },
}

impl LiveInstance {
    pub fn snapshot(&self) -> Value {
        match self {
            LiveInstance::Native(instance) => instance.snapshot(),
            LiveInstance::Remote(state) | LiveInstance::Hosted { state, .. } => state.clone(),
        }
    }
}

impl std::fmt::Debug for LiveInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LiveInstance::Native(_) => f.write_str("LiveInstance::Native"),
            LiveInstance::Remote(state) => f.debug_tuple("LiveInstance::Remote").field(state).finish(),
            LiveInstance::Hosted { handle, state } => f
                .debug_struct("LiveInstance::Hosted")
                .field("handle", handle)
                .field("state", state)
                .finish(),
        }
    }
}

/// What a bounded candidate call hands back.
///
/// `params` and `instance` are `None` when the call timed out or panicked:
/// whatever state the callable held is gone.
#[derive(Debug)]
pub struct CallResult {
    pub outcome: Outcome,
    pub params: Option<ParameterBinding>,
    pub instance: Option<LiveInstance>,
}

impl CallResult {
    fn failed(outcome: Outcome) -> Self {
        Self {
            outcome,
            params: None,
            instance: None,
        }
    }
}

/// Outcome of [`run_isolated`], plus any state the job returned.
#[derive(Debug)]
pub struct Execution<T> {
    pub outcome: Outcome,
    pub recovered: Option<T>,
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Run `job` on a dedicated thread and wait at most `deadline` for it.
///
/// Duration is measured inside the worker around the job only.
pub async fn run_isolated<T, F>(deadline: Duration, job: F) -> Execution<T>
where
    F: FnOnce(&CancelToken) -> (Result<Value, Fault>, T) + Send + 'static,
    T: Send + 'static,
{
    let cancel = CancelToken::new();
    let worker_cancel = cancel.clone();
    let (tx, rx) = tokio::sync::oneshot::channel();

    let spawned = std::thread::Builder::new()
        .name("grader-trial".to_string())
        .spawn(move || {
            let start = Instant::now();
            let result = catch_unwind(AssertUnwindSafe(move || job(&worker_cancel)));
            let elapsed = start.elapsed();
            let _ = tx.send((result, elapsed));
        });

    if let Err(e) = spawned {
        return Execution {
            outcome: Outcome::Raised(Fault::new(format!("failed to spawn trial worker: {e}"))),
            recovered: None,
        };
    }

    match tokio::time::timeout(deadline, rx).await {
        Ok(Ok((Ok((result, state)), duration))) => Execution {
            outcome: match result {
                Ok(value) => Outcome::Returned { value, duration },
                Err(fault) => Outcome::Raised(fault),
            },
            recovered: Some(state),
        },
        Ok(Ok((Err(payload), _))) => Execution {
            outcome: Outcome::Raised(Fault::new(format!(
                "panicked: {}",
                panic_message(payload.as_ref())
            ))),
            recovered: None,
        },
        Ok(Err(_closed)) => Execution {
            outcome: Outcome::Raised(Fault::new("trial worker exited without reporting")),
            recovered: None,
        },
        Err(_elapsed) => {
            cancel.cancel();
            warn!(limit_ms = deadline.as_millis() as u64, "trial worker abandoned after deadline");
            Execution {
                outcome: Outcome::TimedOut { limit: deadline },
                recovered: None,
            }
        }
    }
}

/// Executes entry points for the trial sequencer and the timing harness.
#[derive(Debug, Clone)]
pub struct TrialExecutor {
    deadline: Duration,
    host: Option<Arc<WorkerHost>>,
}

impl TrialExecutor {
    pub fn new(deadline: Duration) -> Self {
        Self {
            deadline,
            host: None,
        }
    }

    /// Run native candidate code for `submission` in killable worker processes.
    pub fn hosted(mut self, launcher: WorkerLauncher, submission: impl Into<String>) -> Self {
        self.host = Some(Arc::new(WorkerHost::new(launcher, submission)));
        self
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn is_hosted(&self) -> bool {
        self.host.is_some()
    }

    /// Call an untrusted entry point under the deadline.
    pub async fn execute(
        &self,
        entry: &EntryPoint,
        name: &str,
        instance: Option<LiveInstance>,
        params: ParameterBinding,
    ) -> CallResult {
        if let (Some(host), EntryPoint::Function(_) | EntryPoint::Method(_)) = (&self.host, entry) {
            return self.execute_hosted(host, entry, name, instance, params).await;
        }
        match (entry, instance) {
            (EntryPoint::Function(f), _) => {
                let f = Arc::clone(f);
                let run = run_isolated(self.deadline, move |cancel| {
                    let mut params = params;
                    let result = f(&mut params, cancel);
                    (result, params)
                })
                .await;
                CallResult {
                    outcome: run.outcome,
                    params: run.recovered,
                    instance: None,
                }
            }
            (EntryPoint::Method(_), Some(LiveInstance::Native(instance))) => {
                let method = name.to_string();
                let run = run_isolated(self.deadline, move |cancel| {
                    let mut instance = instance;
                    let mut params = params;
                    let result = instance.call(&method, &mut params, cancel);
                    (result, (params, instance))
                })
                .await;
                let (params, instance) = match run.recovered {
                    Some((params, instance)) => (Some(params), Some(LiveInstance::Native(instance))),
                    None => (None, None),
                };
                CallResult {
                    outcome: run.outcome,
                    params,
                    instance,
                }
            }
            (EntryPoint::Process(cmd), instance) => {
                let state = match instance {
                    Some(LiveInstance::Remote(state)) => Some(state),
                    Some(_) => {
                        return CallResult::failed(Outcome::Raised(Fault::new(format!(
                            "process entry point {name} cannot drive a native instance"
                        ))));
                    }
                    None => None,
                };
                let request = call_request(name, &params, state.as_ref());
                match exchange(cmd, &request, Some(self.deadline)).await {
                    Ok((reply, duration)) => {
                        let params = reply
                            .params
                            .and_then(ParameterBinding::from_json)
                            .unwrap_or(params);
                        let instance = match (reply.instance, state) {
                            (Some(next), _) => Some(LiveInstance::Remote(Value::from_json(next))),
                            (None, Some(previous)) => Some(LiveInstance::Remote(previous)),
                            (None, None) => None,
                        };
                        CallResult {
                            outcome: Outcome::Returned {
                                value: Value::from_json(reply.ok),
                                duration,
                            },
                            params: Some(params),
                            instance,
                        }
                    }
                    Err(ProcessFailure::TimedOut) => CallResult::failed(Outcome::TimedOut {
                        limit: self.deadline,
                    }),
                    Err(ProcessFailure::Fault(fault)) => CallResult::failed(Outcome::Raised(fault)),
                }
            }
            (EntryPoint::Method(_), _) => CallResult::failed(Outcome::Raised(Fault::new(format!(
                "no live instance to call {name} on"
            )))),
        }
    }

    /// Construct an untrusted class-style instance under the deadline.
    ///
    /// On success the outcome carries the instance snapshot.
    pub async fn construct(
        &self,
        entry: &EntryPoint,
        name: &str,
        params: ParameterBinding,
    ) -> CallResult {
        if let (Some(host), EntryPoint::Method(_)) = (&self.host, entry) {
            let answered = host.construct(name, params, self.deadline).await;
            return self.hosted_result(answered, None);
        }
        match entry {
            EntryPoint::Method(constructor) => {
                let constructor = Arc::clone(constructor);
                let run = run_isolated(self.deadline, move |_cancel| match constructor(&params) {
                    Ok(instance) => (Ok(instance.snapshot()), Some(instance)),
                    Err(fault) => (Err(fault), None),
                })
                .await;
                CallResult {
                    outcome: run.outcome,
                    params: None,
                    instance: run.recovered.flatten().map(LiveInstance::Native),
                }
            }
            EntryPoint::Process(cmd) => {
                let request = construct_request(name, &params);
                match exchange(cmd, &request, Some(self.deadline)).await {
                    Ok((reply, duration)) => {
                        let state = Value::from_json(reply.ok);
                        CallResult {
                            outcome: Outcome::Returned {
                                value: state.clone(),
                                duration,
                            },
                            params: None,
                            instance: Some(LiveInstance::Remote(state)),
                        }
                    }
                    Err(ProcessFailure::TimedOut) => CallResult::failed(Outcome::TimedOut {
                        limit: self.deadline,
                    }),
                    Err(ProcessFailure::Fault(fault)) => CallResult::failed(Outcome::Raised(fault)),
                }
            }
            EntryPoint::Function(_) => CallResult::failed(Outcome::Raised(Fault::new(format!(
                "{name} is a plain function, not a class-style unit"
            )))),
        }
    }

    async fn execute_hosted(
        &self,
        host: &WorkerHost,
        entry: &EntryPoint,
        name: &str,
        instance: Option<LiveInstance>,
        params: ParameterBinding,
    ) -> CallResult {
        let (handle, previous) = match (entry, instance) {
            (EntryPoint::Method(_), Some(LiveInstance::Hosted { handle, state })) => {
                (Some(handle), Some(state))
            }
            (EntryPoint::Method(_), _) => {
                return CallResult::failed(Outcome::Raised(Fault::new(format!(
                    "no live instance to call {name} on"
                ))));
            }
            _ => (None, None),
        };
        let answered = host.call(name, params, handle, self.deadline).await;
        self.hosted_result(answered, previous)
    }

    fn hosted_result(
        &self,
        answered: Result<HostedOutcome, HostFailure>,
        previous: Option<Value>,
    ) -> CallResult {
        match answered {
            Ok(HostedOutcome::Returned {
                value,
                params,
                instance,
                duration_ns,
            }) => CallResult {
                outcome: Outcome::Returned {
                    value,
                    duration: Duration::from_nanos(duration_ns),
                },
                params,
                instance: instance.map(|(handle, state)| LiveInstance::Hosted { handle, state }),
            },
            Ok(HostedOutcome::Raised { message, instance }) => CallResult {
                outcome: Outcome::Raised(Fault::new(message)),
                params: None,
                instance: instance.zip(previous).map(|(handle, state)| LiveInstance::Hosted { handle, state }),
            },
            Ok(HostedOutcome::Ready) => CallResult::failed(Outcome::Raised(Fault::new(
                "trial worker answered a call with a greeting",
            ))),
            Err(HostFailure::TimedOut) => CallResult::failed(Outcome::TimedOut {
                limit: self.deadline,
            }),
            Err(HostFailure::Fault(fault)) => CallResult::failed(Outcome::Raised(fault)),
        }
    }

    /// Call a trusted entry point inline, without a deadline.
    pub async fn execute_trusted(
        &self,
        entry: &EntryPoint,
        name: &str,
        instance: Option<&mut LiveInstance>,
        params: &mut ParameterBinding,
    ) -> Result<(Value, Duration), Fault> {
        match (entry, instance) {
            (EntryPoint::Function(f), _) => {
                let cancel = CancelToken::new();
                let start = Instant::now();
                let result = catch_unwind(AssertUnwindSafe(|| f(params, &cancel)))
                    .map_err(|payload| Fault::new(format!("panicked: {}", panic_message(payload.as_ref()))))?;
                let duration = start.elapsed();
                result.map(|value| (value, duration))
            }
            (EntryPoint::Method(_), Some(LiveInstance::Native(instance))) => {
                let cancel = CancelToken::new();
                let start = Instant::now();
                let result = catch_unwind(AssertUnwindSafe(|| instance.call(name, params, &cancel)))
                    .map_err(|payload| Fault::new(format!("panicked: {}", panic_message(payload.as_ref()))))?;
                let duration = start.elapsed();
                result.map(|value| (value, duration))
            }
            (EntryPoint::Process(cmd), instance) => {
                let state = match instance {
                    Some(LiveInstance::Remote(state)) => Some(state),
                    Some(_) => {
                        return Err(Fault::new(format!(
                            "process entry point {name} cannot drive a native instance"
                        )));
                    }
                    None => None,
                };
                let request = call_request(name, params, state.as_deref());
                let (reply, duration) = exchange(cmd, &request, None).await.map_err(|failure| match failure {
                    ProcessFailure::Fault(fault) => fault,
                    ProcessFailure::TimedOut => Fault::new("trusted process timed out"),
                })?;
                if let Some(next) = reply.params.and_then(ParameterBinding::from_json) {
                    *params = next;
                }
                if let (Some(next), Some(state)) = (reply.instance, state) {
                    *state = Value::from_json(next);
                }
                Ok((Value::from_json(reply.ok), duration))
            }
            (EntryPoint::Method(_), _) => Err(Fault::new(format!("no live instance to call {name} on"))),
        }
    }

    /// Construct a trusted class-style instance inline.
    pub async fn construct_trusted(
        &self,
        entry: &EntryPoint,
        name: &str,
        params: &ParameterBinding,
    ) -> Result<LiveInstance, Fault> {
        match entry {
            EntryPoint::Method(constructor) => catch_unwind(AssertUnwindSafe(|| constructor(params)))
                .map_err(|payload| Fault::new(format!("panicked: {}", panic_message(payload.as_ref()))))?
                .map(LiveInstance::Native),
            EntryPoint::Process(cmd) => {
                let request = construct_request(name, params);
                let (reply, _) = exchange(cmd, &request, None).await.map_err(|failure| match failure {
                    ProcessFailure::Fault(fault) => fault,
                    ProcessFailure::TimedOut => Fault::new("trusted process timed out"),
                })?;
                Ok(LiveInstance::Remote(Value::from_json(reply.ok)))
            }
            EntryPoint::Function(_) => Err(Fault::new(format!(
                "{name} is a plain function, not a class-style unit"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// External process protocol
// ---------------------------------------------------------------------------

enum ProcessFailure {
    TimedOut,
    Fault(Fault),
}

struct ProcessReply {
    ok: serde_json::Value,
    params: Option<serde_json::Value>,
    instance: Option<serde_json::Value>,
}

fn call_request(name: &str, params: &ParameterBinding, state: Option<&Value>) -> serde_json::Value {
    let mut request = serde_json::json!({
        "entry": name,
        "params": params.to_json(),
    });
    if let (Some(state), Some(fields)) = (state, request.as_object_mut()) {
        fields.insert("instance".to_string(), state.to_json());
    }
    request
}

fn construct_request(name: &str, params: &ParameterBinding) -> serde_json::Value {
    serde_json::json!({
        "construct": name,
        "params": params.to_json(),
    })
}

/// Send one request line, wait for the process to exit, parse the last
/// non-empty stdout line as the reply.
async fn exchange(
    cmd: &ProcessCommand,
    request: &serde_json::Value,
    deadline: Option<Duration>,
) -> Result<(ProcessReply, Duration), ProcessFailure> {
    let mut payload = serde_json::to_vec(request)
        .map_err(|e| ProcessFailure::Fault(Fault::new(format!("cannot encode request: {e}"))))?;
    payload.push(b'\n');

    let mut child = Command::new(&cmd.program)
        .args(&cmd.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ProcessFailure::Fault(Fault::new(format!("cannot start {}: {e}", cmd.program))))?;

    let start = Instant::now();
    let stdin = child.stdin.take();
    let conversation = async move {
        if let Some(mut stdin) = stdin {
            // The child may exit without reading; its reply decides the outcome.
            let _ = stdin.write_all(&payload).await;
            let _ = stdin.shutdown().await;
        }
        child.wait_with_output().await
    };

    let output = match deadline {
        Some(limit) => match tokio::time::timeout(limit, conversation).await {
            Ok(output) => output,
            Err(_elapsed) => {
                debug!(program = %cmd.program, "process exceeded deadline and was killed");
                return Err(ProcessFailure::TimedOut);
            }
        },
        None => conversation.await,
    }
    .map_err(|e| ProcessFailure::Fault(Fault::new(format!("process i/o failed: {e}"))))?;
    let duration = start.elapsed();

    let stdout = String::from_utf8_lossy(&output.stdout);
    let reply_line = stdout.lines().rev().find(|line| !line.trim().is_empty());
    let reply: Option<serde_json::Value> = reply_line.and_then(|line| serde_json::from_str(line).ok());

    match reply {
        Some(serde_json::Value::Object(mut fields)) => {
            if let Some(error) = fields.remove("error") {
                let message = match error {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                return Err(ProcessFailure::Fault(Fault::new(message)));
            }
            match fields.remove("ok") {
                Some(ok) => Ok((
                    ProcessReply {
                        ok,
                        params: fields.remove("params"),
                        instance: fields.remove("instance"),
                    },
                    duration,
                )),
                None => Err(ProcessFailure::Fault(Fault::new(
                    "process reply has neither \"ok\" nor \"error\"",
                ))),
            }
        }
        _ if !output.status.success() => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(ProcessFailure::Fault(Fault::new(format!(
                "process exited with {}: {}",
                output.status,
                stderr.trim()
            ))))
        }
        _ => Err(ProcessFailure::Fault(Fault::new(format!(
            "malformed process reply: {}",
            reply_line.unwrap_or("<empty>")
        )))),
    }
}
