//! Runs accepted submissions under a deadline and an output budget.
//!
//! Every submission runs in a fresh worker process: the binary re-executes
//! itself as `codebox worker` with rlimits applied and the job on stdin. The
//! worker reports back as JSON lines on its stdout. The deadline starts when
//! the worker says the program compiled, and the worker is killed when it
//! passes. The address-space rlimit is the run's memory budget.

use std::io::{Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::capabilities::CapabilitySet;
use crate::capture::{clamp, Capture, ExecutionResult};
use crate::config::{Limits, SandboxConfig, WorkerLimits};
use crate::error::SandboxError;
use crate::gatekeeper::{inspect, GatePolicy, Inspection, Rejection};
use crate::runtime::{run_submission, Outcome, OutputSink, WORKER_STACK_BYTES};

/// Stack of the thread that parses and screens a submission.
pub const GATE_STACK_BYTES: usize = 64 * 1024 * 1024;

/// Time a worker gets to start its interpreter and compile the program.
pub const STARTUP_LIMIT: Duration = Duration::from_secs(5);

/// Worker stderr kept for classifying crashes.
const STDERR_KEEP: usize = 64 * 1024;

/// Everything a worker needs to run one submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub code: String,
    pub capabilities: Vec<String>,
    pub limits: Limits,
}

impl Job {
    pub fn new(code: &str, capabilities: &CapabilitySet, limits: &Limits) -> Self {
        Self {
            code: code.to_string(),
            capabilities: capabilities.names().map(str::to_string).collect(),
            limits: limits.clone(),
        }
    }
}

/// One line of the worker's stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// Compiled; the deadline starts now.
    Ready,
    /// Program output the worker's own capture accepted.
    Output { text: String },
    /// Program output was cut.
    Truncated,
    Finished {
        stderr: String,
        failed: bool,
        truncated: bool,
    },
}

/// Result of one submission plus the gatekeeper's verdict when it refused it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Evaluation {
    pub result: ExecutionResult,
    pub rejection: Option<Rejection>,
}

impl Evaluation {
    /// The refusal is the transcript, bounded like any other output.
    fn rejected(rejection: Rejection, limits: &Limits) -> Self {
        let message = clamp(&rejection.message, limits.output_bytes);
        let result = ExecutionResult {
            stdout: message.to_string(),
            failed: true,
            truncated: message.len() < rejection.message.len(),
            ..ExecutionResult::default()
        };
        Self {
            result,
            rejection: Some(rejection),
        }
    }

    fn ran(result: ExecutionResult) -> Self {
        Self {
            result,
            rejection: None,
        }
    }

    pub fn transcript(&self) -> String {
        self.result.transcript()
    }
}

/// Gatekeeper, then a worker process.
pub async fn evaluate(code: &str, config: &SandboxConfig, limits: Limits) -> Evaluation {
    match screen(code, &config.policy).await {
        Ok(Inspection::Accept) => {}
        Ok(Inspection::Reject(rejection)) => return Evaluation::rejected(rejection, &limits),
        Ok(Inspection::Malformed(err)) => {
            let mut capture = Capture::new(limits.output_bytes);
            capture.write_diagnostic(&err.render(code));
            return Evaluation::ran(capture.finish(true, false));
        }
        Err(err) => return Evaluation::ran(internal_failure(&err, &limits)),
    }
    let exe = match worker_exe(config) {
        Ok(exe) => exe,
        Err(err) => return Evaluation::ran(internal_failure(&err, &limits)),
    };
    Evaluation::ran(run(code, &config.capabilities, &limits, &config.worker, &exe).await)
}

fn worker_exe(config: &SandboxConfig) -> Result<PathBuf, SandboxError> {
    match &config.worker_exe {
        Some(path) => Ok(path.clone()),
        None => std::env::current_exe().map_err(SandboxError::Spawn),
    }
}

/// Runs the gatekeeper on its own thread. Parsing, walking and dropping a
/// syntax tree all recurse with the nesting of the submission.
async fn screen(code: &str, policy: &GatePolicy) -> Result<Inspection, SandboxError> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    let source = code.to_string();
    let policy = policy.clone();
    std::thread::Builder::new()
        .name("codebox-gate".to_string())
        .stack_size(GATE_STACK_BYTES)
        .spawn(move || {
            let verdict = panic::catch_unwind(AssertUnwindSafe(|| inspect(&source, &policy)));
            let _ = tx.send(verdict.map_err(|payload| panic_message(payload.as_ref())));
        })
        .map_err(SandboxError::Spawn)?;

    match rx.await {
        Ok(Ok(inspection)) => Ok(inspection),
        Ok(Err(message)) => Err(SandboxError::Panicked("gatekeeper", message)),
        Err(_) => Err(SandboxError::WorkerExited(
            "gatekeeper thread dropped its verdict".to_string(),
        )),
    }
}

pub fn timeout_notice(limits: &Limits) -> String {
    let secs = if limits.time_ms % 1000 == 0 {
        (limits.time_ms / 1000).to_string()
    } else {
        format!("{}", limits.time_ms as f64 / 1000.0)
    };
    format!("TimeoutError: execution timed out after {secs} seconds\n")
}

/// Reported to the student instead of an HTTP error.
fn internal_failure(err: &SandboxError, limits: &Limits) -> ExecutionResult {
    error!(error = %err, "Sandbox failure");
    let mut capture = Capture::new(limits.output_bytes);
    capture.write_diagnostic(&format!("InternalError: {err}\n"));
    capture.finish(true, false)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs accepted code in a worker process started from `exe`.
pub async fn run(
    code: &str,
    capabilities: &CapabilitySet,
    limits: &Limits,
    worker: &WorkerLimits,
    exe: &Path,
) -> ExecutionResult {
    match run_worker(code, capabilities, limits, worker, exe).await {
        Ok(result) => result,
        Err(err) => internal_failure(&err, limits),
    }
}

/// Why the parent stopped reading worker events.
enum Stop {
    Finished {
        stderr: String,
        failed: bool,
        truncated: bool,
    },
    Deadline,
    Eof,
}

/// How a worker that never reported died.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Crash {
    OutOfMemory,
    StackOverflow,
    Killed,
}

fn worker_command(exe: &Path, limits: &Limits, worker: &WorkerLimits) -> Command {
    let mut command = Command::new(exe);
    command
        .arg("worker")
        .env_clear()
        .current_dir("/")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(target_os = "linux")]
    {
        // CPU time is a backstop; the wall clock normally ends the run first.
        let cpu_secs = limits.time_ms.div_ceil(1000) + 2;
        let worker = worker.clone();
        // SAFETY: setrlimit is async-signal-safe and touches no shared state.
        unsafe {
            command.pre_exec(move || apply_rlimits(cpu_secs, &worker).map_err(std::io::Error::from));
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = (limits, worker);

    command
}

#[cfg(target_os = "linux")]
fn apply_rlimits(cpu_secs: u64, worker: &WorkerLimits) -> nix::Result<()> {
    use nix::sys::resource::{setrlimit, Resource};

    setrlimit(Resource::RLIMIT_CPU, cpu_secs, cpu_secs)?;
    let mem_bytes = worker.mem_kb * 1024;
    setrlimit(Resource::RLIMIT_AS, mem_bytes, mem_bytes)?;
    let fsize_bytes = worker.fsize_kb * 1024;
    setrlimit(Resource::RLIMIT_FSIZE, fsize_bytes, fsize_bytes)?;
    setrlimit(Resource::RLIMIT_NOFILE, worker.nofile, worker.nofile)?;
    setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
    Ok(())
}

async fn run_worker(
    code: &str,
    capabilities: &CapabilitySet,
    limits: &Limits,
    worker: &WorkerLimits,
    exe: &Path,
) -> Result<ExecutionResult, SandboxError> {
    let payload = serde_json::to_vec(&Job::new(code, capabilities, limits))
        .map_err(SandboxError::WorkerReply)?;

    let mut child = worker_command(exe, limits, worker)
        .spawn()
        .map_err(SandboxError::Spawn)?;
    debug!(pid = ?child.id(), "Spawned worker process");

    let (Some(mut stdin), Some(stdout), Some(stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        return Err(SandboxError::WorkerExited("worker pipes unavailable".to_string()));
    };
    stdin.write_all(&payload).await.map_err(SandboxError::WorkerIo)?;
    drop(stdin);

    let stderr_task = tokio::spawn(async move {
        let mut kept = Vec::new();
        let _ = stderr.take(STDERR_KEEP as u64).read_to_end(&mut kept).await;
        String::from_utf8_lossy(&kept).into_owned()
    });

    let mut capture = Capture::new(limits.output_bytes);
    let mut lines = BufReader::new(stdout).lines();
    let mut deadline = Instant::now() + STARTUP_LIMIT;
    let mut started = false;

    let stop = loop {
        let line = match tokio::time::timeout_at(deadline, lines.next_line()).await {
            Ok(line) => line.map_err(SandboxError::WorkerIo)?,
            Err(_) => break Stop::Deadline,
        };
        let Some(line) = line else {
            break Stop::Eof;
        };
        match serde_json::from_str(&line).map_err(SandboxError::WorkerReply)? {
            WorkerEvent::Ready => {
                started = true;
                deadline = Instant::now() + limits.time_limit();
            }
            WorkerEvent::Output { text } => {
                capture.write_stdout(&text);
            }
            WorkerEvent::Truncated => capture.mark_truncated(),
            WorkerEvent::Finished {
                stderr,
                failed,
                truncated,
            } => {
                break Stop::Finished {
                    stderr,
                    failed,
                    truncated,
                }
            }
        }
    };

    match stop {
        Stop::Finished {
            stderr,
            failed,
            truncated,
        } => {
            // The reply is complete; the worker only has to exit.
            let _ = child.kill().await;
            if truncated {
                capture.mark_truncated();
            }
            capture.write_diagnostic(&stderr);
            Ok(capture.finish(failed, false))
        }
        Stop::Deadline => {
            let _ = child.kill().await;
            if !started {
                return Err(SandboxError::StartupTimeout(STARTUP_LIMIT));
            }
            warn!(time_ms = limits.time_ms, "Worker process missed its deadline, killed");
            capture.write_diagnostic(&timeout_notice(limits));
            Ok(capture.finish(true, true))
        }
        Stop::Eof => {
            let status = child.wait().await.map_err(SandboxError::WorkerIo)?;
            let stderr = stderr_task.await.unwrap_or_default();
            match classify_crash(&status, &stderr) {
                Some(Crash::OutOfMemory) => {
                    warn!(mem_kb = worker.mem_kb, "Worker process ran out of memory");
                    capture.write_diagnostic("MemoryError\n");
                    Ok(capture.finish(true, false))
                }
                Some(Crash::StackOverflow) => {
                    warn!("Worker process overflowed its stack");
                    capture.write_diagnostic("RecursionError: maximum recursion depth exceeded\n");
                    Ok(capture.finish(true, false))
                }
                Some(Crash::Killed) if started => {
                    warn!(time_ms = limits.time_ms, "Worker process hit its CPU limit");
                    capture.write_diagnostic(&timeout_notice(limits));
                    Ok(capture.finish(true, true))
                }
                _ => {
                    let err = SandboxError::WorkerExited(format!("{status}: {}", stderr.trim()));
                    error!(error = %err, "Sandbox failure");
                    capture.write_diagnostic(&format!("InternalError: {err}\n"));
                    Ok(capture.finish(true, false))
                }
            }
        }
    }
}

fn classify_crash(status: &ExitStatus, stderr: &str) -> Option<Crash> {
    const OUT_OF_MEMORY: &[&str] = &["memory allocation of", "capacity overflow", "out of memory"];
    if OUT_OF_MEMORY.iter().any(|marker| stderr.contains(marker)) {
        return Some(Crash::OutOfMemory);
    }
    if stderr.contains("overflowed its stack") {
        return Some(Crash::StackOverflow);
    }
    #[cfg(target_os = "linux")]
    {
        use nix::sys::signal::Signal;
        use std::os::unix::process::ExitStatusExt;

        match status.signal() {
            Some(sig) if sig == Signal::SIGXCPU as i32 || sig == Signal::SIGKILL as i32 => {
                return Some(Crash::Killed)
            }
            _ => {}
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = status;
    None
}

/// The worker's side of the protocol: a capture like the parent's, whose
/// accepted output is streamed as events.
struct EventSink {
    capture: Mutex<Capture>,
}

impl EventSink {
    fn new(limit: usize) -> Self {
        Self {
            capture: Mutex::new(Capture::new(limit)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Capture> {
        self.capture
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn finish(&self, outcome: Outcome) {
        let mut capture = self.lock();
        let failed = match outcome {
            Outcome::Completed => false,
            Outcome::Failed(traceback) => {
                capture.write_diagnostic(&traceback);
                true
            }
        };
        let taken = std::mem::replace(&mut *capture, Capture::new(0));
        let result = taken.finish(failed, false);
        emit(&WorkerEvent::Finished {
            stderr: result.stderr,
            failed,
            truncated: result.truncated,
        });
    }
}

impl OutputSink for EventSink {
    fn stdout(&self, text: &str) {
        let mut capture = self.lock();
        let was_truncated = capture.truncated();
        let kept = capture.write_stdout(text);
        if !kept.is_empty() {
            emit(&WorkerEvent::Output {
                text: kept.to_string(),
            });
        }
        if capture.truncated() && !was_truncated {
            emit(&WorkerEvent::Truncated);
        }
    }

    fn stderr(&self, text: &str) {
        self.lock().write_diagnostic(text);
    }

    fn started(&self) {
        emit(&WorkerEvent::Ready);
    }
}

/// A vanished parent is not the worker's problem; it is killed soon after.
fn emit(event: &WorkerEvent) {
    if let Ok(line) = serde_json::to_string(event) {
        let mut stdout = std::io::stdout().lock();
        let _ = writeln!(stdout, "{line}");
        let _ = stdout.flush();
    }
}

/// Entry point of `codebox worker`: one job in on stdin, events out on
/// stdout. Returns the process exit code.
pub fn worker_main() -> i32 {
    let mut input = String::new();
    if let Err(err) = std::io::stdin().read_to_string(&mut input) {
        eprintln!("worker: reading job: {err}");
        return 2;
    }
    let job: Job = match serde_json::from_str(&input) {
        Ok(job) => job,
        Err(err) => {
            eprintln!("worker: malformed job: {err}");
            return 2;
        }
    };
    let capabilities = match CapabilitySet::from_names(&job.capabilities) {
        Ok(capabilities) => capabilities,
        Err(err) => {
            eprintln!("worker: {err}");
            return 2;
        }
    };

    let handle = std::thread::Builder::new()
        .name("codebox-worker".to_string())
        .stack_size(WORKER_STACK_BYTES)
        .spawn(move || {
            let sink = Arc::new(EventSink::new(job.limits.output_bytes));
            let outcome = run_submission(&job.code, &capabilities, &job.limits, sink.clone());
            sink.finish(outcome);
        });
    match handle.map(|h| h.join()) {
        Ok(Ok(())) => 0,
        Ok(Err(payload)) => {
            eprintln!("worker: panicked: {}", panic_message(payload.as_ref()));
            3
        }
        Err(err) => {
            eprintln!("worker: spawning interpreter thread: {err}");
            2
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatekeeper::{RejectionKind, SECURITY_REFUSAL};
    use pretty_assertions::assert_eq;

    fn limits() -> Limits {
        Limits {
            time_ms: 1_000,
            ..Limits::default()
        }
    }

    #[tokio::test]
    async fn evaluate_refuses_denylisted_code() {
        let config = SandboxConfig::default();
        let evaluation = evaluate("import os\nprint(os.getcwd())", &config, limits()).await;
        assert_eq!(evaluation.transcript(), SECURITY_REFUSAL);
        assert!(evaluation.result.failed);
        assert!(!evaluation.result.truncated);
        assert_eq!(evaluation.rejection.unwrap().kind, RejectionKind::Import);
    }

    #[tokio::test]
    async fn refusals_respect_the_output_budget() {
        let config = SandboxConfig::default();
        let limits = Limits {
            output_bytes: 16,
            ..limits()
        };
        let evaluation = evaluate("import os", &config, limits).await;
        assert_eq!(evaluation.transcript(), &SECURITY_REFUSAL[..16]);
        assert!(evaluation.result.truncated);
        assert!(evaluation.result.failed);
        assert!(evaluation.rejection.is_some());
    }

    #[tokio::test]
    async fn evaluate_reports_syntax_errors() {
        let config = SandboxConfig::default();
        let evaluation = evaluate("x = 1\nprint('hi'", &config, limits()).await;
        assert!(evaluation.rejection.is_none());
        assert!(evaluation.result.failed);
        assert!(evaluation
            .result
            .stderr
            .starts_with("  File \"<student code>\", line "));
        assert!(evaluation.result.stderr.contains("SyntaxError: "));
    }

    #[tokio::test]
    async fn deeply_nested_code_is_screened_off_the_async_stack() {
        let config = SandboxConfig::default();
        let depth = 50_000;
        let code = format!("x = {}1{}\n", "[".repeat(depth), "]".repeat(depth));
        let evaluation = evaluate(&code, &config, limits()).await;
        assert!(evaluation.result.failed);
        assert!(!evaluation.transcript().contains("InternalError"));
    }

    #[test]
    fn timeout_notice_formats_whole_and_fractional_seconds() {
        let mut limits = Limits::default();
        assert_eq!(timeout_notice(&limits), "TimeoutError: execution timed out after 2 seconds\n");
        limits.time_ms = 1500;
        assert_eq!(timeout_notice(&limits), "TimeoutError: execution timed out after 1.5 seconds\n");
    }

    #[test]
    fn worker_events_are_tagged_json_lines() {
        let line = serde_json::to_string(&WorkerEvent::Output {
            text: "4\n".to_string(),
        })
        .unwrap();
        assert_eq!(line, r#"{"event":"output","text":"4\n"}"#);
        assert_eq!(
            serde_json::from_str::<WorkerEvent>(r#"{"event":"ready"}"#).unwrap(),
            WorkerEvent::Ready
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn worker_crashes_are_classified_from_stderr() {
        use std::os::unix::process::ExitStatusExt;

        let aborted = ExitStatus::from_raw(134);
        assert_eq!(
            classify_crash(&aborted, "memory allocation of 8000000 bytes failed\n"),
            Some(Crash::OutOfMemory)
        );
        assert_eq!(
            classify_crash(
                &aborted,
                "\nthread 'codebox-worker' has overflowed its stack\nfatal runtime error: stack overflow\n"
            ),
            Some(Crash::StackOverflow)
        );
        assert_eq!(classify_crash(&ExitStatus::from_raw(9), ""), Some(Crash::Killed));
        assert_eq!(classify_crash(&ExitStatus::from_raw(3 << 8), "worker: panicked: boom\n"), None);
    }

    #[test]
    fn jobs_carry_capabilities_by_name() {
        let job = Job::new("print(1)", &CapabilitySet::minimal(), &limits());
        let json = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(
            CapabilitySet::from_names(&back.capabilities).unwrap(),
            CapabilitySet::minimal()
        );
        assert_eq!(back.limits, limits());
    }
}
