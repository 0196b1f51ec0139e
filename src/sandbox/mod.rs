//! Sandboxed Execution Engine
//!
//! Runs agent-authored Python in a fresh isolate per call:
//!
//! - **Process isolate**: `python -I` child in its own process group, with
//!   `RLIMIT_AS`, an `RLIMIT_CPU` backstop and a nice level derived from the
//!   CPU share.
//! - **Container isolate**: `docker run` with memory, CPU and pid limits,
//!   no network, the API surface mounted read-only.
//!
//! Both backends share the same pipeline: scratch directory, harness,
//! optional capability bridge, wall-clock timeout, report parsing, and an
//! unconditional teardown. Failures of the executed code are data in
//! [`ExecutionResult`], never an `Err`.
//!
//! The isolation is meant for well-intentioned but possibly buggy code. It
//! is not a security boundary against hostile payloads.

pub mod bridge;
pub mod container;
pub mod harness;
pub mod process;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use bridge::{CapabilityDispatcher, CapabilityRegistry};
pub use container::{ContainerBackend, ContainerSettings};
pub use process::ProcessBackend;

use bridge::CapabilityBridge;
use harness::{HarnessReport, RunSpec, BRIDGE_SOCKET, HARNESS_FILE, HARNESS_PY, REPORT_FILE, SPEC_FILE};

/// How long stdout/stderr readers may run on after the isolate exits
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Resource ceilings for one execution
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLimits {
    /// Wall-clock ceiling; the isolate is killed when it is exceeded
    pub timeout: Duration,
    pub memory_mb: u64,
    /// Fraction of one CPU
    pub cpu_share: f64,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            memory_mb: 512,
            cpu_share: 0.5,
        }
    }
}

/// Everything an isolate may see, besides the source text
#[derive(Clone)]
pub struct ExecutionContext {
    /// Namespace working tree, importable as `skills`
    pub skills_root: PathBuf,
    /// Generated API surface, importable as `servers`
    pub api_root: PathBuf,
    /// Parent for per-run scratch directories (system temp when None)
    pub scratch_root: Option<PathBuf>,
    pub limits: ExecutionLimits,
    /// Mount the working tree read-write (container isolates)
    pub skills_writable: bool,
    /// Bound as `__inputs__`
    pub inputs: Option<Value>,
    /// Function called with `inputs` as keyword arguments after the module body
    pub entry_function: Option<String>,
    pub capabilities: Option<Arc<dyn CapabilityDispatcher>>,
    pub max_capability_calls: usize,
}

impl ExecutionContext {
    pub fn new(skills_root: impl Into<PathBuf>, api_root: impl Into<PathBuf>) -> Self {
        Self {
            skills_root: skills_root.into(),
            api_root: api_root.into(),
            scratch_root: None,
            limits: ExecutionLimits::default(),
            skills_writable: false,
            inputs: None,
            entry_function: None,
            capabilities: None,
            max_capability_calls: 8,
        }
    }

    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.limits.timeout = timeout;
        self
    }

    pub fn with_inputs(mut self, inputs: Value) -> Self {
        self.inputs = Some(inputs);
        self
    }

    pub fn with_entry_function(mut self, function: impl Into<String>) -> Self {
        self.entry_function = Some(function.into());
        self
    }

    pub fn with_capabilities(mut self, dispatcher: Arc<dyn CapabilityDispatcher>) -> Self {
        self.capabilities = Some(dispatcher);
        self
    }

    pub fn with_scratch_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(dir.into());
        self
    }
}

/// Failure classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Wall-clock ceiling exceeded; the isolate was killed
    Timeout,
    /// Memory or CPU ceiling hit
    ResourceExceeded,
    /// The executed code raised
    ExecutionFault,
    /// The isolate could not be started or produced no report
    IsolateFailure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub kind: ErrorKind,
    /// Exception type name (`ValueError`, `TimeoutError`, ...)
    pub type_name: String,
    pub message: String,
    pub traceback: String,
    /// Line in the executed source, when known
    pub line: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Process,
    Container,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub return_value: Option<Value>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub error: Option<ExecutionError>,
    pub backend: BackendKind,
    /// Pid (process) or container name
    pub isolate_id: String,
}

impl ExecutionResult {
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    fn isolate_failure(backend: BackendKind, message: String, duration: Duration) -> Self {
        Self {
            success: false,
            return_value: None,
            stdout: String::new(),
            stderr: String::new(),
            duration,
            error: Some(ExecutionError {
                kind: ErrorKind::IsolateFailure,
                type_name: "IsolateFailure".to_string(),
                message,
                traceback: String::new(),
                line: None,
            }),
            backend,
            isolate_id: String::new(),
        }
    }
}

/// Isolation strategy requested at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    /// Container when available, else process
    #[default]
    Auto,
    Process,
    Container,
}

impl std::str::FromStr for IsolationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "process" => Ok(Self::Process),
            "container" | "docker" => Ok(Self::Container),
            other => Err(format!("unknown isolation mode '{}'", other)),
        }
    }
}

/// Per-run state shared with the backend
#[derive(Debug, Clone)]
pub struct IsolateRun {
    /// Short unique run id
    pub id: String,
    /// Host path of the scratch directory
    pub scratch: PathBuf,
    pub skills_root: PathBuf,
    pub api_root: PathBuf,
    pub limits: ExecutionLimits,
    pub skills_writable: bool,
}

/// Paths as seen from inside the isolate
#[derive(Debug, Clone)]
pub struct IsolatePaths {
    pub api_root: PathBuf,
    pub skills_root: PathBuf,
    pub scratch: PathBuf,
}

/// One way of running the harness in isolation
#[async_trait]
pub trait IsolateBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn paths(&self, run: &IsolateRun) -> IsolatePaths;

    /// Whether the harness itself applies rlimits and niceness
    fn limits_in_harness(&self) -> bool;

    /// Command that runs `harness.py run.json`; stdio is set by the engine
    fn command(&self, run: &IsolateRun) -> std::io::Result<Command>;

    fn isolate_id(&self, run: &IsolateRun, pid: Option<u32>) -> String;

    /// Resource classification of an exit that left no report
    fn classify_exit(&self, status: &ExitStatus) -> Option<ErrorKind>;

    /// Remove everything the isolate may have left running
    async fn teardown(&self, run: &IsolateRun, pid: Option<u32>);
}

/// Engine settings resolved from configuration
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub mode: IsolationMode,
    pub python: String,
    pub container: ContainerSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            mode: IsolationMode::Auto,
            python: "python3".to_string(),
            container: ContainerSettings::default(),
        }
    }
}

/// Executes source in per-call isolates
#[derive(Clone)]
pub struct ExecutionEngine {
    backend: Arc<dyn IsolateBackend>,
}

impl ExecutionEngine {
    /// Select a backend, degrading from container to process when the
    /// container runtime or image is unavailable
    pub async fn new(settings: EngineSettings) -> Self {
        let backend: Arc<dyn IsolateBackend> = match settings.mode {
            IsolationMode::Process => Arc::new(ProcessBackend::new(settings.python)),
            IsolationMode::Auto | IsolationMode::Container => {
                match container::probe(&settings.container).await {
                    Ok(()) => {
                        info!("Using container isolates ({})", settings.container.image);
                        Arc::new(ContainerBackend::new(settings.container))
                    }
                    Err(reason) => {
                        warn!("Container isolation unavailable, using process isolates: {}", reason);
                        Arc::new(ProcessBackend::new(settings.python))
                    }
                }
            }
        };
        Self { backend }
    }

    /// Process isolates without probing
    pub fn process(python: impl Into<String>) -> Self {
        Self::with_backend(Arc::new(ProcessBackend::new(python)))
    }

    pub fn with_backend(backend: Arc<dyn IsolateBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Run `source` in a fresh isolate. Never fails: every problem is
    /// reported in the result.
    pub async fn execute(&self, source: &str, ctx: &ExecutionContext) -> ExecutionResult {
        let started = Instant::now();
        match self.run(source, ctx, started).await {
            Ok(result) => {
                debug!(
                    "Execution finished: success={} in {:?} ({})",
                    result.success, result.duration, result.isolate_id
                );
                result
            }
            Err(e) => {
                warn!("Isolate failure: {}", e);
                ExecutionResult::isolate_failure(self.backend.kind(), e.to_string(), started.elapsed())
            }
        }
    }

    async fn run(
        &self,
        source: &str,
        ctx: &ExecutionContext,
        started: Instant,
    ) -> std::io::Result<ExecutionResult> {
        std::fs::create_dir_all(&ctx.skills_root)?;
        std::fs::create_dir_all(&ctx.api_root)?;

        let mut builder = tempfile::Builder::new();
        builder.prefix("skillforge-");
        let scratch = match &ctx.scratch_root {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                builder.tempdir_in(dir)?
            }
            None => builder.tempdir()?,
        };

        let run = IsolateRun {
            id: Uuid::new_v4().simple().to_string()[..12].to_string(),
            scratch: scratch.path().to_path_buf(),
            skills_root: std::fs::canonicalize(&ctx.skills_root)?,
            api_root: std::fs::canonicalize(&ctx.api_root)?,
            limits: ctx.limits,
            skills_writable: ctx.skills_writable,
        };
        self.write_run_files(source, ctx, &run)?;

        let bridge = match &ctx.capabilities {
            Some(dispatcher) => Some(CapabilityBridge::bind(
                &run.scratch.join(BRIDGE_SOCKET),
                dispatcher.clone(),
                ctx.max_capability_calls,
            )?),
            None => None,
        };

        let outcome = self.supervise(&run).await;
        if let Some(bridge) = bridge {
            bridge.close().await;
        }

        let outcome = outcome?;
        let report = read_report(&run.scratch.join(REPORT_FILE));
        drop(scratch);

        Ok(self.classify(&run, outcome, report, started.elapsed()))
    }

    fn write_run_files(&self, source: &str, ctx: &ExecutionContext, run: &IsolateRun) -> std::io::Result<()> {
        let paths = self.backend.paths(run);
        let in_harness = self.backend.limits_in_harness();
        let limits = &run.limits;

        let spec = RunSpec {
            source,
            api_root: paths.api_root.to_string_lossy().into_owned(),
            skills_root: paths.skills_root.to_string_lossy().into_owned(),
            scratch: paths.scratch.to_string_lossy().into_owned(),
            result_path: paths.scratch.join(REPORT_FILE).to_string_lossy().into_owned(),
            inputs: ctx.inputs.as_ref(),
            entry_function: ctx.entry_function.as_deref(),
            bridge_socket: ctx
                .capabilities
                .as_ref()
                .map(|_| paths.scratch.join(BRIDGE_SOCKET).to_string_lossy().into_owned()),
            memory_bytes: in_harness.then(|| limits.memory_mb.saturating_mul(1024 * 1024)),
            cpu_seconds: in_harness.then(|| limits.timeout.as_secs() + 1),
            nice: if in_harness { process::nice_level(limits.cpu_share) } else { 0 },
        };

        std::fs::write(run.scratch.join(HARNESS_FILE), HARNESS_PY)?;
        let spec_json = serde_json::to_vec(&spec).map_err(std::io::Error::other)?;
        std::fs::write(run.scratch.join(SPEC_FILE), spec_json)?;
        Ok(())
    }

    /// Spawn, enforce the wall-clock ceiling, tear down, then collect output.
    /// Once the child is spawned, teardown runs on every path.
    async fn supervise(&self, run: &IsolateRun) -> std::io::Result<Supervised> {
        let mut cmd = self.backend.command(run)?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let pid = child.id();
        let stdout_task = tokio::spawn(drain(child.stdout.take()));
        let stderr_task = tokio::spawn(drain(child.stderr.take()));

        let (status, timed_out) = match tokio::time::timeout(run.limits.timeout, child.wait()).await {
            Ok(Ok(status)) => (Some(status), false),
            Ok(Err(e)) => {
                warn!("Waiting on isolate {} failed: {}", run.id, e);
                let _ = child.start_kill();
                (child.wait().await.ok(), false)
            }
            Err(_) => {
                warn!("Isolate {} exceeded {:?}, killing", run.id, run.limits.timeout);
                let _ = child.start_kill();
                (child.wait().await.ok(), true)
            }
        };
        self.backend.teardown(run, pid).await;

        let stdout = collect(stdout_task).await;
        let stderr = collect(stderr_task).await;

        Ok(Supervised {
            pid,
            status,
            timed_out,
            stdout,
            stderr,
        })
    }

    fn classify(
        &self,
        run: &IsolateRun,
        outcome: Supervised,
        report: Option<HarnessReport>,
        duration: Duration,
    ) -> ExecutionResult {
        let mut result = ExecutionResult {
            success: false,
            return_value: None,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            duration,
            error: None,
            backend: self.backend.kind(),
            isolate_id: self.backend.isolate_id(run, outcome.pid),
        };

        if outcome.timed_out {
            result.error = Some(ExecutionError {
                kind: ErrorKind::Timeout,
                type_name: "TimeoutError".to_string(),
                message: format!("execution exceeded {:?} and was terminated", run.limits.timeout),
                traceback: String::new(),
                line: None,
            });
            return result;
        }

        match report {
            Some(report) if report.success => {
                result.success = true;
                result.return_value = match report.return_value {
                    Value::Null => None,
                    value => Some(value),
                };
            }
            Some(report) => {
                let error = report.error.unwrap_or_else(|| harness::HarnessError {
                    type_name: "UnknownError".to_string(),
                    message: String::new(),
                    traceback: String::new(),
                    line: None,
                });
                let kind = if error.type_name == "MemoryError" {
                    ErrorKind::ResourceExceeded
                } else {
                    ErrorKind::ExecutionFault
                };
                result.error = Some(ExecutionError {
                    kind,
                    type_name: error.type_name,
                    message: error.message,
                    traceback: error.traceback,
                    line: error.line,
                });
            }
            None => {
                let status = outcome.status;
                let resource = status.as_ref().and_then(|s| self.backend.classify_exit(s));
                let status_text = status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "unknown status".to_string());
                result.error = Some(match resource {
                    Some(kind) => ExecutionError {
                        kind,
                        type_name: "ResourceExceeded".to_string(),
                        message: format!("isolate killed by resource limit ({})", status_text),
                        traceback: String::new(),
                        line: None,
                    },
                    None => ExecutionError {
                        kind: ErrorKind::IsolateFailure,
                        type_name: "IsolateFailure".to_string(),
                        message: format!("isolate exited with {} without a report", status_text),
                        traceback: String::new(),
                        line: None,
                    },
                });
            }
        }
        result
    }
}

struct Supervised {
    pid: Option<u32>,
    status: Option<ExitStatus>,
    timed_out: bool,
    stdout: String,
    stderr: String,
}

async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn collect(mut task: JoinHandle<String>) -> String {
    match tokio::time::timeout(PIPE_DRAIN_GRACE, &mut task).await {
        Ok(Ok(text)) => text,
        Ok(Err(_)) => String::new(),
        Err(_) => {
            task.abort();
            String::new()
        }
    }
}

fn read_report(path: &Path) -> Option<HarnessReport> {
    let text = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&text) {
        Ok(report) => Some(report),
        Err(e) => {
            warn!("Unreadable isolate report {}: {}", path.display(), e);
            None
        }
    }
}
