//! Process isolate: one `python -I` child per execution.
//!
//! The child starts in its own process group with a cleared environment.
//! Memory and CPU ceilings are applied by the harness through `setrlimit`;
//! teardown kills the whole group so helpers the code spawned do not outlive
//! the run.

use async_trait::async_trait;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use tracing::debug;

use super::harness::{HARNESS_FILE, SPEC_FILE};
use super::{BackendKind, ErrorKind, IsolateBackend, IsolatePaths, IsolateRun};

const SIGKILL: i32 = 9;
const SIGXCPU: i32 = 24;

/// Environment variables passed through to the isolate
const PASSTHROUGH_ENV: &[&str] = &["PATH", "LANG", "LC_ALL", "TZ"];

/// Niceness for a CPU share: a full CPU runs at 0, a tiny share at 19
pub(crate) fn nice_level(cpu_share: f64) -> i32 {
    let share = if cpu_share.is_finite() {
        cpu_share.clamp(0.0, 1.0)
    } else {
        1.0
    };
    ((1.0 - share) * 19.0).round() as i32
}

pub struct ProcessBackend {
    python: String,
}

impl ProcessBackend {
    pub fn new(python: impl Into<String>) -> Self {
        Self {
            python: python.into(),
        }
    }
}

#[async_trait]
impl IsolateBackend for ProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Process
    }

    fn paths(&self, run: &IsolateRun) -> IsolatePaths {
        IsolatePaths {
            api_root: run.api_root.clone(),
            skills_root: run.skills_root.clone(),
            scratch: run.scratch.clone(),
        }
    }

    fn limits_in_harness(&self) -> bool {
        true
    }

    fn command(&self, run: &IsolateRun) -> std::io::Result<Command> {
        let mut cmd = Command::new(&self.python);
        cmd.arg("-I")
            .arg("-B")
            .arg("-X")
            .arg("utf8")
            .arg(run.scratch.join(HARNESS_FILE))
            .arg(run.scratch.join(SPEC_FILE))
            .current_dir(&run.scratch)
            .env_clear()
            .env("HOME", &run.scratch)
            .process_group(0);

        for var in PASSTHROUGH_ENV {
            if let Ok(value) = std::env::var(var) {
                cmd.env(var, value);
            }
        }
        Ok(cmd)
    }

    fn isolate_id(&self, _run: &IsolateRun, pid: Option<u32>) -> String {
        pid.map(|p| p.to_string()).unwrap_or_default()
    }

    fn classify_exit(&self, status: &ExitStatus) -> Option<ErrorKind> {
        // Timeouts are classified before this is consulted, so a SIGKILL
        // here came from the kernel (OOM) or the hard RLIMIT_CPU.
        match status.signal() {
            Some(SIGKILL) | Some(SIGXCPU) => Some(ErrorKind::ResourceExceeded),
            _ => None,
        }
    }

    async fn teardown(&self, run: &IsolateRun, pid: Option<u32>) {
        let Some(pid) = pid else { return };
        let result = Command::new("kill")
            .arg("-KILL")
            .arg("--")
            .arg(format!("-{}", pid))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Ok(status) = result {
            if status.success() {
                debug!("Killed leftover processes of isolate {}", run.id);
            }
        }
    }
}
