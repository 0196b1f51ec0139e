//! Container isolate driven through the docker CLI.
//!
//! Mounts:
//!
//! | host | isolate | mode |
//! |---|---|---|
//! | API root | `/workspace/servers` | ro |
//! | namespace working tree | `/workspace/skills` | ro, rw when skill writes are allowed |
//! | scratch | `/workspace/scratch` | rw |

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use super::harness::{HARNESS_FILE, SPEC_FILE};
use super::{BackendKind, ErrorKind, IsolateBackend, IsolatePaths, IsolateRun};

const WORKSPACE_SERVERS: &str = "/workspace/servers";
const WORKSPACE_SKILLS: &str = "/workspace/skills";
const WORKSPACE_SCRATCH: &str = "/workspace/scratch";

/// Exit status docker reports for a container killed by SIGKILL (OOM)
const EXIT_OOM_KILLED: i32 = 137;
const PIDS_LIMIT: u32 = 256;
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSettings {
    /// Container CLI (`docker`, or a compatible one such as `podman`)
    pub runtime: String,
    pub image: String,
    pub network: String,
    /// Interpreter inside the image
    pub python: String,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            image: "python:3.12-slim".to_string(),
            network: "none".to_string(),
            python: "python3".to_string(),
        }
    }
}

async fn quiet_status(runtime: &str, args: &[&str]) -> Result<ExitStatus, String> {
    let mut cmd = Command::new(runtime);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    match tokio::time::timeout(PROBE_TIMEOUT, cmd.status()).await {
        Ok(Ok(status)) => Ok(status),
        Ok(Err(e)) => Err(format!("{} not runnable: {}", runtime, e)),
        Err(_) => Err(format!("{} {} timed out", runtime, args.join(" "))),
    }
}

/// Check that the runtime answers and the image is present locally
pub async fn probe(settings: &ContainerSettings) -> Result<(), String> {
    let info = quiet_status(&settings.runtime, &["info"]).await?;
    if !info.success() {
        return Err(format!("{} info failed ({})", settings.runtime, info));
    }
    let image = quiet_status(&settings.runtime, &["image", "inspect", settings.image.as_str()]).await?;
    if !image.success() {
        return Err(format!("image {} not available locally", settings.image));
    }
    Ok(())
}

pub struct ContainerBackend {
    settings: ContainerSettings,
}

impl ContainerBackend {
    pub fn new(settings: ContainerSettings) -> Self {
        Self { settings }
    }

    fn container_name(run: &IsolateRun) -> String {
        format!("skillforge-{}", run.id)
    }
}

#[async_trait]
impl IsolateBackend for ContainerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    fn paths(&self, _run: &IsolateRun) -> IsolatePaths {
        IsolatePaths {
            api_root: PathBuf::from(WORKSPACE_SERVERS),
            skills_root: PathBuf::from(WORKSPACE_SKILLS),
            scratch: PathBuf::from(WORKSPACE_SCRATCH),
        }
    }

    fn limits_in_harness(&self) -> bool {
        false
    }

    fn command(&self, run: &IsolateRun) -> std::io::Result<Command> {
        let meta = std::fs::metadata(&run.scratch)?;
        let memory = format!("{}m", run.limits.memory_mb.max(6));
        let cpus = if run.limits.cpu_share.is_finite() && run.limits.cpu_share > 0.0 {
            run.limits.cpu_share.max(0.01)
        } else {
            1.0
        };
        let skills_mode = if run.skills_writable { "rw" } else { "ro" };

        let mut cmd = Command::new(&self.settings.runtime);
        cmd.arg("run")
            .arg("--rm")
            .arg("--name")
            .arg(Self::container_name(run))
            .arg("--memory")
            .arg(&memory)
            .arg("--memory-swap")
            .arg(&memory)
            .arg("--cpus")
            .arg(format!("{:.2}", cpus))
            .arg("--pids-limit")
            .arg(PIDS_LIMIT.to_string())
            .arg("--network")
            .arg(&self.settings.network)
            .arg("--user")
            .arg(format!("{}:{}", meta.uid(), meta.gid()))
            .arg("-e")
            .arg(format!("HOME={}", WORKSPACE_SCRATCH))
            .arg("-v")
            .arg(format!("{}:{}:ro", run.api_root.display(), WORKSPACE_SERVERS))
            .arg("-v")
            .arg(format!("{}:{}:{}", run.skills_root.display(), WORKSPACE_SKILLS, skills_mode))
            .arg("-v")
            .arg(format!("{}:{}:rw", run.scratch.display(), WORKSPACE_SCRATCH))
            .arg("-w")
            .arg(WORKSPACE_SCRATCH)
            .arg(&self.settings.image)
            .arg(&self.settings.python)
            .arg("-I")
            .arg("-B")
            .arg("-X")
            .arg("utf8")
            .arg(format!("{}/{}", WORKSPACE_SCRATCH, HARNESS_FILE))
            .arg(format!("{}/{}", WORKSPACE_SCRATCH, SPEC_FILE));
        Ok(cmd)
    }

    fn isolate_id(&self, run: &IsolateRun, _pid: Option<u32>) -> String {
        Self::container_name(run)
    }

    fn classify_exit(&self, status: &ExitStatus) -> Option<ErrorKind> {
        match status.code() {
            Some(EXIT_OOM_KILLED) => Some(ErrorKind::ResourceExceeded),
            _ => None,
        }
    }

    async fn teardown(&self, run: &IsolateRun, _pid: Option<u32>) {
        let name = Self::container_name(run);
        match quiet_status(&self.settings.runtime, &["rm", "-f", name.as_str()]).await {
            Ok(_) => debug!("Removed container {}", name),
            Err(e) => warn!("Container teardown for {} failed: {}", name, e),
        }
    }
}
