//! Configuration management
//!
//! Values come from `SKILLFORGE_*` environment variables. When
//! `SKILLFORGE_CONFIG` names a TOML file, that file supplies the base values
//! and the environment overrides them. The namespace has no default.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, SkillError};
use crate::sandbox::{ContainerSettings, EngineSettings, ExecutionLimits, IsolationMode};
use crate::skills::{Namespace, SyntaxChecker};

/// Write-time syntax validation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyntaxCheckMode {
    /// Lexical check plus the interpreter's parser
    Interpreter,
    Lexical,
}

impl FromStr for SyntaxCheckMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "interpreter" => Ok(Self::Interpreter),
            "lexical" => Ok(Self::Lexical),
            other => Err(format!("unknown syntax check mode '{}'", other)),
        }
    }
}

/// Optional TOML file; every key may be omitted
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    namespace: Option<String>,
    db_path: Option<String>,
    skills_dir: Option<String>,
    servers_dir: Option<String>,
    scratch_dir: Option<String>,
    telemetry_db: Option<String>,
    isolation: Option<IsolationMode>,
    python: Option<String>,
    container_runtime: Option<String>,
    container_image: Option<String>,
    container_network: Option<String>,
    timeout_secs: Option<u64>,
    memory_mb: Option<u64>,
    cpu_share: Option<f64>,
    syntax_check: Option<SyntaxCheckMode>,
    max_capability_calls: Option<usize>,
    store_busy_timeout_ms: Option<u64>,
}

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Owning agent; scopes every store query and the working tree
    pub namespace: Namespace,

    /// SQLite database holding skills and checkpoints
    pub db_path: PathBuf,

    /// Base of the working trees (`<skills_dir>/<namespace>/`)
    pub skills_dir: PathBuf,

    /// Generated API surface
    pub servers_dir: PathBuf,

    /// Parent of per-run scratch directories (system temp when unset)
    pub scratch_dir: Option<PathBuf>,

    /// Telemetry database (log-only telemetry when unset)
    pub telemetry_db: Option<PathBuf>,

    pub isolation: IsolationMode,
    pub python: String,
    pub container_runtime: String,
    pub container_image: String,
    pub container_network: String,

    /// Execution wall-clock ceiling in seconds
    pub timeout_secs: u64,
    pub memory_mb: u64,
    pub cpu_share: f64,

    pub syntax_check: SyntaxCheckMode,

    /// Concurrent capability dispatches per isolate
    pub max_capability_calls: usize,

    /// How long a store write waits on a locked database
    pub store_busy_timeout_ms: u64,
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| SkillError::Config(format!("{}={:?}: {}", key, value, e)))
}

fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("skillforge")
        .join("skills.db")
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let file = match env("SKILLFORGE_CONFIG") {
            Some(path) => Self::read_file(&expand(&path))?,
            None => FileConfig::default(),
        };

        let namespace = env("SKILLFORGE_NAMESPACE")
            .or(file.namespace)
            .ok_or_else(|| SkillError::Config("SKILLFORGE_NAMESPACE is required".to_string()))?;
        let namespace =
            Namespace::new(namespace).map_err(|e| SkillError::Config(e.to_string()))?;

        let path_of = |key: &str, from_file: Option<String>| env(key).or(from_file).map(|p| expand(&p));

        let db_path = path_of("SKILLFORGE_DB_PATH", file.db_path).unwrap_or_else(default_db_path);
        let skills_dir =
            path_of("SKILLFORGE_SKILLS_DIR", file.skills_dir).unwrap_or_else(|| PathBuf::from("./skills"));
        let servers_dir = path_of("SKILLFORGE_SERVERS_DIR", file.servers_dir)
            .unwrap_or_else(|| PathBuf::from("./servers"));
        let scratch_dir = path_of("SKILLFORGE_SCRATCH_DIR", file.scratch_dir);
        let telemetry_db = path_of("SKILLFORGE_TELEMETRY_DB", file.telemetry_db);

        let isolation: IsolationMode = match env("SKILLFORGE_ISOLATION") {
            Some(v) => parse_value("SKILLFORGE_ISOLATION", &v)?,
            None => file.isolation.unwrap_or_default(),
        };
        let syntax_check: SyntaxCheckMode = match env("SKILLFORGE_SYNTAX_CHECK") {
            Some(v) => parse_value("SKILLFORGE_SYNTAX_CHECK", &v)?,
            None => file.syntax_check.unwrap_or(SyntaxCheckMode::Interpreter),
        };

        let timeout_secs: u64 = match env("SKILLFORGE_TIMEOUT_SECS") {
            Some(v) => parse_value("SKILLFORGE_TIMEOUT_SECS", &v)?,
            None => file.timeout_secs.unwrap_or(300),
        };
        let memory_mb: u64 = match env("SKILLFORGE_MEMORY_MB") {
            Some(v) => parse_value("SKILLFORGE_MEMORY_MB", &v)?,
            None => file.memory_mb.unwrap_or(512),
        };
        let cpu_share: f64 = match env("SKILLFORGE_CPU_SHARE") {
            Some(v) => parse_value("SKILLFORGE_CPU_SHARE", &v)?,
            None => file.cpu_share.unwrap_or(0.5),
        };
        let max_capability_calls: usize = match env("SKILLFORGE_MAX_CAPABILITY_CALLS") {
            Some(v) => parse_value("SKILLFORGE_MAX_CAPABILITY_CALLS", &v)?,
            None => file.max_capability_calls.unwrap_or(8),
        };
        let store_busy_timeout_ms: u64 = match env("SKILLFORGE_STORE_BUSY_TIMEOUT_MS") {
            Some(v) => parse_value("SKILLFORGE_STORE_BUSY_TIMEOUT_MS", &v)?,
            None => file.store_busy_timeout_ms.unwrap_or(5000),
        };

        if timeout_secs == 0 {
            return Err(SkillError::Config("timeout_secs must be positive".to_string()));
        }
        if !(cpu_share.is_finite() && cpu_share > 0.0) {
            return Err(SkillError::Config(format!("cpu_share must be positive, got {}", cpu_share)));
        }

        Ok(Self {
            namespace,
            db_path,
            skills_dir,
            servers_dir,
            scratch_dir,
            telemetry_db,
            isolation,
            python: env("SKILLFORGE_PYTHON")
                .or(file.python)
                .unwrap_or_else(|| "python3".to_string()),
            container_runtime: env("SKILLFORGE_CONTAINER_RUNTIME")
                .or(file.container_runtime)
                .unwrap_or_else(|| "docker".to_string()),
            container_image: env("SKILLFORGE_CONTAINER_IMAGE")
                .or(file.container_image)
                .unwrap_or_else(|| "python:3.12-slim".to_string()),
            container_network: env("SKILLFORGE_CONTAINER_NETWORK")
                .or(file.container_network)
                .unwrap_or_else(|| "none".to_string()),
            timeout_secs,
            memory_mb,
            cpu_share,
            syntax_check,
            max_capability_calls,
            store_busy_timeout_ms,
        })
    }

    fn read_file(path: &Path) -> Result<FileConfig> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SkillError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        toml::from_str(&text)
            .map_err(|e| SkillError::Config(format!("invalid {}: {}", path.display(), e)))
    }

    pub fn limits(&self) -> ExecutionLimits {
        ExecutionLimits {
            timeout: Duration::from_secs(self.timeout_secs),
            memory_mb: self.memory_mb,
            cpu_share: self.cpu_share,
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            mode: self.isolation,
            python: self.python.clone(),
            container: ContainerSettings {
                runtime: self.container_runtime.clone(),
                image: self.container_image.clone(),
                network: self.container_network.clone(),
                ..ContainerSettings::default()
            },
        }
    }

    pub fn syntax_checker(&self) -> SyntaxChecker {
        match self.syntax_check {
            SyntaxCheckMode::Interpreter => SyntaxChecker::interpreter(self.python.clone()),
            SyntaxCheckMode::Lexical => SyntaxChecker::Lexical,
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.store_busy_timeout_ms)
    }
}
