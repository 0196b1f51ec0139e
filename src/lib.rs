//! Skillforge
//!
//! Durable, namespaced skill storage for agents, with a sandboxed Python
//! execution engine that both consumes and produces skills.
//!
//! # Features
//!
//! - **Skill Store**: one authoritative SQLite row per (namespace, category, name)
//! - **Hydration**: deterministic clear-and-rebuild of an importable working tree
//! - **Dependency Extraction**: capability references found in skill source
//! - **Execution Engine**: per-call process or container isolates with limits
//! - **Lifecycle**: execute, materialize synchronously, persist in the background
//! - **Checkpoints**: task state resumed through a stored entry-point skill
//!
//! # Architecture
//!
//! ```text
//! Agent ──► SkillCoordinator ──► ExecutionEngine ──► isolate (python -I | docker run)
//!                │                                      │ capability bridge
//!                ├── Materializer (working tree) ◄──────┘ imports `skills`, `servers`
//!                ├── SkillStore (SQLite)
//!                ├── CheckpointStore (SQLite)
//!                └── TelemetrySink (tracing + SQLite)
//! ```

pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod lifecycle;
pub mod sandbox;
pub mod skills;
pub mod telemetry;

pub use checkpoint::{Checkpoint, CheckpointStatus, CheckpointStore, EntryPoint};
pub use config::{Config, SyntaxCheckMode};
pub use coordinator::{PersistHandle, RunOutcome, RunRequest, SaveReceipt, SaveRequest, SkillCoordinator};
pub use error::{Result, SkillError};
pub use lifecycle::{Lifecycle, LifecycleState};
pub use sandbox::{
    BackendKind, CapabilityDispatcher, CapabilityRegistry, EngineSettings, ErrorKind, ExecutionContext,
    ExecutionEngine, ExecutionError, ExecutionLimits, ExecutionResult, IsolationMode,
};
pub use skills::{
    CapabilityRef, HydrationReport, Materializer, Namespace, SkillIdentity, SkillRecord, SkillStats, SkillStore,
};
pub use telemetry::{FanoutSink, MemorySink, SqliteSink, TelemetryEvent, TelemetrySink, TracingSink};
