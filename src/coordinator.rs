//! Skill Lifecycle Coordinator
//!
//! Ties the store, working tree, execution engine and telemetry together for
//! one namespace:
//!
//! - **execute**: run agent code, then optionally save it as a skill
//! - **save_skill**: write a skill without running it
//! - **run_skill**: invoke a stored skill with inputs
//! - **checkpoint / resume**: park task state and continue it later
//!
//! Saving writes the working-tree entry synchronously and dispatches the
//! durable store write in the background. A failed durable write is reported
//! through telemetry and the [`PersistHandle`]; it never changes an
//! execution result the caller already holds.

use chrono::Utc;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::checkpoint::{Checkpoint, CheckpointStore, EntryPoint};
use crate::config::Config;
use crate::error::{Result, SkillError};
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::sandbox::{
    CapabilityDispatcher, ExecutionContext, ExecutionEngine, ExecutionLimits, ExecutionResult,
};
use crate::skills::{
    extract_dependencies, extract_docstring, normalize_tags, EntryMeta, HydrationReport,
    Materializer, Namespace, SkillIdentity, SkillRecord, SkillStats, SkillStore,
};
use crate::telemetry::{FanoutSink, SqliteSink, TelemetryEvent, TelemetrySink, TracingSink};

/// Where and how to save executed code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveRequest {
    pub category: String,
    pub name: String,
    pub tags: Vec<String>,
    /// Also write the durable store; false writes the working tree only
    pub persist: bool,
}

impl SaveRequest {
    pub fn new(category: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            name: name.into(),
            tags: Vec::new(),
            persist: true,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn without_persist(mut self) -> Self {
        self.persist = false;
        self
    }
}

/// One execute-and-optionally-persist request
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub source: String,
    /// Bound as `__inputs__` inside the isolate
    pub inputs: Option<Value>,
    /// Save the source as a skill when execution completes without raising
    pub save: Option<SaveRequest>,
    /// Overrides the coordinator's limits for this request
    pub limits: Option<ExecutionLimits>,
    /// Mount the working tree read-write
    pub skills_writable: bool,
}

impl RunRequest {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Self::default()
        }
    }

    pub fn with_inputs(mut self, inputs: Value) -> Self {
        self.inputs = Some(inputs);
        self
    }

    pub fn with_save(mut self, save: SaveRequest) -> Self {
        self.save = Some(save);
        self
    }

    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    pub fn with_skills_writable(mut self) -> Self {
        self.skills_writable = true;
        self
    }
}

/// In-flight durable write
#[derive(Debug)]
pub struct PersistHandle {
    task: JoinHandle<Result<SkillRecord>>,
}

impl PersistHandle {
    /// Wait for the store write. Telemetry has already been emitted when
    /// this returns.
    pub async fn wait(self) -> Result<SkillRecord> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(SkillError::Storage(format!("persist task failed: {}", e))),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Result of a save: the entry is already importable
#[derive(Debug)]
pub struct SaveReceipt {
    pub identity: SkillIdentity,
    /// Materialized entry directory
    pub path: PathBuf,
    /// None when the save asked for no durable write
    pub persist: Option<PersistHandle>,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub result: ExecutionResult,
    /// States visited, starting with `Pending`
    pub transitions: Vec<LifecycleState>,
    /// None when no save was requested or execution failed
    pub save: Option<Result<SaveReceipt>>,
}

impl RunOutcome {
    pub fn saved(&self) -> Option<&SaveReceipt> {
        self.save.as_ref().and_then(|s| s.as_ref().ok())
    }
}

/// Per-namespace façade over store, working tree and engine
pub struct SkillCoordinator {
    namespace: Namespace,
    store: Arc<SkillStore>,
    checkpoints: Arc<CheckpointStore>,
    materializer: Materializer,
    engine: ExecutionEngine,
    telemetry: Arc<dyn TelemetrySink>,
    api_root: PathBuf,
    scratch_root: Option<PathBuf>,
    limits: ExecutionLimits,
    capabilities: Option<Arc<dyn CapabilityDispatcher>>,
    max_capability_calls: usize,
}

impl SkillCoordinator {
    pub fn new(
        namespace: Namespace,
        store: Arc<SkillStore>,
        checkpoints: Arc<CheckpointStore>,
        materializer: Materializer,
        engine: ExecutionEngine,
        api_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            namespace,
            store,
            checkpoints,
            materializer,
            engine,
            telemetry: Arc::new(TracingSink),
            api_root: api_root.into(),
            scratch_root: None,
            limits: ExecutionLimits::default(),
            capabilities: None,
            max_capability_calls: 8,
        }
    }

    /// Open stores, probe the isolation backend, wire telemetry and
    /// hydrate the working tree
    pub async fn from_config(config: &Config) -> Result<Self> {
        let store = Arc::new(SkillStore::open_with(
            &config.db_path,
            config.syntax_checker(),
            config.busy_timeout(),
        )?);
        let checkpoints = Arc::new(CheckpointStore::open_with(&config.db_path, config.busy_timeout())?);
        let engine = ExecutionEngine::new(config.engine_settings()).await;

        let telemetry: Arc<dyn TelemetrySink> = match &config.telemetry_db {
            Some(path) => Arc::new(FanoutSink::new(vec![
                Arc::new(TracingSink) as Arc<dyn TelemetrySink>,
                Arc::new(SqliteSink::open(path)?) as Arc<dyn TelemetrySink>,
            ])),
            None => Arc::new(TracingSink),
        };

        let mut coordinator = Self::new(
            config.namespace.clone(),
            store,
            checkpoints,
            Materializer::new(&config.skills_dir),
            engine,
            &config.servers_dir,
        )
        .with_telemetry(telemetry)
        .with_limits(config.limits())
        .with_max_capability_calls(config.max_capability_calls);
        if let Some(dir) = &config.scratch_dir {
            coordinator = coordinator.with_scratch_root(dir);
        }

        // The tree on disk may be stale or missing; nothing runs before this
        let report = coordinator.hydrate()?;
        info!(
            "Startup hydration for {}: {} written, {} skipped",
            coordinator.namespace,
            report.written,
            report.skipped.len()
        );
        Ok(coordinator)
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
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

    pub fn with_max_capability_calls(mut self, max: usize) -> Self {
        self.max_capability_calls = max.max(1);
        self
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn store(&self) -> &SkillStore {
        &self.store
    }

    pub fn materializer(&self) -> &Materializer {
        &self.materializer
    }

    /// Working tree mounted as `skills`
    pub fn skills_root(&self) -> PathBuf {
        self.materializer.namespace_root(&self.namespace)
    }

    fn context(&self) -> ExecutionContext {
        let mut ctx = ExecutionContext::new(self.skills_root(), &self.api_root).with_limits(self.limits);
        ctx.scratch_root = self.scratch_root.clone();
        ctx.capabilities = self.capabilities.clone();
        ctx.max_capability_calls = self.max_capability_calls;
        ctx
    }

    /// Execute agent code and, when asked and it completed without raising,
    /// save it as a skill.
    ///
    /// Only whether the code raised gates the save. The return value is not
    /// judged.
    pub async fn execute(&self, request: RunRequest) -> RunOutcome {
        let lifecycle = Lifecycle::new();
        lifecycle.transition_to(LifecycleState::Executing);

        let mut ctx = self.context();
        if let Some(limits) = request.limits {
            ctx.limits = limits;
        }
        ctx.inputs = request.inputs.clone();
        ctx.skills_writable = request.skills_writable;

        let result = self.engine.execute(&request.source, &ctx).await;
        self.record_execution(&request.source, &result, None);

        if !result.success {
            lifecycle.transition_to(LifecycleState::Failed);
            lifecycle.transition_to(LifecycleState::Done);
            return RunOutcome {
                result,
                transitions: lifecycle.transitions(),
                save: None,
            };
        }
        lifecycle.transition_to(LifecycleState::Succeeded);

        let save = match &request.save {
            Some(save) => Some(
                self.materialize_and_dispatch(&request.source, save, &lifecycle)
                    .await,
            ),
            None => {
                lifecycle.transition_to(LifecycleState::Done);
                None
            }
        };

        RunOutcome {
            result,
            transitions: lifecycle.transitions(),
            save,
        }
    }

    /// Save a skill without executing it first
    pub async fn save_skill(&self, source: &str, request: &SaveRequest) -> Result<SaveReceipt> {
        let lifecycle = Lifecycle::new();
        self.materialize_and_dispatch(source, request, &lifecycle).await
    }

    /// `MATERIALIZING → [PERSISTING →] DONE`
    async fn materialize_and_dispatch(
        &self,
        source: &str,
        request: &SaveRequest,
        lifecycle: &Lifecycle,
    ) -> Result<SaveReceipt> {
        lifecycle.transition_to(LifecycleState::Materializing);

        let store = self.store.clone();
        let materializer = self.materializer.clone();
        let namespace = self.namespace.clone();
        let owned_source = source.to_string();
        let owned_request = request.clone();
        let materialized = tokio::task::spawn_blocking(move || -> Result<(PathBuf, SkillRecord)> {
            let record = provisional_record(&store, &namespace, &owned_source, &owned_request)?;
            let path = materializer.write_entry(&record)?;
            Ok((path, record))
        })
        .await
        .unwrap_or_else(|e| Err(SkillError::Storage(format!("materialize task aborted: {}", e))));
        let (path, record) = match materialized {
            Ok(done) => done,
            Err(e) => {
                warn!(
                    "Rejected save of {}/{} for {}: {}",
                    request.category, request.name, self.namespace, e
                );
                lifecycle.transition_to(LifecycleState::Done);
                return Err(e);
            }
        };

        self.telemetry.record(&TelemetryEvent::SkillSave {
            namespace: self.namespace.to_string(),
            category: record.category.clone(),
            name: record.name.clone(),
            dependencies: record.dependencies.iter().map(ToString::to_string).collect(),
            source_bytes: source.len(),
        });

        let persist = if request.persist {
            lifecycle.transition_to(LifecycleState::Persisting);
            Some(self.dispatch_persist(source, request))
        } else {
            None
        };
        lifecycle.transition_to(LifecycleState::Done);

        Ok(SaveReceipt {
            identity: record.identity(),
            path,
            persist,
        })
    }

    fn dispatch_persist(&self, source: &str, request: &SaveRequest) -> PersistHandle {
        let store = self.store.clone();
        let telemetry = self.telemetry.clone();
        let namespace = self.namespace.clone();
        let category = request.category.clone();
        let name = request.name.clone();
        let tags = request.tags.clone();
        let source = source.to_string();

        let task = tokio::spawn(async move {
            let write = {
                let namespace = namespace.clone();
                let category = category.clone();
                let name = name.clone();
                tokio::task::spawn_blocking(move || store.put(&namespace, &category, &name, &source, &tags))
                    .await
            };
            let result = write.unwrap_or_else(|e| Err(SkillError::Storage(format!("store write aborted: {}", e))));

            match &result {
                Ok(_) => telemetry.record(&TelemetryEvent::SkillPersisted {
                    namespace: namespace.to_string(),
                    category,
                    name,
                }),
                Err(e) => {
                    warn!("Durable write of {}/{} for {} failed: {}", category, name, namespace, e);
                    telemetry.record(&TelemetryEvent::SkillPersistFailed {
                        namespace: namespace.to_string(),
                        category,
                        name,
                        error: e.to_string(),
                    });
                }
            }
            result
        });
        PersistHandle { task }
    }

    fn record_execution(&self, source: &str, result: &ExecutionResult, skill: Option<&SkillIdentity>) {
        self.telemetry.record(&TelemetryEvent::Execution {
            namespace: self.namespace.to_string(),
            category: skill.map(|s| s.category.clone()),
            name: skill.map(|s| s.name.clone()),
            backend: result.backend,
            success: result.success,
            duration_ms: result.duration.as_millis() as u64,
            error_kind: result.error_kind(),
            error_type: result.error.as_ref().map(|e| e.type_name.clone()),
            source_lines: source.lines().count(),
        });
    }

    /// Invoke a stored skill with `__inputs__` bound; a success bumps its
    /// usage counter
    pub async fn run_skill(&self, category: &str, name: &str, inputs: Option<Value>) -> Result<ExecutionResult> {
        let record = self.store.get(&self.namespace, category, name)?;
        let identity = record.identity();

        let mut ctx = self.context();
        ctx.inputs = inputs;
        let result = self.engine.execute(&record.source, &ctx).await;
        self.record_execution(&record.source, &result, Some(&identity));

        if result.success {
            match self.store.record_usage(&self.namespace, category, name) {
                Ok(count) => info!("Skill {} used {} times", identity, count),
                Err(e) => warn!("Failed to record usage of {}: {}", identity, e),
            }
        }
        Ok(result)
    }

    /// Clear and rebuild this namespace's working tree from the store
    pub fn hydrate(&self) -> Result<HydrationReport> {
        let report = self.materializer.hydrate(&self.store, &self.namespace)?;
        self.telemetry.record(&TelemetryEvent::Hydration {
            namespace: self.namespace.to_string(),
            written: report.written,
            skipped: report.skipped.len(),
        });
        Ok(report)
    }

    pub fn get(&self, category: &str, name: &str) -> Result<SkillRecord> {
        self.store.get(&self.namespace, category, name)
    }

    pub fn list(&self, category: Option<&str>) -> Result<Vec<SkillRecord>> {
        self.store.list(&self.namespace, category)
    }

    /// Entries currently materialized in the working tree
    pub fn list_entries(&self) -> Result<Vec<EntryMeta>> {
        self.materializer.list_entries(&self.namespace)
    }

    pub fn stats(&self) -> Result<SkillStats> {
        self.store.stats(&self.namespace)
    }

    /// Remove a skill from the store and the working tree; false when
    /// neither had it
    pub fn delete_skill(&self, category: &str, name: &str) -> Result<bool> {
        let identity = SkillIdentity::new(category, name)?;
        let from_store = self.store.delete(&self.namespace, category, name)?;
        let from_tree = self.materializer.remove_entry(&self.namespace, &identity)?;
        Ok(from_store || from_tree)
    }

    /// Park task state for a later [`resume`](Self::resume)
    pub fn checkpoint(
        &self,
        task_id: &str,
        description: &str,
        state: Value,
        entry: EntryPoint,
    ) -> Result<Checkpoint> {
        self.checkpoints
            .save(&self.namespace, task_id, description, state, entry)
    }

    pub fn checkpoints(&self) -> Result<Vec<Checkpoint>> {
        self.checkpoints.list(&self.namespace)
    }

    /// Run a checkpoint's entry skill with its state as `__inputs__` (and as
    /// keyword arguments of the entry function, when set). A success marks
    /// the checkpoint completed.
    pub async fn resume(&self, task_id: &str) -> Result<ExecutionResult> {
        let checkpoint = self.checkpoints.get(&self.namespace, task_id)?;
        if !checkpoint.status.is_active() {
            return Err(SkillError::validation(format!(
                "checkpoint '{}' is already {}",
                task_id, checkpoint.status
            )));
        }

        let identity = checkpoint.entry.identity()?;
        let record = self.store.get(&self.namespace, &identity.category, &identity.name)?;

        let mut ctx = self.context().with_inputs(Value::Object(checkpoint.state));
        ctx.entry_function = checkpoint.entry.function;
        let result = self.engine.execute(&record.source, &ctx).await;
        self.record_execution(&record.source, &result, Some(&identity));

        if result.success {
            match self.checkpoints.mark_completed(&self.namespace, task_id) {
                Ok(()) => info!("Resumed checkpoint {} for {}", task_id, self.namespace),
                Err(e) => warn!("Checkpoint {} ran but could not be marked completed: {}", task_id, e),
            }
        } else {
            warn!("Resume of checkpoint {} failed; it stays active", task_id);
        }
        Ok(result)
    }
}

/// Record to materialize before the store has it. The source must pass the
/// store's syntax check; created_at and usage_count carry over from an
/// existing row.
fn provisional_record(
    store: &SkillStore,
    namespace: &Namespace,
    source: &str,
    request: &SaveRequest,
) -> Result<SkillRecord> {
    let identity = SkillIdentity::new(request.category.clone(), request.name.clone())?;
    store.validate_source(source)?;

    let now = Utc::now();
    let existing = match store.get(namespace, &identity.category, &identity.name) {
        Ok(record) => Some(record),
        Err(SkillError::NotFound(_)) => None,
        Err(e) => {
            warn!("Could not read existing {} before save: {}", identity, e);
            None
        }
    };

    Ok(SkillRecord {
        namespace: namespace.clone(),
        category: identity.category,
        name: identity.name,
        source: source.to_string(),
        description: extract_docstring(source),
        tags: normalize_tags(&request.tags),
        dependencies: extract_dependencies(source),
        usage_count: existing.as_ref().map_or(0, |r| r.usage_count),
        created_at: existing.map_or(now, |r| r.created_at),
        updated_at: now,
    })
}
