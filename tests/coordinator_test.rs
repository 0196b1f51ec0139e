//! End-to-end tests for the skill lifecycle coordinator
//!
//! Tests that execute code return early when no `python3` is installed.

use serde_json::json;
use skillforge::{
    CheckpointStatus, CheckpointStore, Config, EntryPoint, ExecutionEngine, LifecycleState,
    Materializer, MemorySink, Namespace, RunRequest, SaveRequest, SkillCoordinator, SkillError,
    SkillStore,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

const ADD_THREE_V1: &str = r#""""Add three numbers."""


def add_three(a, b, c):
    return a + b + c
"#;

const ADD_THREE_V2: &str = r#""""Add three numbers, then double."""


def add_three(a, b, c):
    return 2 * (a + b + c)
"#;

fn python_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

struct Fixture {
    coordinator: SkillCoordinator,
    telemetry: Arc<MemorySink>,
    db_path: PathBuf,
    _dir: TempDir,
}

fn create_test_coordinator(namespace: &str) -> Fixture {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("skills.db");
    let telemetry = Arc::new(MemorySink::new());
    let coordinator = SkillCoordinator::new(
        Namespace::new(namespace).unwrap(),
        Arc::new(SkillStore::open(&db_path).unwrap()),
        Arc::new(CheckpointStore::open(&db_path).unwrap()),
        Materializer::new(dir.path().join("tree")),
        ExecutionEngine::process("python3"),
        dir.path().join("servers"),
    )
    .with_telemetry(telemetry.clone())
    .with_scratch_root(dir.path().join("scratch"));
    Fixture {
        coordinator,
        telemetry,
        db_path,
        _dir: dir,
    }
}

fn event_types(sink: &MemorySink) -> Vec<&'static str> {
    sink.events().iter().map(|e| e.event_type()).collect()
}

#[tokio::test]
async fn test_save_get_hydrate_execute_overwrite() {
    if !python_available() {
        eprintln!("python3 not found, skipping");
        return;
    }
    let fx = create_test_coordinator("agent-1");
    let coordinator = &fx.coordinator;

    let receipt = coordinator
        .save_skill(ADD_THREE_V1, &SaveRequest::new("math", "add_three"))
        .await
        .unwrap();
    receipt.persist.unwrap().wait().await.unwrap();
    assert_eq!(coordinator.get("math", "add_three").unwrap().source, ADD_THREE_V1);

    let report = coordinator.hydrate().unwrap();
    assert!(report.written >= 1);

    let caller = "from skills.math.add_three import add_three\nresult = add_three(1, 2, 3)\n";
    let outcome = coordinator.execute(RunRequest::new(caller)).await;
    assert!(outcome.result.success, "{:?}", outcome.result.error);
    assert_eq!(outcome.result.return_value, Some(json!(6)));

    let receipt = coordinator
        .save_skill(ADD_THREE_V2, &SaveRequest::new("math", "add_three"))
        .await
        .unwrap();
    receipt.persist.unwrap().wait().await.unwrap();
    coordinator.hydrate().unwrap();

    assert_eq!(coordinator.list(None).unwrap().len(), 1);
    let main_py = coordinator.skills_root().join("math/add_three/main.py");
    assert_eq!(std::fs::read_to_string(main_py).unwrap(), ADD_THREE_V2);

    let outcome = coordinator.execute(RunRequest::new(caller)).await;
    assert_eq!(outcome.result.return_value, Some(json!(12)));
}

#[tokio::test]
async fn test_execute_and_persist_lifecycle() {
    if !python_available() {
        eprintln!("python3 not found, skipping");
        return;
    }
    let fx = create_test_coordinator("agent-1");

    let request = RunRequest::new("def square(x):\n    return x * x\n\nresult = square(7)\n")
        .with_save(SaveRequest::new("math", "square").with_tags(["math"]));
    let outcome = fx.coordinator.execute(request).await;

    assert!(outcome.result.success);
    assert_eq!(outcome.result.return_value, Some(json!(49)));
    assert_eq!(
        outcome.transitions,
        vec![
            LifecycleState::Pending,
            LifecycleState::Executing,
            LifecycleState::Succeeded,
            LifecycleState::Materializing,
            LifecycleState::Persisting,
            LifecycleState::Done,
        ]
    );

    // Importable before the durable write is awaited
    let receipt = outcome.save.unwrap().unwrap();
    assert!(receipt.path.join("main.py").exists());

    let record = receipt.persist.unwrap().wait().await.unwrap();
    assert_eq!(record.name, "square");
    assert_eq!(
        event_types(&fx.telemetry),
        vec!["execution", "skill_save", "skill_persisted"]
    );
}

#[tokio::test]
async fn test_failed_execution_is_not_saved() {
    if !python_available() {
        eprintln!("python3 not found, skipping");
        return;
    }
    let fx = create_test_coordinator("agent-1");

    let request = RunRequest::new("raise ValueError('nope')\n").with_save(SaveRequest::new("math", "broken"));
    let outcome = fx.coordinator.execute(request).await;

    assert!(!outcome.result.success);
    assert!(outcome.save.is_none());
    assert_eq!(
        outcome.transitions,
        vec![
            LifecycleState::Pending,
            LifecycleState::Executing,
            LifecycleState::Failed,
            LifecycleState::Done,
        ]
    );
    assert!(!fx.coordinator.skills_root().join("math/broken").exists());
    assert!(fx.coordinator.list(None).unwrap().is_empty());
}

#[tokio::test]
async fn test_persist_failure_keeps_execution_result() {
    if !python_available() {
        eprintln!("python3 not found, skipping");
        return;
    }
    let fx = create_test_coordinator("agent-1");

    // Break the store behind the coordinator's back
    let conn = rusqlite::Connection::open(&fx.db_path).unwrap();
    conn.execute_batch("DROP TABLE skills;").unwrap();
    drop(conn);

    let request = RunRequest::new("result = 40 + 2\n").with_save(SaveRequest::new("math", "answer"));
    let outcome = fx.coordinator.execute(request).await;

    assert!(outcome.result.success);
    assert_eq!(outcome.result.return_value, Some(json!(42)));

    let receipt = outcome.save.unwrap().unwrap();
    assert!(receipt.path.join("main.py").exists());
    let persisted = receipt.persist.unwrap().wait().await;
    assert!(matches!(persisted, Err(SkillError::Storage(_))));

    assert!(event_types(&fx.telemetry).contains(&"skill_persist_failed"));
    // The caller's result is untouched
    assert!(outcome.result.success);
}

#[tokio::test]
async fn test_run_skill_counts_usage() {
    if !python_available() {
        eprintln!("python3 not found, skipping");
        return;
    }
    let fx = create_test_coordinator("agent-1");
    let coordinator = &fx.coordinator;

    let source = "result = sum(__inputs__['values'])\n";
    coordinator
        .save_skill(source, &SaveRequest::new("math", "total"))
        .await
        .unwrap()
        .persist
        .unwrap()
        .wait()
        .await
        .unwrap();

    let result = coordinator
        .run_skill("math", "total", Some(json!({"values": [1, 2, 3, 4]})))
        .await
        .unwrap();
    assert_eq!(result.return_value, Some(json!(10)));
    assert_eq!(coordinator.get("math", "total").unwrap().usage_count, 1);

    let failed = coordinator.run_skill("math", "total", None).await.unwrap();
    assert!(!failed.success);
    assert_eq!(coordinator.get("math", "total").unwrap().usage_count, 1);

    assert!(matches!(
        coordinator.run_skill("math", "absent", None).await,
        Err(SkillError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_checkpoint_resume() {
    if !python_available() {
        eprintln!("python3 not found, skipping");
        return;
    }
    let fx = create_test_coordinator("agent-1");
    let coordinator = &fx.coordinator;

    coordinator
        .save_skill("def multiply(a, b):\n    return a * b\n", &SaveRequest::new("math", "multiply"))
        .await
        .unwrap()
        .persist
        .unwrap()
        .wait()
        .await
        .unwrap();

    coordinator
        .checkpoint(
            "task-1",
            "multiply later",
            json!({"a": 3, "b": 4}),
            EntryPoint::new("math", "multiply").with_function("multiply"),
        )
        .unwrap();

    let result = coordinator.resume("task-1").await.unwrap();
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.return_value, Some(json!(12)));

    let checkpoints = coordinator.checkpoints().unwrap();
    assert_eq!(checkpoints[0].status, CheckpointStatus::Completed);
    assert!(matches!(coordinator.resume("task-1").await, Err(SkillError::Validation(_))));
}

#[tokio::test]
async fn test_namespaces_are_isolated_end_to_end() {
    let a = create_test_coordinator("agent-a");
    a.coordinator
        .save_skill("SECRET = 1\n", &SaveRequest::new("vault", "secret"))
        .await
        .unwrap()
        .persist
        .unwrap()
        .wait()
        .await
        .unwrap();

    // Second coordinator over the same database and tree base
    let b = SkillCoordinator::new(
        Namespace::new("agent-b").unwrap(),
        Arc::new(SkillStore::open(&a.db_path).unwrap()),
        Arc::new(CheckpointStore::open(&a.db_path).unwrap()),
        a.coordinator.materializer().clone(),
        ExecutionEngine::process("python3"),
        a._dir.path().join("servers"),
    );

    assert!(b.list(None).unwrap().is_empty());
    assert_eq!(b.hydrate().unwrap().written, 0);
    assert!(!b.skills_root().join("vault").exists());
    assert_eq!(a.coordinator.list(None).unwrap().len(), 1);
}

fn config_for(base: &Path) -> Config {
    let vars: HashMap<&str, String> = HashMap::from([
        ("SKILLFORGE_NAMESPACE", "agent-1".to_string()),
        ("SKILLFORGE_DB_PATH", base.join("skills.db").display().to_string()),
        ("SKILLFORGE_SKILLS_DIR", base.join("tree").display().to_string()),
        ("SKILLFORGE_SERVERS_DIR", base.join("servers").display().to_string()),
        ("SKILLFORGE_SCRATCH_DIR", base.join("scratch").display().to_string()),
        ("SKILLFORGE_ISOLATION", "process".to_string()),
        ("SKILLFORGE_SYNTAX_CHECK", "lexical".to_string()),
    ]);
    Config::from_lookup(|key| vars.get(key).cloned()).unwrap()
}

#[tokio::test]
async fn test_startup_hydrates_missing_tree() {
    if !python_available() {
        eprintln!("python3 not found, skipping");
        return;
    }
    let dir = TempDir::new().unwrap();
    let config = config_for(dir.path());

    let first = SkillCoordinator::from_config(&config).await.unwrap();
    first
        .save_skill("V = 41\n", &SaveRequest::new("math", "k"))
        .await
        .unwrap()
        .persist
        .unwrap()
        .wait()
        .await
        .unwrap();
    let tree = first.skills_root();
    drop(first);

    std::fs::remove_dir_all(&tree).unwrap();

    let second = SkillCoordinator::from_config(&config).await.unwrap();
    assert!(tree.join("math/k/main.py").exists());

    let outcome = second
        .execute(RunRequest::new("from skills.math.k import V\nresult = V + 1\n"))
        .await;
    assert!(outcome.result.success, "{:?}", outcome.result.error);
    assert_eq!(outcome.result.return_value, Some(json!(42)));
}

#[tokio::test]
async fn test_resume_returns_result_when_completion_cannot_be_recorded() {
    if !python_available() {
        eprintln!("python3 not found, skipping");
        return;
    }
    let fx = create_test_coordinator("agent-1");
    let coordinator = &fx.coordinator;

    coordinator
        .save_skill("def double(n):\n    return n * 2\n", &SaveRequest::new("math", "double"))
        .await
        .unwrap()
        .persist
        .unwrap()
        .wait()
        .await
        .unwrap();
    coordinator
        .checkpoint(
            "task-9",
            "double later",
            json!({"n": 21}),
            EntryPoint::new("math", "double").with_function("double"),
        )
        .unwrap();

    // Status updates fail from here on
    let conn = rusqlite::Connection::open(&fx.db_path).unwrap();
    conn.execute_batch(
        "CREATE TRIGGER freeze_checkpoints BEFORE UPDATE ON checkpoints
         BEGIN SELECT RAISE(FAIL, 'checkpoints are frozen'); END;",
    )
    .unwrap();
    drop(conn);

    let result = coordinator.resume("task-9").await.unwrap();
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.return_value, Some(json!(42)));
    assert!(coordinator.checkpoints().unwrap()[0].status.is_active());
}
