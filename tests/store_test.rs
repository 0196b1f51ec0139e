//! Integration tests for the durable skill store

use skillforge::skills::SyntaxChecker;
use skillforge::{CapabilityRef, Namespace, SkillError, SkillStore};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn create_test_store() -> (SkillStore, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let store = SkillStore::open(&temp_dir.path().join("skills.db")).unwrap();
    (store, temp_dir)
}

const ADD_THREE: &str = r#""""Add three numbers."""
from servers.calculator.add import add


def add_three(a, b, c):
    return add(a=add(a=a, b=b), b=c)
"#;

#[test]
fn test_overwrite_keeps_one_record() {
    let (store, _dir) = create_test_store();
    let ns = Namespace::new("agent-1").unwrap();

    let first = store.put(&ns, "math", "add_three", ADD_THREE, ["math"]).unwrap();
    store.record_usage(&ns, "math", "add_three").unwrap();

    let replaced = "def add_three(a, b, c):\n    return a + b + c\n";
    let second = store.put(&ns, "math", "add_three", replaced, ["fast"]).unwrap();

    let listed = store.list(&ns, None).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].source, replaced);
    assert!(listed[0].tags.contains("fast"));
    assert!(!listed[0].tags.contains("math"));
    assert!(listed[0].dependencies.is_empty());
    assert_eq!(second.created_at, first.created_at);
    assert_eq!(second.usage_count, 1);
}

#[test]
fn test_namespaces_do_not_see_each_other() {
    let (store, _dir) = create_test_store();
    let a = Namespace::new("agent-a").unwrap();
    let b = Namespace::new("agent-b").unwrap();

    store.put(&a, "math", "add_three", ADD_THREE, Vec::<String>::new()).unwrap();

    assert!(store.list(&b, None).unwrap().is_empty());
    assert_eq!(store.stats(&b).unwrap().total_skills, 0);
    assert!(matches!(store.get(&b, "math", "add_three"), Err(SkillError::NotFound(_))));
    assert!(!store.delete(&b, "math", "add_three").unwrap());
    assert_eq!(store.list(&a, None).unwrap().len(), 1);
}

#[test]
fn test_metadata_derived_from_source() {
    let (store, _dir) = create_test_store();
    let ns = Namespace::new("agent-1").unwrap();

    let record = store.put(&ns, "math", "add_three", ADD_THREE, ["b", "a", "a"]).unwrap();
    assert_eq!(record.description, "Add three numbers.");
    assert_eq!(record.dependencies, vec![CapabilityRef::new("calculator", "add")]);
    assert_eq!(record.tags.iter().collect::<Vec<_>>(), vec!["a", "b"]);

    let fetched = store.get(&ns, "math", "add_three").unwrap();
    assert_eq!(fetched.source, ADD_THREE);
}

#[test]
fn test_rejected_writes_leave_store_untouched() {
    let (store, _dir) = create_test_store();
    let ns = Namespace::new("agent-1").unwrap();

    let bad_name = store.put(&ns, "math", "../escape", "x = 1\n", Vec::<String>::new());
    assert!(matches!(bad_name, Err(SkillError::Validation(_))));

    let bad_source = store.put(&ns, "math", "broken", "def f(:\n    return (\n", Vec::<String>::new());
    assert!(matches!(bad_source, Err(SkillError::Validation(_))));

    assert!(store.list(&ns, None).unwrap().is_empty());
}

#[test]
fn test_concurrent_writes_to_one_identity() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(SkillStore::open(&temp_dir.path().join("skills.db")).unwrap());
    let ns = Namespace::new("agent-1").unwrap();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let store = store.clone();
            let ns = ns.clone();
            std::thread::spawn(move || {
                let source = format!("VALUE = {}\n", i);
                store.put(&ns, "race", "value", &source, Vec::<String>::new()).unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let listed = store.list(&ns, Some("race")).unwrap();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].source.starts_with("VALUE = "));
}

#[test]
fn test_reopen_keeps_records() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("nested").join("skills.db");
    let ns = Namespace::new("agent-1").unwrap();

    {
        let store = SkillStore::open(&db_path).unwrap();
        store.put(&ns, "math", "add_three", ADD_THREE, ["math"]).unwrap();
    }

    let store = SkillStore::open(&db_path).unwrap();
    let stats = store.stats(&ns).unwrap();
    assert_eq!(stats.total_skills, 1);
    assert_eq!(stats.by_category.get("math"), Some(&1));
}

#[test]
fn test_interpreter_checker_rejects_module_level_return() {
    let python = std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);
    if !python {
        eprintln!("python3 not found, skipping");
        return;
    }
    let temp_dir = TempDir::new().unwrap();
    let store = SkillStore::open_with(
        &temp_dir.path().join("skills.db"),
        SyntaxChecker::interpreter("python3"),
        Duration::from_millis(5000),
    )
    .unwrap();
    let ns = Namespace::new("agent-1").unwrap();

    let err = store.put(&ns, "m", "bad", "return 5\n", Vec::<String>::new()).unwrap_err();
    assert!(matches!(err, SkillError::Validation(_)));
    assert!(matches!(store.get(&ns, "m", "bad"), Err(SkillError::NotFound(_))));

    store.put(&ns, "m", "good", "def f():\n    return 5\n", Vec::<String>::new()).unwrap();
    assert_eq!(store.list(&ns, None).unwrap().len(), 1);
}
