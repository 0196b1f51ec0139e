//! Integration tests for working-tree hydration

use skillforge::skills::{EntryMeta, Materializer, SkillStore};
use skillforge::{Namespace, SkillIdentity};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

fn snapshot(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    fn walk(base: &Path, dir: &Path, out: &mut BTreeMap<PathBuf, Vec<u8>>) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(base, &path, out);
            } else {
                let rel = path.strip_prefix(base).unwrap().to_path_buf();
                out.insert(rel, std::fs::read(&path).unwrap());
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(root, root, &mut out);
    out
}

fn setup() -> (SkillStore, Materializer, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let store = SkillStore::open(&temp_dir.path().join("skills.db")).unwrap();
    let materializer = Materializer::new(temp_dir.path().join("tree"));
    (store, materializer, temp_dir)
}

#[test]
fn test_hydration_is_idempotent() {
    let (store, materializer, _dir) = setup();
    let ns = Namespace::new("agent-1").unwrap();
    store
        .put(&ns, "math", "add_three", "\"\"\"Adds.\"\"\"\ndef add_three(a, b, c):\n    return a + b + c\n", ["math"])
        .unwrap();
    store
        .put(&ns, "text", "shout", "def shout(s):\n    return s.upper()\n", Vec::<String>::new())
        .unwrap();

    let first = materializer.hydrate(&store, &ns).unwrap();
    let before = snapshot(&materializer.namespace_root(&ns));
    let second = materializer.hydrate(&store, &ns).unwrap();
    let after = snapshot(&materializer.namespace_root(&ns));

    assert_eq!(first.written, 2);
    assert_eq!(second.written, 2);
    assert_eq!(before, after);
    assert!(before.contains_key(Path::new("math/add_three/main.py")));
    assert!(before.contains_key(Path::new("math/add_three/.meta.json")));
    assert!(before.contains_key(Path::new("math/__init__.py")));
    assert!(before.contains_key(Path::new("__init__.py")));
}

#[test]
fn test_hydration_respects_namespaces() {
    let (store, materializer, _dir) = setup();
    let a = Namespace::new("agent-a").unwrap();
    let b = Namespace::new("agent-b").unwrap();
    store.put(&a, "math", "secret", "X = 1\n", Vec::<String>::new()).unwrap();

    materializer.hydrate(&store, &a).unwrap();
    let report = materializer.hydrate(&store, &b).unwrap();

    assert_eq!(report.written, 0);
    assert!(!materializer.namespace_root(&b).join("math").exists());
    assert!(materializer.namespace_root(&a).join("math/secret/main.py").exists());
}

#[test]
fn test_hydration_removes_orphans() {
    let (store, materializer, _dir) = setup();
    let ns = Namespace::new("agent-1").unwrap();
    store.put(&ns, "math", "kept", "K = 1\n", Vec::<String>::new()).unwrap();

    let root = materializer.namespace_root(&ns);
    let ghost = root.join("old").join("ghost");
    std::fs::create_dir_all(&ghost).unwrap();
    std::fs::write(ghost.join("main.py"), "G = 1\n").unwrap();
    std::fs::write(root.join("stray.txt"), "junk").unwrap();

    materializer.hydrate(&store, &ns).unwrap();
    assert!(!root.join("old").exists());
    assert!(!root.join("stray.txt").exists());
    assert!(root.join("math/kept/main.py").exists());
}

#[test]
fn test_hydration_after_overwrite_has_only_new_source() {
    let (store, materializer, _dir) = setup();
    let ns = Namespace::new("agent-1").unwrap();
    store.put(&ns, "math", "f", "def f():\n    return 1\n", Vec::<String>::new()).unwrap();
    materializer.hydrate(&store, &ns).unwrap();

    store.put(&ns, "math", "f", "def f():\n    return 2\n", Vec::<String>::new()).unwrap();
    materializer.hydrate(&store, &ns).unwrap();

    let root = materializer.namespace_root(&ns);
    let main = std::fs::read_to_string(root.join("math/f/main.py")).unwrap();
    assert_eq!(main, "def f():\n    return 2\n");

    let entries: Vec<EntryMeta> = materializer.list_entries(&ns).unwrap();
    assert_eq!(entries.len(), 1);
    let hidden: Vec<_> = std::fs::read_dir(root.join("math"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with('.'))
        .collect();
    assert!(hidden.is_empty(), "leftover staging entries: {:?}", hidden);
}

#[test]
fn test_concurrent_hydrate_and_write_leave_complete_entries() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(SkillStore::open(&temp_dir.path().join("skills.db")).unwrap());
    let materializer = Materializer::new(temp_dir.path().join("tree"));
    let ns = Namespace::new("agent-1").unwrap();
    for i in 0..5 {
        store
            .put(&ns, "bulk", &format!("s{}", i), &format!("V = {}\n", i), Vec::<String>::new())
            .unwrap();
    }

    let hydrators: Vec<_> = (0..4)
        .map(|_| {
            let store = store.clone();
            let materializer = materializer.clone();
            let ns = ns.clone();
            std::thread::spawn(move || {
                for _ in 0..5 {
                    materializer.hydrate(&store, &ns).unwrap();
                }
            })
        })
        .collect();
    let writer = {
        let store = store.clone();
        let materializer = materializer.clone();
        let ns = ns.clone();
        std::thread::spawn(move || {
            for _ in 0..10 {
                let record = store.get(&ns, "bulk", "s0").unwrap();
                materializer.write_entry(&record).unwrap();
            }
        })
    };
    for handle in hydrators {
        handle.join().unwrap();
    }
    writer.join().unwrap();

    materializer.hydrate(&store, &ns).unwrap();
    let root = materializer.namespace_root(&ns);
    for i in 0..5 {
        let entry = root.join("bulk").join(format!("s{}", i));
        for file in ["main.py", "__init__.py", "README.md", ".meta.json"] {
            assert!(entry.join(file).exists(), "{}/{} missing", entry.display(), file);
        }
    }
}

#[test]
fn test_remove_entry() {
    let (store, materializer, _dir) = setup();
    let ns = Namespace::new("agent-1").unwrap();
    store.put(&ns, "math", "gone", "G = 0\n", Vec::<String>::new()).unwrap();
    materializer.hydrate(&store, &ns).unwrap();

    let identity = SkillIdentity::new("math", "gone").unwrap();
    assert!(materializer.remove_entry(&ns, &identity).unwrap());
    assert!(!materializer.entry_path(&ns, &identity).exists());
    assert!(!materializer.remove_entry(&ns, &identity).unwrap());
}

#[test]
fn test_corrupt_row_is_skipped_and_reported() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("skills.db");
    let store = SkillStore::open(&db_path).unwrap();
    let materializer = Materializer::new(temp_dir.path().join("tree"));
    let ns = Namespace::new("agent-1").unwrap();
    for name in ["alpha", "beta", "gamma"] {
        store
            .put(&ns, "math", name, &format!("NAME = '{}'\n", name), Vec::<String>::new())
            .unwrap();
    }

    let conn = rusqlite::Connection::open(&db_path).unwrap();
    conn.execute("UPDATE skills SET tags = 'not json' WHERE name = 'beta'", [])
        .unwrap();
    drop(conn);

    let report = materializer.hydrate(&store, &ns).unwrap();
    assert!(report.is_partial());
    assert_eq!(report.written, 2);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].category, "math");
    assert_eq!(report.skipped[0].name, "beta");
    assert!(!report.skipped[0].reason.is_empty());

    let root = materializer.namespace_root(&ns);
    assert!(root.join("math/alpha/main.py").exists());
    assert!(root.join("math/gamma/main.py").exists());
    assert!(!root.join("math/beta").exists());
}
