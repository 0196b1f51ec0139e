//! Working-Tree Materializer
//!
//! Rebuilds the importable skill tree of a namespace from the store. The tree
//! is disposable: `hydrate` clears it and rewrites every stored record.
//!
//! Layout under `<base>/<namespace>/`:
//!
//! ```text
//! __init__.py
//! <category>/__init__.py
//! <category>/<name>/main.py
//! <category>/<name>/__init__.py
//! <category>/<name>/README.md
//! <category>/<name>/.meta.json
//! ```
//!
//! Entries are staged in a hidden sibling directory and renamed into place,
//! so a reader never sees a half-written entry.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::store::SkillStore;
use super::syntax::check_syntax;
use super::types::{CapabilityRef, Namespace, SkillIdentity, SkillRecord};
use crate::error::{Result, SkillError};

const ROOT_INIT: &str = "\"\"\"Skills materialized from the skill store.\"\"\"\n";
const META_FILE: &str = ".meta.json";

/// Per-root locks shared by every materializer in the process
static ROOT_LOCKS: Lazy<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn lock_for(root: &Path) -> Arc<Mutex<()>> {
    ROOT_LOCKS
        .lock()
        .entry(root.to_path_buf())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// Contents of `.meta.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub namespace: Namespace,
    pub category: String,
    pub name: String,
    pub description: String,
    pub tags: BTreeSet<String>,
    pub dependencies: Vec<CapabilityRef>,
    pub usage_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub source_sha256: String,
}

/// A record hydration could not rematerialize
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedEntry {
    pub category: String,
    pub name: String,
    pub reason: String,
}

/// Outcome of one hydration pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HydrationReport {
    pub written: usize,
    pub skipped: Vec<SkippedEntry>,
}

impl HydrationReport {
    pub fn is_partial(&self) -> bool {
        !self.skipped.is_empty()
    }
}

fn init_docstring(text: &str) -> String {
    let mut doc = text.replace("\"\"\"", "\\\"\\\"\\\"");
    if doc.ends_with('"') || doc.ends_with('\\') {
        doc.push(' ');
    }
    doc
}

fn render_readme(record: &SkillRecord) -> String {
    let description = if record.description.is_empty() {
        "No description provided."
    } else {
        record.description.as_str()
    };

    let dependencies = if record.dependencies.is_empty() {
        "None".to_string()
    } else {
        record
            .dependencies
            .iter()
            .map(|d| format!("- `{}`", d))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let tags = if record.tags.is_empty() {
        "None".to_string()
    } else {
        record.tags.iter().cloned().collect::<Vec<_>>().join(", ")
    };

    format!(
        "# {name}\n\n**Category:** {category}\n**Created:** {created}\n\n## Description\n\n{description}\n\n## Usage\n\n```python\nfrom {module} import *\n```\n\n## Dependencies\n\n{dependencies}\n\n## Tags\n\n{tags}\n",
        name = record.name,
        category = record.category,
        created = record.created_at.format("%Y-%m-%d"),
        description = description,
        module = record.identity().module_path(),
        dependencies = dependencies,
        tags = tags,
    )
}

/// Render every file of one entry. Output depends only on the record.
pub fn render_entry(record: &SkillRecord) -> Result<Vec<(&'static str, String)>> {
    let doc = if record.description.is_empty() {
        record.name.as_str()
    } else {
        record.description.as_str()
    };

    let meta = EntryMeta {
        namespace: record.namespace.clone(),
        category: record.category.clone(),
        name: record.name.clone(),
        description: record.description.clone(),
        tags: record.tags.clone(),
        dependencies: record.dependencies.clone(),
        usage_count: record.usage_count,
        created_at: record.created_at,
        updated_at: record.updated_at,
        source_sha256: record.source_sha256(),
    };
    let mut meta_json = serde_json::to_string_pretty(&meta)?;
    meta_json.push('\n');

    Ok(vec![
        ("main.py", record.source.clone()),
        (
            "__init__.py",
            format!("\"\"\"{}\"\"\"\n\nfrom .main import *\n", init_docstring(doc)),
        ),
        ("README.md", render_readme(record)),
        (META_FILE, meta_json),
    ])
}

/// Identity and lexical syntax re-check applied before rematerializing
fn rematerialization_check(record: &SkillRecord) -> Result<()> {
    record.identity().validate()?;
    check_syntax(&record.source)
        .map_err(|issue| SkillError::Validation(format!("source no longer parses: {}", issue)))
}

/// Write a small file with write-then-rename
fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| SkillError::validation(format!("no parent for {}", path.display())))?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content.as_bytes())?;
    tmp.persist(path)?;
    Ok(())
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// Materializes skills under `<base>/<namespace>/`
#[derive(Debug, Clone)]
pub struct Materializer {
    base: PathBuf,
}

impl Materializer {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Working-tree root of a namespace (the `skills` package directory)
    pub fn namespace_root(&self, namespace: &Namespace) -> PathBuf {
        self.base.join(namespace.as_str())
    }

    /// Path of one entry
    pub fn entry_path(&self, namespace: &Namespace, identity: &SkillIdentity) -> PathBuf {
        self.namespace_root(namespace)
            .join(&identity.category)
            .join(&identity.name)
    }

    /// Create the namespace root and return it with its lock
    fn prepare_root(&self, namespace: &Namespace) -> Result<(PathBuf, Arc<Mutex<()>>)> {
        let root = self.namespace_root(namespace);
        fs::create_dir_all(&root)?;
        let canonical = fs::canonicalize(&root)?;
        let lock = lock_for(&canonical);
        Ok((root, lock))
    }

    /// Clear the namespace tree and rebuild it from the store.
    ///
    /// A record that fails to rematerialize is skipped and reported; the
    /// rest of the namespace is still written.
    pub fn hydrate(&self, store: &SkillStore, namespace: &Namespace) -> Result<HydrationReport> {
        let (root, lock) = self.prepare_root(namespace)?;
        let _guard = lock.lock();

        let loaded = store.load_all(namespace)?;

        Self::clear(&root)?;
        write_atomic(&root.join("__init__.py"), ROOT_INIT)?;

        let mut report = HydrationReport::default();
        for entry in loaded {
            let placed = entry.record.and_then(|record| {
                rematerialization_check(&record)?;
                Self::place_entry(&root, &record)
            });
            match placed {
                Ok(path) => {
                    debug!("Materialized {}", path.display());
                    report.written += 1;
                }
                Err(e) => {
                    warn!("Skipping {}/{} during hydration: {}", entry.category, entry.name, e);
                    report.skipped.push(SkippedEntry {
                        category: entry.category,
                        name: entry.name,
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            "Hydrated {} skills for {} ({} skipped)",
            report.written,
            namespace,
            report.skipped.len()
        );
        Ok(report)
    }

    /// Write or replace one entry immediately
    pub fn write_entry(&self, record: &SkillRecord) -> Result<PathBuf> {
        rematerialization_check(record)?;
        let (root, lock) = self.prepare_root(&record.namespace)?;
        let _guard = lock.lock();

        if !root.join("__init__.py").exists() {
            write_atomic(&root.join("__init__.py"), ROOT_INIT)?;
        }
        let path = Self::place_entry(&root, record)?;
        info!("Materialized skill {} for {}", record.identity(), record.namespace);
        Ok(path)
    }

    /// Remove one entry; false when there was none
    pub fn remove_entry(&self, namespace: &Namespace, identity: &SkillIdentity) -> Result<bool> {
        identity.validate()?;
        let (root, lock) = self.prepare_root(namespace)?;
        let _guard = lock.lock();

        let category_dir = root.join(&identity.category);
        let target = category_dir.join(&identity.name);
        if !target.exists() {
            return Ok(false);
        }
        let aside = category_dir.join(format!(".{}.old-{}", identity.name, Uuid::new_v4().simple()));
        fs::rename(&target, &aside)?;
        fs::remove_dir_all(&aside)?;
        debug!("Removed entry {}", target.display());
        Ok(true)
    }

    /// Entries currently in the tree, read from their `.meta.json`
    pub fn list_entries(&self, namespace: &Namespace) -> Result<Vec<EntryMeta>> {
        let root = self.namespace_root(namespace);
        if !root.is_dir() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for category in fs::read_dir(&root)? {
            let category = category?;
            let category_name = category.file_name().to_string_lossy().into_owned();
            if is_hidden(&category_name) || category_name == "__pycache__" || !category.path().is_dir() {
                continue;
            }
            for skill in fs::read_dir(category.path())? {
                let skill = skill?;
                let skill_name = skill.file_name().to_string_lossy().into_owned();
                let meta_path = skill.path().join(META_FILE);
                if is_hidden(&skill_name) || !meta_path.is_file() {
                    continue;
                }
                let parsed = fs::read_to_string(&meta_path)
                    .map_err(SkillError::from)
                    .and_then(|text| serde_json::from_str::<EntryMeta>(&text).map_err(SkillError::from));
                match parsed {
                    Ok(meta) => entries.push(meta),
                    Err(e) => warn!("Unreadable {}: {}", meta_path.display(), e),
                }
            }
        }

        entries.sort_by(|a, b| (&a.category, &a.name).cmp(&(&b.category, &b.name)));
        Ok(entries)
    }

    /// Remove everything under the root except its `__init__.py`
    fn clear(root: &Path) -> Result<()> {
        for entry in fs::read_dir(root)? {
            let entry = entry?;
            if entry.file_name() == "__init__.py" {
                continue;
            }
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    /// Stage, then rename into place. Caller holds the root lock.
    fn place_entry(root: &Path, record: &SkillRecord) -> Result<PathBuf> {
        let files = render_entry(record)?;

        let category_dir = root.join(&record.category);
        fs::create_dir_all(&category_dir)?;
        write_atomic(
            &category_dir.join("__init__.py"),
            &format!("\"\"\"{} skills\"\"\"\n", record.category),
        )?;

        let token = Uuid::new_v4().simple().to_string();
        let staging = category_dir.join(format!(".{}.staging-{}", record.name, token));
        fs::create_dir(&staging)?;
        let staged = files
            .iter()
            .try_for_each(|(file, content)| fs::write(staging.join(file), content));
        if let Err(e) = staged {
            let _ = fs::remove_dir_all(&staging);
            return Err(e.into());
        }

        let target = category_dir.join(&record.name);
        if target.exists() {
            let aside = category_dir.join(format!(".{}.old-{}", record.name, token));
            fs::rename(&target, &aside)?;
            if let Err(e) = fs::rename(&staging, &target) {
                // Put the previous entry back rather than leave a gap.
                let _ = fs::rename(&aside, &target);
                let _ = fs::remove_dir_all(&staging);
                return Err(e.into());
            }
            fs::remove_dir_all(&aside)?;
        } else {
            fs::rename(&staging, &target)?;
        }
        Ok(target)
    }
}
