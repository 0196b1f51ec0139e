//! Durable Skill Store
//!
//! SQLite-backed single source of truth for skill code and metadata.
//! Every statement is filtered by namespace; rows of one agent are never
//! visible to another, even when they share the database file.

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::extractor::extract_dependencies;
use super::syntax::{extract_docstring, SyntaxChecker};
use super::types::{normalize_tags, Namespace, SkillIdentity, SkillRecord, SkillStats};
use crate::error::{Result, SkillError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS skills (
    namespace TEXT NOT NULL,
    category TEXT NOT NULL,
    name TEXT NOT NULL,
    source TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    tags TEXT NOT NULL DEFAULT '[]',
    dependencies TEXT NOT NULL DEFAULT '[]',
    usage_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (namespace, category, name)
);

CREATE INDEX IF NOT EXISTS idx_skills_namespace ON skills(namespace);
"#;

const SELECT_COLUMNS: &str = "category, name, source, description, tags, dependencies, usage_count, created_at, updated_at";

/// RFC 3339 UTC with millisecond precision
pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| SkillError::Storage(format!("corrupt timestamp '{}': {}", value, e)))
}

/// Row as stored, before JSON and timestamp columns are decoded
struct RawSkill {
    category: String,
    name: String,
    source: String,
    description: String,
    tags: String,
    dependencies: String,
    usage_count: i64,
    created_at: String,
    updated_at: String,
}

impl RawSkill {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            category: row.get(0)?,
            name: row.get(1)?,
            source: row.get(2)?,
            description: row.get(3)?,
            tags: row.get(4)?,
            dependencies: row.get(5)?,
            usage_count: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn into_record(self, namespace: &Namespace) -> Result<SkillRecord> {
        Ok(SkillRecord {
            namespace: namespace.clone(),
            tags: serde_json::from_str(&self.tags)?,
            dependencies: serde_json::from_str(&self.dependencies)?,
            usage_count: self.usage_count.max(0) as u64,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            category: self.category,
            name: self.name,
            source: self.source,
            description: self.description,
        })
    }
}

/// One row loaded for hydration; `record` is Err when a column is corrupt
#[derive(Debug)]
pub struct LoadedRecord {
    pub category: String,
    pub name: String,
    pub record: Result<SkillRecord>,
}

/// Skill store with SQLite backend
pub struct SkillStore {
    conn: Mutex<Connection>,
    checker: SyntaxChecker,
}

impl SkillStore {
    /// Open (or create) the store with lexical syntax checking
    pub fn open(db_path: &Path) -> Result<Self> {
        Self::open_with(db_path, SyntaxChecker::Lexical, Duration::from_millis(5000))
    }

    /// Open with an explicit syntax checker and lock wait ceiling
    pub fn open_with(
        db_path: &Path,
        checker: SyntaxChecker,
        busy_timeout: Duration,
    ) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        conn.execute_batch(SCHEMA)?;

        info!("Skill store opened: {}", db_path.display());
        Ok(Self {
            conn: Mutex::new(conn),
            checker,
        })
    }

    /// Run the configured syntax check without touching the database
    pub fn validate_source(&self, source: &str) -> Result<()> {
        self.checker.check(source)
    }

    /// Insert or overwrite one skill.
    ///
    /// Identity and syntax are validated before the database is touched.
    /// On overwrite, source, description, tags, dependencies and updated_at
    /// are replaced; created_at and usage_count are kept.
    pub fn put<I, S>(
        &self,
        namespace: &Namespace,
        category: &str,
        name: &str,
        source: &str,
        tags: I,
    ) -> Result<SkillRecord>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        SkillIdentity::new(category, name)?;
        self.validate_source(source)?;

        let description = extract_docstring(source);
        let dependencies = extract_dependencies(source);
        let tags_json = serde_json::to_string(&normalize_tags(tags))?;
        let deps_json = serde_json::to_string(&dependencies)?;
        let now = format_timestamp(Utc::now());

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO skills (namespace, category, name, source, description, tags, dependencies, usage_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?8)
             ON CONFLICT(namespace, category, name) DO UPDATE SET
                source = excluded.source,
                description = excluded.description,
                tags = excluded.tags,
                dependencies = excluded.dependencies,
                updated_at = excluded.updated_at",
            params![
                namespace.as_str(),
                category,
                name,
                source,
                description,
                tags_json,
                deps_json,
                now,
            ],
        )?;
        let record = Self::fetch(&tx, namespace, category, name)?
            .ok_or_else(|| SkillError::Storage(format!("{}/{} vanished after write", category, name)))?;
        tx.commit()?;

        info!(
            "Saved skill {}/{} for {} ({} deps)",
            category,
            name,
            namespace,
            record.dependencies.len()
        );
        Ok(record)
    }

    fn fetch(
        conn: &Connection,
        namespace: &Namespace,
        category: &str,
        name: &str,
    ) -> Result<Option<SkillRecord>> {
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {} FROM skills WHERE namespace = ?1 AND category = ?2 AND name = ?3",
                    SELECT_COLUMNS
                ),
                params![namespace.as_str(), category, name],
                RawSkill::from_row,
            )
            .optional()?;
        raw.map(|r| r.into_record(namespace)).transpose()
    }

    /// Fetch one skill
    pub fn get(&self, namespace: &Namespace, category: &str, name: &str) -> Result<SkillRecord> {
        let conn = self.conn.lock();
        Self::fetch(&conn, namespace, category, name)?
            .ok_or_else(|| SkillError::NotFound(format!("{}/{} in {}", category, name, namespace)))
    }

    /// Every row of a namespace ordered by category then name, decoding each
    /// independently
    pub fn load_all(&self, namespace: &Namespace) -> Result<Vec<LoadedRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM skills WHERE namespace = ?1 ORDER BY category, name",
            SELECT_COLUMNS
        ))?;
        let raws = stmt
            .query_map(params![namespace.as_str()], RawSkill::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(raws
            .into_iter()
            .map(|raw| LoadedRecord {
                category: raw.category.clone(),
                name: raw.name.clone(),
                record: raw.into_record(namespace),
            })
            .collect())
    }

    /// Skills of a namespace, optionally one category, ordered by category
    /// then name
    pub fn list(&self, namespace: &Namespace, category: Option<&str>) -> Result<Vec<SkillRecord>> {
        let records = self
            .load_all(namespace)?
            .into_iter()
            .filter(|loaded| category.map_or(true, |c| loaded.category == c))
            .filter_map(|loaded| match loaded.record {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("Skipping corrupt skill {}/{}: {}", loaded.category, loaded.name, e);
                    None
                }
            })
            .collect();
        Ok(records)
    }

    /// Per-category counts for a namespace
    pub fn stats(&self, namespace: &Namespace) -> Result<SkillStats> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT category, COUNT(*) FROM skills WHERE namespace = ?1 GROUP BY category ORDER BY category",
        )?;
        let rows = stmt
            .query_map(params![namespace.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stats = SkillStats::default();
        for (category, count) in rows {
            let count = count.max(0) as u64;
            stats.total_skills += count;
            stats.by_category.insert(category, count);
        }
        Ok(stats)
    }

    /// Remove one skill; false when it did not exist
    pub fn delete(&self, namespace: &Namespace, category: &str, name: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "DELETE FROM skills WHERE namespace = ?1 AND category = ?2 AND name = ?3",
            params![namespace.as_str(), category, name],
        )?;
        if changed > 0 {
            info!("Deleted skill {}/{} for {}", category, name, namespace);
        }
        Ok(changed > 0)
    }

    /// Increment the usage counter after a successful invocation
    pub fn record_usage(&self, namespace: &Namespace, category: &str, name: &str) -> Result<u64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE skills SET usage_count = usage_count + 1
             WHERE namespace = ?1 AND category = ?2 AND name = ?3",
            params![namespace.as_str(), category, name],
        )?;
        if changed == 0 {
            return Err(SkillError::NotFound(format!(
                "{}/{} in {}",
                category, name, namespace
            )));
        }
        let count: i64 = tx.query_row(
            "SELECT usage_count FROM skills WHERE namespace = ?1 AND category = ?2 AND name = ?3",
            params![namespace.as_str(), category, name],
            |row| row.get(0),
        )?;
        tx.commit()?;

        debug!("Usage of {}/{} now {}", category, name, count);
        Ok(count.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ADD: &str = "\"\"\"Add two numbers\"\"\"\n\nresult = 1 + 2\n";

    fn create_test_store() -> (SkillStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = SkillStore::open(&dir.path().join("skills.db")).unwrap();
        (store, dir)
    }

    fn ns(id: &str) -> Namespace {
        Namespace::new(id).unwrap()
    }

    #[test]
    fn test_put_and_get() {
        let (store, _dir) = create_test_store();
        let saved = store
            .put(&ns("agent-1"), "math", "add", ADD, ["arith", " sum "])
            .unwrap();
        assert_eq!(saved.description, "Add two numbers");
        assert_eq!(saved.usage_count, 0);

        let loaded = store.get(&ns("agent-1"), "math", "add").unwrap();
        assert_eq!(loaded.source, ADD);
        assert!(loaded.tags.contains("sum"));
        assert_eq!(loaded, saved);
    }

    #[test]
    fn test_invalid_input_is_not_stored() {
        let (store, _dir) = create_test_store();
        let err = store
            .put(&ns("a"), "math", "bad", "def f(:\n", Vec::<String>::new())
            .unwrap_err();
        assert!(matches!(err, SkillError::Validation(_)));

        let err = store
            .put(&ns("a"), "ma th", "ok", ADD, Vec::<String>::new())
            .unwrap_err();
        assert!(matches!(err, SkillError::Validation(_)));

        assert!(store.list(&ns("a"), None).unwrap().is_empty());
    }

    #[test]
    fn test_overwrite_keeps_created_at_and_usage() {
        let (store, _dir) = create_test_store();
        let a = ns("a");
        let first = store.put(&a, "math", "add", ADD, ["x"]).unwrap();
        store.record_usage(&a, "math", "add").unwrap();

        let second = store
            .put(&a, "math", "add", "result = 40 + 2\n", ["y"])
            .unwrap();
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.usage_count, 1);
        assert_eq!(second.source, "result = 40 + 2\n");
        assert_eq!(second.description, "");
        assert!(second.tags.contains("y") && !second.tags.contains("x"));
        assert_eq!(store.list(&a, None).unwrap().len(), 1);
    }

    #[test]
    fn test_list_order_and_stats() {
        let (store, _dir) = create_test_store();
        let a = ns("a");
        for (cat, name) in [("text", "upper"), ("math", "sub"), ("math", "add")] {
            store.put(&a, cat, name, ADD, Vec::<String>::new()).unwrap();
        }

        let names: Vec<String> = store
            .list(&a, None)
            .unwrap()
            .iter()
            .map(|r| r.identity().to_string())
            .collect();
        assert_eq!(names, vec!["math/add", "math/sub", "text/upper"]);
        assert_eq!(store.list(&a, Some("math")).unwrap().len(), 2);

        let stats = store.stats(&a).unwrap();
        assert_eq!(stats.total_skills, 3);
        assert_eq!(stats.by_category.get("math"), Some(&2));
        assert_eq!(stats.by_category.get("text"), Some(&1));
    }

    #[test]
    fn test_delete_and_usage_not_found() {
        let (store, _dir) = create_test_store();
        let a = ns("a");
        store.put(&a, "math", "add", ADD, Vec::<String>::new()).unwrap();
        assert!(store.delete(&a, "math", "add").unwrap());
        assert!(!store.delete(&a, "math", "add").unwrap());
        assert!(matches!(
            store.record_usage(&a, "math", "add"),
            Err(SkillError::NotFound(_))
        ));
        assert!(matches!(store.get(&a, "math", "add"), Err(SkillError::NotFound(_))));
    }

    #[test]
    fn test_corrupt_row_is_reported_not_fatal() {
        let (store, _dir) = create_test_store();
        let a = ns("a");
        store.put(&a, "math", "add", ADD, Vec::<String>::new()).unwrap();
        store.put(&a, "math", "sub", ADD, Vec::<String>::new()).unwrap();
        store
            .conn
            .lock()
            .execute("UPDATE skills SET tags = 'not json' WHERE name = 'sub'", [])
            .unwrap();

        let loaded = store.load_all(&a).unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded[0].record.is_ok());
        assert!(loaded[1].record.is_err());
        assert_eq!(store.list(&a, None).unwrap().len(), 1);
    }
}
