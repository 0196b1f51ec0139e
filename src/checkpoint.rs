//! Task Checkpoints
//!
//! A checkpoint is a JSON state blob plus an entry point naming a stored
//! skill (and optionally a function inside it). Resuming executes that skill
//! with the state bound as `__inputs__`; the state is never rendered back
//! into source text.
//!
//! Same discipline as the skill store: namespace filter on every statement,
//! validated identifiers, IMMEDIATE transactions for writes.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, SkillError};
use crate::skills::store::{format_timestamp, parse_timestamp};
use crate::skills::{validate_segment, Namespace, SkillIdentity};

/// Skill (and optional function) a checkpoint resumes into
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPoint {
    pub category: String,
    pub name: String,
    pub function: Option<String>,
}

impl EntryPoint {
    pub fn new(category: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            name: name.into(),
            function: None,
        }
    }

    pub fn with_function(mut self, function: impl Into<String>) -> Self {
        self.function = Some(function.into());
        self
    }

    pub fn identity(&self) -> Result<SkillIdentity> {
        SkillIdentity::new(self.category.clone(), self.name.clone())
    }

    fn validate(&self) -> Result<()> {
        self.identity()?;
        if let Some(function) = &self.function {
            let mut chars = function.chars();
            let valid = chars
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !valid {
                return Err(SkillError::Validation(format!(
                    "entry function '{}' is not an identifier",
                    function
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointStatus {
    Active,
    Completed,
}

impl CheckpointStatus {
    pub fn is_active(self) -> bool {
        self == Self::Active
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            other => Err(SkillError::Storage(format!("unknown checkpoint status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub namespace: Namespace,
    pub task_id: String,
    pub description: String,
    pub state: Map<String, Value>,
    pub entry: EntryPoint,
    pub status: CheckpointStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const SELECT_COLUMNS: &str = "task_id, description, state, entry_category, entry_name, entry_function, status, created_at, updated_at";

type RawCheckpoint = (String, String, String, String, String, Option<String>, String, String, String);

fn raw_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawCheckpoint> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn decode(namespace: &Namespace, raw: RawCheckpoint) -> Result<Checkpoint> {
    let (task_id, description, state, category, name, function, status, created_at, updated_at) = raw;
    Ok(Checkpoint {
        namespace: namespace.clone(),
        task_id,
        description,
        state: serde_json::from_str(&state)?,
        entry: EntryPoint {
            category,
            name,
            function,
        },
        status: CheckpointStatus::parse(&status)?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

/// Checkpoint table, usually in the same database file as the skills
pub struct CheckpointStore {
    conn: Mutex<Connection>,
}

impl CheckpointStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        Self::open_with(db_path, Duration::from_millis(5000))
    }

    pub fn open_with(db_path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                namespace TEXT NOT NULL,
                task_id TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                state TEXT NOT NULL,
                entry_category TEXT NOT NULL,
                entry_name TEXT NOT NULL,
                entry_function TEXT,
                status TEXT NOT NULL DEFAULT 'active',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (namespace, task_id)
            );

            CREATE INDEX IF NOT EXISTS idx_checkpoints_namespace ON checkpoints(namespace, status);
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create or replace a checkpoint. `state` must be a JSON object; saving
    /// again reactivates a completed checkpoint.
    pub fn save(
        &self,
        namespace: &Namespace,
        task_id: &str,
        description: &str,
        state: Value,
        entry: EntryPoint,
    ) -> Result<Checkpoint> {
        validate_segment("task id", task_id)?;
        entry.validate()?;
        let state = match state {
            Value::Object(map) => map,
            other => {
                return Err(SkillError::Validation(format!(
                    "checkpoint state must be a JSON object, got {}",
                    other
                )))
            }
        };
        let state_json = serde_json::to_string(&state)?;
        let now = format_timestamp(Utc::now());

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO checkpoints (namespace, task_id, description, state, entry_category, entry_name, entry_function, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'active', ?8, ?8)
             ON CONFLICT(namespace, task_id) DO UPDATE SET
                description = excluded.description,
                state = excluded.state,
                entry_category = excluded.entry_category,
                entry_name = excluded.entry_name,
                entry_function = excluded.entry_function,
                status = 'active',
                updated_at = excluded.updated_at",
            params![
                namespace.as_str(),
                task_id,
                description,
                state_json,
                entry.category,
                entry.name,
                entry.function,
                now,
            ],
        )?;
        let checkpoint = Self::fetch(&tx, namespace, task_id)?
            .ok_or_else(|| SkillError::Storage(format!("checkpoint {} vanished after write", task_id)))?;
        tx.commit()?;

        info!("Checkpoint {} saved for {}", task_id, namespace);
        Ok(checkpoint)
    }

    fn fetch(conn: &Connection, namespace: &Namespace, task_id: &str) -> Result<Option<Checkpoint>> {
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {} FROM checkpoints WHERE namespace = ?1 AND task_id = ?2",
                    SELECT_COLUMNS
                ),
                params![namespace.as_str(), task_id],
                raw_from_row,
            )
            .optional()?;
        raw.map(|r| decode(namespace, r)).transpose()
    }

    pub fn get(&self, namespace: &Namespace, task_id: &str) -> Result<Checkpoint> {
        let conn = self.conn.lock();
        Self::fetch(&conn, namespace, task_id)?
            .ok_or_else(|| SkillError::NotFound(format!("checkpoint {} in {}", task_id, namespace)))
    }

    /// Checkpoints of a namespace, most recently updated first
    pub fn list(&self, namespace: &Namespace) -> Result<Vec<Checkpoint>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM checkpoints WHERE namespace = ?1 ORDER BY updated_at DESC, task_id",
            SELECT_COLUMNS
        ))?;
        let raws = stmt
            .query_map(params![namespace.as_str()], raw_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(|raw| decode(namespace, raw)).collect()
    }

    pub fn mark_completed(&self, namespace: &Namespace, task_id: &str) -> Result<()> {
        let changed = self.conn.lock().execute(
            "UPDATE checkpoints SET status = 'completed', updated_at = ?3
             WHERE namespace = ?1 AND task_id = ?2",
            params![namespace.as_str(), task_id, format_timestamp(Utc::now())],
        )?;
        if changed == 0 {
            return Err(SkillError::NotFound(format!("checkpoint {} in {}", task_id, namespace)));
        }
        Ok(())
    }

    pub fn delete(&self, namespace: &Namespace, task_id: &str) -> Result<bool> {
        let changed = self.conn.lock().execute(
            "DELETE FROM checkpoints WHERE namespace = ?1 AND task_id = ?2",
            params![namespace.as_str(), task_id],
        )?;
        Ok(changed > 0)
    }
}

impl std::fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_store() -> (CheckpointStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(&dir.path().join("skills.db")).unwrap();
        (store, dir)
    }

    #[test]
    fn test_save_get_complete() {
        let (store, _dir) = create_test_store();
        let ns = Namespace::new("agent-1").unwrap();
        let entry = EntryPoint::new("etl", "sync").with_function("resume_from");

        let saved = store
            .save(&ns, "task-42", "halfway", json!({"offset": 500}), entry.clone())
            .unwrap();
        assert!(saved.status.is_active());
        assert_eq!(saved.state.get("offset"), Some(&json!(500)));

        let loaded = store.get(&ns, "task-42").unwrap();
        assert_eq!(loaded.entry, entry);

        store.mark_completed(&ns, "task-42").unwrap();
        assert_eq!(store.get(&ns, "task-42").unwrap().status, CheckpointStatus::Completed);

        // Saving again reactivates.
        store
            .save(&ns, "task-42", "again", json!({"offset": 900}), entry)
            .unwrap();
        let reloaded = store.get(&ns, "task-42").unwrap();
        assert!(reloaded.status.is_active());
        assert_eq!(reloaded.created_at, saved.created_at);
    }

    #[test]
    fn test_validation() {
        let (store, _dir) = create_test_store();
        let ns = Namespace::new("a").unwrap();
        let entry = EntryPoint::new("etl", "sync");

        assert!(store.save(&ns, "t1", "", json!([1, 2]), entry.clone()).is_err());
        assert!(store.save(&ns, "bad id", "", json!({}), entry).is_err());
        assert!(store
            .save(&ns, "t1", "", json!({}), EntryPoint::new("etl", "sync").with_function("1abc"))
            .is_err());
        assert!(store.list(&ns).unwrap().is_empty());
    }

    #[test]
    fn test_namespace_isolation() {
        let (store, _dir) = create_test_store();
        let a = Namespace::new("a").unwrap();
        let b = Namespace::new("b").unwrap();
        store
            .save(&a, "t1", "", json!({}), EntryPoint::new("etl", "sync"))
            .unwrap();
        assert!(store.list(&b).unwrap().is_empty());
        assert!(matches!(store.get(&b, "t1"), Err(SkillError::NotFound(_))));
        assert!(!store.delete(&b, "t1").unwrap());
        assert!(store.delete(&a, "t1").unwrap());
    }
}
