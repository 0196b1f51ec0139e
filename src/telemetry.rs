//! Telemetry Sink
//!
//! Structured, append-only events about executions and skill writes. The
//! core only writes them; nothing in the crate reads them back.

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::Result;
use crate::sandbox::{BackendKind, ErrorKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum TelemetryEvent {
    Execution {
        namespace: String,
        /// Set when a stored skill was invoked
        category: Option<String>,
        name: Option<String>,
        backend: BackendKind,
        success: bool,
        duration_ms: u64,
        error_kind: Option<ErrorKind>,
        error_type: Option<String>,
        source_lines: usize,
    },
    SkillSave {
        namespace: String,
        category: String,
        name: String,
        dependencies: Vec<String>,
        source_bytes: usize,
    },
    SkillPersisted {
        namespace: String,
        category: String,
        name: String,
    },
    SkillPersistFailed {
        namespace: String,
        category: String,
        name: String,
        error: String,
    },
    Hydration {
        namespace: String,
        written: usize,
        skipped: usize,
    },
}

impl TelemetryEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Execution { .. } => "execution",
            Self::SkillSave { .. } => "skill_save",
            Self::SkillPersisted { .. } => "skill_persisted",
            Self::SkillPersistFailed { .. } => "skill_persist_failed",
            Self::Hydration { .. } => "hydration",
        }
    }

    fn skill(&self) -> (Option<&str>, Option<&str>) {
        match self {
            Self::Execution { category, name, .. } => (category.as_deref(), name.as_deref()),
            Self::SkillSave { category, name, .. }
            | Self::SkillPersisted { category, name, .. }
            | Self::SkillPersistFailed { category, name, .. } => {
                (Some(category.as_str()), Some(name.as_str()))
            }
            Self::Hydration { .. } => (None, None),
        }
    }

    fn success(&self) -> Option<bool> {
        match self {
            Self::Execution { success, .. } => Some(*success),
            Self::SkillPersisted { .. } => Some(true),
            Self::SkillPersistFailed { .. } => Some(false),
            Self::Hydration { skipped, .. } => Some(*skipped == 0),
            Self::SkillSave { .. } => None,
        }
    }
}

/// Destination for telemetry events. Recording never fails the caller.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: &TelemetryEvent);
}

/// Emits events as structured log lines
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn record(&self, event: &TelemetryEvent) {
        match serde_json::to_string(event) {
            Ok(json) => info!(target: "skillforge::telemetry", event = event.event_type(), "{}", json),
            Err(e) => warn!("Unserializable telemetry event: {}", e),
        }
    }
}

/// Appends events to an SQLite `events` table
pub struct SqliteSink {
    conn: Mutex<Connection>,
}

impl SqliteSink {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                event_type TEXT NOT NULL,
                data TEXT NOT NULL,
                skill_category TEXT,
                skill_name TEXT,
                success INTEGER,
                duration_ms INTEGER,
                error_type TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_events_type_time ON events(event_type, timestamp);
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, event: &TelemetryEvent) -> Result<()> {
        let data = serde_json::to_string(event)?;
        let (category, name) = event.skill();
        let (duration_ms, error_type) = match event {
            TelemetryEvent::Execution {
                duration_ms,
                error_type,
                ..
            } => (Some(*duration_ms as i64), error_type.clone()),
            _ => (None, None),
        };

        self.conn.lock().execute(
            "INSERT INTO events (timestamp, event_type, data, skill_category, skill_name, success, duration_ms, error_type)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                crate::skills::store::format_timestamp(Utc::now()),
                event.event_type(),
                data,
                category,
                name,
                event.success(),
                duration_ms,
                error_type,
            ],
        )?;
        Ok(())
    }
}

impl TelemetrySink for SqliteSink {
    fn record(&self, event: &TelemetryEvent) {
        if let Err(e) = self.insert(event) {
            warn!("Failed to record {} event: {}", event.event_type(), e);
        }
    }
}

/// Keeps events in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().clone()
    }
}

impl TelemetrySink for MemorySink {
    fn record(&self, event: &TelemetryEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Forwards every event to several sinks
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn TelemetrySink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn TelemetrySink>>) -> Self {
        Self { sinks }
    }
}

impl TelemetrySink for FanoutSink {
    fn record(&self, event: &TelemetryEvent) {
        for sink in &self.sinks {
            sink.record(event);
        }
    }
}
