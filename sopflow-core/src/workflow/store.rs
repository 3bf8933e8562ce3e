//! SQLite persistence for the live run, its history, checkpoints and
//! archive tables.
//!
//! The live run is a single row (`id = 1`) replaced wholesale on every
//! write, so a crash between operations never leaves a half-updated state.

use crate::error::StoreError;
use crate::workflow::registry::FieldType;
use crate::workflow::types::{
    CheckpointInfo, HistoryAction, HistoryEntry, LoopCounter, WorkflowState, WorkflowStatus,
};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS workflow_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    flow_name TEXT NOT NULL,
    current_step TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'running',
    data TEXT NOT NULL DEFAULT '{}',
    loop_state TEXT NOT NULL DEFAULT '{}',
    started_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS workflow_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    flow_name TEXT NOT NULL,
    step_path TEXT NOT NULL,
    action TEXT NOT NULL,
    data TEXT,
    timestamp TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS workflow_checkpoints (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    flow_name TEXT NOT NULL,
    state TEXT NOT NULL,
    timestamp TEXT NOT NULL
);
"#;

/// Durable store for the single live workflow run.
#[derive(Debug)]
pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    /// Open (or create) a store file with write-ahead logging enabled.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_options(path, true)
    }

    pub fn open_with_options(path: impl AsRef<Path>, wal: bool) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        if wal {
            // journal_mode returns a row, so it cannot go through execute().
            conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        }
        let store = Self { conn };
        store.migrate()?;
        info!(path = %path.display(), wal, "Opened workflow store");
        Ok(store)
    }

    /// A throwaway store, mostly for tests and dry runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Write the live row, replacing whatever was there.
    pub fn save_state(&self, state: &WorkflowState) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO workflow_state
             (id, flow_name, current_step, status, data, loop_state, started_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                state.flow_name,
                state.current_step,
                state.status.to_string(),
                serde_json::to_string(&state.data)?,
                serde_json::to_string(&state.loop_state)?,
                state.started_at.to_rfc3339(),
            ],
        )?;
        debug!(
            step = %state.current_step,
            status = %state.status,
            loops = state.loop_state.len(),
            "Saved workflow state"
        );
        Ok(())
    }

    pub fn current_state(&self) -> Result<Option<WorkflowState>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT flow_name, current_step, status, data, loop_state, started_at
                 FROM workflow_state WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((flow_name, current_step, status, data, loop_state, started_at)) = row else {
            return Ok(None);
        };

        let status: WorkflowStatus = status.parse().map_err(|message| StoreError::Corrupt {
            column: "status".into(),
            message,
        })?;
        let data: Map<String, Value> = serde_json::from_str(&data)?;
        let loop_state: IndexMap<String, LoopCounter> = serde_json::from_str(&loop_state)?;

        Ok(Some(WorkflowState {
            flow_name,
            current_step,
            status,
            data,
            loop_state,
            started_at: parse_timestamp("started_at", &started_at)?,
        }))
    }

    /// Append a history row and return its id.
    pub fn append_history(
        &self,
        flow_name: &str,
        step_path: &str,
        action: HistoryAction,
        data: Option<&str>,
    ) -> Result<i64, StoreError> {
        self.conn.execute(
            "INSERT INTO workflow_history (flow_name, step_path, action, data, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                flow_name,
                step_path,
                action.to_string(),
                data,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// The most recent `limit` history rows, newest first.
    pub fn history(&self, limit: usize) -> Result<Vec<HistoryEntry>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, flow_name, step_path, action, data, timestamp
             FROM workflow_history ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, flow_name, step_path, action, data, timestamp) = row?;
            let action: HistoryAction = action.parse().map_err(|message| StoreError::Corrupt {
                column: "action".into(),
                message,
            })?;
            entries.push(HistoryEntry {
                id,
                flow_name,
                step_path,
                action,
                data,
                timestamp: parse_timestamp("timestamp", &timestamp)?,
            });
        }
        Ok(entries)
    }

    /// Store `state` under `name`, replacing an older checkpoint of the same name.
    pub fn save_checkpoint(&self, name: &str, state: &WorkflowState) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO workflow_checkpoints (name, flow_name, state, timestamp)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                name,
                state.flow_name,
                serde_json::to_string(state)?,
                Utc::now().to_rfc3339()
            ],
        )?;
        debug!(checkpoint = %name, step = %state.current_step, "Saved checkpoint");
        Ok(())
    }

    pub fn load_checkpoint(&self, name: &str) -> Result<Option<WorkflowState>, StoreError> {
        let snapshot: Option<String> = self
            .conn
            .query_row(
                "SELECT state FROM workflow_checkpoints WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        snapshot
            .map(|text| serde_json::from_str(&text).map_err(StoreError::from))
            .transpose()
    }

    /// Checkpoint metadata, oldest first.
    pub fn list_checkpoints(&self) -> Result<Vec<CheckpointInfo>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT name, flow_name, timestamp FROM workflow_checkpoints ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut checkpoints = Vec::new();
        for row in rows {
            let (name, flow_name, timestamp) = row?;
            checkpoints.push(CheckpointInfo {
                name,
                flow_name,
                created_at: parse_timestamp("timestamp", &timestamp)?,
            });
        }
        Ok(checkpoints)
    }

    /// Create an archive table if it does not exist yet. Without a schema
    /// the table holds the whole payload as JSON in a `payload` column.
    pub fn ensure_archive_table(
        &self,
        table: &str,
        schema: Option<&BTreeMap<String, FieldType>>,
    ) -> Result<(), StoreError> {
        let columns = match schema {
            Some(fields) if !fields.is_empty() => fields
                .iter()
                .map(|(name, ty)| format!("{} {}", quote_ident(name), ty.sql_type()))
                .collect::<Vec<_>>()
                .join(", "),
            _ => "\"payload\" TEXT".to_string(),
        };
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (id INTEGER PRIMARY KEY AUTOINCREMENT, {}, created_at TEXT NOT NULL DEFAULT (datetime('now')))",
            quote_ident(table),
            columns
        ))?;
        Ok(())
    }

    /// Append one archived output row. Only declared schema fields are
    /// written; nested values are stored as JSON text.
    pub fn insert_archive_row(
        &self,
        table: &str,
        schema: Option<&BTreeMap<String, FieldType>>,
        payload: &Map<String, Value>,
    ) -> Result<i64, StoreError> {
        let (columns, values): (Vec<String>, Vec<SqlValue>) = match schema {
            Some(fields) if !fields.is_empty() => fields
                .keys()
                .filter_map(|name| payload.get(name).map(|v| (quote_ident(name), to_sql(v))))
                .unzip(),
            _ => (
                vec!["\"payload\"".to_string()],
                vec![SqlValue::Text(serde_json::to_string(payload)?)],
            ),
        };

        let sql = if columns.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", quote_ident(table))
        } else {
            let placeholders = (1..=columns.len())
                .map(|i| format!("?{i}"))
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(table),
                columns.join(", "),
                placeholders
            )
        };
        self.conn.execute(&sql, params_from_iter(values))?;
        debug!(table = %table, "Archived step output");
        Ok(self.conn.last_insert_rowid())
    }

    /// Delete the live row and all history. Checkpoints survive.
    pub fn reset(&self) -> Result<(), StoreError> {
        self.conn
            .execute_batch("DELETE FROM workflow_state; DELETE FROM workflow_history;")?;
        info!("Reset workflow store");
        Ok(())
    }

    /// Row count of an arbitrary table, used to inspect archives.
    pub fn count_rows(&self, table: &str) -> Result<i64, StoreError> {
        let count = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_ident(table)),
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => n.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null),
        Value::String(s) => SqlValue::Text(s.clone()),
        nested => SqlValue::Text(nested.to_string()),
    }
}

fn parse_timestamp(column: &str, text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            column: column.to_string(),
            message: e.to_string(),
        })
}
