use super::models::{ServiceDescriptor, TaskDefinition, TaskErrorEntry, TaskRun, TaskRunStatus};
use super::schema::TASK_VERSIONED_SCHEMAS;
use super::TaskRegistry;
use crate::background_tasks::{InstallGate, InstallState, Interval};
use crate::sqlite_persistence::{open_versioned, read_schema_version};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value as JsonValue;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{error, info, warn};

pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
}

/// Row of the `tasks` table before the payload and interval are decoded.
struct RawTask {
    id: i64,
    name: String,
    type_name: String,
    argument: String,
    interval: String,
    last_executed: Option<String>,
    next_executing: String,
}

impl SqliteTaskStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        let is_new_db = !path.exists();

        let mut conn = Connection::open(path).context("Failed to open task database")?;
        if is_new_db {
            info!("Creating new task database at {:?}", path);
        }
        open_versioned(&mut conn, TASK_VERSIONED_SCHEMAS, is_new_db)
            .with_context(|| format!("Failed to prepare task database at {:?}", path))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Store backed by a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        open_versioned(&mut conn, TASK_VERSIONED_SCHEMAS, true)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn format_datetime(dt: &DateTime<Utc>) -> String {
        dt.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    }

    fn row_to_raw_task(row: &rusqlite::Row) -> rusqlite::Result<RawTask> {
        Ok(RawTask {
            id: row.get("id")?,
            name: row.get("name")?,
            type_name: row.get("type_name")?,
            argument: row.get("argument")?,
            interval: row.get("interval")?,
            last_executed: row.get("last_executed")?,
            next_executing: row.get("next_executing")?,
        })
    }

    fn raw_to_definition(raw: RawTask) -> Result<TaskDefinition> {
        let interval: Interval = raw
            .interval
            .parse()
            .with_context(|| format!("Task {} has an invalid interval", raw.id))?;
        let argument: JsonValue = serde_json::from_str(&raw.argument)
            .with_context(|| format!("Task {} has an invalid argument", raw.id))?;
        let next_executing = Self::parse_datetime(&raw.next_executing)
            .with_context(|| format!("Task {} has an invalid next_executing", raw.id))?;

        Ok(TaskDefinition {
            id: raw.id,
            name: raw.name,
            type_name: raw.type_name,
            argument,
            interval,
            last_executed: raw.last_executed.as_deref().and_then(Self::parse_datetime),
            next_executing,
        })
    }

    fn row_to_task_run(row: &rusqlite::Row) -> rusqlite::Result<TaskRun> {
        let status_str: String = row.get("status")?;
        let started_at_str: String = row.get("started_at")?;
        let finished_at_str: Option<String> = row.get("finished_at")?;

        Ok(TaskRun {
            id: row.get("id")?,
            task_id: row.get("task_id")?,
            started_at: Self::parse_datetime(&started_at_str).unwrap_or_else(Utc::now),
            finished_at: finished_at_str.as_deref().and_then(Self::parse_datetime),
            status: TaskRunStatus::parse(&status_str).unwrap_or(TaskRunStatus::Failed),
            error_message: row.get("error_message")?,
            triggered_by: row.get("triggered_by")?,
        })
    }

    fn row_to_error_entry(row: &rusqlite::Row) -> rusqlite::Result<TaskErrorEntry> {
        let occurred_at_str: String = row.get("occurred_at")?;
        Ok(TaskErrorEntry {
            id: row.get("id")?,
            task_name: row.get("task_name")?,
            message: row.get("message")?,
            occurred_at: Self::parse_datetime(&occurred_at_str).unwrap_or_else(Utc::now),
        })
    }
}

impl TaskRegistry for SqliteTaskStore {
    fn load_tasks(&self) -> Result<Vec<TaskDefinition>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, type_name, argument, interval, last_executed, next_executing
             FROM tasks ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], Self::row_to_raw_task)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut tasks = Vec::with_capacity(rows.len());
        for raw in rows {
            match Self::raw_to_definition(raw) {
                Ok(task) => tasks.push(task),
                Err(e) => warn!("Skipping unreadable task definition: {:#}", e),
            }
        }
        Ok(tasks)
    }

    fn get_task(&self, id: i64) -> Result<Option<TaskDefinition>> {
        let conn = self.conn();
        let raw = conn
            .query_row(
                "SELECT id, name, type_name, argument, interval, last_executed, next_executing
                 FROM tasks WHERE id = ?1",
                params![id],
                Self::row_to_raw_task,
            )
            .optional()?;
        raw.map(Self::raw_to_definition).transpose()
    }

    fn ensure_task_services(&self, services: &[ServiceDescriptor]) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let now = Self::format_datetime(&Utc::now());
        let mut created = 0;

        for service in services {
            let argument = serde_json::to_string(&service.argument)?;
            let inserted = tx.execute(
                "INSERT INTO tasks (name, type_name, argument, interval, last_executed, next_executing)
                 VALUES (?1, ?2, ?3, ?4, NULL, ?5)
                 ON CONFLICT(type_name) DO NOTHING",
                params![
                    service.name,
                    service.type_name,
                    argument,
                    service.interval.to_string(),
                    now
                ],
            )?;
            if inserted > 0 {
                info!(
                    "Registered task definition for {} ({})",
                    service.name, service.type_name
                );
            }
            created += inserted;
        }

        tx.commit()?;
        Ok(created)
    }

    fn set_execute_date(
        &self,
        id: i64,
        next_executing: DateTime<Utc>,
        last_executed: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE tasks SET next_executing = ?1, last_executed = ?2 WHERE id = ?3",
            params![
                Self::format_datetime(&next_executing),
                last_executed.as_ref().map(Self::format_datetime),
                id
            ],
        )?;
        Ok(())
    }

    fn set_argument(&self, id: i64, argument: &JsonValue) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE tasks SET argument = ?1 WHERE id = ?2",
            params![serde_json::to_string(argument)?, id],
        )?;
        Ok(())
    }

    fn delete_task(&self, id: i64) -> Result<bool> {
        let conn = self.conn();
        let deleted = conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    fn log_error(&self, task_name: Option<&str>, err: &anyhow::Error) {
        let message = format!("{:#}", err);
        match task_name {
            Some(name) => error!("Task {} failed: {}", name, message),
            None => error!("Task host failure: {}", message),
        }

        let conn = self.conn();
        if let Err(e) = conn.execute(
            "INSERT INTO task_errors (task_name, message, occurred_at) VALUES (?1, ?2, ?3)",
            params![task_name, message, Self::format_datetime(&Utc::now())],
        ) {
            warn!("Failed to persist task error: {}", e);
        }
    }

    fn get_errors(&self, limit: usize) -> Result<Vec<TaskErrorEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, task_name, message, occurred_at FROM task_errors
             ORDER BY occurred_at DESC, id DESC LIMIT ?1",
        )?;
        let entries = stmt
            .query_map(params![limit as i64], Self::row_to_error_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    fn cleanup_old_errors(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn();
        let deleted = conn.execute(
            "DELETE FROM task_errors WHERE occurred_at < ?1",
            params![Self::format_datetime(&before)],
        )?;
        Ok(deleted)
    }

    fn record_run_start(&self, task_id: i64, triggered_by: &str) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO task_runs (task_id, started_at, status, triggered_by)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                task_id,
                Self::format_datetime(&Utc::now()),
                TaskRunStatus::Running.as_str(),
                triggered_by
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn record_run_finish(
        &self,
        run_id: i64,
        status: TaskRunStatus,
        error_message: Option<String>,
    ) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE task_runs SET finished_at = ?1, status = ?2, error_message = ?3 WHERE id = ?4",
            params![
                Self::format_datetime(&Utc::now()),
                status.as_str(),
                error_message,
                run_id
            ],
        )?;
        Ok(())
    }

    fn get_task_history(&self, task_id: i64, limit: usize) -> Result<Vec<TaskRun>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, task_id, started_at, finished_at, status, error_message, triggered_by
             FROM task_runs WHERE task_id = ?1 ORDER BY started_at DESC, id DESC LIMIT ?2",
        )?;
        let runs = stmt
            .query_map(params![task_id, limit as i64], Self::row_to_task_run)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    fn mark_stale_runs_failed(&self) -> Result<usize> {
        let conn = self.conn();
        // Runs still "running" belong to a previous process that never finished them
        let count = conn.execute(
            "UPDATE task_runs SET status = ?1, finished_at = ?2, error_message = ?3
             WHERE status = ?4",
            params![
                TaskRunStatus::Failed.as_str(),
                Self::format_datetime(&Utc::now()),
                "Run was interrupted (process restart)",
                TaskRunStatus::Running.as_str()
            ],
        )?;
        Ok(count)
    }

    fn cleanup_old_runs(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn();
        let deleted = conn.execute(
            "DELETE FROM task_runs WHERE started_at < ?1 AND status != ?2",
            params![
                Self::format_datetime(&before),
                TaskRunStatus::Running.as_str()
            ],
        )?;
        Ok(deleted)
    }
}

#[async_trait]
impl InstallGate for SqliteTaskStore {
    async fn check(&self) -> Result<InstallState> {
        let version = read_schema_version(&self.conn())?;
        let latest = TASK_VERSIONED_SCHEMAS
            .last()
            .map(|schema| schema.version as i64)
            .unwrap_or_default();
        if version == latest {
            Ok(InstallState::Installed)
        } else {
            Ok(InstallState::Pending)
        }
    }
}
