mod models;
mod schema;
mod sqlite_task_store;

pub use models::*;
pub use schema::TASK_VERSIONED_SCHEMAS;
pub use sqlite_task_store::SqliteTaskStore;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

/// Durable catalogue of task definitions, run history and task errors.
///
/// The scheduler only ever goes through this trait; every call is independent
/// and no transactional guarantee spans several calls.
pub trait TaskRegistry: Send + Sync {
    // Definitions
    fn load_tasks(&self) -> Result<Vec<TaskDefinition>>;
    fn get_task(&self, id: i64) -> Result<Option<TaskDefinition>>;
    /// Create a definition for every service that has none yet.
    /// Returns the number of definitions created.
    fn ensure_task_services(&self, services: &[ServiceDescriptor]) -> Result<usize>;
    fn set_execute_date(
        &self,
        id: i64,
        next_executing: DateTime<Utc>,
        last_executed: Option<DateTime<Utc>>,
    ) -> Result<()>;
    fn set_argument(&self, id: i64, argument: &JsonValue) -> Result<()>;
    fn delete_task(&self, id: i64) -> Result<bool>;

    // Error log
    /// Record a failure. Never fails; storage problems are only traced.
    fn log_error(&self, task_name: Option<&str>, error: &anyhow::Error);
    fn get_errors(&self, limit: usize) -> Result<Vec<TaskErrorEntry>>;
    fn cleanup_old_errors(&self, before: DateTime<Utc>) -> Result<usize>;

    // Run history
    fn record_run_start(&self, task_id: i64, triggered_by: &str) -> Result<i64>;
    fn record_run_finish(
        &self,
        run_id: i64,
        status: TaskRunStatus,
        error_message: Option<String>,
    ) -> Result<()>;
    fn get_task_history(&self, task_id: i64, limit: usize) -> Result<Vec<TaskRun>>;
    fn mark_stale_runs_failed(&self) -> Result<usize>;
    fn cleanup_old_runs(&self, before: DateTime<Utc>) -> Result<usize>;
}
