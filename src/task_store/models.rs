use crate::background_tasks::Interval;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Durable record describing a recurring task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: i64,
    pub name: String,
    /// Key of the task service that executes this task (case-insensitive).
    pub type_name: String,
    /// Opaque payload handed to the service on every run.
    pub argument: JsonValue,
    pub interval: Interval,
    pub last_executed: Option<DateTime<Utc>>,
    pub next_executing: DateTime<Utc>,
}

/// What the registry needs to know about a task service to create its
/// default definition.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub type_name: String,
    pub name: String,
    pub interval: Interval,
    pub argument: JsonValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskRunStatus {
    Running,
    Completed,
    Failed,
}

impl TaskRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskRunStatus::Running => "running",
            TaskRunStatus::Completed => "completed",
            TaskRunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(TaskRunStatus::Running),
            "completed" => Some(TaskRunStatus::Completed),
            "failed" => Some(TaskRunStatus::Failed),
            _ => None,
        }
    }
}

/// One execution of a task.
#[derive(Debug, Clone)]
pub struct TaskRun {
    pub id: i64,
    pub task_id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: TaskRunStatus,
    pub error_message: Option<String>,
    /// "schedule" or "manual"
    pub triggered_by: String,
}

/// A failure recorded through `TaskRegistry::log_error`.
#[derive(Debug, Clone, Serialize)]
pub struct TaskErrorEntry {
    pub id: i64,
    /// `None` for failures that happened outside of a specific task.
    pub task_name: Option<String>,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}
