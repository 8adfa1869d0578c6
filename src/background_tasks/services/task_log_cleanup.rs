//! Task log cleanup service.
//!
//! Periodically deletes old task error log entries and finished run history
//! based on the configured retention period.

use crate::background_tasks::{Interval, TaskArgument, TaskError, TaskService};
use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Payload accepted by [`TaskLogCleanupService`]. Overrides the configured retention.
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskLogCleanupArgument {
    #[serde(default)]
    pub retention_days: Option<u64>,
}

pub struct TaskLogCleanupService {
    retention_days: u64,
}

impl TaskLogCleanupService {
    pub fn new(retention_days: u64) -> Self {
        Self { retention_days }
    }
}

#[async_trait]
impl TaskService for TaskLogCleanupService {
    fn type_name(&self) -> &'static str {
        "taskhost::TaskLogCleanup"
    }

    fn name(&self) -> &'static str {
        "Task Log Cleanup"
    }

    fn description(&self) -> &'static str {
        "Delete old task errors and run history based on retention policy"
    }

    fn default_interval(&self) -> Interval {
        Interval::Every(std::time::Duration::from_secs(24 * 60 * 60))
    }

    async fn execute(&self, argument: &TaskArgument) -> Result<(), TaskError> {
        if argument.is_cancelled() {
            return Err(TaskError::Cancelled);
        }

        let payload: TaskLogCleanupArgument = argument.parse()?;
        let retention_days = payload.retention_days.unwrap_or(self.retention_days);
        let days = i64::try_from(retention_days)
            .map_err(|_| TaskError::InvalidArgument(format!("retention_days {retention_days} is too large")))?;
        let cutoff = TimeDelta::try_days(days)
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
            .ok_or_else(|| {
                TaskError::InvalidArgument(format!("retention_days {retention_days} is too large"))
            })?;

        info!(
            "Cleaning up task logs older than {} days (cutoff: {})",
            retention_days, cutoff
        );

        let registry = argument.registry();
        let errors = registry.cleanup_old_errors(cutoff)?;
        let runs = registry.cleanup_old_runs(cutoff)?;

        if errors + runs > 0 {
            info!("Deleted {} task errors and {} task runs", errors, runs);
        } else {
            info!("No task logs to clean up");
        }

        Ok(())
    }
}
