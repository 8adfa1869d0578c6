use super::scheduler::SchedulerShared;
use crate::task_store::{TaskErrorEntry, TaskRun};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Task not found")]
    NotFound,
    #[error("Task is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Registry(#[from] anyhow::Error),
}

/// Snapshot of a task as the scheduler currently sees it.
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub id: i64,
    pub name: String,
    pub type_name: String,
    pub interval: String,
    pub is_running: bool,
    pub last_executed: Option<String>,
    pub next_executing: String,
}

/// Cloneable handle to inspect and steer a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<SchedulerShared>,
}

impl SchedulerHandle {
    pub(crate) fn new(shared: Arc<SchedulerShared>) -> Self {
        Self { shared }
    }

    /// Get information about all tasks that have a service.
    pub async fn list_tasks(&self) -> Result<Vec<TaskInfo>, SchedulerError> {
        let contexts = self.shared.load_contexts().await?;
        Ok(contexts
            .iter()
            .map(|context| TaskInfo {
                id: context.id(),
                name: context.name().to_string(),
                type_name: context.type_name().to_string(),
                interval: context.interval().to_string(),
                is_running: context.is_running(),
                last_executed: context.last_executed().map(|dt| dt.to_rfc3339()),
                next_executing: context.next_executing().to_rfc3339(),
            })
            .collect())
    }

    /// Make a task due right away. The run is recorded as manually triggered.
    pub async fn trigger_task(&self, id: i64) -> Result<(), SchedulerError> {
        let contexts = self.shared.load_contexts().await?;
        let context = contexts
            .iter()
            .find(|context| context.id() == id)
            .ok_or(SchedulerError::NotFound)?;

        if context.is_running() {
            return Err(SchedulerError::AlreadyRunning);
        }

        let now = Utc::now();
        self.shared
            .registry()
            .set_execute_date(id, now, context.last_executed())?;
        context.mark_manual_trigger();
        context.reschedule(now);
        Ok(())
    }

    /// Drop the cached contexts so the next pass reloads them from the registry.
    pub async fn invalidate(&self) {
        self.shared.invalidate().await;
    }

    /// Get execution history for a task, newest first.
    pub fn task_history(&self, id: i64, limit: usize) -> Result<Vec<TaskRun>, SchedulerError> {
        Ok(self.shared.registry().get_task_history(id, limit)?)
    }

    /// Get the most recent entries of the task error log.
    pub fn recent_errors(&self, limit: usize) -> Result<Vec<TaskErrorEntry>, SchedulerError> {
        Ok(self.shared.registry().get_errors(limit)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background_tasks::{
        AlwaysInstalled, Interval, SchedulerSettings, TaskArgument, TaskError, TaskScheduler,
        TaskService, TaskServices,
    };
    use crate::task_store::{ServiceDescriptor, SqliteTaskStore, TaskRegistry};
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct Nightly;

    #[async_trait]
    impl TaskService for Nightly {
        fn name(&self) -> &'static str {
            "Nightly"
        }

        fn default_interval(&self) -> Interval {
            Interval::daily(3, 0).unwrap()
        }

        async fn execute(&self, _argument: &TaskArgument) -> Result<(), TaskError> {
            Ok(())
        }
    }

    fn create_test_handle() -> (SchedulerHandle, Arc<SqliteTaskStore>, i64) {
        let store = Arc::new(SqliteTaskStore::open_in_memory().unwrap());
        let services = TaskServices::new([Arc::new(Nightly) as Arc<dyn TaskService>]);
        store.ensure_task_services(&services.descriptors()).unwrap();
        let id = store.load_tasks().unwrap()[0].id;
        store
            .set_execute_date(id, Utc::now() + chrono::TimeDelta::hours(5), None)
            .unwrap();

        let scheduler = TaskScheduler::new(
            services,
            store.clone(),
            Arc::new(AlwaysInstalled),
            SchedulerSettings::default(),
            CancellationToken::new(),
        );
        (scheduler.handle(), store, id)
    }

    #[tokio::test]
    async fn test_list_tasks() {
        let (handle, store, id) = create_test_handle();
        store
            .ensure_task_services(&[ServiceDescriptor {
                type_name: "gone::Task".to_string(),
                name: "Gone".to_string(),
                interval: Interval::every_secs(60).unwrap(),
                argument: serde_json::Value::Null,
            }])
            .unwrap();

        let tasks = handle.list_tasks().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, id);
        assert_eq!(tasks[0].name, "Nightly");
        assert_eq!(tasks[0].interval, "daily@03:00");
        assert!(!tasks[0].is_running);
        assert!(tasks[0].last_executed.is_none());
    }

    #[tokio::test]
    async fn test_trigger_task() {
        let (handle, store, id) = create_test_handle();

        handle.trigger_task(id).await.unwrap();

        let tasks = handle.list_tasks().await.unwrap();
        let next = chrono::DateTime::parse_from_rfc3339(&tasks[0].next_executing).unwrap();
        assert!(next <= Utc::now());
        let persisted = store.get_task(id).unwrap().unwrap();
        assert!(persisted.next_executing <= Utc::now());
    }

    #[tokio::test]
    async fn test_trigger_unknown_or_running_task() {
        let (handle, _store, id) = create_test_handle();

        assert!(matches!(
            handle.trigger_task(id + 100).await,
            Err(SchedulerError::NotFound)
        ));

        let contexts = handle.shared.load_contexts().await.unwrap();
        assert!(contexts[0].try_begin_run());
        assert!(matches!(
            handle.trigger_task(id).await,
            Err(SchedulerError::AlreadyRunning)
        ));
    }

    #[tokio::test]
    async fn test_invalidate_reloads_definitions() {
        let (handle, store, id) = create_test_handle();
        assert_eq!(handle.list_tasks().await.unwrap().len(), 1);

        store.delete_task(id).unwrap();
        assert_eq!(handle.list_tasks().await.unwrap().len(), 1);

        handle.invalidate().await;
        assert!(handle.list_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_history_and_errors() {
        let (handle, store, id) = create_test_handle();
        store.record_run_start(id, "manual").unwrap();
        store.log_error(Some("Nightly"), &anyhow::anyhow!("boom"));

        assert_eq!(handle.task_history(id, 5).unwrap()[0].triggered_by, "manual");
        assert_eq!(handle.recent_errors(5).unwrap()[0].message, "boom");
    }
}
