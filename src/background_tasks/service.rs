use super::context::TaskArgument;
use super::interval::Interval;
use crate::task_store::ServiceDescriptor;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors a task service can report from `execute`.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Execution failed: {0}")]
    Failed(String),
    #[error("Invalid task argument: {0}")]
    InvalidArgument(String),
    #[error("Task was cancelled")]
    Cancelled,
    #[error("Task panicked: {0}")]
    Panicked(String),
    #[error(transparent)]
    Registry(#[from] anyhow::Error),
}

/// A pluggable unit of recurring work.
///
/// One definition per service lives in the task registry; the scheduler runs
/// `execute` whenever that definition is due. The scheduler never starts a
/// second execution of the same task while one is in flight, but gives no
/// ordering guarantee across different tasks.
#[async_trait]
pub trait TaskService: Send + Sync {
    /// Stable key stored in the registry. Lookups ignore case.
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Human-readable name for this task.
    fn name(&self) -> &'static str;

    /// Description of what this task does.
    fn description(&self) -> &'static str {
        ""
    }

    /// Interval given to the definition created the first time this service is seen.
    fn default_interval(&self) -> Interval;

    /// Payload given to the definition created the first time this service is seen.
    fn default_argument(&self) -> JsonValue {
        JsonValue::Null
    }

    /// Run the task once.
    ///
    /// Long-running work should poll `argument.is_cancelled()` and return
    /// `TaskError::Cancelled` once the host shuts down.
    async fn execute(&self, argument: &TaskArgument) -> Result<(), TaskError>;
}

/// Immutable set of task services, keyed by lowercase type name.
#[derive(Clone, Default)]
pub struct TaskServices {
    services: HashMap<String, Arc<dyn TaskService>>,
}

impl TaskServices {
    pub fn new(services: impl IntoIterator<Item = Arc<dyn TaskService>>) -> Self {
        let services = services
            .into_iter()
            .map(|service| (service.type_name().to_lowercase(), service))
            .collect();
        Self { services }
    }

    pub fn get(&self, type_name: &str) -> Option<&Arc<dyn TaskService>> {
        self.services.get(&type_name.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Descriptors handed to the registry so every service gets a definition.
    pub fn descriptors(&self) -> Vec<ServiceDescriptor> {
        let mut descriptors: Vec<ServiceDescriptor> = self
            .services
            .values()
            .map(|service| ServiceDescriptor {
                type_name: service.type_name().to_string(),
                name: service.name().to_string(),
                interval: service.default_interval(),
                argument: service.default_argument(),
            })
            .collect();
        descriptors.sort_by(|a, b| a.type_name.cmp(&b.type_name));
        descriptors
    }
}
