use super::interval::Interval;
use super::service::{TaskError, TaskService};
use crate::task_store::{TaskDefinition, TaskRegistry};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
struct ScheduleState {
    interval: Interval,
    last_executed: Option<DateTime<Utc>>,
    next_executing: DateTime<Utc>,
}

#[derive(Debug)]
struct ArgumentState {
    value: JsonValue,
    dirty: bool,
}

/// Runtime binding of one task definition to the service that executes it.
///
/// A context lives as long as its definition: cache rebuilds carry it over by
/// id and refresh it from the registry. The running flag is only ever set
/// through a compare-and-swap, so at most one execution per task is in flight.
pub struct TaskContext {
    id: i64,
    name: String,
    type_name: String,
    service: Arc<dyn TaskService>,
    schedule: Mutex<ScheduleState>,
    argument: Mutex<ArgumentState>,
    running: AtomicBool,
    rerun_requested: AtomicBool,
    manual_trigger: AtomicBool,
}

impl TaskContext {
    pub fn new(definition: TaskDefinition, service: Arc<dyn TaskService>) -> Self {
        Self {
            id: definition.id,
            name: definition.name,
            type_name: definition.type_name,
            service,
            schedule: Mutex::new(ScheduleState {
                interval: definition.interval,
                last_executed: definition.last_executed,
                next_executing: definition.next_executing,
            }),
            argument: Mutex::new(ArgumentState {
                value: definition.argument,
                dirty: false,
            }),
            running: AtomicBool::new(false),
            rerun_requested: AtomicBool::new(false),
            manual_trigger: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn interval(&self) -> Interval {
        lock(&self.schedule).interval.clone()
    }

    pub fn service(&self) -> &Arc<dyn TaskService> {
        &self.service
    }

    pub fn last_executed(&self) -> Option<DateTime<Utc>> {
        lock(&self.schedule).last_executed
    }

    pub fn next_executing(&self) -> DateTime<Utc> {
        lock(&self.schedule).next_executing
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether the task should be dispatched at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.is_running() && self.next_executing() <= now
    }

    /// Claim the task for one execution. Returns `false` if it is already running.
    pub(crate) fn try_begin_run(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn finish_run(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Make the next run happen as soon as the current one finishes instead
    /// of waiting for the interval.
    pub fn request_rerun(&self) {
        self.rerun_requested.store(true, Ordering::SeqCst);
    }

    /// Record a finished run and compute the next execution time.
    /// Returns `(next_executing, last_executed)`.
    pub(crate) fn complete_run(&self, finished_at: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let rerun = self.rerun_requested.swap(false, Ordering::SeqCst);
        let mut schedule = lock(&self.schedule);
        let next_executing = if rerun {
            finished_at
        } else {
            schedule.interval.next(finished_at)
        };
        schedule.last_executed = Some(finished_at);
        schedule.next_executing = next_executing;
        (next_executing, finished_at)
    }

    /// Adopt the registry's copy of this task, picked up by a cache rebuild.
    ///
    /// A definition read before the latest run finished is older than what
    /// this context holds and is ignored, so a stale read can never make a
    /// finished task due again. Returns whether the definition was applied.
    pub(crate) fn sync_from(&self, definition: &TaskDefinition) -> bool {
        let mut schedule = lock(&self.schedule);
        if definition.last_executed < schedule.last_executed {
            return false;
        }
        schedule.interval = definition.interval.clone();
        schedule.last_executed = definition.last_executed;
        schedule.next_executing = definition.next_executing;
        drop(schedule);

        let mut argument = lock(&self.argument);
        if !argument.dirty {
            argument.value = definition.argument.clone();
        }
        true
    }

    /// Move the next execution to `next_executing` without touching `last_executed`.
    pub(crate) fn reschedule(&self, next_executing: DateTime<Utc>) {
        lock(&self.schedule).next_executing = next_executing;
    }

    pub(crate) fn mark_manual_trigger(&self) {
        self.manual_trigger.store(true, Ordering::SeqCst);
    }

    /// How the run being started was triggered, consuming any manual trigger.
    pub(crate) fn take_trigger_source(&self) -> &'static str {
        if self.manual_trigger.swap(false, Ordering::SeqCst) {
            "manual"
        } else {
            "schedule"
        }
    }

    pub fn argument(&self) -> JsonValue {
        lock(&self.argument).value.clone()
    }

    /// Replace the payload. The new value is written back to the registry
    /// after the current run.
    pub fn set_argument(&self, value: JsonValue) {
        let mut argument = lock(&self.argument);
        argument.value = value;
        argument.dirty = true;
    }

    pub(crate) fn take_dirty_argument(&self) -> Option<JsonValue> {
        let mut argument = lock(&self.argument);
        if argument.dirty {
            argument.dirty = false;
            Some(argument.value.clone())
        } else {
            None
        }
    }
}

/// What a task service receives when it runs: the payload plus handles to its
/// own context and to the task registry.
#[derive(Clone)]
pub struct TaskArgument {
    context: Arc<TaskContext>,
    registry: Arc<dyn TaskRegistry>,
    cancellation_token: CancellationToken,
}

impl TaskArgument {
    pub fn new(
        context: Arc<TaskContext>,
        registry: Arc<dyn TaskRegistry>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            context,
            registry,
            cancellation_token,
        }
    }

    pub fn context(&self) -> &Arc<TaskContext> {
        &self.context
    }

    pub fn registry(&self) -> &Arc<dyn TaskRegistry> {
        &self.registry
    }

    pub fn payload(&self) -> JsonValue {
        self.context.argument()
    }

    /// Decode the payload, falling back to `T::default()` when none is set.
    pub fn parse<T: DeserializeOwned + Default>(&self) -> Result<T, TaskError> {
        let payload = self.payload();
        if payload.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(payload).map_err(|e| TaskError::InvalidArgument(e.to_string()))
    }

    pub fn set_payload(&self, value: JsonValue) {
        self.context.set_argument(value);
    }

    /// Check if the host is shutting down.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }
}
