use super::context::{TaskArgument, TaskContext};
use super::handle::SchedulerHandle;
use super::install_gate::{wait_installed, InstallGate};
use super::service::{TaskError, TaskServices};
use crate::metrics;
use crate::task_store::{TaskRegistry, TaskRunStatus};
use anyhow::{anyhow, Context};
use chrono::{SubsecRound, Utc};
use futures::FutureExt;
use moka::future::Cache;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Cache key under which the loaded task contexts are stored.
pub const TASK_CONTEXTS_CACHE_KEY: &str = "background_tasks::contexts";

pub(crate) type ContextList = Arc<Vec<Arc<TaskContext>>>;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// How long loaded task contexts are reused before being rebuilt from the registry.
    pub cache_ttl: Duration,
    /// Pause after each task evaluation and after each pass.
    pub poll_delay: Duration,
    /// Pause between two installation checks.
    pub install_poll_interval: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
            poll_delay: Duration::from_secs(1),
            install_poll_interval: Duration::from_secs(1),
        }
    }
}

/// State shared by the scheduler loop and its handles.
pub(crate) struct SchedulerShared {
    services: TaskServices,
    registry: Arc<dyn TaskRegistry>,
    contexts: Cache<&'static str, ContextList>,
    /// Every context handed out so far, by task id. Rebuilds reuse these, so a
    /// pass still walking an older list and a handle holding a newer one see
    /// the same running flag for a given task.
    live: Mutex<HashMap<i64, Arc<TaskContext>>>,
}

impl SchedulerShared {
    pub(crate) fn registry(&self) -> &Arc<dyn TaskRegistry> {
        &self.registry
    }

    /// Current task contexts, rebuilt from the registry once the cache expires.
    pub(crate) async fn load_contexts(&self) -> anyhow::Result<ContextList> {
        self.contexts
            .try_get_with(TASK_CONTEXTS_CACHE_KEY, async { self.rebuild_contexts() })
            .await
            .map_err(|e| anyhow!("{:#}", e))
    }

    fn rebuild_contexts(&self) -> anyhow::Result<ContextList> {
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        let definitions = self
            .registry
            .load_tasks()
            .context("Failed to load task definitions")?;

        let mut previous = std::mem::take(&mut *live);
        let mut contexts = Vec::with_capacity(definitions.len());
        for definition in definitions {
            let context = match previous.remove(&definition.id) {
                Some(existing) => {
                    if !existing.sync_from(&definition) {
                        debug!("Keeping newer schedule of task {}", existing.name());
                    }
                    existing
                }
                None => match self.services.get(&definition.type_name) {
                    Some(service) => Arc::new(TaskContext::new(definition, Arc::clone(service))),
                    None => {
                        debug!(
                            "No task service for {} ({}), skipping",
                            definition.name, definition.type_name
                        );
                        continue;
                    }
                },
            };
            live.insert(context.id(), Arc::clone(&context));
            contexts.push(context);
        }
        debug!("Loaded {} task contexts", contexts.len());
        Ok(Arc::new(contexts))
    }

    pub(crate) async fn invalidate(&self) {
        self.contexts.invalidate(&TASK_CONTEXTS_CACHE_KEY).await;
    }
}

/// Releases a task once its spawned execution ends, even if bookkeeping panics.
struct RunGuard {
    context: Arc<TaskContext>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        metrics::set_task_running(self.context.name(), false);
        self.context.finish_run();
    }
}

/// Polls the task registry and runs every task that is due.
pub struct TaskScheduler {
    shared: Arc<SchedulerShared>,
    install_gate: Arc<dyn InstallGate>,
    settings: SchedulerSettings,
    /// Spawned executions, reaped once finished.
    running_handles: HashMap<i64, JoinHandle<()>>,
    shutdown_token: CancellationToken,
}

impl TaskScheduler {
    pub fn new(
        services: TaskServices,
        registry: Arc<dyn TaskRegistry>,
        install_gate: Arc<dyn InstallGate>,
        settings: SchedulerSettings,
        shutdown_token: CancellationToken,
    ) -> Self {
        let shared = Arc::new(SchedulerShared {
            services,
            registry,
            contexts: Cache::builder().time_to_live(settings.cache_ttl).build(),
            live: Mutex::new(HashMap::new()),
        });
        Self {
            shared,
            install_gate,
            settings,
            running_handles: HashMap::new(),
            shutdown_token,
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle::new(Arc::clone(&self.shared))
    }

    /// Main scheduler loop. Returns once the shutdown token is cancelled.
    pub async fn run(&mut self) {
        info!(
            "Starting task scheduler with {} task services",
            self.shared.services.len()
        );
        if self.shared.services.is_empty() {
            warn!("No task services registered, the scheduler has nothing to run");
        }

        if wait_installed(
            self.install_gate.as_ref(),
            &self.shutdown_token,
            self.settings.install_poll_interval,
        )
        .await
        .is_err()
        {
            info!("Task scheduler stopped before installation completed");
            return;
        }

        let registry = Arc::clone(&self.shared.registry);

        // On startup: runs left "running" by a previous process never finished
        match registry.mark_stale_runs_failed() {
            Ok(count) if count > 0 => info!("Marked {} stale task runs as failed", count),
            Ok(_) => {}
            Err(e) => error!("Failed to mark stale task runs: {:#}", e),
        }

        match registry.ensure_task_services(&self.shared.services.descriptors()) {
            Ok(created) if created > 0 => info!("Created {} task definitions", created),
            Ok(_) => {}
            Err(e) => registry.log_error(None, &e.context("Failed to register task services")),
        }

        while !self.shutdown_token.is_cancelled() {
            if let Err(e) = self.run_pass().await {
                metrics::record_pass_error();
                registry.log_error(None, &e);
            }
            if !self.pause().await {
                break;
            }
        }

        self.shutdown();
        info!("Task scheduler stopped");
    }

    /// Evaluate every known task once.
    async fn run_pass(&mut self) -> anyhow::Result<()> {
        self.reap_finished().await;

        let contexts = self.shared.load_contexts().await?;
        for context in contexts.iter() {
            if self.shutdown_token.is_cancelled() {
                return Ok(());
            }
            self.evaluate(context);
            if !self.pause().await {
                return Ok(());
            }
        }
        Ok(())
    }

    fn evaluate(&mut self, context: &Arc<TaskContext>) {
        if !context.is_due(Utc::now()) {
            return;
        }
        if !context.try_begin_run() {
            debug!("Task {} is still running, skipping", context.name());
            return;
        }
        let handle = self.spawn_execution(Arc::clone(context));
        self.running_handles.insert(context.id(), handle);
    }

    /// Run one execution of `context` on its own tokio task. The caller must
    /// already hold the context's running flag.
    fn spawn_execution(&self, context: Arc<TaskContext>) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let cancellation_token = self.shutdown_token.child_token();

        tokio::spawn(async move {
            let _guard = RunGuard {
                context: Arc::clone(&context),
            };
            let registry = Arc::clone(&shared.registry);
            let name = context.name().to_string();
            let triggered_by = context.take_trigger_source();

            let run_id = match registry.record_run_start(context.id(), triggered_by) {
                Ok(id) => Some(id),
                Err(e) => {
                    registry.log_error(Some(&name), &e.context("Failed to record run start"));
                    None
                }
            };

            debug!("Starting task {} (triggered_by: {})", name, triggered_by);
            metrics::set_task_running(&name, true);

            let argument = TaskArgument::new(
                Arc::clone(&context),
                Arc::clone(&registry),
                cancellation_token,
            );
            let start_time = Instant::now();
            let result = AssertUnwindSafe(context.service().execute(&argument))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(TaskError::Panicked(panic_message(panic))));
            let elapsed = start_time.elapsed();

            let (status, error_message, status_label) = match result {
                Ok(()) => {
                    debug!("Task {} completed in {:?}", name, elapsed);
                    (TaskRunStatus::Completed, None, "success")
                }
                Err(TaskError::Cancelled) => {
                    info!("Task {} was cancelled after {:?}", name, elapsed);
                    (
                        TaskRunStatus::Failed,
                        Some("Cancelled".to_string()),
                        "cancelled",
                    )
                }
                Err(e) => {
                    let label = if matches!(e, TaskError::Panicked(_)) {
                        "panic"
                    } else {
                        "failed"
                    };
                    let message = e.to_string();
                    registry.log_error(Some(&name), &into_anyhow(e));
                    (TaskRunStatus::Failed, Some(message), label)
                }
            };

            // Registry timestamps keep microseconds
            let finished_at = Utc::now().trunc_subsecs(6);
            let (next_executing, last_executed) = context.complete_run(finished_at);
            if let Some(payload) = context.take_dirty_argument() {
                if let Err(e) = registry.set_argument(context.id(), &payload) {
                    registry.log_error(Some(&name), &e.context("Failed to persist task argument"));
                }
            }
            if let Err(e) = registry.set_execute_date(context.id(), next_executing, Some(last_executed)) {
                registry.log_error(Some(&name), &e.context("Failed to persist task schedule"));
            }
            if let Some(run_id) = run_id {
                if let Err(e) = registry.record_run_finish(run_id, status, error_message) {
                    registry.log_error(Some(&name), &e.context("Failed to record run finish"));
                }
            }

            metrics::record_task_execution(&name, status_label, elapsed);
            debug!("Task {} next run at {}", name, next_executing);
        })
    }

    /// Sleep for the poll delay. Returns `false` if shutdown was requested meanwhile.
    async fn pause(&self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.settings.poll_delay) => true,
            _ = self.shutdown_token.cancelled() => false,
        }
    }

    /// Clean up handles for finished executions.
    async fn reap_finished(&mut self) {
        let finished: Vec<i64> = self
            .running_handles
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(id, _)| *id)
            .collect();

        for id in finished {
            if let Some(handle) = self.running_handles.remove(&id) {
                if let Err(e) = handle.await {
                    warn!("Execution of task {} ended abnormally: {}", id, e);
                }
            }
        }
    }

    /// Executions still in flight are detached; they finish on their own
    /// and see a cancelled token.
    fn shutdown(&mut self) {
        let outstanding = self
            .running_handles
            .drain()
            .filter(|(_, handle)| !handle.is_finished())
            .count();
        if outstanding > 0 {
            info!("Leaving {} running tasks to finish on their own", outstanding);
        }
    }
}

fn into_anyhow(error: TaskError) -> anyhow::Error {
    match error {
        TaskError::Registry(e) => e,
        other => anyhow::Error::new(other),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
