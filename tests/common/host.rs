//! Test scheduler lifecycle management
//!
//! Each test gets an isolated scheduler with its own task database.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskhost::background_tasks::{
    AlwaysInstalled, InstallGate, SchedulerHandle, SchedulerSettings, TaskScheduler, TaskService,
    TaskServices,
};
use taskhost::task_store::SqliteTaskStore;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Settings that keep tests fast while still exercising every delay.
pub fn fast_settings() -> SchedulerSettings {
    SchedulerSettings {
        cache_ttl: Duration::from_secs(300),
        poll_delay: Duration::from_millis(5),
        install_poll_interval: Duration::from_millis(5),
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Like [`wait_until`] for conditions that need to await.
pub async fn wait_until_async<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition().await
}

/// Running scheduler backed by a temporary SQLite database.
///
/// Dropping the host cancels the scheduler; call [`TestHost::shutdown`] to
/// wait for the loop to exit.
pub struct TestHost {
    pub store: Arc<SqliteTaskStore>,
    pub handle: SchedulerHandle,
    pub shutdown_token: CancellationToken,
    pub db_path: PathBuf,
    loop_handle: Option<JoinHandle<()>>,
    _temp_dir: Option<TempDir>,
}

impl TestHost {
    pub async fn spawn(services: Vec<Arc<dyn TaskService>>) -> Self {
        Self::spawn_with(services, fast_settings(), Arc::new(AlwaysInstalled)).await
    }

    pub async fn spawn_with(
        services: Vec<Arc<dyn TaskService>>,
        settings: SchedulerSettings,
        install_gate: Arc<dyn InstallGate>,
    ) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("tasks.db");
        let mut host = Self::spawn_at(db_path, services, settings, install_gate).await;
        host._temp_dir = Some(temp_dir);
        host
    }

    /// Start a scheduler on an existing database path. The caller owns the directory.
    pub async fn spawn_at(
        db_path: PathBuf,
        services: Vec<Arc<dyn TaskService>>,
        settings: SchedulerSettings,
        install_gate: Arc<dyn InstallGate>,
    ) -> Self {
        let store = Arc::new(SqliteTaskStore::new(&db_path).expect("Failed to open task store"));
        let shutdown_token = CancellationToken::new();
        let mut scheduler = TaskScheduler::new(
            TaskServices::new(services),
            store.clone(),
            install_gate,
            settings,
            shutdown_token.clone(),
        );
        let handle = scheduler.handle();
        let loop_handle = tokio::spawn(async move { scheduler.run().await });

        Self {
            store,
            handle,
            shutdown_token,
            db_path,
            loop_handle: Some(loop_handle),
            _temp_dir: None,
        }
    }

    /// Cancel the scheduler and wait for its loop to return.
    /// Returns how long the loop took to stop.
    pub async fn shutdown(mut self) -> Duration {
        let started = Instant::now();
        self.shutdown_token.cancel();
        if let Some(loop_handle) = self.loop_handle.take() {
            tokio::time::timeout(Duration::from_secs(5), loop_handle)
                .await
                .expect("Scheduler did not stop in time")
                .expect("Scheduler loop panicked");
        }
        started.elapsed()
    }

    pub fn is_stopped(&self) -> bool {
        self.loop_handle
            .as_ref()
            .map(|handle| handle.is_finished())
            .unwrap_or(true)
    }
}

impl Drop for TestHost {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}
