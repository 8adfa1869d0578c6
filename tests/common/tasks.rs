//! Configurable task services used by the end-to-end tests.

use super::host::wait_until;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskhost::background_tasks::{Interval, TaskArgument, TaskError, TaskService};

/// Counters shared between a [`ProbeTask`] and the test observing it.
#[derive(Default)]
pub struct Probe {
    runs: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl Probe {
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub async fn wait_for_runs(&self, count: usize) -> bool {
        wait_until(Duration::from_secs(5), || self.runs() >= count).await
    }

    fn enter(&self) {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Behavior {
    Succeed,
    Fail,
    Panic,
    /// Block until the host shuts down.
    Hang,
}

/// Task service whose type name, interval and behavior are set per test.
pub struct ProbeTask {
    type_name: &'static str,
    interval: Interval,
    behavior: Behavior,
    work: Duration,
    rerun: bool,
    count_in_payload: bool,
    probe: Arc<Probe>,
}

impl ProbeTask {
    pub fn new(type_name: &'static str, interval: &str) -> Self {
        Self {
            type_name,
            interval: interval.parse().expect("invalid test interval"),
            behavior: Behavior::Succeed,
            work: Duration::ZERO,
            rerun: false,
            count_in_payload: false,
            probe: Arc::new(Probe::default()),
        }
    }

    pub fn failing(mut self) -> Self {
        self.behavior = Behavior::Fail;
        self
    }

    pub fn panicking(mut self) -> Self {
        self.behavior = Behavior::Panic;
        self
    }

    pub fn hanging(mut self) -> Self {
        self.behavior = Behavior::Hang;
        self
    }

    /// Spend `work` inside every execution.
    pub fn working_for(mut self, work: Duration) -> Self {
        self.work = work;
        self
    }

    /// Ask for an immediate re-run at the end of every execution.
    pub fn rerunning(mut self) -> Self {
        self.rerun = true;
        self
    }

    /// Keep a run counter in the task payload as `{"count": n}`.
    pub fn counting_in_payload(mut self) -> Self {
        self.count_in_payload = true;
        self
    }

    pub fn probe(&self) -> Arc<Probe> {
        Arc::clone(&self.probe)
    }

    pub fn into_service(self) -> Arc<dyn TaskService> {
        Arc::new(self)
    }
}

#[async_trait]
impl TaskService for ProbeTask {
    fn type_name(&self) -> &'static str {
        self.type_name
    }

    fn name(&self) -> &'static str {
        self.type_name
    }

    fn default_interval(&self) -> Interval {
        self.interval.clone()
    }

    async fn execute(&self, argument: &TaskArgument) -> Result<(), TaskError> {
        self.probe.enter();

        if self.behavior == Behavior::Hang {
            argument.cancellation_token().cancelled().await;
            self.probe.leave();
            return Err(TaskError::Cancelled);
        }
        if !self.work.is_zero() {
            tokio::time::sleep(self.work).await;
        }
        if self.count_in_payload {
            let count = argument.payload()["count"].as_u64().unwrap_or(0);
            argument.set_payload(serde_json::json!({ "count": count + 1 }));
        }
        if self.rerun {
            argument.context().request_rerun();
        }
        self.probe.leave();

        match self.behavior {
            Behavior::Fail => Err(TaskError::Failed("probe failure".to_string())),
            Behavior::Panic => panic!("probe panic"),
            _ => Ok(()),
        }
    }
}
