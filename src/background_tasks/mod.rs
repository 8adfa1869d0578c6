//! Periodic background task host.
//!
//! Task services are registered once at startup. Their definitions live in a
//! [`TaskRegistry`](crate::task_store::TaskRegistry), and the [`TaskScheduler`]
//! polls those definitions and runs each task when it is due.

mod context;
mod handle;
mod install_gate;
mod interval;
mod scheduler;
mod service;
pub mod services;

pub use context::{TaskArgument, TaskContext};
pub use handle::{SchedulerError, SchedulerHandle, TaskInfo};
pub use install_gate::{
    install_signal, wait_installed, AlwaysInstalled, Cancelled, InstallGate, InstallSignal,
    InstallState, SignalGate,
};
pub use interval::{CronRule, Interval, IntervalParseError};
pub use scheduler::{SchedulerSettings, TaskScheduler, TASK_CONTEXTS_CACHE_KEY};
pub use service::{TaskError, TaskService, TaskServices};
