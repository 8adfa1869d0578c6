//! Task services shipped with the host.

pub mod task_log_cleanup;

pub use task_log_cleanup::TaskLogCleanupService;
