//! Common test infrastructure
//!
//! Tests should only import from this module, not from internal submodules.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{ProbeTask, TestHost};
//!
//! #[tokio::test]
//! async fn test_task_runs() {
//!     let task = ProbeTask::new("tests::Probe", "10s");
//!     let probe = task.probe();
//!     let host = TestHost::spawn(vec![task.into_service()]).await;
//!
//!     assert!(probe.wait_for_runs(1).await);
//!     host.shutdown().await;
//! }
//! ```

mod host;
mod tasks;

pub use host::{fast_settings, wait_until, wait_until_async, TestHost};
pub use tasks::{Probe, ProbeTask};
