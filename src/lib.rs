//! Host for periodic background tasks backed by a SQLite task registry.

pub mod background_tasks;
pub mod config;
pub mod metrics;
pub mod sqlite_persistence;
pub mod task_store;
