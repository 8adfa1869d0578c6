mod file_config;

pub use file_config::{FileConfig, SchedulerConfig};

use crate::background_tasks::SchedulerSettings;
use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

/// CLI arguments that can be overridden by the TOML config.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub db_path: Option<PathBuf>,
    pub cache_ttl_secs: u64,
    pub poll_delay_ms: u64,
    pub log_retention_days: u64,
    pub metrics_port: u16,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            cache_ttl_secs: 300,
            poll_delay_ms: 1000,
            log_retention_days: 30,
            metrics_port: 9091,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub log_retention_days: u64,
    /// Port of the Prometheus endpoint, `0` disables it.
    pub metrics_port: u16,
    pub scheduler: SchedulerSettings,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_path = file
            .db_path
            .map(PathBuf::from)
            .or_else(|| cli.db_path.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_path must be specified via --db-path or in config file")
            })?;

        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.is_dir() {
                bail!("Database directory does not exist: {:?}", parent);
            }
        }
        if db_path.is_dir() {
            bail!("db_path is a directory: {:?}", db_path);
        }

        let log_retention_days = file.log_retention_days.unwrap_or(cli.log_retention_days);
        let metrics_port = file.metrics_port.unwrap_or(cli.metrics_port);

        let scheduler_file = file.scheduler.unwrap_or_default();
        let defaults = SchedulerSettings::default();
        let scheduler = SchedulerSettings {
            cache_ttl: Duration::from_secs(
                scheduler_file.cache_ttl_secs.unwrap_or(cli.cache_ttl_secs),
            ),
            poll_delay: Duration::from_millis(
                scheduler_file.poll_delay_ms.unwrap_or(cli.poll_delay_ms),
            ),
            install_poll_interval: scheduler_file
                .install_poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.install_poll_interval),
        };

        if scheduler.poll_delay.is_zero() {
            bail!("poll_delay_ms must be greater than zero");
        }
        if scheduler.install_poll_interval.is_zero() {
            bail!("install_poll_interval_ms must be greater than zero");
        }

        Ok(Self {
            db_path,
            log_retention_days,
            metrics_port,
            scheduler,
        })
    }
}
