use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use taskhost::background_tasks::services::TaskLogCleanupService;
use taskhost::background_tasks::{TaskScheduler, TaskService, TaskServices};
use taskhost::config;
use taskhost::metrics;
use taskhost::task_store::SqliteTaskStore;

fn parse_path(s: &str) -> Result<PathBuf, String> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(format!("Error resolving path '{}': {}", s, msg));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir().map_err(|e| format!("Failed to get current dir: {}", e))?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to TOML configuration file. Values in the file override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Path to the task database. Created if missing.
    /// Can also be specified in config file.
    #[clap(long, value_parser = parse_path)]
    pub db_path: Option<PathBuf>,

    /// How long loaded task definitions are reused before reloading, in seconds.
    #[clap(long, default_value_t = 300)]
    pub cache_ttl_secs: u64,

    /// Pause between task evaluations, in milliseconds.
    #[clap(long, default_value_t = 1000)]
    pub poll_delay_ms: u64,

    /// Number of days to keep task errors and run history.
    #[clap(long, default_value_t = 30)]
    pub log_retention_days: u64,

    /// The port for the metrics server (Prometheus scraping). 0 disables it.
    #[clap(long, default_value_t = 9091)]
    pub metrics_port: u16,
}

impl From<&CliArgs> for config::CliConfig {
    fn from(args: &CliArgs) -> Self {
        config::CliConfig {
            db_path: args.db_path.clone(),
            cache_ttl_secs: args.cache_ttl_secs,
            poll_delay_ms: args.poll_delay_ms,
            log_retention_days: args.log_retention_days,
            metrics_port: args.metrics_port,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Some(config::FileConfig::load(path)?)
        }
        None => None,
    };

    // Resolve final configuration (TOML overrides CLI)
    let cli_config: config::CliConfig = (&cli_args).into();
    let app_config = config::AppConfig::resolve(&cli_config, file_config)?;

    info!("Configuration loaded:");
    info!("  db_path: {:?}", app_config.db_path);
    info!("  poll_delay: {:?}", app_config.scheduler.poll_delay);
    info!("  cache_ttl: {:?}", app_config.scheduler.cache_ttl);

    metrics::init_metrics();

    let task_store = Arc::new(SqliteTaskStore::new(&app_config.db_path)?);

    let services = TaskServices::new([
        Arc::new(TaskLogCleanupService::new(app_config.log_retention_days)) as Arc<dyn TaskService>,
    ]);

    let shutdown_token = CancellationToken::new();
    let mut scheduler = TaskScheduler::new(
        services,
        task_store.clone(),
        task_store,
        app_config.scheduler.clone(),
        shutdown_token.clone(),
    );

    if app_config.metrics_port != 0 {
        info!("Metrics available at port {}!", app_config.metrics_port);
        let port = app_config.metrics_port;
        let metrics_token = shutdown_token.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::run_metrics_server(port, metrics_token).await {
                error!("Metrics server failed: {:#}", e);
            }
        });
    }

    let signal_token = shutdown_token.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        info!("Received Ctrl+C, initiating graceful shutdown");
        signal_token.cancel();
    });

    scheduler.run().await;

    Ok(())
}
