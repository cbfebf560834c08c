use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cron_dispatch::batch::{ContinuationPump, ContinuationRegistry};
use cron_dispatch::config::{AppConfig, CliConfig, FileConfig};
use cron_dispatch::job_store::{JobStore, SqliteJobStore};
use cron_dispatch::scheduler::{Dispatcher, RetryPolicy, TaskRegistry};
use cron_dispatch::server::{self, RequestsLoggingLevel, ServerConfig, ServerState};
use cron_dispatch::tasks::{FanOut, LogMessage, FAN_OUT_TASK, LOG_MESSAGE_TASK};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Directory holding the scheduler database.
    #[clap(long, value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// Path to a TOML config file. Values in the file override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// The port to listen on.
    #[clap(short, long, default_value_t = 3003)]
    pub port: u16,

    /// The level of logging to perform on each request.
    #[clap(long, default_value = "path")]
    pub logging_level: RequestsLoggingLevel,

    /// Seconds between dispatch cycles run by the server. Set to 0 to only
    /// dispatch on POST /cron/poke.
    #[clap(long, default_value_t = 60)]
    pub poke_interval_secs: u64,

    /// Time budget of one dispatch cycle in milliseconds.
    #[clap(long, default_value_t = 20_000)]
    pub time_budget_ms: u64,
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
        .try_init()
        .unwrap();

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config file {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let cli_config = CliConfig {
        db_dir: cli_args.db_dir.clone(),
        port: cli_args.port,
        logging_level: cli_args.logging_level.clone(),
        poke_interval_secs: cli_args.poke_interval_secs,
        time_budget_ms: cli_args.time_budget_ms,
    };
    let config = AppConfig::resolve(&cli_config, file_config)?;

    info!("Initializing metrics...");
    server::metrics::init_metrics();

    let db_path = config.scheduler_db_path();
    info!("Opening scheduler database at {:?}...", db_path);
    let store = Arc::new(SqliteJobStore::new(&db_path)?);

    for group in &config.groups {
        store.get_or_create_group(&group.name, group.priority, &group.label)?;
    }

    let fan_out = Arc::new(FanOut::new(
        store.clone(),
        store.clone(),
        config.batch.fan_out_batch_size,
    ));

    let tasks = TaskRegistry::new()
        .with(LOG_MESSAGE_TASK, Arc::new(LogMessage))
        .with(FAN_OUT_TASK, fan_out.clone());
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        tasks,
        RetryPolicy::new(&config.retry),
    ));

    let continuation_pump = Arc::new(ContinuationPump::new(
        ContinuationRegistry::new().with(fan_out),
        store.clone(),
        store.clone(),
        Duration::from_secs(config.batch.retry_delay_secs),
        config.batch.max_attempts,
    ));

    let server_config = ServerConfig {
        requests_logging_level: config.logging_level.clone(),
        port: config.port,
        time_budget: config.time_budget(),
        pump_time_budget: Duration::from_millis(config.batch.pump_time_budget_ms),
        pump_max_deliveries: config.batch.pump_max_deliveries,
        poke_interval_secs: config.poke_interval_secs,
        pump_interval_secs: config.batch.pump_interval_secs,
    };
    let job_store: Arc<dyn JobStore> = store;
    let state = ServerState::new(server_config, job_store, dispatcher, continuation_pump);

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, shutting down");
            signal_token.cancel();
        }
    });

    info!("Ready to serve at port {}!", config.port);
    server::run_server(state, shutdown).await
}
