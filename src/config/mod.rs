mod file_config;

pub use file_config::{BatchConfig, FileConfig, GroupConfig, RetryConfig};

use crate::job_store::{CONVERT_GROUP, EMAIL_GROUP};
use crate::server::RequestsLoggingLevel;
use anyhow::{bail, Result};
use clap::ValueEnum;
use std::path::PathBuf;
use std::time::Duration;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub port: u16,
    pub logging_level: RequestsLoggingLevel,
    pub poke_interval_secs: u64,
    pub time_budget_ms: u64,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // Core settings
    pub db_dir: PathBuf,
    pub port: u16,
    pub logging_level: RequestsLoggingLevel,
    /// 0 disables the periodic dispatch loop; cycles then only run on request.
    pub poke_interval_secs: u64,
    /// Budget of one dispatch cycle.
    pub time_budget_ms: u64,

    // Feature configs (with defaults)
    pub retry: RetrySettings,
    pub batch: BatchSettings,
    pub groups: Vec<GroupSettings>,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;

        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let port = file.port.unwrap_or(cli.port);
        let logging_level = file
            .logging_level
            .and_then(|s| parse_logging_level(&s))
            .unwrap_or_else(|| cli.logging_level.clone());
        let poke_interval_secs = file.poke_interval_secs.unwrap_or(cli.poke_interval_secs);
        let time_budget_ms = file.time_budget_ms.unwrap_or(cli.time_budget_ms);
        if time_budget_ms == 0 {
            bail!("time_budget_ms must be positive");
        }

        let retry_file = file.retry.unwrap_or_default();
        let retry_defaults = RetrySettings::default();
        let retry = RetrySettings {
            max_errors: retry_file.max_errors.unwrap_or(retry_defaults.max_errors),
            initial_backoff_secs: retry_file
                .initial_backoff_secs
                .unwrap_or(retry_defaults.initial_backoff_secs),
            max_backoff_secs: retry_file
                .max_backoff_secs
                .unwrap_or(retry_defaults.max_backoff_secs),
            backoff_multiplier: retry_file
                .backoff_multiplier
                .unwrap_or(retry_defaults.backoff_multiplier),
        };

        let batch_file = file.batch.unwrap_or_default();
        let batch_defaults = BatchSettings::default();
        let batch = BatchSettings {
            fan_out_batch_size: batch_file
                .fan_out_batch_size
                .unwrap_or(batch_defaults.fan_out_batch_size),
            pump_interval_secs: batch_file
                .pump_interval_secs
                .unwrap_or(batch_defaults.pump_interval_secs),
            pump_time_budget_ms: batch_file
                .pump_time_budget_ms
                .unwrap_or(batch_defaults.pump_time_budget_ms),
            pump_max_deliveries: batch_file
                .pump_max_deliveries
                .unwrap_or(batch_defaults.pump_max_deliveries),
            retry_delay_secs: batch_file
                .retry_delay_secs
                .unwrap_or(batch_defaults.retry_delay_secs),
            max_attempts: batch_file
                .max_attempts
                .unwrap_or(batch_defaults.max_attempts),
        };
        if batch.fan_out_batch_size == 0 {
            bail!("fan_out_batch_size must be positive");
        }

        // Built-in groups first; a file entry with the same name replaces one.
        let mut groups = GroupSettings::builtin();
        for group in file.groups.unwrap_or_default() {
            let settings = GroupSettings {
                label: group.label.unwrap_or_else(|| group.name.clone()),
                name: group.name,
                priority: group.priority,
            };
            match groups.iter_mut().find(|g| g.name == settings.name) {
                Some(existing) => *existing = settings,
                None => groups.push(settings),
            }
        }

        Ok(Self {
            db_dir,
            port,
            logging_level,
            poke_interval_secs,
            time_budget_ms,
            retry,
            batch,
            groups,
        })
    }

    pub fn scheduler_db_path(&self) -> PathBuf {
        self.db_dir.join("scheduler.db")
    }

    pub fn time_budget(&self) -> Duration {
        Duration::from_millis(self.time_budget_ms)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrySettings {
    pub max_errors: u32,
    /// 0 disables backoff: failed jobs are eligible again immediately.
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_errors: 5,
            initial_backoff_secs: 0,
            max_backoff_secs: 3600,
            backoff_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSettings {
    pub fan_out_batch_size: usize,
    /// 0 disables the periodic continuation pump.
    pub pump_interval_secs: u64,
    pub pump_time_budget_ms: u64,
    /// Continuations delivered per pump run at most.
    pub pump_max_deliveries: usize,
    pub retry_delay_secs: u64,
    pub max_attempts: u32,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            fan_out_batch_size: 10,
            pump_interval_secs: 5,
            pump_time_budget_ms: 20_000,
            pump_max_deliveries: 50,
            retry_delay_secs: 60,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSettings {
    pub name: String,
    pub priority: i64,
    pub label: String,
}

impl GroupSettings {
    fn builtin() -> Vec<Self> {
        vec![
            Self {
                name: EMAIL_GROUP.to_string(),
                priority: 10,
                label: "Email".to_string(),
            },
            Self {
                name: CONVERT_GROUP.to_string(),
                priority: 5,
                label: "Convert".to_string(),
            },
        ]
    }
}

/// Parses a logging level string into RequestsLoggingLevel.
/// Uses clap's ValueEnum trait for parsing.
fn parse_logging_level(s: &str) -> Option<RequestsLoggingLevel> {
    RequestsLoggingLevel::from_str(s, true).ok()
}
