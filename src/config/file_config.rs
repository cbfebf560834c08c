use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,
    pub port: Option<u16>,
    pub logging_level: Option<String>,
    pub poke_interval_secs: Option<u64>,
    pub time_budget_ms: Option<u64>,

    // Feature configs
    pub retry: Option<RetryConfig>,
    pub batch: Option<BatchConfig>,
    /// Priority groups created at startup, in addition to the built-in ones.
    pub groups: Option<Vec<GroupConfig>>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub max_errors: Option<u32>,
    /// 0 disables backoff.
    pub initial_backoff_secs: Option<u64>,
    pub max_backoff_secs: Option<u64>,
    pub backoff_multiplier: Option<f64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct BatchConfig {
    pub fan_out_batch_size: Option<usize>,
    pub pump_interval_secs: Option<u64>,
    pub pump_time_budget_ms: Option<u64>,
    pub pump_max_deliveries: Option<usize>,
    pub retry_delay_secs: Option<u64>,
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct GroupConfig {
    pub name: String,
    pub priority: i64,
    pub label: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_file() {
        let config: FileConfig = toml::from_str(
            r#"
            db_dir = "/var/lib/cron"
            port = 4000
            time_budget_ms = 20000

            [retry]
            max_errors = 3
            initial_backoff_secs = 30

            [batch]
            fan_out_batch_size = 25

            [[groups]]
            name = "reports"
            priority = 3
            label = "Reports"
            "#,
        )
        .unwrap();

        assert_eq!(config.db_dir.as_deref(), Some("/var/lib/cron"));
        assert_eq!(config.port, Some(4000));
        assert_eq!(config.retry.unwrap().max_errors, Some(3));
        assert_eq!(config.batch.unwrap().fan_out_batch_size, Some(25));
        assert_eq!(
            config.groups.unwrap(),
            vec![GroupConfig {
                name: "reports".to_string(),
                priority: 3,
                label: Some("Reports".to_string()),
            }]
        );
    }

    #[test]
    fn test_empty_file_is_all_defaults() {
        let config: FileConfig = toml::from_str("").unwrap();
        assert!(config.db_dir.is_none());
        assert!(config.retry.is_none());
    }
}
