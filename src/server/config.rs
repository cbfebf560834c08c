use super::RequestsLoggingLevel;
use std::time::Duration;

#[derive(Clone)]
pub struct ServerConfig {
    pub requests_logging_level: RequestsLoggingLevel,
    pub port: u16,
    /// Budget of one dispatch cycle.
    pub time_budget: Duration,
    /// Budget of one continuation pump run.
    pub pump_time_budget: Duration,
    pub pump_max_deliveries: usize,
    /// Seconds between dispatch cycles run by the server itself, 0 to disable.
    pub poke_interval_secs: u64,
    /// Seconds between continuation pump runs, 0 to disable.
    pub pump_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            requests_logging_level: RequestsLoggingLevel::Path,
            port: 3003,
            time_budget: Duration::from_secs(20),
            pump_time_budget: Duration::from_secs(20),
            pump_max_deliveries: 50,
            poke_interval_secs: 60,
            pump_interval_secs: 5,
        }
    }
}
