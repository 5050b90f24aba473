use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use devmgmt_shared::timeouts::{DEFAULT_REQUEST_TIMEOUT_MS, PENDING_SWEEP_INTERVAL_MS};

use crate::command::DispatcherConfig;
use crate::datastore::IndexGranularity;
use crate::job::CoordinatorConfig;

/// Server settings, read from `DEVMGMT_*` environment variables
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Identity of this node in event records and execution ownership
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Address device agents connect to
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Address of the operator control line protocol
    #[serde(default = "default_control_addr")]
    pub control_addr: String,

    #[serde(default = "default_request_timeout_ms")]
    pub default_request_timeout_ms: u64,

    /// Per application reply deadlines, `APP=MS` pairs separated by commas
    #[serde(default)]
    pub app_timeouts_ms: String,

    #[serde(default = "default_pending_sweep_interval_ms")]
    pub pending_sweep_interval_ms: u64,

    #[serde(default = "default_max_concurrent_targets")]
    pub max_concurrent_targets: usize,

    /// Delay before targets that asked for another pass are presented again
    #[serde(default = "default_process_again_delay_ms")]
    pub process_again_delay_ms: u64,

    #[serde(default = "default_process_again_max_passes")]
    pub process_again_max_passes: u32,

    #[serde(default = "default_housekeeping_interval_ms")]
    pub housekeeping_interval_ms: u64,

    /// How long an event claim holds before another delivery may take it over
    #[serde(default = "default_event_claim_lease_ms")]
    pub event_claim_lease_ms: u64,

    /// How long processed events are kept before purging
    #[serde(default = "default_event_retention_secs")]
    pub event_retention_secs: u64,

    /// Attach the error source chain to control error responses
    #[serde(default)]
    pub include_stack_trace: bool,

    #[serde(default = "default_index_granularity")]
    pub index_granularity: String,

    /// Job definitions kept in memory before the least recently used is dropped
    #[serde(default = "default_job_cache_size")]
    pub job_cache_size: usize,

    /// JSON file with job definitions loaded at startup
    #[serde(default)]
    pub jobs_file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_node_id() -> String {
    "node-1".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:7400".to_string()
}

fn default_control_addr() -> String {
    "127.0.0.1:7401".to_string()
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

fn default_pending_sweep_interval_ms() -> u64 {
    PENDING_SWEEP_INTERVAL_MS
}

fn default_max_concurrent_targets() -> usize {
    16
}

fn default_process_again_delay_ms() -> u64 {
    5_000
}

fn default_process_again_max_passes() -> u32 {
    5
}

fn default_housekeeping_interval_ms() -> u64 {
    60_000
}

fn default_event_claim_lease_ms() -> u64 {
    30_000
}

fn default_event_retention_secs() -> u64 {
    7 * 24 * 3600
}

fn default_job_cache_size() -> usize {
    crate::cache::DEFAULT_JOB_CACHE_SIZE
}

fn default_index_granularity() -> String {
    "week".to_string()
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::with_prefix("DEVMGMT"))
            .build()?
            .try_deserialize()
    }

    pub fn index_granularity(&self) -> Result<IndexGranularity, ConfigError> {
        self.index_granularity.parse().map_err(ConfigError::Message)
    }

    /// Parsed `app_timeouts_ms`, keyed by lowercase application name
    pub fn app_timeouts(&self) -> Result<HashMap<String, Duration>, ConfigError> {
        let mut timeouts = HashMap::new();
        for pair in self.app_timeouts_ms.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (app, ms) = pair
                .split_once('=')
                .ok_or_else(|| ConfigError::Message(format!("app timeout '{pair}' is not APP=MS")))?;
            let ms: u64 = ms
                .trim()
                .parse()
                .map_err(|e| ConfigError::Message(format!("app timeout '{pair}': {e}")))?;
            timeouts.insert(app.trim().to_ascii_lowercase(), Duration::from_millis(ms));
        }
        Ok(timeouts)
    }

    pub fn dispatcher_config(&self) -> Result<DispatcherConfig, ConfigError> {
        Ok(DispatcherConfig {
            default_timeout: Duration::from_millis(self.default_request_timeout_ms),
            app_timeouts: self.app_timeouts()?,
        })
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            node_id: self.node_id.clone(),
            max_concurrent_targets: self.max_concurrent_targets,
            again_delay: Duration::from_millis(self.process_again_delay_ms),
            max_again_passes: self.process_again_max_passes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static TEST_LOCK: Mutex<()> = Mutex::new(());

    const VARS: [&str; 4] = [
        "DEVMGMT_NODE_ID",
        "DEVMGMT_APP_TIMEOUTS_MS",
        "DEVMGMT_INCLUDE_STACK_TRACE",
        "DEVMGMT_INDEX_GRANULARITY",
    ];

    fn clear() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_default_config() {
        let _lock = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear();

        let config = ServerConfig::from_env().unwrap();
        assert_eq!(config.node_id, "node-1");
        assert_eq!(config.default_request_timeout_ms, DEFAULT_REQUEST_TIMEOUT_MS);
        assert!(!config.include_stack_trace);
        assert_eq!(config.index_granularity().unwrap(), IndexGranularity::Week);
        assert!(config.app_timeouts().unwrap().is_empty());
    }

    #[test]
    fn test_custom_config() {
        let _lock = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear();
        std::env::set_var("DEVMGMT_NODE_ID", "node-7");
        std::env::set_var("DEVMGMT_APP_TIMEOUTS_MS", "KEYS-V1=2500, BUN-V1=9000");
        std::env::set_var("DEVMGMT_INCLUDE_STACK_TRACE", "true");
        std::env::set_var("DEVMGMT_INDEX_GRANULARITY", "HOUR");

        let config = ServerConfig::from_env().unwrap();
        clear();

        assert_eq!(config.node_id, "node-7");
        assert!(config.include_stack_trace);
        assert_eq!(config.index_granularity().unwrap(), IndexGranularity::Hour);

        let dispatcher = config.dispatcher_config().unwrap();
        assert_eq!(dispatcher.timeout_for("keys-v1"), Duration::from_millis(2500));
        assert_eq!(dispatcher.timeout_for("ASSET-V1"), Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS));
        assert_eq!(config.coordinator_config().node_id, "node-7");
    }

    #[test]
    fn test_malformed_app_timeout() {
        let _lock = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let config = ServerConfig {
            app_timeouts_ms: "KEYS-V1".to_string(),
            ..ServerConfig::from_env().unwrap()
        };
        assert!(config.app_timeouts().is_err());
    }
}
