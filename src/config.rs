use config::{Config, ConfigError, Environment};
use devmgmt_shared::timeouts::{AGENT_MAX_RECONNECT_DELAY_MS, AGENT_RECONNECT_DELAY_MS};
use serde::Deserialize;
use std::time::Duration;

use crate::connection::ConnectionConfig;

/// Agent settings, read from `AGENT_*` environment variables
#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    #[serde(default = "default_tenant_id")]
    pub tenant_id: String,

    /// Client id this device announces itself with
    #[serde(default = "default_device_id")]
    pub device_id: String,

    #[serde(default = "default_server_addr")]
    pub server_addr: String,

    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    #[serde(default = "default_max_reconnect_delay_ms")]
    pub max_reconnect_delay_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_tenant_id() -> String {
    "1".to_string()
}

fn default_device_id() -> String {
    "gw-001".to_string()
}

fn default_server_addr() -> String {
    "127.0.0.1:7400".to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    AGENT_RECONNECT_DELAY_MS
}

fn default_max_reconnect_delay_ms() -> u64 {
    AGENT_MAX_RECONNECT_DELAY_MS
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

impl AgentConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::with_prefix("AGENT"))
            .build()?
            .try_deserialize()
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            tenant_id: self.tenant_id.clone(),
            device_id: self.device_id.clone(),
            server_addr: self.server_addr.clone(),
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            max_reconnect_delay: Duration::from_millis(self.max_reconnect_delay_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }
}
