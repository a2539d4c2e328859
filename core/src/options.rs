// Handle configuration
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::agent::AgentConfig;
use crate::Result;

/// Per-handle connection and lifecycle options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandleOptions {
    pub reconnect_interval_ms: u32,
    pub buffer_size: u32,
    pub keepalive_interval_ms: u32,
    pub keepalive_timeout_ms: u32,
    /// A daemon handle never keeps the host loop alive on its own.
    pub daemon: bool,
}

impl Default for HandleOptions {
    fn default() -> Self {
        Self {
            reconnect_interval_ms: 10_000,
            buffer_size: 32_768,
            keepalive_interval_ms: 50_000,
            keepalive_timeout_ms: 100_000,
            daemon: false,
        }
    }
}

impl HandleOptions {
    /// Parse options from a JSON object; missing keys keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let opts: HandleOptions = serde_json::from_str(json)?;
        opts.log();
        Ok(opts)
    }

    /// Read `TETHER_*` environment variables over the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let opts = Self {
            reconnect_interval_ms: env_parse("TETHER_RECONNECT_INTERVAL_MS")
                .unwrap_or(defaults.reconnect_interval_ms),
            buffer_size: env_parse("TETHER_BUFFER_SIZE").unwrap_or(defaults.buffer_size),
            keepalive_interval_ms: env_parse("TETHER_KEEPALIVE_INTERVAL_MS")
                .unwrap_or(defaults.keepalive_interval_ms),
            keepalive_timeout_ms: env_parse("TETHER_KEEPALIVE_TIMEOUT_MS")
                .unwrap_or(defaults.keepalive_timeout_ms),
            daemon: env_parse("TETHER_DAEMON").unwrap_or(defaults.daemon),
        };
        opts.log();
        opts
    }

    pub fn agent_config(&self, uri: &str) -> AgentConfig {
        AgentConfig {
            uri: uri.to_string(),
            buffer_size: self.buffer_size,
            reconnect_interval_ms: self.reconnect_interval_ms,
            keepalive_interval_ms: self.keepalive_interval_ms,
            keepalive_timeout_ms: self.keepalive_timeout_ms,
        }
    }

    fn log(&self) {
        debug!(
            reconnect_interval_ms = self.reconnect_interval_ms,
            buffer_size = self.buffer_size,
            keepalive_interval_ms = self.keepalive_interval_ms,
            keepalive_timeout_ms = self.keepalive_timeout_ms,
            daemon = self.daemon,
            "Handle options"
        );
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key)
        .ok()
        .filter(|s| !s.is_empty())
        .and_then(|v| v.parse().ok())
}
