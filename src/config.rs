//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `AILINK_LISTEN`, `AILINK_LOG`
//! 2. **Config file** — path via `--config <path>`, or `ailink.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:3030"
//! request_timeout_secs = 60        # device reply budget per request
//! heartbeat_timeout_secs = 90      # evict devices silent for longer
//! sweep_interval_secs = 30
//! max_tool_hops = 5                # tool-call round trips per chat turn
//!
//! [mcp]
//! health_interval_secs = 30        # ping cadence for connected servers
//! reconnect_base_secs = 30         # first retry delay after disconnect
//! reconnect_max_secs = 480         # retry delay cap (8 min)
//! call_timeout_ms = 30000          # default per-call budget
//! log_buffer = 200                 # retained audit events
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server and broker settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:3030`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Seconds to wait for a device reply before the timeout fallback fires
    /// (default 60).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Seconds before a device is evicted for missed heartbeat (default 90).
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    /// Seconds between stale-device sweeps (default 30).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Maximum tool-call round trips within one chat turn (default 5).
    #[serde(default = "default_max_tool_hops")]
    pub max_tool_hops: u32,
}

/// MCP tool-server manager settings.
#[derive(Debug, Clone, Deserialize)]
pub struct McpConfig {
    /// Seconds between health-check pings for connected servers (default 30).
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
    /// First reconnect delay after a disconnect, in seconds (default 30).
    #[serde(default = "default_reconnect_base_secs")]
    pub reconnect_base_secs: u64,
    /// Reconnect delay cap in seconds (default 480 = 8 min).
    #[serde(default = "default_reconnect_max_secs")]
    pub reconnect_max_secs: u64,
    /// Default per-call timeout for tool-server requests (default 30 000 ms).
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Number of audit events retained in the in-memory log (default 200).
    #[serde(default = "default_log_buffer")]
    pub log_buffer: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` or
    /// `AILINK_LOG` env vars.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:3030".to_string()
}
fn default_request_timeout_secs() -> u64 {
    60
}
fn default_heartbeat_timeout_secs() -> u64 {
    90
}
fn default_sweep_interval_secs() -> u64 {
    30
}
fn default_max_tool_hops() -> u32 {
    5
}
fn default_health_interval_secs() -> u64 {
    30
}
fn default_reconnect_base_secs() -> u64 {
    30
}
fn default_reconnect_max_secs() -> u64 {
    480
}
fn default_call_timeout_ms() -> u64 {
    30_000
}
fn default_log_buffer() -> usize {
    200
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            request_timeout_secs: default_request_timeout_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_tool_hops: default_max_tool_hops(),
        }
    }
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            health_interval_secs: default_health_interval_secs(),
            reconnect_base_secs: default_reconnect_base_secs(),
            reconnect_max_secs: default_reconnect_max_secs(),
            call_timeout_ms: default_call_timeout_ms(),
            log_buffer: default_log_buffer(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            mcp: McpConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `ailink.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("ailink.toml").exists() {
            let content =
                std::fs::read_to_string("ailink.toml").expect("Failed to read ailink.toml");
            toml::from_str(&content).expect("Failed to parse ailink.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(listen) = std::env::var("AILINK_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(level) = std::env::var("AILINK_LOG") {
            config.logging.level = level;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.server.listen, "0.0.0.0:3030");
        assert_eq!(config.server.request_timeout_secs, 60);
        assert_eq!(config.mcp.health_interval_secs, 30);
        assert_eq!(config.mcp.reconnect_base_secs, 30);
        assert_eq!(config.mcp.reconnect_max_secs, 480);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            listen = "127.0.0.1:8080"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:8080");
        assert_eq!(config.server.request_timeout_secs, 60);
        assert_eq!(config.mcp.reconnect_max_secs, 480);
    }
}
