use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Courier real-time message hub
#[derive(Parser, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[command(name = "courier-server", version, about = "Courier real-time message hub")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "COURIER_PORT", default_value = "8080")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "COURIER_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./courier.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "COURIER_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Data directory for persistent state (DB, keys)
    #[arg(long, env = "COURIER_DATA_DIR", default_value = "./data")]
    pub data_dir: String,

    /// Message store backend: "sqlite" or "memory"
    #[arg(long, env = "COURIER_MESSAGE_STORE", default_value = "sqlite")]
    pub message_store: String,

    /// Hub tuning (loaded from [hub] section in TOML or COURIER_HUB__* env)
    #[arg(skip)]
    #[serde(default, skip_serializing)]
    pub hub: HubConfig,
}

/// Delivery hub limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubConfig {
    /// Outbound events buffered per connection before it is dropped (default: 256)
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,

    /// Seconds without any inbound frame before a connection is closed (default: 60)
    #[serde(default = "default_liveness_window")]
    pub liveness_window_secs: u64,

    /// Seconds a single socket write may take before the peer is dropped (default: 10)
    #[serde(default = "default_write_wait")]
    pub write_wait_secs: u64,

    /// Largest accepted inbound frame in KiB (default: 512)
    #[serde(default = "default_max_message_size")]
    pub max_message_size_kb: usize,

    /// Events per user per window; 0 or less disables throttling (default: 10)
    #[serde(default = "default_throttle_limit")]
    pub throttle_limit: i64,

    /// Throttle window in seconds (default: 60)
    #[serde(default = "default_throttle_window")]
    pub throttle_window_secs: u64,

    /// Count every inbound event against the throttle, not just sends (default: false)
    #[serde(default)]
    pub throttle_all_events: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: default_outbound_capacity(),
            liveness_window_secs: default_liveness_window(),
            write_wait_secs: default_write_wait(),
            max_message_size_kb: default_max_message_size(),
            throttle_limit: default_throttle_limit(),
            throttle_window_secs: default_throttle_window(),
            throttle_all_events: false,
        }
    }
}

impl HubConfig {
    /// Reject settings that would drop every connection on arrival.
    pub fn validate(&self) -> Result<(), String> {
        if self.liveness_window_secs == 0 {
            return Err("hub.liveness_window_secs must be at least 1".to_string());
        }
        if self.write_wait_secs == 0 {
            return Err("hub.write_wait_secs must be at least 1".to_string());
        }
        if self.outbound_capacity == 0 {
            return Err("hub.outbound_capacity must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn liveness_window(&self) -> Duration {
        Duration::from_secs(self.liveness_window_secs)
    }

    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }

    pub fn throttle_window(&self) -> Duration {
        Duration::from_secs(self.throttle_window_secs)
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size_kb * 1024
    }
}

fn default_outbound_capacity() -> usize {
    crate::hub::OUTBOUND_CAPACITY
}

fn default_liveness_window() -> u64 {
    60
}

fn default_write_wait() -> u64 {
    10
}

fn default_max_message_size() -> usize {
    512
}

fn default_throttle_limit() -> i64 {
    10
}

fn default_throttle_window() -> u64 {
    60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            bind_address: "0.0.0.0".to_string(),
            config: "./courier.toml".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            message_store: "sqlite".to_string(),
            hub: HubConfig::default(),
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (COURIER_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Config::parse();
        let config_path = cli.config.clone();

        let config: Self = Self::figment(&config_path)
            .merge(Serialized::defaults(cli))
            .extract()?;
        config.hub.validate().map_err(figment::Error::from)?;
        Ok(config)
    }

    fn figment(config_path: &str) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("COURIER_").split("__"))
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Courier Server Configuration
# Place this file at ./courier.toml or specify with --config <path>
# All settings can be overridden via environment variables (COURIER_PORT,
# COURIER_HUB__THROTTLE_LIMIT, etc.) or CLI flags (--port, etc.)

# Server port (default: 8080)
# port = 8080

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Data directory for the SQLite database and JWT signing key
# data_dir = "./data"

# Message store backend: "sqlite" (persistent) or "memory" (lost on restart)
# message_store = "sqlite"

# ---- Delivery Hub ----
# [hub]

# Outbound events buffered per connection; a client that falls this far
# behind is disconnected and its messages go to the pending queue
# outbound_capacity = 256

# Close connections that send nothing (not even a pong) for this long
# liveness_window_secs = 60

# Drop a peer whose socket accepts no data for this long
# write_wait_secs = 10

# Largest inbound frame in KiB
# max_message_size_kb = 512

# Per-user send throttle: at most throttle_limit events per window
# (throttle_limit <= 0 disables it)
# throttle_limit = 10
# throttle_window_secs = 60

# Count read receipts and presence queries against the throttle too
# throttle_all_events = false
"#
    .to_string()
}
