//! Connector configuration
//!
//! Loaded once at startup from an optional config file layered with
//! `BUSRELAY_*` environment variables, then validated before anything else
//! is constructed. Components receive the validated struct by reference;
//! there is no process-wide settings registry.

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Connector configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub bus: BusConfig,
    pub store: StoreConfig,
    pub relay: RelayConfig,
    pub arbiter: ArbiterConfig,
    pub logging: LoggingConfig,
}

/// Identity of this connector instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Logical identity shared by all sibling instances
    pub name: String,
    /// Resource id distinguishing this instance among its siblings.
    /// Empty means "generate from hostname plus a random suffix".
    pub resource: String,
    /// Local line-delimited socket endpoint for producers and consumers
    pub listen: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "busrelay".to_string(),
            resource: String::new(),
            listen: "127.0.0.1:5678".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Broker hosts tried in order on connect failure. Entries may be
    /// "host", "host:port" or bracketed IPv6 such as "[::1]:5671".
    pub hosts: Vec<String>,
    /// Port applied to host entries that do not carry one
    pub default_port: u16,
    /// Destination exchange for outbound publishes
    pub exchange: String,
    /// Queue consumed by the inbound listener
    pub queue: String,
    /// Connect attempts per host before moving to the next one
    pub attempts_per_host: u32,
    pub connect_timeout_secs: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            hosts: vec!["localhost".to_string()],
            default_port: 5671,
            exchange: "monitoring".to_string(),
            queue: "busrelay".to_string(),
            attempts_per_host: 3,
            connect_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file holding both direction tables
    pub path: String,
    /// `buffer_in` size beyond which a background flush is scheduled
    pub flush_threshold: usize,
    /// Disk refill batch size as a multiple of `flush_threshold`
    pub refill_factor: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "busrelay.db".to_string(),
            flush_threshold: 1000,
            refill_factor: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Capacity of the in-memory live queue
    pub max_queue_size: usize,
    /// Unacknowledged in-flight send cap. 0 derives it from the
    /// server-advertised limit (80% safety margin).
    pub max_send_simult: u32,
    /// Same-kind batch size; 0 disables batching
    pub batch_size: usize,
    /// Messages handled per loop iteration before yielding
    pub max_per_iteration: usize,
    /// Error-text substrings classified as non-retryable rejections
    pub reject_patterns: Vec<String>,
    /// Status report interval in seconds
    pub status_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            max_send_simult: 0,
            batch_size: 0,
            max_per_iteration: 4096,
            reject_patterns: vec!["not-acceptable".to_string()],
            status_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    /// Steady-state leadership rotation frequency
    pub drift_interval_secs: u64,
    /// Delay before a tier-1 instance attempts to become master
    pub master_delay_ms: u64,
    /// Delay before the post-claim step-down check
    pub stepdown_delay_ms: u64,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            drift_interval_secs: 10,
            master_delay_ms: 500,
            stepdown_delay_ms: 1500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load from an optional file path layered with environment variables
    /// (`BUSRELAY_BUS_EXCHANGE`, etc.)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("BUSRELAY")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Validate configuration, collecting every problem instead of stopping
    /// at the first one. Any returned error is fatal at startup.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.node.name.is_empty() {
            errors.push("node.name must not be empty".to_string());
        }
        if self.node.listen.parse::<std::net::SocketAddr>().is_err() {
            errors.push("node.listen must be a socket address".to_string());
        }
        if self.bus.hosts.is_empty() {
            errors.push("bus.hosts must list at least one broker host".to_string());
        }
        if self.bus.exchange.is_empty() {
            errors.push("bus.exchange must not be empty".to_string());
        }
        if self.bus.default_port == 0 {
            errors.push("bus.default_port must not be 0".to_string());
        }
        if self.store.path.is_empty() {
            errors.push("store.path must not be empty".to_string());
        }
        if self.store.flush_threshold == 0 {
            errors.push("store.flush_threshold must be at least 1".to_string());
        }
        if self.store.refill_factor == 0 {
            errors.push("store.refill_factor must be at least 1".to_string());
        }
        if self.relay.max_queue_size < 16 {
            errors.push("relay.max_queue_size must be at least 16".to_string());
        }
        if self.relay.max_per_iteration == 0 {
            errors.push("relay.max_per_iteration must be at least 1".to_string());
        }
        if self.arbiter.drift_interval_secs == 0 {
            errors.push("arbiter.drift_interval_secs must be at least 1".to_string());
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

/// Load configuration from the default search locations
///
/// Search order: `BUSRELAY_CONFIG_PATH`, `./busrelay.yaml`, environment
/// variables only.
pub fn load_config() -> anyhow::Result<Config> {
    let config_path = std::env::var("BUSRELAY_CONFIG_PATH")
        .ok()
        .filter(|p| Path::new(p).exists())
        .or_else(|| {
            let cwd = "busrelay.yaml";
            Path::new(cwd).exists().then(|| cwd.to_string())
        });

    let config = match config_path {
        Some(path) => Config::load(Some(&path))
            .map_err(|e| anyhow::anyhow!("Failed to load {path}: {e}"))?,
        None => Config::from_env()
            .map_err(|e| anyhow::anyhow!("Failed to load config from environment: {e}"))?,
    };

    Ok(config)
}
