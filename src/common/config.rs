//! Configuration for minishard components

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming the TOML config file
pub const CONFIG_ENV: &str = "MINISHARD_CONFIG";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node ID (unique identifier)
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Coordinator-specific config
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Replication and catch-up tuning
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_node_id() -> String {
    "coord-1".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            coordinator: CoordinatorConfig::default(),
            replication: ReplicationConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from the file named by `MINISHARD_CONFIG` (optional,
    /// defaults to `minishard.toml`) layered with `MINISHARD__*` environment variables.
    pub fn load() -> crate::Result<Self> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| "minishard.toml".to_string());
        let settings = config::Config::builder()
            .add_source(config::File::with_name(&path).required(false))
            .add_source(config::Environment::with_prefix("MINISHARD").separator("__"))
            .build()
            .map_err(|e| crate::Error::InvalidConfig(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| crate::Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        self.coordinator.validate()?;
        self.replication.validate()
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Bind address for the HTTP API
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// RocksDB path for persistent cluster state (in-memory only when unset)
    #[serde(default)]
    pub db_path: Option<PathBuf>,

    /// Number of in-process nodes started by the development coordinator
    #[serde(default = "default_local_nodes")]
    pub local_nodes: usize,

    /// Default bound for state convergence waits
    #[serde(default = "default_state_wait_timeout")]
    pub state_wait_timeout_ms: u64,

    /// Bound for delete-collection completion polling
    #[serde(default = "default_deletion_timeout")]
    pub deletion_timeout_ms: u64,

    /// Placement limit when no cluster property overrides it
    #[serde(default = "default_max_replicas_per_node")]
    pub max_replicas_per_node: usize,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8983))
}
fn default_local_nodes() -> usize {
    2
}
fn default_state_wait_timeout() -> u64 {
    30_000
}
fn default_deletion_timeout() -> u64 {
    10_000
}
fn default_max_replicas_per_node() -> usize {
    100
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            db_path: None,
            local_nodes: default_local_nodes(),
            state_wait_timeout_ms: default_state_wait_timeout(),
            deletion_timeout_ms: default_deletion_timeout(),
            max_replicas_per_node: default_max_replicas_per_node(),
        }
    }
}

impl CoordinatorConfig {
    pub fn state_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.state_wait_timeout_ms)
    }

    pub fn deletion_timeout(&self) -> Duration {
        Duration::from_millis(self.deletion_timeout_ms)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.local_nodes == 0 {
            return Err(crate::Error::InvalidConfig(
                "local_nodes must be at least 1".into(),
            ));
        }
        if self.state_wait_timeout_ms == 0 || self.deletion_timeout_ms == 0 {
            return Err(crate::Error::InvalidConfig(
                "timeouts must be non-zero".into(),
            ));
        }
        if self.max_replicas_per_node == 0 {
            return Err(crate::Error::InvalidConfig(
                "max_replicas_per_node must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Overall bound for one catch-up, retries included
    #[serde(default = "default_catch_up_timeout")]
    pub catch_up_timeout_ms: u64,

    /// Attempts per catch-up before the replica is left Down
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// First backoff delay, doubled on each retry
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Committed update log entries a core keeps in memory for followers
    #[serde(default = "default_log_retention")]
    pub log_retention: usize,
}

fn default_catch_up_timeout() -> u64 {
    10_000
}
fn default_max_retries() -> usize {
    3
}
fn default_initial_backoff() -> u64 {
    50
}
fn default_log_retention() -> usize {
    10_000
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            catch_up_timeout_ms: default_catch_up_timeout(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            log_retention: default_log_retention(),
        }
    }
}

impl ReplicationConfig {
    pub fn catch_up_timeout(&self) -> Duration {
        Duration::from_millis(self.catch_up_timeout_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.catch_up_timeout_ms == 0 {
            return Err(crate::Error::InvalidConfig(
                "catch_up_timeout_ms must be non-zero".into(),
            ));
        }
        if self.max_retries == 0 {
            return Err(crate::Error::InvalidConfig(
                "max_retries must be at least 1".into(),
            ));
        }
        if self.log_retention == 0 {
            return Err(crate::Error::InvalidConfig(
                "log_retention must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
