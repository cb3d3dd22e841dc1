//! Configuration types for the agent.

use crate::location::Location;
use crate::metrics::MetricDomain;
use crate::scheduler::tasks::TaskSpec;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Aggregator link settings.
    pub server: ServerConfig,
    /// Node identity used for authentication.
    pub node: NodeConfig,
    /// Telemetry collection cadence and bounds.
    pub monitoring: MonitoringConfig,
    /// Uptime reward gating.
    pub reward: RewardConfig,
    /// Persistent state location.
    pub storage: StorageConfig,
    /// Log output.
    pub logging: LoggingConfig,
    /// Monitoring tasks registered at boot.
    pub tasks: Vec<TaskSpec>,
}

/// Aggregator connection and reconnect policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// WebSocket URL of the aggregator.
    pub url: String,
    /// Backoff attempts before the long cooldown kicks in.
    pub max_reconnect_attempts: u32,
    /// First reconnect delay in milliseconds.
    pub base_delay_ms: u64,
    /// Cap applied to the exponential component, before jitter.
    pub max_delay_ms: u64,
    /// Absolute ceiling on any reconnect delay, jitter included.
    pub ceiling_ms: u64,
    /// Cooldown after `max_reconnect_attempts` is exceeded.
    pub cooldown_secs: u64,
    /// Upper bound of the random jitter, as a fraction of the capped delay.
    pub jitter_ratio: f64,
    /// Errors within this window of connection start inflate the backoff.
    pub grace_window_ms: u64,
    /// Liveness ping period while connected.
    pub ping_interval_secs: u64,
    /// Period of the independent transport health check.
    pub health_check_interval_secs: u64,
    /// Delay before re-registering after an "unknown node" auth failure.
    pub auth_retry_delay_secs: u64,
    /// Maximum high-priority messages held while disconnected.
    pub pending_capacity: usize,
    /// Time allowed for the transport handshake before the attempt fails.
    pub connect_timeout_ms: u64,
    /// Time allowed for a single frame write before the link is dropped.
    pub send_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws".to_owned(),
            max_reconnect_attempts: 10,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            ceiling_ms: 60_000,
            cooldown_secs: 300,
            jitter_ratio: 0.3,
            grace_window_ms: 5_000,
            ping_interval_secs: 30,
            health_check_interval_secs: 60,
            auth_retry_delay_secs: 5,
            pending_capacity: 100,
            connect_timeout_ms: 10_000,
            send_timeout_ms: 10_000,
        }
    }
}

impl ServerConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }

    pub fn auth_retry_delay(&self) -> Duration {
        Duration::from_secs(self.auth_retry_delay_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms.max(1))
    }
}

/// Identity presented to the aggregator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Registered node identifier. Authentication is skipped when unset.
    pub node_id: Option<String>,
    /// Payout wallet address, forwarded on registration.
    pub wallet: Option<String>,
    /// Static location reported on registration.
    pub location: Option<Location>,
}

/// Telemetry collection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Collection + processing period in seconds (rounded up to whole minutes).
    pub interval_secs: u64,
    /// Status heartbeat period in seconds (rounded up to whole minutes).
    pub heartbeat_interval_secs: u64,
    /// Per-domain provider timeout in milliseconds.
    pub collection_timeout_ms: u64,
    /// Enabled metric domains.
    pub domains: Vec<MetricDomain>,
    /// Checkpoint persistence period in minutes.
    pub checkpoint_interval_mins: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            heartbeat_interval_secs: 300,
            collection_timeout_ms: 5_000,
            domains: MetricDomain::ALL.to_vec(),
            checkpoint_interval_mins: 30,
        }
    }
}

impl MonitoringConfig {
    pub fn collection_timeout(&self) -> Duration {
        Duration::from_millis(self.collection_timeout_ms)
    }
}

/// Reward gating settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardConfig {
    /// Whether the evaluator is scheduled at all.
    pub enabled: bool,
    /// Minimum seconds between two issued rewards.
    pub interval_secs: u64,
    /// Amount paid at 100% uptime.
    pub base_amount: f64,
    /// Minimum uptime percentage that earns a reward.
    pub threshold_percent: f64,
    /// How often the evaluator runs, in seconds.
    pub check_interval_secs: u64,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 86_400,
            base_amount: 1.0,
            threshold_percent: 90.0,
            check_interval_secs: 3_600,
        }
    }
}

/// Persistent state location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// State file path. Defaults to [`crate::dirs::state_file`].
    pub state_path: Option<PathBuf>,
}

impl StorageConfig {
    pub fn resolved_state_path(&self) -> PathBuf {
        self.state_path
            .clone()
            .unwrap_or_else(crate::dirs::state_file)
    }
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    /// Emit JSON lines instead of the human-readable format.
    pub json: bool,
    /// Also write daily rolling log files into this directory.
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_owned(),
            json: false,
            directory: None,
        }
    }
}

impl AgentConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::AgentError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::AgentError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/vigil/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("vigil").join("config.toml")
        } else {
            crate::dirs::config_dir().join("config.toml")
        }
    }
}
