#![deny(unsafe_code)]

//! Configuration loading and validation for rigd.
//!
//! Loads TOML configuration files and validates them against expected schemas.
//! Provides the [`AppConfig`] type as the central configuration structure. All
//! tunables that govern failure handling (breaker thresholds, retry cooldowns,
//! timeouts) live here rather than as constants in the engine, so deployments
//! can adapt them to their hardware without rebuilding.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level application configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Daemon runtime configuration (poll cadence, action timeouts).
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Circuit-breaker thresholds and cooldown schedule.
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Transport acquisition and I/O timeouts.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Event-bus buffering.
    #[serde(default)]
    pub bus: BusConfig,

    /// Command lifecycle tracking.
    #[serde(default)]
    pub command: CommandConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Statically declared peripherals, consumed by the config-backed
    /// discovery probe in the CLI. Deployments that wire in a live
    /// hardware-enumeration probe leave this empty.
    #[serde(default)]
    pub peripherals: Vec<PeripheralEntry>,
}

/// Configuration for the generic daemon runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Interval between peripheral polls, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Maximum wall time for a single hardware action, in seconds.
    #[serde(default = "default_action_timeout_secs")]
    pub action_timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            action_timeout_secs: default_action_timeout_secs(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_action_timeout_secs() -> u64 {
    30
}

impl DaemonConfig {
    /// Poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Action timeout as a [`Duration`].
    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs)
    }
}

/// Circuit-breaker thresholds and cooldown schedule.
///
/// The breaker opens after `failure_threshold` consecutive failures, stays
/// open for the current cooldown, then admits exactly one probe. Each
/// consecutive open period multiplies the cooldown by `backoff_multiplier`,
/// capped at `max_cooldown_ms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Initial cooldown while open, in milliseconds.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Multiplier applied to the cooldown on each failed probe.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Upper bound on the cooldown, in milliseconds.
    #[serde(default = "default_max_cooldown_ms")]
    pub max_cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_cooldown_ms: default_max_cooldown_ms(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cooldown_ms() -> u64 {
    2_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_cooldown_ms() -> u64 {
    60_000
}

impl BreakerConfig {
    /// Initial cooldown as a [`Duration`].
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    /// Cooldown cap as a [`Duration`].
    pub fn max_cooldown(&self) -> Duration {
        Duration::from_millis(self.max_cooldown_ms)
    }
}

/// Transport acquisition and I/O timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Maximum wait for exclusive channel ownership, in milliseconds.
    /// Exceeding this yields a contention error, never an indefinite hang.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// Timeout for a single read/write on an open channel, in milliseconds.
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: default_acquire_timeout_ms(),
            io_timeout_ms: default_io_timeout_ms(),
        }
    }
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

fn default_io_timeout_ms() -> u64 {
    2_000
}

impl TransportConfig {
    /// Acquire timeout as a [`Duration`].
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// I/O timeout as a [`Duration`].
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

/// Event-bus buffering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Number of events retained for slow subscribers before the oldest
    /// are dropped.
    #[serde(default = "default_bus_capacity")]
    pub capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: default_bus_capacity(),
        }
    }
}

fn default_bus_capacity() -> usize {
    256
}

/// Command lifecycle tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    /// Deadline for a command to reach a terminal state, in seconds.
    /// Commands still pending at the deadline are marked timed-out.
    #[serde(default = "default_command_deadline_secs")]
    pub deadline_secs: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            deadline_secs: default_command_deadline_secs(),
        }
    }
}

fn default_command_deadline_secs() -> u64 {
    60
}

impl CommandConfig {
    /// Command deadline as a [`Duration`].
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// A statically declared peripheral.
///
/// ## TOML Example
///
/// ```toml
/// [[peripherals]]
/// name = "arduino"
/// kind = "microcontroller"
/// address = "/dev/ttyACM0"
/// capabilities = ["can-actuate"]
///
/// [[peripherals]]
/// name = "flipper"
/// kind = "radio"
/// address = "/dev/ttyUSB0"
/// capabilities = ["can-scan"]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeripheralEntry {
    /// Unique peripheral name (used as daemon name and state-path root).
    pub name: String,

    /// Peripheral class: "microcontroller", "radio", or "accelerator".
    pub kind: String,

    /// Transport address (serial port or bus path).
    pub address: String,

    /// Capability tags (e.g. "can-scan", "can-actuate", "can-infer").
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Peripheral kinds accepted in `[[peripherals]]` entries.
pub const KNOWN_PERIPHERAL_KINDS: &[&str] = &["microcontroller", "radio", "accelerator"];

impl AppConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "daemon.poll_interval_ms must be non-zero".to_string(),
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::Validation(
                "breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.breaker.backoff_multiplier < 1.0 {
            return Err(ConfigError::Validation(format!(
                "breaker.backoff_multiplier must be >= 1.0, got {}",
                self.breaker.backoff_multiplier
            )));
        }
        if self.breaker.max_cooldown_ms < self.breaker.cooldown_ms {
            return Err(ConfigError::Validation(
                "breaker.max_cooldown_ms must be >= breaker.cooldown_ms".to_string(),
            ));
        }
        if self.transport.acquire_timeout_ms == 0 || self.transport.io_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "transport timeouts must be non-zero".to_string(),
            ));
        }
        if self.bus.capacity < 2 {
            return Err(ConfigError::Validation(
                "bus.capacity must be at least 2".to_string(),
            ));
        }
        if self.command.deadline_secs == 0 {
            return Err(ConfigError::Validation(
                "command.deadline_secs must be non-zero".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for entry in &self.peripherals {
            if entry.name.is_empty() {
                return Err(ConfigError::Validation(
                    "peripherals entry with empty name".to_string(),
                ));
            }
            if entry.name.contains('.') {
                return Err(ConfigError::Validation(format!(
                    "peripheral name {:?} must not contain '.' (reserved as path separator)",
                    entry.name
                )));
            }
            if !seen.insert(entry.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate peripheral name {:?}",
                    entry.name
                )));
            }
            if !KNOWN_PERIPHERAL_KINDS.contains(&entry.kind.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "peripheral {:?}: kind must be one of {:?}, got {:?}",
                    entry.name, KNOWN_PERIPHERAL_KINDS, entry.kind
                )));
            }
            if entry.address.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "peripheral {:?}: address must not be empty",
                    entry.name
                )));
            }
        }

        Ok(())
    }
}
