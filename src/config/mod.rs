//! Configuration Module
//!
//! TOML configuration for the broker with:
//! - Listener settings (bind address, work-context pool size)
//! - Resource limits and the exhaustion policy
//! - Per-pipe timers
//! - Protocol error handling
//! - `${VAR}` / `${VAR:-default}` substitution in the file
//! - Environment overrides (`VIBEMQ_NANO__SECTION__KEY`)

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::codec::{DEFAULT_MAX_PACKET_SIZE, MAX_REMAINING_LENGTH};
use crate::engine::{EngineSettings, ProtocolErrorAction};
use crate::policy::{AbortPolicy, RejectPolicy, SharedPolicy};
use crate::transport::TransportSettings;


const ENV_PREFIX: &str = "VIBEMQ_NANO";

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned())
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Bad substitution pattern
    Pattern(regex::Error),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Pattern(e) => write!(f, "Substitution error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

impl From<regex::Error> for ConfigError {
    fn from(e: regex::Error) -> Self {
        ConfigError::Pattern(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub server: ServerConfig,
    pub limits: LimitsConfig,
    pub session: SessionConfig,
    pub mqtt: MqttConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address
    pub bind: SocketAddr,
    /// Number of work contexts serving inbound packets
    pub parallel: usize,
    /// Listen backlog
    pub backlog: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 1883)),
            parallel: 32,
            backlog: 1024,
        }
    }
}

/// What the broker does when a bounded resource runs out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnExhausted {
    #[default]
    Abort,
    Reject,
}

/// Resource limits. 0 means unbounded.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_packet_size: usize,
    pub max_connections: usize,
    pub max_topic_nodes: usize,
    pub max_pending_deliveries: usize,
    /// Frames parked per busy pipe before the oldest is dropped
    pub resend_queue_capacity: usize,
    pub on_exhausted: OnExhausted,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            max_connections: 0,
            max_topic_nodes: 0,
            max_pending_deliveries: 0,
            resend_queue_capacity: 64,
            on_exhausted: OnExhausted::Abort,
        }
    }
}

impl LimitsConfig {
    pub fn policy(&self) -> SharedPolicy {
        match self.on_exhausted {
            OnExhausted::Abort => Arc::new(AbortPolicy),
            OnExhausted::Reject => Arc::new(RejectPolicy),
        }
    }
}

/// Per-pipe timers
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Time a new connection has to send CONNECT
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Period of the keepalive/resend timer
    #[serde(with = "humantime_serde")]
    pub qos_timer: Duration,
    /// Age before an unacknowledged delivery is resent.
    /// Defaults to 1.25 x `qos_timer`.
    #[serde(with = "humantime_serde")]
    pub resend_after: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            qos_timer: Duration::from_secs(3),
            resend_after: None,
        }
    }
}

impl SessionConfig {
    pub fn resend_after(&self) -> Duration {
        self.resend_after
            .unwrap_or_else(|| self.qos_timer.mul_f64(1.25))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub protocol_error_action: ProtocolErrorAction,
    pub retain_available: bool,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            protocol_error_action: ProtocolErrorAction::Drop,
            retain_available: true,
        }
    }
}

impl Config {
    /// Load `path` (a missing file means defaults) with env var
    /// substitution, then apply `VIBEMQ_NANO__*` overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("server.bind", "0.0.0.0:1883")?
            .set_default("server.parallel", 32)?
            .set_default("server.backlog", 1024)?
            .set_default("limits.max_packet_size", DEFAULT_MAX_PACKET_SIZE as u64)?
            .set_default("limits.max_connections", 0)?
            .set_default("limits.max_topic_nodes", 0)?
            .set_default("limits.max_pending_deliveries", 0)?
            .set_default("limits.resend_queue_capacity", 64)?
            .set_default("limits.on_exhausted", "abort")?
            .set_default("session.connect_timeout", "10s")?
            .set_default("session.qos_timer", "3s")?
            .set_default("mqtt.protocol_error_action", "drop")?
            .set_default("mqtt.retain_available", true)?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content)?;
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore stays
        // part of the field name
        let cfg = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(&substitute_env_vars(content)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(
            self.log.level.to_ascii_lowercase().as_str(),
            "error" | "warn" | "info" | "debug" | "trace"
        ) {
            return Err(ConfigError::Validation(format!(
                "unknown log level '{}'",
                self.log.level
            )));
        }
        if self.server.parallel == 0 {
            return Err(ConfigError::Validation(
                "server.parallel must be at least 1".to_string(),
            ));
        }
        if self.limits.max_packet_size == 0 || self.limits.max_packet_size > MAX_REMAINING_LENGTH {
            return Err(ConfigError::Validation(format!(
                "limits.max_packet_size must be between 1 and {}",
                MAX_REMAINING_LENGTH
            )));
        }
        if self.limits.resend_queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "limits.resend_queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.session.qos_timer.is_zero() {
            return Err(ConfigError::Validation(
                "session.qos_timer must be non-zero".to_string(),
            ));
        }
        if self.session.connect_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "session.connect_timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            max_packet_size: self.limits.max_packet_size,
            max_connections: self.limits.max_connections,
            resend_queue_capacity: self.limits.resend_queue_capacity,
            qos_timer: self.session.qos_timer,
            resend_after: self.session.resend_after(),
            connect_timeout: self.session.connect_timeout,
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            protocol_error_action: self.mqtt.protocol_error_action,
            retain_available: self.mqtt.retain_available,
        }
    }
}
