//! Relay configuration file handling
//!
//! TOML file with `[connection]`, `[webhook]`, `[storage]` and `[logging]`
//! sections. Every section and key is optional; durations are
//! human-readable strings such as `"5s"` or `"500ms"`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default log level
const DEFAULT_LOG_LEVEL: &str = "info";

const APP_DIR: &str = "session-relay";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write config file '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Relay configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub webhook: WebhookConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connection state machine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Reconnect attempts before an instance is left disconnected
    pub max_reconnect_attempts: u32,

    /// Delay before reconnect attempt n is n × this
    #[serde(with = "humantime_serde")]
    pub reconnect_base_delay: Duration,

    /// How long to wait for the app-state sync signal before assuming ready
    #[serde(with = "humantime_serde")]
    pub readiness_timeout: Duration,

    /// How long a pairing-code request waits for a transport session
    #[serde(with = "humantime_serde")]
    pub pairing_poll_window: Duration,

    #[serde(with = "humantime_serde")]
    pub pairing_poll_interval: Duration,

    /// Capacity of each instance's transport event channel
    pub event_buffer: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_secs(5),
            readiness_timeout: Duration::from_secs(10),
            pairing_poll_window: Duration::from_secs(10),
            pairing_poll_interval: Duration::from_millis(500),
            event_buffer: 64,
        }
    }
}

/// Webhook delivery settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Per-attempt HTTP timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Retries after the first attempt
    pub max_retries: u32,

    /// Delay before retry n is n × this
    #[serde(with = "humantime_serde")]
    pub retry_base_delay: Duration,

    pub user_agent: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_base_delay: Duration::from_secs(5),
            user_agent: format!("session-relay/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Storage settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file
    pub database: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

/// `~/.config/session-relay/config.toml` (platform equivalent)
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("config.toml")
}

/// `~/.local/share/session-relay/relay.db` (platform equivalent)
pub fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("relay.db")
}

impl RelayConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load `path` if it exists, defaults otherwise
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        write_file(path, &contents)
    }

    /// Write the commented default configuration to `path`
    pub fn create_default(path: &Path, database: &Path) -> Result<(), ConfigError> {
        write_file(path, &Self::generate_default_toml(database))
    }

    /// Generate default configuration content as a string with comments
    pub fn generate_default_toml(database: &Path) -> String {
        let webhook = WebhookConfig::default();
        format!(
            r#"# Session Relay Configuration
#
# Durations accept human-readable values: "500ms", "5s", "1m".

[connection]
# Reconnect attempts after a recoverable disconnect before giving up
max_reconnect_attempts = 5

# Delay before reconnect attempt n is n x reconnect_base_delay
reconnect_base_delay = "5s"

# Mark the session ready if no app-state sync signal arrives within this window
readiness_timeout = "10s"

# How long a pairing-code request waits for a transport session
pairing_poll_window = "10s"
pairing_poll_interval = "500ms"

# Capacity of each instance's transport event channel
event_buffer = 64

[webhook]
# Per-attempt HTTP timeout
timeout = "10s"

# Retries after the first attempt (delays: 1x, 2x, 3x retry_base_delay)
max_retries = 3
retry_base_delay = "5s"

user_agent = "{user_agent}"

[storage]
# SQLite database holding instance records and webhook delivery logs
database = "{database}"

[logging]
# Log level: trace, debug, info, warn, error
# RUST_LOG and SESSION_RELAY_LOG override this
level = "info"
"#,
            user_agent = webhook.user_agent,
            database = database.display().to_string().replace('\\', "\\\\"),
        )
    }
}

fn write_file(path: &Path, contents: &str) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    }
    fs::write(path, contents).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Serde adapter for `Duration` as a humantime string
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
