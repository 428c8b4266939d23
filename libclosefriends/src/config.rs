//! Configuration management for CloseFriends

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, Result};
use crate::logging::LogFormat;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root of the per-user persisted layout
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default)]
    pub defaults: DefaultsConfig,

    #[serde(default)]
    pub lease: LeaseConfig,

    #[serde(default)]
    pub jobs: JobsConfig,

    #[serde(default)]
    pub proxy: Option<ProxyConfig>,

    #[serde(default)]
    pub logging: LogSettings,
}

/// Tunables copied into every newly connected account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default = "default_batch_size")]
    pub followers_batch_size: u32,
    #[serde(default = "default_batch_cooldown")]
    pub batch_cooldown: u64,
    #[serde(default = "default_action_delay_min")]
    pub action_delay_min: u64,
    #[serde(default = "default_action_delay_max")]
    pub action_delay_max: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    #[serde(default = "default_lease_ttl")]
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default)]
    pub on_missing_checkpoint: MissingCheckpointPolicy,
}

/// What a batch run does when the checkpoint is not in the follower list
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingCheckpointPolicy {
    #[default]
    Fail,
    Restart,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub login: String,
    pub password: String,
}

impl ProxyConfig {
    pub fn url(&self) -> String {
        format!(
            "http://{}:{}@{}:{}",
            self.login, self.password, self.host, self.port
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_data_dir() -> String {
    "~/.local/share/closefriends".to_string()
}

fn default_batch_size() -> u32 {
    200
}

fn default_batch_cooldown() -> u64 {
    60
}

fn default_action_delay_min() -> u64 {
    2
}

fn default_action_delay_max() -> u64 {
    5
}

fn default_lease_ttl() -> u64 {
    900
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            followers_batch_size: default_batch_size(),
            batch_cooldown: default_batch_cooldown(),
            action_delay_min: default_action_delay_min(),
            action_delay_max: default_action_delay_max(),
        }
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_lease_ttl(),
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}

impl Config {
    /// Load configuration from the default location
    ///
    /// A missing file is not an error: defaults apply. `CLOSEFRIENDS_DATA_DIR`
    /// overrides `data_dir` either way.
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        let mut config = if config_path.exists() {
            Self::load_from_path(&config_path)?
        } else {
            tracing::debug!(path = %config_path.display(), "No config file, using defaults");
            Self::default_config()
        };

        if let Ok(dir) = std::env::var("CLOSEFRIENDS_DATA_DIR") {
            config.data_dir = dir;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config = toml::from_str(&content).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            data_dir: default_data_dir(),
            defaults: DefaultsConfig::default(),
            lease: LeaseConfig::default(),
            jobs: JobsConfig::default(),
            proxy: None,
            logging: LogSettings::default(),
        }
    }

    /// Configuration rooted at an explicit data directory
    pub fn with_data_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: dir.as_ref().to_string_lossy().to_string(),
            ..Self::default_config()
        }
    }

    pub fn validate(&self) -> Result<()> {
        let d = &self.defaults;
        if d.followers_batch_size == 0 {
            return Err(invalid("defaults.followers_batch_size", "must be at least 1"));
        }
        if d.action_delay_min > d.action_delay_max {
            return Err(invalid(
                "defaults.action_delay_min",
                &format!(
                    "{} is greater than action_delay_max {}",
                    d.action_delay_min, d.action_delay_max
                ),
            ));
        }
        if self.lease.ttl_secs == 0 {
            return Err(invalid("lease.ttl_secs", "must be at least 1"));
        }
        self.logging
            .format
            .parse::<LogFormat>()
            .map_err(|reason| invalid("logging.format", &reason))?;
        Ok(())
    }

    /// The data directory with `~` expanded
    pub fn data_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.data_dir).to_string())
    }
}

fn invalid(field: &str, reason: &str) -> crate::error::CloseFriendsError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

/// Resolve the configuration file path (XDG config directory)
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("CLOSEFRIENDS_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("closefriends").join("config.toml"))
}
