//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/emberline/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/emberline/` (~/.config/emberline/)
//! - Data: `$XDG_DATA_HOME/emberline/` (~/.local/share/emberline/)
//! - State/Logs: `$XDG_STATE_HOME/emberline/` (~/.local/state/emberline/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// API key identifying this application to the collector
    pub api_key: Option<String>,

    /// Session tracking configuration
    #[serde(default)]
    pub tracker: TrackerConfig,

    /// Uploader configuration
    #[serde(default)]
    pub uploader: UploaderConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Session tracking configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TrackerConfig {
    /// Seconds after a close during which a new open resumes the session
    #[serde(default = "default_reconnect_window_secs")]
    pub reconnect_window_secs: u64,

    /// Maximum attributes recorded per event; extras are dropped
    #[serde(default = "default_max_attributes")]
    pub max_attributes: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            reconnect_window_secs: default_reconnect_window_secs(),
            max_attributes: default_max_attributes(),
        }
    }
}

fn default_reconnect_window_secs() -> u64 {
    15
}

fn default_max_attributes() -> usize {
    10
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

/// Uploader configuration
///
/// When enabled, cut blobs are delivered to the collector endpoint; when
/// disabled, events simply accumulate in the local queue.
#[derive(Debug, Deserialize, Clone)]
pub struct UploaderConfig {
    /// Enable/disable blob delivery
    #[serde(default)]
    pub enabled: bool,

    /// Collector base URL (e.g., `https://collect.example.com`)
    pub server_url: Option<String>,

    /// Optional bearer token sent with every upload
    pub auth_token: Option<String>,

    /// HTTP request timeout in seconds
    #[serde(default = "default_uploader_timeout")]
    pub timeout_secs: u64,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            server_url: None,
            auth_token: None,
            timeout_secs: default_uploader_timeout(),
        }
    }
}

impl UploaderConfig {
    /// Check if the uploader is properly configured and enabled
    pub fn is_ready(&self) -> bool {
        self.enabled && self.server_url.is_some()
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        if self.server_url.is_none() {
            return Err(Error::Config(
                "uploader.server_url is required when uploader is enabled".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(Error::Config(
                "uploader.timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_uploader_timeout() -> u64 {
    30
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// The configured API key, or an error when missing
    pub fn require_api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| Error::Config("api_key is required in config.toml".to_string()))
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/emberline/config.toml` (~/.config/emberline/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("emberline").join("config.toml")
    }

    /// Returns the data directory path (for SQLite database)
    ///
    /// `$XDG_DATA_HOME/emberline/` (~/.local/share/emberline/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("emberline")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/emberline/` (~/.local/state/emberline/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("emberline")
    }

    /// Returns the database file path
    ///
    /// `$XDG_DATA_HOME/emberline/queue.db` (~/.local/share/emberline/queue.db)
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("queue.db")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/emberline/emberline.log` (~/.local/state/emberline/emberline.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("emberline.log")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}
