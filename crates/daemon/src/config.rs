//! Configuration management for the ptymux daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/ptymux/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("subscriber_queue_capacity must be between 1 and 65536, got {0}")]
    InvalidSubscriberQueueCapacity(usize),

    #[error("input_queue_capacity must be between 1 and 65536, got {0}")]
    InvalidInputQueueCapacity(usize),

    #[error("terminate_grace_ms must be between 1 and 60000, got {0}")]
    InvalidTerminateGrace(u64),

    #[error("reap_interval_secs must be greater than 0 when idle_timeout_secs is set")]
    InvalidReapInterval,

    #[error("default_shell not found or not executable: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Upper bound for both queue capacities.
const MAX_QUEUE_CAPACITY: usize = 65536;

/// Main configuration structure for the ptymux daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Session management configuration.
    pub session: SessionConfig,

    /// Local control socket configuration.
    pub ipc: IpcConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for storing daemon data (PID file).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for rolling log files when running in the background.
    pub log_dir: PathBuf,
}

/// Session management configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Program started when a create request names no command.
    pub default_shell: String,

    /// `TERM` value given to new sessions unless the request sets one.
    pub term: String,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// Output chunks buffered per subscriber before chunks are dropped.
    pub subscriber_queue_capacity: usize,

    /// Input chunks buffered per session before input is refused.
    pub input_queue_capacity: usize,

    /// Milliseconds between SIGHUP and SIGKILL when terminating.
    pub terminate_grace_ms: u64,

    /// Terminate sessions without subscribers after this many idle seconds
    /// (0 = never).
    pub idle_timeout_secs: u64,

    /// How often the idle reaper runs, in seconds.
    pub reap_interval_secs: u64,
}

/// Local control socket configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct IpcConfig {
    /// Socket path. Derived from the runtime directory when unset.
    pub socket_path: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            log_dir: data_dir.join("logs"),
            data_dir,
            log_level: "info".to_string(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            term: "xterm-256color".to_string(),
            max_sessions: 64,
            subscriber_queue_capacity: 256,
            input_queue_capacity: 256,
            terminate_grace_ms: 2000,
            idle_timeout_secs: 0,
            reap_interval_secs: 30,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ptymux")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ptymux")
}

/// Returns the user's login shell, falling back to `/bin/sh`.
fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PTYMUX_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - PTYMUX_DEFAULT_SHELL: Override the default shell
    /// - PTYMUX_SOCKET_PATH: Override the control socket path
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("PTYMUX_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(shell) = std::env::var("PTYMUX_DEFAULT_SHELL") {
            if !shell.is_empty() {
                tracing::info!("Overriding default_shell from environment: {}", shell);
                self.session.default_shell = shell;
            }
        }

        if let Ok(path) = std::env::var("PTYMUX_SOCKET_PATH") {
            if !path.is_empty() {
                tracing::info!("Overriding socket_path from environment: {}", path);
                self.ipc.socket_path = Some(PathBuf::from(path));
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let session = &self.session;

        if session.max_sessions < 1 || session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(session.max_sessions));
        }

        if session.subscriber_queue_capacity == 0
            || session.subscriber_queue_capacity > MAX_QUEUE_CAPACITY
        {
            return Err(ConfigError::InvalidSubscriberQueueCapacity(
                session.subscriber_queue_capacity,
            ));
        }

        if session.input_queue_capacity == 0 || session.input_queue_capacity > MAX_QUEUE_CAPACITY {
            return Err(ConfigError::InvalidInputQueueCapacity(
                session.input_queue_capacity,
            ));
        }

        if session.terminate_grace_ms == 0 || session.terminate_grace_ms > 60_000 {
            return Err(ConfigError::InvalidTerminateGrace(session.terminate_grace_ms));
        }

        if session.idle_timeout_secs > 0 && session.reap_interval_secs == 0 {
            return Err(ConfigError::InvalidReapInterval);
        }

        // Absolute paths must exist; bare names are looked up in PATH.
        let shell_path = Path::new(&session.default_shell);
        let shell_found = if shell_path.is_absolute() {
            shell_path.is_file()
        } else {
            which::which(&session.default_shell).is_ok()
        };
        if !shell_found {
            return Err(ConfigError::InvalidShellPath(session.default_shell.clone()));
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }

    /// Returns the control socket path, from config or the runtime default.
    pub fn socket_path(&self) -> PathBuf {
        self.ipc
            .socket_path
            .clone()
            .unwrap_or_else(crate::ipc::get_socket_path)
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
