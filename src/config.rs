use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sink::local::{DEFAULT_KEY, DEFAULT_MAX_EVENTS};

/// Main insidr configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// WebSocket endpoint events are streamed to; no streaming when unset
    pub endpoint: Option<String>,
    /// Sent in the `_auth` frame; remote script execution requires it
    pub auth_token: Option<String>,
    /// Location reported in `agent.started` and the `_auth` frame
    pub url: String,
    pub capture: CaptureConfig,
    /// Milliseconds between `performance.metrics` samples
    pub performance_interval: u64,
    pub reconnect: bool,
    /// Milliseconds between reconnect attempts
    pub reconnect_interval: u64,
    pub max_reconnect_attempts: u32,
    /// Events kept while the WebSocket is down
    pub buffer_size: usize,
    pub local: LocalConfig,
    pub commands: CommandsConfig,
    /// Durable storage directory (device id, local event log)
    pub storage_dir: PathBuf,
    pub log_level: LogLevel,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub console: bool,
    pub network: bool,
    pub errors: bool,
    pub performance: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LocalConfig {
    pub enabled: bool,
    pub key: String,
    pub max_events: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CommandsConfig {
    /// Allow `script.execute` over an authenticated channel
    pub script_execute: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Off,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Off => "off",
        }
    }

    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Trace => log::LevelFilter::Trace,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Off => log::LevelFilter::Off,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: None,
            auth_token: None,
            url: default_url(),
            capture: CaptureConfig::default(),
            performance_interval: 5000,
            reconnect: true,
            reconnect_interval: 3000,
            max_reconnect_attempts: 10,
            buffer_size: 100,
            local: LocalConfig::default(),
            commands: CommandsConfig::default(),
            storage_dir: Self::insidr_dir().join("storage"),
            log_level: LogLevel::Info,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            console: true,
            network: true,
            errors: true,
            performance: true,
        }
    }
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            key: DEFAULT_KEY.to_string(),
            max_events: DEFAULT_MAX_EVENTS,
        }
    }
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self { script_execute: true }
    }
}

fn default_url() -> String {
    std::env::current_dir()
        .map(|dir| format!("file://{}", dir.display()))
        .unwrap_or_else(|_| "file://.".to_string())
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        if let Ok(env_path) = std::env::var("INSIDR_CONFIG") {
            let path = PathBuf::from(env_path);
            if path.exists() {
                match Self::load_from_file(&path) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from INSIDR_CONFIG: {}", e);
                    }
                }
            }
        }

        if let Ok(insidr_dir) = std::env::var("INSIDR_DIR") {
            let path = PathBuf::from(insidr_dir).join("insidr.yaml");
            if path.exists() {
                match Self::load_from_file(&path) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from INSIDR_DIR: {}", e);
                    }
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let path = config_dir.join("insidr").join("insidr.yaml");
            if path.exists() {
                match Self::load_from_file(&path) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", path.display(), e);
                    }
                }
            }
        }

        // Try ./insidr.yaml (for development)
        let local_config = PathBuf::from("insidr.yaml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load local config: {}", e);
                }
            }
        }

        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let mut config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        config.storage_dir = Self::expand_path(&config.storage_dir);

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Directory holding insidr's own files (storage, default config)
    pub fn insidr_dir() -> PathBuf {
        std::env::var("INSIDR_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| dirs::data_local_dir().unwrap_or_else(|| PathBuf::from(".")).join("insidr"))
    }

    /// Expand a path that may contain ~ or env vars
    pub fn expand_path(path: &Path) -> PathBuf {
        let path_str = path.to_string_lossy();
        let expanded = shellexpand::full(&path_str).unwrap_or_else(|_| path_str.clone());
        PathBuf::from(expanded.as_ref())
    }

    pub fn performance_interval(&self) -> Duration {
        Duration::from_millis(self.performance_interval)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval)
    }

    /// Snapshot reported in `agent.started`; the auth token is never echoed
    pub fn snapshot(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let Some(obj) = value.as_object_mut() {
            if self.auth_token.is_some() {
                obj.insert("authToken".to_string(), serde_json::Value::String("***".to_string()));
            }
            obj.remove("logLevel");
        }
        value
    }
}
