use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Which guest scheduler drives the entry point
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum GuestKind {
    #[default]
    Local,
    Tokio,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BridgeConfig {
    pub max_bursts: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    #[serde(default = "default_tick_rate_ms")]
    pub tick_rate_ms: u64,

    /// Process status used when the host shuts down
    #[serde(default = "default_exit_code")]
    pub exit_code: i32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GuestConfig {
    #[serde(default)]
    pub scheduler: GuestKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DemoConfig {
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,

    #[serde(default)]
    pub autostart: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,

    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bridge: BridgeConfig,

    #[serde(default)]
    pub host: HostConfig,

    #[serde(default)]
    pub guest: GuestConfig,

    #[serde(default)]
    pub demo: DemoConfig,

    #[serde(default)]
    pub log: LogConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            tick_rate_ms: default_tick_rate_ms(),
            exit_code: default_exit_code(),
        }
    }
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            delay_ms: default_delay_ms(),
            autostart: false,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            file: None,
        }
    }
}

fn default_tick_rate_ms() -> u64 {
    200
}

fn default_exit_code() -> i32 {
    5
}

fn default_delay_ms() -> u64 {
    1000
}

fn default_log_filter() -> String {
    "info".to_string()
}

/// Load the config from the default location.
/// A missing file yields defaults; a file that fails to parse is an error.
pub fn load() -> Result<Config> {
    let Some(path) = config_path() else {
        return Ok(Config::default());
    };
    if !path.exists() {
        return Ok(Config::default());
    }
    load_from(&path)
}

/// Load a config the user named explicitly; errors are reported
pub fn load_from(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    parse(&content).with_context(|| format!("parse config {}", path.display()))
}

pub fn parse(content: &str) -> Result<Config> {
    Ok(toml::from_str::<Config>(content)?)
}

pub fn config_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os("HOSTGUEST_CONFIG").map(PathBuf::from) {
        return Some(path);
    }
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME").map(PathBuf::from) {
        return Some(xdg.join("hostguest").join("config.toml"));
    }
    if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
        return Some(home.join(".config").join("hostguest").join("config.toml"));
    }

    directories::ProjectDirs::from("io", "hostguest", "hostguest")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

pub fn data_dir() -> Option<PathBuf> {
    if let Some(xdg) = std::env::var_os("XDG_DATA_HOME").map(PathBuf::from) {
        return Some(xdg.join("hostguest"));
    }
    if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
        return Some(home.join(".local").join("share").join("hostguest"));
    }
    directories::ProjectDirs::from("io", "hostguest", "hostguest")
        .map(|dirs| dirs.data_dir().to_path_buf())
}

/// Where terminal mode writes its log
pub fn log_path(config: &Config) -> Option<PathBuf> {
    config
        .log
        .file
        .clone()
        .or_else(|| data_dir().map(|dir| dir.join("hostguest.log")))
}
