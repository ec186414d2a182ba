//! Daemon configuration.
//!
//! Loaded from `config.toml` in the data directory (`~/.digitalme` by
//! default). Every field has a default, so a missing file or a partial file is
//! valid. Command-line flags are applied on top via [`ConfigOverrides`].

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::relay::DEFAULT_OVERFLOW_CAP;
use crate::session::IDLE_TIMEOUT_MS;

const DATA_DIR_NAME: &str = ".digitalme";
const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RemoteConfig {
    #[serde(default = "default_remote_host")]
    pub host: String,
    #[serde(default = "default_remote_port")]
    pub port: u16,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: default_remote_host(),
            port: default_remote_port(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl RemoteConfig {
    pub fn endpoint(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct EditorConfig {
    #[serde(default = "default_editor_host")]
    pub host: String,
    #[serde(default = "default_editor_port")]
    pub port: u16,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            host: default_editor_host(),
            port: default_editor_port(),
        }
    }
}

impl EditorConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RelayConfig {
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_overflow_cap")]
    pub overflow_cap: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: default_flush_interval_secs(),
            overflow_cap: default_overflow_cap(),
        }
    }
}

impl RelayConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SessionConfig {
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TimerConfig {
    #[serde(default = "default_timer_minutes")]
    pub default_minutes: i64,
    /// Extra named intervals, in minutes, startable with `timerStart {name}`.
    #[serde(default)]
    pub intervals: BTreeMap<String, i64>,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            default_minutes: default_timer_minutes(),
            intervals: BTreeMap::new(),
        }
    }
}

fn minutes_to_ms(minutes: i64) -> i64 {
    minutes.max(1) * 60 * 1000
}

impl TimerConfig {
    pub fn default_interval_ms(&self) -> i64 {
        minutes_to_ms(self.default_minutes)
    }

    pub fn intervals_ms(&self) -> BTreeMap<String, i64> {
        self.intervals
            .iter()
            .map(|(name, minutes)| (name.clone(), minutes_to_ms(*minutes)))
            .collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct DaemonConfig {
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub editor: EditorConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub timer: TimerConfig,
    #[serde(default)]
    pub buffer_dir: Option<PathBuf>,
}

/// Values supplied on the command line or through the environment.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub editor_port: Option<u16>,
    pub buffer_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

fn default_remote_host() -> String {
    "127.0.0.1".to_string()
}

fn default_remote_port() -> u16 {
    8764
}

fn default_connect_timeout_secs() -> u64 {
    60
}

fn default_editor_host() -> String {
    "127.0.0.1".to_string()
}

fn default_editor_port() -> u16 {
    8763
}

fn default_flush_interval_secs() -> u64 {
    30
}

fn default_overflow_cap() -> usize {
    DEFAULT_OVERFLOW_CAP
}

fn default_idle_timeout_ms() -> i64 {
    IDLE_TIMEOUT_MS
}

fn default_timer_minutes() -> i64 {
    25
}

pub fn default_data_dir() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(DATA_DIR_NAME))
}

pub fn load_config(path: &Path) -> Result<DaemonConfig, String> {
    if !path.exists() {
        return Ok(DaemonConfig::default());
    }

    let content = fs_err::read_to_string(path)
        .map_err(|err| format!("Failed to read config {}: {}", path.display(), err))?;
    toml::from_str::<DaemonConfig>(&content)
        .map_err(|err| format!("Failed to parse config {}: {}", path.display(), err))
}

fn base_dir(overrides: &ConfigOverrides) -> Result<PathBuf, String> {
    match &overrides.buffer_dir {
        Some(dir) => Ok(dir.clone()),
        None => default_data_dir(),
    }
}

/// Resolves the effective configuration and buffer directory.
///
/// The config file lives in the buffer directory unless `--config` names one.
/// A `buffer_dir` in the file applies only when no flag overrides it.
pub fn resolve(overrides: &ConfigOverrides) -> Result<(DaemonConfig, PathBuf), String> {
    let base_dir = base_dir(overrides)?;
    let config_path = overrides
        .config
        .clone()
        .unwrap_or_else(|| base_dir.join(CONFIG_FILE_NAME));

    let config = load_config(&config_path)?;
    Ok(apply_overrides(config, overrides, base_dir))
}

/// Like [`resolve`], but ignores the config file.
pub fn resolve_defaults(overrides: &ConfigOverrides) -> Result<(DaemonConfig, PathBuf), String> {
    let base_dir = base_dir(overrides)?;
    Ok(apply_overrides(DaemonConfig::default(), overrides, base_dir))
}

fn apply_overrides(
    mut config: DaemonConfig,
    overrides: &ConfigOverrides,
    base_dir: PathBuf,
) -> (DaemonConfig, PathBuf) {
    let buffer_dir = match (&overrides.buffer_dir, &config.buffer_dir) {
        (Some(dir), _) => dir.clone(),
        (None, Some(dir)) => dir.clone(),
        (None, None) => base_dir,
    };

    if let Some(host) = &overrides.host {
        config.remote.host = host.clone();
    }
    if let Some(port) = overrides.port {
        config.remote.port = port;
    }
    if let Some(port) = overrides.editor_port {
        config.editor.port = port;
    }
    config.buffer_dir = Some(buffer_dir.clone());

    (config, buffer_dir)
}
