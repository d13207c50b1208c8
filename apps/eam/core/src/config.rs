//! Application configuration.
//!
//! Loaded from `config/eam.toml` beside the executable and layered with
//! `EAM__SECTION__KEY` environment overrides. Relative paths resolve against
//! the executable directory.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::ConfigError;

pub const DEFAULT_CONFIG_PATH: &str = "config/eam.toml";
pub const DEFAULT_WINDOW_NAME: &str = "雷索纳斯";
pub const DEFAULT_WINDOW_CLASS: &str = "UnityWndClass";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub log: LogSettings,
    #[serde(default = "default_adb_path")]
    pub adb_path: PathBuf,
    #[serde(default = "default_resource_dir")]
    pub resource_dir: PathBuf,
    #[serde(default = "default_agent_dir")]
    pub agent_dir: PathBuf,
    #[serde(default = "default_daemon_dir")]
    pub daemon_dir: PathBuf,
    #[serde(default)]
    pub taskers: Vec<TaskerProfile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub dev: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            level: default_log_level(),
            dev: false,
        }
    }
}

/// One configured tasker: controller selection plus its ordered task list.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskerProfile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub controller: ControllerConfig,
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControllerConfig {
    Adb(AdbDevice),
    Win32(Win32Window),
    #[serde(other)]
    Unsupported,
}

impl ControllerConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            ControllerConfig::Adb(_) => "adb",
            ControllerConfig::Win32(_) => "win32",
            ControllerConfig::Unsupported => "unsupported",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdbDevice {
    #[serde(default)]
    pub serial: String,
    #[serde(default)]
    pub screencap: String,
    #[serde(default)]
    pub input: String,
    #[serde(default = "empty_object")]
    pub config: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Win32Window {
    #[serde(default = "default_window_name")]
    pub window_name: String,
    #[serde(default = "default_window_class")]
    pub class_name: String,
    #[serde(default)]
    pub screencap: String,
    #[serde(default)]
    pub input: String,
}

impl Default for Win32Window {
    fn default() -> Self {
        Self {
            window_name: default_window_name(),
            class_name: default_window_class(),
            screencap: String::new(),
            input: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    pub entry: String,
    #[serde(default = "empty_object")]
    pub param: Value,
}

impl TaskConfig {
    pub fn new(entry: impl Into<String>) -> Self {
        Self {
            entry: entry.into(),
            param: empty_object(),
        }
    }
}

impl AppConfig {
    /// Loads `path` (or the default file beside the executable), applies env
    /// overrides, resolves relative paths and validates tasker ids.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let base = executable_dir()?;
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => base.join(DEFAULT_CONFIG_PATH),
        };
        let raw = Config::builder()
            .add_source(File::from(path.as_path()).required(false))
            .add_source(env_source())
            .build()
            .map_err(|source| ConfigError::Load {
                path: path.clone(),
                source,
            })?;
        let mut config: AppConfig = raw.try_deserialize()?;
        config.resolve_paths(&base);
        config.validate()?;
        Ok(config)
    }

    /// Parses TOML text without touching the environment or resolving paths.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn resolve_paths(&mut self, base: &Path) {
        for dir in [
            &mut self.resource_dir,
            &mut self.agent_dir,
            &mut self.daemon_dir,
            &mut self.log.dir,
        ] {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        }
        // A bare program name is left for PATH lookup.
        if self.adb_path.is_relative() && self.adb_path.components().count() > 1 {
            self.adb_path = base.join(&self.adb_path);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for (index, tasker) in self.taskers.iter().enumerate() {
            if tasker.id.trim().is_empty() {
                return Err(ConfigError::EmptyId(index));
            }
            if !seen.insert(tasker.id.as_str()) {
                return Err(ConfigError::DuplicateId(tasker.id.clone()));
            }
        }
        Ok(())
    }

    pub fn profile(&self, id: &str) -> Option<&TaskerProfile> {
        self.taskers.iter().find(|tasker| tasker.id == id)
    }

    pub fn profile_by_name(&self, name: &str) -> Option<&TaskerProfile> {
        self.taskers.iter().find(|tasker| tasker.name == name)
    }

    pub fn default_profile(&self) -> Option<&TaskerProfile> {
        self.taskers.first()
    }

    /// Picks the tasker for a one-shot run: by id, then by name, then the first entry.
    pub fn select_profile(
        &self,
        id: Option<&str>,
        name: Option<&str>,
    ) -> Result<&TaskerProfile, ConfigError> {
        match (id, name) {
            (Some(id), _) => self
                .profile(id)
                .ok_or_else(|| ConfigError::UnknownTasker(id.to_string())),
            (None, Some(name)) => self
                .profile_by_name(name)
                .ok_or_else(|| ConfigError::UnknownTasker(name.to_string())),
            (None, None) => self.default_profile().ok_or(ConfigError::NoTaskers),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn env_source() -> Environment {
    Environment::with_prefix("EAM")
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}

pub fn executable_dir() -> Result<PathBuf, ConfigError> {
    let exe = std::env::current_exe().map_err(ConfigError::ExecutableDir)?;
    let dir = exe
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    Ok(dir)
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("log")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_adb_path() -> PathBuf {
    PathBuf::from("adb")
}

fn default_resource_dir() -> PathBuf {
    PathBuf::from("resource/base")
}

fn default_agent_dir() -> PathBuf {
    PathBuf::from("MaaAgentBinary")
}

fn default_daemon_dir() -> PathBuf {
    PathBuf::from("daemon")
}

fn default_window_name() -> String {
    DEFAULT_WINDOW_NAME.to_string()
}

fn default_window_class() -> String {
    DEFAULT_WINDOW_CLASS.to_string()
}
