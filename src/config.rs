use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const WORKER_PROGRAM_ENV: &str = "WORKBENCH_WORKER_PROGRAM";
pub const WORKING_DIR_ENV: &str = "WORKBENCH_WORKING_DIR";
pub const CLASS_PATH_ENV: &str = "WORKBENCH_CLASS_PATH";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("cannot determine the worker program: {0}")]
    WorkerProgram(std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
    pub scratch_dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 32,
            scratch_dir: None,
        }
    }
}

/// Engine settings, loaded once at startup and shared read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Executable started in worker mode. Defaults to the current executable.
    pub worker_program: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
    pub class_path: Vec<PathBuf>,
    pub startup_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    pub interrupt_grace_ms: u64,
    pub cache: CacheConfig,
    pub debug_events_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_program: None,
            working_dir: None,
            class_path: Vec::new(),
            startup_timeout_ms: 10_000,
            shutdown_grace_ms: 2_000,
            interrupt_grace_ms: 1_000,
            cache: CacheConfig::default(),
            debug_events_dir: None,
        }
    }
}

impl EngineConfig {
    /// Reads `path` (if given), then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var_os(key));
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        toml::from_str(content)
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<OsString>) {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.is_empty());
        if let Some(program) = non_empty(WORKER_PROGRAM_ENV) {
            self.worker_program = Some(PathBuf::from(program));
        }
        if let Some(dir) = non_empty(WORKING_DIR_ENV) {
            self.working_dir = Some(PathBuf::from(dir));
        }
        if let Some(raw) = non_empty(CLASS_PATH_ENV) {
            self.class_path = std::env::split_paths(&raw).collect();
        }
        if let Some(dir) = non_empty(crate::event_log::DEBUG_EVENTS_DIR_ENV) {
            self.debug_events_dir = Some(PathBuf::from(dir));
        }
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn interrupt_grace(&self) -> Duration {
        Duration::from_millis(self.interrupt_grace_ms)
    }

    pub fn resolve_worker_program(&self) -> Result<PathBuf, ConfigError> {
        match self.worker_program.as_ref() {
            Some(program) => Ok(program.clone()),
            None => std::env::current_exe().map_err(ConfigError::WorkerProgram),
        }
    }

    /// Configured working directory, falling back to the process's current directory.
    pub fn resolve_working_dir(&self) -> PathBuf {
        self.working_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}
