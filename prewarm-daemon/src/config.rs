//! Project configuration loaded from `prewarm.toml`
//!
//! Every field has a default, so an empty (or missing) file yields a usable
//! configuration. Lookup order is: project file, user config directory,
//! defaults; environment variables override whatever was loaded.

use crate::commands::EnvRule;
use crate::error::DaemonError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Name of the per-project configuration file; its directory is the project root.
pub const CONFIG_FILE_NAME: &str = "prewarm.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Dependency manifest files. A change to any of them retires the daemon.
    pub manifest: Vec<PathBuf>,

    /// Directories watched recursively in addition to the manifest.
    pub watch_dirs: Vec<PathBuf>,

    /// Watcher poll interval (milliseconds)
    pub latency_ms: u64,

    /// Environment used when neither the command nor the client picks one
    pub default_env: String,

    pub worker: WorkerConfig,

    /// Extra or overriding command definitions, keyed by command name
    pub commands: BTreeMap<String, CommandConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            manifest: vec![PathBuf::from("Cargo.toml"), PathBuf::from("Cargo.lock")],
            watch_dirs: Vec::new(),
            latency_ms: 200,
            default_env: "development".to_string(),
            worker: WorkerConfig::default(),
            commands: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    /// Program started once per environment to host preloaded state
    pub command: String,
    pub args: Vec<String>,
    /// Grace period between SIGTERM and SIGKILL when stopping a worker
    pub stop_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: "prewarm-worker".to_string(),
            args: Vec::new(),
            stop_timeout_ms: 2000,
        }
    }
}

/// How a configured command picks its environment.
///
/// At most one of the fields should be set; `env` wins over `env_flag`,
/// which wins over `env_from`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct CommandConfig {
    pub env: Option<String>,
    pub env_flag: Option<String>,
    pub env_from: Option<EnvSource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvSource {
    FirstArg,
    TestTask,
}

impl CommandConfig {
    pub fn to_rule(&self) -> EnvRule {
        if let Some(env) = &self.env {
            EnvRule::Fixed(env.clone())
        } else if let Some(flag) = &self.env_flag {
            EnvRule::Flag(flag.clone())
        } else {
            match self.env_from {
                Some(EnvSource::FirstArg) => EnvRule::FirstArg,
                Some(EnvSource::TestTask) => EnvRule::TestTask,
                None => EnvRule::None,
            }
        }
    }
}

impl Config {
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.worker.stop_timeout_ms)
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: Self =
            toml::from_str(&content).context("Failed to parse TOML configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration with priority: project file -> user file -> defaults,
    /// then apply environment overrides
    pub fn load(root: &Path) -> Result<Self> {
        let config_paths = [
            Some(root.join(CONFIG_FILE_NAME)),
            dirs::config_dir().map(|d| d.join("prewarm").join("config.toml")),
        ];

        let mut config = Self::default();
        for config_path in config_paths.into_iter().flatten() {
            if config_path.is_file() {
                info!("Loading configuration from {:?}", config_path);
                config = Self::from_file(&config_path)
                    .with_context(|| format!("Failed to load config from {config_path:?}"))?;
                break;
            }
        }

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(value) = std::env::var("PREWARM_LATENCY_MS") {
            self.latency_ms = value
                .trim()
                .parse()
                .context("Invalid PREWARM_LATENCY_MS")?;
            debug!("Latency overridden from environment: {}ms", self.latency_ms);
        }
        if let Ok(value) = std::env::var("PREWARM_DEFAULT_ENV") {
            if !value.is_empty() {
                self.default_env = value;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.latency_ms == 0 {
            return Err(DaemonError::Configuration {
                message: "latency_ms must be greater than zero".to_string(),
            }
            .into());
        }
        if self.worker.command.trim().is_empty() {
            return Err(DaemonError::Configuration {
                message: "worker.command must not be empty".to_string(),
            }
            .into());
        }
        if self.default_env.is_empty() {
            return Err(DaemonError::Configuration {
                message: "default_env must not be empty".to_string(),
            }
            .into());
        }
        Ok(())
    }
}
