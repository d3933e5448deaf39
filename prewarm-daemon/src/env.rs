//! Per-project paths and environment captured at boot
//!
//! Everything the daemon needs to locate its socket, PID file and log file is
//! derived deterministically from the project root, so a client started in
//! the same project finds the same daemon.

use crate::config::{Config, CONFIG_FILE_NAME};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Protocol version written as the first line of every connection.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone)]
pub struct Env {
    root: PathBuf,
    config: Config,
    tmp_path: Option<PathBuf>,
}

impl Env {
    pub fn new(root: impl Into<PathBuf>, config: Config) -> Self {
        Self {
            root: root.into(),
            config,
            tmp_path: None,
        }
    }

    /// Place the socket and PID file under `tmp_path` instead of the default.
    pub fn with_tmp_path(mut self, tmp_path: impl Into<PathBuf>) -> Self {
        self.tmp_path = Some(tmp_path.into());
        self
    }

    /// Find the project root from `cwd` and load its configuration.
    pub fn discover(cwd: &Path) -> Result<Self> {
        let root = find_project_root(cwd);
        let config = Config::load(&root)
            .with_context(|| format!("Failed to load configuration for {}", root.display()))?;
        Ok(Self::new(root, config))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn version(&self) -> &'static str {
        PROTOCOL_VERSION
    }

    pub fn app_name(&self) -> String {
        self.root
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "app".to_string())
    }

    pub fn tmp_path(&self) -> PathBuf {
        if let Some(path) = &self.tmp_path {
            return path.clone();
        }
        std::env::var_os("PREWARM_TMP_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("prewarm"))
    }

    /// Stable identifier for this project and daemon version.
    pub fn application_id(&self) -> String {
        let digest = md5::compute(format!("{}{}", PROTOCOL_VERSION, self.root.display()));
        format!("{digest:x}")
    }

    pub fn socket_path(&self) -> PathBuf {
        self.tmp_path().join(self.application_id())
    }

    pub fn pidfile_path(&self) -> PathBuf {
        self.tmp_path().join(format!("{}.pid", self.application_id()))
    }

    pub fn log_file(&self) -> PathBuf {
        std::env::var_os("PREWARM_LOG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/dev/null"))
    }

    /// Absolute paths of the manifest files.
    pub fn manifest_paths(&self) -> Vec<PathBuf> {
        self.config
            .manifest
            .iter()
            .map(|path| self.resolve(path))
            .collect()
    }

    pub fn watch_dirs(&self) -> Vec<PathBuf> {
        self.config
            .watch_dirs
            .iter()
            .map(|path| self.resolve(path))
            .collect()
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Latest modification time among the manifest files that exist.
    pub fn manifest_mtime(&self) -> Option<f64> {
        self.manifest_paths()
            .iter()
            .filter_map(|path| std::fs::metadata(path).ok())
            .filter_map(|meta| mtime_secs(&meta))
            .reduce(f64::max)
    }
}

pub(crate) fn mtime_secs(meta: &std::fs::Metadata) -> Option<f64> {
    meta.modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
}

/// Walk up from `start` to the nearest directory holding a config file.
pub fn find_project_root(start: &Path) -> PathBuf {
    let mut current = Some(start);
    while let Some(dir) = current {
        if dir.join(CONFIG_FILE_NAME).is_file() {
            return dir.to_path_buf();
        }
        current = dir.parent();
    }
    start.to_path_buf()
}

/// Snapshot of the process environment taken before anything mutates it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OriginalEnv {
    vars: BTreeMap<String, String>,
}

impl OriginalEnv {
    pub fn capture() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: vars
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.vars.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_paths_are_deterministic() {
        let env_a = Env::new("/srv/app", Config::default());
        let env_b = Env::new("/srv/app", Config::default());
        let other = Env::new("/srv/other", Config::default());

        assert_eq!(env_a.socket_path(), env_b.socket_path());
        assert_ne!(env_a.socket_path(), other.socket_path());
        assert_eq!(env_a.application_id().len(), 32);
        assert_eq!(
            env_a.pidfile_path().file_name().unwrap().to_string_lossy(),
            format!("{}.pid", env_a.application_id())
        );
        assert_eq!(env_a.socket_path().parent(), env_a.pidfile_path().parent());
        assert_eq!(env_a.app_name(), "app");
    }

    #[test]
    fn test_tmp_path_override() {
        let temp_dir = TempDir::new().unwrap();
        let env = Env::new("/srv/app", Config::default()).with_tmp_path(temp_dir.path());
        assert_eq!(env.tmp_path(), temp_dir.path());
        assert_eq!(
            env.socket_path(),
            temp_dir.path().join(env.application_id())
        );
    }

    #[test]
    fn test_find_project_root() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("lib").join("deep");
        std::fs::create_dir_all(&nested).unwrap();

        assert_eq!(find_project_root(&nested), nested);

        std::fs::write(temp_dir.path().join(CONFIG_FILE_NAME), "").unwrap();
        assert_eq!(find_project_root(&nested), temp_dir.path());
    }

    #[test]
    fn test_manifest_mtime_ignores_missing_files() {
        let temp_dir = TempDir::new().unwrap();
        let env = Env::new(temp_dir.path(), Config::default());
        assert_eq!(env.manifest_mtime(), None);

        std::fs::write(temp_dir.path().join("Cargo.toml"), "[package]").unwrap();
        let mtime = env.manifest_mtime().expect("manifest present");
        assert!(mtime > 0.0);
    }

    #[test]
    fn test_original_env_snapshot() {
        let snapshot = OriginalEnv::from_vars([("HOME", "/home/dev"), ("LANG", "C")]);
        assert_eq!(snapshot.get("HOME"), Some("/home/dev"));
        assert_eq!(snapshot.iter().count(), 2);
        assert!(snapshot.get("PATH").is_none());
    }
}
