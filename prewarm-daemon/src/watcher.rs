//! Polling watcher that detects a changed dependency manifest
//!
//! The watcher records the newest modification time across its files (and
//! every file below its directories) as a baseline, then re-samples on a
//! fixed interval. A newer sample marks the shared state stale. A watched file
//! that has disappeared samples as `f64::MAX`, so deletions are always caught.
//!
//! Polling keeps the watcher free of platform notification APIs; the watched
//! set is a handful of manifest files, so the cost is negligible.

use crate::env::mtime_secs;
use crate::state::{lock, SharedStateRef};
use ignore::WalkBuilder;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

struct Poller {
    shutdown: oneshot::Sender<()>,
    _handle: JoinHandle<()>,
}

pub struct PollingWatcher {
    root: PathBuf,
    files: Vec<PathBuf>,
    directories: Vec<PathBuf>,
    latency: Duration,
    state: SharedStateRef,
    stale_signal: Arc<Notify>,
    baseline: Option<f64>,
    poller: Option<Poller>,
}

impl PollingWatcher {
    pub fn new(root: impl Into<PathBuf>, latency: Duration, state: SharedStateRef) -> Self {
        Self {
            root: root.into(),
            files: Vec::new(),
            directories: Vec::new(),
            latency,
            state,
            stale_signal: Arc::new(Notify::new()),
            baseline: None,
            poller: None,
        }
    }

    /// Watch a single file. Relative paths resolve against the root.
    pub fn add_file(&mut self, path: impl AsRef<Path>) {
        let path = self.resolve(path.as_ref());
        if !self.files.contains(&path) {
            self.files.push(path);
        }
    }

    /// Watch every file below a directory.
    pub fn add_dir(&mut self, path: impl AsRef<Path>) {
        let path = self.resolve(path.as_ref());
        if !self.directories.contains(&path) {
            self.directories.push(path);
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Notified once when the watcher marks the state stale.
    pub fn stale_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.stale_signal)
    }

    /// Baseline recorded by the last `start`.
    pub fn mtime(&self) -> Option<f64> {
        self.baseline
    }

    /// Record the baseline and begin polling. Does nothing if already running.
    pub fn start(&mut self) {
        if self.poller.is_some() {
            return;
        }

        let files = Arc::new(self.files.clone());
        let directories = Arc::new(self.directories.clone());
        let baseline = compute_mtime(&files, &directories);
        self.baseline = Some(baseline);

        let (shutdown, mut shutdown_rx) = oneshot::channel();
        let latency = self.latency;
        let state = Arc::clone(&self.state);
        let stale_signal = Arc::clone(&self.stale_signal);

        let handle = tokio::spawn(async move {
            debug!(
                "Watcher polling {} files and {} directories every {:?}",
                files.len(),
                directories.len(),
                latency
            );

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = tokio::time::sleep(latency) => {}
                }

                // The walk blocks; the state stays locked from sample to mark
                let sample = {
                    let state = Arc::clone(&state);
                    let files = Arc::clone(&files);
                    let directories = Arc::clone(&directories);
                    tokio::task::spawn_blocking(move || {
                        let mut guard = lock(&state);
                        if guard.is_stale() {
                            return false;
                        }
                        let current = compute_mtime(&files, &directories);
                        trace!("Watcher sample {} (baseline {})", current, baseline);
                        if baseline < current {
                            guard.mark_stale();
                            return true;
                        }
                        false
                    })
                };

                match sample.await {
                    Ok(true) => {
                        info!("Watched files changed, marking daemon stale");
                        stale_signal.notify_one();
                    }
                    Ok(false) => {}
                    Err(e) => warn!("Watcher sample failed: {}", e),
                }
            }

            debug!("Watcher polling stopped");
        });

        self.poller = Some(Poller {
            shutdown,
            _handle: handle,
        });
    }

    /// Stop polling. Does nothing if not running.
    pub fn stop(&mut self) {
        if let Some(poller) = self.poller.take() {
            let _ = poller.shutdown.send(());
        }
    }

    pub fn is_running(&self) -> bool {
        self.poller.is_some()
    }

    pub fn is_stale(&self) -> bool {
        lock(&self.state).is_stale()
    }

    /// Take a sample now, outside the polling loop.
    pub fn sample(&self) -> f64 {
        compute_mtime(&self.files, &self.directories)
    }
}

impl Drop for PollingWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Newest modification time (seconds since the epoch) across the watched set.
///
/// `0.0` for an empty set, `f64::MAX` if a watched file is missing.
pub fn compute_mtime(files: &[PathBuf], directories: &[PathBuf]) -> f64 {
    let mut newest = 0.0_f64;

    for file in files {
        match std::fs::metadata(file) {
            Ok(meta) => {
                if let Some(mtime) = mtime_secs(&meta) {
                    newest = newest.max(mtime);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Watched file {:?} is missing", file);
                return f64::MAX;
            }
            Err(e) => warn!("Failed to stat watched file {:?}: {}", file, e),
        }
    }

    for directory in directories.iter().filter(|dir| dir.is_dir()) {
        let mut builder = WalkBuilder::new(directory);
        builder
            .follow_links(false)
            .parents(false)
            .hidden(false)
            .ignore(false)
            .git_ignore(false)
            .git_global(false)
            .git_exclude(false);

        for entry in builder.build() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    trace!("Skipping unreadable entry under {:?}: {}", directory, e);
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                continue;
            }
            match entry.metadata() {
                Ok(meta) => {
                    if let Some(mtime) = mtime_secs(&meta) {
                        newest = newest.max(mtime);
                    }
                }
                // Listed a moment ago, gone now
                Err(_) if !entry.path().exists() => return f64::MAX,
                Err(e) => warn!("Failed to stat {:?}: {}", entry.path(), e),
            }
        }
    }

    newest
}
