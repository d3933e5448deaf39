use crate::error::DaemonError;
use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process;
use tracing::{debug, info};

/// PID file held under an exclusive lock for the daemon's whole life
pub struct PidLock {
    path: PathBuf,
    file: Option<File>,
}

impl PidLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Claim the PID file without blocking.
    ///
    /// Fails with [`DaemonError::AlreadyRunning`] when another process holds
    /// the lock; the file's contents are left untouched in that case.
    pub fn try_lock(&mut self) -> Result<()> {
        if self.file.is_some() {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        // Open without truncating: the current holder's PID must survive a failed attempt
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .with_context(|| format!("Failed to open PID file {}", self.path.display()))?;

        if file.try_lock_exclusive().is_err() {
            let mut contents = String::new();
            let _ = file.read_to_string(&mut contents);
            return Err(DaemonError::AlreadyRunning {
                pid: contents.trim().parse().ok(),
            }
            .into());
        }

        let pid = process::id();
        file.set_len(0).context("Failed to truncate PID file")?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{pid}").context("Failed to write PID file")?;
        file.sync_all().context("Failed to sync PID file")?;

        self.file = Some(file);
        info!("Acquired PID lock at {:?} (PID: {})", self.path, pid);
        Ok(())
    }

    /// Release the lock. The file itself is removed by teardown.
    pub fn unlock(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = FileExt::unlock(&file);
            debug!("Released PID lock at {:?}", self.path);
        }
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        self.unlock();
    }
}

/// PID recorded in a PID file, if any.
pub fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Whether some process currently holds the lock on `path`.
pub fn is_locked_by_other(path: &Path) -> bool {
    match File::open(path) {
        Ok(file) => match file.try_lock_shared() {
            Ok(()) => {
                let _ = FileExt::unlock(&file);
                false
            }
            Err(_) => true,
        },
        Err(_) => false,
    }
}

/// Check if a process with the given PID is running
pub fn is_process_running(pid: u32) -> bool {
    // Signal 0 only checks that we could deliver a signal
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn test_pid_lock_exclusive() {
        let dir = tempdir().unwrap();
        let pid_path = dir.path().join("app.pid");

        let mut lock1 = PidLock::new(&pid_path);
        assert!(lock1.try_lock().is_ok(), "First lock should succeed");
        assert!(is_locked_by_other(&pid_path));

        let mut lock2 = PidLock::new(&pid_path);
        let err = lock2.try_lock().expect_err("Second lock should fail");
        match err.downcast_ref::<DaemonError>() {
            Some(DaemonError::AlreadyRunning { pid }) => assert_eq!(*pid, Some(process::id())),
            other => panic!("unexpected error: {other:?}"),
        }

        lock1.unlock();
        assert!(lock2.try_lock().is_ok(), "Lock should succeed after unlock");
    }

    #[test]
    fn test_failed_attempt_keeps_holder_pid() {
        let dir = tempdir().unwrap();
        let pid_path = dir.path().join("app.pid");

        let mut holder = PidLock::new(&pid_path);
        holder.try_lock().unwrap();
        let before = fs::read_to_string(&pid_path).unwrap();

        let mut contender = PidLock::new(&pid_path);
        assert!(contender.try_lock().is_err());

        assert_eq!(fs::read_to_string(&pid_path).unwrap(), before);
        assert_eq!(before, format!("{}\n", process::id()));
        assert_eq!(read_pid(&pid_path), Some(process::id()));
    }

    #[test]
    fn test_stale_pid_file_is_reclaimed() {
        let dir = tempdir().unwrap();
        let pid_path = dir.path().join("app.pid");

        // Left behind by a crashed daemon: contents but no lock holder
        fs::write(&pid_path, "99999999 and some trailing junk").unwrap();
        assert!(!is_locked_by_other(&pid_path));

        let mut lock = PidLock::new(&pid_path);
        assert!(lock.try_lock().is_ok());
        assert_eq!(
            fs::read_to_string(&pid_path).unwrap(),
            format!("{}\n", process::id())
        );
    }

    #[test]
    fn test_concurrent_lock_attempts() {
        let dir = tempdir().unwrap();
        let pid_path = Arc::new(dir.path().join("app.pid"));
        let barrier = Arc::new(Barrier::new(5));

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let pid_path = Arc::clone(&pid_path);
                let barrier = Arc::clone(&barrier);

                thread::spawn(move || {
                    barrier.wait();
                    let mut lock = PidLock::new(pid_path.as_path());
                    let acquired = lock.try_lock().is_ok();
                    // Hold until every thread has tried
                    barrier.wait();
                    acquired
                })
            })
            .collect();

        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|acquired| *acquired)
            .count();

        assert_eq!(successes, 1, "Exactly one thread should acquire the lock");
    }
}
