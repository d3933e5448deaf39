use crate::socket_path::remove_quietly;
use crate::state::{lock, SharedStateRef};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Once-only cleanup hook bound to the process that created it.
///
/// A forked child inherits the hook but never runs it: the PID captured at
/// construction must match the running process.
pub struct Teardown {
    origin_pid: u32,
    done: AtomicBool,
    state: SharedStateRef,
    paths: Vec<PathBuf>,
}

impl Teardown {
    pub fn new(state: SharedStateRef, socket_path: PathBuf, pidfile_path: PathBuf) -> Self {
        Self {
            origin_pid: process::id(),
            done: AtomicBool::new(false),
            state,
            paths: vec![socket_path, pidfile_path],
        }
    }

    pub fn is_origin(&self) -> bool {
        process::id() == self.origin_pid
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Stop every worker, then unlink the socket and PID file.
    ///
    /// Returns `false` without doing anything when called a second time or
    /// from a process other than the one that created the hook.
    pub async fn run(&self) -> bool {
        if !self.claim() {
            return false;
        }

        let workers = lock(&self.state).take_workers();
        info!("Stopping {} worker(s)", workers.len());
        for (key, worker) in workers {
            debug!("Stopping worker for {:?}", key);
            worker.stop().await;
        }

        self.remove_paths();
        true
    }

    /// The filesystem half of teardown, for contexts that cannot await.
    pub fn run_blocking(&self) -> bool {
        if !self.claim() {
            return false;
        }
        self.remove_paths();
        true
    }

    fn claim(&self) -> bool {
        if !self.is_origin() {
            debug!("Skipping teardown in forked process {}", process::id());
            return false;
        }
        !self.done.swap(true, Ordering::SeqCst)
    }

    fn remove_paths(&self) {
        for path in &self.paths {
            remove_quietly(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SharedState;
    use crate::worker::{EnvKey, Worker, WorkerFactory};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::os::fd::OwnedFd;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    struct CountingWorker {
        stops: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Worker for CountingWorker {
        async fn run(&self, _client: OwnedFd) -> Result<i32> {
            Ok(0)
        }
        async fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Factory {
        stops: Arc<AtomicUsize>,
    }

    impl WorkerFactory for Factory {
        fn create(&self, _key: &EnvKey) -> Arc<dyn Worker> {
            Arc::new(CountingWorker {
                stops: Arc::clone(&self.stops),
            })
        }
    }

    #[tokio::test]
    async fn test_teardown_runs_once() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("app");
        let pidfile_path = dir.path().join("app.pid");
        std::fs::write(&socket_path, "").unwrap();
        std::fs::write(&pidfile_path, "1\n").unwrap();

        let stops = Arc::new(AtomicUsize::new(0));
        let factory = Factory {
            stops: Arc::clone(&stops),
        };
        let state = Arc::new(Mutex::new(SharedState::default()));
        lock(&state).worker_for(&"test".to_string(), &factory);
        lock(&state).worker_for(&"development".to_string(), &factory);

        let teardown = Teardown::new(state, socket_path.clone(), pidfile_path.clone());
        assert!(teardown.run().await);
        assert!(!teardown.run().await);
        assert!(!teardown.run_blocking());

        assert!(teardown.is_done());
        assert_eq!(stops.load(Ordering::SeqCst), 2);
        assert!(!socket_path.exists());
        assert!(!pidfile_path.exists());
    }

    #[tokio::test]
    async fn test_teardown_tolerates_missing_paths() {
        let dir = tempdir().unwrap();
        let state = Arc::new(Mutex::new(SharedState::default()));
        let teardown = Teardown::new(state, dir.path().join("gone"), dir.path().join("gone.pid"));

        assert!(teardown.is_origin());
        assert!(teardown.run().await);
    }

    #[test]
    fn test_forked_child_skips_teardown() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("app");
        let pidfile_path = dir.path().join("app.pid");
        std::fs::write(&socket_path, "").unwrap();
        std::fs::write(&pidfile_path, "1\n").unwrap();

        let state = Arc::new(Mutex::new(SharedState::default()));
        let teardown = Teardown::new(state, socket_path.clone(), pidfile_path.clone());

        let pid = unsafe { libc::fork() };
        assert!(pid >= 0, "fork failed");
        if pid == 0 {
            // Exit code 0 when the child left everything alone
            let ran = teardown.run_blocking();
            unsafe { libc::_exit(i32::from(ran)) };
        }

        let mut status = 0;
        assert_eq!(unsafe { libc::waitpid(pid, &mut status, 0) }, pid);
        assert!(libc::WIFEXITED(status));
        assert_eq!(libc::WEXITSTATUS(status), 0, "child ran the parent's teardown");
        assert!(socket_path.exists());
        assert!(pidfile_path.exists());

        assert!(!teardown.is_done());
        assert!(teardown.run_blocking());
        assert!(!socket_path.exists());
        assert!(!pidfile_path.exists());
    }
}
