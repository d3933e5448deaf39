//! Worker-supervisors: one long-lived preloaded process per environment
//!
//! The daemon only sees the [`Worker`] and [`WorkerFactory`] traits. The
//! default implementation, [`ProcessWorker`], starts the configured worker
//! program on first use and hands it each client's descriptor over a private
//! socket pair. The worker program answers every descriptor with one line
//! holding the command's exit status.

use crate::env::OriginalEnv;
use crate::handle::send_handle;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Interest};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Opaque name of a runtime configuration a worker preloads.
pub type EnvKey = String;

/// Descriptor number the worker program finds its control socket on.
pub const WORKER_SOCKET_FD: i32 = 3;

#[async_trait]
pub trait Worker: Send + Sync {
    /// Run one command on the client's descriptor and return its exit status.
    async fn run(&self, client: OwnedFd) -> Result<i32>;

    /// Terminate the preloaded process. Safe on a worker that never started.
    async fn stop(&self);
}

pub trait WorkerFactory: Send + Sync {
    fn create(&self, key: &EnvKey) -> Arc<dyn Worker>;
}

/// How to launch the worker program.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub command: String,
    pub args: Vec<String>,
    pub root: PathBuf,
    pub stop_timeout: Duration,
    pub original_env: OriginalEnv,
}

pub struct ProcessWorkerFactory {
    spec: Arc<WorkerSpec>,
}

impl ProcessWorkerFactory {
    pub fn new(spec: WorkerSpec) -> Self {
        Self {
            spec: Arc::new(spec),
        }
    }
}

impl WorkerFactory for ProcessWorkerFactory {
    fn create(&self, key: &EnvKey) -> Arc<dyn Worker> {
        Arc::new(ProcessWorker::new(key.clone(), Arc::clone(&self.spec)))
    }
}

struct RunningChild {
    process: Child,
    control: BufReader<UnixStream>,
}

pub struct ProcessWorker {
    key: EnvKey,
    spec: Arc<WorkerSpec>,
    // Held for the whole of a run, which serialises commands per environment
    child: Mutex<Option<RunningChild>>,
}

impl ProcessWorker {
    pub fn new(key: EnvKey, spec: Arc<WorkerSpec>) -> Self {
        Self {
            key,
            spec,
            child: Mutex::new(None),
        }
    }

    fn spawn(&self) -> Result<RunningChild> {
        let (ours, theirs) = StdUnixStream::pair().context("Failed to create worker socket pair")?;
        let child_fd = theirs.as_raw_fd();

        let mut command = Command::new(&self.spec.command);
        command
            .args(&self.spec.args)
            .current_dir(&self.spec.root)
            .env_clear()
            .envs(self.spec.original_env.iter())
            .env("PREWARM_ENV", &self.key)
            .env("PREWARM_SOCKET_FD", WORKER_SOCKET_FD.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        unsafe {
            command.pre_exec(move || {
                if child_fd == WORKER_SOCKET_FD {
                    let flags = libc::fcntl(child_fd, libc::F_GETFD);
                    if flags < 0
                        || libc::fcntl(child_fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0
                    {
                        return Err(io::Error::last_os_error());
                    }
                } else if libc::dup2(child_fd, WORKER_SOCKET_FD) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let process = command
            .spawn()
            .with_context(|| format!("Failed to start worker {:?}", self.spec.command))?;
        drop(theirs);

        ours.set_nonblocking(true)?;
        let control = UnixStream::from_std(ours)?;

        info!(
            "Started worker for environment {:?} (PID: {:?})",
            self.key,
            process.id()
        );

        Ok(RunningChild {
            process,
            control: BufReader::new(control),
        })
    }

    async fn exchange(running: &mut RunningChild, client: &OwnedFd) -> Result<i32> {
        let control = running.control.get_ref();
        control
            .async_io(Interest::WRITABLE, || send_handle(control, client.as_fd()))
            .await
            .context("Failed to hand client descriptor to worker")?;

        let mut line = String::new();
        let read = running.control.read_line(&mut line).await?;
        if read == 0 {
            return Err(anyhow!("Worker closed its control socket"));
        }

        line.trim()
            .parse()
            .map_err(|_| anyhow!("Worker replied with invalid status {:?}", line.trim()))
    }
}

#[async_trait]
impl Worker for ProcessWorker {
    async fn run(&self, client: OwnedFd) -> Result<i32> {
        let mut guard = self.child.lock().await;

        let exited = guard
            .as_mut()
            .and_then(|running| running.process.try_wait().ok().flatten());
        if let Some(status) = exited {
            warn!("Worker for {:?} exited ({}), restarting", self.key, status);
            *guard = None;
        }

        if guard.is_none() {
            *guard = Some(self.spawn()?);
        }

        let Some(running) = guard.as_mut() else {
            return Err(anyhow!("Worker for {:?} is not running", self.key));
        };

        match Self::exchange(running, &client).await {
            Ok(status) => {
                debug!("Worker for {:?} finished with status {}", self.key, status);
                Ok(status)
            }
            Err(e) => {
                // A broken control channel means the process is unusable; start fresh next time
                if let Some(mut dead) = guard.take() {
                    let _ = dead.process.start_kill();
                }
                Err(e)
            }
        }
    }

    async fn stop(&self) {
        let Some(mut running) = self.child.lock().await.take() else {
            return;
        };

        drop(running.control);
        if let Some(pid) = running.process.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            debug!("Sent SIGTERM to worker {} ({:?})", pid, self.key);
        }

        match tokio::time::timeout(self.spec.stop_timeout, running.process.wait()).await {
            Ok(_) => info!("Worker for {:?} stopped", self.key),
            Err(_) => {
                warn!(
                    "Worker for {:?} ignored SIGTERM for {:?}, killing",
                    self.key, self.spec.stop_timeout
                );
                let _ = running.process.kill().await;
            }
        }
    }
}
