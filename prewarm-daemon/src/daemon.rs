use crate::commands::CommandRegistry;
use crate::env::{Env, OriginalEnv};
use crate::error::ProtocolError;
use crate::ipc::{IpcListener, IpcStream};
use crate::logging::redirect_output;
use crate::pid_lock::PidLock;
use crate::process_group::{ignore_interrupts, ProcessGroup};
use crate::protocol;
use crate::state::{lock, SharedState, SharedStateRef};
use crate::teardown::Teardown;
use crate::watcher::PollingWatcher;
use crate::worker::{EnvKey, ProcessWorkerFactory, WorkerFactory, WorkerSpec};
use anyhow::{Context, Result};
use std::sync::{Arc, Mutex};
use tokio::io::BufReader;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Boot-time switches for the parts of the daemon that touch process-wide state.
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    /// Join the session leader's process group and ignore SIGINT/SIGQUIT
    pub session_group: bool,
    /// Shut down gracefully on SIGTERM/SIGHUP
    pub handle_signals: bool,
    /// Point stdout/stderr at the log file after every connection
    pub redirect_output: bool,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            session_group: true,
            handle_signals: true,
            redirect_output: true,
        }
    }
}

impl DaemonOptions {
    /// Leave process-wide state alone, for running inside another program.
    pub fn embedded() -> Self {
        Self {
            session_group: false,
            handle_signals: false,
            redirect_output: false,
        }
    }
}

/// Requests a graceful stop of a running daemon.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<Notify>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.notify_one();
    }
}

pub struct Daemon {
    env: Env,
    options: DaemonOptions,
    registry: CommandRegistry,
    factory: Arc<dyn WorkerFactory>,
    state: SharedStateRef,
    watcher: PollingWatcher,
    pid_lock: PidLock,
    process_group: ProcessGroup,
    // Created only once the PID lock is ours, so a losing boot never cleans up the winner's files
    teardown: Option<Teardown>,
    manifest_mtime: Option<f64>,
    shutdown: Arc<Notify>,
}

impl Daemon {
    /// A daemon running the configured worker program.
    pub fn new(env: Env, original_env: OriginalEnv, options: DaemonOptions) -> Self {
        let config = env.config();
        let factory = ProcessWorkerFactory::new(WorkerSpec {
            command: config.worker.command.clone(),
            args: config.worker.args.clone(),
            root: env.root().to_path_buf(),
            stop_timeout: config.stop_timeout(),
            original_env,
        });
        let registry = CommandRegistry::with_config(&config.commands);
        Self::with_factory(env, registry, Arc::new(factory), options)
    }

    pub fn with_factory(
        env: Env,
        registry: CommandRegistry,
        factory: Arc<dyn WorkerFactory>,
        options: DaemonOptions,
    ) -> Self {
        let state: SharedStateRef = Arc::new(Mutex::new(SharedState::default()));

        let mut watcher = PollingWatcher::new(env.root(), env.config().latency(), Arc::clone(&state));
        for file in env.manifest_paths() {
            watcher.add_file(file);
        }
        for dir in env.watch_dirs() {
            watcher.add_dir(dir);
        }

        Self {
            pid_lock: PidLock::new(env.pidfile_path()),
            env,
            options,
            registry,
            factory,
            state,
            watcher,
            process_group: ProcessGroup::new(),
            teardown: None,
            manifest_mtime: None,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(Arc::clone(&self.shutdown))
    }

    /// Claim the PID file, set up the session, start watching and serve until
    /// stale or asked to stop. Teardown has run by the time this returns.
    ///
    /// Fails with [`crate::DaemonError::AlreadyRunning`] before touching
    /// anything else when another daemon owns this project.
    pub async fn boot(mut self) -> Result<()> {
        self.pid_lock.try_lock()?;
        self.teardown = Some(Teardown::new(
            Arc::clone(&self.state),
            self.env.socket_path(),
            self.env.pidfile_path(),
        ));

        let result = self.start_and_serve().await;
        if let Err(e) = &result {
            error!("Daemon error: {:#}", e);
        }

        self.watcher.stop();
        if let Some(teardown) = &self.teardown {
            teardown.run().await;
        }
        self.pid_lock.unlock();
        info!("Daemon shutdown complete");
        result
    }

    async fn start_and_serve(&mut self) -> Result<()> {
        if self.options.session_group {
            self.process_group
                .join_session_group()
                .context("Failed to join the session's process group")?;
            ignore_interrupts()?;
        }
        if self.options.handle_signals {
            self.install_signal_handlers()?;
        }

        self.watcher.start();
        self.manifest_mtime = self.env.manifest_mtime();

        let socket_path = self.env.socket_path();
        let listener = IpcListener::bind(&socket_path)
            .await
            .with_context(|| format!("Failed to bind {}", socket_path.display()))?;
        info!(
            "prewarm daemon v{} ({}, built {}) started on {} for {}",
            self.env.version(),
            env!("PREWARM_REVISION"),
            env!("PREWARM_BUILT_AT"),
            socket_path.display(),
            self.env.app_name()
        );

        self.accept_loop(&listener).await;
        Ok(())
    }

    fn install_signal_handlers(&self) -> Result<()> {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;
        let shutdown = self.shutdown_handle();

        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
                _ = sighup.recv() => info!("Received SIGHUP, shutting down gracefully"),
            }
            shutdown.shutdown();
        });
        Ok(())
    }

    async fn accept_loop(&self, listener: &IpcListener) {
        let stale_signal = self.watcher.stale_signal();

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok(stream) => {
                            if self.should_retire() {
                                info!("Dependencies changed since boot, retiring daemon");
                                drop(stream);
                                break;
                            }
                            self.serve(stream).await;
                            if self.options.redirect_output {
                                let log_file = self.env.log_file();
                                if let Err(e) = redirect_output(&log_file) {
                                    warn!("Failed to redirect output to {}: {}", log_file.display(), e);
                                }
                            }
                        }
                        Err(e) => error!("Error accepting connection: {}", e),
                    }
                }
                _ = stale_signal.notified() => {
                    info!("Watcher reported stale dependencies, retiring daemon");
                    break;
                }
                _ = self.shutdown.notified() => {
                    info!("Daemon shutting down...");
                    break;
                }
            }
        }
    }

    /// Whether the daemon must exit instead of serving another client.
    fn should_retire(&self) -> bool {
        let state = lock(&self.state);
        if state.is_stale() {
            return true;
        }
        self.env.manifest_mtime() != self.manifest_mtime
    }

    async fn serve(&self, stream: IpcStream) {
        debug!("Accepted client");
        match self.handle_connection(stream).await {
            Ok(()) => {}
            Err(e) if e.is_hangup() => debug!("Client disconnected: {}", e),
            Err(e) => error!("Error handling connection: {}", e),
        }
    }

    async fn handle_connection(&self, mut stream: IpcStream) -> Result<(), ProtocolError> {
        protocol::write_version(&mut stream, self.env.version()).await?;

        let client_io = stream.recv_handle().await?;
        let request = {
            let mut reader = BufReader::new(&mut stream);
            protocol::read_request(&mut reader).await?
        };

        let Some(name) = request.command_name() else {
            debug!("Empty command, closing connection");
            return Ok(());
        };

        let Some(command) = self.registry.lookup(name) else {
            info!("Command not found: {}", name);
            return Ok(());
        };
        protocol::write_accepted(&mut stream).await?;

        let key: EnvKey = command
            .env(request.command_args())
            .or_else(|| request.default_rails_env.clone())
            .unwrap_or_else(|| self.env.config().default_env.clone());
        info!("Running command {} in {:?}", name, key);

        let worker = lock(&self.state).worker_for(&key, self.factory.as_ref());
        let status = match worker.run(client_io).await {
            Ok(status) => status,
            Err(e) => {
                error!("Worker for {:?} failed to run {}: {:#}", key, name, e);
                return Ok(());
            }
        };

        protocol::write_status(&mut stream, status).await?;
        Ok(())
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        if let Some(teardown) = &self.teardown {
            if !teardown.is_done() {
                teardown.run_blocking();
            }
        }
    }
}
