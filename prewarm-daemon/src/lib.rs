// Prewarm daemon library
// Supervisor that keeps application workers warm and dispatches commands to them

#[cfg(not(unix))]
compile_error!("prewarm-daemon relies on Unix sockets, process groups and descriptor passing");

// Core modules
pub mod commands;
pub mod config;
pub mod env;
pub mod error;
pub mod protocol;

// Process and socket plumbing
pub mod handle;
pub mod ipc;
pub mod pid_lock;
pub mod process_group;
pub mod socket_path;

// Daemon runtime
pub mod client;
pub mod daemon;
pub mod logging;
pub mod state;
pub mod teardown;
pub mod watcher;
pub mod worker;

// Re-export commonly used types
pub use client::Client;
pub use commands::{CommandRegistry, CommandSpec, EnvRule};
pub use config::Config;
pub use daemon::{Daemon, DaemonOptions, ShutdownHandle};
pub use env::{Env, OriginalEnv, PROTOCOL_VERSION};
pub use error::{DaemonError, ProtocolError};
pub use ipc::{IpcListener, IpcStream};
pub use protocol::{CommandRequest, Reply};
pub use worker::{EnvKey, ProcessWorker, ProcessWorkerFactory, Worker, WorkerFactory, WorkerSpec};
