//! Client side of the dispatch protocol, plus helpers to inspect and stop a
//! running daemon through its PID file.

use crate::env::Env;
use crate::error::ProtocolError;
use crate::handle::send_handle;
use crate::ipc::IpcStream;
use crate::pid_lock::{is_locked_by_other, is_process_running, read_pid};
use crate::protocol::{self, CommandRequest, Reply};
use anyhow::{Context, Result};
use std::io::Write;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, BufReader};
use tracing::debug;

pub struct Client {
    stream: IpcStream,
}

impl Client {
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let stream = IpcStream::connect(socket_path)
            .await
            .with_context(|| format!("Failed to connect to {}", socket_path.display()))?;
        Ok(Self { stream })
    }

    /// Read and check the daemon's version line.
    ///
    /// A hangup here means the daemon is retiring and dropped the connection.
    pub async fn handshake(&mut self, version: &str) -> Result<(), ProtocolError> {
        let mut reader = BufReader::new(&mut self.stream);
        protocol::read_version(&mut reader, version).await?;
        debug!("Handshake complete");
        Ok(())
    }

    /// Hand `io` to the daemon, send the request and wait for the reply.
    pub async fn run(mut self, io: BorrowedFd<'_>, request: &CommandRequest) -> Result<Reply> {
        self.stream
            .send_handle(io)
            .await
            .context("Failed to send descriptor to daemon")?;

        let encoded = request.encode()?;
        self.stream.write_all(&encoded).await?;
        self.stream.flush().await?;

        let mut reader = BufReader::new(self.stream);
        Ok(protocol::read_reply(&mut reader).await?)
    }
}

/// Build the descriptor a client hands to the daemon.
///
/// It is one end of a fresh socket pair whose other end has already carried
/// this process's stdin, stdout and stderr followed by the encoded request,
/// so a worker can run the command in the client's place.
pub fn stdio_channel(request: &CommandRequest) -> Result<OwnedFd> {
    let (mut ours, theirs) = StdUnixStream::pair().context("Failed to create stdio channel")?;

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let stderr = std::io::stderr();
    for fd in [stdin.as_fd(), stdout.as_fd(), stderr.as_fd()] {
        send_handle(&ours, fd).context("Failed to queue stdio descriptor")?;
    }
    ours.write_all(&request.encode()?)?;

    Ok(OwnedFd::from(theirs))
}

/// PID of the daemon serving this project, if one holds the lock.
pub fn running_pid(env: &Env) -> Option<u32> {
    let pidfile = env.pidfile_path();
    if !is_locked_by_other(&pidfile) {
        return None;
    }
    read_pid(&pidfile)
}

/// SIGTERM the running daemon and wait for it to finish tearing down,
/// escalating to SIGKILL after `timeout`. Returns the PID that was stopped.
pub async fn stop_daemon(env: &Env, timeout: Duration) -> Result<Option<u32>> {
    let Some(pid) = running_pid(env) else {
        return Ok(None);
    };

    signal(pid, libc::SIGTERM).context("Failed to signal daemon")?;
    let deadline = Instant::now() + timeout;
    // Releasing the lock is the last thing teardown does before exiting
    while is_process_running(pid) && running_pid(env).is_some() {
        if Instant::now() >= deadline {
            debug!("Daemon {} ignored SIGTERM, killing it", pid);
            signal(pid, libc::SIGKILL).context("Failed to kill daemon")?;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Ok(Some(pid))
}

fn signal(pid: u32, sig: libc::c_int) -> std::io::Result<()> {
    // SAFETY: kill has no memory-safety preconditions
    if unsafe { libc::kill(pid as libc::pid_t, sig) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_no_daemon_running() {
        let dir = tempdir().unwrap();
        let env = Env::new(dir.path(), Config::default()).with_tmp_path(dir.path().join("tmp"));

        assert_eq!(running_pid(&env), None);
        assert_eq!(
            stop_daemon(&env, Duration::from_millis(10)).await.unwrap(),
            None
        );
        assert!(Client::connect(&env.socket_path()).await.is_err());
    }

    #[test]
    fn test_stdio_channel_carries_descriptors_and_request() {
        use crate::handle::recv_handle;
        use std::io::Read;

        let request = CommandRequest::new(vec!["console".into()], Some("staging".into()));
        let channel = stdio_channel(&request).unwrap();
        let mut worker_side = StdUnixStream::from(channel);

        for _ in 0..3 {
            recv_handle(&worker_side).unwrap();
        }
        let mut rest = Vec::new();
        worker_side.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, request.encode().unwrap());
    }
}
