use anyhow::{anyhow, Result};
use std::io;
use tracing::debug;

/// Process-group and signal setup that ties the daemon to its terminal session
#[derive(Debug, Default)]
pub struct ProcessGroup {
    pgid: Option<i32>,
}

impl ProcessGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the current process into the process group of its session leader.
    ///
    /// When the user closes the terminal the whole group is signalled, so the
    /// daemon goes away with the session that started it.
    pub fn join_session_group(&mut self) -> Result<()> {
        unsafe {
            let sid = libc::getsid(0);
            if sid < 0 {
                return Err(anyhow!(
                    "Failed to look up session ID: {}",
                    io::Error::last_os_error()
                ));
            }
            let pgid = libc::getpgid(sid);
            if pgid < 0 {
                return Err(anyhow!(
                    "Failed to look up process group of session leader {}: {}",
                    sid,
                    io::Error::last_os_error()
                ));
            }
            if libc::getpgrp() != pgid && libc::setpgid(0, pgid) != 0 {
                return Err(anyhow!(
                    "Failed to join process group {}: {}",
                    pgid,
                    io::Error::last_os_error()
                ));
            }
            self.pgid = Some(pgid);
            debug!("Joined session process group {}", pgid);
        }
        Ok(())
    }

    pub fn pgid(&self) -> Option<i32> {
        self.pgid
    }
}

/// Ignore SIGINT and SIGQUIT so ^C or ^\ typed at a client's terminal does
/// not take down a daemon that serves other clients too.
pub fn ignore_interrupts() -> Result<()> {
    for signal in [libc::SIGINT, libc::SIGQUIT] {
        if unsafe { libc::signal(signal, libc::SIG_IGN) } == libc::SIG_ERR {
            return Err(anyhow!(
                "Failed to ignore signal {}: {}",
                signal,
                io::Error::last_os_error()
            ));
        }
    }
    debug!("Ignoring SIGINT and SIGQUIT");
    Ok(())
}
