//! Tracing setup and log-file redirection

use std::fs::OpenOptions;
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` wins over `default_level`.
///
/// Safe to call more than once; later calls are ignored.
pub fn init(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

/// Point this process's stdout and stderr at `log_file`, appending.
pub fn redirect_output(log_file: &Path) -> io::Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)?;
    let fd = file.as_raw_fd();

    for target in [libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        // SAFETY: both descriptors are valid for the duration of the call
        if unsafe { libc::dup2(fd, target) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice() {
        init("debug");
        init("info");
        tracing::debug!("logging initialised");
    }

    #[test]
    fn test_redirect_to_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let log_file = dir.path().join("no-such-dir").join("prewarm.log");
        assert!(redirect_output(&log_file).is_err());
    }
}
