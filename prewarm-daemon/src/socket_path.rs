use std::io;
use std::path::Path;

/// Check if a socket path exists
pub fn socket_exists(path: &Path) -> bool {
    path.exists()
}

/// Remove a socket file, treating an already-missing file as success
pub fn remove_socket_file(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Best-effort unlink used during teardown; failures are only traced.
pub fn remove_quietly(path: &Path) {
    if let Err(e) = remove_socket_file(path) {
        tracing::trace!(
            "Failed to remove {} during cleanup: {} (this is usually not a problem)",
            path.display(),
            e
        );
    } else {
        tracing::trace!("Removed {}", path.display());
    }
}

/// Create the directory holding the socket and PID file
pub fn ensure_parent_dir(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
        _ => Ok(()),
    }
}
