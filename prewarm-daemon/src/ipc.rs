use crate::handle::{recv_handle, send_handle};
use crate::socket_path::ensure_parent_dir;
use anyhow::{anyhow, Result};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, Interest, ReadBuf};
use tokio::net::{UnixListener as TokioUnixListener, UnixStream as TokioUnixStream};

pub struct IpcListener {
    listener: TokioUnixListener,
    path: PathBuf,
}

impl IpcListener {
    pub async fn bind(path: &Path) -> Result<Self> {
        // Check if socket file exists and if a daemon is listening
        if path.exists() {
            match TokioUnixStream::connect(path).await {
                Ok(_) => {
                    return Err(anyhow!(
                        "Socket {} is already in use by another daemon",
                        path.display()
                    ));
                }
                Err(_) => {
                    tracing::info!("Removing stale socket file: {}", path.display());
                    std::fs::remove_file(path)?;
                }
            }
        }

        ensure_parent_dir(path)?;

        let listener = match TokioUnixListener::bind(path) {
            Ok(l) => l,
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                tracing::warn!("Socket bind failed due to address in use, retrying after delay");
                tokio::time::sleep(Duration::from_millis(100)).await;
                TokioUnixListener::bind(path)?
            }
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                return Err(anyhow!(
                    "Permission denied binding UNIX socket at {}. Set PREWARM_TMP_PATH to a writable location.",
                    path.display()
                ));
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub async fn accept(&self) -> Result<IpcStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(IpcStream { stream })
    }

    pub fn local_addr(&self) -> &Path {
        &self.path
    }
}

impl Drop for IpcListener {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            // The file may already be gone; teardown removes it too
            tracing::trace!(
                "Failed to remove socket file during cleanup {}: {} (this is usually not a problem)",
                self.path.display(),
                e
            );
        } else {
            tracing::trace!("Successfully cleaned up socket file: {}", self.path.display());
        }
    }
}

pub struct IpcStream {
    stream: TokioUnixStream,
}

impl IpcStream {
    pub async fn connect(path: &Path) -> Result<Self> {
        let stream = TokioUnixStream::connect(path).await?;
        Ok(Self { stream })
    }

    /// Wait for and receive one descriptor from the peer.
    pub async fn recv_handle(&self) -> io::Result<OwnedFd> {
        self.stream
            .async_io(Interest::READABLE, || recv_handle(&self.stream))
            .await
    }

    /// Send a descriptor to the peer.
    pub async fn send_handle(&self, fd: BorrowedFd<'_>) -> io::Result<()> {
        self.stream
            .async_io(Interest::WRITABLE, || send_handle(&self.stream, fd))
            .await
    }
}

impl AsRawFd for IpcStream {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl AsFd for IpcStream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

impl AsyncRead for IpcStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for IpcStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
