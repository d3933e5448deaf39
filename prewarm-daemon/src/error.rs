use thiserror::Error;

/// Failures the daemon reports to its caller instead of just logging.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Another daemon instance is already running (PID: {})", pid.map(|p| p.to_string()).unwrap_or_else(|| "unknown".to_string()))]
    AlreadyRunning { pid: Option<u32> },

    #[error("Invalid configuration: {message}")]
    Configuration { message: String },
}

/// Wire-level failures on a single client connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Client closed the connection")]
    Eof,

    #[error("Invalid length line: {0:?}")]
    InvalidLength(String),

    #[error("Request of {size} bytes exceeds maximum allowed size of {max} bytes")]
    TooLarge { size: usize, max: usize },

    #[error("Malformed request payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Daemon speaks protocol {daemon}, client expected {client}")]
    VersionMismatch { daemon: String, client: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether this error only means the peer hung up.
    pub fn is_hangup(&self) -> bool {
        match self {
            ProtocolError::Eof => true,
            ProtocolError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
            ),
            _ => false,
        }
    }
}
