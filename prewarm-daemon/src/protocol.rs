//! Wire protocol between clients and the daemon
//!
//! Per connection, in order:
//!
//! 1. daemon → client: one line with the protocol version
//! 2. client → daemon: one descriptor (see [`crate::handle`])
//! 3. client → daemon: one line with the decimal byte count `N`
//! 4. client → daemon: `N` bytes of JSON [`CommandRequest`]
//! 5. daemon → client: an empty line once the command is recognised
//! 6. daemon → client: one line with the exit status
//!
//! For an unknown command the daemon closes the connection after step 4. If
//! the worker fails to run a recognised command it closes after step 5.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum accepted request payload (1 MiB).
pub const MAX_REQUEST_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub args: Vec<String>,
    #[serde(default)]
    pub default_rails_env: Option<String>,
}

impl CommandRequest {
    pub fn new(args: Vec<String>, default_rails_env: Option<String>) -> Self {
        Self {
            args,
            default_rails_env,
        }
    }

    pub fn command_name(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }

    pub fn command_args(&self) -> &[String] {
        self.args.get(1..).unwrap_or(&[])
    }

    /// Length line followed by the JSON body.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let body = serde_json::to_vec(self)?;
        if body.len() > MAX_REQUEST_SIZE {
            return Err(ProtocolError::TooLarge {
                size: body.len(),
                max: MAX_REQUEST_SIZE,
            });
        }
        let mut encoded = format!("{}\n", body.len()).into_bytes();
        encoded.extend_from_slice(&body);
        Ok(encoded)
    }
}

/// Read one line, without its terminator. `Eof` if the stream ended first.
async fn read_line<R>(reader: &mut R) -> Result<String, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let read = reader.read_line(&mut line).await?;
    if read == 0 {
        return Err(ProtocolError::Eof);
    }
    if line.ends_with('\n') {
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
    }
    Ok(line)
}

pub async fn read_request<R>(reader: &mut R) -> Result<CommandRequest, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let length_line = read_line(reader).await?;
    let size: usize = length_line
        .trim()
        .parse()
        .map_err(|_| ProtocolError::InvalidLength(length_line.clone()))?;

    if size > MAX_REQUEST_SIZE {
        return Err(ProtocolError::TooLarge {
            size,
            max: MAX_REQUEST_SIZE,
        });
    }

    let mut body = vec![0u8; size];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

pub async fn write_version<W>(writer: &mut W, version: &str) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(format!("{version}\n").as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the daemon's version line and compare it with `expected`.
pub async fn read_version<R>(reader: &mut R, expected: &str) -> Result<String, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let version = read_line(reader).await?;
    if version != expected {
        return Err(ProtocolError::VersionMismatch {
            daemon: version,
            client: expected.to_string(),
        });
    }
    Ok(version)
}

/// Tell the client its command was recognised and is about to run.
pub async fn write_accepted<W>(writer: &mut W) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

pub async fn write_status<W>(writer: &mut W, status: i32) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(format!("{status}\n").as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// How the daemon answered a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Closed before accepting: the command is not known
    Unknown,
    /// Accepted, then closed without a status: the worker could not run it
    Failed,
    /// The command ran and exited with this status
    Exited(i32),
}

/// Read the reply to a request.
pub async fn read_reply<R>(reader: &mut R) -> Result<Reply, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    match read_line(reader).await {
        Ok(line) if line.is_empty() => {}
        Ok(line) => return Err(ProtocolError::InvalidLength(line)),
        Err(ProtocolError::Eof) => return Ok(Reply::Unknown),
        Err(e) => return Err(e),
    }

    let status_line = match read_line(reader).await {
        Ok(line) => line,
        Err(ProtocolError::Eof) => return Ok(Reply::Failed),
        Err(e) => return Err(e),
    };
    status_line
        .trim()
        .parse()
        .map(Reply::Exited)
        .map_err(|_| ProtocolError::InvalidLength(status_line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    fn request(args: &[&str]) -> CommandRequest {
        CommandRequest::new(args.iter().map(|s| s.to_string()).collect(), None)
    }

    #[tokio::test]
    async fn test_request_framing() {
        let original = CommandRequest::new(
            vec!["console".to_string(), "production".to_string()],
            Some("development".to_string()),
        );
        let encoded = original.encode().unwrap();
        let newline = encoded.iter().position(|b| *b == b'\n').unwrap();
        let declared: usize = std::str::from_utf8(&encoded[..newline])
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(declared, encoded.len() - newline - 1);

        let mut reader = BufReader::new(&encoded[..]);
        let decoded = read_request(&mut reader).await.unwrap();
        assert_eq!(decoded, original);
        assert_eq!(decoded.command_name(), Some("console"));
        assert_eq!(decoded.command_args(), ["production".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_default_env_field() {
        let body = br#"{"args":["help"]}"#;
        let mut wire = format!("{}\n", body.len()).into_bytes();
        wire.extend_from_slice(body);

        let decoded = read_request(&mut BufReader::new(&wire[..])).await.unwrap();
        assert_eq!(decoded, request(&["help"]));
    }

    #[tokio::test]
    async fn test_invalid_length_line() {
        let mut reader = BufReader::new(&b"twelve\n{}"[..]);
        let err = read_request(&mut reader).await.unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidLength(_)));
    }

    #[tokio::test]
    async fn test_oversized_request_rejected() {
        let wire = format!("{}\n", MAX_REQUEST_SIZE + 1);
        let err = read_request(&mut BufReader::new(wire.as_bytes()))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::TooLarge { .. }));
    }

    #[tokio::test]
    async fn test_truncated_body_is_hangup() {
        let mut reader = BufReader::new(&b"40\n{\"args\":"[..]);
        let err = read_request(&mut reader).await.unwrap_err();
        assert!(err.is_hangup());

        let err = read_request(&mut BufReader::new(&b""[..])).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Eof));
    }

    #[tokio::test]
    async fn test_status_reply() {
        let mut buffer = Vec::new();
        write_accepted(&mut buffer).await.unwrap();
        write_status(&mut buffer, 3).await.unwrap();
        assert_eq!(buffer, b"\n3\n");

        let reply = read_reply(&mut BufReader::new(&buffer[..])).await.unwrap();
        assert_eq!(reply, Reply::Exited(3));
    }

    #[tokio::test]
    async fn test_reply_without_status() {
        let closed = read_reply(&mut BufReader::new(&b""[..])).await.unwrap();
        assert_eq!(closed, Reply::Unknown);

        let accepted = read_reply(&mut BufReader::new(&b"\n"[..])).await.unwrap();
        assert_eq!(accepted, Reply::Failed);

        let err = read_reply(&mut BufReader::new(&b"\nboom\n"[..]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidLength(_)));
    }

    #[tokio::test]
    async fn test_version_check() {
        let mut buffer = Vec::new();
        write_version(&mut buffer, "1.2.3").await.unwrap();

        let ok = read_version(&mut BufReader::new(&buffer[..]), "1.2.3").await;
        assert_eq!(ok.unwrap(), "1.2.3");

        let err = read_version(&mut BufReader::new(&buffer[..]), "9.9.9")
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::VersionMismatch { .. }));
    }
}
