//! Raw byte links underneath a [`super::Terminal`].

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use super::Credentials;
use crate::config::DEFAULT_TIMEOUT;
use crate::error::ProtocolError;

const READ_CHUNK: usize = 4096;

/// A bidirectional byte pipe.
#[async_trait]
pub trait Link: Send {
    fn target(&self) -> String;

    async fn open(&mut self, credentials: &Credentials) -> Result<(), ProtocolError>;

    async fn close(&mut self) -> Result<(), ProtocolError>;

    async fn write(&mut self, data: &[u8]) -> Result<(), ProtocolError>;

    /// Reads whatever is available, `None` at end of stream.
    ///
    /// Must be cancel safe: dropping the future loses no bytes.
    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, ProtocolError>;

    fn is_open(&self) -> bool;
}

/// Any async byte stream, e.g. a TCP socket or an in-memory duplex pipe.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

enum Endpoint {
    Tcp { host: String, port: u16 },
    Attached { label: String },
}

/// Link over a TCP connection or an already connected stream.
pub struct StreamLink {
    endpoint: Endpoint,
    stream: Option<Box<dyn AsyncStream>>,
    connect_timeout: Duration,
}

impl StreamLink {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            endpoint: Endpoint::Tcp {
                host: host.into(),
                port,
            },
            stream: None,
            connect_timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Wraps a stream that is already connected.
    pub fn attached(label: impl Into<String>, stream: impl AsyncStream + 'static) -> Self {
        Self {
            endpoint: Endpoint::Attached {
                label: label.into(),
            },
            stream: Some(Box::new(stream)),
            connect_timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn stream(&mut self) -> Result<&mut Box<dyn AsyncStream>, ProtocolError> {
        let target = self.target();
        self.stream
            .as_mut()
            .ok_or_else(|| ProtocolError::Network(format!("not connected to {target}")))
    }
}

#[async_trait]
impl Link for StreamLink {
    fn target(&self) -> String {
        match &self.endpoint {
            Endpoint::Tcp { host, .. } => host.clone(),
            Endpoint::Attached { label } => label.clone(),
        }
    }

    async fn open(&mut self, _credentials: &Credentials) -> Result<(), ProtocolError> {
        match &self.endpoint {
            Endpoint::Tcp { host, port } => {
                let stream = tokio::time::timeout(
                    self.connect_timeout,
                    TcpStream::connect((host.as_str(), *port)),
                )
                .await
                .map_err(|_| {
                    ProtocolError::Network(format!(
                        "Time-out connecting to host ('telnet {host} {port}')"
                    ))
                })?
                .map_err(|err| {
                    ProtocolError::Network(format!(
                        "Problem connecting to host ('telnet {host} {port}'): {err}"
                    ))
                })?;
                stream.set_nodelay(true)?;
                debug!("{host}:{port} TCP connection successful");
                self.stream = Some(Box::new(stream));
                Ok(())
            }
            Endpoint::Attached { label } => {
                if self.stream.is_none() {
                    return Err(ProtocolError::Network(format!(
                        "stream to {label} was closed and cannot be reopened"
                    )));
                }
                Ok(())
            }
        }
    }

    async fn close(&mut self) -> Result<(), ProtocolError> {
        if let Some(mut stream) = self.stream.take()
            && let Err(err) = stream.shutdown().await
        {
            debug!("{} shutdown failed: {err}", self.target());
        }
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        let stream = self.stream()?;
        stream.write_all(data).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        let stream = self.stream()?;
        let mut buf = [0u8; READ_CHUNK];
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(buf[..n].to_vec()))
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

/// Link to the standard input and output of a spawned program, e.g. the
/// system `telnet` client.
pub struct ProcessLink {
    program: String,
    args: Vec<String>,
    label: String,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
}

impl ProcessLink {
    pub fn new(program: impl Into<String>, args: Vec<String>, label: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args,
            label: label.into(),
            child: None,
            stdin: None,
            stdout: None,
        }
    }

    pub fn telnet(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        Self::new("telnet", vec![host.clone(), port.to_string()], host)
    }

    fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl Link for ProcessLink {
    fn target(&self) -> String {
        self.label.clone()
    }

    async fn open(&mut self, _credentials: &Credentials) -> Result<(), ProtocolError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                ProtocolError::Network(format!(
                    "Problem spawning a new process ('{}'): {err}",
                    self.command_line()
                ))
            })?;
        self.stdin = child.stdin.take();
        self.stdout = child.stdout.take();
        self.child = Some(child);
        debug!("Spawned '{}'", self.command_line());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ProtocolError> {
        self.stdin.take();
        self.stdout.take();
        if let Some(mut child) = self.child.take()
            && let Err(err) = child.kill().await
        {
            warn!("Failed to stop '{}': {err}", self.command_line());
        }
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            ProtocolError::Network(format!("process for {} is not running", self.label))
        })?;
        stdin.write_all(data).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        let stdout = self.stdout.as_mut().ok_or_else(|| {
            ProtocolError::Network(format!("process for {} is not running", self.label))
        })?;
        let mut buf = [0u8; READ_CHUNK];
        let n = stdout.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(buf[..n].to_vec()))
    }

    fn is_open(&self) -> bool {
        self.child.is_some()
    }
}
