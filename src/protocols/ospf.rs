//! LSDB dumps from an OSPF API daemon.
//!
//! The daemon talks over two connections: the client opens a request
//! connection from `local_port` to the daemon, and the daemon opens a
//! notification connection back to `local_port + 1`. Frames carry no
//! correlation identifier; after a `sync-lsdb` request they simply stream
//! in until the daemon goes quiet, which marks the end of the batch.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};

use crate::codec::{
    ChangeHeader, Codec, LsaHeader, OspfCodec, OspfFrame, SYNC_LSDB_COMMAND,
};
use crate::config::{DEFAULT_TIMEOUT, OSPF_API_PORT, OSPF_IDLE_TIMEOUT, OSPF_LOCAL_PORT};
use crate::error::ProtocolError;
use crate::transport::{
    Credentials, DumpTransport, Link, Terminal, TranscriptLog, Transport,
};

const READ_CHUNK: usize = 4096;

/// Request and notification connections to an OSPF API daemon, seen as one
/// link: writes go out on the request leg, reads come from the
/// notification leg.
pub struct RendezvousLink {
    host: String,
    remote_port: u16,
    local_port: u16,
    connect_timeout: Duration,
    request: Option<TcpStream>,
    notify: Option<TcpStream>,
}

impl RendezvousLink {
    pub fn new(host: impl Into<String>, remote_port: u16, local_port: u16) -> Self {
        Self {
            host: host.into(),
            remote_port,
            local_port,
            connect_timeout: DEFAULT_TIMEOUT,
            request: None,
            notify: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn bind_error(&self, err: impl std::fmt::Display) -> ProtocolError {
        ProtocolError::Network(format!(
            "Could not bind to localport {} or {}: {err}",
            self.local_port,
            u32::from(self.local_port) + 1
        ))
    }

    async fn remote_addr(&self) -> Result<SocketAddr, ProtocolError> {
        let unresolved = || {
            ProtocolError::Network(format!(
                "Could not resolve host {}:{}",
                self.host, self.remote_port
            ))
        };
        tokio::net::lookup_host((self.host.as_str(), self.remote_port))
            .await
            .map_err(|_| unresolved())?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(unresolved)
    }
}

#[async_trait]
impl Link for RendezvousLink {
    fn target(&self) -> String {
        self.host.clone()
    }

    /// Binds the notification listener before the request leg connects, so
    /// the daemon's call back cannot arrive before anyone listens.
    async fn open(&mut self, _credentials: &Credentials) -> Result<(), ProtocolError> {
        let callback_port = self
            .local_port
            .checked_add(1)
            .ok_or_else(|| self.bind_error("no port above the local port"))?;
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, callback_port))
            .await
            .map_err(|err| self.bind_error(err))?;
        let socket = TcpSocket::new_v4().map_err(|err| self.bind_error(err))?;
        socket
            .bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.local_port)))
            .map_err(|err| self.bind_error(err))?;

        let remote = self.remote_addr().await?;
        debug!("Connecting to OSPF daemon at {remote}");
        let request = tokio::time::timeout(self.connect_timeout, socket.connect(remote))
            .await
            .map_err(|_| {
                ProtocolError::Network(format!(
                    "Time-out connecting to host {}:{}",
                    self.host, self.remote_port
                ))
            })?
            .map_err(|err| {
                ProtocolError::Network(format!(
                    "Could not connect to host {}:{}: {err}",
                    self.host, self.remote_port
                ))
            })?;

        debug!("Waiting for return connection on port {callback_port}");
        let (notify, peer) = tokio::time::timeout(self.connect_timeout, listener.accept())
            .await
            .map_err(|_| {
                ProtocolError::Network(format!(
                    "No return connection from {} on port {callback_port}",
                    self.host
                ))
            })??;
        info!("Connected to OSPF daemon {}, notifications from {peer}", self.host);
        self.request = Some(request);
        self.notify = Some(notify);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ProtocolError> {
        for mut stream in [self.request.take(), self.notify.take()].into_iter().flatten() {
            if let Err(err) = stream.shutdown().await {
                debug!("{} shutdown failed: {err}", self.host);
            }
        }
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        let request = self.request.as_mut().ok_or_else(|| {
            ProtocolError::Network(format!("not connected to OSPF daemon {}", self.host))
        })?;
        request.write_all(data).await?;
        request.flush().await?;
        Ok(())
    }

    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        let notify = self.notify.as_mut().ok_or_else(|| {
            ProtocolError::Network(format!("not connected to OSPF daemon {}", self.host))
        })?;
        let mut buf = [0u8; READ_CHUNK];
        let n = notify.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(buf[..n].to_vec()))
    }

    fn is_open(&self) -> bool {
        self.request.is_some() && self.notify.is_some()
    }
}

/// Reads frames until the source goes quiet or ends.
///
/// An idle time-out or end of stream between frames ends the batch. A frame
/// cut short by the end of the stream is a framing error, as is a header
/// with the wrong version.
pub async fn read_frames<T>(
    transport: &mut T,
    codec: &OspfCodec,
    idle_timeout: Duration,
) -> Result<Vec<OspfFrame>, ProtocolError>
where
    T: Transport + ?Sized,
{
    let framing = codec.framing();
    let mut frames = Vec::new();
    loop {
        let chunk = match transport.receive(&framing, idle_timeout).await {
            Ok(chunk) => chunk,
            Err(ProtocolError::TimeOut(_)) => {
                debug!("No frame for {idle_timeout:?}, batch complete");
                break;
            }
            Err(ProtocolError::Closed(reason)) => {
                debug!("End of frames: {reason}");
                break;
            }
            Err(err) => return Err(err),
        };
        let frame = codec.frame(&chunk)?;
        debug!(
            "Received body of length {} (type {})",
            frame.header.length, frame.header.msg_type
        );
        frames.push(frame);
    }
    info!("Received {} frames from {}", frames.len(), transport.target());
    Ok(frames)
}

/// Writes `frames` back to back as they came off the wire, in the format
/// [`DumpTransport`] reads.
pub async fn write_dump(frames: &[OspfFrame], path: impl AsRef<Path>) -> Result<(), ProtocolError> {
    let path = path.as_ref();
    let bytes: Vec<u8> = frames.iter().flat_map(OspfFrame::to_bytes).collect();
    tokio::fs::write(path, &bytes).await?;
    info!("Wrote {} frames to {}", frames.len(), path.display());
    Ok(())
}

/// Requests the link state database and collects the frames.
pub struct OspfFetcher<T: Transport> {
    transport: T,
    codec: OspfCodec,
    idle_timeout: Duration,
    log: TranscriptLog,
    capture: Option<PathBuf>,
}

impl OspfFetcher<Terminal<RendezvousLink>> {
    /// Daemon on the standard API port, answering to the standard local
    /// ports.
    pub fn live(host: impl Into<String>) -> Self {
        Self::with_ports(host, OSPF_API_PORT, OSPF_LOCAL_PORT)
    }

    pub fn with_ports(host: impl Into<String>, remote_port: u16, local_port: u16) -> Self {
        Self::new(Terminal::new(RendezvousLink::new(
            host,
            remote_port,
            local_port,
        )))
    }
}

impl OspfFetcher<DumpTransport> {
    /// Reads frames from a capture of an earlier dump.
    pub fn dump(path: impl Into<PathBuf>) -> Self {
        Self::new(DumpTransport::open(path))
    }
}

impl<T: Transport> OspfFetcher<T> {
    pub fn new(mut transport: T) -> Self {
        let log = TranscriptLog::default();
        transport.attach_log(log.clone());
        Self {
            transport,
            codec: OspfCodec::new(),
            idle_timeout: OSPF_IDLE_TIMEOUT,
            log,
            capture: None,
        }
    }

    /// Silence after which the batch counts as complete.
    pub fn set_idle_timeout(&mut self, timeout: Duration) {
        self.idle_timeout = timeout;
    }

    pub fn set_log_file(&mut self, path: impl AsRef<Path>) -> Result<(), ProtocolError> {
        self.log.open(path)
    }

    /// Every fetched batch is also written to `path` as a binary dump.
    pub fn set_capture_file(&mut self, path: impl Into<PathBuf>) {
        self.capture = Some(path.into());
    }

    /// Connects, sends a `sync-lsdb` request, collects frames until the
    /// daemon goes quiet, and disconnects. The batch is captured to disk if
    /// a capture file is set.
    pub async fn fetch_frames(&mut self) -> Result<Vec<OspfFrame>, ProtocolError> {
        self.transport.connect(&Credentials::default()).await?;
        let fetched = async {
            let request = self.codec.encode(SYNC_LSDB_COMMAND)?;
            self.transport.send(&request.wire).await?;
            read_frames(&mut self.transport, &self.codec, self.idle_timeout).await
        }
        .await;
        let closed = self.transport.disconnect().await;
        let frames = fetched?;
        closed?;
        if let Some(path) = &self.capture {
            write_dump(&frames, path).await?;
        }
        Ok(frames)
    }

    /// Change and LSA headers of every frame that carries an LSA. Shorter
    /// frames, such as replies and ready notifications, are skipped.
    pub async fn fetch_lsa_headers(&mut self) -> Result<Vec<(ChangeHeader, LsaHeader)>, ProtocolError> {
        let frames = self.fetch_frames().await?;
        let mut headers = Vec::new();
        for frame in frames {
            if frame.body.len() < ChangeHeader::SIZE + LsaHeader::SIZE {
                debug!(
                    "Skipping frame of type {} without LSA",
                    frame.header.msg_type
                );
                continue;
            }
            headers.push((frame.change_header()?, frame.lsa_header()?));
        }
        Ok(headers)
    }
}
