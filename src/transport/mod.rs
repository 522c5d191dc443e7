//! Byte transports: how a session reaches a device.
//!
//! A [`Transport`] moves bytes and cuts the incoming stream into chunks; it
//! knows nothing about the language spoken on top of it. Live sessions use a
//! [`Terminal`] over some [`Link`] (TCP, a spawned process, an SSH shell).
//! Offline sessions use a [`ReplayTransport`] over a text transcript or a
//! [`DumpTransport`] over a binary capture.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder};
use log::warn;
use regex::bytes::Regex as BytesRegex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

pub mod dump;
pub mod link;
pub mod replay;
pub mod ssh;
pub mod terminal;

pub use dump::DumpTransport;
pub use link::{Link, ProcessLink, StreamLink};
pub use replay::{ReplayDialect, ReplayTransport};
pub use ssh::{SecurityLevel, SshLink, SshOptions};
pub use terminal::{EchoMode, LoginScript, LoginStep, Terminal};

/// Login credentials for a device.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: Option<&str>) -> Self {
        Self {
            username: username.into(),
            password: password.map(str::to_string),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// How to cut the incoming byte stream into messages.
#[derive(Debug, Clone)]
pub enum Framing {
    /// Everything up to and including the first match of the pattern.
    Delimited(BytesRegex),
    /// Exactly this many bytes.
    Exact(usize),
    /// A fixed-size header followed by a body whose length is the big-endian
    /// `u16` at `length_at` within the header.
    LengthPrefixed { header: usize, length_at: usize },
}

impl Framing {
    /// Size of the length-prefixed frame at the start of `buffer`, or `None`
    /// while the header is incomplete.
    pub fn prefixed_len(header: usize, length_at: usize, buffer: &[u8]) -> Option<usize> {
        if buffer.len() < header.max(length_at + 2) {
            return None;
        }
        Some(header + BigEndian::read_u16(&buffer[length_at..length_at + 2]) as usize)
    }
}

/// Byte-level connection to a device, daemon or recording.
#[async_trait]
pub trait Transport: Send {
    /// Human readable name of the peer, e.g. a hostname or file name.
    fn target(&self) -> String;

    /// Lets offline transports learn the framing and prompt of the codec
    /// before they load their source.
    fn prepare(&mut self, _framing: &Framing, _prompt: Option<&BytesRegex>) {}

    async fn connect(&mut self, credentials: &Credentials) -> Result<(), ProtocolError>;

    /// Transport-level login, e.g. answering `login:` and `Password:`.
    async fn login(
        &mut self,
        _credentials: &Credentials,
        _prompt: Option<&BytesRegex>,
        _timeout: Duration,
    ) -> Result<(), ProtocolError> {
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ProtocolError>;

    async fn send(&mut self, data: &[u8]) -> Result<(), ProtocolError>;

    /// Returns the next message cut according to `framing`.
    ///
    /// Fails with `TimeOut` if nothing complete arrived in time; bytes that
    /// were already read stay buffered for the next call, so the future may
    /// be dropped at any await point without losing data.
    async fn receive(&mut self, framing: &Framing, timeout: Duration)
    -> Result<Vec<u8>, ProtocolError>;

    fn is_connected(&self) -> bool;

    /// Mirrors all traffic to a transcript log.
    fn attach_log(&mut self, _log: TranscriptLog) {}
}

/// Direction of a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    fn marker(&self) -> &'static str {
        match self {
            Direction::Input => "\n==input==\n",
            Direction::Output => "\n==output==\n",
        }
    }
}

#[derive(Debug, Default)]
struct LogState {
    file: Option<File>,
    last: Option<Direction>,
}

/// Append-only transcript of everything sent and received.
///
/// A marker line is written whenever the direction changes. Clones share
/// the same file.
#[derive(Debug, Clone, Default)]
pub struct TranscriptLog {
    state: Arc<Mutex<LogState>>,
}

impl TranscriptLog {
    pub fn open(&self, path: impl AsRef<Path>) -> Result<(), ProtocolError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.file = Some(file);
        state.last = None;
        Ok(())
    }

    pub fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut file) = state.file.take()
            && let Err(err) = file.flush()
        {
            warn!("Failed to flush transcript log: {err}");
        }
        state.last = None;
    }

    pub fn is_open(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .file
            .is_some()
    }

    pub fn write(&self, direction: Direction, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let changed = state.last != Some(direction);
        let Some(file) = state.file.as_mut() else {
            return;
        };
        let result = if changed {
            file.write_all(direction.marker().as_bytes())
                .and_then(|_| file.write_all(data))
        } else {
            file.write_all(data)
        };
        if let Err(err) = result {
            warn!("Failed to write transcript log: {err}");
            return;
        }
        state.last = Some(direction);
    }
}
