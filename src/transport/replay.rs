//! Offline transport answering commands from a recorded transcript.
//!
//! A transcript is the raw text of an earlier terminal session: prompt,
//! command, response, delimiter, command, response, and so on. It is cut on
//! the session delimiter; the first line of every piece is the command, the
//! rest is the response. Lookups use the same normalisation as recording
//! (for TL1: ctag and password blanked).

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use regex::bytes::Regex as BytesRegex;

use super::{Credentials, Direction, Framing, TranscriptLog, Transport};
use crate::codec::{CLI_TERMINATOR, TL1_TERMINATOR, Tl1Codec};
use crate::error::ProtocolError;

/// Maps a recorded command line to its lookup key.
pub type Normalizer = Arc<dyn Fn(&str) -> Result<String, ProtocolError> + Send + Sync>;

/// Language-specific rules for reading a transcript.
#[derive(Clone)]
pub struct ReplayDialect {
    terminator: String,
    normalize: Normalizer,
}

impl ReplayDialect {
    pub fn new(terminator: impl Into<String>, normalize: Normalizer) -> Self {
        Self {
            terminator: terminator.into(),
            normalize,
        }
    }

    pub fn tl1() -> Self {
        let codec = Tl1Codec::replay();
        Self::new(
            TL1_TERMINATOR,
            Arc::new(move |command: &str| codec.replay_key(command)),
        )
    }

    pub fn cli() -> Self {
        Self::new(
            CLI_TERMINATOR,
            Arc::new(|command: &str| Ok(command.trim().to_string())),
        )
    }
}

enum ReplaySource {
    File(PathBuf),
    Text { label: String, text: String },
}

/// Serves recorded responses, strictly from the transcript.
pub struct ReplayTransport {
    source: ReplaySource,
    dialect: ReplayDialect,
    delimiter: Option<BytesRegex>,
    prompt: Option<BytesRegex>,
    table: HashMap<String, VecDeque<String>>,
    outstanding: VecDeque<String>,
    connected: bool,
    log: TranscriptLog,
}

impl ReplayTransport {
    pub fn open(path: impl Into<PathBuf>, dialect: ReplayDialect) -> Self {
        Self::with_source(ReplaySource::File(path.into()), dialect)
    }

    /// Replays an in-memory transcript.
    pub fn from_text(label: impl Into<String>, text: impl Into<String>, dialect: ReplayDialect) -> Self {
        Self::with_source(
            ReplaySource::Text {
                label: label.into(),
                text: text.into(),
            },
            dialect,
        )
    }

    fn with_source(source: ReplaySource, dialect: ReplayDialect) -> Self {
        Self {
            source,
            dialect,
            delimiter: None,
            prompt: None,
            table: HashMap::new(),
            outstanding: VecDeque::new(),
            connected: false,
            log: TranscriptLog::default(),
        }
    }

    /// Number of distinct recorded commands.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn contains(&self, command: &str) -> bool {
        self.table.contains_key(command.trim())
    }

    fn delimiter(&self) -> Result<BytesRegex, ProtocolError> {
        match &self.delimiter {
            Some(delimiter) => Ok(delimiter.clone()),
            None => Ok(BytesRegex::new(&regex::escape(&self.dialect.terminator))?),
        }
    }

    fn load(&mut self, raw: &str) -> Result<(), ProtocolError> {
        if self.dialect.terminator.is_empty() {
            return Err(ProtocolError::MalformedIo(format!(
                "empty response terminator for transcript {}",
                self.target()
            )));
        }
        // Emulate a TTY: every line break becomes \r\n.
        let contents = raw.replace("\r\n", "\n").replace('\n', "\r\n");
        let delimiter = self.delimiter()?;
        let mut pieces: Vec<&[u8]> = delimiter.split(contents.as_bytes()).collect();

        // Text before the first prompt is connection noise.
        if let Some(prompt) = &self.prompt
            && let Some(first) = pieces.first().copied()
        {
            match prompt.find(first) {
                Some(found) => pieces[0] = &first[found.end()..],
                None => {
                    pieces.remove(0);
                }
            }
        }
        // The last piece only counts if its response was terminated.
        if let Some(last) = pieces.pop() {
            let terminator = self.dialect.terminator.as_bytes();
            if let Some(pos) = last
                .windows(terminator.len())
                .position(|window| window == terminator)
            {
                pieces.push(&last[..pos]);
            }
        }

        self.table.clear();
        for piece in pieces {
            let text = String::from_utf8_lossy(piece);
            let text = text.trim_start_matches(['\r', '\n']);
            let (command, response) = text.split_once("\r\n").unwrap_or((text, ""));
            let command = command.trim();
            if command.is_empty() {
                continue;
            }
            let key = match (self.dialect.normalize)(command) {
                Ok(key) => key,
                Err(err) => {
                    warn!("Skipping unrecognised command {command:?} in transcript: {err}");
                    continue;
                }
            };
            debug!("caching command '{key}': {} bytes", response.len());
            self.table
                .entry(key)
                .or_default()
                .push_back(response.to_string());
        }
        debug!("cached {} commands", self.table.len());
        Ok(())
    }

    fn next_response(&mut self, key: &str) -> Option<String> {
        let queue = self.table.get_mut(key)?;
        // The last recording of a command answers every later repetition.
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait]
impl Transport for ReplayTransport {
    fn target(&self) -> String {
        match &self.source {
            ReplaySource::File(path) => path.display().to_string(),
            ReplaySource::Text { label, .. } => label.clone(),
        }
    }

    fn prepare(&mut self, framing: &Framing, prompt: Option<&BytesRegex>) {
        if let Framing::Delimited(delimiter) = framing {
            self.delimiter = Some(delimiter.clone());
        }
        self.prompt = prompt.cloned();
    }

    async fn connect(&mut self, _credentials: &Credentials) -> Result<(), ProtocolError> {
        let raw = match &self.source {
            ReplaySource::File(path) => tokio::fs::read(path).await.map_err(|err| {
                ProtocolError::Network(format!(
                    "Problem opening file {}: {err}",
                    path.display()
                ))
            })?,
            ReplaySource::Text { text, .. } => text.clone().into_bytes(),
        };
        self.load(&String::from_utf8_lossy(&raw))?;
        self.outstanding.clear();
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ProtocolError> {
        self.table.clear();
        self.outstanding.clear();
        self.connected = false;
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        self.log.write(Direction::Input, data);
        let command = (self.dialect.normalize)(String::from_utf8_lossy(data).trim())?;
        debug!("Sending command {command:?}");
        let Some(response) = self.next_response(&command) else {
            return Err(ProtocolError::Network(format!(
                "Command '{command}' not found in log file {}.",
                self.target()
            )));
        };
        self.outstanding.push_back(response);
        Ok(())
    }

    /// Hands out responses in the order their commands were sent. With
    /// nothing outstanding it waits for `timeout` and reports a time-out.
    async fn receive(
        &mut self,
        _framing: &Framing,
        timeout: Duration,
    ) -> Result<Vec<u8>, ProtocolError> {
        match self.outstanding.pop_front() {
            Some(response) => {
                self.log.write(Direction::Output, response.as_bytes());
                debug!("Received {} bytes of data", response.len());
                Ok(response.into_bytes())
            }
            None => {
                tokio::time::sleep(timeout).await;
                Err(ProtocolError::TimeOut(format!(
                    "no command sent to {} is awaiting a response",
                    self.target()
                )))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn attach_log(&mut self, log: TranscriptLog) {
        self.log = log;
    }
}
