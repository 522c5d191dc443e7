//! Structured session recording as JSON lines, and offline replay of such
//! recordings.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::codec::{Category, Response};
use crate::error::ProtocolError;

/// Session recording granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
pub enum SessionRecordLevel {
    /// Disable recording.
    Off,
    /// Record key events only.
    KeyEventsOnly,
    /// Record key events and raw chunks.
    #[default]
    Full,
}

/// A single recorded session event.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SessionRecordEntry {
    pub ts_ms: u128,
    pub event: SessionEvent,
}

/// Options for normalizing JSONL recordings into stable fixtures.
#[derive(Debug, Clone, Copy)]
pub struct NormalizeOptions {
    /// Keep raw chunk events.
    pub keep_raw_chunks: bool,
    /// Keep autonomous message events.
    pub keep_autonomous: bool,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            keep_raw_chunks: false,
            keep_autonomous: true,
        }
    }
}

/// Supported recorded event types.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEvent {
    ConnectionEstablished {
        target: String,
    },
    ConnectionClosed {
        reason: String,
    },
    CommandOutput {
        command: String,
        #[serde(default)]
        identifier: Option<String>,
        success: bool,
        #[serde(default)]
        status: String,
        lines: Vec<String>,
    },
    Autonomous {
        category: Category,
        #[serde(default)]
        identifier: Option<String>,
        lines: Vec<String>,
    },
    CallbackExpired {
        identifier: Option<String>,
    },
    RawChunk {
        data: String,
    },
}

/// In-memory session recorder. Clones share the same entries.
#[derive(Debug, Clone)]
pub struct SessionRecorder {
    level: SessionRecordLevel,
    entries: Arc<Mutex<Vec<SessionRecordEntry>>>,
}

impl SessionRecorder {
    /// Create a recorder with the given level.
    pub fn new(level: SessionRecordLevel) -> Self {
        Self {
            level,
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn level(&self) -> SessionRecordLevel {
        self.level
    }

    /// Record a key-level event.
    pub fn record_event(&self, event: SessionEvent) {
        if self.level == SessionRecordLevel::Off {
            return;
        }
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SessionRecordEntry {
                ts_ms: now_ms(),
                event,
            });
    }

    /// Record raw received bytes when enabled.
    pub fn record_raw_chunk(&self, data: &[u8]) {
        if self.level != SessionRecordLevel::Full {
            return;
        }
        self.record_event(SessionEvent::RawChunk {
            data: String::from_utf8_lossy(data).into_owned(),
        });
    }

    pub(crate) fn record_output(&self, command: &str, response: &Response) {
        self.record_event(SessionEvent::CommandOutput {
            command: command.to_string(),
            identifier: response.identifier.clone(),
            success: response.is_success(),
            status: response.status.to_string(),
            lines: response.lines().to_vec(),
        });
    }

    pub(crate) fn record_autonomous(&self, category: Category, response: &Response) {
        self.record_event(SessionEvent::Autonomous {
            category,
            identifier: response.identifier.clone(),
            lines: response.lines().to_vec(),
        });
    }

    /// Snapshot all records.
    pub fn entries(&self) -> Vec<SessionRecordEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// One JSON object per line, in recording order.
    pub fn to_jsonl(&self) -> Result<String, ProtocolError> {
        self.entries()
            .iter()
            .map(|entry| {
                serde_json::to_string(entry)
                    .map_err(|err| ProtocolError::Parsing(format!("cannot encode record: {err}")))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(|lines| lines.join("\n"))
    }

    /// Loads a recording. Blank lines are ignored; a bad line is reported
    /// with its line number.
    pub fn from_jsonl(jsonl: &str) -> Result<Self, ProtocolError> {
        let entries = jsonl
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(index, line)| {
                serde_json::from_str::<SessionRecordEntry>(line).map_err(|err| {
                    ProtocolError::Parsing(format!("record on line {}: {err}", index + 1))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            level: SessionRecordLevel::Full,
            entries: Arc::new(Mutex::new(entries)),
        })
    }

    /// Normalize JSONL recording content into a stable fixture representation.
    ///
    /// Events are sorted by timestamp (ties keep file order) and noisy events
    /// can be filtered out.
    pub fn normalize_jsonl(jsonl: &str, options: NormalizeOptions) -> Result<String, ProtocolError> {
        let mut indexed = Self::from_jsonl(jsonl)?
            .entries()
            .into_iter()
            .enumerate()
            .collect::<Vec<(usize, SessionRecordEntry)>>();

        indexed
            .sort_by(|(idx_a, a), (idx_b, b)| a.ts_ms.cmp(&b.ts_ms).then_with(|| idx_a.cmp(idx_b)));

        let filtered = indexed
            .into_iter()
            .filter_map(|(_, entry)| match &entry.event {
                SessionEvent::RawChunk { .. } if !options.keep_raw_chunks => None,
                SessionEvent::Autonomous { .. } if !options.keep_autonomous => None,
                _ => Some(entry),
            })
            .collect::<Vec<_>>();

        SessionRecorder {
            level: SessionRecordLevel::Full,
            entries: Arc::new(Mutex::new(filtered)),
        }
        .to_jsonl()
    }
}

impl Default for SessionRecorder {
    fn default() -> Self {
        Self::new(SessionRecordLevel::Full)
    }
}

/// Output of a recorded command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedOutput {
    pub identifier: Option<String>,
    pub success: bool,
    pub status: String,
    pub lines: Vec<String>,
}

/// Offline replayer backed by session recording data.
#[derive(Debug, Clone)]
pub struct SessionReplayer {
    entries: Vec<SessionRecordEntry>,
    cursor: usize,
}

impl SessionReplayer {
    pub fn from_recorder(recorder: &SessionRecorder) -> Self {
        Self {
            entries: recorder.entries(),
            cursor: 0,
        }
    }

    pub fn from_jsonl(jsonl: &str) -> Result<Self, ProtocolError> {
        let recorder = SessionRecorder::from_jsonl(jsonl)?;
        Ok(Self::from_recorder(&recorder))
    }

    /// Target of the first recorded connection.
    pub fn target(&self) -> Option<&str> {
        self.entries.iter().find_map(|entry| match &entry.event {
            SessionEvent::ConnectionEstablished { target } => Some(target.as_str()),
            _ => None,
        })
    }

    /// Autonomous messages of the given category, in recorded order.
    pub fn autonomous(&self, category: Category) -> Vec<&[String]> {
        self.entries
            .iter()
            .filter_map(|entry| match &entry.event {
                SessionEvent::Autonomous {
                    category: recorded,
                    lines,
                    ..
                } if *recorded == category => Some(lines.as_slice()),
                _ => None,
            })
            .collect()
    }

    /// Replay the next recorded output for the given command.
    pub fn replay_next(&mut self, command: &str) -> Result<RecordedOutput, ProtocolError> {
        while self.cursor < self.entries.len() {
            let entry = &self.entries[self.cursor];
            self.cursor += 1;

            if let SessionEvent::CommandOutput {
                command: recorded,
                identifier,
                success,
                status,
                lines,
            } = &entry.event
                && recorded.eq_ignore_ascii_case(command)
            {
                return Ok(RecordedOutput {
                    identifier: identifier.clone(),
                    success: *success,
                    status: status.clone(),
                    lines: lines.clone(),
                });
            }
        }
        Err(ProtocolError::ReplayMismatch(format!(
            "no replayable output found for command '{command}'"
        )))
    }

    /// Replay a list of commands in order.
    pub fn replay_script<S: AsRef<str>>(
        &mut self,
        script: &[S],
    ) -> Result<Vec<RecordedOutput>, ProtocolError> {
        script
            .iter()
            .map(|command| self.replay_next(command.as_ref()))
            .collect()
    }
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}
