//! Wire codecs: turning logical commands into bytes and raw chunks back into
//! structured responses.
//!
//! A codec knows the language of a device (TL1, CLI, OSPF API frames) but
//! nothing about how bytes travel. Every method takes `&self`; codecs keep
//! their mutable bits (ctag counter, prompt) behind locks so that one codec
//! can be shared between callers and a receiver task.

use std::fmt;

use regex::bytes::Regex as BytesRegex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::transport::{Credentials, Framing};

pub mod cli;
pub mod ospf;
pub mod tl1;

pub use cli::{CLI_TERMINATOR, CliCodec, DEFAULT_CLI_PROMPT, trim_lines};
pub use ospf::{
    ChangeHeader, LsaHeader, LsaType, OSPF_API_VERSION, OspfCodec, OspfFrame, OspfHeader,
    SYNC_LSDB_COMMAND, SYNC_LSDB_REQUEST,
};
pub use tl1::{TL1_TERMINATOR, Tl1Codec, parse_section_block};

/// A command encoded for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    /// Correlation identifier, absent when the format cannot carry one.
    pub identifier: Option<String>,
    pub wire: Vec<u8>,
}

/// Body of a decoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Lines(Vec<String>),
    Bytes(Vec<u8>),
}

/// TL1 status descriptor: response type, status words and comment text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Tl1Status {
    /// `M`, `A`, `*C`, `**` or `*^`.
    pub kind: String,
    /// e.g. `COMPLD`, `DENY` or `REPT ALM CRS`.
    pub words: String,
    /// Text found between `/*` and `*/`, joined by spaces.
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Flag(bool),
    Tl1(Tl1Status),
}

impl Status {
    pub fn is_success(&self) -> bool {
        match self {
            Status::Flag(ok) => *ok,
            Status::Tl1(status) => status.words == "COMPLD",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Flag(ok) => write!(f, "{ok}"),
            Status::Tl1(status) => write!(f, "{} {}", status.kind, status.words),
        }
    }
}

/// Category of an autonomous (unsolicited) message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Auto,
    Critical,
    Major,
    Minor,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Auto => "auto",
            Category::Critical => "critical",
            Category::Major => "major",
            Category::Minor => "minor",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded message: result lines or raw payload plus its status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub identifier: Option<String>,
    pub payload: Payload,
    pub status: Status,
}

impl Response {
    pub fn lines(&self) -> &[String] {
        match &self.payload {
            Payload::Lines(lines) => lines,
            Payload::Bytes(_) => &[],
        }
    }

    pub fn into_lines(self) -> Vec<String> {
        match self.payload {
            Payload::Lines(lines) => lines,
            Payload::Bytes(_) => Vec::new(),
        }
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::Bytes(bytes) => Some(bytes),
            Payload::Lines(_) => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Language of a device session.
pub trait Codec: Send + Sync {
    /// Encodes a logical command, assigning the next identifier if the
    /// format supports one.
    fn encode(&self, command: &str) -> Result<Encoded, ProtocolError>;

    /// Decodes one received chunk. Must fail instead of guessing.
    fn decode(&self, chunk: &[u8]) -> Result<Response, ProtocolError>;

    /// Returns the autonomous category of a message, or `None` for ordinary
    /// solicited replies.
    fn classify(
        &self,
        _identifier: Option<&str>,
        _status: &Status,
    ) -> Result<Option<Category>, ProtocolError> {
        Ok(None)
    }

    /// Raises `CommandFailed` for an unsuccessful status.
    fn check_status(&self, status: &Status, command: &str) -> Result<(), ProtocolError> {
        if status.is_success() {
            Ok(())
        } else {
            Err(ProtocolError::CommandFailed {
                command: command.to_string(),
                status: status.to_string(),
                reason: "unexpected status".to_string(),
            })
        }
    }

    /// How the transport must cut the byte stream into chunks.
    fn framing(&self) -> Framing;

    /// Pattern of the device prompt, for text protocols.
    fn prompt_pattern(&self) -> Option<BytesRegex> {
        None
    }

    /// Changes the prompt that ends every response.
    fn set_prompt(&self, _prompt: &str) -> Result<(), ProtocolError> {
        Ok(())
    }

    /// Language-level login command sent after the transport is up.
    fn authorize_command(&self, _credentials: &Credentials) -> Option<String> {
        None
    }

    /// Language-level logout command sent before the transport goes down.
    fn deauthorize_command(&self, _credentials: &Credentials) -> Option<String> {
        None
    }
}
