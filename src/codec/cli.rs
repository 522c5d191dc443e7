//! Line-oriented command line interfaces (telnet and SSH shells).
//!
//! CLI commands carry no identifier: a response is whatever the device
//! prints between the echoed command and the next prompt.

use std::sync::{PoisonError, RwLock};

use log::debug;
use regex::Regex;
use regex::bytes::Regex as BytesRegex;

use super::{Codec, Encoded, Payload, Response, Status};
use crate::error::ProtocolError;
use crate::transport::Framing;

/// Line break of a pseudo terminal.
pub const CLI_TERMINATOR: &str = "\r\n";
pub const DEFAULT_CLI_PROMPT: &str = ">";

#[derive(Debug)]
struct PromptState {
    prompt: String,
    prompt_re: BytesRegex,
    delimiter: BytesRegex,
}

impl PromptState {
    fn compile(prompt: &str) -> Result<Self, ProtocolError> {
        Ok(Self {
            prompt: prompt.to_string(),
            prompt_re: BytesRegex::new(prompt)?,
            delimiter: BytesRegex::new(&format!("{}{prompt}", regex::escape(CLI_TERMINATOR)))?,
        })
    }
}

/// Codec for interactive shells. The prompt is a regular expression.
#[derive(Debug)]
pub struct CliCodec {
    state: RwLock<PromptState>,
}

impl CliCodec {
    /// Codec expecting the default `>` prompt.
    pub fn new() -> Result<Self, ProtocolError> {
        Self::with_prompt(DEFAULT_CLI_PROMPT)
    }

    pub fn with_prompt(prompt: &str) -> Result<Self, ProtocolError> {
        Ok(Self {
            state: RwLock::new(PromptState::compile(prompt)?),
        })
    }

    pub fn prompt(&self) -> String {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .prompt
            .clone()
    }

    fn delimiter(&self) -> BytesRegex {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .delimiter
            .clone()
    }
}

impl Codec for CliCodec {
    fn encode(&self, command: &str) -> Result<Encoded, ProtocolError> {
        Ok(Encoded {
            identifier: None,
            wire: format!("{command}\n").into_bytes(),
        })
    }

    fn decode(&self, chunk: &[u8]) -> Result<Response, ProtocolError> {
        // Live terminals hand over the delimiter too; transcripts do not.
        let body = match self.delimiter().find_iter(chunk).last() {
            Some(found) if found.end() == chunk.len() => &chunk[..found.start()],
            _ => chunk,
        };
        let text = String::from_utf8_lossy(body);
        let lines: Vec<String> = text.split(CLI_TERMINATOR).map(str::to_string).collect();
        debug!("Received {} lines of data", lines.len());
        Ok(Response {
            identifier: None,
            payload: Payload::Lines(lines),
            status: Status::Flag(true),
        })
    }

    fn framing(&self) -> Framing {
        Framing::Delimited(self.delimiter())
    }

    fn prompt_pattern(&self) -> Option<BytesRegex> {
        Some(
            self.state
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .prompt_re
                .clone(),
        )
    }

    fn set_prompt(&self, prompt: &str) -> Result<(), ProtocolError> {
        let state = PromptState::compile(prompt)?;
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
        debug!("Set delimiter to {:?}", format!("{CLI_TERMINATOR}{prompt}"));
        Ok(())
    }
}

/// Drops the first `skip_start` and the last `skip_end` lines of a result.
///
/// When `last_skipped` is given, the last dropped leading line must match
/// it; this catches devices that print a different banner than expected.
pub fn trim_lines(
    mut lines: Vec<String>,
    skip_start: usize,
    last_skipped: Option<&Regex>,
    skip_end: usize,
) -> Result<Vec<String>, ProtocolError> {
    if skip_start > 0 {
        if lines.len() < skip_start {
            return Err(ProtocolError::MalformedIo(format!(
                "Can't skip first {skip_start} lines of result {lines:?}. It only contains {} lines.",
                lines.len()
            )));
        }
        if let Some(pattern) = last_skipped {
            let line = &lines[skip_start - 1];
            if !pattern.is_match(line) {
                return Err(ProtocolError::MalformedIo(format!(
                    "Expected '{pattern}' at line {skip_start} of result, but found '{}'.",
                    line.trim()
                )));
            }
        }
        lines.drain(..skip_start);
    }
    if skip_end > 0 {
        if lines.len() < skip_end {
            return Err(ProtocolError::MalformedIo(format!(
                "Can't skip last {skip_end} lines of result {lines:?}. It only contains {} lines.",
                lines.len()
            )));
        }
        lines.truncate(lines.len() - skip_end);
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_strips_the_trailing_delimiter() {
        let codec = CliCodec::with_prompt(r"router\d*#").expect("prompt");
        let response = codec
            .decode(b"Interface eth0\r\n  up\r\nrouter1#")
            .expect("decodes");
        assert_eq!(response.lines(), ["Interface eth0", "  up"]);
        assert!(response.is_success());
        assert_eq!(response.identifier, None);
    }

    #[test]
    fn decode_keeps_transcript_text_as_is() {
        let codec = CliCodec::new().expect("prompt");
        let response = codec.decode(b"line one\r\nline two").expect("decodes");
        assert_eq!(response.lines(), ["line one", "line two"]);
    }

    #[test]
    fn set_prompt_rejects_invalid_patterns() {
        let codec = CliCodec::new().expect("prompt");
        assert!(matches!(
            codec.set_prompt("(unclosed"),
            Err(ProtocolError::InvalidPattern(_))
        ));
        assert_eq!(codec.prompt(), ">");
        codec.set_prompt("switch#").expect("valid prompt");
        let Framing::Delimited(delimiter) = codec.framing() else {
            panic!("CLI is delimited");
        };
        assert!(delimiter.is_match(b"output\r\nswitch#"));
    }

    #[test]
    fn trim_lines_checks_bounds_and_banner() {
        let lines = vec![
            "banner".to_string(),
            "---".to_string(),
            "data".to_string(),
            "footer".to_string(),
        ];
        let banner = Regex::new("^-+$").expect("regex");
        let trimmed = trim_lines(lines.clone(), 2, Some(&banner), 1).expect("trims");
        assert_eq!(trimmed, ["data"]);

        let wrong = Regex::new("^=+$").expect("regex");
        assert!(matches!(
            trim_lines(lines.clone(), 2, Some(&wrong), 0),
            Err(ProtocolError::MalformedIo(_))
        ));
        assert!(matches!(
            trim_lines(lines, 0, None, 5),
            Err(ProtocolError::MalformedIo(_))
        ));
    }
}
