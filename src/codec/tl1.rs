//! TL1 (Transaction Language 1) message format.
//!
//! Commands look like `VERB-MOD::AID:CTAG::PARAMS;`. The fourth field is the
//! correlation tag, which the codec replaces with a fresh counter value. A
//! response looks like this:
//!
//! ```text
//!    BeautyCees 07-03-13 14:52:28
//! M  123 COMPLD
//!    /* Here is a comment. */
//!    "10.3a.1-10.3a.2:SRCPORT=10.3a.1,DSTPORT=10.3a.2"
//! ;
//! ```
//!
//! Unsolicited messages use `A`, `*C`, `**` or `*^` instead of `M`.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError, RwLock};

use log::{debug, error, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use regex::bytes::Regex as BytesRegex;

use super::{Category, Codec, Encoded, Payload, Response, Status, Tl1Status};
use crate::error::ProtocolError;
use crate::transport::{Credentials, Framing};

/// Every TL1 response ends with this.
pub const TL1_TERMINATOR: &str = "\r\n;";

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| compile(r"^\s+(\w+) (\d\d)-(\d\d)-(\d\d) (\d\d):(\d\d):(\d\d)$"));
static STATUS_RE: Lazy<Regex> = Lazy::new(|| compile(r"^([MA*][*C^]?)\s+(\S+)\s([\w ]+)$"));
static MORE_STATUS_RE: Lazy<Regex> = Lazy::new(|| compile(r"^\s+([\w ]+)$"));
static COMMENT_RE: Lazy<Regex> = Lazy::new(|| compile(r"^\s+/\*(.*)\*/"));
static RESULT_RE: Lazy<Regex> = Lazy::new(|| compile(r#"^\s+"?([^\n]*)[,"]$"#));
static SECTION_PARAM_RE: Lazy<Regex> =
    Lazy::new(|| compile(r#"([a-zA-Z0-9]+)=((?:"|\\")[^"]*(?:"|\\")|[^";:,]+)?"#));
static TERMINATOR_RE: Lazy<BytesRegex> =
    Lazy::new(|| match BytesRegex::new(&regex::escape(TL1_TERMINATOR)) {
        Ok(re) => re,
        Err(err) => panic!("invalid TL1 terminator regex: {err}"),
    });

fn compile(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(re) => re,
        Err(err) => panic!("invalid TL1 regex {pattern:?}: {err}"),
    }
}

/// Codec for TL1 sessions.
///
/// In replay mode the ctag field is blanked instead of numbered, passwords in
/// `ACT-USER`/`CANC-USER` are removed and responses carry no identifier, so
/// that commands match what was recorded in a transcript.
#[derive(Debug)]
pub struct Tl1Codec {
    next_ctag: Mutex<u64>,
    prompt: RwLock<String>,
    delimiter: RwLock<BytesRegex>,
    ignore_case: bool,
    replay: bool,
}

impl Default for Tl1Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl Tl1Codec {
    pub fn new() -> Self {
        Self {
            next_ctag: Mutex::new(1),
            prompt: RwLock::new(String::new()),
            delimiter: RwLock::new(TERMINATOR_RE.clone()),
            ignore_case: true,
            replay: false,
        }
    }

    /// Codec for transcript replay.
    pub fn replay() -> Self {
        Self {
            replay: true,
            ..Self::new()
        }
    }

    /// Keeps the verb as typed instead of upper-casing it.
    pub fn case_sensitive(mut self) -> Self {
        self.ignore_case = false;
        self
    }

    pub fn is_replay(&self) -> bool {
        self.replay
    }

    fn take_ctag(&self) -> u64 {
        let mut next = self.next_ctag.lock().unwrap_or_else(PoisonError::into_inner);
        let ctag = *next;
        *next += 1;
        ctag
    }

    /// Rewrites a command with the given ctag: strips the trailing `;`,
    /// upper-cases the verb and sets the fourth field.
    pub fn canonical(&self, command: &str, ctag: &str) -> Result<String, ProtocolError> {
        let command = command.trim();
        let command = command.strip_suffix(';').unwrap_or(command);
        let mut fields: Vec<String> = command.split(':').map(str::to_string).collect();
        if fields.len() < 4 {
            return Err(ProtocolError::InvalidCommand(format!(
                "Invalid TL1 command {command:?}. The fourth (ctag) parameter MUST be present. E.g.: ACT-USER:::ctag;"
            )));
        }
        if self.ignore_case {
            fields[0] = fields[0].to_uppercase();
        }
        fields[3] = ctag.to_string();
        if self.replay
            && matches!(fields[0].to_uppercase().as_str(), "ACT-USER" | "CANC-USER")
            && let Some(password) = fields.get_mut(5)
        {
            password.clear();
        }
        Ok(format!("{};", fields.join(":")))
    }

    /// Replay lookup key of a recorded or outgoing command.
    pub fn replay_key(&self, command: &str) -> Result<String, ProtocolError> {
        self.canonical(command, "")
    }

    fn prompt(&self) -> String {
        self.prompt
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn delimiter_for(prompt: &str) -> String {
        if prompt.is_empty() {
            TL1_TERMINATOR.to_string()
        } else {
            format!("{TL1_TERMINATOR}\r\n{prompt}")
        }
    }
}

impl Codec for Tl1Codec {
    fn encode(&self, command: &str) -> Result<Encoded, ProtocolError> {
        if self.replay {
            let wire = self.canonical(command, "")?;
            return Ok(Encoded {
                identifier: None,
                wire: format!("{wire}\n").into_bytes(),
            });
        }
        // Validate before consuming a ctag.
        self.canonical(command, "")?;
        let ctag = self.take_ctag().to_string();
        let wire = self.canonical(command, &ctag)?;
        Ok(Encoded {
            identifier: Some(ctag),
            wire: format!("{wire}\n").into_bytes(),
        })
    }

    fn decode(&self, chunk: &[u8]) -> Result<Response, ProtocolError> {
        let text = String::from_utf8_lossy(chunk);

        let mut comments: Vec<String> = Vec::new();
        let mut results: Vec<String> = Vec::new();
        let mut header: Option<(String, String, String)> = None;
        // Result and comment lines only count after a status line of the
        // first ctag.
        let mut skip = true;

        for line in text.split("\r\n") {
            if let Some(caps) = STATUS_RE.captures(line) {
                let ctag = &caps[2];
                let first = header.as_ref().map(|(_, first, _)| first.clone());
                match first {
                    None => {
                        header = Some((caps[1].to_string(), ctag.to_string(), caps[3].to_string()));
                        skip = false;
                    }
                    Some(first) if first == ctag => skip = false,
                    Some(first) => {
                        warn!(
                            "Ignoring TL1 output with ctag {ctag}, since the output of ctag {first} is not finished"
                        );
                        skip = true;
                    }
                }
            } else if let Some(caps) = MORE_STATUS_RE.captures(line) {
                match header.as_mut() {
                    Some((_, _, words)) if !skip => {
                        words.push(' ');
                        words.push_str(&caps[1]);
                    }
                    _ => warn!("Skip TL1 status continuation {:?}", &caps[1]),
                }
            } else if let Some(caps) = RESULT_RE.captures(line) {
                if skip {
                    if header.is_none() {
                        error!(
                            "Haven't received a valid status line yet. Thus skip TL1 result line {:?}",
                            &caps[1]
                        );
                    } else {
                        warn!("Skip TL1 result line {:?}", &caps[1]);
                    }
                } else {
                    results.push(caps[1].to_string());
                }
            } else if let Some(caps) = COMMENT_RE.captures(line) {
                if skip {
                    warn!("Skip TL1 comment line {:?}", &caps[1]);
                } else {
                    comments.push(caps[1].trim().to_string());
                }
            } else if IDENTIFIER_RE.is_match(line)
                || line.is_empty()
                || line.starts_with('>')
                || line.starts_with('<')
            {
                continue;
            } else if line == ";" {
                skip = true;
            } else {
                error!("Skip unknown TL1 line {line:?}");
            }
        }

        let Some((kind, ctag, words)) = header else {
            return Err(ProtocolError::MalformedIo(format!(
                "Could not find valid response header (e.g. 'M  123 COMPLD') in response {text:?}"
            )));
        };
        let status = Tl1Status {
            kind,
            words,
            comment: comments.join(" "),
        };
        debug!(
            "Received {} lines of data, identifier={ctag}, status={status:?}",
            results.len()
        );
        Ok(Response {
            identifier: if self.replay { None } else { Some(ctag) },
            payload: Payload::Lines(results),
            status: Status::Tl1(status),
        })
    }

    fn classify(
        &self,
        identifier: Option<&str>,
        status: &Status,
    ) -> Result<Option<Category>, ProtocolError> {
        let Status::Tl1(status) = status else {
            return Ok(None);
        };
        match status.kind.as_str() {
            "M" => Ok(None),
            kind if kind.starts_with('A') => Ok(Some(Category::Auto)),
            "*C" => Ok(Some(Category::Critical)),
            "**" => Ok(Some(Category::Major)),
            "*^" => Ok(Some(Category::Minor)),
            kind => Err(ProtocolError::MalformedIo(format!(
                "Received an unknown message type '{kind}' (only understand M, A and *) with identifier {identifier:?}"
            ))),
        }
    }

    fn check_status(&self, status: &Status, command: &str) -> Result<(), ProtocolError> {
        match status {
            Status::Tl1(tl1) if tl1.words != "COMPLD" => Err(ProtocolError::CommandFailed {
                command: command.to_string(),
                status: tl1.words.clone(),
                reason: tl1.comment.clone(),
            }),
            Status::Flag(false) => Err(ProtocolError::CommandFailed {
                command: command.to_string(),
                status: "false".to_string(),
                reason: String::new(),
            }),
            _ => Ok(()),
        }
    }

    fn framing(&self) -> Framing {
        Framing::Delimited(
            self.delimiter
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        )
    }

    fn prompt_pattern(&self) -> Option<BytesRegex> {
        let prompt = self.prompt();
        if prompt.is_empty() {
            return None;
        }
        BytesRegex::new(&regex::escape(&prompt)).ok()
    }

    fn set_prompt(&self, prompt: &str) -> Result<(), ProtocolError> {
        let delimiter = Self::delimiter_for(prompt);
        let pattern = BytesRegex::new(&regex::escape(&delimiter))?;
        *self.prompt.write().unwrap_or_else(PoisonError::into_inner) = prompt.to_string();
        *self.delimiter.write().unwrap_or_else(PoisonError::into_inner) = pattern;
        debug!("Set delimiter to {delimiter:?}");
        Ok(())
    }

    fn authorize_command(&self, credentials: &Credentials) -> Option<String> {
        if credentials.username.is_empty() {
            return None;
        }
        Some(format!(
            "act-user::{}:ctag::{};",
            credentials.username,
            credentials.password.as_deref().unwrap_or_default()
        ))
    }

    fn deauthorize_command(&self, credentials: &Credentials) -> Option<String> {
        if credentials.username.is_empty() {
            return None;
        }
        Some(format!("canc-user::{}:ctag;", credentials.username))
    }
}

/// Splits a TL1 section block (`NAME=value,NAME2="quoted, value"`) into a
/// map with lower-cased keys. Surrounding plain or escaped quotes are
/// removed from values.
pub fn parse_section_block(block: &str) -> HashMap<String, String> {
    SECTION_PARAM_RE
        .captures_iter(block)
        .map(|caps| {
            let name = caps[1].to_lowercase();
            let value = caps.get(2).map_or("", |m| m.as_str());
            (name, unquote(value).to_string())
        })
        .collect()
}

fn unquote(value: &str) -> &str {
    let value = value
        .strip_prefix("\\\"")
        .or_else(|| value.strip_prefix('"'))
        .unwrap_or(value);
    value
        .strip_suffix("\\\"")
        .or_else(|| value.strip_suffix('"'))
        .unwrap_or(value)
}
