//! Error types for device sessions, codecs and correlation engines.
//!
//! One enum covers the whole taxonomy: session-fatal network and framing
//! failures, recoverable time-outs, unsuccessful peer statuses and
//! undecodable messages.

use thiserror::Error;

/// Errors that can occur while talking to a device or daemon.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The session could not be established or was lost.
    #[error("network error: {0}")]
    Network(String),

    /// The peer closed the stream, or a dump file ran out of bytes.
    #[error("connection closed: {0}")]
    Closed(String),

    /// A wait exceeded its deadline.
    ///
    /// Never retried internally; the caller decides what to do next.
    #[error("timeout: {0}")]
    TimeOut(String),

    /// Received bytes did not match the expected framing or terminator.
    #[error("malformed i/o: {0}")]
    MalformedIo(String),

    /// The peer answered with a well-formed but unsuccessful status.
    #[error("command '{command}' failed: status={status}, reason: {reason}")]
    CommandFailed {
        command: String,
        status: String,
        reason: String,
    },

    /// A well-framed message could not be interpreted.
    #[error("parsing error: {0}")]
    Parsing(String),

    /// A response arrived for an identifier that already holds a completed
    /// response.
    #[error("duplicate completion for identifier {0}")]
    DuplicateCompletion(String),

    /// The caller passed a command the codec cannot encode.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// The receiver task or a callback worker failed to exit cleanly.
    #[error("worker error: {0}")]
    Worker(String),

    /// No recorded output matches the requested command.
    #[error("replay mismatch: {0}")]
    ReplayMismatch(String),

    /// A prompt or delimiter pattern failed to compile.
    #[error("invalid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// An error occurred in the async-ssh2-tokio library.
    #[error("async ssh2 error: {0}")]
    Ssh2(#[from] async_ssh2_tokio::Error),

    /// An error occurred in the russh library.
    #[error("russh error: {0}")]
    Russh(#[from] russh::Error),
}

impl ProtocolError {
    /// Returns true if the session must be closed and recreated.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::Network(_)
                | ProtocolError::Closed(_)
                | ProtocolError::MalformedIo(_)
                | ProtocolError::DuplicateCompletion(_)
                | ProtocolError::Worker(_)
                | ProtocolError::Io(_)
                | ProtocolError::Ssh2(_)
                | ProtocolError::Russh(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ProtocolError::TimeOut(_))
    }
}
