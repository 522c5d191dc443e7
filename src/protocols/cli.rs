//! CLI sessions: an interactive shell answering commands with a screen of
//! text ended by the prompt.

use std::path::PathBuf;

use crate::codec::CliCodec;
use crate::error::ProtocolError;
use crate::session::SyncSession;
use crate::transport::{
    EchoMode, LoginScript, ProcessLink, ReplayDialect, ReplayTransport, SshLink, SshOptions,
    Terminal,
};

pub use crate::config::{SSH_PORT, TELNET_PORT};

/// Sent before the connection is closed.
pub const QUIT_COMMAND: &str = "quit";

pub type SshCliSession = SyncSession<Terminal<SshLink>, CliCodec>;
pub type ProcessCliSession = SyncSession<Terminal<ProcessLink>, CliCodec>;
pub type CliReplaySession = SyncSession<ReplayTransport, CliCodec>;

/// Shell over a native SSH connection. Authentication happens in the SSH
/// handshake, so login only waits for the prompt.
pub fn ssh_cli(
    host: impl Into<String>,
    port: u16,
    options: SshOptions,
    prompt: &str,
) -> Result<SshCliSession, ProtocolError> {
    let terminal = Terminal::new(SshLink::new(host, port, options))
        .with_echo(EchoMode::Line)
        .with_login(LoginScript::prompt_only())
        .with_quit_command(QUIT_COMMAND);
    Ok(SyncSession::new(terminal, CliCodec::with_prompt(prompt)?))
}

/// Shell through the system `telnet` client, answering its login and
/// password questions.
pub fn telnet_cli(
    host: impl Into<String>,
    port: u16,
    prompt: &str,
) -> Result<ProcessCliSession, ProtocolError> {
    let terminal = Terminal::new(ProcessLink::telnet(host, port))
        .with_echo(EchoMode::Line)
        .with_login(LoginScript::telnet())
        .with_quit_command(QUIT_COMMAND);
    Ok(SyncSession::new(terminal, CliCodec::with_prompt(prompt)?))
}

/// Shell through the system `ssh` client, for hosts only reachable through
/// the local SSH configuration. The host key question is answered `yes`.
pub fn ssh_client_cli(
    host: impl Into<String>,
    port: u16,
    username: &str,
    prompt: &str,
) -> Result<ProcessCliSession, ProtocolError> {
    let host = host.into();
    let args = vec![
        "-tt".to_string(),
        "-p".to_string(),
        port.to_string(),
        "-l".to_string(),
        username.to_string(),
        host.clone(),
    ];
    let terminal = Terminal::new(ProcessLink::new("ssh", args, host))
        .with_echo(EchoMode::Line)
        .with_login(LoginScript::ssh())
        .with_quit_command(QUIT_COMMAND);
    Ok(SyncSession::new(terminal, CliCodec::with_prompt(prompt)?))
}

/// Answers commands from a recorded CLI transcript.
pub fn cli_replay(path: impl Into<PathBuf>, prompt: &str) -> Result<CliReplaySession, ProtocolError> {
    Ok(SyncSession::new(
        ReplayTransport::open(path, ReplayDialect::cli()),
        CliCodec::with_prompt(prompt)?,
    ))
}
