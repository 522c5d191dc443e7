//! Expect-style terminal over a [`Link`].
//!
//! Incoming bytes collect in a buffer; a read returns as soon as the buffer
//! holds a complete message. Bytes that arrived before a time-out stay in
//! the buffer, so a cancelled or timed out read never loses data.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, trace};
use once_cell::sync::Lazy;
use regex::bytes::Regex as BytesRegex;
use tokio::time::Instant;

use super::{Credentials, Direction, Framing, Link, TranscriptLog, Transport};
use crate::config::DEFAULT_TIMEOUT;
use crate::error::ProtocolError;

static LINE_END: Lazy<BytesRegex> = Lazy::new(|| compile("\r\n"));
static LOGIN_PROMPT: Lazy<BytesRegex> = Lazy::new(|| compile("[Ll]ogin:"));
static PASSWORD_PROMPT: Lazy<BytesRegex> = Lazy::new(|| compile("[Pp]assword:"));
static PERMISSION_DENIED: Lazy<BytesRegex> = Lazy::new(|| compile("Permission denied"));
static HOST_KEY_QUESTION: Lazy<BytesRegex> =
    Lazy::new(|| compile("Are you sure you want to continue connecting"));

/// How long `disconnect` waits for the peer to close after the quit command.
const QUIT_GRACE: Duration = Duration::from_secs(1);

fn compile(pattern: &str) -> BytesRegex {
    match BytesRegex::new(pattern) {
        Ok(re) => re,
        Err(err) => panic!("invalid terminal regex {pattern:?}: {err}"),
    }
}

/// Whether the device echoes commands back, and how much of it to expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoMode {
    Off,
    /// The full command comes back with `\n` turned into `\r\n`. A missing
    /// echo is a framing error.
    Line,
    /// Only the first bytes are checked, then the rest of the line is
    /// skipped. A missing echo is logged.
    Prefix(usize),
}

/// What to do when a login pattern shows up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginStep {
    /// Send the username.
    Username,
    /// Accept an unknown host key.
    HostKey,
    /// Send the password.
    Password,
    /// Authentication failed.
    Denied,
}

/// Ordered login alternatives. The device prompt always ends the login.
#[derive(Debug, Clone, Default)]
pub struct LoginScript {
    steps: Vec<(BytesRegex, LoginStep)>,
}

impl LoginScript {
    /// Only waits for the prompt.
    pub fn prompt_only() -> Self {
        Self::default()
    }

    pub fn telnet() -> Self {
        Self::prompt_only()
            .with_step(LOGIN_PROMPT.clone(), LoginStep::Username)
            .with_step(PASSWORD_PROMPT.clone(), LoginStep::Password)
            .with_step(PERMISSION_DENIED.clone(), LoginStep::Denied)
    }

    pub fn ssh() -> Self {
        Self::prompt_only()
            .with_step(HOST_KEY_QUESTION.clone(), LoginStep::HostKey)
            .with_step(PASSWORD_PROMPT.clone(), LoginStep::Password)
            .with_step(PERMISSION_DENIED.clone(), LoginStep::Denied)
    }

    /// Adds an alternative. Earlier alternatives win when two match at the
    /// same position.
    pub fn with_step(mut self, pattern: BytesRegex, step: LoginStep) -> Self {
        self.steps.push((pattern, step));
        self
    }
}

/// Terminal over a byte link: buffering, echo handling, login dialogue.
pub struct Terminal<L: Link> {
    link: L,
    buffer: Vec<u8>,
    echo: EchoMode,
    login: Option<LoginScript>,
    quit_command: Option<String>,
    settle: Option<Duration>,
    echo_timeout: Duration,
    log: TranscriptLog,
}

impl<L: Link> Terminal<L> {
    pub fn new(link: L) -> Self {
        Self {
            link,
            buffer: Vec::new(),
            echo: EchoMode::Off,
            login: None,
            quit_command: None,
            settle: None,
            echo_timeout: DEFAULT_TIMEOUT,
            log: TranscriptLog::default(),
        }
    }

    pub fn with_echo(mut self, echo: EchoMode) -> Self {
        self.echo = echo;
        self
    }

    pub fn with_login(mut self, script: LoginScript) -> Self {
        self.login = Some(script);
        self
    }

    /// Command sent before the link is closed.
    pub fn with_quit_command(mut self, command: impl Into<String>) -> Self {
        self.quit_command = Some(command.into());
        self
    }

    /// Discards whatever the peer sends within `settle` after connecting.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = Some(settle);
        self
    }

    pub fn with_echo_timeout(mut self, timeout: Duration) -> Self {
        self.echo_timeout = timeout;
        self
    }

    pub fn set_echo(&mut self, echo: EchoMode) {
        self.echo = echo;
    }

    pub fn echo(&self) -> EchoMode {
        self.echo
    }

    /// Bytes received but not yet consumed.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    async fn fill(&mut self, deadline: Instant, timeout: Duration) -> Result<(), ProtocolError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let read = if remaining.is_zero() {
            None
        } else {
            tokio::time::timeout(remaining, self.link.read_chunk())
                .await
                .ok()
        };
        match read {
            None => Err(ProtocolError::TimeOut(format!(
                "no complete response from {} in {timeout:?}, got {:?}",
                self.link.target(),
                String::from_utf8_lossy(&self.buffer)
            ))),
            Some(Ok(Some(bytes))) => {
                trace!("{:?}", String::from_utf8_lossy(&bytes));
                self.log.write(Direction::Output, &bytes);
                self.buffer.extend_from_slice(&bytes);
                Ok(())
            }
            Some(Ok(None)) => Err(ProtocolError::Closed(format!(
                "{} closed the connection",
                self.link.target()
            ))),
            Some(Err(err)) => Err(err),
        }
    }

    /// Waits until one of `patterns` matches and returns its index together
    /// with everything up to the end of the match. The earliest match wins;
    /// ties go to the lower index.
    pub async fn read_until(
        &mut self,
        patterns: &[BytesRegex],
        timeout: Duration,
    ) -> Result<(usize, Vec<u8>), ProtocolError> {
        let deadline = Instant::now() + timeout;
        loop {
            let found = patterns
                .iter()
                .enumerate()
                .filter_map(|(index, pattern)| {
                    pattern
                        .find(&self.buffer)
                        .map(|m| (m.start(), index, m.end()))
                })
                .min();
            if let Some((_, index, end)) = found {
                let chunk: Vec<u8> = self.buffer.drain(..end).collect();
                return Ok((index, chunk));
            }
            self.fill(deadline, timeout).await?;
        }
    }

    pub async fn read_exact(
        &mut self,
        len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, ProtocolError> {
        let deadline = Instant::now() + timeout;
        while self.buffer.len() < len {
            self.fill(deadline, timeout).await?;
        }
        Ok(self.buffer.drain(..len).collect())
    }

    /// Reads one frame of a fixed header plus the body length it announces.
    ///
    /// A time-out leaves a partial frame buffered; end of stream inside a
    /// frame is a framing error.
    pub async fn read_prefixed(
        &mut self,
        header: usize,
        length_at: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, ProtocolError> {
        let deadline = Instant::now() + timeout;
        loop {
            let total = Framing::prefixed_len(header, length_at, &self.buffer);
            if let Some(total) = total
                && self.buffer.len() >= total
            {
                return Ok(self.buffer.drain(..total).collect());
            }
            match self.fill(deadline, timeout).await {
                Ok(()) => {}
                Err(ProtocolError::Closed(reason)) if !self.buffer.is_empty() => {
                    let got = self.buffer.len();
                    return Err(ProtocolError::MalformedIo(match total {
                        Some(total) => format!(
                            "expecting body of length {}, got {} bytes: {reason}",
                            total - header,
                            got - header
                        ),
                        None => format!("expecting header of length {header}, got {got} bytes: {reason}"),
                    }));
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn write_logged(&mut self, data: &[u8], logged: &[u8]) -> Result<(), ProtocolError> {
        self.log.write(Direction::Input, logged);
        self.link.write(data).await
    }

    /// Waits until `pattern` matches at or after `from` and returns the byte
    /// range of the match. Nothing is removed from the buffer.
    async fn locate(
        &mut self,
        pattern: &BytesRegex,
        from: usize,
        deadline: Instant,
    ) -> Result<(usize, usize), ProtocolError> {
        loop {
            if let Some(m) = pattern.find_at(&self.buffer, from.min(self.buffer.len())) {
                return Ok((m.start(), m.end()));
            }
            self.fill(deadline, self.echo_timeout).await?;
        }
    }

    /// Removes the echo of `data` from the buffer. Bytes received before the
    /// echo, e.g. a reply to an earlier command, stay buffered.
    async fn consume_echo(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        let deadline = Instant::now() + self.echo_timeout;
        match self.echo {
            EchoMode::Off => Ok(()),
            EchoMode::Line => {
                let expected = String::from_utf8_lossy(data).replace('\n', "\r\n");
                let pattern = BytesRegex::new(&regex::escape(&expected))?;
                match self.locate(&pattern, 0, deadline).await {
                    Ok((start, end)) => {
                        self.buffer.drain(start..end);
                        Ok(())
                    }
                    Err(ProtocolError::TimeOut(_)) => Err(ProtocolError::MalformedIo(format!(
                        "No echo response {expected:?} in data {:?} from {}",
                        String::from_utf8_lossy(&self.buffer),
                        self.link.target()
                    ))),
                    Err(err) => Err(err),
                }
            }
            EchoMode::Prefix(len) => {
                let prefix = String::from_utf8_lossy(&data[..len.min(data.len())]).into_owned();
                let pattern = BytesRegex::new(&regex::escape(&prefix))?;
                let echoed = match self.locate(&pattern, 0, deadline).await {
                    Ok((start, end)) => self
                        .locate(&LINE_END, end, deadline)
                        .await
                        .map(|(_, line_end)| (start, line_end)),
                    Err(err) => Err(err),
                };
                match echoed {
                    Ok((start, end)) => {
                        self.buffer.drain(start..end);
                        Ok(())
                    }
                    Err(ProtocolError::TimeOut(_)) => {
                        error!(
                            "Did not receive echo of command {:?}, but got {:?}.",
                            String::from_utf8_lossy(data),
                            String::from_utf8_lossy(&self.buffer)
                        );
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }

    async fn run_login(
        &mut self,
        script: LoginScript,
        credentials: &Credentials,
        prompt: &BytesRegex,
        timeout: Duration,
    ) -> Result<(), ProtocolError> {
        let target = self.link.target();
        let who = format!("{}@{target}", credentials.username);
        let mut remaining = script.steps;
        let mut first = true;
        let mut password_sent = false;
        loop {
            let mut patterns: Vec<BytesRegex> =
                remaining.iter().map(|(pattern, _)| pattern.clone()).collect();
            patterns.push(prompt.clone());
            let index = match self.read_until(&patterns, timeout).await {
                Ok((index, _)) => index,
                Err(ProtocolError::TimeOut(_)) if first => {
                    return Err(ProtocolError::Network(format!(
                        "Time-out (>{timeout:?}) while connecting to {target}"
                    )));
                }
                Err(ProtocolError::TimeOut(_)) => {
                    return Err(ProtocolError::MalformedIo(format!(
                        "Unexpected time-out (>{timeout:?}) while waiting for prompt from {target}"
                    )));
                }
                Err(err) => return Err(err),
            };
            first = false;
            if index == remaining.len() {
                debug!("{who} login complete");
                return Ok(());
            }
            let (_, step) = remaining.remove(index);
            debug!("{who} login step {step:?}");
            match step {
                LoginStep::Username => {
                    let line = format!("{}\n", credentials.username);
                    self.write_logged(line.as_bytes(), line.as_bytes()).await?;
                }
                LoginStep::HostKey => {
                    self.write_logged(b"yes\n", b"yes\n").await?;
                }
                LoginStep::Password => {
                    let Some(password) = credentials.password.as_deref() else {
                        return Err(ProtocolError::Network(format!(
                            "No password given for {who}. Unable to connect"
                        )));
                    };
                    let line = format!("{password}\n");
                    self.write_logged(line.as_bytes(), b"********\n").await?;
                    password_sent = true;
                }
                LoginStep::Denied => {
                    return Err(ProtocolError::Network(if password_sent {
                        format!("Password failed when connecting to {who}")
                    } else {
                        format!("Permission denied when connecting to {who}")
                    }));
                }
            }
        }
    }
}

#[async_trait]
impl<L: Link> Transport for Terminal<L> {
    fn target(&self) -> String {
        self.link.target()
    }

    async fn connect(&mut self, credentials: &Credentials) -> Result<(), ProtocolError> {
        self.buffer.clear();
        self.link.open(credentials).await?;
        if let Some(settle) = self.settle {
            // Some devices print terminal setup garbage right after connect.
            tokio::time::sleep(settle).await;
            while let Ok(Ok(Some(bytes))) =
                tokio::time::timeout(settle, self.link.read_chunk()).await
            {
                debug!("Discarding {} bytes received after connect", bytes.len());
                self.log.write(Direction::Output, &bytes);
            }
        }
        Ok(())
    }

    async fn login(
        &mut self,
        credentials: &Credentials,
        prompt: Option<&BytesRegex>,
        timeout: Duration,
    ) -> Result<(), ProtocolError> {
        let (Some(script), Some(prompt)) = (self.login.clone(), prompt) else {
            return Ok(());
        };
        self.run_login(script, credentials, prompt, timeout).await
    }

    async fn disconnect(&mut self) -> Result<(), ProtocolError> {
        if !self.link.is_open() {
            return Ok(());
        }
        if let Some(quit) = self.quit_command.clone() {
            let line = format!("{quit}\n");
            match self.write_logged(line.as_bytes(), line.as_bytes()).await {
                Ok(()) => {
                    let deadline = Instant::now() + QUIT_GRACE;
                    while self.fill(deadline, QUIT_GRACE).await.is_ok() {}
                }
                Err(err) => debug!("Failed to send {quit:?} to {}: {err}", self.link.target()),
            }
        }
        self.buffer.clear();
        self.link.close().await
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        debug!("Sending command {:?}", String::from_utf8_lossy(data));
        self.write_logged(data, data).await?;
        self.consume_echo(data).await
    }

    async fn receive(
        &mut self,
        framing: &Framing,
        timeout: Duration,
    ) -> Result<Vec<u8>, ProtocolError> {
        let chunk = match framing {
            Framing::Delimited(pattern) => {
                self.read_until(std::slice::from_ref(pattern), timeout)
                    .await?
                    .1
            }
            Framing::Exact(len) => self.read_exact(*len, timeout).await?,
            Framing::LengthPrefixed { header, length_at } => {
                self.read_prefixed(*header, *length_at, timeout).await?
            }
        };
        debug!("Received {} bytes of data", chunk.len());
        Ok(chunk)
    }

    fn is_connected(&self) -> bool {
        self.link.is_open()
    }

    fn attach_log(&mut self, log: TranscriptLog) {
        self.log = log;
    }
}
