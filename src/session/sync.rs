//! Single in-flight command engine.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use super::{
    AutonomousCallback, Dispatcher, SessionEvent, SessionOptions, SessionRecorder, authorize,
    deauthorize, exchange,
};
use crate::codec::{Category, Codec, Response};
use crate::config;
use crate::error::ProtocolError;
use crate::transport::{Credentials, TranscriptLog, Transport};

/// Sends one command at a time and waits for its reply in the calling task.
///
/// ```rust,no_run
/// use rnetpoll::protocols::tl1;
/// use rnetpoll::session::Credentials;
///
/// # async fn run() -> Result<(), rnetpoll::error::ProtocolError> {
/// let mut session = tl1::sync_tl1("ne1.example.net", tl1::TL1_PORT, false);
/// session.start(Credentials::new("admin", Some("secret"))).await?;
/// let lines = session.command("RTRV-HDR:::ctag;").await?;
/// session.stop().await?;
/// # drop(lines);
/// # Ok(())
/// # }
/// ```
pub struct SyncSession<T: Transport, C: Codec> {
    transport: T,
    codec: C,
    dispatcher: Dispatcher,
    log: TranscriptLog,
    credentials: Credentials,
    timeout: Duration,
}

impl<T: Transport, C: Codec> SyncSession<T, C> {
    pub fn new(mut transport: T, codec: C) -> Self {
        let log = TranscriptLog::default();
        transport.attach_log(log.clone());
        Self {
            transport,
            codec,
            dispatcher: Dispatcher::default(),
            log,
            credentials: Credentials::default(),
            timeout: config::DEFAULT_TIMEOUT,
        }
    }

    /// Only the timeout applies; this engine never spawns callback workers.
    pub fn with_options(mut self, options: &SessionOptions) -> Self {
        self.timeout = options.timeout();
        self
    }

    pub fn target(&self) -> String {
        self.transport.target()
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// For reading unsolicited traffic that follows a reply, e.g. the
    /// update frames after an OSPF database request.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn default_timeout(&self) -> Duration {
        self.timeout
    }

    /// Zero falls back to the built-in default.
    pub fn set_default_timeout(&mut self, timeout: Duration) {
        self.timeout = config::effective_timeout(timeout);
    }

    pub fn set_prompt(&mut self, prompt: &str) -> Result<(), ProtocolError> {
        self.codec.set_prompt(prompt)
    }

    /// Mirrors all traffic to `path`, appending.
    pub fn set_log_file(&mut self, path: impl AsRef<Path>) -> Result<(), ProtocolError> {
        self.log.open(path)
    }

    pub fn set_recorder(&mut self, recorder: SessionRecorder) {
        self.dispatcher.set_recorder(Some(recorder));
    }

    pub fn recorder(&self) -> Option<SessionRecorder> {
        self.dispatcher.recorder()
    }

    /// Installs the handler for one category of autonomous messages, or the
    /// catch-all handler when `category` is `None`.
    pub fn set_autonomous_callback<F>(&mut self, category: Option<Category>, callback: F)
    where
        F: Fn(&Response) + Send + Sync + 'static,
    {
        let callback: AutonomousCallback = Arc::new(callback);
        self.dispatcher.set_handler(category, callback);
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Connects, logs in at the transport level, then at the language level.
    pub async fn start(&mut self, credentials: Credentials) -> Result<(), ProtocolError> {
        let prompt = self.codec.prompt_pattern();
        self.transport.prepare(&self.codec.framing(), prompt.as_ref());
        self.transport.connect(&credentials).await?;
        info!("Connected to {}", self.transport.target());

        let logged_in = async {
            self.transport
                .login(&credentials, prompt.as_ref(), self.timeout)
                .await?;
            authorize(
                &mut self.transport,
                &self.codec,
                &self.dispatcher,
                &credentials,
                self.timeout,
            )
            .await
        }
        .await;
        if let Err(err) = logged_in {
            if let Err(close_err) = self.transport.disconnect().await {
                debug!("Ignoring disconnect failure after login error: {close_err}");
            }
            return Err(err);
        }

        self.credentials = credentials;
        self.dispatcher.record(SessionEvent::ConnectionEstablished {
            target: self.transport.target(),
        });
        Ok(())
    }

    /// Logs out and disconnects. Safe to call on a session that never
    /// started.
    pub async fn stop(&mut self) -> Result<(), ProtocolError> {
        if !self.transport.is_connected() {
            self.log.close();
            return Ok(());
        }
        let logout = deauthorize(
            &mut self.transport,
            &self.codec,
            &self.dispatcher,
            &self.credentials,
            self.timeout,
        )
        .await;
        if let Err(err) = &logout {
            warn!("Logout from {} failed: {err}", self.transport.target());
        }
        let closed = self.transport.disconnect().await;
        self.log.close();
        self.dispatcher.record(SessionEvent::ConnectionClosed {
            reason: "stopped".to_string(),
        });
        info!("Disconnected from {}", self.transport.target());
        closed.and(logout)
    }

    /// Sends `command` and returns the result lines of a successful reply.
    pub async fn command(&mut self, command: &str) -> Result<Vec<String>, ProtocolError> {
        self.command_with_timeout(command, self.timeout).await
    }

    pub async fn command_with_timeout(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<Vec<String>, ProtocolError> {
        let response = self.request_with_timeout(command, timeout).await?;
        self.codec.check_status(&response.status, command)?;
        Ok(response.into_lines())
    }

    /// Like [`command`](Self::command) but returns the reply whatever its
    /// status.
    pub async fn request(&mut self, command: &str) -> Result<Response, ProtocolError> {
        self.request_with_timeout(command, self.timeout).await
    }

    pub async fn request_with_timeout(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<Response, ProtocolError> {
        let timeout = config::effective_timeout(timeout);
        let response = exchange(
            &mut self.transport,
            &self.codec,
            &self.dispatcher,
            command,
            timeout,
        )
        .await?;
        self.dispatcher.record_output(command, &response);
        Ok(response)
    }

    /// Sends `command` and hands the reply to `callback` before returning.
    ///
    /// The reply is passed on whatever its status. Errors go back to the
    /// caller and the callback is not called.
    pub async fn callback_command<F>(&mut self, command: &str, callback: F) -> Result<(), ProtocolError>
    where
        F: FnOnce(Result<Response, ProtocolError>),
    {
        self.callback_command_with_timeout(command, callback, self.timeout)
            .await
    }

    pub async fn callback_command_with_timeout<F>(
        &mut self,
        command: &str,
        callback: F,
        timeout: Duration,
    ) -> Result<(), ProtocolError>
    where
        F: FnOnce(Result<Response, ProtocolError>),
    {
        let response = self.request_with_timeout(command, timeout).await?;
        callback(Ok(response));
        Ok(())
    }
}
